//! S1: UDP echo across four worker threads, 1000 requests each, with the
//! demo handler reversing the byte array at the user parameter id.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use urpc::client::{Client, ClientConfig};
use urpc::databuffer::Direction;
use urpc::server::{ServerBuilder, ServerConfig};

const PARAM: u32 = 0x2000_0001;

static NEXT_PORT: AtomicU16 = AtomicU16::new(21000);

fn unique_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

fn reverse_handler(_session_id: u32, buf: &mut urpc::databuffer::DataBuffer) -> i32 {
    let data = match buf.get(Direction::Input, PARAM) {
        Ok(Some(bytes)) => bytes.to_vec(),
        _ => return 1,
    };
    let mut reversed = data;
    reversed.reverse();
    match buf.set(Direction::Output, PARAM, &reversed) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

#[test]
fn udp_echo_four_threads_round_trip() {
    let port = unique_port();
    let uri = format!("udp://127.0.0.1:{port}/");

    let mut builder = ServerBuilder::new();
    builder.add_proc(0x2000_0002, reverse_handler).unwrap();
    let config = ServerConfig {
        threads_num: 4,
        max_data_size: 1024,
        ..Default::default()
    };
    let server = builder.bind(&uri, config).unwrap();

    let mut handles = Vec::new();
    for t in 0..4 {
        let uri = uri.clone();
        handles.push(std::thread::spawn(move || {
            let client_config = ClientConfig {
                timeout: Duration::from_secs(2),
                max_data_size: 1024,
                ..Default::default()
            };
            let client = Client::connect(&uri, client_config).unwrap();
            let mut handle = client.lock();
            let status = handle.login().unwrap();
            assert!(status.is_ok(), "login failed on thread {t}");

            for i in 0..1000u32 {
                let payload: Vec<u8> = (0..64).map(|b| ((i + b) % 251) as u8).collect();
                handle.buffer_mut().set(Direction::Output, PARAM, &payload).unwrap();
                let status = handle.exec(0x2000_0002).unwrap();
                assert!(status.is_ok(), "request {i} on thread {t} failed: {status:?}");
                let mut expected = payload;
                expected.reverse();
                let got = handle.buffer_mut().get(Direction::Input, PARAM).unwrap().unwrap();
                assert_eq!(got, &expected[..]);
            }
            let status = handle.logout().unwrap();
            assert!(status.is_ok());
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    server.shutdown();
}

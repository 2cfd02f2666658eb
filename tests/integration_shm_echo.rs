//! S6: SHM echo between a server and client sharing one named segment, as
//! two co-located processes would. The handler writes the square of the
//! input f64 into the reply slot.

#![cfg(unix)]

use std::time::Duration;

use urpc::client::{Client, ClientConfig};
use urpc::databuffer::Direction;
use urpc::server::{ServerBuilder, ServerConfig};

const PARAM_IN: u32 = 0x2000_0010;
const PARAM_OUT: u32 = 0x2000_0011;
const SQUARE_PROC: u32 = 0x2000_0003;

fn square_handler(_session_id: u32, buf: &mut urpc::databuffer::DataBuffer) -> i32 {
    let v = match buf.get_f64(Direction::Input, PARAM_IN) {
        Ok(Some(v)) => v,
        _ => return 1,
    };
    match buf.set_f64(Direction::Output, PARAM_OUT, v * v) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

#[test]
fn shm_client_and_server_round_trip_a_square() {
    let name = format!("urpc-test-{}", uuid::Uuid::new_v4());
    let uri = format!("shm://{name}");

    let mut builder = ServerBuilder::new();
    builder.add_proc(SQUARE_PROC, square_handler).unwrap();
    let config = ServerConfig {
        threads_num: 2,
        max_data_size: 4096,
        ..Default::default()
    };
    let server = builder.bind(&uri, config).unwrap();

    let client = Client::connect(
        &uri,
        ClientConfig {
            timeout: Duration::from_secs(2),
            max_data_size: 4096,
            tcp_buffer_size: 4096,
        },
    )
    .unwrap();
    let mut handle = client.lock();

    let status = handle.login().unwrap();
    assert!(status.is_ok());

    handle.buffer_mut().set_f64(Direction::Output, PARAM_IN, 1.23456).unwrap();
    let status = handle.exec(SQUARE_PROC).unwrap();
    assert!(status.is_ok());

    let result = handle.buffer_mut().get_f64(Direction::Input, PARAM_OUT).unwrap().unwrap();
    assert!((result - 1.52413839936).abs() < 1e-9);

    let status = handle.logout().unwrap();
    assert!(status.is_ok());

    drop(handle);
    server.shutdown();
}

//! S2-S4: TCP login/logout lifecycle, session-table capacity, and
//! version-mismatch handling.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use urpc::client::{Client, ClientConfig};
use urpc::databuffer::Direction;
use urpc::error::Status;
use urpc::server::{ServerBuilder, ServerConfig};
use urpc::wire::{Header, HEADER_SIZE, PARAM_PROC, PARAM_STATUS, PROC_USER, VERSION};

static NEXT_PORT: AtomicU16 = AtomicU16::new(22000);

fn unique_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

fn noop_handler(_session_id: u32, _buf: &mut urpc::databuffer::DataBuffer) -> i32 {
    0
}

fn test_config(threads_num: usize, max_clients: usize) -> ServerConfig {
    ServerConfig {
        threads_num,
        max_clients,
        timeout: Duration::from_millis(500),
        max_data_size: 4096,
        tcp_buffer_size: 4096,
        clean: true,
        pin_threads: false,
    }
}

#[test]
fn tcp_login_call_logout_closes_socket() {
    let port = unique_port();
    let uri = format!("tcp://127.0.0.1:{port}/");

    let mut builder = ServerBuilder::new();
    builder.add_proc(PROC_USER, noop_handler).unwrap();
    let server = builder.bind(&uri, test_config(2, 8)).unwrap();

    let client = Client::connect(&uri, ClientConfig {
        timeout: Duration::from_secs(2),
        max_data_size: 4096,
        tcp_buffer_size: 4096,
    })
    .unwrap();
    let mut handle = client.lock();

    let status = handle.login().unwrap();
    assert!(status.is_ok());

    let status = handle.exec(PROC_USER).unwrap();
    assert!(status.is_ok());

    let status = handle.logout().unwrap();
    assert!(status.is_ok());

    // The socket the server held is now closed; a further exec must fail at
    // the transport level rather than getting a reply.
    let status = handle.exec(PROC_USER).unwrap();
    assert_eq!(status, Status::TransportError);

    server.shutdown();
}

#[test]
fn tcp_session_capacity_rejects_third_login() {
    let port = unique_port();
    let uri = format!("tcp://127.0.0.1:{port}/");

    let mut builder = ServerBuilder::new();
    builder.add_proc(PROC_USER, noop_handler).unwrap();
    let server = builder.bind(&uri, test_config(3, 2)).unwrap();

    let cfg = ClientConfig {
        timeout: Duration::from_secs(2),
        max_data_size: 4096,
        tcp_buffer_size: 4096,
    };
    let client_a = Client::connect(&uri, cfg.clone()).unwrap();
    let client_b = Client::connect(&uri, cfg.clone()).unwrap();
    let client_c = Client::connect(&uri, cfg).unwrap();

    assert!(client_a.lock().login().unwrap().is_ok());
    assert!(client_b.lock().login().unwrap().is_ok());
    let status = client_c.lock().login().unwrap();
    assert_eq!(status, Status::TooManyConnections);

    server.shutdown();
}

/// Raw version-mismatch packet, bypassing the client facade so a bad
/// version can actually be put on the wire.
#[test]
fn tcp_version_mismatch_disconnects() {
    let port = unique_port();
    let uri = format!("tcp://127.0.0.1:{port}/");

    let mut builder = ServerBuilder::new();
    builder.add_proc(PROC_USER, noop_handler).unwrap();
    let server = builder.bind(&uri, test_config(1, 4)).unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    // Same magic, wrong MAJOR version, otherwise a well-formed empty-body
    // LOGIN-shaped request.
    let bad_version = (VERSION & 0x0000_FFFF) | 0x0099_0000;
    let mut body = Vec::new();
    let proc_rec_size: u32 = 4;
    body.extend_from_slice(&PARAM_PROC.to_be_bytes());
    body.extend_from_slice(&proc_rec_size.to_be_bytes());
    body.extend_from_slice(&0u32.to_be_bytes()); // next = 0 (terminal)
    body.extend_from_slice(&urpc::wire::PROC_LOGIN.to_be_bytes());

    let size = (HEADER_SIZE + body.len()) as u32;
    let mut header = Header::new(0, size);
    header.version = bad_version;
    let mut packet = vec![0u8; HEADER_SIZE];
    header.encode(&mut packet);
    packet.extend_from_slice(&body);

    stream.write_all(&packet).unwrap();

    let mut reply_header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut reply_header).unwrap();
    let decoded = Header::decode(&reply_header).unwrap();
    assert_eq!(decoded.version_major(), VERSION & 0xFFFF_0000);

    let reply_size = decoded.size as usize;
    let mut reply_body = vec![0u8; reply_size - HEADER_SIZE];
    stream.read_exact(&mut reply_body).unwrap();
    let status_rec_id = u32::from_be_bytes(reply_body[0..4].try_into().unwrap());
    assert_eq!(status_rec_id, PARAM_STATUS);
    let status_value = u32::from_be_bytes(reply_body[12..16].try_into().unwrap());
    assert_eq!(Status::from_u32(status_value), Some(Status::VersionMismatch));

    // Server disconnected the socket after replying; a further read hits EOF.
    let mut probe = [0u8; 1];
    let n = stream.read(&mut probe).unwrap();
    assert_eq!(n, 0, "expected server to have closed the socket");

    server.shutdown();
}

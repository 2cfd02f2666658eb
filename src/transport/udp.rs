//! UDP transport (§4.4): one socket, per-worker buffer and client-address
//! slot, weak size+magic reply matching on the client side.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use parking_lot::Mutex;

use crate::databuffer::DataBuffer;
use crate::wire::{Header, HEADER_SIZE, UDP_MAX_PAYLOAD};

use super::ExchangeOutcome;

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

pub struct UdpServerTransport {
    socket: UdpSocket,
    buffers: Vec<Mutex<DataBuffer>>,
    peers: Vec<Mutex<Option<SocketAddr>>>,
}

impl UdpServerTransport {
    pub fn bind(addr: SocketAddr, threads_num: usize, max_data_size: usize, clean: bool) -> Result<Self> {
        if max_data_size > UDP_MAX_PAYLOAD {
            bail!("udp transport payload capped at {UDP_MAX_PAYLOAD} bytes, got {max_data_size}");
        }
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(Duration::from_millis(500)))?;
        let buffers = (0..threads_num)
            .map(|_| Mutex::new(DataBuffer::new(HEADER_SIZE + max_data_size, clean)))
            .collect();
        let peers = (0..threads_num).map(|_| Mutex::new(None)).collect();
        Ok(UdpServerTransport {
            socket,
            buffers,
            peers,
        })
    }

    pub fn threads_num(&self) -> usize {
        self.buffers.len()
    }

    pub fn recv(&self, thread_id: usize) -> Result<bool> {
        let mut scratch = vec![0u8; HEADER_SIZE + UDP_MAX_PAYLOAD];
        match self.socket.recv_from(&mut scratch) {
            Ok((n, addr)) => {
                if n < HEADER_SIZE {
                    return Ok(false);
                }
                let header = match Header::decode(&scratch[0..HEADER_SIZE]) {
                    Ok(h) => h,
                    Err(_) => return Ok(false),
                };
                if header.size as usize != n {
                    return Ok(false);
                }
                *self.peers[thread_id].lock() = Some(addr);
                let mut buf = self.buffers[thread_id].lock();
                buf.input_mut().header_slice_mut().copy_from_slice(&scratch[0..HEADER_SIZE]);
                buf.input_mut().set_data(&scratch[HEADER_SIZE..n])?;
                Ok(true)
            }
            Err(e) if is_timeout(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn send(&self, thread_id: usize) -> Result<()> {
        let addr = self.peers[thread_id]
            .lock()
            .ok_or_else(|| anyhow::anyhow!("no peer recorded for worker {thread_id}"))?;
        let buf = self.buffers[thread_id].lock();
        self.socket.send_to(buf.output().packet(), addr)?;
        Ok(())
    }

    pub fn with_buffer<R>(&self, thread_id: usize, f: impl FnOnce(&mut DataBuffer) -> R) -> R {
        f(&mut self.buffers[thread_id].lock())
    }

    pub fn shutdown(&self) {}
}

pub struct UdpClientTransport {
    socket: UdpSocket,
}

impl UdpClientTransport {
    pub fn connect(server_addr: SocketAddr, max_data_size: usize) -> Result<Self> {
        if max_data_size > UDP_MAX_PAYLOAD {
            bail!("udp transport payload capped at {UDP_MAX_PAYLOAD} bytes, got {max_data_size}");
        }
        let local = if server_addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(server_addr)?;
        Ok(UdpClientTransport { socket })
    }

    pub fn exchange(&mut self, buffer: &mut DataBuffer, timeout: Duration) -> Result<ExchangeOutcome> {
        self.socket.send(buffer.output().packet())?;

        let deadline = Instant::now() + timeout;
        let mut scratch = vec![0u8; HEADER_SIZE + UDP_MAX_PAYLOAD];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(ExchangeOutcome::Timeout);
            }
            let step = remaining.min(Duration::from_millis(100));
            self.socket.set_read_timeout(Some(step))?;
            match self.socket.recv(&mut scratch) {
                Ok(n) => {
                    if n < HEADER_SIZE {
                        continue;
                    }
                    let header = match Header::decode(&scratch[0..HEADER_SIZE]) {
                        Ok(h) => h,
                        Err(_) => continue,
                    };
                    if header.size as usize != n {
                        continue; // weak reply match failed; keep waiting
                    }
                    buffer.input_mut().header_slice_mut().copy_from_slice(&scratch[0..HEADER_SIZE]);
                    buffer.input_mut().set_data(&scratch[HEADER_SIZE..n])?;
                    return Ok(ExchangeOutcome::Delivered);
                }
                Err(e) if is_timeout(&e) => continue,
                Err(_) => return Ok(ExchangeOutcome::TransportError),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::databuffer::Direction;
    use crate::wire::Header as WireHeader;

    #[test]
    fn client_rejects_payload_over_udp_cap() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let err = UdpClientTransport::connect(addr, UDP_MAX_PAYLOAD + 1).unwrap_err();
        assert!(err.to_string().contains("capped"));
    }

    #[test]
    fn server_echoes_one_datagram() {
        let server = UdpServerTransport::bind("127.0.0.1:0".parse().unwrap(), 1, 4096, true).unwrap();
        let server_addr = server.socket.local_addr().unwrap();
        let mut client = UdpClientTransport::connect(server_addr, 4096).unwrap();

        let mut out = DataBuffer::new(HEADER_SIZE + 4096, true);
        out.set(Direction::Output, 0x2000_0001, b"ping").unwrap();
        let size = out.output().packet().len() as u32;
        WireHeader::new(0, size).encode(out.output_mut().header_slice_mut());

        let t = std::thread::spawn(move || {
            loop {
                if server.recv(0).unwrap() {
                    server.with_buffer(0, |buf| {
                        let body = buf.input().packet()[HEADER_SIZE..].to_vec();
                        buf.output_mut().set_data(&body).unwrap();
                        let size = buf.output().packet().len() as u32;
                        let session = buf.input().read_header().unwrap().session;
                        WireHeader::new(session, size).encode(buf.output_mut().header_slice_mut());
                    });
                    server.send(0).unwrap();
                    break;
                }
            }
        });

        let outcome = client.exchange(&mut out, Duration::from_secs(2)).unwrap();
        t.join().unwrap();
        assert_eq!(outcome, ExchangeOutcome::Delivered);
        assert_eq!(out.get(Direction::Input, 0x2000_0001).unwrap(), Some(&b"ping"[..]));
    }
}

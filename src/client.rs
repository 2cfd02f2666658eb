//! Client facade (§4.2): resolves a URI to a transport, serialises
//! `lock()/exec()/unlock()` behind one mutex, and validates every reply.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::{Mutex, MutexGuard};

use crate::databuffer::{DataBuffer, Direction};
use crate::error::Status;
use crate::resolver::{self, Endpoint, Scheme};
use crate::transport::shm::ShmClientTransport;
use crate::transport::tcp::TcpClientTransport;
use crate::transport::udp::UdpClientTransport;
use crate::transport::{ClientTransport, ExchangeOutcome};
use crate::wire::{
    Header, HEADER_SIZE, PARAM_PROC, PARAM_STATUS, PROC_GET_CAP, PROC_LOGIN, PROC_LOGOUT, VERSION,
    VERSION_MAJOR_MASK,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub max_data_size: usize,
    pub tcp_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            timeout: Duration::from_secs(5),
            max_data_size: 65_000,
            tcp_buffer_size: 65_000,
        }
    }
}

struct Inner {
    transport: ClientTransport,
    buffer: DataBuffer,
    session: u32,
    is_stream: bool,
}

/// One logical channel. `create` + `connect` correspond to §3's client
/// lifecycle; `lock`/`exec`/`unlock` is the only way to drive a request.
pub struct Client {
    inner: Mutex<Inner>,
    config: ClientConfig,
}

impl Client {
    pub fn connect(uri: &str, config: ClientConfig) -> Result<Self> {
        let resolved = resolver::resolve(uri, false)?;
        let capacity = HEADER_SIZE + config.max_data_size;
        let (transport, is_stream) = match resolved.scheme {
            Scheme::Udp => {
                let addr = socket_addr(&resolved)?;
                (
                    ClientTransport::Udp(UdpClientTransport::connect(addr, config.max_data_size)?),
                    false,
                )
            }
            Scheme::Tcp => {
                let addr = socket_addr(&resolved)?;
                (
                    ClientTransport::Tcp(TcpClientTransport::connect(addr, config.tcp_buffer_size)?),
                    true,
                )
            }
            Scheme::Shm => {
                let name = match &resolved.endpoint {
                    Endpoint::Shm(n) => n.clone(),
                    _ => unreachable!("shm scheme always resolves to an Endpoint::Shm"),
                };
                (ClientTransport::Shm(ShmClientTransport::connect(&name)?), false)
            }
        };

        Ok(Client {
            inner: Mutex::new(Inner {
                transport,
                buffer: DataBuffer::new(capacity, true),
                session: 0,
                is_stream,
            }),
            config,
        })
    }

    /// Acquires the channel's mutex, exposing a guard through which the
    /// caller populates output parameters before calling `exec`.
    pub fn lock(&self) -> ClientHandle<'_> {
        ClientHandle {
            inner: self.inner.lock(),
            config: &self.config,
        }
    }

    pub fn session(&self) -> u32 {
        self.inner.lock().session
    }
}

fn socket_addr(resolved: &resolver::ResolvedUri) -> Result<SocketAddr> {
    match &resolved.endpoint {
        Endpoint::Socket(addr) => Ok(*addr),
        Endpoint::Shm(_) => bail!("shm endpoint used where a socket address was expected"),
    }
}

/// Held between `lock()` and drop (which releases the mutex, playing the
/// role of `unlock()`).
pub struct ClientHandle<'a> {
    inner: MutexGuard<'a, Inner>,
    config: &'a ClientConfig,
}

impl ClientHandle<'_> {
    pub fn buffer_mut(&mut self) -> &mut DataBuffer {
        &mut self.inner.buffer
    }

    /// Convenience for LOGIN: sends the reserved login procedure and, on
    /// success, remembers the assigned session id for subsequent calls.
    pub fn login(&mut self) -> Result<Status> {
        self.exec(PROC_LOGIN)
    }

    pub fn logout(&mut self) -> Result<Status> {
        self.exec(PROC_LOGOUT)
    }

    pub fn get_cap(&mut self) -> Result<Status> {
        self.exec(PROC_GET_CAP)
    }

    /// Writes the header and PROC parameter, hands the buffer to the
    /// transport, and validates the reply (version MAJOR, session echo,
    /// record-chain integrity).
    pub fn exec(&mut self, proc_id: u32) -> Result<Status> {
        let inner = &mut *self.inner;
        inner.buffer.set_u32(Direction::Output, PARAM_PROC, proc_id)?;
        let size = (HEADER_SIZE + inner.buffer.output().data_size()) as u32;
        Header::new(inner.session, size).encode(inner.buffer.output_mut().header_slice_mut());

        let outcome = inner.transport.exchange(&mut inner.buffer, self.config.timeout)?;

        let status = match outcome {
            ExchangeOutcome::Timeout => {
                if inner.is_stream {
                    Status::TransportError
                } else {
                    Status::Timeout
                }
            }
            ExchangeOutcome::TransportError => Status::TransportError,
            ExchangeOutcome::Delivered => self.validate_reply(proc_id),
        };

        if status.is_ok() && proc_id == PROC_LOGIN {
            let inner = &mut *self.inner;
            if let Ok(header) = inner.buffer.input().read_header() {
                inner.session = header.session;
            }
        }
        if proc_id == PROC_LOGOUT {
            self.inner.session = 0;
        }

        Ok(status)
    }

    fn validate_reply(&mut self, _proc_id: u32) -> Status {
        let inner = &mut *self.inner;
        let header = match inner.buffer.input().read_header() {
            Ok(h) => h,
            Err(_) => return Status::TransportError,
        };
        if header.version_major() != (VERSION & VERSION_MAJOR_MASK) {
            return Status::VersionMismatch;
        }
        if inner.session != 0 && header.session != inner.session {
            return Status::TransportError;
        }
        if inner.buffer.input().validate().is_err() {
            return Status::TransportError;
        }
        match inner.buffer.get_u32(Direction::Input, PARAM_STATUS) {
            Ok(Some(raw)) => Status::from_u32(raw).unwrap_or(Status::Fail),
            _ => Status::Fail,
        }
    }
}

impl Drop for ClientHandle<'_> {
    fn drop(&mut self) {
        self.inner.buffer.clear();
    }
}

//! Transport layer (§4.4–§4.6): one socket/segment discipline per scheme,
//! each owning its own per-worker [`DataBuffer`]s.
//!
//! Dispatch is a closed enum rather than a trait object — there are
//! exactly three schemes (§6), and the server/client engines switch on
//! scheme the same way the original runtime's `uRpcType` does.

pub mod shm;
pub mod tcp;
pub mod udp;

use std::time::Duration;

use anyhow::Result;

use crate::databuffer::DataBuffer;
use crate::error::Status;

/// Outcome of a client-side `exchange()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Delivered,
    Timeout,
    TransportError,
}

/// Server-side transport: owns `threads_num` per-worker buffers and
/// exposes the blocking recv/send discipline described per-scheme in §4.4–
/// §4.6.
pub enum ServerTransport {
    Udp(udp::UdpServerTransport),
    Tcp(tcp::TcpServerTransport),
    Shm(shm::ShmServerTransport),
}

impl ServerTransport {
    pub fn threads_num(&self) -> usize {
        match self {
            ServerTransport::Udp(t) => t.threads_num(),
            ServerTransport::Tcp(t) => t.threads_num(),
            ServerTransport::Shm(t) => t.threads_num(),
        }
    }

    /// Blocks up to ~500ms. `Ok(true)` means a request landed in
    /// `thread_id`'s input buffer; `Ok(false)` means "no request this
    /// tick, recheck shutdown".
    pub fn recv(&self, thread_id: usize) -> Result<bool> {
        match self {
            ServerTransport::Udp(t) => t.recv(thread_id),
            ServerTransport::Tcp(t) => t.recv(thread_id),
            ServerTransport::Shm(t) => t.recv(thread_id),
        }
    }

    pub fn send(&self, thread_id: usize) -> Result<()> {
        match self {
            ServerTransport::Udp(t) => t.send(thread_id),
            ServerTransport::Tcp(t) => t.send(thread_id),
            ServerTransport::Shm(t) => t.send(thread_id),
        }
    }

    pub fn with_buffer<R>(&self, thread_id: usize, f: impl FnOnce(&mut DataBuffer) -> R) -> R {
        match self {
            ServerTransport::Udp(t) => t.with_buffer(thread_id, f),
            ServerTransport::Tcp(t) => t.with_buffer(thread_id, f),
            ServerTransport::Shm(t) => t.with_buffer(thread_id, f),
        }
    }

    /// TCP-only hook: close the client socket this worker is servicing.
    /// A no-op for UDP and SHM, which have no persistent per-client
    /// connection to tear down.
    pub fn disconnect(&self, thread_id: usize) {
        if let ServerTransport::Tcp(t) = self {
            t.disconnect(thread_id);
        }
    }

    /// TCP-only hook: release this worker's claim on its current socket
    /// without closing it, so any worker may pick it up on the next
    /// `recv` round. A no-op for UDP and SHM, where a "worker" has no
    /// claimed peer to give back.
    pub fn release(&self, thread_id: usize) {
        if let ServerTransport::Tcp(t) = self {
            t.release(thread_id);
        }
    }

    /// TCP-only hook: the slot index backing the socket this worker
    /// currently holds, for session-table bookkeeping. `None` for UDP and
    /// SHM, which have no per-client socket slot.
    pub fn current_slot(&self, thread_id: usize) -> Option<usize> {
        match self {
            ServerTransport::Tcp(t) => t.current_slot(thread_id),
            _ => None,
        }
    }

    pub fn shutdown(&self) {
        match self {
            ServerTransport::Udp(t) => t.shutdown(),
            ServerTransport::Tcp(t) => t.shutdown(),
            ServerTransport::Shm(t) => t.shutdown(),
        }
    }
}

/// Client-side transport: a single logical channel used between
/// `lock()`/`unlock()` pairs.
pub enum ClientTransport {
    Udp(udp::UdpClientTransport),
    Tcp(tcp::TcpClientTransport),
    Shm(shm::ShmClientTransport),
}

impl ClientTransport {
    /// Sends `buffer.output.packet()` and blocks for up to `timeout`
    /// waiting for a reply into `buffer.input`.
    pub fn exchange(&mut self, buffer: &mut DataBuffer, timeout: Duration) -> Result<ExchangeOutcome> {
        match self {
            ClientTransport::Udp(t) => t.exchange(buffer, timeout),
            ClientTransport::Tcp(t) => t.exchange(buffer, timeout),
            ClientTransport::Shm(t) => t.exchange(buffer, timeout),
        }
    }
}

pub(crate) fn status_for_timeout(is_stream: bool) -> Status {
    if is_stream {
        Status::TransportError
    } else {
        Status::Timeout
    }
}

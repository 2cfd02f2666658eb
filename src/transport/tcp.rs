//! TCP transport (§4.5): listener + connector thread + a bounded pool of
//! accepted sockets, worker slots claiming a socket under a read-write
//! lock, length-delimited framing with per-chunk timeouts that reset on
//! progress.
//!
//! Readiness waits are expressed with `std::net` read/write timeouts
//! rather than a hand-rolled `select`/`fd_set` over raw descriptors — the
//! resulting claim-then-read discipline is the same one §4.5 describes,
//! arrived at through the idiomatic-Rust primitive for "wait up to N ms
//! for this socket".

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Socket, Type};

use crate::databuffer::DataBuffer;
use crate::session::SessionTable;
use crate::wire::HEADER_SIZE;

use super::ExchangeOutcome;

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// True if `stream` has bytes waiting (or is at EOF) right now. Used to
/// keep `claim_slot` from handing a genuinely idle client to a worker,
/// which would otherwise block that worker for the full recv timeout.
fn has_pending_data(stream: &TcpStream) -> bool {
    if stream.set_read_timeout(Some(Duration::from_millis(1))).is_err() {
        return true;
    }
    let mut probe = [0u8; 1];
    match stream.peek(&mut probe) {
        Ok(_) => true,
        Err(e) if is_timeout(&e) => false,
        Err(_) => true,
    }
}

fn tune_and_split(stream: TcpStream, buffer_size: usize) -> std::io::Result<TcpStream> {
    let sock = Socket::from(stream);
    sock.set_tcp_nodelay(true)?;
    let _ = sock.set_recv_buffer_size(buffer_size);
    let _ = sock.set_send_buffer_size(buffer_size);
    Ok(sock.into())
}

/// Reads exactly `buf.len()` bytes, resetting the idle deadline on every
/// chunk of progress. `Ok(true)` on success, `Ok(false)` if the cumulative
/// idle time exceeded `overall_timeout`, `Err` on peer close or I/O error.
fn read_exact_with_timeout(
    stream: &mut TcpStream,
    buf: &mut [u8],
    overall_timeout: Duration,
) -> std::io::Result<bool> {
    let mut read = 0usize;
    let mut deadline = Instant::now() + overall_timeout;
    while read < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        stream.set_read_timeout(Some(remaining.min(Duration::from_millis(100))))?;
        match stream.read(&mut buf[read..]) {
            Ok(0) => {
                return Err(std::io::Error::new(ErrorKind::UnexpectedEof, "peer closed"));
            }
            Ok(n) => {
                read += n;
                deadline = Instant::now() + overall_timeout;
            }
            Err(e) if is_timeout(&e) => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn write_all_with_timeout(
    stream: &mut TcpStream,
    buf: &[u8],
    overall_timeout: Duration,
) -> std::io::Result<bool> {
    let mut written = 0usize;
    let mut deadline = Instant::now() + overall_timeout;
    while written < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        stream.set_write_timeout(Some(remaining.min(Duration::from_millis(100))))?;
        match stream.write(&buf[written..]) {
            Ok(0) => {
                return Err(std::io::Error::new(ErrorKind::UnexpectedEof, "peer closed"));
            }
            Ok(n) => {
                written += n;
                deadline = Instant::now() + overall_timeout;
            }
            Err(e) if is_timeout(&e) => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

struct ClientSlot {
    stream: Option<TcpStream>,
    assigned: Option<usize>,
}

struct TcpShared {
    slots: RwLock<Vec<ClientSlot>>,
    cur_clients: AtomicUsize,
    max_clients: usize,
    buffer_size: usize,
    shutdown: AtomicBool,
}

pub struct TcpServerTransport {
    shared: Arc<TcpShared>,
    buffers: Vec<Mutex<DataBuffer>>,
    timeout: Duration,
    connector: Mutex<Option<std::thread::JoinHandle<()>>>,
    local_addr: SocketAddr,
    sessions: Arc<SessionTable>,
}

impl TcpServerTransport {
    pub fn bind(
        addr: SocketAddr,
        threads_num: usize,
        max_clients: usize,
        max_data_size: usize,
        buffer_size: usize,
        timeout: Duration,
        clean: bool,
        sessions: Arc<SessionTable>,
    ) -> Result<Self> {
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let sock = Socket::new(domain, Type::STREAM, None)?;
        sock.set_reuse_address(true)?;
        sock.bind(&addr.into())?;
        sock.listen(128)?;
        let listener: TcpListener = sock.into();
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(TcpShared {
            slots: RwLock::new((0..max_clients).map(|_| ClientSlot { stream: None, assigned: None }).collect()),
            cur_clients: AtomicUsize::new(0),
            max_clients,
            buffer_size,
            shutdown: AtomicBool::new(false),
        });

        let connector_shared = shared.clone();
        let connector = std::thread::spawn(move || connector_loop(listener, connector_shared));

        let buffers = (0..threads_num)
            .map(|_| Mutex::new(DataBuffer::new(HEADER_SIZE + max_data_size, clean)))
            .collect();

        Ok(TcpServerTransport {
            shared,
            buffers,
            timeout,
            connector: Mutex::new(Some(connector)),
            local_addr,
            sessions,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn threads_num(&self) -> usize {
        self.buffers.len()
    }

    /// Claims the first connected, unassigned socket that actually has
    /// data waiting, bounded to ~500ms of polling. A connected-but-idle
    /// socket is left unclaimed so it doesn't tie up a worker for the
    /// full recv timeout; it's retried next tick. `Ok(false)` means
    /// nothing to do this tick.
    fn claim_slot(&self, thread_id: usize) -> Option<usize> {
        let outer_deadline = Instant::now() + Duration::from_millis(500);
        loop {
            {
                let mut slots = self.shared.slots.write();
                if let Some((idx, slot)) = slots.iter_mut().enumerate().find(|(_, s)| {
                    s.assigned.is_none()
                        && s.stream.as_ref().map(has_pending_data).unwrap_or(false)
                }) {
                    slot.assigned = Some(thread_id);
                    return Some(idx);
                }
            }
            if Instant::now() >= outer_deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Clones the fd for `idx` so blocking I/O never holds the shared
    /// read-write lock — only the claim/disconnect bookkeeping does.
    fn clone_stream(&self, idx: usize) -> Option<TcpStream> {
        let slots = self.shared.slots.read();
        slots[idx].stream.as_ref().and_then(|s| s.try_clone().ok())
    }

    pub fn recv(&self, thread_id: usize) -> Result<bool> {
        let idx = match self.claim_slot(thread_id) {
            Some(idx) => idx,
            None => return Ok(false),
        };
        let mut stream = match self.clone_stream(idx) {
            Some(s) => s,
            None => {
                self.disconnect_slot(idx);
                return Ok(false);
            }
        };

        let mut header_bytes = [0u8; HEADER_SIZE];
        let ok = matches!(
            read_exact_with_timeout(&mut stream, &mut header_bytes, self.timeout),
            Ok(true)
        );
        if !ok {
            self.disconnect_slot(idx);
            return Ok(false);
        }

        let size = u32::from_be_bytes(header_bytes[12..16].try_into().unwrap()) as usize;
        let capacity = self.buffers[thread_id].lock().input().capacity();
        if size < HEADER_SIZE || size - HEADER_SIZE > capacity {
            self.disconnect_slot(idx);
            return Ok(false);
        }
        let body_len = size - HEADER_SIZE;

        let mut body = vec![0u8; body_len];
        let body_ok = matches!(
            read_exact_with_timeout(&mut stream, &mut body, self.timeout),
            Ok(true)
        );
        if !body_ok {
            self.disconnect_slot(idx);
            return Ok(false);
        }

        let mut buf = self.buffers[thread_id].lock();
        buf.input_mut().header_slice_mut().copy_from_slice(&header_bytes);
        if buf.input_mut().set_data(&body).is_err() {
            drop(buf);
            self.disconnect_slot(idx);
            return Ok(false);
        }
        Ok(true)
    }

    pub fn send(&self, thread_id: usize) -> Result<()> {
        let idx = {
            let slots = self.shared.slots.read();
            slots.iter().position(|s| s.assigned == Some(thread_id))
        };
        let idx = match idx {
            Some(idx) => idx,
            None => return Ok(()),
        };
        let mut stream = match self.clone_stream(idx) {
            Some(s) => s,
            None => {
                self.disconnect_slot(idx);
                return Ok(());
            }
        };
        let packet = self.buffers[thread_id].lock().output().packet().to_vec();
        let ok = matches!(write_all_with_timeout(&mut stream, &packet, self.timeout), Ok(true));
        if !ok {
            self.disconnect_slot(idx);
        }
        Ok(())
    }

    pub fn with_buffer<R>(&self, thread_id: usize, f: impl FnOnce(&mut DataBuffer) -> R) -> R {
        f(&mut self.buffers[thread_id].lock())
    }

    /// Releases this worker's claim without closing the socket, so the
    /// next select round may hand it to any worker.
    pub fn release(&self, thread_id: usize) {
        let mut slots = self.shared.slots.write();
        if let Some(slot) = slots.iter_mut().find(|s| s.assigned == Some(thread_id)) {
            slot.assigned = None;
        }
    }

    pub fn disconnect(&self, thread_id: usize) {
        let idx = {
            let slots = self.shared.slots.read();
            slots.iter().position(|s| s.assigned == Some(thread_id))
        };
        if let Some(idx) = idx {
            self.disconnect_slot(idx);
        }
    }

    /// The slot index backing the socket `thread_id` currently holds, if
    /// any. Used at LOGIN time to tag the new session with the socket it
    /// arrived on, so a later disconnect can evict it.
    pub fn current_slot(&self, thread_id: usize) -> Option<usize> {
        let slots = self.shared.slots.read();
        slots.iter().position(|s| s.assigned == Some(thread_id))
    }

    fn disconnect_slot(&self, idx: usize) {
        let mut slots = self.shared.slots.write();
        if slots[idx].stream.take().is_some() {
            self.shared.cur_clients.fetch_sub(1, Ordering::SeqCst);
        }
        slots[idx].assigned = None;
        drop(slots);
        self.sessions.evict_by_slot(idx);
    }

    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.connector.lock().take() {
            let _ = handle.join();
        }
    }
}

fn connector_loop(listener: TcpListener, shared: Arc<TcpShared>) {
    while !shared.shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _peer)) => {
                if shared.cur_clients.load(Ordering::SeqCst) >= shared.max_clients {
                    continue; // refuse: at capacity
                }
                let stream = match tune_and_split(stream, shared.buffer_size) {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                let mut slots = shared.slots.write();
                if let Some(slot) = slots.iter_mut().find(|s| s.stream.is_none()) {
                    slot.stream = Some(stream);
                    slot.assigned = None;
                    shared.cur_clients.fetch_add(1, Ordering::SeqCst);
                }
            }
            Err(e) if is_timeout(&e) => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(_) => {
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

pub struct TcpClientTransport {
    stream: TcpStream,
}

impl TcpClientTransport {
    pub fn connect(addr: SocketAddr, buffer_size: usize) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let stream = tune_and_split(stream, buffer_size)?;
        Ok(TcpClientTransport { stream })
    }

    pub fn exchange(&mut self, buffer: &mut DataBuffer, timeout: Duration) -> Result<ExchangeOutcome> {
        let packet = buffer.output().packet().to_vec();
        if !write_all_with_timeout(&mut self.stream, &packet, timeout).unwrap_or(false) {
            return Ok(ExchangeOutcome::TransportError);
        }

        let mut header_bytes = [0u8; HEADER_SIZE];
        if !read_exact_with_timeout(&mut self.stream, &mut header_bytes, timeout).unwrap_or(false) {
            return Ok(ExchangeOutcome::TransportError);
        }
        let size = u32::from_be_bytes(header_bytes[12..16].try_into().unwrap()) as usize;
        if size < HEADER_SIZE || size - HEADER_SIZE > buffer.input().capacity() {
            return Ok(ExchangeOutcome::TransportError);
        }
        let mut body = vec![0u8; size - HEADER_SIZE];
        if !read_exact_with_timeout(&mut self.stream, &mut body, timeout).unwrap_or(false) {
            return Ok(ExchangeOutcome::TransportError);
        }

        buffer.input_mut().header_slice_mut().copy_from_slice(&header_bytes);
        if buffer.input_mut().set_data(&body).is_err() {
            return Ok(ExchangeOutcome::TransportError);
        }
        Ok(ExchangeOutcome::Delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::databuffer::Direction;
    use crate::wire::Header as WireHeader;

    #[test]
    fn server_accepts_and_echoes_one_client() {
        let server = Arc::new(
            TcpServerTransport::bind(
                "127.0.0.1:0".parse().unwrap(),
                1,
                4,
                4096,
                4096,
                Duration::from_secs(2),
                true,
                Arc::new(SessionTable::new(4)),
            )
            .unwrap(),
        );
        let addr = server.local_addr();

        let server2 = server.clone();
        let worker = std::thread::spawn(move || loop {
            if server2.recv(0).unwrap() {
                server2.with_buffer(0, |buf| {
                    let body = buf.input().packet()[HEADER_SIZE..].to_vec();
                    buf.output_mut().set_data(&body).unwrap();
                    let size = buf.output().packet().len() as u32;
                    let session = buf.input().read_header().unwrap().session;
                    WireHeader::new(session, size).encode(buf.output_mut().header_slice_mut());
                });
                server2.send(0).unwrap();
                break;
            }
        });

        // Give the connector thread a moment to be polling accept().
        std::thread::sleep(Duration::from_millis(50));
        let mut client = TcpClientTransport::connect(addr, 4096).unwrap();

        let mut out = DataBuffer::new(HEADER_SIZE + 4096, true);
        out.set(Direction::Output, 0x2000_0001, b"ping").unwrap();
        let size = out.output().packet().len() as u32;
        WireHeader::new(0, size).encode(out.output_mut().header_slice_mut());

        let outcome = client.exchange(&mut out, Duration::from_secs(2)).unwrap();
        worker.join().unwrap();
        server.shutdown();

        assert_eq!(outcome, ExchangeOutcome::Delivered);
        assert_eq!(out.get(Direction::Input, 0x2000_0001).unwrap(), Some(&b"ping"[..]));
    }
}

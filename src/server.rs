//! Server engine (§4.3): procedure table, session table, and the
//! worker-thread dispatch loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::{debug, info, trace, warn};

use crate::databuffer::{DataBuffer, Direction};
use crate::error::Status;
use crate::resolver::{self, Endpoint, Scheme};
use crate::session::SessionTable;
use crate::transport::shm::ShmServerTransport;
use crate::transport::tcp::TcpServerTransport;
use crate::transport::udp::UdpServerTransport;
use crate::transport::ServerTransport;
use crate::wire::{
    Header, PARAM_CAP, PARAM_PROC, PARAM_STATUS, PROC_GET_CAP, PROC_LOGIN, PROC_LOGOUT, HEADER_SIZE,
    VERSION, VERSION_MAJOR_MASK,
};

/// A registered procedure handler: `(session_id, data) -> 0 on success`.
/// Any opaque per-procedure context the original runtime passed as a raw
/// pointer is simply captured by the closure, the idiomatic Rust stand-in
/// for a `(fn, ctx)` pair.
pub type ProcHandler = Box<dyn Fn(u32, &mut DataBuffer) -> i32 + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub threads_num: usize,
    pub max_clients: usize,
    pub timeout: Duration,
    pub max_data_size: usize,
    pub tcp_buffer_size: usize,
    pub clean: bool,
    /// Pin each worker thread to a distinct CPU core (`--pin-threads`).
    pub pin_threads: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            threads_num: 4,
            max_clients: 64,
            timeout: Duration::from_secs(2),
            max_data_size: 65_000,
            tcp_buffer_size: 65_000,
            clean: true,
            pin_threads: false,
        }
    }
}

/// Accumulates procedure registrations before `bind`, matching the
/// create → add_proc* → bind lifecycle of §3.
#[derive(Default)]
pub struct ServerBuilder {
    procs: HashMap<u32, ProcHandler>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        ServerBuilder::default()
    }

    /// Registers a handler for `id`. Fails if `id` is already registered or
    /// collides with a reserved procedure id (§6).
    pub fn add_proc(
        &mut self,
        id: u32,
        handler: impl Fn(u32, &mut DataBuffer) -> i32 + Send + Sync + 'static,
    ) -> Result<()> {
        if matches!(id, PROC_GET_CAP | PROC_LOGIN | PROC_LOGOUT) {
            bail!("proc id {id:#x} is reserved");
        }
        if self.procs.contains_key(&id) {
            bail!("proc id {id:#x} is already registered");
        }
        self.procs.insert(id, Box::new(handler));
        Ok(())
    }

    /// Resolves `uri`, instantiates the matching transport, spawns
    /// `config.threads_num` workers, and blocks until every worker has
    /// signalled ready.
    pub fn bind(self, uri: &str, config: ServerConfig) -> Result<Server> {
        let resolved = resolver::resolve(uri, true)?;
        let sessions = Arc::new(SessionTable::new(config.max_clients));
        let transport = match resolved.scheme {
            Scheme::Udp => {
                let addr = socket_addr(&resolved)?;
                ServerTransport::Udp(UdpServerTransport::bind(
                    addr,
                    config.threads_num,
                    config.max_data_size,
                    config.clean,
                )?)
            }
            Scheme::Tcp => {
                let addr = socket_addr(&resolved)?;
                ServerTransport::Tcp(TcpServerTransport::bind(
                    addr,
                    config.threads_num,
                    config.max_clients,
                    config.max_data_size,
                    config.tcp_buffer_size,
                    config.timeout,
                    config.clean,
                    sessions.clone(),
                )?)
            }
            Scheme::Shm => {
                let name = match &resolved.endpoint {
                    Endpoint::Shm(n) => n.clone(),
                    _ => unreachable!("shm scheme always resolves to an Endpoint::Shm"),
                };
                ServerTransport::Shm(ShmServerTransport::create(
                    &name,
                    config.threads_num,
                    config.max_data_size,
                    config.clean,
                )?)
            }
        };

        info!(uri, threads = config.threads_num, "server bound");

        let server = Server {
            transport: Arc::new(transport),
            sessions,
            procs: Arc::new(self.procs),
            shutdown: Arc::new(AtomicBool::new(false)),
            started: Arc::new(AtomicUsize::new(0)),
            workers: std::sync::Mutex::new(Vec::new()),
            pin_threads: config.pin_threads,
        };
        server.spawn_workers();
        server.wait_ready();
        Ok(server)
    }
}

fn socket_addr(resolved: &resolver::ResolvedUri) -> Result<SocketAddr> {
    match &resolved.endpoint {
        Endpoint::Socket(addr) => Ok(*addr),
        Endpoint::Shm(_) => bail!("shm endpoint used where a socket address was expected"),
    }
}

pub struct Server {
    transport: Arc<ServerTransport>,
    sessions: Arc<SessionTable>,
    procs: Arc<HashMap<u32, ProcHandler>>,
    shutdown: Arc<AtomicBool>,
    started: Arc<AtomicUsize>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    pin_threads: bool,
}

impl Server {
    fn spawn_workers(&self) {
        let threads_num = self.transport.threads_num();
        let core_ids = if self.pin_threads {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        let mut handles = self.workers.lock().unwrap();
        for thread_id in 0..threads_num {
            let transport = self.transport.clone();
            let sessions = self.sessions.clone();
            let procs = self.procs.clone();
            let shutdown = self.shutdown.clone();
            let started = self.started.clone();
            let core = core_ids.get(thread_id % core_ids.len().max(1)).copied();
            handles.push(std::thread::spawn(move || {
                if let Some(core) = core {
                    core_affinity::set_for_current(core);
                }
                started.fetch_add(1, Ordering::SeqCst);
                worker_loop(thread_id, &transport, &sessions, &procs, &shutdown);
            }));
        }
    }

    fn wait_ready(&self) {
        let threads_num = self.transport.threads_num();
        while self.started.load(Ordering::SeqCst) < threads_num {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Signals every worker to stop, then joins them. Workers observe the
    /// shutdown flag within ~500ms (the transports' bounded waits), so this
    /// returns promptly.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut handles = self.workers.lock().unwrap();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
        self.transport.shutdown();
        info!("server shut down");
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    thread_id: usize,
    transport: &ServerTransport,
    sessions: &SessionTable,
    procs: &HashMap<u32, ProcHandler>,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match transport.recv(thread_id) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                warn!(thread_id, error = %e, "transport recv failed");
                continue;
            }
        }

        let outcome = handle_request(thread_id, transport, sessions, procs);
        if let Err(e) = transport.send(thread_id) {
            warn!(thread_id, error = %e, "failed to send reply");
        }
        transport.with_buffer(thread_id, |buf| buf.clear());

        match outcome {
            RequestOutcome::Disconnect => transport.disconnect(thread_id),
            RequestOutcome::Continue => transport.release(thread_id),
        }
    }
}

enum RequestOutcome {
    Continue,
    Disconnect,
}

fn handle_request(
    thread_id: usize,
    transport: &ServerTransport,
    sessions: &SessionTable,
    procs: &HashMap<u32, ProcHandler>,
) -> RequestOutcome {
    transport.with_buffer(thread_id, |buf| {
        let header = match buf.input().read_header() {
            Ok(h) => h,
            Err(e) => {
                warn!(thread_id, error = %e, "malformed request header");
                write_reply(buf, 0, Status::TransportError, None);
                return RequestOutcome::Disconnect;
            }
        };

        if header.version_major() != (VERSION & VERSION_MAJOR_MASK) {
            warn!(thread_id, session = header.session, "version mismatch");
            write_reply(buf, header.session, Status::VersionMismatch, None);
            return RequestOutcome::Disconnect;
        }

        if let Err(e) = buf.input().validate() {
            warn!(thread_id, error = %e, "malformed parameter chain");
            write_reply(buf, header.session, Status::TransportError, None);
            return RequestOutcome::Disconnect;
        }

        let proc_id = match buf.get(Direction::Input, PARAM_PROC) {
            Ok(Some(bytes)) if bytes.len() == 4 => u32::from_be_bytes(bytes.try_into().unwrap()),
            _ => {
                write_reply(buf, header.session, Status::Fail, None);
                return RequestOutcome::Disconnect;
            }
        };

        trace!(thread_id, session = header.session, proc_id, "dispatching request");

        if header.session == 0 {
            let slot = transport.current_slot(thread_id);
            return handle_preauth(buf, proc_id, sessions, slot);
        }

        let session = match sessions.touch(header.session) {
            Some(s) => s,
            None => {
                warn!(thread_id, session = header.session, "unknown session");
                write_reply(buf, header.session, Status::AuthError, None);
                return RequestOutcome::Disconnect;
            }
        };

        if proc_id == PROC_LOGOUT {
            sessions.logout(session.id);
            debug!(thread_id, session = session.id, "session logged out");
            write_reply(buf, session.id, Status::Ok, None);
            return RequestOutcome::Disconnect;
        }

        let handler = match procs.get(&proc_id) {
            Some(h) => h,
            None => {
                write_reply(buf, session.id, Status::Fail, None);
                return RequestOutcome::Disconnect;
            }
        };

        let rc = handler(session.id, buf);
        if rc != 0 {
            write_reply(buf, session.id, Status::Fail, None);
            return RequestOutcome::Disconnect;
        }
        write_reply(buf, session.id, Status::Ok, None);
        RequestOutcome::Continue
    })
}

fn handle_preauth(
    buf: &mut DataBuffer,
    proc_id: u32,
    sessions: &SessionTable,
    slot: Option<usize>,
) -> RequestOutcome {
    match proc_id {
        PROC_GET_CAP => {
            write_reply(buf, 0, Status::Ok, Some(0));
            RequestOutcome::Continue
        }
        PROC_LOGIN => match sessions.login(slot) {
            Some(session_id) => {
                debug!(session = session_id, "session logged in");
                write_reply(buf, session_id, Status::Ok, None);
                RequestOutcome::Continue
            }
            None => {
                warn!("session table full");
                write_reply(buf, 0, Status::TooManyConnections, None);
                RequestOutcome::Disconnect
            }
        },
        _ => {
            write_reply(buf, 0, Status::AuthError, None);
            RequestOutcome::Disconnect
        }
    }
}

fn write_reply(buf: &mut DataBuffer, session: u32, status: Status, cap: Option<u32>) {
    buf.set_u32(Direction::Output, PARAM_STATUS, status.into()).ok();
    if let Some(cap) = cap {
        buf.set_u32(Direction::Output, PARAM_CAP, cap).ok();
    }
    let size = (HEADER_SIZE + buf.output().data_size()) as u32;
    let header = Header::new(session, size);
    header.encode(buf.output_mut().header_slice_mut());
}

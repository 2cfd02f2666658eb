//! Server-side session table (§3, §4.3).

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

/// Per-session state. `GotSessionId` is the state immediately after LOGIN;
/// a session moves to `Connected` on its first authenticated message after
/// that. The transition exists so an implementer can later hang
/// authentication/encryption setup off it (§9); this runtime does not use
/// it for anything beyond bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    GotSessionId,
    Connected,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: u32,
    pub state: SessionState,
    pub last_activity: Instant,
    /// TCP-only: the connection-table slot index owning this session, so
    /// LOGOUT can tell the worker which socket to close afterward.
    pub socket_slot: Option<usize>,
}

/// Bounded by `max_clients`; mutable under one internal lock, matching the
/// "server's own mutex" described in §5.
pub struct SessionTable {
    inner: Mutex<Inner>,
    max_clients: usize,
}

struct Inner {
    sessions: HashMap<u32, Session>,
    last_session_id: u32,
}

impl SessionTable {
    pub fn new(max_clients: usize) -> Self {
        SessionTable {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                last_session_id: 0,
            }),
            max_clients,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocates a fresh session id via linear probing from
    /// `last_session_id + 1`, skipping 0 and any id already in use.
    /// Returns `None` if the table is at capacity.
    pub fn login(&self, socket_slot: Option<usize>) -> Option<u32> {
        let mut inner = self.inner.lock();
        if inner.sessions.len() >= self.max_clients {
            return None;
        }
        let mut candidate = inner.last_session_id.wrapping_add(1);
        if candidate == 0 {
            candidate = 1;
        }
        while inner.sessions.contains_key(&candidate) {
            candidate = candidate.wrapping_add(1);
            if candidate == 0 {
                candidate = 1;
            }
        }
        inner.last_session_id = candidate;
        inner.sessions.insert(
            candidate,
            Session {
                id: candidate,
                state: SessionState::GotSessionId,
                last_activity: Instant::now(),
                socket_slot,
            },
        );
        Some(candidate)
    }

    /// Looks up a session and marks the first authenticated message's state
    /// transition (GotSessionId → Connected), refreshing `last_activity`.
    pub fn touch(&self, id: u32) -> Option<Session> {
        let mut inner = self.inner.lock();
        let session = inner.sessions.get_mut(&id)?;
        session.state = SessionState::Connected;
        session.last_activity = Instant::now();
        Some(session.clone())
    }

    pub fn get(&self, id: u32) -> Option<Session> {
        self.inner.lock().sessions.get(&id).cloned()
    }

    pub fn logout(&self, id: u32) -> Option<Session> {
        self.inner.lock().sessions.remove(&id)
    }

    /// Evicts whatever session, if any, is owned by a dropped transport
    /// socket slot.
    pub fn evict_by_slot(&self, slot: usize) {
        let mut inner = self.inner.lock();
        inner
            .sessions
            .retain(|_, s| s.socket_slot != Some(slot));
    }
}

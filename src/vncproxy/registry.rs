use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use dashmap::{DashMap, mapref::entry::Entry};
use serde::Serialize;

use crate::vncproxy::{peer::Closer, telemetry};

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub client: String,
    pub target: String,
    pub started_at_unix_ms: u64,
}

struct Registered {
    info: SessionInfo,
    closer: Closer,
}

/// Live tunnel sessions, keyed by session id.
///
/// The map is private: callers only ever see owned [`SessionInfo`] copies.
pub struct SessionRegistry {
    sessions: DashMap<String, Registered>,
    /// Fired by `close_all`; sessions added afterwards are closed on arrival.
    draining: Closer,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("draining", &self.draining.is_closed())
            .finish()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            draining: Closer::new(),
        }
    }

    /// Returns false (and changes nothing) if the id is already registered.
    ///
    /// Once `close_all` has run, the session is still registered but its close
    /// signal fires immediately, so it tears itself down and deregisters.
    pub fn add(&self, info: SessionInfo, closer: Closer) -> bool {
        match self.sessions.entry(info.id.clone()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(v) => {
                v.insert(Registered {
                    info,
                    closer: closer.clone(),
                });
                telemetry::session_opened();
            }
        }
        // Checked after the insert: either close_all sees the entry or we see
        // the drain flag.
        if self.draining.is_closed() {
            closer.close();
        }
        true
    }

    /// Removes the session and fires its close signal while the entry is still
    /// locked, so nobody observes a registered session that is shutting down.
    ///
    /// Returns false if the session was not (or no longer) registered.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self
            .sessions
            .remove_if(id, |_, s| {
                s.closer.close();
                true
            })
            .is_some();
        if removed {
            telemetry::session_closed();
        }
        removed
    }

    /// Fires the close signal of every registered session. Each session
    /// deregisters itself once its relays have stopped.
    pub fn close_all(&self) -> usize {
        self.draining.close();
        let mut fired = 0;
        for s in self.sessions.iter() {
            if s.closer.close() {
                fired += 1;
            }
        }
        fired
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut out = Vec::with_capacity(self.sessions.len());
        for s in self.sessions.iter() {
            out.push(s.info.clone());
        }
        out.sort_by(|a, b| {
            a.started_at_unix_ms
                .cmp(&b.started_at_unix_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

pub type SharedSessions = Arc<SessionRegistry>;

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn new_session_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("s{n}")
}

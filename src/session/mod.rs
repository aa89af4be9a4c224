//! Per-client session state and the session store.
//!
//! A session is reachable by exactly one [`crate::broker::connection::ConnectionTask`]
//! while online; the two never own each other, to avoid a reference
//! cycle — the connection registry in `broker` links a client identifier
//! to its write half, and the `Session` here only tracks whether it
//! currently has one via `connected`.
//!
//! Everything below is single-owner: the broker core runs on one
//! `LocalSet`, so `Rc<RefCell<_>>` is enough — there is never a second
//! thread that could observe a session mid-mutation.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::protocol::QoS;

pub mod qos;

#[cfg(test)]
mod tests;

/// Where an outbound QoS≥1 message sits in its acknowledgement
/// handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutflightState {
    AwaitPuback,
    AwaitPubrec,
    AwaitPubcomp,
}

/// An outbound message awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct OutflightEntry {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub state: OutflightState,
    pub last_sent_at: Instant,
    pub attempts: u32,
}

/// A message parked in a session's offline queue while it has no live
/// connection.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// The will a session registered at CONNECT time.
#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Per-client session record.
pub struct Session {
    pub client_id: Arc<str>,
    pub clean_session: bool,
    /// Filters this session is subscribed to, mirroring the topic
    /// tree's entries for this client so a clean-session takeover or
    /// detach can unwind them without walking the whole tree.
    pub subscriptions: HashMap<String, QoS>,
    pub inflight_out: BTreeMap<u16, OutflightEntry>,
    pub inflight_in: HashSet<u16>,
    pub offline_queue: VecDeque<PendingMessage>,
    pub max_queued_messages: usize,
    pub max_inflight: usize,
    next_packet_id: u16,
    pub will: Option<Will>,
    pub keep_alive_seconds: u16,
    pub last_activity_at: Instant,
    /// Whether a connection task currently owns this session.
    pub connected: bool,
    pub disconnected_at: Option<Instant>,
}

impl Session {
    fn new(
        client_id: Arc<str>,
        clean_session: bool,
        keep_alive_seconds: u16,
        max_queued_messages: usize,
        max_inflight: usize,
    ) -> Self {
        Self {
            client_id,
            clean_session,
            subscriptions: HashMap::new(),
            inflight_out: BTreeMap::new(),
            inflight_in: HashSet::new(),
            offline_queue: VecDeque::new(),
            max_queued_messages,
            max_inflight,
            next_packet_id: 1,
            will: None,
            keep_alive_seconds,
            last_activity_at: Instant::now(),
            connected: true,
            disconnected_at: None,
        }
    }

    /// Drops subscriptions, queues, and inflight state — called on a
    /// clean-session takeover of a persisted session.
    fn reset_for_clean_session(&mut self, keep_alive_seconds: u16) {
        self.clean_session = true;
        self.subscriptions.clear();
        self.inflight_out.clear();
        self.inflight_in.clear();
        self.offline_queue.clear();
        self.next_packet_id = 1;
        self.will = None;
        self.keep_alive_seconds = keep_alive_seconds;
        self.connected = true;
        self.disconnected_at = None;
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Instant::now();
    }

    /// `true` once the client has gone silent for longer than its
    /// negotiated keep-alive window allows.
    pub fn keep_alive_expired(&self, keep_alive_factor: f64, no_keepalive_timeout: Duration) -> bool {
        let timeout = if self.keep_alive_seconds == 0 {
            no_keepalive_timeout
        } else {
            Duration::from_secs_f64(self.keep_alive_seconds as f64 * keep_alive_factor)
        };
        self.last_activity_at.elapsed() > timeout
    }

    pub fn is_inflight_full(&self) -> bool {
        self.inflight_out.len() >= self.max_inflight
    }
}

/// Outcome of [`SessionStore::create_or_takeover`].
pub struct Takeover {
    pub session: Rc<RefCell<Session>>,
    /// `session_present` to report in CONNACK.
    pub session_present: bool,
    /// Whether a previous connection for this client_id was online and
    /// must be evicted by the caller (no will publication for it).
    pub previous_online: bool,
}

/// Maps client identifiers to their session record.
///
/// Single-owner, so access is a plain `RefCell` borrow rather than a
/// concurrent map — there is exactly one event loop thread touching
/// this.
pub struct SessionStore {
    sessions: RefCell<HashMap<Arc<str>, Rc<RefCell<Session>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RefCell::new(HashMap::new()),
        }
    }

    /// Creates a fresh session or resumes a persisted one:
    /// a `clean_session=true` CONNECT always discards any prior state;
    /// otherwise an unexpired persisted session is reused verbatim.
    pub fn create_or_takeover(
        &self,
        client_id: &str,
        clean_session: bool,
        keep_alive_seconds: u16,
        max_queued_messages: usize,
        max_inflight: usize,
    ) -> Takeover {
        let mut sessions = self.sessions.borrow_mut();

        if let Some(existing) = sessions.get(client_id) {
            let previous_online = existing.borrow().connected;
            if clean_session {
                existing.borrow_mut().reset_for_clean_session(keep_alive_seconds);
                return Takeover {
                    session: existing.clone(),
                    session_present: false,
                    previous_online,
                };
            }
            let mut s = existing.borrow_mut();
            s.clean_session = false;
            s.keep_alive_seconds = keep_alive_seconds;
            s.connected = true;
            s.disconnected_at = None;
            drop(s);
            return Takeover {
                session: existing.clone(),
                session_present: true,
                previous_online,
            };
        }

        let client_id: Arc<str> = client_id.into();
        let session = Rc::new(RefCell::new(Session::new(
            client_id.clone(),
            clean_session,
            keep_alive_seconds,
            max_queued_messages,
            max_inflight,
        )));
        sessions.insert(client_id, session.clone());
        Takeover {
            session,
            session_present: false,
            previous_online: false,
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Rc<RefCell<Session>>> {
        self.sessions.borrow().get(client_id).cloned()
    }

    /// Marks a session offline. Returns `true` if the record was
    /// deleted outright (`clean_session=true`), `false` if it persists
    /// for later resumption or expiry.
    pub fn detach(&self, client_id: &str) -> bool {
        let mut sessions = self.sessions.borrow_mut();
        let Some(session) = sessions.get(client_id).cloned() else {
            return false;
        };

        let is_clean = {
            let mut s = session.borrow_mut();
            s.connected = false;
            s.disconnected_at = Some(Instant::now());
            s.clean_session
        };

        if is_clean {
            sessions.remove(client_id);
        }
        is_clean
    }

    /// Deletes every offline session whose `disconnected_at +
    /// session_expiry` has elapsed. Returns the evicted client
    /// identifiers so the caller can release any other bookkeeping
    /// (subscriptions in the topic tree, in particular).
    pub fn expire_offline(&self, session_expiry: Duration) -> Vec<Arc<str>> {
        let mut sessions = self.sessions.borrow_mut();
        let mut expired = Vec::new();
        sessions.retain(|client_id, session| {
            let s = session.borrow();
            let keep = s.connected
                || s.disconnected_at
                    .map(|at| at.elapsed() < session_expiry)
                    .unwrap_or(true);
            if !keep {
                expired.push(client_id.clone());
            }
            keep
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.borrow().is_empty()
    }

    pub fn client_ids(&self) -> Vec<Arc<str>> {
        self.sessions.borrow().keys().cloned().collect()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

//! Connection sessions
//!
//! Tracks each transport connection through its phases and keeps the
//! registry of live connections for one endpoint.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use super::outbuf::OutputQueue;
use super::term::LineEditor;

/// Unique identifier for a transport connection
pub type ConnId = u64;

/// Per-connection state that only exists while established
#[derive(Debug)]
pub struct Live<U> {
    /// Interactive user created by the host
    pub user: U,
    /// Bytes waiting for the transport
    pub queue: OutputQueue,
    /// Line discipline
    pub editor: LineEditor,
}

/// Connection phase
#[derive(Debug)]
pub enum Phase<U> {
    /// Accepted, handshake not complete
    Uninitialized,
    /// Handshake complete, user attached
    Established(Live<U>),
    /// Torn down, no further events
    Closed,
}

/// One transport connection
pub struct ConnectionSession<U, T> {
    /// Connection ID
    pub id: ConnId,
    /// Transport handle
    pub transport: T,
    /// Current phase
    phase: Phase<U>,
    /// A writable notification is outstanding
    writable_pending: bool,
}

impl<U, T> ConnectionSession<U, T> {
    /// Create a session for a freshly accepted connection
    pub fn new(id: ConnId, transport: T) -> Self {
        Self {
            id,
            transport,
            phase: Phase::Uninitialized,
            writable_pending: false,
        }
    }

    #[allow(dead_code)]
    pub fn phase(&self) -> &Phase<U> {
        &self.phase
    }

    pub fn is_established(&self) -> bool {
        matches!(self.phase, Phase::Established(_))
    }

    /// Attach the user and create the queue and editor
    pub fn establish(&mut self, user: U, editor: LineEditor) {
        self.phase = Phase::Established(Live {
            user,
            queue: OutputQueue::new(),
            editor,
        });
    }

    /// Established state, if any
    #[allow(dead_code)]
    pub fn live(&self) -> Option<&Live<U>> {
        match &self.phase {
            Phase::Established(live) => Some(live),
            _ => None,
        }
    }

    /// Established state together with the transport
    pub fn live_mut(&mut self) -> Option<(&mut Live<U>, &mut T)> {
        match &mut self.phase {
            Phase::Established(live) => Some((live, &mut self.transport)),
            _ => None,
        }
    }

    /// Detach everything and enter `Closed`.
    ///
    /// Returns the live state if there was one; closing twice or closing a
    /// connection that never finished its handshake yields `None`.
    pub fn close(&mut self) -> Option<Live<U>> {
        match std::mem::replace(&mut self.phase, Phase::Closed) {
            Phase::Established(live) => Some(live),
            _ => None,
        }
    }

    /// Mark a writable notification as requested.
    ///
    /// Returns false if one is already outstanding.
    pub fn arm_writable(&mut self) -> bool {
        !std::mem::replace(&mut self.writable_pending, true)
    }

    /// The requested writable notification arrived
    pub fn writable_delivered(&mut self) {
        self.writable_pending = false;
    }
}

/// Live connections of one endpoint
pub struct SessionRegistry<U, T> {
    sessions: HashMap<ConnId, ConnectionSession<U, T>>,
}

impl<U, T> Default for SessionRegistry<U, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<U, T> SessionRegistry<U, T> {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Register a new connection, replacing any stale entry with the same ID
    pub fn insert(&mut self, id: ConnId, transport: T) -> &mut ConnectionSession<U, T> {
        let session = ConnectionSession::new(id, transport);
        match self.sessions.entry(id) {
            Entry::Occupied(mut slot) => {
                slot.insert(session);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(session),
        }
    }

    #[allow(dead_code)]
    pub fn get(&self, id: ConnId) -> Option<&ConnectionSession<U, T>> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut ConnectionSession<U, T>> {
        self.sessions.get_mut(&id)
    }

    pub fn remove(&mut self, id: ConnId) -> Option<ConnectionSession<U, T>> {
        self.sessions.remove(&id)
    }

    /// IDs of all registered connections, in ascending order
    pub fn ids(&self) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[allow(dead_code)]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of connections past their handshake
    pub fn established(&self) -> usize {
        self.sessions.values().filter(|s| s.is_established()).count()
    }
}

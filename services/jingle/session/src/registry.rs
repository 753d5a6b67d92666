//! Routing table from (peer, session id) to live sessions.

use crate::session::Session;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jingle_wire::{Jid, SessionId};
use std::sync::Arc;

/// Identity of a session from the local endpoint's point of view
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct SessionKey {
    /// Remote endpoint
    pub peer: Jid,
    /// Session id
    pub sid: SessionId,
}

impl SessionKey {
    /// Create a key
    pub fn new(peer: Jid, sid: SessionId) -> Self {
        Self { peer, sid }
    }
}

/// Concurrent map of live sessions
#[derive(Clone, Debug, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionKey, Arc<Session>>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session unless the key is taken
    pub fn insert_new(&self, key: SessionKey, session: Arc<Session>) -> bool {
        match self.sessions.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(session);
                true
            }
        }
    }

    /// Look up a session
    pub fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.sessions.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a session
    pub fn remove(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.sessions.remove(key).map(|(_, session)| session)
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of all live sessions
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

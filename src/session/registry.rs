//! Concurrent registry of admitted peers
//!
//! The single source of truth for who is connected. Inserts and removes
//! take the write lock, fan-out and counts take the read lock just long
//! enough to copy what they need. The lock is never held across an await.

use super::{PeerId, PeerSession};
use crate::error::SinkError;
use crate::gate::{GateEvent, UnblockNotifier};
use log::info;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

struct Inner {
    sessions: HashMap<PeerId, Arc<PeerSession>>,
    /// Set by `drain`; no insert is accepted afterwards
    closed: bool,
}

pub struct SessionRegistry {
    inner: RwLock<Inner>,
    notifier: UnblockNotifier,
}

impl SessionRegistry {
    pub fn new(notifier: UnblockNotifier) -> Self {
        Self {
            inner: RwLock::new(Inner {
                sessions: HashMap::new(),
                closed: false,
            }),
            notifier,
        }
    }

    /// Register a session. Returns the new peer count.
    pub fn insert(&self, id: PeerId, session: Arc<PeerSession>) -> Result<usize, SinkError> {
        let count = {
            let mut inner = self.inner.write();
            if inner.closed {
                return Err(SinkError::NotStarted);
            }
            if inner.sessions.contains_key(&id) {
                return Err(SinkError::DuplicateId(id));
            }
            inner.sessions.insert(id, session);
            inner.sessions.len()
        };
        self.publish(count);
        Ok(count)
    }

    /// Remove a session, handing ownership to the caller.
    ///
    /// Removing an absent id is a no-op and returns `None`, so exactly one
    /// caller ever gets to close a given session.
    pub fn remove(&self, id: &str) -> Option<Arc<PeerSession>> {
        let (removed, count) = {
            let mut inner = self.inner.write();
            let removed = inner.sessions.remove(id);
            (removed, inner.sessions.len())
        };
        if removed.is_some() {
            self.publish(count);
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().sessions.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<PeerSession>> {
        self.inner.read().sessions.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.inner.read().sessions.keys().cloned().collect()
    }

    /// Consistent copy of the current sessions for iteration
    pub fn snapshot(&self) -> Vec<Arc<PeerSession>> {
        self.inner.read().sessions.values().cloned().collect()
    }

    /// Remove every session and refuse further inserts
    pub fn drain(&self) -> Vec<Arc<PeerSession>> {
        let drained: Vec<_> = {
            let mut inner = self.inner.write();
            inner.closed = true;
            inner.sessions.drain().map(|(_, session)| session).collect()
        };
        if !drained.is_empty() {
            self.publish(0);
        }
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    fn publish(&self, count: usize) {
        info!("Client count changed: {} connected clients", count);
        self.notifier.notify(GateEvent::PeersChanged(count));
    }
}

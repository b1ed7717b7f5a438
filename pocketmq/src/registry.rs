//! Registry of deliverable sessions.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::types::{Message, SessionId};

/// Sending side of a session's outbound queue.
pub type Outbox = mpsc::Sender<Message>;

/// Maps a session to its outbound queue.
///
/// A session becomes deliverable when it sends CONNECT and stops being
/// deliverable when its disconnect cleanup runs.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<SessionId, Outbox>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) a session.
    ///
    /// Returns true if the session was not registered before.
    pub fn register(&mut self, session: SessionId, outbox: Outbox) -> bool {
        self.clients.insert(session, outbox).is_none()
    }

    /// Remove a session, returning its outbox if it was registered.
    pub fn remove(&mut self, session: &SessionId) -> Option<Outbox> {
        self.clients.remove(session)
    }

    pub fn outbox(&self, session: &SessionId) -> Option<&Outbox> {
        self.clients.get(session)
    }

    pub fn contains(&self, session: &SessionId) -> bool {
        self.clients.contains_key(session)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

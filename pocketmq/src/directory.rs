//! Topic → subscriber directory.
//!
//! Topics are matched by exact, case-sensitive string equality. Each topic
//! keeps its subscribers in insertion order and does not deduplicate them: a
//! session that subscribes twice is listed twice and receives every message
//! twice.

use std::collections::HashMap;

use crate::types::SessionId;

/// Subscription directory.
#[derive(Debug, Default)]
pub struct SubscriptionDirectory {
    topics: HashMap<String, Vec<SessionId>>,
}

impl SubscriptionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `session` to the subscriber list of `topic`.
    pub fn subscribe(&mut self, topic: &str, session: SessionId) {
        match self.topics.get_mut(topic) {
            Some(subscribers) => subscribers.push(session),
            None => {
                self.topics.insert(topic.to_string(), vec![session]);
            }
        }
    }

    /// Subscribers of `topic`, in subscription order.
    pub fn subscribers(&self, topic: &str) -> &[SessionId] {
        self.topics.get(topic).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Strip every occurrence of `session` from every topic.
    ///
    /// Returns the number of entries removed.
    pub fn remove_session(&mut self, session: &SessionId) -> usize {
        let mut removed = 0;
        self.topics.retain(|_, subscribers| {
            let before = subscribers.len();
            subscribers.retain(|s| s != session);
            removed += before - subscribers.len();
            !subscribers.is_empty()
        });
        removed
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Total number of entries, duplicates included.
    pub fn subscription_count(&self) -> usize {
        self.topics.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

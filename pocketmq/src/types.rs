//! Common types for pocketmq.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

/// Identifier of a broker-side session.
///
/// The broker uses the peer address (`ip:port`) of the accepted connection.
/// Backed by `Arc<str>` so directory entries and registry keys clone in O(1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Arc<str>);

impl SessionId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<SocketAddr> for SessionId {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.to_string())
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic name.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
}

impl Message {
    /// Create a new message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Payload as UTF-8, if it is valid.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Observer for publishes received by the broker.
pub trait Handler: Send + Sync {
    /// Handle an incoming message.
    ///
    /// Called for every PUBLISH a session sends, before it is routed.
    /// `seq` is the broker-wide message counter after this publish.
    fn handle(&self, client_id: &str, seq: u64, msg: &Message);
}

/// Function-based handler.
impl<F> Handler for F
where
    F: Fn(&str, u64, &Message) + Send + Sync,
{
    fn handle(&self, client_id: &str, seq: u64, msg: &Message) {
        self(client_id, seq, msg)
    }
}

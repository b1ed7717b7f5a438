//! QoS 0 broker for the supported MQTT subset.
//!
//! The broker accepts connections without bound and runs one task per
//! connection. Sessions share a [`ClientRegistry`] and a
//! [`SubscriptionDirectory`], each behind its own lock; whenever both are
//! needed the registry lock is taken first.

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::directory::SubscriptionDirectory;
use crate::error::{Error, Result};
use crate::protocol;
use crate::registry::{ClientRegistry, Outbox};
use crate::router::{self, Delivery};
use crate::session;
use crate::types::{Handler, Message, SessionId};

/// Default listen address.
pub const DEFAULT_ADDR: &str = "0.0.0.0:1883";

/// Default outbound queue capacity per session.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Back-off after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Callback type alias.
type Callback = Arc<dyn Fn(&str) + Send + Sync>;

/// Broker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Listen address (host:port).
    pub addr: String,
    /// Outbound queue capacity per session.
    pub queue_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ADDR)
    }
}

impl BrokerConfig {
    /// Create a new broker config.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Set the outbound queue capacity per session.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig("queue_capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Builder for Broker.
pub struct BrokerBuilder {
    config: BrokerConfig,
    handler: Option<Arc<dyn Handler>>,
    on_connect: Option<Callback>,
    on_disconnect: Option<Callback>,
}

impl BrokerBuilder {
    /// Create a new broker builder.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            handler: None,
            on_connect: None,
            on_disconnect: None,
        }
    }

    /// Set the publish handler.
    pub fn handler<H: Handler + 'static>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Set the on_connect callback, fired when a session sends CONNECT.
    pub fn on_connect<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Set the on_disconnect callback, fired after cleanup completes.
    pub fn on_disconnect<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Build the broker.
    pub fn build(self) -> Broker {
        let state = BrokerState {
            registry: RwLock::new(ClientRegistry::new()),
            directory: RwLock::new(SubscriptionDirectory::new()),
            messages: AtomicU64::new(0),
            queue_capacity: self.config.queue_capacity.max(1),
            handler: self.handler,
            on_connect: self.on_connect,
            on_disconnect: self.on_disconnect,
        };
        Broker {
            config: self.config,
            state: Arc::new(state),
            running: AtomicBool::new(false),
        }
    }
}

/// QoS 0 broker.
pub struct Broker {
    config: BrokerConfig,
    state: Arc<BrokerState>,
    running: AtomicBool,
}

impl Broker {
    /// Create a new broker with the given config.
    pub fn new(config: BrokerConfig) -> Self {
        BrokerBuilder::new(config).build()
    }

    /// Create a builder for this broker.
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Bind the configured address and serve until the future is dropped.
    ///
    /// Failing to bind is the only error this returns; connection failures
    /// are handled per session.
    pub async fn serve(&self) -> Result<()> {
        self.config.validate()?;
        let listener = TcpListener::bind(&self.config.addr)
            .await
            .map_err(|source| Error::Bind {
                addr: self.config.addr.clone(),
                source,
            })?;
        self.serve_listener(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        match listener.local_addr() {
            Ok(addr) => info!("Broker listening on {}", addr),
            Err(_) => info!("Broker listening on {}", self.config.addr),
        }

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            debug!("Accepted connection from {}", addr);

            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                let id = SessionId::from(addr);
                match session::run(state, stream, id.clone()).await {
                    Ok(()) => {}
                    Err(e) if e.is_disconnect() => debug!("Connection {} dropped: {}", id, e),
                    Err(e) => debug!("Connection {} error: {}", id, e),
                }
            });
        }
    }

    /// Publish a message from the broker itself.
    ///
    /// Goes through the same router as client publishes but does not count
    /// towards [`Broker::message_count`].
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<Delivery> {
        let msg = Message::new(topic, Bytes::copy_from_slice(payload));
        protocol::create_publish(&msg.topic, msg.payload.clone()).check_size()?;
        Ok(self.state.route(&msg))
    }

    /// Number of publishes received from sessions.
    pub fn message_count(&self) -> u64 {
        self.state.messages.load(Ordering::Relaxed)
    }

    /// Number of sessions currently in the client registry.
    pub fn client_count(&self) -> usize {
        self.state.registry.read().len()
    }

    /// Number of directory entries, duplicates included.
    pub fn subscription_count(&self) -> usize {
        self.state.directory.read().subscription_count()
    }
}

/// State shared by every session of one broker.
pub(crate) struct BrokerState {
    registry: RwLock<ClientRegistry>,
    directory: RwLock<SubscriptionDirectory>,
    messages: AtomicU64,
    pub(crate) queue_capacity: usize,
    handler: Option<Arc<dyn Handler>>,
    on_connect: Option<Callback>,
    on_disconnect: Option<Callback>,
}

impl BrokerState {
    #[cfg(test)]
    pub(crate) fn for_tests(queue_capacity: usize) -> Self {
        Self {
            registry: RwLock::new(ClientRegistry::new()),
            directory: RwLock::new(SubscriptionDirectory::new()),
            messages: AtomicU64::new(0),
            queue_capacity,
            handler: None,
            on_connect: None,
            on_disconnect: None,
        }
    }

    pub(crate) fn connect(&self, id: &SessionId, outbox: Outbox) {
        let first = self.registry.write().register(id.clone(), outbox);
        if first {
            info!("Client {} connected", id);
        } else {
            debug!("Client {} sent CONNECT again", id);
        }

        if let Some(ref on_connect) = self.on_connect {
            on_connect(id.as_str());
        }
    }

    pub(crate) fn subscribe(&self, id: &SessionId, topic: &str) {
        self.directory.write().subscribe(topic, id.clone());
        info!("Client {} subscribed to {}", id, topic);
    }

    /// Count, observe and route a publish received from a session.
    pub(crate) fn publish(&self, id: &SessionId, msg: Message) -> Delivery {
        let seq = self.messages.fetch_add(1, Ordering::Relaxed) + 1;

        if let Some(ref handler) = self.handler {
            handler.handle(id.as_str(), seq, &msg);
        }

        let delivery = self.route(&msg);
        debug!(
            "Publish #{} from {} to {}: {} delivered, {} skipped, {} failed",
            seq, id, msg.topic, delivery.delivered, delivery.skipped, delivery.failed
        );
        delivery
    }

    pub(crate) fn route(&self, msg: &Message) -> Delivery {
        router::route(&self.registry, &self.directory, msg)
    }

    /// Forget a session: registry first, then every directory entry.
    pub(crate) fn cleanup(&self, id: &SessionId) {
        let (was_registered, removed) = {
            let mut registry = self.registry.write();
            let mut directory = self.directory.write();
            (registry.remove(id).is_some(), directory.remove_session(id))
        };

        if removed > 0 {
            debug!("Cleaned up {} subscriptions for client {}", removed, id);
        }
        if was_registered {
            info!("Client {} disconnected", id);
        } else {
            debug!("Connection {} closed", id);
        }

        if let Some(ref on_disconnect) = self.on_disconnect {
            on_disconnect(id.as_str());
        }
    }

    #[cfg(test)]
    pub(crate) fn is_registered(&self, id: &SessionId) -> bool {
        self.registry.read().contains(id)
    }

    #[cfg(test)]
    pub(crate) fn subscribers(&self, topic: &str) -> Vec<SessionId> {
        self.directory.read().subscribers(topic).to_vec()
    }

    #[cfg(test)]
    pub(crate) fn message_count(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }
}

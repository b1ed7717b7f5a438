//! Minimal QoS 0 MQTT broker and client.
//!
//! pocketmq speaks a deliberately small subset of MQTT 3.1.1, enough for
//! sensors that publish small JSON readings and dashboards that subscribe
//! to them:
//!
//! - **CONNECT**: acknowledged with CONNACK "accepted", body not inspected
//! - **PUBLISH**: QoS 0 only, routed by exact topic match
//! - **SUBSCRIBE**: first topic filter only, always granted QoS 0
//! - **PINGREQ**: answered with PINGRESP
//!
//! Remaining lengths are limited to a single byte (0..=127). Packets that
//! need a longer encoding are rejected and the connection is closed.
//!
//! ## Components
//!
//! - [`Broker`]: accepts connections and routes publishes
//! - [`Client`]: small client used by the CLI tools
//! - [`protocol`]: packet codec
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pocketmq::{Broker, BrokerConfig, Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> pocketmq::Result<()> {
//!     let broker = Arc::new(Broker::new(BrokerConfig::new("127.0.0.1:1883")));
//!     let server = Arc::clone(&broker);
//!     tokio::spawn(async move { server.serve().await });
//!
//!     let client = Client::connect(ClientConfig::new("127.0.0.1:1883", "client-1")).await?;
//!     client.subscribe("airquality/sensor/data").await?;
//!     client.publish("airquality/sensor/data", &b"{\"pm2_5_atm\":12}"[..]).await?;
//!
//!     let msg = client.recv().await?;
//!     println!("Received: {:?}", msg);
//!     Ok(())
//! }
//! ```

mod broker;
mod client;
mod directory;
mod error;
pub mod protocol;
mod registry;
mod router;
mod session;
mod types;

pub use broker::{Broker, BrokerBuilder, BrokerConfig, DEFAULT_ADDR, DEFAULT_QUEUE_CAPACITY};
pub use client::{Client, ClientConfig};
pub use directory::SubscriptionDirectory;
pub use error::{Error, Result};
pub use registry::{ClientRegistry, Outbox};
pub use router::Delivery;
pub use session::SessionState;
pub use types::{Handler, Message, SessionId};

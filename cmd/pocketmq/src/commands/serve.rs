//! Broker command.

use anyhow::Context;
use clap::Args;
use serde_json::Value;
use tracing::{info, warn};

use pocketmq::{Broker, BrokerConfig, Handler, Message};

use super::load_settings;
use crate::Cli;

/// Bytes of a non-sensor payload shown in the log.
const PREVIEW_LEN: usize = 50;

/// Run the broker until Ctrl+C.
#[derive(Args)]
pub struct ServeCommand {
    /// Host to bind (default 0.0.0.0)
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on (default 1883)
    #[arg(short, long)]
    port: Option<u16>,

    /// Outbound queue capacity per client
    #[arg(long)]
    queue_capacity: Option<usize>,
}

impl ServeCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let mut settings = load_settings(cli)?;
        if let Some(ref bind) = self.bind {
            settings.bind_host = bind.clone();
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(capacity) = self.queue_capacity {
            settings.queue_capacity = capacity;
        }

        let config = BrokerConfig::new(settings.listen_addr()).queue_capacity(settings.queue_capacity);
        let broker = Broker::builder(config).handler(SensorLogger).build();

        log_banner(settings.port).await;

        tokio::select! {
            result = broker.serve() => {
                result.with_context(|| format!("broker on {} failed", settings.listen_addr()))?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!(
                    "Broker stopped after {} messages, {} clients connected",
                    broker.message_count(),
                    broker.client_count()
                );
            }
        }
        Ok(())
    }
}

async fn log_banner(port: u16) {
    info!("pocketmq broker for air quality sensors");
    info!("Broker will be available at:");
    info!("  - localhost:{}", port);
    info!("  - 127.0.0.1:{}", port);
    match local_ip().await {
        Some(ip) => {
            info!("  - {}:{}", ip, port);
            info!("Point sensors at MQTT_SERVER = \"{}\"", ip);
        }
        None => warn!("Could not determine a LAN address"),
    }
    info!("Press Ctrl+C to stop the broker");
}

/// LAN address of this host, found by routing a UDP socket (nothing is sent).
async fn local_ip() -> Option<std::net::IpAddr> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("8.8.8.8:80").await.ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// Logs every publish the broker receives.
struct SensorLogger;

impl Handler for SensorLogger {
    fn handle(&self, _client_id: &str, seq: u64, msg: &Message) {
        info!("{}", summarize(seq, msg));
    }
}

/// One-line summary of a publish.
///
/// Sensor readings carrying `pm2_5_atm` show the reading; anything else shows
/// the topic and the start of the payload.
fn summarize(seq: u64, msg: &Message) -> String {
    if let Ok(Value::Object(reading)) = serde_json::from_slice::<Value>(&msg.payload) {
        if let Some(pm25) = reading.get("pm2_5_atm") {
            return format!("PM2.5: {} μg/m³ (msg #{})", pm25, seq);
        }
    }

    let end = msg.payload.len().min(PREVIEW_LEN);
    let preview = String::from_utf8_lossy(&msg.payload[..end]);
    format!("Received on {}: {}...", msg.topic, preview)
}

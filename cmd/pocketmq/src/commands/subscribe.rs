//! Subscribe command.

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Local};
use clap::Args;
use tracing::debug;

use pocketmq::Message;

use super::{connect, default_client_id, load_settings, print_success};
use crate::Cli;

/// Idle time after which a PINGREQ is sent (half the client keep alive).
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Subscribe to topics and print each message.
#[derive(Args)]
pub struct SubCommand {
    /// Topics to subscribe to
    #[arg(required = true)]
    topics: Vec<String>,

    /// Broker host (default MQTT_BROKER_IP or 127.0.0.1)
    #[arg(long)]
    host: Option<String>,

    /// Broker port (default MQTT_BROKER_PORT or 1883)
    #[arg(short, long)]
    port: Option<u16>,

    /// Client ID
    #[arg(long)]
    client_id: Option<String>,
}

impl SubCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let mut settings = load_settings(cli)?;
        if let Some(ref host) = self.host {
            settings.broker_host = host.clone();
        }
        if let Some(port) = self.port {
            settings.port = port;
        }

        let addr = settings.broker_addr();
        let client_id = self.client_id.clone().unwrap_or_else(|| default_client_id("pocketmq-sub"));
        let client = connect(&addr, &client_id).await?;

        for topic in &self.topics {
            client
                .subscribe(topic)
                .await
                .with_context(|| format!("failed to subscribe to {}", topic))?;
            print_success(&format!("Subscribed to {}", topic));
        }

        loop {
            tokio::select! {
                received = client.recv_timeout(PING_INTERVAL) => {
                    match received.context("connection lost")? {
                        Some(msg) => println!("{}", format_line(Local::now(), &msg)),
                        None => {
                            debug!("Idle, sending ping");
                            client.ping().await?;
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        client.disconnect().await?;
        Ok(())
    }
}

/// `HH:MM:SS topic payload`, with JSON objects re-rendered compactly.
fn format_line(now: DateTime<Local>, msg: &Message) -> String {
    let payload = match msg.payload.first() {
        Some(b'{') => match serde_json::from_slice::<serde_json::Value>(&msg.payload) {
            Ok(value) => value.to_string(),
            Err(_) => String::from_utf8_lossy(&msg.payload).into_owned(),
        },
        _ => String::from_utf8_lossy(&msg.payload).into_owned(),
    };
    format!("{} {} {}", now.format("%H:%M:%S"), msg.topic, payload)
}

//! Publish command.

use anyhow::Context;
use clap::Args;

use super::{connect, default_client_id, load_settings, print_success};
use crate::Cli;

/// Publish one QoS 0 message.
#[derive(Args)]
pub struct PubCommand {
    /// Topic to publish to
    topic: String,

    /// Message payload
    message: String,

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

impl PubCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let mut settings = load_settings(cli)?;
        if let Some(ref host) = self.host {
            settings.broker_host = host.clone();
        }
        if let Some(port) = self.port {
            settings.port = port;
        }

        let addr = settings.broker_addr();
        let client_id = self.client_id.clone().unwrap_or_else(|| default_client_id("pocketmq-pub"));
        let client = connect(&addr, &client_id).await?;

        client
            .publish(&self.topic, self.message.clone().into_bytes())
            .await
            .with_context(|| format!("failed to publish to {}", self.topic))?;
        client.disconnect().await?;

        print_success(&format!(
            "Published {} bytes to {} on {}",
            self.message.len(),
            self.topic,
            addr
        ));
        Ok(())
    }
}

//! Broker diagnostics command.

use std::time::Duration;

use chrono::Utc;
use clap::Args;
use tokio::net::TcpStream;

use pocketmq::{Client, ClientConfig};

use super::{default_client_id, load_settings, print_error, print_success};
use crate::Cli;

/// Topic used for the round-trip test.
const DEFAULT_TOPIC: &str = "airquality/sensor/data";

/// Probe brokers and report which ones work.
///
/// For each target: (1) TCP port probe, (2) MQTT CONNECT, (3) a
/// publish/subscribe round trip with a test sensor reading.
#[derive(Args)]
pub struct CheckCommand {
    /// Targets as host:port (default: configured broker, localhost and 127.0.0.1)
    targets: Vec<String>,

    /// Topic for the round-trip test
    #[arg(long, default_value = DEFAULT_TOPIC)]
    topic: String,

    /// Timeout per step in seconds
    #[arg(long, default_value_t = 3)]
    timeout: u64,
}

/// Result of checking one target.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Outcome {
    port_open: bool,
    connected: bool,
    round_trip: bool,
}

impl Outcome {
    fn working(&self) -> bool {
        self.connected
    }
}

impl CheckCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let settings = load_settings(cli)?;
        let targets = if self.targets.is_empty() {
            default_targets(&settings.broker_addr(), settings.port)
        } else {
            self.targets.clone()
        };
        let timeout = Duration::from_secs(self.timeout.max(1));

        println!("MQTT Diagnostics");
        println!("================");

        let mut working = Vec::new();
        for target in &targets {
            println!("\n--- Testing {} ---", target);
            let outcome = check_target(target, &self.topic, timeout).await;
            if outcome.working() {
                working.push(target.clone());
            }
        }

        println!("\n{}", "=".repeat(50));
        println!("RESULTS:");
        if working.is_empty() {
            print_error("No MQTT broker found");
            println!("Start one with: pocketmq serve");
            println!("Make sure port {} is not blocked by a firewall", settings.port);
            anyhow::bail!("no working broker among {} target(s)", targets.len());
        }

        print_success("Found MQTT broker(s) at:");
        for target in &working {
            println!("  - {}", target);
        }
        println!("\nPoint your tools at: MQTT_BROKER_IP={}", host_of(&working[0]));
        Ok(())
    }
}

/// Configured broker first, then the local addresses, without duplicates.
fn default_targets(configured: &str, port: u16) -> Vec<String> {
    let mut targets = vec![configured.to_string()];
    for host in ["localhost", "127.0.0.1"] {
        let target = format!("{}:{}", host, port);
        if !targets.contains(&target) {
            targets.push(target);
        }
    }
    targets
}

fn host_of(target: &str) -> &str {
    target.rsplit_once(':').map(|(host, _)| host).unwrap_or(target)
}

async fn check_target(target: &str, topic: &str, timeout: Duration) -> Outcome {
    let mut outcome = Outcome::default();

    println!("1. Testing TCP connection to {}", target);
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(_)) => {
            outcome.port_open = true;
            print_success(&format!("Port is open on {}", target));
        }
        Ok(Err(e)) => {
            print_error(&format!("Port is NOT open on {}: {}", target, e));
            return outcome;
        }
        Err(_) => {
            print_error(&format!("Timed out connecting to {}", target));
            return outcome;
        }
    }

    println!("2. Testing MQTT connection");
    let config = ClientConfig::new(target, default_client_id("pocketmq-check")).with_connect_timeout(timeout);
    let client = match Client::connect(config).await {
        Ok(client) => {
            outcome.connected = true;
            print_success("Connected to MQTT broker");
            client
        }
        Err(e) => {
            print_error(&format!("MQTT connection failed: {}", e));
            return outcome;
        }
    };

    println!("3. Testing publish/subscribe on {}", topic);
    match round_trip(&client, topic, timeout).await {
        Ok(true) => {
            outcome.round_trip = true;
            print_success("Received the test message back");
        }
        Ok(false) => print_error("Test message was not received"),
        Err(e) => print_error(&format!("Round trip failed: {}", e)),
    }

    let _ = client.disconnect().await;
    outcome
}

async fn round_trip(client: &Client, topic: &str, timeout: Duration) -> anyhow::Result<bool> {
    let payload = test_reading(Utc::now().timestamp_millis());
    client.subscribe(topic).await?;
    client.publish(topic, payload.clone().into_bytes()).await?;

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        match client.recv_timeout(remaining).await? {
            Some(msg) if msg.topic == topic && msg.payload.as_ref() == payload.as_bytes() => {
                return Ok(true);
            }
            Some(_) => continue,
            None => return Ok(false),
        }
    }
}

/// Test sensor reading, small enough for a single-byte remaining length.
fn test_reading(timestamp_ms: i64) -> String {
    serde_json::json!({
        "timestamp": timestamp_ms,
        "device_id": "test_device",
        "pm1_0_atm": 10,
        "pm2_5_atm": 15,
        "pm10_atm": 20,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_targets() {
        assert_eq!(
            default_targets("127.0.0.1:1883", 1883),
            vec!["127.0.0.1:1883", "localhost:1883"]
        );
        assert_eq!(
            default_targets("192.168.1.114:1883", 1883),
            vec!["192.168.1.114:1883", "localhost:1883", "127.0.0.1:1883"]
        );
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("192.168.1.114:1883"), "192.168.1.114");
        assert_eq!(host_of("localhost"), "localhost");
    }

    #[test]
    fn test_reading_fits_single_packet() {
        let payload = test_reading(1_760_000_000_000);
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["pm2_5_atm"], 15);

        let packet = pocketmq::protocol::create_publish(DEFAULT_TOPIC, payload.into_bytes());
        assert!(packet.check_size().is_ok());
    }

    #[tokio::test]
    async fn test_check_against_running_broker() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let broker = pocketmq::Broker::new(pocketmq::BrokerConfig::new(&addr));
        tokio::spawn(async move {
            let _ = broker.serve_listener(listener).await;
        });

        let outcome = check_target(&addr, DEFAULT_TOPIC, Duration::from_secs(2)).await;
        assert_eq!(
            outcome,
            Outcome { port_open: true, connected: true, round_trip: true }
        );
    }

    #[tokio::test]
    async fn test_check_closed_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let outcome = check_target(&addr, DEFAULT_TOPIC, Duration::from_secs(1)).await;
        assert!(!outcome.port_open);
        assert!(!outcome.working());
    }
}

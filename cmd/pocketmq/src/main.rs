//! pocketmq CLI - run the broker and talk to it.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{CheckCommand, PubCommand, ServeCommand, SubCommand};

/// pocketmq - a tiny MQTT broker for sensor networks.
///
/// The broker speaks a QoS 0 subset of MQTT 3.1.1 with exact-match topics.
/// The client commands work against any MQTT broker as long as packets stay
/// below 128 bytes.
///
/// Settings are read from ~/.pocketmq/config.yaml when present, then from
/// MQTT_BROKER_IP and MQTT_BROKER_PORT, then from command-line flags.
#[derive(Parser)]
#[command(name = "pocketmq")]
#[command(about = "Tiny QoS 0 MQTT broker and tools")]
#[command(version)]
pub struct Cli {
    /// Config file (default is ~/.pocketmq/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the broker
    Serve(ServeCommand),
    /// Publish one message
    Pub(PubCommand),
    /// Subscribe and print messages
    Sub(SubCommand),
    /// Diagnose broker reachability
    Check(CheckCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG takes precedence over -v.
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match &cli.command {
        Commands::Serve(cmd) => cmd.run(&cli).await,
        Commands::Pub(cmd) => cmd.run(&cli).await,
        Commands::Sub(cmd) => cmd.run(&cli).await,
        Commands::Check(cmd) => cmd.run(&cli).await,
    }
}

//! Shared helpers for CLI commands.

use anyhow::Context;
use pocketmq::{Client, ClientConfig};

use crate::Cli;
use crate::config::{self, Settings};

/// Loads settings honoring the global `--config` flag.
pub fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    config::load_settings(cli.config.as_deref())
}

/// Client ID used when none is given: `<prefix>-<pid>`.
pub fn default_client_id(prefix: &str) -> String {
    format!("{}-{}", prefix, std::process::id())
}

/// Connects a client, adding the address to any error.
pub async fn connect(addr: &str, client_id: &str) -> anyhow::Result<Client> {
    Client::connect(ClientConfig::new(addr, client_id))
        .await
        .with_context(|| format!("failed to connect to {}", addr))
}

/// Prints success message.
pub fn print_success(msg: &str) {
    eprintln!("\x1b[32m✓\x1b[0m {}", msg);
}

/// Prints error message.
pub fn print_error(msg: &str) {
    eprintln!("\x1b[31m✗\x1b[0m {}", msg);
}

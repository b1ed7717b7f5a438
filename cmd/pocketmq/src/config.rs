//! Settings for the pocketmq CLI.
//!
//! Layered from lowest to highest precedence: built-in defaults, the YAML
//! file, environment variables, then command-line flags (applied by each
//! command).

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Default base configuration directory name.
pub const DEFAULT_BASE_DIR: &str = ".pocketmq";
/// Default configuration filename.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Environment variable naming the broker host for client commands.
pub const ENV_BROKER_IP: &str = "MQTT_BROKER_IP";
/// Environment variable naming the broker port.
pub const ENV_BROKER_PORT: &str = "MQTT_BROKER_PORT";

/// CLI settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Host the broker binds to.
    pub bind_host: String,
    /// Host client commands connect to.
    pub broker_host: String,
    /// Broker port, for both serving and connecting.
    pub port: u16,
    /// Outbound queue capacity per session.
    pub queue_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            broker_host: "127.0.0.1".to_string(),
            port: 1883,
            queue_capacity: pocketmq::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl Settings {
    /// Returns the default config path (~/.pocketmq/config.yaml).
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(DEFAULT_BASE_DIR).join(DEFAULT_CONFIG_FILE))
    }

    /// Load settings from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let settings = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(settings)
    }

    /// Override fields from environment variables looked up with `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_BROKER_IP).filter(|h| !h.is_empty()) {
            self.broker_host = host;
        }
        if let Some(port) = lookup(ENV_BROKER_PORT).filter(|p| !p.is_empty()) {
            self.port = port
                .trim()
                .parse()
                .with_context(|| format!("invalid {}: {}", ENV_BROKER_PORT, port))?;
        }
        Ok(())
    }

    /// Address the broker listens on.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    /// Address client commands connect to.
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.broker_host, self.port)
    }
}

/// Loads settings: defaults, then the config file, then the environment.
///
/// An explicit `custom_path` must exist; the default path is optional.
pub fn load_settings(custom_path: Option<&str>) -> anyhow::Result<Settings> {
    let mut settings = match custom_path {
        Some(p) => Settings::from_file(Path::new(p))?,
        None => match Settings::default_config_path() {
            Some(path) if path.exists() => Settings::from_file(&path)?,
            _ => Settings::default(),
        },
    };

    settings.apply_env(|key| std::env::var(key).ok())?;
    Ok(settings)
}

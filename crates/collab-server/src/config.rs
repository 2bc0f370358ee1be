//! Configuration loading and management

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main configuration for the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path the relay endpoint is mounted on (GET subscribes, POST publishes)
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Frames buffered per subscriber before new ones are dropped
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    /// Interval between SSE keep-alive comments
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Largest accepted POST body in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Who encrypts frames
    #[serde(default)]
    pub boundary: EncryptionBoundary,
}

/// Where the encryption boundary sits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionBoundary {
    /// Clients seal frames end-to-end; the relay forwards opaque bodies.
    #[default]
    Client,
    /// Clients post plain envelopes; the relay reads them, keeps the latest
    /// room state and answers snapshot requests from it.
    Server,
}

fn default_base_path() -> String {
    "/collab".to_string()
}

fn default_subscriber_buffer() -> usize {
    256
}

fn default_keep_alive_secs() -> u64 {
    15
}

fn default_max_frame_bytes() -> usize {
    8 * 1024 * 1024 // 8 MiB
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            subscriber_buffer: default_subscriber_buffer(),
            keep_alive_secs: default_keep_alive_secs(),
            max_frame_bytes: default_max_frame_bytes(),
            boundary: EncryptionBoundary::default(),
        }
    }
}

impl Config {
    /// Load configuration from the config directory
    pub fn load(config_path: &str) -> Result<Self> {
        let config_file = Path::new(config_path).join("config.json");

        if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| "Failed to parse config.json")?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            config.validate()?;
            Ok(config)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_file
            );
            let config = Config::default();

            std::fs::create_dir_all(config_path)
                .with_context(|| format!("Failed to create config directory: {}", config_path))?;

            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(&config_file, content)
                .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
            tracing::info!("Created default config at {:?}", config_file);

            Ok(config)
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.base_path.starts_with('/') {
            anyhow::bail!("base_path must start with '/': {:?}", self.base_path);
        }
        if self.subscriber_buffer == 0 {
            anyhow::bail!("subscriber_buffer must be at least 1");
        }
        if self.keep_alive_secs == 0 {
            anyhow::bail!("keep_alive_secs must be at least 1");
        }
        Ok(())
    }
}

//! Engine configuration.
//!
//! Stored as TOML. Every key is optional:
//!
//! ```toml
//! chunk_size = 524288
//! connect_timeout_ms = 5000
//!
//! [balancer]
//! speed_threshold = 0.15
//! migration_cap = 10
//!
//! [[balancer.split]]
//! channel = "wired"
//! fraction = 0.65
//! initial_speed = 35.0
//!
//! [[balancer.split]]
//! channel = "wireless"
//! fraction = 0.35
//! initial_speed = 20.0
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use multilink_data_channel::{MAX_CHUNK_SIZE, SenderConfig};
use multilink_transfer::{BalancerConfig, DEFAULT_CHUNK_SIZE};

use crate::error::CoordinatorError;

/// Tunables for a transfer session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bytes per chunk; raised to the 64 KiB floor when smaller.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Payload bytes written between progress reports.
    #[serde(default = "default_write_block_size")]
    pub write_block_size: usize,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Sender sleep when its queue is empty.
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,

    /// Period of the background rebalance (0 = disabled).
    #[serde(default = "default_rebalance_interval_ms")]
    pub rebalance_interval_ms: u64,

    /// Period of progress notifications and of the completion poll.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// How long close waits for a sender stuck in a write.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default)]
    pub balancer: BalancerConfig,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_write_block_size() -> usize {
    multilink_data_channel::DEFAULT_WRITE_BLOCK_SIZE
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_idle_backoff_ms() -> u64 {
    50
}

fn default_rebalance_interval_ms() -> u64 {
    1_000
}

fn default_progress_interval_ms() -> u64 {
    500
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            write_block_size: default_write_block_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_backoff_ms: default_idle_backoff_ms(),
            rebalance_interval_ms: default_rebalance_interval_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            balancer: BalancerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads the configuration at `path`, or the defaults if there is no
    /// file there.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoordinatorError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| CoordinatorError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Writes the configuration as TOML, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CoordinatorError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| CoordinatorError::Config(e.to_string()))?;
        std::fs::write(path, content)?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(CoordinatorError::Config(format!(
                "chunk_size {} exceeds the {MAX_CHUNK_SIZE} byte frame limit",
                self.chunk_size
            )));
        }
        if self.write_block_size == 0 {
            return Err(CoordinatorError::Config("write_block_size must be positive".into()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(CoordinatorError::Config("connect_timeout_ms must be positive".into()));
        }
        if self.idle_backoff_ms == 0 {
            return Err(CoordinatorError::Config("idle_backoff_ms must be positive".into()));
        }
        if self.progress_interval_ms == 0 {
            return Err(CoordinatorError::Config("progress_interval_ms must be positive".into()));
        }
        self.balancer.validate()?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `None` when background rebalancing is disabled.
    pub fn rebalance_interval(&self) -> Option<Duration> {
        (self.rebalance_interval_ms > 0).then(|| Duration::from_millis(self.rebalance_interval_ms))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn sender_config(&self) -> SenderConfig {
        SenderConfig {
            block_size: self.write_block_size,
            idle_backoff: Duration::from_millis(self.idle_backoff_ms),
        }
    }
}

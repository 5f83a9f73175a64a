//! Configuration management for convey.
//!
//! This module handles loading, saving, and managing configuration for both
//! the server and client components. Configuration is stored in TOML format.
//! All credit amounts are counted in whole chunks.

use crate::error::UploadError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// Protocol constants
pub const DEFAULT_PORT: u16 = 8889;
// Preferred server-wide chunk size. Larger chunks reduce protocol overhead
// but increase the memory held per credit.
pub const DEFAULT_CHUNK_SIZE: u32 = 256 * 1024;
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;
pub const DEFAULT_MAX_QUEUE: u32 = 64;

// Credit accounting constants (in chunks)
pub const DEFAULT_CREDIT_BUDGET: u32 = 512;
pub const DEFAULT_CREDIT_LOW_WATERMARK: u32 = 256;
pub const DEFAULT_TOPUP_THRESHOLD: u32 = 32;

// Timeout constants
pub const DEFAULT_INACTIVITY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RETRY_COUNT: u32 = 5;
pub const DEFAULT_IDLE_ABORT_SECS: u64 = 300;
pub const DEFAULT_PROBE_LIMIT: u32 = 5;
pub const DEFAULT_STATUS_LOG_SECS: u64 = 60;
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;

/// Maximum filename length accepted by the server, in UTF-8 bytes.
pub const MAX_FILENAME_BYTES: usize = 256;

/// Main configuration structure containing both endpoint configurations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server-specific configuration.
    pub server: ServerConfig,
    /// Client-specific configuration.
    pub client: ClientConfig,
}

/// Configuration for the upload server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    /// Directory holding partial uploads; files here are never delivered.
    pub staging_dir: PathBuf,
    /// Directory where finished files and their sidecars are promoted to.
    pub destination_dir: PathBuf,
    /// Directory of approved client key files.
    pub authorized_keys_dir: PathBuf,
    pub chunk_size: u32,
    /// Per-upload credit ceiling.
    pub max_queue: u32,
    /// Global credit budget across all uploads, in chunks.
    pub credit_budget: u32,
    /// Distribution runs whenever outstanding credit falls below this.
    pub credit_low_watermark: u32,
    /// Uploads holding at least this much credit are skipped by top-ups.
    pub topup_threshold: u32,
    /// Seconds of silence before an upload is probed with a status report.
    pub probe_idle_secs: u64,
    /// Unanswered probes before the upload is cancelled with a timeout.
    pub probe_limit: u32,
    /// Hard ceiling on upload inactivity before abort.
    pub idle_abort_secs: u64,
    /// Interval for the periodic status log line.
    pub status_log_secs: u64,
    /// Metadata fields every upload must carry; empty accepts anything.
    pub required_meta: Vec<String>,
}

/// Configuration for the upload client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Path to the client key file (`<key-id>:<hex-secret>`).
    pub key_file: PathBuf,
    /// Seconds of silence before the client probes with `query-status`.
    pub inactivity_timeout_secs: u64,
    /// Consecutive unanswered status probes before giving up.
    pub retry_count: u32,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub progress_bar: bool,
}

impl Config {
    /// Loads configuration from a file, or creates a new default
    /// configuration if the file doesn't exist.
    pub fn load_or_create(path: &Path) -> Result<Self, UploadError> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to a file in TOML format.
    pub fn save(&self, path: &Path) -> Result<(), UploadError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            staging_dir: PathBuf::from("./staging"),
            destination_dir: PathBuf::from("./incoming"),
            authorized_keys_dir: PathBuf::from("./authorized_keys"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_queue: DEFAULT_MAX_QUEUE,
            credit_budget: DEFAULT_CREDIT_BUDGET,
            credit_low_watermark: DEFAULT_CREDIT_LOW_WATERMARK,
            topup_threshold: DEFAULT_TOPUP_THRESHOLD,
            probe_idle_secs: DEFAULT_INACTIVITY_TIMEOUT_SECS,
            probe_limit: DEFAULT_PROBE_LIMIT,
            idle_abort_secs: DEFAULT_IDLE_ABORT_SECS,
            status_log_secs: DEFAULT_STATUS_LOG_SECS,
            required_meta: Vec::new(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            key_file: PathBuf::from("./client.key"),
            inactivity_timeout_secs: DEFAULT_INACTIVITY_TIMEOUT_SECS,
            retry_count: DEFAULT_RETRY_COUNT,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            progress_bar: true,
        }
    }
}

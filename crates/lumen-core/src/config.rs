//! Configuration system for Lumen.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $LUMEN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/lumen/config.toml
//!   3. ~/.config/lumen/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LumenConfig {
    pub retrieve: RetrieveConfig,
    pub score: ScoreConfig,
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieveConfig {
    /// Distinct peers tried before a fetch fails with RetriesExhausted.
    pub max_attempts: u32,
    /// How long one peer gets to answer one request.
    pub request_timeout_ms: u64,
    /// Consecutive timeouts after which a peer is unregistered.
    pub timeout_eviction_threshold: u32,
    /// Absolute deadline used by the ODR helpers.
    pub default_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreConfig {
    /// Quality a never-observed peer starts with. Range 0..=1.
    pub initial: f64,
    /// Weight of the newest observation in the moving average.
    pub alpha: f64,
    /// Timeouts count this many times as heavy as a rejection.
    pub timeout_weight: f64,
    /// Round trip at which a success earns only half the credit.
    pub slow_rtt_ms: u64,
    /// Active servers below this quality are evicted.
    pub floor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Handshakes and trial requests allowed in flight at once.
    pub max_concurrent_dials: usize,
    /// Stop pulling from discovery once this many servers are active.
    pub target_active: usize,
    /// Servers announcing an older protocol are discarded.
    pub min_protocol_version: u32,
    pub dial_timeout_ms: u64,
    pub trial_timeout_ms: u64,
    /// Exponential back-off applied to addresses that failed admission.
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_steps: usize,
    pub maintenance_interval_ms: u64,
    /// Where known-good servers are remembered. Unset = no persistence.
    pub persist_path: Option<PathBuf>,
    /// Static candidates, `hexid@host:port`.
    pub bootnodes: Vec<String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for RetrieveConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            request_timeout_ms: 3_000,
            timeout_eviction_threshold: 3,
            default_timeout_ms: 10_000,
        }
    }
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            initial: 0.5,
            alpha: 0.2,
            timeout_weight: 2.0,
            slow_rtt_ms: 2_000,
            floor: 0.1,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_dials: 8,
            target_active: 25,
            min_protocol_version: 2,
            dial_timeout_ms: 5_000,
            trial_timeout_ms: 5_000,
            backoff_min_ms: 1_000,
            backoff_max_ms: 60_000,
            backoff_steps: 6,
            maintenance_interval_ms: 10_000,
            persist_path: Some(data_dir().join("servers.json")),
            bootnodes: Vec::new(),
        }
    }
}

impl RetrieveConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl ScoreConfig {
    pub fn slow_rtt(&self) -> Duration {
        Duration::from_millis(self.slow_rtt_ms)
    }
}

impl PoolConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn trial_timeout(&self) -> Duration {
        Duration::from_millis(self.trial_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("lumen")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("lumen")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl LumenConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            LumenConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse one config file without consulting the environment.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("LUMEN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&LumenConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply LUMEN_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("LUMEN_RETRIEVE__MAX_ATTEMPTS") {
            self.retrieve.max_attempts = v;
        }
        if let Some(v) = env_parse("LUMEN_RETRIEVE__REQUEST_TIMEOUT_MS") {
            self.retrieve.request_timeout_ms = v;
        }
        if let Some(v) = env_parse("LUMEN_POOL__MAX_CONCURRENT_DIALS") {
            self.pool.max_concurrent_dials = v;
        }
        if let Some(v) = env_parse("LUMEN_POOL__MIN_PROTOCOL_VERSION") {
            self.pool.min_protocol_version = v;
        }
        if let Ok(v) = std::env::var("LUMEN_POOL__PERSIST_PATH") {
            self.pool.persist_path = if v.is_empty() {
                None
            } else {
                Some(PathBuf::from(v))
            };
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

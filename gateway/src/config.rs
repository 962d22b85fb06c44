//! Process configuration. Layered: compiled-in defaults, an optional TOML
//! file, then a handful of CLI flags for the values an operator commonly
//! overrides at boot. See `SPEC_FULL.md` §11.

use crate::error::ConfigError;
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which STT provider a session should use.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderSelection {
    Auto,
    Named(String),
}

impl Default for ProviderSelection {
    fn default() -> Self {
        ProviderSelection::Auto
    }
}

/// Per-provider connection details.
#[derive(Debug, Clone, Deserialize)]
pub struct SttEndpointConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub bind_port: u16,

    pub default_stt_provider: ProviderSelection,
    pub stt_endpoints_per_provider: HashMap<String, SttEndpointConfig>,

    pub lock_store_path: PathBuf,
    pub conversation_store_path: PathBuf,

    pub inactivity_timeout_s: u64,
    pub heartbeat_interval_s: u64,
    pub usage_interval_s: u64,
    pub monitor_interval_s: u64,

    pub conversation_timeout_min_s: u64,
    pub conversation_timeout_max_s: u64,

    pub profile_window_padding_s: f64,

    #[serde(with = "duration_secs_vec")]
    pub stt_retry_backoff: Vec<Duration>,

    pub lock_wait_conversation_s: u64,
    pub lock_lease_conversation_s: u64,
    pub lock_wait_user_s: u64,
    pub lock_lease_user_s: u64,

    pub merge_coalesce_gap_s: f64,
    pub max_concurrent_translations: usize,
    pub silent_user_threshold_s: u64,

    pub speech_profile_storage_root: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: "[::]".to_string(),
            bind_port: 8001,
            default_stt_provider: ProviderSelection::Auto,
            stt_endpoints_per_provider: HashMap::new(),
            lock_store_path: PathBuf::from("transcription-core-locks.db"),
            conversation_store_path: PathBuf::from("transcription-core.db"),
            inactivity_timeout_s: 30,
            heartbeat_interval_s: 10,
            usage_interval_s: 60,
            monitor_interval_s: 5,
            conversation_timeout_min_s: 120,
            conversation_timeout_max_s: 14400,
            profile_window_padding_s: 5.0,
            stt_retry_backoff: vec![
                Duration::from_millis(100),
                Duration::from_millis(500),
                Duration::from_secs(2),
            ],
            lock_wait_conversation_s: 60,
            lock_lease_conversation_s: 120,
            lock_wait_user_s: 30,
            lock_lease_user_s: 60,
            merge_coalesce_gap_s: 0.5,
            max_concurrent_translations: 4,
            silent_user_threshold_s: 900,
            speech_profile_storage_root: PathBuf::from("speech-profiles"),
        }
    }
}

impl ServerConfig {
    /// Loads defaults, overlays an optional TOML file, validates, and
    /// returns the fully resolved config. CLI overrides are applied by
    /// the caller (`main.rs`) after this returns, since they take highest
    /// precedence and don't need file I/O.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = ServerConfig::default();
        if let Some(path) = config_path {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.conversation_timeout_min_s > self.conversation_timeout_max_s {
            return Err(ConfigError::Invalid {
                field: "conversation_timeout_min_s",
                reason: "must be <= conversation_timeout_max_s".to_string(),
            });
        }
        if self.merge_coalesce_gap_s < 0.0 {
            return Err(ConfigError::Invalid {
                field: "merge_coalesce_gap_s",
                reason: "must be >= 0".to_string(),
            });
        }
        if self.max_concurrent_translations == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrent_translations",
                reason: "must be >= 1".to_string(),
            });
        }
        Ok(())
    }

    /// Clamps a client-requested conversation timeout into the configured
    /// bounds (§8 B1).
    pub fn clamp_conversation_timeout(&self, requested_s: u64) -> u64 {
        requested_s.clamp(self.conversation_timeout_min_s, self.conversation_timeout_max_s)
    }
}

mod duration_secs_vec {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs: Vec<f64> = Vec::deserialize(deserializer)?;
        Ok(secs.into_iter().map(Duration::from_secs_f64).collect())
    }
}

/// CLI flags for the handful of values an operator commonly overrides at
/// boot, following the teacher's `Args` shape.
#[derive(Parser, Debug)]
#[command(name = "transcription-gateway")]
pub struct Args {
    #[arg(long, help = "path to a TOML config file")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "address to listen on")]
    pub address: Option<String>,

    #[arg(short, long, help = "port to listen on")]
    pub port: Option<u16>,

    #[arg(long, help = "path to optional API token file for auth")]
    pub token_file: Option<PathBuf>,
}

impl Args {
    pub fn apply_overrides(&self, config: &mut ServerConfig) {
        if let Some(address) = &self.address {
            config.bind_address = address.clone();
        }
        if let Some(port) = self.port {
            config.bind_port = port;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn clamp_respects_bounds_b1() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.clamp_conversation_timeout(120), 120);
        assert_eq!(cfg.clamp_conversation_timeout(14399), 14399);
        assert_eq!(cfg.clamp_conversation_timeout(10), 120);
        assert_eq!(cfg.clamp_conversation_timeout(99999), 14400);
    }

    #[test]
    fn load_overlays_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "bind_port = 9100\nmerge_coalesce_gap_s = 0.25\n").unwrap();
        let cfg = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.bind_port, 9100);
        assert_eq!(cfg.merge_coalesce_gap_s, 0.25);
    }

    #[test]
    fn invalid_timeout_bounds_rejected() {
        let mut cfg = ServerConfig::default();
        cfg.conversation_timeout_min_s = 1000;
        cfg.conversation_timeout_max_s = 100;
        assert!(cfg.validate().is_err());
    }
}

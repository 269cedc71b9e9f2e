//! Client configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default P2P port of SPV-serving peers.
pub const DEFAULT_PORT: u16 = 20866;

/// TCP dial timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for a complete version/verack exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Keep-alive walk interval.
pub const INFO_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Idle multiplier: peers silent for INFO_UPDATE_INTERVAL times this are
/// disconnected.
pub const KEEP_ALIVE_TIMEOUT: u32 = 3;

/// How long a requested block may stay unanswered before re-requesting.
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(30);

/// Re-request attempts before a pending block is dropped.
pub const MAX_BLOCK_RETRIES: u32 = 3;

/// Handshake or misbehavior strikes before an address is discarded.
pub const MAX_PEER_STRIKES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network discriminator in every frame header.
    pub magic: u32,
    /// Seed peer addresses, `host:port`.
    pub seeds: Vec<String>,
    /// Port dialed when a seed omits one.
    pub port: u16,
    /// Target number of established outbound peers.
    pub min_outbound: usize,
    /// Hard cap on concurrent connections.
    pub max_connections: usize,
    /// Directory for the header, proof and ledger stores.
    pub data_dir: PathBuf,
    /// Bloom filter false positive rate.
    pub fp_rate: f64,
    /// Confirmations before a transaction is final.
    pub confirm_depth: u32,
    /// How far ahead a peer must claim to be before bulk sync starts.
    pub sync_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            magic: 0,
            seeds: Vec::new(),
            port: DEFAULT_PORT,
            min_outbound: 8,
            max_connections: 24,
            data_dir: PathBuf::from("spv_data"),
            fp_rate: 0.0005,
            confirm_depth: 6,
            sync_threshold: 1,
        }
    }
}

impl Config {
    pub fn new(magic: u32, seeds: Vec<String>) -> Self {
        Self {
            magic,
            seeds,
            ..Default::default()
        }
    }

    /// Load a JSON config file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Config =
            serde_json::from_str(&data).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic == 0 {
            return Err(Error::Config("magic number has not been set".to_string()));
        }
        if self.seeds.is_empty() {
            return Err(Error::Config("seeds list is empty".to_string()));
        }
        if !(0.0..1.0).contains(&self.fp_rate) || self.fp_rate == 0.0 {
            return Err(Error::Config(format!(
                "false positive rate {} out of range",
                self.fp_rate
            )));
        }
        Ok(())
    }

    /// Normalize a seed to `host:port`, appending the default port if none.
    pub fn seed_addr(&self, seed: &str) -> String {
        if seed.rfind(':').map(|i| i > 0).unwrap_or(false) {
            seed.to_string()
        } else {
            format!("{}:{}", seed, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.min_outbound, 8);
        assert_eq!(config.confirm_depth, 6);
        assert!((config.fp_rate - 0.0005).abs() < f64::EPSILON);
    }

    #[test]
    fn test_validate_rejects_zero_magic() {
        let config = Config::new(0, vec!["seed:20866".into()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_seeds() {
        let config = Config::new(7, Vec::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_seed_addr_appends_port() {
        let config = Config::new(7, vec!["node.example".into()]);
        assert_eq!(config.seed_addr("node.example"), "node.example:20866");
        assert_eq!(config.seed_addr("node.example:1234"), "node.example:1234");
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"magic": 7630401, "seeds": ["s1:20866"], "min_outbound": 2}"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.magic, 7_630_401);
        assert_eq!(config.min_outbound, 2);
        assert_eq!(config.port, DEFAULT_PORT);
    }
}

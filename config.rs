//! Configuration management with environment variable support.
//!
//! The engine only sees the [`Configuration`] capability trait. [`Config`] is the
//! file-backed implementation used by the command-line tool, loaded from JSON
//! and then overridden from the environment.
//!
//! ## Environment Variables
//!
//! - `CDOC_CONFIG`: Override config file path
//! - `CDOC_KDF_ITERATIONS`: PBKDF2 iterations for new password locks
//! - `CDOC_COMPRESS`: `1`/`true` to deflate the payload
//! - `CDOC_KEY_SERVER`: Default key server id for server-assisted locks

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::lock::MAX_KDF_ITERATIONS;

/// Environment variable names for configuration overrides
pub const ENV_CONFIG_PATH: &str = "CDOC_CONFIG";
pub const ENV_KDF_ITERATIONS: &str = "CDOC_KDF_ITERATIONS";
pub const ENV_COMPRESS: &str = "CDOC_COMPRESS";
pub const ENV_KEY_SERVER: &str = "CDOC_KEY_SERVER";

pub const DEFAULT_KDF_ITERATIONS: u32 = 65_535;
/// Writer output stays in memory up to this many bytes before spilling to a temp file
pub const DEFAULT_SPOOL_LIMIT: usize = 16 * 1024 * 1024;

const WEAK_KDF_ITERATIONS: u32 = 10_000;

/// Policy knobs a session consults. Every method has a default, so an
/// implementation only overrides what it cares about.
pub trait Configuration {
    fn kdf_iterations(&self) -> u32 {
        DEFAULT_KDF_ITERATIONS
    }

    fn compress_payload(&self) -> bool {
        false
    }

    fn spool_limit(&self) -> usize {
        DEFAULT_SPOOL_LIMIT
    }

    /// Key server used for server-assisted recipients that do not name one
    fn key_server(&self) -> Option<&str> {
        None
    }
}

/// All defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConfiguration;

impl Configuration for DefaultConfiguration {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub kdf_iterations: u32,
    pub compress: bool,
    pub spool_limit: usize,
    pub key_server: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            compress: false,
            spool_limit: DEFAULT_SPOOL_LIMIT,
            key_server: None,
        }
    }
}

impl Configuration for Config {
    fn kdf_iterations(&self) -> u32 {
        self.kdf_iterations
    }

    fn compress_payload(&self) -> bool {
        self.compress
    }

    fn spool_limit(&self) -> usize {
        self.spool_limit
    }

    fn key_server(&self) -> Option<&str> {
        self.key_server.as_deref()
    }
}

impl Config {
    /// Load config from file path
    pub fn load(path: &str) -> Result<Self> {
        let s =
            fs::read_to_string(path).with_context(|| format!("reading config file {}", path))?;
        let mut config: Config = serde_json::from_str(&s)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load config with environment variable overrides
    /// Priority: ENV vars > config file > defaults
    pub fn load_with_env(path: Option<&str>) -> Result<Self> {
        let config_path = path
            .map(String::from)
            .or_else(|| env::var(ENV_CONFIG_PATH).ok());

        let mut config = match config_path {
            Some(ref p) if Path::new(p).exists() => {
                info!(path = p, "loading config from file");
                let s = fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p))?;
                serde_json::from_str(&s).with_context(|| format!("parsing config file {}", p))?
            }
            _ => {
                debug!("using default configuration");
                Config::default()
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(iterations) = env::var(ENV_KDF_ITERATIONS) {
            debug!(iterations = %iterations, "overriding kdf_iterations from environment");
            self.kdf_iterations = iterations
                .trim()
                .parse()
                .with_context(|| format!("{} must be an integer", ENV_KDF_ITERATIONS))?;
        }

        if let Ok(compress) = env::var(ENV_COMPRESS) {
            debug!(compress = %compress, "overriding compress from environment");
            self.compress = matches!(compress.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        if let Ok(server) = env::var(ENV_KEY_SERVER) {
            debug!(key_server = %server, "overriding key_server from environment");
            self.key_server = Some(server).filter(|s| !s.trim().is_empty());
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.kdf_iterations == 0 {
            anyhow::bail!("kdf_iterations must be at least 1");
        }

        if self.kdf_iterations > MAX_KDF_ITERATIONS {
            anyhow::bail!("kdf_iterations must not exceed {}", MAX_KDF_ITERATIONS);
        }

        if self.spool_limit == 0 {
            anyhow::bail!("spool_limit must be at least 1 byte");
        }

        if self.kdf_iterations < WEAK_KDF_ITERATIONS {
            warn!(
                iterations = self.kdf_iterations,
                "kdf_iterations is low - password locks will be cheap to brute force"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_trait_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.kdf_iterations(), DefaultConfiguration.kdf_iterations());
        assert_eq!(cfg.spool_limit(), DefaultConfiguration.spool_limit());
        assert!(!cfg.compress_payload());
        assert!(cfg.key_server().is_none());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"compress": true}"#).expect("valid json");
        assert!(cfg.compress);
        assert_eq!(cfg.kdf_iterations, DEFAULT_KDF_ITERATIONS);
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let cfg = Config {
            kdf_iterations: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_excessive_iterations_rejected() {
        let cfg = Config {
            kdf_iterations: MAX_KDF_ITERATIONS + 1,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("cdoc.json");
        fs::write(&path, r#"{"kdf_iterations": 20000, "key_server": "ks1"}"#).expect("write");

        let cfg = Config::load(path.to_str().expect("utf8 path")).expect("load");
        assert_eq!(cfg.kdf_iterations, 20000);
        assert_eq!(cfg.key_server(), Some("ks1"));
    }
}

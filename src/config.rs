use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::budget::{DEFAULT_ENTRY_SIZE, DEFAULT_HEAP_FRACTION};
use crate::core::error::ConfigError;

/// Ciphertexts larger than this are written to a content file.
pub const DEFAULT_INLINE_THRESHOLD: usize = 64 * 1024;
pub const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 5;

/// Runtime configuration of the search subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchConfig {
    /// Directory holding `encryptedSearchIndex_<user>.sqlite3` files.
    pub index_dir: PathBuf,
    pub heap_fraction: f64,
    pub estimated_entry_size: u64,
    pub inline_content_threshold: usize,
    pub busy_timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            index_dir: default_index_dir(),
            heap_fraction: DEFAULT_HEAP_FRACTION,
            estimated_entry_size: DEFAULT_ENTRY_SIZE,
            inline_content_threshold: DEFAULT_INLINE_THRESHOLD,
            busy_timeout_secs: DEFAULT_BUSY_TIMEOUT_SECS,
        }
    }
}

fn default_index_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nevermail")
        .join("search")
}

fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nevermail")
        .join("search.json")
}

fn parse_var<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        Err(_) => Ok(None),
    }
}

impl SearchConfig {
    /// Read `path`. `Ok(None)` when the file does not exist.
    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(path).map_err(ConfigError::Read)?;
        let cfg: SearchConfig = serde_json::from_str(&data).map_err(ConfigError::Parse)?;
        Ok(Some(cfg))
    }

    pub fn load() -> Result<Option<Self>, ConfigError> {
        Self::load_from(&config_path())
    }

    /// Apply `NEVERMAIL_SEARCH_*` overrides on top of `self`.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(dir) = std::env::var("NEVERMAIL_SEARCH_DIR") {
            self.index_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse_var("NEVERMAIL_SEARCH_HEAP_FRACTION")? {
            self.heap_fraction = v;
        }
        if let Some(v) = parse_var("NEVERMAIL_SEARCH_ENTRY_SIZE")? {
            self.estimated_entry_size = v;
        }
        if let Some(v) = parse_var("NEVERMAIL_SEARCH_INLINE_THRESHOLD")? {
            self.inline_content_threshold = v;
        }
        if let Some(v) = parse_var("NEVERMAIL_SEARCH_BUSY_TIMEOUT")? {
            self.busy_timeout_secs = v;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.heap_fraction > 0.0 && self.heap_fraction <= 1.0) {
            return Err(ConfigError::Invalid {
                key: "heap_fraction",
                value: self.heap_fraction.to_string(),
            });
        }
        if self.estimated_entry_size == 0 {
            return Err(ConfigError::Invalid {
                key: "estimated_entry_size",
                value: "0".into(),
            });
        }
        Ok(())
    }

    /// Resolution order: config file (or defaults) → env var overrides → validation.
    pub fn resolve() -> Result<Self, ConfigError> {
        let base = match Self::load() {
            Ok(Some(cfg)) => {
                log::info!("Search config loaded from {}", config_path().display());
                cfg
            }
            Ok(None) => {
                log::debug!("No search config file, using defaults");
                SearchConfig::default()
            }
            Err(e) => {
                log::warn!("Search config file error: {}", e);
                return Err(e);
            }
        };
        let cfg = base.with_env_overrides()?;
        cfg.validate()?;
        log::debug!("Search config: {:?}", cfg);
        Ok(cfg)
    }
}

//! Engine configuration.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::PAGE_SIZE;

const KB: u64 = 1 << 10;
const MB: u64 = 1 << 20;
const GB: u64 = 1 << 30;

/// Configuration for opening or creating a store.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base path; the engine appends `.db`, `.log` and `.xid`.
    pub path: PathBuf,
    /// Bytes of memory handed to the page cache.
    pub memory: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("strata"),
            memory: 64 * MB, // 8192 pages
        }
    }
}

impl EngineConfig {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn with_memory(mut self, memory: u64) -> Self {
        self.memory = memory;
        self
    }

    /// Reads `STRATA_PATH` and `STRATA_MEMORY`, falling back to the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("STRATA_PATH") {
            config.path = PathBuf::from(path);
        }
        if let Ok(memory) = std::env::var("STRATA_MEMORY") {
            config.memory = parse_memory(&memory)?;
        }
        Ok(config)
    }

    /// Number of pages the page cache may hold at once.
    pub fn cache_pages(&self) -> usize {
        (self.memory / PAGE_SIZE as u64) as usize
    }

    pub fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut raw = self.path.clone().into_os_string();
        raw.push(suffix);
        PathBuf::from(raw)
    }
}

/// Parses sizes such as `64MB`, `512kb`, `1GB` or a bare byte count.
pub fn parse_memory(value: &str) -> Result<u64> {
    let invalid = || Error::InvalidMemory {
        value: value.to_string(),
    };
    let trimmed = value.trim();
    let upper = trimmed.to_ascii_uppercase();
    let (digits, unit) = if let Some(n) = upper.strip_suffix("KB") {
        (n, KB)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, MB)
    } else if let Some(n) = upper.strip_suffix("GB") {
        (n, GB)
    } else {
        (upper.as_str(), 1)
    };
    let n: u64 = digits.trim().parse().map_err(|_| invalid())?;
    n.checked_mul(unit).ok_or_else(invalid)
}

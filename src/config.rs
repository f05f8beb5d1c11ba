//! Runtime configuration for clients and servers.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::protocol::{DEFAULT_MSIZE, DEFAULT_VERSION, IOHDRSZ, MIN_MSIZE};

/// Configuration options shared by both ends of a connection.
///
/// Every field has a default, so a JSON document only needs the knobs it
/// changes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Largest frame offered (client) or accepted (server).
    pub msize: u32,
    /// Protocol version string exchanged in the handshake.
    pub version: String,
    /// Worker threads for request execution; 0 uses available parallelism.
    pub workers: usize,
    /// Identity a client attaches as.
    pub user: String,
    /// Namespace a client attaches to.
    pub namespace: String,
    /// Fail a client connection whose oldest request is older than this.
    pub watchdog_ms: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            msize: DEFAULT_MSIZE,
            version: DEFAULT_VERSION.to_string(),
            workers: 0,
            user: String::from("nobody"),
            namespace: String::new(),
            watchdog_ms: None,
        }
    }
}

impl Config {
    /// Parse a configuration from a JSON string.
    pub fn from_json(data: &str) -> Result<Self> {
        let cfg: Config = serde_json::from_str(data)?;
        Ok(cfg.normalized())
    }

    /// Load a configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let txt = std::fs::read_to_string(path)?;
        Self::from_json(&txt)
    }

    /// Configuration whose IO unit is exactly `iounit` bytes.
    pub fn with_iounit(iounit: u32) -> Self {
        Self {
            msize: iounit + IOHDRSZ,
            ..Self::default()
        }
        .normalized()
    }

    fn normalized(mut self) -> Self {
        self.msize = self.msize.max(MIN_MSIZE);
        self
    }

    /// Worker count with the "0 means all cores" rule applied.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn watchdog(&self) -> Option<Duration> {
        self.watchdog_ms.map(Duration::from_millis)
    }
}

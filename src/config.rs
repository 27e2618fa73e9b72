//! Session configuration.
//!
//! Loaded from TOML; every field is optional:
//!
//! ```toml
//! frame_size = 16384
//! max_frame_size = 65536
//! compression = true
//! max_header_block_size = 262144
//! drain_retry_ms = 10
//! pool_capacity = 64
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::compress::MAX_HEADER_BLOCK_SIZE;
use crate::context::{ContextBuilder, DEFAULT_POOL_CAPACITY};
use crate::error::{Error, Result};
use crate::frame::{DEFAULT_FRAME_SIZE, DEFAULT_MAX_FRAME_SIZE};

/// Connection settings loaded from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Initial buffer capacity of inbound frames, in bytes.
    pub frame_size: usize,

    /// Largest inbound frame accepted, header included.
    pub max_frame_size: usize,

    /// Deflate name/value blocks of control frames.
    pub compression: bool,

    /// Largest inflated header block accepted from the peer, in bytes.
    pub max_header_block_size: usize,

    /// How long a sender blocked on a non-blocking transport waits before
    /// trying to drain again.
    pub drain_retry_ms: u64,

    /// Idle frames kept per pool size class.
    pub pool_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            compression: true,
            max_header_block_size: MAX_HEADER_BLOCK_SIZE,
            drain_retry_ms: 10,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        self.builder().validate()
    }

    pub fn drain_retry(&self) -> Duration {
        Duration::from_millis(self.drain_retry_ms)
    }

    /// Builder seeded with these settings; executor and handler still to add.
    pub fn into_context_builder(self) -> ContextBuilder {
        self.builder()
    }

    fn builder(&self) -> ContextBuilder {
        ContextBuilder::default()
            .frame_size(self.frame_size)
            .max_frame_size(self.max_frame_size)
            .compression(self.compression)
            .max_header_block_size(self.max_header_block_size)
            .drain_retry(self.drain_retry())
            .pool_capacity(self.pool_capacity)
    }
}

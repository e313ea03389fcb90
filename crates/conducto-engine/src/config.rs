//! Engine configuration.
//!
//! Loaded from a TOML file or built programmatically; validated before the
//! engine starts. Every recognised option is a field here — unknown keys are
//! rejected at parse time.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which backend driver the engine attaches at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Simulated clock, no device.
    #[default]
    Null,
    /// Host audio device via cpal.
    System,
    /// Shared-memory block exchange with another process.
    Ipc,
}

impl BackendKind {
    /// Parse a backend name as used on the wire and the command line.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "null" => Some(Self::Null),
            "system" => Some(Self::System),
            "ipc" => Some(Self::Ipc),
            _ => None,
        }
    }

    /// Stable lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::System => "system",
            Self::Ipc => "ipc",
        }
    }
}

/// Errors from loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Could not read the file.
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    /// TOML syntax or unknown keys.
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// Block size must be a power of two in `32..=8192`.
    #[error("invalid block size {0} (must be a power of two in 32..=8192)")]
    InvalidBlockSize(usize),
    /// Sample rate out of range.
    #[error("invalid sample rate {0}")]
    InvalidSampleRate(u32),
}

/// Configuration options recognised by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Frames per block.
    pub block_size: usize,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Backend attached by `start()`.
    pub backend: BackendKind,
    /// Name of the shared-memory region for the ipc backend.
    pub shm_region: Option<String>,
    /// Enable per-node timing in Perf observer records.
    pub perf_trace: bool,
    /// Writer lock acquisition timeout in milliseconds.
    pub writer_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: 256,
            sample_rate: 44100,
            backend: BackendKind::Null,
            shm_region: None,
            perf_trace: false,
            writer_timeout_ms: 100,
        }
    }
}

impl EngineConfig {
    /// Load and validate a TOML config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check field ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !Self::block_size_ok(self.block_size) {
            return Err(ConfigError::InvalidBlockSize(self.block_size));
        }
        if self.sample_rate < 8000 || self.sample_rate > 192_000 {
            return Err(ConfigError::InvalidSampleRate(self.sample_rate));
        }
        Ok(())
    }

    /// Whether a block size is acceptable.
    pub fn block_size_ok(n: usize) -> bool {
        (32..=8192).contains(&n) && n.is_power_of_two()
    }
}

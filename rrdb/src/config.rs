//! Engine configuration.
//!
//! One JSON document configures the backend providers and the handle pool.
//! Every field has a default, so an empty object (or no file at all) yields
//! a working setup:
//!
//! ```json
//! {
//!   "default_backend": "MMAP",
//!   "active_backends": ["MMAP", "FILE", "LOCKED", "MEMORY"],
//!   "mmap": { "sync_period_secs": 300 },
//!   "locked": { "lock_wait_ms": 3000, "lock_retry_ms": 50 },
//!   "pool": { "capacity": 200 }
//! }
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result, ValidationError};

/// Default number of databases the pool keeps open.
pub const DEFAULT_POOL_CAPACITY: usize = 200;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Provider used for identifiers without a scheme.
    pub default_backend: String,
    /// Providers consulted, in order, for identifiers with a scheme.
    pub active_backends: Vec<String>,
    /// Memory-mapped provider settings.
    pub mmap: MmapConfig,
    /// Lock-guarded provider settings.
    pub locked: LockConfig,
    /// Handle pool settings.
    pub pool: PoolConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_backend: "MMAP".to_string(),
            active_backends: ["MMAP", "FILE", "LOCKED", "MEMORY"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            mmap: MmapConfig::default(),
            locked: LockConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

/// Settings for the memory-mapped provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MmapConfig {
    /// Seconds between background flushes.
    pub sync_period_secs: u64,
}

impl Default for MmapConfig {
    fn default() -> Self {
        Self {
            sync_period_secs: 300,
        }
    }
}

/// Settings for the lock-guarded provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Maximum wait for the file lock, in milliseconds.
    pub lock_wait_ms: u64,
    /// Pause between lock attempts, in milliseconds.
    pub lock_retry_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_wait_ms: 3000,
            lock_retry_ms: 50,
        }
    }
}

/// Settings for the handle pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of simultaneously open databases.
    pub capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] if the file cannot be read,
    /// [`ConfigError::Parse`] if it is not valid JSON for this type, and a
    /// validation error for out-of-range values.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Serialize`] or [`ConfigError::Save`].
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let data =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialize { source: e })?;
        fs::write(path, data).map_err(|e| ConfigError::Save {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(())
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidCapacity`] for a zero pool capacity.
    pub fn validate(&self) -> Result<()> {
        if self.pool.capacity == 0 {
            return Err(ValidationError::InvalidCapacity {
                capacity: self.pool.capacity,
            }
            .into());
        }
        Ok(())
    }
}

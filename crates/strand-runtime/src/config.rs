//! Runtime configuration (strand.toml)
//!
//! Every section is optional; missing keys fall back to the defaults below.
//!
//! ```toml
//! [fiber]
//! stack_size = 131072
//! pool_size = 64
//!
//! [reactor]
//! max_events = 256
//! max_wait_ms = 3000
//!
//! [timer]
//! rebase = "now"
//!
//! [workers.io]
//! thread_num = 4
//! worker_num = 2
//! ```

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Smallest fiber stack accepted by [`RuntimeConfig::validate`]
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// A value is out of range
    #[error("Invalid config: {0}")]
    ValidationError(String),
}

/// Top-level runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Fiber stacks and recycling
    pub fiber: FiberConfig,

    /// epoll reactor tuning
    pub reactor: ReactorConfig,

    /// Timer behaviour
    pub timer: TimerConfig,

    /// Named worker groups, see [`crate::WorkerManager`]
    pub workers: BTreeMap<String, WorkerSpec>,
}

/// `[fiber]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FiberConfig {
    /// Default stack size in bytes for new fibers
    pub stack_size: usize,

    /// Terminal fibers kept per scheduler for reuse
    pub pool_size: usize,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            stack_size: 128 * 1024,
            pool_size: 64,
        }
    }
}

/// `[reactor]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReactorConfig {
    /// Events collected by one `epoll_wait`
    pub max_events: usize,

    /// Upper bound for one `epoll_wait` when no timer is armed (None = block)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_wait_ms: Option<u64>,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_events: 256,
            max_wait_ms: None,
        }
    }
}

/// `[timer]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimerConfig {
    /// How recurring timers compute their next deadline
    pub rebase: TimerRebase,
}

/// Base a recurring timer's next deadline is computed from
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TimerRebase {
    /// `sweep time + interval`: lateness accumulates as drift
    #[default]
    Now,
    /// `previous deadline + interval`: fixed rate, missed periods are skipped
    Schedule,
}

/// One `[workers.<name>]` entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerSpec {
    /// OS threads per IoManager
    pub thread_num: usize,

    /// IoManagers in the group
    pub worker_num: usize,
}

impl Default for WorkerSpec {
    fn default() -> Self {
        Self {
            thread_num: 1,
            worker_num: 1,
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fiber.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "fiber.stack_size must be at least {} bytes, got {}",
                MIN_STACK_SIZE, self.fiber.stack_size
            )));
        }

        if self.reactor.max_events == 0 {
            return Err(ConfigError::ValidationError(
                "reactor.max_events must be greater than 0".to_string(),
            ));
        }

        if self.reactor.max_wait_ms == Some(0) {
            return Err(ConfigError::ValidationError(
                "reactor.max_wait_ms must be greater than 0 when set".to_string(),
            ));
        }

        for (name, spec) in &self.workers {
            if spec.thread_num == 0 || spec.worker_num == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "workers.{}: thread_num and worker_num must be at least 1",
                    name
                )));
            }
        }

        Ok(())
    }
}

static CURRENT: Lazy<RwLock<RuntimeConfig>> = Lazy::new(|| RwLock::new(RuntimeConfig::default()));

/// Snapshot of the process-wide configuration
pub fn current() -> RuntimeConfig {
    CURRENT.read().clone()
}

/// Default fiber stack size in bytes
pub fn fiber_stack_size() -> usize {
    CURRENT.read().fiber.stack_size
}

/// Replace the process-wide configuration.
///
/// Already running schedulers keep the values they were built with.
pub fn install(config: RuntimeConfig) -> Result<(), ConfigError> {
    config.validate()?;
    tracing::info!(
        stack_size = config.fiber.stack_size,
        max_events = config.reactor.max_events,
        workers = config.workers.len(),
        "runtime config installed"
    );
    *CURRENT.write() = config;
    Ok(())
}

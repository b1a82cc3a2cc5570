//! Runtime configuration
//!
//! Library defaults with environment overrides, adjustable through builder
//! setters, and fixed for the process by [`init`].
//!
//! ```rust,ignore
//! use greenlet_runtime::config::{self, RuntimeConfig};
//!
//! config::init(RuntimeConfig::from_env().stack_size(256 * 1024))?;
//! ```

use std::sync::OnceLock;

use greenlet_core::constants::{DEFAULT_MAX_NESTING_DEPTH, DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
use greenlet_core::env::env_get;
use greenlet_core::{kdebug, GreenletError, GreenletResult};

/// Settings shared by every thread's greenlet tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Stack size of each new greenlet, in bytes
    pub stack_size: usize,
    /// Bound on parent-chain walks
    pub max_nesting_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConfig {
    /// Library defaults, no environment
    pub fn new() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
        }
    }

    /// Defaults overridden by the environment:
    /// - `GREENLET_STACK_SIZE` - bytes per greenlet stack
    /// - `GREENLET_MAX_NESTING_DEPTH` - parent-chain bound
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("GREENLET_STACK_SIZE", DEFAULT_STACK_SIZE),
            max_nesting_depth: env_get("GREENLET_MAX_NESTING_DEPTH", DEFAULT_MAX_NESTING_DEPTH),
        }
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn max_nesting_depth(mut self, depth: usize) -> Self {
        self.max_nesting_depth = depth;
        self
    }

    pub fn validate(&self) -> GreenletResult<()> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(GreenletError::InvalidConfig("stack_size must be >= 16KB"));
        }
        if self.stack_size > (1 << 30) {
            return Err(GreenletError::InvalidConfig("stack_size must be <= 1GB"));
        }
        if self.max_nesting_depth == 0 {
            return Err(GreenletError::InvalidConfig("max_nesting_depth must be > 0"));
        }
        Ok(())
    }
}

static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Fix the process-wide configuration
///
/// Fails with `AlreadyInitialized` if [`init`] ran before or if [`get`]
/// already fixed the environment defaults.
pub fn init(config: RuntimeConfig) -> GreenletResult<()> {
    config.validate().map_err(GreenletError::raise)?;
    let mut fresh = false;
    CONFIG.get_or_init(|| {
        fresh = true;
        config
    });
    if !fresh {
        return Err(GreenletError::AlreadyInitialized.raise());
    }
    kdebug!("runtime config fixed: {:?}", get());
    Ok(())
}

/// The process-wide configuration, fixing `from_env()` on first use
pub fn get() -> &'static RuntimeConfig {
    CONFIG.get_or_init(|| {
        let config = RuntimeConfig::from_env();
        if config.validate().is_ok() {
            config
        } else {
            RuntimeConfig::new()
        }
    })
}

//! Runtime configuration
//!
//! Compile-time defaults with environment overrides, builder-style.
//!
//! Environment variables (all optional):
//! - `STRAND_STACK_SIZE` - fiber stack size in bytes
//! - `STRAND_MAX_EVENTS` - reactor batch size per poll
//! - `STRAND_CONNECT_TIMEOUT_MS` - default timeout for hooked `connect`
//! - `STRAND_DEBUG` - extra lifecycle logging

use std::sync::OnceLock;

use strand_core::env::{env_get, env_get_bool, env_get_opt};

mod defaults {
    pub const STACK_SIZE: usize = 128 * 1024;
    pub const MAX_EVENTS: usize = 256;
}

/// Runtime configuration shared by fibers and I/O managers.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Stack size for task fibers, in bytes. Rounded up to whole pages.
    pub stack_size: usize,
    /// Maximum ready descriptors harvested per reactor poll.
    pub max_events: usize,
    /// Default timeout applied by the hooked `connect`. `None` = no timeout.
    pub connect_timeout_ms: Option<u64>,
    /// Emit per-fiber lifecycle logging.
    pub debug_logging: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Compile-time defaults, no environment lookups.
    pub fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            max_events: defaults::MAX_EVENTS,
            connect_timeout_ms: None,
            debug_logging: false,
        }
    }

    /// Defaults with `STRAND_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("STRAND_STACK_SIZE", defaults::STACK_SIZE),
            max_events: env_get("STRAND_MAX_EVENTS", defaults::MAX_EVENTS),
            connect_timeout_ms: env_get_opt("STRAND_CONNECT_TIMEOUT_MS"),
            debug_logging: env_get_bool("STRAND_DEBUG", false),
        }
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: Option<u64>) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    /// Reject configurations the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_size < 16 * 1024 {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16KiB"));
        }
        if self.max_events == 0 {
            return Err(ConfigError::InvalidValue("max_events must be > 0"));
        }
        if self.max_events > 65536 {
            return Err(ConfigError::InvalidValue("max_events must be <= 65536"));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Process-wide configuration, read once from the environment.
pub fn runtime_config() -> &'static RuntimeConfig {
    static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();
    CONFIG.get_or_init(|| {
        let config = RuntimeConfig::from_env();
        config.validate().expect("invalid strand configuration");
        config
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(RuntimeConfig::new().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .stack_size(64 * 1024)
            .max_events(512)
            .connect_timeout_ms(Some(5000));
        assert_eq!(config.stack_size, 64 * 1024);
        assert_eq!(config.max_events, 512);
        assert_eq!(config.connect_timeout_ms, Some(5000));
    }

    #[test]
    fn test_validation_bounds() {
        assert!(RuntimeConfig::new().stack_size(1024).validate().is_err());
        assert!(RuntimeConfig::new().max_events(0).validate().is_err());
    }
}

//! Transfer engine configuration.

use std::time::Duration;

use crate::core::{DEBUGGING_ENV_VAR, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_INTERVAL};

/// Engine-wide retry and logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Deadline of each exchange step.
    pub retry_interval: Duration,

    /// Resends allowed after the first attempt of a step.
    pub max_retries: u32,

    /// Log every sent and received message at debug level.
    pub debugging: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            debugging: false,
        }
    }
}

impl TransferConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> TransferConfigBuilder {
        TransferConfigBuilder::new()
    }

    /// Defaults, with message logging turned on when
    /// `ITEM_TRANSFER_DEBUGGING=1` is set.
    pub fn from_env() -> Self {
        let flag = std::env::var(DEBUGGING_ENV_VAR).ok();
        Self::default().with_debugging_flag(flag.as_deref())
    }

    fn with_debugging_flag(mut self, flag: Option<&str>) -> Self {
        if let Some(value) = flag {
            self.debugging = value.trim() == "1";
        }
        self
    }
}

/// Builder for [`TransferConfig`].
#[derive(Debug, Default)]
pub struct TransferConfigBuilder {
    config: TransferConfig,
}

impl TransferConfigBuilder {
    /// Create a builder holding the defaults.
    pub fn new() -> Self {
        Self {
            config: TransferConfig::default(),
        }
    }

    /// Set the per-step deadline.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval = interval;
        self
    }

    /// Set the number of resends per step.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Enable or disable per-message logging.
    pub fn debugging(mut self, enabled: bool) -> Self {
        self.config.debugging = enabled;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> TransferConfig {
        self.config
    }
}

//! Configuration for the aio subsystem
//!
//! Sizes the request arrays, picks the backend and tunes the retry and merge
//! policies. Values can be built in code or loaded from a TOML file.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::common::config::{
    DEFAULT_BLOCK_SIZE, LONG_RETRY_DELAY, MAX_MERGE_RUN, PAGE_SIZE_SHIFT, READ_THREADS_SLEEP,
    RETRY_DELAY, STARVATION_AGE,
};
use crate::common::exception::ConfigError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AioConfig {
    // Array sizing
    pub slots_per_segment: usize,
    pub read_segments: usize,
    pub write_segments: usize,
    pub sync_slots: usize,

    // Request validation and merge policy
    pub block_size: usize,
    pub page_size_shift: u32,
    pub max_merge_run: usize,
    #[serde(with = "millis")]
    pub starvation_age: Duration,

    // Backend selection
    pub use_native_aio: bool,

    // Error policy
    pub fatal_on_unknown_error: bool,
    #[serde(with = "millis")]
    pub retry_delay: Duration,
    #[serde(with = "millis")]
    pub long_retry_delay: Duration,

    // Read-ahead batching
    #[serde(with = "millis")]
    pub read_threads_sleep: Duration,

    // Diagnostics
    pub print_debug: bool,
}

impl Default for AioConfig {
    fn default() -> Self {
        Self {
            slots_per_segment: 256,
            read_segments: 4,
            write_segments: 4,
            sync_slots: 100,

            block_size: DEFAULT_BLOCK_SIZE,
            page_size_shift: PAGE_SIZE_SHIFT,
            max_merge_run: MAX_MERGE_RUN,
            starvation_age: STARVATION_AGE,

            use_native_aio: false,

            fatal_on_unknown_error: true,
            retry_delay: RETRY_DELAY,
            long_retry_delay: LONG_RETRY_DELAY,

            read_threads_sleep: READ_THREADS_SLEEP,

            print_debug: false,
        }
    }
}

impl AioConfig {
    /// Loads a configuration from a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: AioConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Total number of global segments: insert buffer, log, reads and writes.
    pub fn total_segments(&self) -> usize {
        2 + self.read_segments + self.write_segments
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slots_per_segment == 0 {
            return Err(ConfigError::Invalid(
                "slots_per_segment must be greater than zero".to_string(),
            ));
        }
        if self.read_segments == 0 || self.write_segments == 0 {
            return Err(ConfigError::Invalid(
                "read_segments and write_segments must be greater than zero".to_string(),
            ));
        }
        if self.sync_slots == 0 {
            return Err(ConfigError::Invalid(
                "sync_slots must be greater than zero".to_string(),
            ));
        }
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "block_size {} must be a non-zero power of two",
                self.block_size
            )));
        }
        if self.max_merge_run == 0 {
            return Err(ConfigError::Invalid(
                "max_merge_run must be greater than zero".to_string(),
            ));
        }
        if self.page_size_shift >= 48 {
            return Err(ConfigError::Invalid(format!(
                "page_size_shift {} is out of range",
                self.page_size_shift
            )));
        }
        let largest = self
            .slots_per_segment
            .checked_mul(self.read_segments.max(self.write_segments));
        if largest.is_none() {
            return Err(ConfigError::Invalid(
                "array size overflows usize".to_string(),
            ));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

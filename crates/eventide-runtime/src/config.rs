//! Worker configuration.

use std::time::Duration;

use thiserror::Error;

/// Environment variable holding the continuous-query idle timeout.
pub const IDLE_TIMEOUT_ENV: &str = "EVENTIDE_IDLE_TIMEOUT_MS";

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Invalid worker configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The idle timeout is neither a number of milliseconds nor `off`/`none`.
    #[error("{var} must be a number of milliseconds, \"off\" or \"none\", got {value:?}")]
    InvalidIdleTimeout {
        /// The variable that was read.
        var: &'static str,
        /// The rejected value.
        value: String,
    },
}

/// Settings shared by every maintainer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// How long a caught-up maintainer waits before re-polling without a
    /// notification. `None` waits for notifications only.
    pub idle_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }
}

impl WorkerConfig {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let idle_timeout = match lookup(IDLE_TIMEOUT_ENV) {
            None => Some(DEFAULT_IDLE_TIMEOUT),
            Some(value) => parse_idle_timeout(&value)?,
        };
        Ok(Self { idle_timeout })
    }
}

fn parse_idle_timeout(value: &str) -> Result<Option<Duration>, ConfigError> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("off") || trimmed.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    trimmed
        .parse::<u64>()
        .map(|ms| Some(Duration::from_millis(ms)))
        .map_err(|_| ConfigError::InvalidIdleTimeout {
            var: IDLE_TIMEOUT_ENV,
            value: value.to_owned(),
        })
}

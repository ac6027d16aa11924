//! The `webhooks` section of the configuration.

use std::time::Duration;

use hermes_common::{error::ConfigError, traits::collaborator::Subscriber};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Attempts per subscriber, including the first.
    ///
    /// Default: 3
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Default: 1000 milliseconds
    #[serde(default = "defaults::backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Default: 60000 milliseconds
    #[serde(default = "defaults::backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Default: 30 seconds
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Endpoints known at startup.
    #[serde(default)]
    pub subscribers: Vec<Subscriber>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            backoff_base_ms: defaults::backoff_base_ms(),
            backoff_cap_ms: defaults::backoff_cap_ms(),
            request_timeout_secs: defaults::request_timeout_secs(),
            subscribers: Vec::new(),
        }
    }
}

impl WebhookConfig {
    ///
    /// # Errors
    /// If no attempt would ever be made, or a subscriber URL is not HTTP(S).
    ///
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: String::from("webhooks.max_attempts"),
                reason: String::from("must be at least 1"),
            });
        }

        if let Some(subscriber) = self
            .subscribers
            .iter()
            .find(|s| !(s.url.starts_with("http://") || s.url.starts_with("https://")))
        {
            return Err(ConfigError::Invalid {
                field: String::from("webhooks.subscribers"),
                reason: format!("not an HTTP URL: {}", subscriber.url),
            });
        }

        Ok(())
    }

    #[must_use]
    pub const fn backoff(&self) -> Backoff {
        Backoff {
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms),
        }
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    /// Delay after the `attempt`-th failure (1-based): `min(base * 2^(attempt-1), cap)`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

mod defaults {
    pub const fn max_attempts() -> u32 {
        3
    }

    pub const fn backoff_base_ms() -> u64 {
        1000
    }

    pub const fn backoff_cap_ms() -> u64 {
        60_000
    }

    pub const fn request_timeout_secs() -> u64 {
        30
    }
}

use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Basic retry policy template
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Maximum number of retries (0 means unlimited retries)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Single operation timeout (unit: milliseconds)
    #[serde(default = "default_op_timeout_ms")]
    pub timeout_ms: u64,

    /// Backoff base (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum backoff time (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            timeout_ms: default_op_timeout_ms(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl BackoffPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay before retry number `attempt` (0-based), doubling up to the cap
    pub fn delay_for(
        &self,
        attempt: u32,
    ) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    pub fn validate(
        &self,
        name: &str,
    ) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(format!(
                "retry.{name}.timeout_ms must be greater than 0"
            ))));
        }

        if self.base_delay_ms > self.max_delay_ms {
            return Err(Error::Config(ConfigError::Message(format!(
                "retry.{name}.base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            ))));
        }

        Ok(())
    }
}

/// Divide strategies by failure domain
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryPolicies {
    /// list-and-watch / read-and-watch calls hitting transient store errors
    #[serde(default = "default_store_policy")]
    pub store: BackoffPolicy,

    /// Re-reading an entity whose payload failed to decode
    #[serde(default = "default_unreadable_policy")]
    pub unreadable: BackoffPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            store: default_store_policy(),
            unreadable: default_unreadable_policy(),
        }
    }
}

impl RetryPolicies {
    pub fn validate(&self) -> Result<()> {
        self.store.validate("store")?;
        self.unreadable.validate("unreadable")?;
        Ok(())
    }
}

fn default_store_policy() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 0,
        timeout_ms: 5000,
        base_delay_ms: 50,
        max_delay_ms: 5000,
    }
}

fn default_unreadable_policy() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 0,
        timeout_ms: 5000,
        base_delay_ms: 1000,
        max_delay_ms: 30000,
    }
}

fn default_max_retries() -> usize {
    3
}
fn default_op_timeout_ms() -> u64 {
    100
}
fn default_base_delay_ms() -> u64 {
    50
}
fn default_max_delay_ms() -> u64 {
    1000
}

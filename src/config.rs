// Queue configuration
//
// Defaults keep latency low: a ten-millisecond window and a threshold of
// one, so callers opt in to larger accumulation windows explicitly.

use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Flush triggers for a single queue instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum delay before a non-empty queue flushes on its own.
    #[serde(default = "default_flush_after_ms")]
    pub flush_after_ms: u64,
    /// Pending size that forces an immediate synchronous flush.
    #[serde(default = "default_threshold")]
    pub threshold: usize,
}

fn default_flush_after_ms() -> u64 {
    10
}

fn default_threshold() -> usize {
    1
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_after_ms: default_flush_after_ms(),
            threshold: default_threshold(),
        }
    }
}

impl BatchConfig {
    /// Builds a config from `BATCH_*` environment variables, falling back to
    /// the provided defaults when a variable is unset or unparseable.
    pub fn from_env(default_threshold: usize, default_flush_after_ms: u64) -> Self {
        fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok()?.parse().ok()
        }

        let threshold = parse_env("BATCH_THRESHOLD").unwrap_or(default_threshold);
        let flush_after_ms = parse_env("BATCH_FLUSH_AFTER_MS").unwrap_or(default_flush_after_ms);

        Self {
            flush_after_ms,
            threshold,
        }
    }

    pub fn flush_after(&self) -> Duration {
        Duration::from_millis(self.flush_after_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.threshold == 0 {
            bail!("batch.threshold must be greater than 0");
        }

        if self.flush_after_ms == 0 {
            bail!("batch.flush_after_ms must be greater than 0");
        }

        // Warn about values that buffer far more than any consumer wants
        if self.threshold > 1_000_000 {
            warn!(
                threshold = self.threshold,
                "batch.threshold is very large; may cause memory issues"
            );
        }

        if self.flush_after_ms > 60_000 {
            warn!(
                flush_after_ms = self.flush_after_ms,
                "batch.flush_after_ms exceeds a minute; payloads may look stalled"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BatchConfig::default();
        assert_eq!(config.threshold, 1);
        assert_eq!(config.flush_after_ms, 10);
        assert_eq!(config.flush_after(), Duration::from_millis(10));
    }

    #[test]
    fn test_validate() {
        let valid = BatchConfig {
            flush_after_ms: 50,
            threshold: 100,
        };
        assert!(valid.validate().is_ok());

        let zero_threshold = BatchConfig {
            flush_after_ms: 50,
            threshold: 0,
        };
        assert!(zero_threshold.validate().is_err());

        let zero_window = BatchConfig {
            flush_after_ms: 0,
            threshold: 100,
        };
        assert!(zero_window.validate().is_err());
    }

    #[test]
    fn test_from_env_falls_back_on_garbage() {
        std::env::set_var("BATCH_THRESHOLD", "not-a-number");
        std::env::remove_var("BATCH_FLUSH_AFTER_MS");

        let config = BatchConfig::from_env(25, 500);
        assert_eq!(config.threshold, 25);
        assert_eq!(config.flush_after_ms, 500);

        std::env::remove_var("BATCH_THRESHOLD");
    }
}

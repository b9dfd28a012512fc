//! Exponential backoff with jitter for coordinator (re)connection.
//!
//! Peers use [`BackoffConfig::calculate_delay`] between reconnect attempts and
//! [`retry_async`] for the bounded initial connect.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff policy for connecting to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Attempts made by the initial connect (including the first one).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub exponential_base: f64,
    /// Scale each delay by a random factor in `0.5..1.5`.
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            let factor = rand::rng().random_range(0.5..1.5);
            (capped_secs * factor).min(self.max_delay.as_secs_f64())
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }
}

/// Run `operation` until it succeeds or `config.max_attempts` is exhausted.
///
/// Returns the last error when every attempt fails.
pub async fn retry_async<F, Fut, T, E>(config: &BackoffConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("Connected after {} attempts", attempt + 1);
                }
                return Ok(value);
            }
            Err(e) if attempt + 1 >= config.max_attempts => {
                warn!(
                    "All {} connection attempts exhausted. Last error: {}",
                    config.max_attempts, e
                );
                return Err(e);
            }
            Err(e) => {
                let delay = config.calculate_delay(attempt);
                debug!(
                    "Attempt {}/{} failed: {}. Retrying in {:?}",
                    attempt + 1,
                    config.max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_doubles_without_jitter() {
        let config = BackoffConfig::new()
            .with_base_delay(Duration::from_millis(100))
            .with_jitter(false);

        assert_eq!(config.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(config.calculate_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = BackoffConfig::new()
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(3))
            .with_jitter(false);

        assert_eq!(config.calculate_delay(10), Duration::from_secs(3));
        // Large attempt counts must not overflow the exponent.
        assert_eq!(config.calculate_delay(u32::MAX), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = BackoffConfig::new()
            .with_base_delay(Duration::from_secs(2))
            .with_max_delay(Duration::from_secs(60));

        for _ in 0..20 {
            let delay = config.calculate_delay(0);
            assert!(
                delay >= Duration::from_secs(1) && delay <= Duration::from_secs(3),
                "Delay {:?} should be between 1s and 3s",
                delay
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let config = BackoffConfig::new()
            .with_max_attempts(4)
            .with_base_delay(Duration::from_millis(10))
            .with_jitter(false);

        let counter = Arc::new(AtomicU32::new(0));
        let result = retry_async(&config, || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("refused".to_string())
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_returns_last_error() {
        let config = BackoffConfig::new()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(10))
            .with_jitter(false);

        let counter = Arc::new(AtomicU32::new(0));
        let result: Result<(), String> = retry_async(&config, || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Err(format!("failure {}", n))
            }
        })
        .await;

        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}

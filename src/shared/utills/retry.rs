//! Retry with exponential backoff
//!
//! Generic retry helper for transient broker failures (broker unreachable,
//! network blips). The delay before retry n doubles from `initial_delay`,
//! capped at `max_delay`.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Number of retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles after each subsequent one.
    pub initial_delay: Duration,
    /// Ceiling applied to the doubling delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Execute an async operation with exponential backoff retry.
///
/// The `should_retry` closure classifies errors: transient ones are retried
/// until the budget runs out, anything else bails immediately. The last
/// error is returned either way.
///
/// # Example
/// ```ignore
/// let result = retry_with_backoff(
///     RetryConfig::default(),
///     || channel_publish(),
///     |err: &BrokerError| err.is_transient(),
///     "publish",
/// ).await;
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: RetryConfig,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
    operation_name: &str,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;

    for attempt in 1..=config.max_retries + 1 {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation = operation_name, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if attempt == config.max_retries + 1 || !should_retry(&err) {
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_retries = config.max_retries,
                        error = %err,
                        "Operation failed permanently"
                    );
                    return Err(err);
                }

                warn!(
                    operation = operation_name,
                    attempt,
                    max_retries = config.max_retries,
                    error = %err,
                    retry_in_s = delay.as_secs(),
                    "Transient failure, retrying"
                );

                tokio::time::sleep(delay).await;

                delay = (delay * 2).min(config.max_delay);
            }
        }
    }

    unreachable!("Loop exits via return")
}

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use ualink_core::config::ClientConfig;
use ualink_core::error::ConnectionError;

/// Retry budget for opening a session
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Upper bound on the delay
    pub max_delay: Duration,
    /// Delay multiplier between attempts (1.0 keeps the delay fixed)
    pub backoff_multiplier: f64,
    /// Deadline for a single attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 1.0,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            initial_delay: config.retry_delay(),
            attempt_timeout: config.connect_timeout(),
            ..Default::default()
        }
    }
}

/// Delay to wait after the given zero-based failed attempt
pub fn calculate_backoff(attempt: u32, policy: &RetryPolicy) -> Duration {
    let delay_secs =
        policy.initial_delay.as_secs_f64() * policy.backoff_multiplier.powi(attempt as i32);
    let capped_secs = delay_secs.min(policy.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped_secs.max(0.0))
}

/// Runs `attempt_fn` until it succeeds, the budget is spent, or `cancel` fires.
///
/// Each attempt is bounded by `policy.attempt_timeout`. Deadline failures and
/// protocol failures are logged separately.
pub async fn open_with_retry<F, Fut, T>(
    endpoint: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut attempt_fn: F,
) -> Result<T, ConnectionError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ConnectionError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ConnectionError::Closed {
                    reason: "connect cancelled".to_string(),
                });
            }
            outcome = tokio::time::timeout(policy.attempt_timeout, attempt_fn(attempt)) => outcome,
        };

        let err = match outcome {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    info!(endpoint, attempt, "Session opened after retry");
                }
                return Ok(value);
            }
            Ok(Err(e)) => {
                warn!(endpoint, attempt, max_attempts, error = %e, "Session open failed");
                e
            }
            Err(_) => {
                let e = ConnectionError::timeout(endpoint, policy.attempt_timeout);
                warn!(
                    endpoint,
                    attempt,
                    max_attempts,
                    timeout_ms = policy.attempt_timeout.as_millis() as u64,
                    "Session open timed out"
                );
                e
            }
        };
        last_error = Some(err);

        if attempt < max_attempts {
            let delay = calculate_backoff(attempt - 1, policy);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ConnectionError::Closed {
                        reason: "connect cancelled".to_string(),
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    let last_error = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown error".to_string());
    error!(endpoint, attempts = max_attempts, error = %last_error, "Giving up on session open");

    Err(ConnectionError::RetriesExhausted {
        endpoint: endpoint.to_string(),
        attempts: max_attempts,
        last_error,
    })
}

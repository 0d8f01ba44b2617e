//! Bounded exponential retry around provider calls
//!
//! Only transient failures are retried, and never beyond `max_attempts`
//! total calls. Permanent failures return after the first attempt.

use super::{LlmError, LlmProvider, LlmRequest, LlmResponse};
use crate::config::RetryConfig;
use backoff::{future::retry_notify, ExponentialBackoff, ExponentialBackoffBuilder};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::warn;

/// Retry settings for one tool
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first call (at least 1)
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Exactly one attempt
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_multiplier(self.multiplier)
            .with_max_elapsed_time(None)
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
            multiplier: 2.0,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms.max(config.initial_backoff_ms)),
            multiplier: config.multiplier.max(1.0),
        }
    }
}

/// Call the provider, retrying transient failures per `policy`
pub async fn complete_with_retry(
    provider: &dyn LlmProvider,
    request: &LlmRequest,
    policy: &RetryPolicy,
) -> Result<LlmResponse, LlmError> {
    let attempts = AtomicU32::new(0);
    let attempts = &attempts;
    let max_attempts = policy.max_attempts.max(1);
    let max_wait = policy.max_backoff;

    let operation = move || async move {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match provider.complete(request).await {
            Ok(response) => Ok(response),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                crate::metrics::record_provider_retry(request.stage.as_str());
                match err {
                    LlmError::RateLimited { retry_after: Some(secs) } => {
                        let wait = Duration::from_secs(secs).min(max_wait);
                        Err(backoff::Error::retry_after(err, wait))
                    }
                    err => Err(backoff::Error::transient(err)),
                }
            }
            Err(err) => Err(backoff::Error::permanent(err)),
        }
    };

    retry_notify(policy.backoff(), operation, |err: LlmError, wait: Duration| {
        warn!(
            stage = %request.stage,
            attempt = attempts.load(Ordering::SeqCst),
            max_attempts,
            wait_ms = wait.as_millis() as u64,
            error = %err,
            "Provider call failed, retrying"
        );
    })
    .await
}

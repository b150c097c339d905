//! Bounded retry with exponential backoff.
//!
//! Attempts run strictly sequentially per endpoint: attempt N+1 starts only
//! after attempt N completed and its backoff elapsed. Every attempt writes
//! its own audit record through the sender.

use std::{sync::Arc, time::Duration};

use hookline_core::{Endpoint, Envelope};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{DeliveryError, Result},
    sender::{DeliveryOutcome, WebhookSender},
};

/// Which failed attempts are eligible for another try.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryClassifier {
    /// Retry every failure, including 4xx responses.
    #[default]
    AllFailures,
    /// Retry transport failures, 5xx, 408 and 429 only.
    TransientOnly,
}

impl RetryClassifier {
    /// Whether `error` should be retried under this classifier.
    pub fn should_retry(self, error: &DeliveryError) -> bool {
        match self {
            Self::AllFailures => !matches!(error, DeliveryError::Encoding { .. }),
            Self::TransientOnly => error.is_transient(),
        }
    }
}

/// Retry policy for webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts is this plus one.
    pub max_retries: u32,

    /// Delay before the first retry.
    pub initial_backoff: Duration,

    /// Upper bound for any single delay.
    pub max_backoff: Duration,

    /// Jitter fraction in `[0, 1]`; zero disables randomization.
    pub jitter_factor: f64,

    /// Which failures are retried.
    pub classifier: RetryClassifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: crate::DEFAULT_MAX_RETRIES,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            jitter_factor: 0.0,
            classifier: RetryClassifier::AllFailures,
        }
    }
}

impl RetryPolicy {
    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (0-based):
    /// `min(initial_backoff * 2^retry, max_backoff)`, then jittered and
    /// re-capped.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let multiplier = 2_u32.saturating_pow(retry.min(31));
        let delay = self.initial_backoff.saturating_mul(multiplier).min(self.max_backoff);
        apply_jitter(delay, self.jitter_factor).min(self.max_backoff)
    }

    /// Rejects policies whose backoff bounds are inverted or whose jitter is
    /// out of range.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.initial_backoff > self.max_backoff {
            return Err(DeliveryError::configuration(
                "initial backoff must not exceed max backoff",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(DeliveryError::configuration("jitter factor must be within [0, 1]"));
        }
        Ok(())
    }
}

/// Randomizes `duration` by up to ±`jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let range = duration.as_secs_f64() * jitter_factor.clamp(0.0, 1.0);
    let offset = rand::rng().random_range(-range..=range);
    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

/// Wraps a [`WebhookSender`] with bounded retry.
#[derive(Debug, Clone)]
pub struct RetryingSender {
    sender: Arc<WebhookSender>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryingSender {
    /// Creates a retrying sender that is never cancelled.
    pub fn new(sender: Arc<WebhookSender>, policy: RetryPolicy) -> Self {
        Self { sender, policy, cancel: CancellationToken::new() }
    }

    /// Aborts pending backoff sleeps when `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Active policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delivers with up to `max_retries + 1` attempts.
    ///
    /// Returns the successful attempt, or a skip when the endpoint is not
    /// eligible.
    ///
    /// # Errors
    ///
    /// - `RetriesExhausted` wrapping the last failure once all attempts failed
    /// - the failure itself when the classifier declines to retry it
    /// - `Cancelled` when the token fires before or between attempts
    /// - `Encoding` when the envelope cannot be serialized
    pub async fn send_with_retry(
        &self,
        endpoint: &Endpoint,
        envelope: &Envelope,
    ) -> Result<DeliveryOutcome> {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 1;

        loop {
            if self.cancel.is_cancelled() {
                return Err(DeliveryError::Cancelled);
            }

            let report = match self.sender.send_attempt(endpoint, envelope, attempt).await? {
                DeliveryOutcome::Attempted(report) => report,
                skipped @ DeliveryOutcome::Skipped(_) => return Ok(skipped),
            };

            let Some(error) = report.error.clone() else {
                return Ok(DeliveryOutcome::Attempted(report));
            };

            if attempt >= max_attempts {
                tracing::warn!(
                    endpoint_id = %endpoint.id,
                    event = %envelope.event,
                    attempts = attempt,
                    error = %error,
                    "webhook delivery exhausted retries"
                );
                return Err(DeliveryError::retries_exhausted(attempt, error));
            }

            if !self.policy.classifier.should_retry(&error) {
                tracing::warn!(
                    endpoint_id = %endpoint.id,
                    event = %envelope.event,
                    attempt,
                    error = %error,
                    "webhook failure is not retryable"
                );
                return Err(error);
            }

            let backoff = self.policy.backoff_for(attempt - 1);
            tracing::debug!(
                endpoint_id = %endpoint.id,
                attempt,
                max_attempts,
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                "scheduling webhook retry"
            );

            tokio::select! {
                () = self.cancel.cancelled() => return Err(DeliveryError::Cancelled),
                () = self.sender.clock().sleep(backoff) => {},
            }

            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sequence_doubles_and_caps() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..8).map(|n| policy.backoff_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(policy.max_attempts(), 6);
    }

    #[test]
    fn huge_retry_index_saturates_at_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy { jitter_factor: 0.5, ..Default::default() };
        for _ in 0..100 {
            let delay = policy.backoff_for(2);
            assert!(delay >= Duration::from_secs(2) && delay <= Duration::from_secs(6));
        }
    }

    #[test]
    fn validation_rejects_inverted_bounds() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(policy.validate().is_err());
        assert!(RetryPolicy { jitter_factor: 1.5, ..Default::default() }.validate().is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }

    #[test]
    fn classifiers() {
        let not_found = DeliveryError::http(404, "");
        assert!(RetryClassifier::AllFailures.should_retry(&not_found));
        assert!(!RetryClassifier::TransientOnly.should_retry(&not_found));
        assert!(RetryClassifier::TransientOnly.should_retry(&DeliveryError::http(502, "")));
    }
}

//! Turns a [`crate::failure::FailureAnalysis`] into a concrete
//! [`RetryDecision`] — whether to retry, and after how long — and records
//! the outcome as [`JobRetryHistory`] regardless of whether a retry
//! actually happens.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::Clock;
use crate::entities::{FailureCategory, JobRetryHistory, Marketplace};
use crate::error::OrchestratorError;
use crate::failure::FailureAnalysis;
use crate::storage::Storage;

/// Below this many retry records in the trailing 24h, the adaptive factor
/// does not kick in — too little signal.
const MIN_RECORDS_FOR_ADAPTIVE: usize = 20;
const LOW_SUCCESS_RATE_THRESHOLD: f64 = 0.8;
const HIGH_SUCCESS_RATE_THRESHOLD: f64 = 0.95;
const LOW_SUCCESS_RATE_FACTOR: f64 = 1.5;
const HIGH_SUCCESS_RATE_FACTOR: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay_ms: i64,
    pub next_retry_at: DateTime<Utc>,
    /// `true` once `attempt` has exhausted `effective_max_retries`, whether
    /// or not the category was ever retryable to begin with. Pair with
    /// `analysis.should_retry` to tell "ran out of retries on a retryable
    /// category" (dead-letter) from "was never retryable" (fail outright).
    pub max_retries_reached: bool,
    pub requires_user_intervention: bool,
    pub reason: String,
    pub use_circuit_breaker: bool,
    pub metadata: serde_json::Value,
}

pub struct RetryStrategy<'a> {
    storage: &'a dyn Storage,
    clock: &'a dyn Clock,
    rng: &'a fastrand::Rng,
}

impl<'a> RetryStrategy<'a> {
    pub fn new(storage: &'a dyn Storage, clock: &'a dyn Clock, rng: &'a fastrand::Rng) -> Self {
        Self { storage, clock, rng }
    }

    /// Decide whether `job_id`'s `attempt`-th failure (1-indexed) should be
    /// retried, and compute the delay if so. Always writes a
    /// [`JobRetryHistory`] row, whether or not a retry follows, so the
    /// adaptive factor and downstream analytics see every attempt.
    pub async fn decide(
        &self,
        job_id: Uuid,
        attempt: i32,
        max_retries: i32,
        marketplace: Option<&Marketplace>,
        analysis: &FailureAnalysis,
        error_type: &str,
        error_message: &str,
        processing_duration_ms: i64,
    ) -> Result<RetryDecision, OrchestratorError> {
        let now = self.clock.now();
        let effective_max_retries = max_retries.min(analysis.retry_defaults.max_retries);
        let (should_retry, max_retries_reached) = if attempt >= effective_max_retries {
            (false, true)
        } else if !analysis.should_retry {
            (false, false)
        } else {
            (true, false)
        };

        let delay_ms = if should_retry {
            self.compute_delay_ms(attempt, marketplace, analysis).await?
        } else {
            0
        };
        let next_retry_at = now + chrono::Duration::milliseconds(delay_ms);

        let reason = if should_retry {
            format!("retrying attempt {attempt} of {effective_max_retries}")
        } else if max_retries_reached {
            format!("max retries reached (attempt {attempt} of {effective_max_retries})")
        } else {
            format!("{:?} is not retryable", analysis.category)
        };
        let metadata = serde_json::json!({
            "category": analysis.category,
            "attempt": attempt,
            "effective_max_retries": effective_max_retries,
        });

        let history = JobRetryHistory {
            job_id,
            attempt_number: attempt,
            failure_category: analysis.category,
            error_type: error_type.to_string(),
            error_message: error_message.to_string(),
            marketplace: marketplace.cloned(),
            retry_delay_ms: delay_ms,
            next_retry_at,
            processing_duration_ms,
            timestamp: now,
        };
        self.storage
            .record_retry_history(&history)
            .await
            .map_err(OrchestratorError::Storage)?;

        Ok(RetryDecision {
            should_retry,
            delay_ms,
            next_retry_at,
            max_retries_reached,
            requires_user_intervention: analysis.requires_user_intervention,
            reason,
            use_circuit_breaker: analysis.circuit_breaker_eligible,
            metadata,
        })
    }

    async fn compute_delay_ms(
        &self,
        attempt: i32,
        marketplace: Option<&Marketplace>,
        analysis: &FailureAnalysis,
    ) -> Result<i64, OrchestratorError> {
        let defaults = analysis.retry_defaults;
        let exponent = (attempt - 1).max(0) as i32;
        let base = defaults.base_delay_ms as f64 * defaults.backoff_multiplier.powi(exponent);
        let capped = base.min(defaults.max_delay_ms as f64);

        let adaptive = match marketplace {
            Some(marketplace) => self.adaptive_factor(marketplace).await?,
            None => 1.0,
        };
        let adjusted = (capped * adaptive).min(defaults.max_delay_ms as f64);

        let jitter_range = defaults.jitter_range;
        let jitter = if jitter_range > 0.0 {
            let spread = adjusted * jitter_range;
            (self.rng.clone().f64() * 2.0 - 1.0) * spread
        } else {
            0.0
        };

        Ok((adjusted + jitter).max(0.0).round() as i64)
    }

    /// Scales the backoff delay based on the trailing 24h success rate for
    /// this marketplace: a struggling marketplace (<80% success) backs off
    /// harder, a healthy one (>95%) backs off less.
    async fn adaptive_factor(&self, marketplace: &Marketplace) -> Result<f64, OrchestratorError> {
        let since = self.clock.now() - chrono::Duration::hours(24);
        let history = self
            .storage
            .recent_retry_history(marketplace, since)
            .await
            .map_err(OrchestratorError::Storage)?;

        if history.len() < MIN_RECORDS_FOR_ADAPTIVE {
            return Ok(1.0);
        }

        let failures = history
            .iter()
            .filter(|h| !matches!(h.failure_category, FailureCategory::Unknown))
            .count();
        let success_rate = 1.0 - (failures as f64 / history.len() as f64);

        if success_rate < LOW_SUCCESS_RATE_THRESHOLD {
            Ok(LOW_SUCCESS_RATE_FACTOR)
        } else if success_rate > HIGH_SUCCESS_RATE_THRESHOLD {
            Ok(HIGH_SUCCESS_RATE_FACTOR)
        } else {
            Ok(1.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::{FailureCategorizer, RetryDefaults};
    use crate::marketplace::MarketplaceError;

    #[test]
    fn exponential_backoff_matches_the_documented_sequence() {
        // base=1000ms, multiplier=2.0, cap=60000ms, no jitter — the
        // canonical sequence from the round-trip properties.
        let defaults = RetryDefaults::new(10, 1000, 60_000, 2.0, 0.0);
        let expected = [1000i64, 2000, 4000, 8000, 16000, 32000, 60000, 60000];
        for (i, &want) in expected.iter().enumerate() {
            let attempt = (i + 1) as i32;
            let exponent = (attempt - 1).max(0);
            let delay = (defaults.base_delay_ms as f64 * defaults.backoff_multiplier.powi(exponent))
                .min(defaults.max_delay_ms as f64)
                .round() as i64;
            assert_eq!(delay, want, "attempt {attempt}");
        }
    }

    #[test]
    fn non_retryable_category_never_retries() {
        let analysis = FailureCategorizer::categorize(&MarketplaceError::Validation("bad price".into()));
        assert!(!analysis.should_retry);
    }
}

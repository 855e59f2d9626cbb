//! A closed/open/half-open circuit breaker per marketplace.
//!
//! `closed` allows calls and counts failures; `failure_threshold` consecutive
//! failures trip it to `open`. `open` rejects calls until `timeout_ms` has
//! elapsed since it opened, then moves to `half_open`. `half_open` allows up
//! to `half_open_max` in-flight probe calls; `recovery_threshold` consecutive
//! successes close it again, a single failure reopens it.

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::entities::{CircuitBreakerStatus, CircuitState, Marketplace};
use crate::error::OrchestratorError;
use crate::marketplace::MarketplaceRegistry;
use crate::storage::Storage;

/// What [`CircuitBreaker::should_allow`] decided, and why — surfaced to the
/// worker loop so it can log or reschedule instead of just getting `bool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowDecision {
    Allow,
    RejectOpen { retry_after_ms: i64 },
    RejectHalfOpenSaturated,
}

impl AllowDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AllowDecision::Allow)
    }
}

pub struct CircuitBreaker<'a> {
    storage: &'a dyn Storage,
    registry: &'a MarketplaceRegistry,
    clock: &'a dyn Clock,
}

impl<'a> CircuitBreaker<'a> {
    pub fn new(storage: &'a dyn Storage, registry: &'a MarketplaceRegistry, clock: &'a dyn Clock) -> Self {
        Self {
            storage,
            registry,
            clock,
        }
    }

    async fn load_status(&self, marketplace: &Marketplace) -> Result<CircuitBreakerStatus, OrchestratorError> {
        if let Some(status) = self
            .storage
            .get_circuit_breaker_status(marketplace)
            .await
            .map_err(OrchestratorError::Storage)?
        {
            return Ok(status);
        }
        let thresholds = self
            .registry
            .config(marketplace)
            .map(|c| c.circuit_thresholds.clone())
            .unwrap_or_default();
        Ok(CircuitBreakerStatus::closed(marketplace.clone(), thresholds))
    }

    /// Whether a call to this marketplace should proceed right now. Moves
    /// `open -> half_open` as a side effect once the timeout has elapsed, so
    /// callers never need to special-case "expired open" themselves.
    pub async fn should_allow(&self, marketplace: &Marketplace) -> Result<AllowDecision, OrchestratorError> {
        let mut status = self.load_status(marketplace).await?;
        let now = self.clock.now();

        match status.state {
            CircuitState::Closed => Ok(AllowDecision::Allow),
            CircuitState::Open => {
                let reopen_at = status
                    .next_retry_at
                    .unwrap_or(now + chrono::Duration::milliseconds(status.thresholds.timeout_ms));
                if now >= reopen_at {
                    status.state = CircuitState::HalfOpen;
                    status.half_open_in_flight = 1;
                    status.success_count = 0;
                    self.storage
                        .save_circuit_breaker_status(&status)
                        .await
                        .map_err(OrchestratorError::Storage)?;
                    tracing::info!(marketplace = %marketplace, "circuit breaker half-opening");
                    Ok(AllowDecision::Allow)
                } else {
                    let retry_after_ms = (reopen_at - now).num_milliseconds().max(0);
                    Ok(AllowDecision::RejectOpen { retry_after_ms })
                }
            }
            CircuitState::HalfOpen => {
                if status.half_open_in_flight >= status.thresholds.half_open_max {
                    Ok(AllowDecision::RejectHalfOpenSaturated)
                } else {
                    status.half_open_in_flight += 1;
                    self.storage
                        .save_circuit_breaker_status(&status)
                        .await
                        .map_err(OrchestratorError::Storage)?;
                    Ok(AllowDecision::Allow)
                }
            }
        }
    }

    /// Record the outcome of a call that [`Self::should_allow`] admitted.
    pub async fn record_success(&self, marketplace: &Marketplace) -> Result<(), OrchestratorError> {
        let mut status = self.load_status(marketplace).await?;
        let now = self.clock.now();
        status.last_success_at = Some(now);

        match status.state {
            CircuitState::Closed => {
                status.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                status.half_open_in_flight = status.half_open_in_flight.saturating_sub(1);
                status.success_count += 1;
                if status.success_count >= status.thresholds.recovery_threshold {
                    tracing::info!(marketplace = %marketplace, "circuit breaker closing after recovery");
                    status = CircuitBreakerStatus::closed(marketplace.clone(), status.thresholds);
                    status.last_success_at = Some(now);
                }
            }
            CircuitState::Open => {}
        }

        self.storage
            .save_circuit_breaker_status(&status)
            .await
            .map_err(OrchestratorError::Storage)
    }

    pub async fn record_failure(&self, marketplace: &Marketplace) -> Result<(), OrchestratorError> {
        let mut status = self.load_status(marketplace).await?;
        let now = self.clock.now();
        status.last_failure_at = Some(now);

        match status.state {
            CircuitState::Closed => {
                status.failure_count += 1;
                if status.failure_count >= status.thresholds.failure_threshold {
                    self.trip_open(&mut status, now);
                }
            }
            CircuitState::HalfOpen => {
                self.trip_open(&mut status, now);
            }
            CircuitState::Open => {}
        }

        self.storage
            .save_circuit_breaker_status(&status)
            .await
            .map_err(OrchestratorError::Storage)
    }

    fn trip_open(&self, status: &mut CircuitBreakerStatus, now: DateTime<Utc>) {
        tracing::warn!(marketplace = %status.marketplace, "circuit breaker tripped open");
        status.state = CircuitState::Open;
        status.opened_at = Some(now);
        status.next_retry_at = Some(now + chrono::Duration::milliseconds(status.thresholds.timeout_ms));
        status.half_open_in_flight = 0;
        status.success_count = 0;
    }
}

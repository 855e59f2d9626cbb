//! Per-marketplace sliding-window rate limiting with an adaptive backoff
//! multiplier.
//!
//! Windows are fixed-start (not rolling): a minute window covers
//! `[window_start, window_start + 1min)` and resets rather than sliding
//! continuously. `acquire` and `record` are kept as distinct,
//! separately-exposed operations (never merged into one "call and report"
//! method) so a caller cannot accidentally skip the before-the-call/
//! after-the-call ordering.

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::entities::{Marketplace, RateLimitMultiplier, RateLimitWindow, RateLimitWindowKind};
use crate::error::OrchestratorError;
use crate::marketplace::{MarketplaceRegistry, RateLimits};
use crate::storage::{Storage, StorageResult};

/// Floor under which `optimal_delay_ms` never drops, regardless of priority.
const MIN_DELAY_MS: i64 = 250;

const WINDOW_KINDS: [RateLimitWindowKind; 3] = [
    RateLimitWindowKind::Minute,
    RateLimitWindowKind::Hour,
    RateLimitWindowKind::Day,
];

const MAX_BACKOFF_MULTIPLIER: f64 = 8.0;
const BACKOFF_GROWTH: f64 = 1.5;

fn limit_for(kind: RateLimitWindowKind, limits: &RateLimits) -> u32 {
    match kind {
        RateLimitWindowKind::Minute => limits.per_minute,
        RateLimitWindowKind::Hour => limits.per_hour,
        RateLimitWindowKind::Day => limits.per_day,
    }
}

/// Whether a window has rolled past its fixed duration and needs resetting.
fn window_expired(window: &RateLimitWindow, now: DateTime<Utc>) -> bool {
    now >= window.window_start + window.window_kind.duration()
}

fn fresh_window(marketplace: &str, kind: RateLimitWindowKind, now: DateTime<Utc>, limit: u32) -> RateLimitWindow {
    RateLimitWindow {
        marketplace: marketplace.to_string(),
        window_kind: kind,
        window_start: now,
        count: 0,
        limit,
    }
}

/// Result of a capacity check against all three windows.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitCheck {
    pub allowed: bool,
    /// Milliseconds until the most-constraining window resets, when not
    /// allowed.
    pub retry_after_ms: i64,
}

pub struct RateLimiter<'a> {
    storage: &'a dyn Storage,
    registry: &'a MarketplaceRegistry,
    clock: &'a dyn Clock,
}

impl<'a> RateLimiter<'a> {
    pub fn new(storage: &'a dyn Storage, registry: &'a MarketplaceRegistry, clock: &'a dyn Clock) -> Self {
        Self {
            storage,
            registry,
            clock,
        }
    }

    async fn load_window(
        &self,
        marketplace: &str,
        kind: RateLimitWindowKind,
        limit: u32,
    ) -> StorageResult<RateLimitWindow> {
        let now = self.clock.now();
        match self.storage.get_rate_limit_window(marketplace, kind).await? {
            Some(window) if !window_expired(&window, now) => Ok(window),
            _ => Ok(fresh_window(marketplace, kind, now, limit)),
        }
    }

    /// Read-only capacity check: does NOT consume a slot. Used for
    /// diagnostics/UI; never a substitute for [`Self::acquire`] before a
    /// marketplace call.
    pub async fn check(&self, marketplace: &Marketplace) -> Result<RateLimitCheck, OrchestratorError> {
        let limits = self.registry.config(marketplace)?.rate_limits;
        let mut retry_after_ms = 0i64;
        let mut allowed = true;
        for kind in WINDOW_KINDS {
            let limit = limit_for(kind, &limits);
            let window = self
                .load_window(marketplace, kind, limit)
                .await
                .map_err(OrchestratorError::Storage)?;
            if window.count >= window.limit {
                allowed = false;
                let reset_at = window.window_start + kind.duration();
                let wait = (reset_at - self.clock.now()).num_milliseconds().max(0);
                retry_after_ms = retry_after_ms.max(wait);
            }
        }
        Ok(RateLimitCheck {
            allowed,
            retry_after_ms,
        })
    }

    /// Attempt to consume one slot across all three windows. Must be called
    /// immediately before the marketplace call it is gating — never after.
    pub async fn acquire(&self, marketplace: &Marketplace) -> Result<RateLimitCheck, OrchestratorError> {
        let limits = self.registry.config(marketplace)?.rate_limits;
        let now = self.clock.now();

        let mut windows = Vec::with_capacity(WINDOW_KINDS.len());
        let mut retry_after_ms = 0i64;
        let mut allowed = true;
        for kind in WINDOW_KINDS {
            let limit = limit_for(kind, &limits);
            let window = self
                .load_window(marketplace, kind, limit)
                .await
                .map_err(OrchestratorError::Storage)?;
            if window.count >= window.limit {
                allowed = false;
                let reset_at = window.window_start + kind.duration();
                let wait = (reset_at - now).num_milliseconds().max(0);
                retry_after_ms = retry_after_ms.max(wait);
            }
            windows.push(window);
        }

        if !allowed {
            tracing::warn!(marketplace = %marketplace, retry_after_ms, "rate limit acquire denied");
            return Ok(RateLimitCheck {
                allowed: false,
                retry_after_ms,
            });
        }

        for mut window in windows {
            window.count += 1;
            self.storage
                .save_rate_limit_window(&window)
                .await
                .map_err(OrchestratorError::Storage)?;
        }

        Ok(RateLimitCheck {
            allowed: true,
            retry_after_ms: 0,
        })
    }

    /// Report the outcome of a call made after a successful [`Self::acquire`].
    /// A failure grows the persisted adaptive multiplier ×1.5 (capped at
    /// 8×); a success halves it back down toward 1.0. The multiplier is
    /// real per-marketplace state, not derived from retry history, so it
    /// moves on every call outcome rather than only ever growing.
    pub async fn record(&self, marketplace: &Marketplace, success: bool) -> Result<(), OrchestratorError> {
        let current = self.backoff_multiplier(marketplace).await?;
        let updated = if success {
            (current / BACKOFF_GROWTH).max(1.0)
        } else {
            (current * BACKOFF_GROWTH).min(MAX_BACKOFF_MULTIPLIER)
        };
        self.storage
            .save_rate_limit_multiplier(&RateLimitMultiplier {
                marketplace: marketplace.clone(),
                multiplier: updated,
                updated_at: self.clock.now(),
            })
            .await
            .map_err(OrchestratorError::Storage)?;
        if !success {
            tracing::debug!(marketplace = %marketplace, multiplier = updated, "rate limiter recorded failed call");
        }
        Ok(())
    }

    /// The adaptive component of the optimal spacing between calls: the
    /// per-marketplace minimum interval implied by its per-minute rate
    /// limit, scaled by the persisted backoff multiplier and reduced for
    /// higher-priority jobs, floored at [`MIN_DELAY_MS`].
    pub async fn optimal_delay_ms(&self, marketplace: &Marketplace, priority: i32) -> Result<i64, OrchestratorError> {
        let limits = self.registry.config(marketplace)?.rate_limits;
        let base = if limits.per_minute == 0 {
            0
        } else {
            60_000 / limits.per_minute as i64
        };
        let multiplier = self.backoff_multiplier(marketplace).await?;
        let priority_factor = 1.0 - (priority.clamp(0, 10) as f64 / 20.0);
        let delay = (base as f64 * multiplier * priority_factor).round() as i64;
        Ok(delay.max(MIN_DELAY_MS))
    }

    async fn backoff_multiplier(&self, marketplace: &Marketplace) -> Result<f64, OrchestratorError> {
        Ok(self
            .storage
            .get_rate_limit_multiplier(marketplace)
            .await
            .map_err(OrchestratorError::Storage)?
            .map(|m| m.multiplier)
            .unwrap_or(1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_expired_after_its_duration_elapses() {
        let start = Utc::now();
        let window = fresh_window("ebay", RateLimitWindowKind::Minute, start, 20);
        assert!(!window_expired(&window, start + chrono::Duration::seconds(30)));
        assert!(window_expired(&window, start + chrono::Duration::seconds(61)));
    }

    #[test]
    fn limit_for_selects_the_matching_window() {
        let limits = RateLimits {
            per_minute: 20,
            per_hour: 500,
            per_day: 5000,
        };
        assert_eq!(limit_for(RateLimitWindowKind::Minute, &limits), 20);
        assert_eq!(limit_for(RateLimitWindowKind::Hour, &limits), 500);
        assert_eq!(limit_for(RateLimitWindowKind::Day, &limits), 5000);
    }
}

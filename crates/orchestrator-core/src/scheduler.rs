//! The smart scheduler — merges static [`MarketplacePostingRule`] windows
//! with learned [`PostingSuccessAnalytics`] to pick a `scheduled_for` time
//! for a batch of (listing, marketplace) posts, staggered at least 60s
//! apart across marketplaces.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use uuid::Uuid;

use crate::clock::Clock;
use crate::entities::{Marketplace, OptimalWindow, SchedulingBasis, SchedulingMetadata};
use crate::error::OrchestratorError;
use crate::storage::Storage;

const SLOT_MINUTES: i64 = 15;
const SEARCH_HORIZON_DAYS: i64 = 7;
const MIN_INTER_MARKETPLACE_GAP_SECS: i64 = 60;
const MIN_ANALYTICS_OBSERVATIONS: usize = 3;
const MIN_ANALYTICS_MEAN_SCORE: f64 = 50.0;

/// How the batch's slots were chosen overall, surfaced to callers (e.g. the
/// progress bus) alongside each job's own [`SchedulingMetadata`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    Immediate,
    Mixed,
    Optimized,
}

#[derive(Debug, Clone)]
pub struct ScheduledSlot {
    pub marketplace: Marketplace,
    pub scheduled_for: DateTime<Utc>,
    pub metadata: SchedulingMetadata,
}

#[derive(Debug, Clone)]
pub struct SchedulingPlan {
    pub slots: Vec<ScheduledSlot>,
    pub distribution: Distribution,
}

pub struct SmartScheduler<'a> {
    storage: &'a dyn Storage,
    clock: &'a dyn Clock,
}

impl<'a> SmartScheduler<'a> {
    pub fn new(storage: &'a dyn Storage, clock: &'a dyn Clock) -> Self {
        Self { storage, clock }
    }

    /// Schedule one slot per marketplace for a posting batch. `immediate`
    /// (e.g. a user-triggered single post) skips window search entirely and
    /// schedules for "now", staggered by the minimum gap. `requested_time`,
    /// when given, is a floor under every slot — a window found earlier than
    /// it is pulled forward to it. `priority` tightens the minimum gap
    /// between marketplaces the same way it tightens `optimal_delay_ms`: a
    /// higher-priority batch packs its slots closer together.
    pub async fn schedule_batch(
        &self,
        user_id: Uuid,
        listing_id: Uuid,
        marketplaces: &[Marketplace],
        immediate: bool,
        requested_time: Option<DateTime<Utc>>,
        priority: i32,
    ) -> Result<SchedulingPlan, OrchestratorError> {
        let gap_secs = gap_secs_for_priority(priority);
        let start_from = requested_time
            .map(|t| t.max(self.clock.now()))
            .unwrap_or_else(|| self.clock.now());

        if immediate {
            return Ok(self.schedule_immediate(marketplaces, start_from, gap_secs));
        }

        let mut ordered: Vec<&Marketplace> = marketplaces.iter().collect();
        ordered.sort();

        let mut slots = Vec::with_capacity(ordered.len());
        let mut used_times: Vec<DateTime<Utc>> = Vec::new();
        let mut any_analytics = false;
        let mut any_fallback = false;

        for marketplace in ordered {
            let windows = self.windows_for(user_id, listing_id, marketplace).await?;
            let (slot_time, metadata) = self.search_slot(marketplace, &windows, &used_times, start_from, gap_secs)?;
            if matches!(metadata.basis, SchedulingBasis::UserAnalytics) {
                any_analytics = true;
            }
            if matches!(metadata.basis, SchedulingBasis::Fallback) {
                any_fallback = true;
            }
            used_times.push(slot_time);
            slots.push(ScheduledSlot {
                marketplace: marketplace.clone(),
                scheduled_for: slot_time,
                metadata,
            });
        }

        let distribution = if any_fallback && !any_analytics {
            Distribution::Mixed
        } else if any_analytics {
            Distribution::Optimized
        } else {
            Distribution::Mixed
        };

        Ok(SchedulingPlan { slots, distribution })
    }

    fn schedule_immediate(&self, marketplaces: &[Marketplace], start_from: DateTime<Utc>, gap_secs: i64) -> SchedulingPlan {
        let slots = marketplaces
            .iter()
            .enumerate()
            .map(|(i, marketplace)| ScheduledSlot {
                marketplace: marketplace.clone(),
                scheduled_for: start_from + Duration::seconds(gap_secs * i as i64),
                metadata: SchedulingMetadata {
                    reasoning: "immediate posting requested".to_string(),
                    basis: SchedulingBasis::Immediate,
                    confidence_score: 100,
                    estimated_success_rate: 50,
                },
            })
            .collect();
        SchedulingPlan {
            slots,
            distribution: Distribution::Immediate,
        }
    }

    /// Merge the marketplace's static default windows with any learned
    /// analytics windows that clear the observation/score bar: at least 3
    /// observations in a weekday/hour bucket with mean success score > 50
    /// promotes that bucket to a window, scored by its mean.
    async fn windows_for(
        &self,
        user_id: Uuid,
        listing_id: Uuid,
        marketplace: &Marketplace,
    ) -> Result<Vec<(OptimalWindow, SchedulingBasis)>, OrchestratorError> {
        let _ = listing_id;
        let mut windows = Vec::new();

        if let Some(rule) = self
            .storage
            .get_posting_rule(marketplace)
            .await
            .map_err(OrchestratorError::Storage)?
        {
            windows.extend(
                rule.optimal_windows
                    .into_iter()
                    .map(|w| (w, SchedulingBasis::DefaultWindow)),
            );
        }

        let analytics = self
            .storage
            .list_user_analytics(user_id, marketplace)
            .await
            .map_err(OrchestratorError::Storage)?;

        let mut buckets: HashMap<(u8, u8), Vec<f64>> = HashMap::new();
        for record in &analytics {
            buckets
                .entry((record.day_of_week, record.hour_of_day))
                .or_default()
                .push(record.success_score);
        }
        for ((day, hour), scores) in buckets {
            if scores.len() < MIN_ANALYTICS_OBSERVATIONS {
                continue;
            }
            let mean = scores.iter().sum::<f64>() / scores.len() as f64;
            if mean <= MIN_ANALYTICS_MEAN_SCORE {
                continue;
            }
            windows.push((
                OptimalWindow {
                    day_of_week: day,
                    start_hour: hour,
                    end_hour: (hour + 1).min(23),
                    timezone: "UTC".to_string(),
                    score: mean.min(100.0) as u8,
                },
                SchedulingBasis::UserAnalytics,
            ));
        }

        Ok(windows)
    }

    /// Search forward in 15-minute slots, up to 7 days from `start_from`, for
    /// the earliest highest-scoring window start that respects `gap_secs`
    /// from already-used times. Falls back to `start_from` with
    /// [`SchedulingBasis::Fallback`] if nothing scores above zero within the
    /// horizon.
    fn search_slot(
        &self,
        marketplace: &Marketplace,
        windows: &[(OptimalWindow, SchedulingBasis)],
        used_times: &[DateTime<Utc>],
        start_from: DateTime<Utc>,
        gap_secs: i64,
    ) -> Result<(DateTime<Utc>, SchedulingMetadata), OrchestratorError> {
        let horizon = start_from + Duration::days(SEARCH_HORIZON_DAYS);

        let mut best: Option<(DateTime<Utc>, &OptimalWindow, &SchedulingBasis)> = None;
        let mut cursor = start_from;

        while cursor < horizon {
            let day = cursor.weekday().num_days_from_sunday() as u8;
            let hour = cursor.hour() as u8;

            for (window, basis) in windows {
                if window.day_of_week != day || hour < window.start_hour || hour >= window.end_hour {
                    continue;
                }
                if Self::too_close(cursor, used_times, gap_secs) {
                    continue;
                }
                let better = match &best {
                    None => true,
                    Some((best_time, best_window, _)) => {
                        window.score > best_window.score
                            || (window.score == best_window.score && cursor < *best_time)
                    }
                };
                if better {
                    best = Some((cursor, window, basis));
                }
            }
            cursor += Duration::minutes(SLOT_MINUTES);
        }

        match best {
            Some((slot_time, window, basis)) => {
                let confidence = window.score;
                Ok((
                    slot_time,
                    SchedulingMetadata {
                        reasoning: format!(
                            "{marketplace}: matched {:?} window scoring {} for day {} hour {}",
                            basis, window.score, window.day_of_week, window.start_hour
                        ),
                        basis: *basis,
                        confidence_score: confidence,
                        estimated_success_rate: confidence,
                    },
                ))
            }
            None => {
                let fallback_time = Self::next_clear_slot(start_from, used_times, gap_secs);
                Ok((
                    fallback_time,
                    SchedulingMetadata {
                        reasoning: "no scored window found within the search horizon".to_string(),
                        basis: SchedulingBasis::Fallback,
                        confidence_score: 0,
                        estimated_success_rate: 50,
                    },
                ))
            }
        }
    }

    fn too_close(candidate: DateTime<Utc>, used_times: &[DateTime<Utc>], gap_secs: i64) -> bool {
        used_times
            .iter()
            .any(|used| (candidate - *used).num_seconds().abs() < gap_secs)
    }

    fn next_clear_slot(from: DateTime<Utc>, used_times: &[DateTime<Utc>], gap_secs: i64) -> DateTime<Utc> {
        let mut candidate = from;
        while Self::too_close(candidate, used_times, gap_secs) {
            candidate += Duration::seconds(gap_secs);
        }
        candidate
    }
}

/// Higher-priority batches pack their per-marketplace slots tighter, down to
/// half of [`MIN_INTER_MARKETPLACE_GAP_SECS`] at priority 10 — the same
/// linear falloff `RateLimiter::optimal_delay_ms` applies to call spacing.
fn gap_secs_for_priority(priority: i32) -> i64 {
    let factor = 1.0 - (priority.clamp(0, 10) as f64 / 20.0);
    ((MIN_INTER_MARKETPLACE_GAP_SECS as f64) * factor).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_close_rejects_within_the_minimum_gap() {
        let base = Utc::now();
        let used = vec![base];
        assert!(SmartScheduler::too_close(base + Duration::seconds(30), &used, MIN_INTER_MARKETPLACE_GAP_SECS));
        assert!(!SmartScheduler::too_close(base + Duration::seconds(61), &used, MIN_INTER_MARKETPLACE_GAP_SECS));
    }

    #[test]
    fn next_clear_slot_walks_forward_past_conflicts() {
        let base = Utc::now();
        let used = vec![base, base + Duration::seconds(60)];
        let clear = SmartScheduler::next_clear_slot(base, &used, MIN_INTER_MARKETPLACE_GAP_SECS);
        assert!(!SmartScheduler::too_close(clear, &used, MIN_INTER_MARKETPLACE_GAP_SECS));
    }

    #[test]
    fn higher_priority_tightens_the_inter_marketplace_gap() {
        assert_eq!(gap_secs_for_priority(0), MIN_INTER_MARKETPLACE_GAP_SECS);
        assert_eq!(gap_secs_for_priority(10), MIN_INTER_MARKETPLACE_GAP_SECS / 2);
    }
}

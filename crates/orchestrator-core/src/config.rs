//! Boot-time configuration: worker tuning plus per-marketplace overrides
//! loaded from a JSON file.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::entities::{CircuitBreakerThresholds, FailureCategory, OptimalWindow};
use crate::failure::RetryDefaults;
use crate::marketplace::RateLimits;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub worker_tick_interval_ms: u64,
    pub worker_pool_size: usize,
    pub marketplace_call_timeout_ms: i64,
    pub claim_batch_size: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_tick_interval_ms: 2_000,
            worker_pool_size: 4,
            marketplace_call_timeout_ms: 30_000,
            claim_batch_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryOverride {
    pub max_retries: i32,
    pub base_delay_ms: i64,
    pub max_delay_ms: i64,
    pub backoff_multiplier: f64,
    pub jitter_range: f64,
}

impl From<RetryOverride> for RetryDefaults {
    fn from(value: RetryOverride) -> Self {
        RetryDefaults::new(
            value.max_retries,
            value.base_delay_ms,
            value.max_delay_ms,
            value.backoff_multiplier,
            value.jitter_range,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketplaceOverride {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
    #[serde(default)]
    pub optimal_windows: Vec<OptimalWindow>,
    #[serde(default)]
    pub circuit_thresholds: Option<CircuitBreakerThresholds>,
    #[serde(default)]
    pub retry_overrides: HashMap<FailureCategory, RetryOverride>,
}

impl MarketplaceOverride {
    pub fn rate_limits(&self) -> RateLimits {
        RateLimits {
            per_minute: self.per_minute,
            per_hour: self.per_hour,
            per_day: self.per_day,
        }
    }
}

/// The JSON document loaded to override a marketplace's rate limits,
/// default posting windows, circuit-breaker thresholds, and retry policy —
/// keyed by marketplace name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketplaceOverrides {
    #[serde(flatten)]
    pub marketplaces: HashMap<String, MarketplaceOverride>,
}

impl MarketplaceOverrides {
    pub fn from_json(raw: &str) -> Result<Self, crate::error::OrchestratorError> {
        serde_json::from_str(raw).map_err(crate::error::OrchestratorError::Serialization)
    }

    pub fn get(&self, marketplace: &str) -> Option<&MarketplaceOverride> {
        self.marketplaces.get(marketplace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_overrides_keyed_by_marketplace() {
        let raw = r#"{
            "ebay": { "per_minute": 25, "per_hour": 600, "per_day": 6000 }
        }"#;
        let overrides = MarketplaceOverrides::from_json(raw).unwrap();
        let ebay = overrides.get("ebay").unwrap();
        assert_eq!(ebay.per_minute, 25);
        assert_eq!(ebay.rate_limits().per_hour, 600);
    }

    #[test]
    fn unknown_marketplace_override_is_none() {
        let overrides = MarketplaceOverrides::default();
        assert!(overrides.get("ebay").is_none());
    }
}

//! Maps a raw marketplace failure onto a [`FailureCategory`] and the retry
//! policy that category implies.

use crate::entities::FailureCategory;
use crate::marketplace::MarketplaceError;

/// Per-category retry defaults, overridable per marketplace via
/// [`crate::marketplace::MarketplaceConfig::retry_overrides`].
#[derive(Debug, Clone, Copy)]
pub struct RetryDefaults {
    pub max_retries: i32,
    pub base_delay_ms: i64,
    pub max_delay_ms: i64,
    pub backoff_multiplier: f64,
    pub jitter_range: f64,
}

impl RetryDefaults {
    pub const fn new(
        max_retries: i32,
        base_delay_ms: i64,
        max_delay_ms: i64,
        backoff_multiplier: f64,
        jitter_range: f64,
    ) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
            backoff_multiplier,
            jitter_range,
        }
    }
}

/// Default policy per category, in the absence of a marketplace-specific
/// override.
fn default_retry_defaults(category: FailureCategory) -> RetryDefaults {
    match category {
        FailureCategory::RateLimit => RetryDefaults::new(5, 1_000, 60_000, 2.0, 0.1),
        FailureCategory::Network => RetryDefaults::new(4, 1_000, 30_000, 2.0, 0.2),
        FailureCategory::ServerError | FailureCategory::Temporary => {
            RetryDefaults::new(3, 2_000, 60_000, 2.0, 0.15)
        }
        FailureCategory::MarketplaceMaintenance => RetryDefaults::new(2, 30_000, 300_000, 2.0, 0.1),
        FailureCategory::Auth => RetryDefaults::new(2, 500, 5_000, 2.0, 0.0),
        FailureCategory::ClientError
        | FailureCategory::DataValidation
        | FailureCategory::Permanent => RetryDefaults::new(0, 0, 0, 1.0, 0.0),
        FailureCategory::Unknown => RetryDefaults::new(2, 1_000, 30_000, 2.0, 0.2),
    }
}

/// The outcome of categorizing one failure — enough for the retry strategy
/// to decide whether and how to retry without re-inspecting the raw error.
#[derive(Debug, Clone, Copy)]
pub struct FailureAnalysis {
    pub category: FailureCategory,
    pub should_retry: bool,
    pub requires_user_intervention: bool,
    pub circuit_breaker_eligible: bool,
    pub retry_defaults: RetryDefaults,
}

impl FailureAnalysis {
    fn new(category: FailureCategory, retry_defaults: RetryDefaults) -> Self {
        let should_retry = retry_defaults.max_retries > 0;
        let requires_user_intervention = matches!(
            category,
            FailureCategory::Auth | FailureCategory::DataValidation | FailureCategory::ClientError
        );
        let circuit_breaker_eligible = matches!(
            category,
            FailureCategory::Network
                | FailureCategory::ServerError
                | FailureCategory::Temporary
                | FailureCategory::MarketplaceMaintenance
        );
        Self {
            category,
            should_retry,
            requires_user_intervention,
            circuit_breaker_eligible,
            retry_defaults,
        }
    }
}

/// Categorizes marketplace call failures into the buckets the retry
/// strategy and circuit breaker reason about, applying rules in a fixed
/// order so an error that could match more than one bucket (e.g. a 429 with
/// a validation-shaped body) resolves predictably.
pub struct FailureCategorizer;

impl FailureCategorizer {
    /// Classify a [`MarketplaceError`] returned from a client call.
    pub fn categorize(error: &MarketplaceError) -> FailureAnalysis {
        let category = match error {
            MarketplaceError::RateLimit { .. } => FailureCategory::RateLimit,
            MarketplaceError::Auth(_) => FailureCategory::Auth,
            MarketplaceError::Validation(_) => FailureCategory::DataValidation,
            MarketplaceError::Network(_) => FailureCategory::Network,
            MarketplaceError::Transient(msg) => Self::categorize_message(msg),
        };
        let defaults = default_retry_defaults(category);
        FailureAnalysis::new(category, defaults)
    }

    /// Categorize by inspecting an HTTP status code directly, used by
    /// adapters that observe a status without routing it through
    /// [`MarketplaceError`] first.
    pub fn categorize_status(status: u16, message: &str) -> FailureAnalysis {
        let category = match status {
            429 => FailureCategory::RateLimit,
            401 | 403 => FailureCategory::Auth,
            400 | 404 | 422 => FailureCategory::DataValidation,
            503 => Self::maintenance_or_server_error(message),
            500..=599 => FailureCategory::ServerError,
            408 => FailureCategory::Network,
            400..=499 => FailureCategory::ClientError,
            _ => Self::categorize_message(message),
        };
        FailureAnalysis::new(category, default_retry_defaults(category))
    }

    /// A catch-all analysis for failures that never reached a marketplace
    /// call at all (e.g. no processor registered for the job type).
    pub fn unknown() -> FailureAnalysis {
        FailureAnalysis::new(FailureCategory::Unknown, default_retry_defaults(FailureCategory::Unknown))
    }

    fn maintenance_or_server_error(message: &str) -> FailureCategory {
        let lower = message.to_lowercase();
        if lower.contains("maintenance") || lower.contains("scheduled downtime") {
            FailureCategory::MarketplaceMaintenance
        } else {
            FailureCategory::ServerError
        }
    }

    /// Best-effort categorization from a free-text message, for transport
    /// errors that don't carry a structured status (connection reset,
    /// timeout, DNS failure).
    fn categorize_message(message: &str) -> FailureCategory {
        let lower = message.to_lowercase();
        if lower.contains("timed out")
            || lower.contains("timeout")
            || lower.contains("connection reset")
            || lower.contains("connection refused")
            || lower.contains("dns")
        {
            FailureCategory::Network
        } else if lower.contains("maintenance") {
            FailureCategory::MarketplaceMaintenance
        } else if lower.contains("invalid") || lower.contains("validation") {
            FailureCategory::DataValidation
        } else {
            FailureCategory::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_is_retryable_but_not_circuit_eligible() {
        let analysis = FailureCategorizer::categorize(&MarketplaceError::RateLimit { wait_ms: 500 });
        assert_eq!(analysis.category, FailureCategory::RateLimit);
        assert!(analysis.should_retry);
        assert!(!analysis.circuit_breaker_eligible);
    }

    #[test]
    fn auth_requires_user_intervention() {
        let analysis = FailureCategorizer::categorize(&MarketplaceError::Auth("expired".into()));
        assert_eq!(analysis.category, FailureCategory::Auth);
        assert!(analysis.requires_user_intervention);
    }

    #[test]
    fn validation_is_permanent() {
        let analysis =
            FailureCategorizer::categorize(&MarketplaceError::Validation("missing price".into()));
        assert!(!analysis.should_retry);
        assert_eq!(analysis.retry_defaults.max_retries, 0);
    }

    #[test]
    fn network_errors_are_circuit_eligible() {
        let analysis = FailureCategorizer::categorize(&MarketplaceError::Network("connection reset".into()));
        assert_eq!(analysis.category, FailureCategory::Network);
        assert!(analysis.circuit_breaker_eligible);
    }

    #[test]
    fn status_503_with_maintenance_text_is_maintenance() {
        let analysis = FailureCategorizer::categorize_status(503, "scheduled downtime for upgrades");
        assert_eq!(analysis.category, FailureCategory::MarketplaceMaintenance);
    }

    #[test]
    fn status_503_without_maintenance_text_is_server_error() {
        let analysis = FailureCategorizer::categorize_status(503, "internal error");
        assert_eq!(analysis.category, FailureCategory::ServerError);
    }

    #[test]
    fn unrecognized_message_falls_back_to_unknown() {
        let analysis = FailureCategorizer::categorize(&MarketplaceError::Transient("???".into()));
        assert_eq!(analysis.category, FailureCategory::Unknown);
    }
}

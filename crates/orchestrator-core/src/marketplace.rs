//! The [`MarketplaceClient`] contract external collaborators implement, and
//! the [`MarketplaceRegistry`] that maps a marketplace name to its client
//! plus static configuration.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::entities::{CircuitBreakerThresholds, FailureCategory, Listing, MarketplaceConnection, OptimalWindow};
use crate::failure::RetryDefaults;

/// Errors a [`MarketplaceClient`] call can raise. [`crate::failure::FailureCategorizer`]
/// maps these, together with the raw HTTP status/headers where available,
/// onto a [`FailureCategory`].
#[derive(Debug, Error)]
pub enum MarketplaceError {
    #[error("rate limited, retry after {wait_ms}ms")]
    RateLimit { wait_ms: i64 },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("network error: {0}")]
    Network(String),
}

impl MarketplaceError {
    /// HTTP status code this error would correspond to, when known — fed
    /// into [`crate::failure::FailureCategorizer`] alongside the error
    /// itself.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            MarketplaceError::RateLimit { .. } => Some(429),
            MarketplaceError::Auth(_) => Some(401),
            MarketplaceError::Validation(_) => Some(422),
            MarketplaceError::Transient(_) => Some(503),
            MarketplaceError::Network(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct CreatedListing {
    pub external_id: String,
    pub url: String,
}

#[derive(Clone)]
pub struct ExchangedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// The uniform interface the core dispatches through for every external
/// reselling platform. Implementations live outside this crate; the core
/// only ever holds a `dyn MarketplaceClient` via the registry.
#[async_trait]
pub trait MarketplaceClient: Send + Sync {
    async fn create_listing(
        &self,
        listing: &Listing,
        connection: &MarketplaceConnection,
    ) -> Result<CreatedListing, MarketplaceError>;

    async fn update_listing(
        &self,
        external_id: &str,
        partial: &serde_json::Value,
        connection: &MarketplaceConnection,
    ) -> Result<(), MarketplaceError>;

    async fn delete_listing(
        &self,
        external_id: &str,
        connection: &MarketplaceConnection,
    ) -> Result<(), MarketplaceError>;

    async fn test_connection(&self, connection: &MarketplaceConnection) -> bool;

    fn get_auth_url(&self) -> String;

    async fn exchange_token(&self, code: &str) -> Result<ExchangedToken, MarketplaceError>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<ExchangedToken, MarketplaceError>;
}

/// Lets callers register an `Arc<T>` (keeping a handle of their own to the
/// same instance) anywhere a `Box<dyn MarketplaceClient>` is expected.
#[async_trait]
impl<T: MarketplaceClient + ?Sized> MarketplaceClient for std::sync::Arc<T> {
    async fn create_listing(
        &self,
        listing: &Listing,
        connection: &MarketplaceConnection,
    ) -> Result<CreatedListing, MarketplaceError> {
        self.as_ref().create_listing(listing, connection).await
    }

    async fn update_listing(
        &self,
        external_id: &str,
        partial: &serde_json::Value,
        connection: &MarketplaceConnection,
    ) -> Result<(), MarketplaceError> {
        self.as_ref().update_listing(external_id, partial, connection).await
    }

    async fn delete_listing(
        &self,
        external_id: &str,
        connection: &MarketplaceConnection,
    ) -> Result<(), MarketplaceError> {
        self.as_ref().delete_listing(external_id, connection).await
    }

    async fn test_connection(&self, connection: &MarketplaceConnection) -> bool {
        self.as_ref().test_connection(connection).await
    }

    fn get_auth_url(&self) -> String {
        self.as_ref().get_auth_url()
    }

    async fn exchange_token(&self, code: &str) -> Result<ExchangedToken, MarketplaceError> {
        self.as_ref().exchange_token(code).await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<ExchangedToken, MarketplaceError> {
        self.as_ref().refresh_token(refresh_token).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
}

/// Static, boot-time configuration for one marketplace: its rate limits,
/// default optimal posting windows, circuit-breaker thresholds, and
/// per-category retry-delay overrides.
#[derive(Clone)]
pub struct MarketplaceConfig {
    pub name: String,
    pub rate_limits: RateLimits,
    pub default_windows: Vec<OptimalWindow>,
    pub circuit_thresholds: CircuitBreakerThresholds,
    pub retry_overrides: HashMap<FailureCategory, RetryDefaults>,
    pub call_timeout_ms: i64,
}

impl MarketplaceConfig {
    pub fn new(name: impl Into<String>, rate_limits: RateLimits) -> Self {
        Self {
            name: name.into(),
            rate_limits,
            default_windows: Vec::new(),
            circuit_thresholds: CircuitBreakerThresholds::default(),
            retry_overrides: HashMap::new(),
            call_timeout_ms: 30_000,
        }
    }

    pub fn with_default_windows(mut self, windows: Vec<OptimalWindow>) -> Self {
        self.default_windows = windows;
        self
    }

    pub fn with_circuit_thresholds(mut self, thresholds: CircuitBreakerThresholds) -> Self {
        self.circuit_thresholds = thresholds;
        self
    }

    pub fn with_retry_override(mut self, category: FailureCategory, defaults: RetryDefaults) -> Self {
        self.retry_overrides.insert(category, defaults);
        self
    }
}

struct RegisteredMarketplace {
    client: Box<dyn MarketplaceClient>,
    config: MarketplaceConfig,
}

/// Maps marketplace name to `MarketplaceClient` + static config — the
/// single source of truth an unknown name produces a `Configuration` error
/// against.
#[derive(Default)]
pub struct MarketplaceRegistry {
    marketplaces: HashMap<String, RegisteredMarketplace>,
}

impl MarketplaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        config: MarketplaceConfig,
        client: Box<dyn MarketplaceClient>,
    ) -> &mut Self {
        let name = config.name.clone();
        self.marketplaces
            .insert(name, RegisteredMarketplace { client, config });
        self
    }

    pub fn client(&self, marketplace: &str) -> Result<&dyn MarketplaceClient, crate::error::OrchestratorError> {
        self.marketplaces
            .get(marketplace)
            .map(|m| m.client.as_ref())
            .ok_or_else(|| crate::error::OrchestratorError::UnknownMarketplace(marketplace.to_string()))
    }

    pub fn config(&self, marketplace: &str) -> Result<&MarketplaceConfig, crate::error::OrchestratorError> {
        self.marketplaces
            .get(marketplace)
            .map(|m| &m.config)
            .ok_or_else(|| crate::error::OrchestratorError::UnknownMarketplace(marketplace.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.marketplaces.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullClient;

    #[async_trait]
    impl MarketplaceClient for NullClient {
        async fn create_listing(
            &self,
            _listing: &Listing,
            _connection: &MarketplaceConnection,
        ) -> Result<CreatedListing, MarketplaceError> {
            unimplemented!()
        }
        async fn update_listing(
            &self,
            _external_id: &str,
            _partial: &serde_json::Value,
            _connection: &MarketplaceConnection,
        ) -> Result<(), MarketplaceError> {
            unimplemented!()
        }
        async fn delete_listing(
            &self,
            _external_id: &str,
            _connection: &MarketplaceConnection,
        ) -> Result<(), MarketplaceError> {
            unimplemented!()
        }
        async fn test_connection(&self, _connection: &MarketplaceConnection) -> bool {
            true
        }
        fn get_auth_url(&self) -> String {
            "https://example.test/oauth".to_string()
        }
        async fn exchange_token(&self, _code: &str) -> Result<ExchangedToken, MarketplaceError> {
            unimplemented!()
        }
        async fn refresh_token(&self, _refresh_token: &str) -> Result<ExchangedToken, MarketplaceError> {
            unimplemented!()
        }
    }

    #[test]
    fn unknown_marketplace_is_an_error() {
        let registry = MarketplaceRegistry::new();
        assert!(matches!(
            registry.client("ebay"),
            Err(crate::error::OrchestratorError::UnknownMarketplace(_))
        ));
    }

    #[test]
    fn registered_marketplace_is_resolvable() {
        let mut registry = MarketplaceRegistry::new();
        registry.register(
            MarketplaceConfig::new(
                "ebay",
                RateLimits {
                    per_minute: 20,
                    per_hour: 500,
                    per_day: 5000,
                },
            ),
            Box::new(NullClient),
        );

        assert!(registry.client("ebay").is_ok());
        assert_eq!(registry.config("ebay").unwrap().rate_limits.per_minute, 20);
    }
}

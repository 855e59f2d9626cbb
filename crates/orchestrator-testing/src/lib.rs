//! In-memory fixtures for exercising the orchestrator without a database or
//! live marketplace: an [`InMemoryStorage`] backing every [`Storage`]
//! method, a scriptable [`MockMarketplaceClient`], and small builders for
//! the entities tests construct most often.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use orchestrator_core::entities::{
    AuditLog, CircuitBreakerStatus, DeadLetterEntry, DlqResolutionStatus, Job, JobData,
    JobRetryHistory, JobStatus, JobType, Listing, ListingPost, ListingStatus,
    Marketplace, MarketplaceConnection, MarketplacePostingRule, PostingSuccessAnalytics,
    RateLimitMultiplier, RateLimitWindow, RateLimitWindowKind,
};
use orchestrator_core::marketplace::{CreatedListing, ExchangedToken, MarketplaceClient, MarketplaceError};
use orchestrator_core::storage::{Storage, StorageResult};
use uuid::Uuid;

/// A `Storage` implementation backed entirely by `DashMap`s. Every method is
/// synchronous under the hood; the `async fn` signatures are kept identical
/// to a real adapter's so processors and the worker loop don't need a
/// test-only code path.
#[derive(Default)]
pub struct InMemoryStorage {
    listings: DashMap<Uuid, Listing>,
    connections: DashMap<(Uuid, String), MarketplaceConnection>,
    listing_posts: DashMap<(Uuid, String), ListingPost>,
    jobs: DashMap<Uuid, Job>,
    retry_history: DashMap<Uuid, Vec<JobRetryHistory>>,
    circuit_breakers: DashMap<String, CircuitBreakerStatus>,
    rate_limit_windows: DashMap<(String, RateLimitWindowKind), RateLimitWindow>,
    rate_limit_multipliers: DashMap<String, RateLimitMultiplier>,
    dlq_entries: DashMap<Uuid, DeadLetterEntry>,
    posting_rules: DashMap<String, MarketplacePostingRule>,
    analytics: DashMap<(Uuid, String), Vec<PostingSuccessAnalytics>>,
    audit_log: DashMap<Uuid, AuditLog>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a listing directly, bypassing the intents API, for tests that
    /// start from an already-existing listing.
    pub fn seed_listing(&self, listing: Listing) {
        self.listings.insert(listing.id, listing);
    }

    pub fn seed_connection(&self, connection: MarketplaceConnection) {
        self.connections
            .insert((connection.user_id, connection.marketplace.clone()), connection);
    }

    pub fn seed_posting_rule(&self, rule: MarketplacePostingRule) {
        self.posting_rules.insert(rule.marketplace.clone(), rule);
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn jobs_with_status(&self, status: JobStatus) -> Vec<Job> {
        self.jobs
            .iter()
            .filter(|entry| entry.value().status == status)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get_listing(&self, listing_id: Uuid) -> StorageResult<Option<Listing>> {
        Ok(self.listings.get(&listing_id).map(|e| e.value().clone()))
    }

    async fn update_listing_status(&self, listing_id: Uuid, status: ListingStatus) -> StorageResult<()> {
        if let Some(mut listing) = self.listings.get_mut(&listing_id) {
            listing.status = status;
        }
        Ok(())
    }

    async fn get_connection(
        &self,
        user_id: Uuid,
        marketplace: &str,
    ) -> StorageResult<Option<MarketplaceConnection>> {
        Ok(self
            .connections
            .get(&(user_id, marketplace.to_string()))
            .map(|e| e.value().clone()))
    }

    async fn save_connection(&self, connection: &MarketplaceConnection) -> StorageResult<()> {
        self.connections
            .insert((connection.user_id, connection.marketplace.clone()), connection.clone());
        Ok(())
    }

    async fn find_listing_post(
        &self,
        listing_id: Uuid,
        marketplace: &str,
    ) -> StorageResult<Option<ListingPost>> {
        Ok(self
            .listing_posts
            .get(&(listing_id, marketplace.to_string()))
            .map(|e| e.value().clone()))
    }

    async fn list_listing_posts(&self, listing_id: Uuid) -> StorageResult<Vec<ListingPost>> {
        Ok(self
            .listing_posts
            .iter()
            .filter(|e| e.key().0 == listing_id)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn upsert_listing_post(&self, post: &ListingPost) -> StorageResult<()> {
        self.listing_posts
            .insert((post.listing_id, post.marketplace.clone()), post.clone());
        Ok(())
    }

    async fn create_job(&self, job: &Job) -> StorageResult<()> {
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> StorageResult<Option<Job>> {
        Ok(self.jobs.get(&job_id).map(|e| e.value().clone()))
    }

    async fn list_due_jobs(&self, now: DateTime<Utc>, limit: i64) -> StorageResult<Vec<Job>> {
        let mut due: Vec<Job> = self
            .jobs
            .iter()
            .filter(|e| e.value().status == JobStatus::Pending && e.value().scheduled_for <= now)
            .map(|e| e.value().clone())
            .collect();
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_for.cmp(&b.scheduled_for))
        });
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn claim_job(&self, job_id: Uuid, now: DateTime<Utc>) -> StorageResult<Option<Job>> {
        let Some(mut entry) = self.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if entry.status != JobStatus::Pending {
            return Ok(None);
        }
        entry.status = JobStatus::Processing;
        entry.started_at = Some(now);
        entry.attempts += 1;
        Ok(Some(entry.value().clone()))
    }

    async fn save_job(&self, job: &Job) -> StorageResult<()> {
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn cancel_job(&self, job_id: Uuid) -> StorageResult<bool> {
        let Some(mut entry) = self.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if entry.status != JobStatus::Pending {
            return Ok(false);
        }
        entry.status = JobStatus::Cancelled;
        Ok(true)
    }

    async fn list_jobs_by_marketplace_group(&self, group_id: Uuid) -> StorageResult<Vec<Job>> {
        Ok(self
            .jobs
            .iter()
            .filter(|e| e.value().marketplace_group == Some(group_id))
            .map(|e| e.value().clone())
            .collect())
    }

    async fn list_jobs_for_listing(&self, listing_id: Uuid) -> StorageResult<Vec<Job>> {
        Ok(self
            .jobs
            .iter()
            .filter(|e| e.value().data.listing_id() == Some(listing_id))
            .map(|e| e.value().clone())
            .collect())
    }

    async fn record_retry_history(&self, entry: &JobRetryHistory) -> StorageResult<()> {
        self.retry_history
            .entry(entry.job_id)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn recent_retry_history(
        &self,
        marketplace: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<JobRetryHistory>> {
        Ok(self
            .retry_history
            .iter()
            .flat_map(|e| e.value().clone())
            .filter(|h| h.marketplace.as_deref() == Some(marketplace) && h.timestamp >= since)
            .collect())
    }

    async fn get_circuit_breaker_status(
        &self,
        marketplace: &str,
    ) -> StorageResult<Option<CircuitBreakerStatus>> {
        Ok(self.circuit_breakers.get(marketplace).map(|e| e.value().clone()))
    }

    async fn save_circuit_breaker_status(&self, status: &CircuitBreakerStatus) -> StorageResult<()> {
        self.circuit_breakers.insert(status.marketplace.clone(), status.clone());
        Ok(())
    }

    async fn get_rate_limit_window(
        &self,
        marketplace: &str,
        kind: RateLimitWindowKind,
    ) -> StorageResult<Option<RateLimitWindow>> {
        Ok(self
            .rate_limit_windows
            .get(&(marketplace.to_string(), kind))
            .map(|e| e.value().clone()))
    }

    async fn save_rate_limit_window(&self, window: &RateLimitWindow) -> StorageResult<()> {
        self.rate_limit_windows
            .insert((window.marketplace.clone(), window.window_kind), window.clone());
        Ok(())
    }

    async fn get_rate_limit_multiplier(&self, marketplace: &str) -> StorageResult<Option<RateLimitMultiplier>> {
        Ok(self
            .rate_limit_multipliers
            .get(marketplace)
            .map(|e| e.value().clone()))
    }

    async fn save_rate_limit_multiplier(&self, multiplier: &RateLimitMultiplier) -> StorageResult<()> {
        self.rate_limit_multipliers
            .insert(multiplier.marketplace.clone(), multiplier.clone());
        Ok(())
    }

    async fn create_dlq_entry(&self, entry: &DeadLetterEntry) -> StorageResult<()> {
        self.dlq_entries.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn get_dlq_entry(&self, id: Uuid) -> StorageResult<Option<DeadLetterEntry>> {
        Ok(self.dlq_entries.get(&id).map(|e| e.value().clone()))
    }

    async fn list_dlq_entries_by_user(&self, user_id: Uuid) -> StorageResult<Vec<DeadLetterEntry>> {
        Ok(self
            .dlq_entries
            .iter()
            .filter(|e| e.value().user_id == user_id)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn set_dlq_resolution(&self, id: Uuid, status: DlqResolutionStatus) -> StorageResult<()> {
        if let Some(mut entry) = self.dlq_entries.get_mut(&id) {
            entry.resolution_status = status;
        }
        Ok(())
    }

    async fn get_posting_rule(&self, marketplace: &str) -> StorageResult<Option<MarketplacePostingRule>> {
        Ok(self.posting_rules.get(marketplace).map(|e| e.value().clone()))
    }

    async fn record_posting_analytics(&self, analytics: &PostingSuccessAnalytics) -> StorageResult<()> {
        self.analytics
            .entry((analytics.user_id, analytics.marketplace.clone()))
            .or_default()
            .push(analytics.clone());
        Ok(())
    }

    async fn list_user_analytics(
        &self,
        user_id: Uuid,
        marketplace: &str,
    ) -> StorageResult<Vec<PostingSuccessAnalytics>> {
        Ok(self
            .analytics
            .get(&(user_id, marketplace.to_string()))
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }

    async fn create_audit_log(&self, entry: &AuditLog) -> StorageResult<()> {
        self.audit_log.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn list_audit_logs_by_user(&self, user_id: Uuid) -> StorageResult<Vec<AuditLog>> {
        Ok(self
            .audit_log
            .iter()
            .filter(|e| e.value().user_id == Some(user_id))
            .map(|e| e.value().clone())
            .collect())
    }
}

/// A scripted response queue for one marketplace call kind, consumed in
/// order. Defaults to always succeeding once empty.
struct ResponseQueue<T> {
    responses: Mutex<Vec<Result<T, MarketplaceError>>>,
}

impl<T: Clone> ResponseQueue<T> {
    fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, response: Result<T, MarketplaceError>) {
        self.responses.lock().expect("response queue poisoned").push(response);
    }

    fn pop(&self, default: impl FnOnce() -> Result<T, MarketplaceError>) -> Result<T, MarketplaceError> {
        let mut guard = self.responses.lock().expect("response queue poisoned");
        if guard.is_empty() {
            default()
        } else {
            guard.remove(0)
        }
    }
}

/// A [`MarketplaceClient`] whose responses are scripted ahead of time, for
/// driving specific success/failure sequences without a real network call.
pub struct MockMarketplaceClient {
    create_responses: ResponseQueue<CreatedListing>,
    delete_responses: ResponseQueue<()>,
    refresh_responses: ResponseQueue<ExchangedToken>,
    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

impl Default for MockMarketplaceClient {
    fn default() -> Self {
        Self {
            create_responses: ResponseQueue::new(),
            delete_responses: ResponseQueue::new(),
            refresh_responses: ResponseQueue::new(),
            create_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
        }
    }
}

impl MockMarketplaceClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_create_success(&self, external_id: impl Into<String>, url: impl Into<String>) {
        self.create_responses.push(Ok(CreatedListing {
            external_id: external_id.into(),
            url: url.into(),
        }));
    }

    pub fn queue_create_failure(&self, error: MarketplaceError) {
        self.create_responses.push(Err(error));
    }

    pub fn queue_delete_failure(&self, error: MarketplaceError) {
        self.delete_responses.push(Err(error));
    }

    pub fn queue_refresh_failure(&self, error: MarketplaceError) {
        self.refresh_responses.push(Err(error));
    }

    pub fn create_call_count(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn delete_call_count(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_call_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketplaceClient for MockMarketplaceClient {
    async fn create_listing(
        &self,
        _listing: &Listing,
        _connection: &MarketplaceConnection,
    ) -> Result<CreatedListing, MarketplaceError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.create_responses.pop(|| {
            Ok(CreatedListing {
                external_id: format!("mock-{}", Uuid::new_v4()),
                url: "https://example.test/listing".to_string(),
            })
        })
    }

    async fn update_listing(
        &self,
        _external_id: &str,
        _partial: &serde_json::Value,
        _connection: &MarketplaceConnection,
    ) -> Result<(), MarketplaceError> {
        Ok(())
    }

    async fn delete_listing(
        &self,
        _external_id: &str,
        _connection: &MarketplaceConnection,
    ) -> Result<(), MarketplaceError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.delete_responses.pop(|| Ok(()))
    }

    async fn test_connection(&self, _connection: &MarketplaceConnection) -> bool {
        true
    }

    fn get_auth_url(&self) -> String {
        "https://example.test/oauth/authorize".to_string()
    }

    async fn exchange_token(&self, _code: &str) -> Result<ExchangedToken, MarketplaceError> {
        Ok(ExchangedToken {
            access_token: "mock-access-token".to_string(),
            refresh_token: Some("mock-refresh-token".to_string()),
            expires_at: None,
        })
    }

    async fn refresh_token(&self, _refresh_token: &str) -> Result<ExchangedToken, MarketplaceError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.refresh_responses.pop(|| {
            Ok(ExchangedToken {
                access_token: "mock-refreshed-token".to_string(),
                refresh_token: Some("mock-refresh-token".to_string()),
                expires_at: None,
            })
        })
    }
}

/// Fixture builders, kept intentionally minimal: each fills in only the
/// fields most tests don't care about, leaving the interesting ones for the
/// caller to set.
pub mod fixtures {
    use super::*;

    pub fn listing(user_id: Uuid) -> Listing {
        Listing {
            id: Uuid::new_v4(),
            user_id,
            title: "Vintage denim jacket".to_string(),
            description: "Worn twice, no flaws".to_string(),
            price_cents: 4_500,
            images: vec!["https://example.test/img1.jpg".to_string()],
            category: Some("outerwear".to_string()),
            status: ListingStatus::Draft,
            created_at: Utc::now(),
        }
    }

    pub fn connection(user_id: Uuid, marketplace: impl Into<Marketplace>) -> MarketplaceConnection {
        MarketplaceConnection {
            id: Uuid::new_v4(),
            user_id,
            marketplace: marketplace.into(),
            access_token: "fixture-access-token".to_string(),
            refresh_token: Some("fixture-refresh-token".to_string()),
            token_expires_at: None,
            is_connected: true,
            settings: serde_json::json!({}),
        }
    }

    pub fn post_listing_job(user_id: Uuid, listing_id: Uuid, marketplace: impl Into<Marketplace>) -> Job {
        Job {
            id: Uuid::new_v4(),
            user_id,
            job_type: JobType::PostListing,
            data: JobData::PostListing {
                listing_id,
                marketplaces: vec![marketplace.into()],
            },
            priority: 0,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            progress: 0,
            result: None,
            error_message: None,
            scheduled_for: Utc::now(),
            started_at: None,
            completed_at: None,
            marketplace_group: None,
            scheduling_metadata: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::entities::JobStatus;

    #[tokio::test]
    async fn claim_job_transitions_pending_to_processing_once() {
        let storage = InMemoryStorage::new();
        let user_id = Uuid::new_v4();
        let listing_id = Uuid::new_v4();
        let job = fixtures::post_listing_job(user_id, listing_id, "ebay");
        storage.create_job(&job).await.unwrap();

        let now = Utc::now();
        let claimed = storage.claim_job(job.id, now).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.attempts, 1);

        let second_claim = storage.claim_job(job.id, now).await.unwrap();
        assert!(second_claim.is_none());
    }

    #[tokio::test]
    async fn list_due_jobs_orders_by_priority_then_schedule() {
        let storage = InMemoryStorage::new();
        let user_id = Uuid::new_v4();
        let listing_id = Uuid::new_v4();

        let mut low_priority = fixtures::post_listing_job(user_id, listing_id, "ebay");
        low_priority.priority = 0;
        let mut high_priority = fixtures::post_listing_job(user_id, listing_id, "poshmark");
        high_priority.priority = 10;

        storage.create_job(&low_priority).await.unwrap();
        storage.create_job(&high_priority).await.unwrap();

        let due = storage.list_due_jobs(Utc::now(), 10).await.unwrap();
        assert_eq!(due[0].id, high_priority.id);
        assert_eq!(due[1].id, low_priority.id);
    }

    #[tokio::test]
    async fn mock_client_replays_queued_responses_in_order() {
        let client = MockMarketplaceClient::new();
        client.queue_create_failure(MarketplaceError::RateLimit { wait_ms: 500 });
        client.queue_create_success("ext-1", "https://example.test/ext-1");

        let listing = fixtures::listing(Uuid::new_v4());
        let connection = fixtures::connection(listing.user_id, "ebay");

        let first = client.create_listing(&listing, &connection).await;
        assert!(matches!(first, Err(MarketplaceError::RateLimit { .. })));

        let second = client.create_listing(&listing, &connection).await;
        assert_eq!(second.unwrap().external_id, "ext-1");
        assert_eq!(client.create_call_count(), 2);
    }
}

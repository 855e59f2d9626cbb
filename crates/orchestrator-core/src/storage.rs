//! The [`Storage`] contract: typed CRUD over the entities in
//! `orchestrator_core::entities`. No business logic lives here — retry
//! policy, rate-limit math, and scheduling all live in their own modules and
//! are handed a `&dyn Storage` to read and write through.
//!
//! Implementations: [`orchestrator_postgres::PgStorage`] for production,
//! `orchestrator_testing::InMemoryStorage` for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entities::{
    AuditLog, CircuitBreakerStatus, DeadLetterEntry, DlqResolutionStatus, Job, JobRetryHistory,
    JobStatus, Listing, ListingPost, ListingStatus, MarketplaceConnection,
    MarketplacePostingRule, PostingSuccessAnalytics, RateLimitMultiplier, RateLimitWindow,
    RateLimitWindowKind,
};

/// Result alias for storage operations. Implementations surface their own
/// errors (a `sqlx::Error`, an in-memory "not found") wrapped in `anyhow`;
/// callers translate that into [`crate::error::OrchestratorError::Storage`].
pub type StorageResult<T> = anyhow::Result<T>;

#[async_trait]
pub trait Storage: Send + Sync {
    // ---- Users / Listings ------------------------------------------------

    async fn get_listing(&self, listing_id: Uuid) -> StorageResult<Option<Listing>>;
    async fn update_listing_status(
        &self,
        listing_id: Uuid,
        status: ListingStatus,
    ) -> StorageResult<()>;

    // ---- Marketplace connections -------------------------------------------

    async fn get_connection(
        &self,
        user_id: Uuid,
        marketplace: &str,
    ) -> StorageResult<Option<MarketplaceConnection>>;
    async fn save_connection(&self, connection: &MarketplaceConnection) -> StorageResult<()>;

    // ---- Listing posts -----------------------------------------------------

    /// Find the post row for a (listing, marketplace) pair, if one exists.
    async fn find_listing_post(
        &self,
        listing_id: Uuid,
        marketplace: &str,
    ) -> StorageResult<Option<ListingPost>>;

    async fn list_listing_posts(&self, listing_id: Uuid) -> StorageResult<Vec<ListingPost>>;

    /// Create or overwrite a listing post row. Callers keep at most one
    /// `posted` row per (listing, marketplace) at a time by always routing
    /// updates through `find_listing_post` first.
    async fn upsert_listing_post(&self, post: &ListingPost) -> StorageResult<()>;

    // ---- Jobs ----------------------------------------------------------------

    async fn create_job(&self, job: &Job) -> StorageResult<()>;
    async fn get_job(&self, job_id: Uuid) -> StorageResult<Option<Job>>;

    /// Jobs with `status = pending` and `scheduled_for <= now`, ordered by
    /// `(priority desc, scheduled_for asc)`, capped at `limit`.
    async fn list_due_jobs(&self, now: DateTime<Utc>, limit: i64) -> StorageResult<Vec<Job>>;

    /// Atomically transition `pending -> processing`, setting `started_at`
    /// and incrementing `attempts`. Returns `None` if the job was not in
    /// `pending` state when the claim was attempted (another worker beat us
    /// to it, or it was cancelled) — implementations must make this a single
    /// conditional update, never read-then-write.
    async fn claim_job(&self, job_id: Uuid, now: DateTime<Utc>) -> StorageResult<Option<Job>>;

    /// Persist a full job snapshot. Used by the worker loop and processors
    /// for every transition after the initial claim (progress updates,
    /// completion, reschedule, failure).
    async fn save_job(&self, job: &Job) -> StorageResult<()>;

    /// Transition a job to `cancelled` if it is currently `pending`.
    /// No-op (returns `false`) if the job is no longer pending.
    async fn cancel_job(&self, job_id: Uuid) -> StorageResult<bool>;

    /// All non-terminal jobs belonging to a given automation rule, used by
    /// `cancelAutomationJobs`.
    async fn list_jobs_by_marketplace_group(
        &self,
        group_id: Uuid,
    ) -> StorageResult<Vec<Job>>;

    /// All jobs (of any status) carrying this listing id, used together with
    /// `is_active_status` to enforce the pending-job uniqueness rule for
    /// (listing, marketplace) post/delist jobs before creating a new one.
    async fn list_jobs_for_listing(&self, listing_id: Uuid) -> StorageResult<Vec<Job>>;

    // ---- Retry history -----------------------------------------------------

    async fn record_retry_history(&self, entry: &JobRetryHistory) -> StorageResult<()>;

    /// Retry history rows for a marketplace within the trailing window,
    /// used by the retry strategy's adaptive delay adjustment.
    async fn recent_retry_history(
        &self,
        marketplace: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<JobRetryHistory>>;

    // ---- Circuit breaker -----------------------------------------------------

    async fn get_circuit_breaker_status(
        &self,
        marketplace: &str,
    ) -> StorageResult<Option<CircuitBreakerStatus>>;
    async fn save_circuit_breaker_status(
        &self,
        status: &CircuitBreakerStatus,
    ) -> StorageResult<()>;

    // ---- Rate limiting -----------------------------------------------------

    async fn get_rate_limit_window(
        &self,
        marketplace: &str,
        kind: RateLimitWindowKind,
    ) -> StorageResult<Option<RateLimitWindow>>;
    async fn save_rate_limit_window(&self, window: &RateLimitWindow) -> StorageResult<()>;

    /// The persisted adaptive backoff multiplier for a marketplace, `None`
    /// if it has never recorded a call outcome.
    async fn get_rate_limit_multiplier(
        &self,
        marketplace: &str,
    ) -> StorageResult<Option<RateLimitMultiplier>>;
    async fn save_rate_limit_multiplier(&self, multiplier: &RateLimitMultiplier) -> StorageResult<()>;

    // ---- Dead-letter queue -----------------------------------------------------

    async fn create_dlq_entry(&self, entry: &DeadLetterEntry) -> StorageResult<()>;
    async fn get_dlq_entry(&self, id: Uuid) -> StorageResult<Option<DeadLetterEntry>>;
    async fn list_dlq_entries_by_user(&self, user_id: Uuid) -> StorageResult<Vec<DeadLetterEntry>>;
    async fn set_dlq_resolution(
        &self,
        id: Uuid,
        status: DlqResolutionStatus,
    ) -> StorageResult<()>;

    // ---- Posting rules / analytics -----------------------------------------------------

    async fn get_posting_rule(
        &self,
        marketplace: &str,
    ) -> StorageResult<Option<MarketplacePostingRule>>;

    async fn record_posting_analytics(
        &self,
        analytics: &PostingSuccessAnalytics,
    ) -> StorageResult<()>;

    /// Raw analytics rows for a user/marketplace pair. The scheduler groups
    /// and scores these itself — storage does not aggregate.
    async fn list_user_analytics(
        &self,
        user_id: Uuid,
        marketplace: &str,
    ) -> StorageResult<Vec<PostingSuccessAnalytics>>;

    // ---- Audit log -----------------------------------------------------

    async fn create_audit_log(&self, entry: &AuditLog) -> StorageResult<()>;
    async fn list_audit_logs_by_user(&self, user_id: Uuid) -> StorageResult<Vec<AuditLog>>;
}

/// Convenience used by processors: find an existing `pending`/`posted` post
/// row for a (listing, marketplace) pair, or synthesize a fresh pending one.
pub async fn find_or_create_pending_post(
    storage: &dyn Storage,
    listing_id: Uuid,
    marketplace: &str,
) -> StorageResult<ListingPost> {
    if let Some(existing) = storage.find_listing_post(listing_id, marketplace).await? {
        return Ok(existing);
    }
    let post = ListingPost {
        id: Uuid::new_v4(),
        listing_id,
        marketplace: marketplace.to_string(),
        external_id: None,
        external_url: None,
        status: crate::entities::ListingPostStatus::Pending,
        error_message: None,
        posted_at: None,
    };
    storage.upsert_listing_post(&post).await?;
    Ok(post)
}

/// Whether a given job status still participates in the pending-job
/// uniqueness rule for (listing, marketplace) post/delist jobs.
pub fn is_active_status(status: JobStatus) -> bool {
    matches!(status, JobStatus::Pending | JobStatus::Processing)
}

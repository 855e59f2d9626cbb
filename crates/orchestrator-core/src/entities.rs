//! The entities in play across the orchestrator: users, listings, jobs, and
//! the per-marketplace bookkeeping rows that back the rate limiter, circuit
//! breaker, and dead-letter queue.
//!
//! These are semantic types only — persistence is [`crate::storage::Storage`]'s
//! concern, not this module's.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A reselling platform a listing can be posted to (eBay, Poshmark, ...).
///
/// Marketplace identity is a plain string rather than a closed enum: the
/// registry in [`crate::marketplace::MarketplaceRegistry`] is the source of
/// truth for which names are actually wired up, and new marketplaces are
/// added there without touching the entity model.
pub type Marketplace = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingStatus {
    Draft,
    Active,
    Sold,
    Delisted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub description: String,
    /// Price in minor units (cents) to avoid floating-point decimals.
    pub price_cents: i64,
    pub images: Vec<String>,
    pub category: Option<String>,
    pub status: ListingStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingPostStatus {
    Pending,
    Posted,
    Failed,
    Delisted,
}

/// One row per (listing, marketplace) attempt set — the materialized
/// presence (or attempted presence) of a [`Listing`] on one marketplace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingPost {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub marketplace: Marketplace,
    pub external_id: Option<String>,
    pub external_url: Option<String>,
    pub status: ListingPostStatus,
    pub error_message: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketplaceConnection {
    pub id: Uuid,
    pub user_id: Uuid,
    pub marketplace: Marketplace,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub is_connected: bool,
    pub settings: serde_json::Value,
}

impl MarketplaceConnection {
    /// Whether the access token needs a refresh before use.
    pub fn is_token_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.token_expires_at, Some(exp) if now >= exp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

/// The typed payload carried by a [`Job`], keyed by [`JobType`].
///
/// Modeled as a discriminated union rather than an opaque blob so that
/// unknown job types are rejected at enqueue time instead of surfacing as a
/// runtime deserialization failure deep inside the worker loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobData {
    PostListing {
        listing_id: Uuid,
        marketplaces: Vec<Marketplace>,
    },
    DelistListing {
        listing_id: Uuid,
        marketplaces: Option<Vec<Marketplace>>,
        reason: Option<String>,
    },
    SyncInventory {
        listing_id: Uuid,
        sold_marketplace: Marketplace,
    },
    AutomationExecute {
        rule_id: Uuid,
        marketplace: Marketplace,
        action: String,
        params: serde_json::Value,
    },
    AutomationBatch {
        rule_id: Uuid,
        items: Vec<serde_json::Value>,
    },
}

impl JobData {
    /// The stable string discriminant stored alongside the payload and used
    /// for routing to a [`crate::processors::JobProcessor`].
    pub fn job_type(&self) -> JobType {
        match self {
            JobData::PostListing { .. } => JobType::PostListing,
            JobData::DelistListing { .. } => JobType::DelistListing,
            JobData::SyncInventory { .. } => JobType::SyncInventory,
            JobData::AutomationExecute { .. } => JobType::AutomationExecute,
            JobData::AutomationBatch { .. } => JobType::AutomationBatch,
        }
    }

    /// The marketplace a single-marketplace job concerns, or the first entry
    /// of a multi-marketplace job's list — used by the worker loop to pick
    /// which circuit breaker and rate limiter apply before dispatch.
    pub fn primary_marketplace(&self) -> Option<&str> {
        match self {
            JobData::PostListing { marketplaces, .. } => marketplaces.first().map(String::as_str),
            JobData::DelistListing { marketplaces, .. } => marketplaces
                .as_ref()
                .and_then(|m| m.first())
                .map(String::as_str),
            JobData::SyncInventory { sold_marketplace, .. } => Some(sold_marketplace.as_str()),
            JobData::AutomationExecute { marketplace, .. } => Some(marketplace.as_str()),
            JobData::AutomationBatch { .. } => None,
        }
    }

    /// The listing a post/delist/sync-inventory job concerns, if any.
    pub fn listing_id(&self) -> Option<Uuid> {
        match self {
            JobData::PostListing { listing_id, .. }
            | JobData::DelistListing { listing_id, .. }
            | JobData::SyncInventory { listing_id, .. } => Some(*listing_id),
            JobData::AutomationExecute { .. } | JobData::AutomationBatch { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    PostListing,
    DelistListing,
    SyncInventory,
    AutomationExecute,
    AutomationBatch,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::PostListing => "post_listing",
            JobType::DelistListing => "delist_listing",
            JobType::SyncInventory => "sync_inventory",
            JobType::AutomationExecute => "automation_execute",
            JobType::AutomationBatch => "automation_batch",
        }
    }
}

/// Which source produced a scheduled slot — kept so post-hoc analysis can
/// weigh learned windows against static defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingMetadata {
    pub reasoning: String,
    pub basis: SchedulingBasis,
    pub confidence_score: u8,
    pub estimated_success_rate: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingBasis {
    DefaultWindow,
    UserAnalytics,
    Fallback,
    Immediate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: Uuid,
    pub job_type: JobType,
    pub data: JobData,
    pub priority: i32,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub scheduled_for: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub marketplace_group: Option<Uuid>,
    pub scheduling_metadata: Option<SchedulingMetadata>,
}

impl Job {
    /// `attempts` never exceeds `max_attempts`, and terminal statuses always
    /// carry a `completed_at`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    RateLimit,
    Network,
    Auth,
    ServerError,
    ClientError,
    MarketplaceMaintenance,
    Temporary,
    DataValidation,
    Permanent,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRetryHistory {
    pub job_id: Uuid,
    pub attempt_number: i32,
    pub failure_category: FailureCategory,
    pub error_type: String,
    pub error_message: String,
    pub marketplace: Option<Marketplace>,
    pub retry_delay_ms: i64,
    pub next_retry_at: DateTime<Utc>,
    pub processing_duration_ms: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerThresholds {
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
    pub timeout_ms: i64,
    pub half_open_max: u32,
}

impl Default for CircuitBreakerThresholds {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_threshold: 3,
            timeout_ms: 60_000,
            half_open_max: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub marketplace: Marketplace,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub half_open_in_flight: u32,
    pub thresholds: CircuitBreakerThresholds,
}

impl CircuitBreakerStatus {
    pub fn closed(marketplace: impl Into<String>, thresholds: CircuitBreakerThresholds) -> Self {
        Self {
            marketplace: marketplace.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            last_success_at: None,
            opened_at: None,
            next_retry_at: None,
            half_open_in_flight: 0,
            thresholds,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitWindowKind {
    Minute,
    Hour,
    Day,
}

impl RateLimitWindowKind {
    pub fn duration(&self) -> chrono::Duration {
        match self {
            RateLimitWindowKind::Minute => chrono::Duration::minutes(1),
            RateLimitWindowKind::Hour => chrono::Duration::hours(1),
            RateLimitWindowKind::Day => chrono::Duration::days(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitWindow {
    pub marketplace: Marketplace,
    pub window_kind: RateLimitWindowKind,
    pub window_start: DateTime<Utc>,
    pub count: u32,
    pub limit: u32,
}

/// Persisted adaptive backoff state for a marketplace's rate limiter,
/// updated on every call outcome rather than derived from retry history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitMultiplier {
    pub marketplace: Marketplace,
    pub multiplier: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqResolutionStatus {
    Pending,
    Resolved,
    Discarded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub original_job_id: Uuid,
    pub job_type: JobType,
    pub user_id: Uuid,
    pub final_failure_category: FailureCategory,
    pub total_attempts: i32,
    pub last_error: String,
    pub payload: JobData,
    pub requires_manual_review: bool,
    pub resolution_status: DlqResolutionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimalWindow {
    /// 0 = Sunday, matching `chrono::Weekday::num_days_from_sunday`.
    pub day_of_week: u8,
    pub start_hour: u8,
    pub end_hour: u8,
    pub timezone: String,
    pub score: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketplacePostingRule {
    pub marketplace: Marketplace,
    pub optimal_windows: Vec<OptimalWindow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostingSuccessAnalytics {
    pub user_id: Uuid,
    pub marketplace: Marketplace,
    pub listing_id: Uuid,
    pub posted_at: DateTime<Utc>,
    pub day_of_week: u8,
    pub hour_of_day: u8,
    pub views: u32,
    pub likes: u32,
    pub messages: u32,
    pub sold: bool,
    pub days_to_sell: Option<u32>,
    pub success_score: f64,
    pub engagement_score: f64,
}

impl PostingSuccessAnalytics {
    /// `engagementScore = messages*10 + likes*3 + views*0.1`, capped at 100.
    pub fn compute_engagement_score(messages: u32, likes: u32, views: u32) -> f64 {
        let raw = messages as f64 * 10.0 + likes as f64 * 3.0 + views as f64 * 0.1;
        raw.min(100.0)
    }

    /// `successScore = 70 if success else 30 + 0.3 * engagementScore`.
    pub fn compute_success_score(success: bool, engagement_score: f64) -> f64 {
        if success {
            70.0
        } else {
            30.0 + 0.3 * engagement_score
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Plan {
    Free,
    Pro,
    Business,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub timezone: String,
    pub plan: Plan,
}

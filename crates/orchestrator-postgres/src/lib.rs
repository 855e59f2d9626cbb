//! PostgreSQL-backed [`Storage`] for the listing orchestrator.
//!
//! Follows the `FOR UPDATE SKIP LOCKED` atomic-claim pattern for jobs;
//! structured fields (job payloads, scheduling metadata, connection
//! settings) are stored as `JSONB` via `sqlx::types::Json` rather than
//! mapped onto native Postgres enums, keeping the schema stable as
//! [`JobData`] variants are added.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE listings (
//!     id UUID PRIMARY KEY,
//!     user_id UUID NOT NULL,
//!     title TEXT NOT NULL,
//!     description TEXT NOT NULL,
//!     price_cents BIGINT NOT NULL,
//!     images JSONB NOT NULL,
//!     category TEXT,
//!     status TEXT NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE TABLE marketplace_connections (
//!     id UUID PRIMARY KEY,
//!     user_id UUID NOT NULL,
//!     marketplace TEXT NOT NULL,
//!     access_token TEXT NOT NULL,
//!     refresh_token TEXT,
//!     token_expires_at TIMESTAMPTZ,
//!     is_connected BOOLEAN NOT NULL,
//!     settings JSONB NOT NULL,
//!     UNIQUE (user_id, marketplace)
//! );
//!
//! CREATE TABLE listing_posts (
//!     id UUID PRIMARY KEY,
//!     listing_id UUID NOT NULL,
//!     marketplace TEXT NOT NULL,
//!     external_id TEXT,
//!     external_url TEXT,
//!     status TEXT NOT NULL,
//!     error_message TEXT,
//!     posted_at TIMESTAMPTZ,
//!     UNIQUE (listing_id, marketplace)
//! );
//!
//! CREATE TABLE jobs (
//!     id UUID PRIMARY KEY,
//!     user_id UUID NOT NULL,
//!     job_type TEXT NOT NULL,
//!     data JSONB NOT NULL,
//!     priority INTEGER NOT NULL,
//!     status TEXT NOT NULL,
//!     attempts INTEGER NOT NULL,
//!     max_attempts INTEGER NOT NULL,
//!     progress SMALLINT NOT NULL,
//!     result JSONB,
//!     error_message TEXT,
//!     scheduled_for TIMESTAMPTZ NOT NULL,
//!     started_at TIMESTAMPTZ,
//!     completed_at TIMESTAMPTZ,
//!     marketplace_group UUID,
//!     scheduling_metadata JSONB
//! );
//!
//! CREATE INDEX idx_jobs_due ON jobs (priority DESC, scheduled_for ASC)
//!     WHERE status = 'pending';
//!
//! CREATE TABLE job_retry_history (
//!     job_id UUID NOT NULL,
//!     attempt_number INTEGER NOT NULL,
//!     failure_category TEXT NOT NULL,
//!     error_type TEXT NOT NULL,
//!     error_message TEXT NOT NULL,
//!     marketplace TEXT,
//!     retry_delay_ms BIGINT NOT NULL,
//!     next_retry_at TIMESTAMPTZ NOT NULL,
//!     processing_duration_ms BIGINT NOT NULL,
//!     timestamp TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE TABLE circuit_breaker_status (
//!     marketplace TEXT PRIMARY KEY,
//!     status JSONB NOT NULL
//! );
//!
//! CREATE TABLE rate_limit_windows (
//!     marketplace TEXT NOT NULL,
//!     window_kind TEXT NOT NULL,
//!     window JSONB NOT NULL,
//!     PRIMARY KEY (marketplace, window_kind)
//! );
//!
//! CREATE TABLE rate_limit_multipliers (
//!     marketplace TEXT PRIMARY KEY,
//!     multiplier DOUBLE PRECISION NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE TABLE dead_letter_entries (
//!     id UUID PRIMARY KEY,
//!     user_id UUID NOT NULL,
//!     entry JSONB NOT NULL,
//!     resolution_status TEXT NOT NULL
//! );
//!
//! CREATE TABLE marketplace_posting_rules (
//!     marketplace TEXT PRIMARY KEY,
//!     rule JSONB NOT NULL
//! );
//!
//! CREATE TABLE posting_success_analytics (
//!     user_id UUID NOT NULL,
//!     marketplace TEXT NOT NULL,
//!     record JSONB NOT NULL
//! );
//!
//! CREATE TABLE audit_log (
//!     id UUID PRIMARY KEY,
//!     entry JSONB NOT NULL
//! );
//! ```

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator_core::entities::{
    AuditLog, CircuitBreakerStatus, DeadLetterEntry, DlqResolutionStatus, Job, JobData,
    JobRetryHistory, JobStatus, JobType, Listing, ListingPost, ListingPostStatus, ListingStatus,
    MarketplaceConnection, MarketplacePostingRule, PostingSuccessAnalytics, RateLimitMultiplier,
    RateLimitWindow, RateLimitWindowKind,
};
use orchestrator_core::storage::{Storage, StorageResult};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

fn status_str(status: ListingStatus) -> &'static str {
    match status {
        ListingStatus::Draft => "draft",
        ListingStatus::Active => "active",
        ListingStatus::Sold => "sold",
        ListingStatus::Delisted => "delisted",
    }
}

fn parse_listing_status(raw: &str) -> Result<ListingStatus> {
    Ok(match raw {
        "draft" => ListingStatus::Draft,
        "active" => ListingStatus::Active,
        "sold" => ListingStatus::Sold,
        "delisted" => ListingStatus::Delisted,
        other => return Err(anyhow!("unknown listing status {other}")),
    })
}

fn post_status_str(status: ListingPostStatus) -> &'static str {
    match status {
        ListingPostStatus::Pending => "pending",
        ListingPostStatus::Posted => "posted",
        ListingPostStatus::Failed => "failed",
        ListingPostStatus::Delisted => "delisted",
    }
}

fn parse_post_status(raw: &str) -> Result<ListingPostStatus> {
    Ok(match raw {
        "pending" => ListingPostStatus::Pending,
        "posted" => ListingPostStatus::Posted,
        "failed" => ListingPostStatus::Failed,
        "delisted" => ListingPostStatus::Delisted,
        other => return Err(anyhow!("unknown listing post status {other}")),
    })
}

fn job_status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Processing => "processing",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

fn parse_job_status(raw: &str) -> Result<JobStatus> {
    Ok(match raw {
        "pending" => JobStatus::Pending,
        "processing" => JobStatus::Processing,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        other => return Err(anyhow!("unknown job status {other}")),
    })
}

fn window_kind_str(kind: RateLimitWindowKind) -> &'static str {
    match kind {
        RateLimitWindowKind::Minute => "minute",
        RateLimitWindowKind::Hour => "hour",
        RateLimitWindowKind::Day => "day",
    }
}

/// Postgres-backed implementation of [`Storage`].
#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Return claimed jobs whose lease (tracked via `started_at` +
    /// `lease_ms`) has expired back to `pending`. Intended to be run
    /// periodically by a maintenance task alongside the worker loop.
    pub async fn reclaim_expired(&self, lease_ms: i64) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(lease_ms);
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', started_at = NULL
            WHERE status = 'processing' AND started_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Extend a claimed job's lease by touching `started_at` forward,
    /// keeping it from being swept up by [`Self::reclaim_expired`] while a
    /// long-running processor is still working it.
    pub async fn heartbeat(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"UPDATE jobs SET started_at = NOW() WHERE id = $1 AND status = 'processing'"#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn get_listing(&self, listing_id: Uuid) -> StorageResult<Option<Listing>> {
        let row = sqlx::query(
            "SELECT id, user_id, title, description, price_cents, images, category, status, created_at
             FROM listings WHERE id = $1",
        )
        .bind(listing_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_listing")?;

        row.map(|r| {
            Ok(Listing {
                id: r.get("id"),
                user_id: r.get("user_id"),
                title: r.get("title"),
                description: r.get("description"),
                price_cents: r.get("price_cents"),
                images: r.get::<Json<Vec<String>>, _>("images").0,
                category: r.get("category"),
                status: parse_listing_status(r.get("status"))?,
                created_at: r.get("created_at"),
            })
        })
        .transpose()
    }

    async fn update_listing_status(&self, listing_id: Uuid, status: ListingStatus) -> StorageResult<()> {
        sqlx::query("UPDATE listings SET status = $1 WHERE id = $2")
            .bind(status_str(status))
            .bind(listing_id)
            .execute(&self.pool)
            .await
            .context("update_listing_status")?;
        Ok(())
    }

    async fn get_connection(
        &self,
        user_id: Uuid,
        marketplace: &str,
    ) -> StorageResult<Option<MarketplaceConnection>> {
        let row = sqlx::query(
            "SELECT id, user_id, marketplace, access_token, refresh_token, token_expires_at, is_connected, settings
             FROM marketplace_connections WHERE user_id = $1 AND marketplace = $2",
        )
        .bind(user_id)
        .bind(marketplace)
        .fetch_optional(&self.pool)
        .await
        .context("get_connection")?;

        Ok(row.map(|r| MarketplaceConnection {
            id: r.get("id"),
            user_id: r.get("user_id"),
            marketplace: r.get("marketplace"),
            access_token: r.get("access_token"),
            refresh_token: r.get("refresh_token"),
            token_expires_at: r.get("token_expires_at"),
            is_connected: r.get("is_connected"),
            settings: r.get::<Json<serde_json::Value>, _>("settings").0,
        }))
    }

    async fn save_connection(&self, connection: &MarketplaceConnection) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO marketplace_connections
                (id, user_id, marketplace, access_token, refresh_token, token_expires_at, is_connected, settings)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (user_id, marketplace) DO UPDATE SET
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                token_expires_at = EXCLUDED.token_expires_at,
                is_connected = EXCLUDED.is_connected,
                settings = EXCLUDED.settings
            "#,
        )
        .bind(connection.id)
        .bind(connection.user_id)
        .bind(&connection.marketplace)
        .bind(&connection.access_token)
        .bind(&connection.refresh_token)
        .bind(connection.token_expires_at)
        .bind(connection.is_connected)
        .bind(Json(&connection.settings))
        .execute(&self.pool)
        .await
        .context("save_connection")?;
        Ok(())
    }

    async fn find_listing_post(
        &self,
        listing_id: Uuid,
        marketplace: &str,
    ) -> StorageResult<Option<ListingPost>> {
        let row = sqlx::query(
            "SELECT id, listing_id, marketplace, external_id, external_url, status, error_message, posted_at
             FROM listing_posts WHERE listing_id = $1 AND marketplace = $2",
        )
        .bind(listing_id)
        .bind(marketplace)
        .fetch_optional(&self.pool)
        .await
        .context("find_listing_post")?;

        row.map(|r| {
            Ok(ListingPost {
                id: r.get("id"),
                listing_id: r.get("listing_id"),
                marketplace: r.get("marketplace"),
                external_id: r.get("external_id"),
                external_url: r.get("external_url"),
                status: parse_post_status(r.get("status"))?,
                error_message: r.get("error_message"),
                posted_at: r.get("posted_at"),
            })
        })
        .transpose()
    }

    async fn list_listing_posts(&self, listing_id: Uuid) -> StorageResult<Vec<ListingPost>> {
        let rows = sqlx::query(
            "SELECT id, listing_id, marketplace, external_id, external_url, status, error_message, posted_at
             FROM listing_posts WHERE listing_id = $1",
        )
        .bind(listing_id)
        .fetch_all(&self.pool)
        .await
        .context("list_listing_posts")?;

        rows.into_iter()
            .map(|r| {
                Ok(ListingPost {
                    id: r.get("id"),
                    listing_id: r.get("listing_id"),
                    marketplace: r.get("marketplace"),
                    external_id: r.get("external_id"),
                    external_url: r.get("external_url"),
                    status: parse_post_status(r.get("status"))?,
                    error_message: r.get("error_message"),
                    posted_at: r.get("posted_at"),
                })
            })
            .collect()
    }

    async fn upsert_listing_post(&self, post: &ListingPost) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO listing_posts
                (id, listing_id, marketplace, external_id, external_url, status, error_message, posted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (listing_id, marketplace) DO UPDATE SET
                external_id = EXCLUDED.external_id,
                external_url = EXCLUDED.external_url,
                status = EXCLUDED.status,
                error_message = EXCLUDED.error_message,
                posted_at = EXCLUDED.posted_at
            "#,
        )
        .bind(post.id)
        .bind(post.listing_id)
        .bind(&post.marketplace)
        .bind(&post.external_id)
        .bind(&post.external_url)
        .bind(post_status_str(post.status))
        .bind(&post.error_message)
        .bind(post.posted_at)
        .execute(&self.pool)
        .await
        .context("upsert_listing_post")?;
        Ok(())
    }

    async fn create_job(&self, job: &Job) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs
                (id, user_id, job_type, data, priority, status, attempts, max_attempts, progress,
                 result, error_message, scheduled_for, started_at, completed_at, marketplace_group,
                 scheduling_metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(job.id)
        .bind(job.user_id)
        .bind(job.job_type.as_str())
        .bind(Json(&job.data))
        .bind(job.priority)
        .bind(job_status_str(job.status))
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.progress as i16)
        .bind(job.result.as_ref().map(Json))
        .bind(&job.error_message)
        .bind(job.scheduled_for)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.marketplace_group)
        .bind(job.scheduling_metadata.as_ref().map(Json))
        .execute(&self.pool)
        .await
        .context("create_job")?;
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> StorageResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("get_job")?;
        row.map(row_to_job).transpose()
    }

    async fn list_due_jobs(&self, now: DateTime<Utc>, limit: i64) -> StorageResult<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status = 'pending' AND scheduled_for <= $1
             ORDER BY priority DESC, scheduled_for ASC LIMIT $2",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("list_due_jobs")?;
        rows.into_iter().map(row_to_job).collect()
    }

    async fn claim_job(&self, job_id: Uuid, now: DateTime<Utc>) -> StorageResult<Option<Job>> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'processing', started_at = $2, attempts = attempts + 1
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("claim_job")?;
        row.map(row_to_job).transpose()
    }

    async fn save_job(&self, job: &Job) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                status = $2, attempts = $3, progress = $4, result = $5, error_message = $6,
                scheduled_for = $7, started_at = $8, completed_at = $9, scheduling_metadata = $10
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job_status_str(job.status))
        .bind(job.attempts)
        .bind(job.progress as i16)
        .bind(job.result.as_ref().map(Json))
        .bind(&job.error_message)
        .bind(job.scheduled_for)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.scheduling_metadata.as_ref().map(Json))
        .execute(&self.pool)
        .await
        .context("save_job")?;
        Ok(())
    }

    async fn cancel_job(&self, job_id: Uuid) -> StorageResult<bool> {
        let result = sqlx::query("UPDATE jobs SET status = 'cancelled' WHERE id = $1 AND status = 'pending'")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .context("cancel_job")?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_jobs_by_marketplace_group(&self, group_id: Uuid) -> StorageResult<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE marketplace_group = $1 AND status IN ('pending', 'processing')",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .context("list_jobs_by_marketplace_group")?;
        rows.into_iter().map(row_to_job).collect()
    }

    async fn list_jobs_for_listing(&self, listing_id: Uuid) -> StorageResult<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE data->>'listing_id' = $1")
            .bind(listing_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("list_jobs_for_listing")?;
        rows.into_iter().map(row_to_job).collect()
    }

    async fn record_retry_history(&self, entry: &JobRetryHistory) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO job_retry_history
                (job_id, attempt_number, failure_category, error_type, error_message, marketplace,
                 retry_delay_ms, next_retry_at, processing_duration_ms, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.job_id)
        .bind(entry.attempt_number)
        .bind(serde_json::to_value(entry.failure_category)?.as_str().unwrap_or_default())
        .bind(&entry.error_type)
        .bind(&entry.error_message)
        .bind(&entry.marketplace)
        .bind(entry.retry_delay_ms)
        .bind(entry.next_retry_at)
        .bind(entry.processing_duration_ms)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await
        .context("record_retry_history")?;
        Ok(())
    }

    async fn recent_retry_history(
        &self,
        marketplace: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<JobRetryHistory>> {
        let rows = sqlx::query(
            "SELECT job_id, attempt_number, failure_category, error_type, error_message, marketplace,
                    retry_delay_ms, next_retry_at, processing_duration_ms, timestamp
             FROM job_retry_history WHERE marketplace = $1 AND timestamp >= $2",
        )
        .bind(marketplace)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("recent_retry_history")?;

        rows.into_iter()
            .map(|r| {
                let category_str: String = r.get("failure_category");
                Ok(JobRetryHistory {
                    job_id: r.get("job_id"),
                    attempt_number: r.get("attempt_number"),
                    failure_category: serde_json::from_value(serde_json::Value::String(category_str))?,
                    error_type: r.get("error_type"),
                    error_message: r.get("error_message"),
                    marketplace: r.get("marketplace"),
                    retry_delay_ms: r.get("retry_delay_ms"),
                    next_retry_at: r.get("next_retry_at"),
                    processing_duration_ms: r.get("processing_duration_ms"),
                    timestamp: r.get("timestamp"),
                })
            })
            .collect()
    }

    async fn get_circuit_breaker_status(
        &self,
        marketplace: &str,
    ) -> StorageResult<Option<CircuitBreakerStatus>> {
        let row = sqlx::query("SELECT status FROM circuit_breaker_status WHERE marketplace = $1")
            .bind(marketplace)
            .fetch_optional(&self.pool)
            .await
            .context("get_circuit_breaker_status")?;
        Ok(row.map(|r| r.get::<Json<CircuitBreakerStatus>, _>("status").0))
    }

    async fn save_circuit_breaker_status(&self, status: &CircuitBreakerStatus) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO circuit_breaker_status (marketplace, status)
            VALUES ($1, $2)
            ON CONFLICT (marketplace) DO UPDATE SET status = EXCLUDED.status
            "#,
        )
        .bind(&status.marketplace)
        .bind(Json(status))
        .execute(&self.pool)
        .await
        .context("save_circuit_breaker_status")?;
        Ok(())
    }

    async fn get_rate_limit_window(
        &self,
        marketplace: &str,
        kind: RateLimitWindowKind,
    ) -> StorageResult<Option<RateLimitWindow>> {
        let row = sqlx::query(
            "SELECT window FROM rate_limit_windows WHERE marketplace = $1 AND window_kind = $2",
        )
        .bind(marketplace)
        .bind(window_kind_str(kind))
        .fetch_optional(&self.pool)
        .await
        .context("get_rate_limit_window")?;
        Ok(row.map(|r| r.get::<Json<RateLimitWindow>, _>("window").0))
    }

    async fn save_rate_limit_window(&self, window: &RateLimitWindow) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_limit_windows (marketplace, window_kind, window)
            VALUES ($1, $2, $3)
            ON CONFLICT (marketplace, window_kind) DO UPDATE SET window = EXCLUDED.window
            "#,
        )
        .bind(&window.marketplace)
        .bind(window_kind_str(window.window_kind))
        .bind(Json(window))
        .execute(&self.pool)
        .await
        .context("save_rate_limit_window")?;
        Ok(())
    }

    async fn get_rate_limit_multiplier(&self, marketplace: &str) -> StorageResult<Option<RateLimitMultiplier>> {
        let row = sqlx::query("SELECT marketplace, multiplier, updated_at FROM rate_limit_multipliers WHERE marketplace = $1")
            .bind(marketplace)
            .fetch_optional(&self.pool)
            .await
            .context("get_rate_limit_multiplier")?;
        Ok(row.map(|r| RateLimitMultiplier {
            marketplace: r.get("marketplace"),
            multiplier: r.get("multiplier"),
            updated_at: r.get("updated_at"),
        }))
    }

    async fn save_rate_limit_multiplier(&self, multiplier: &RateLimitMultiplier) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_limit_multipliers (marketplace, multiplier, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (marketplace) DO UPDATE SET
                multiplier = EXCLUDED.multiplier, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&multiplier.marketplace)
        .bind(multiplier.multiplier)
        .bind(multiplier.updated_at)
        .execute(&self.pool)
        .await
        .context("save_rate_limit_multiplier")?;
        Ok(())
    }

    async fn create_dlq_entry(&self, entry: &DeadLetterEntry) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO dead_letter_entries (id, user_id, entry, resolution_status) VALUES ($1, $2, $3, $4)",
        )
        .bind(entry.id)
        .bind(entry.user_id)
        .bind(Json(entry))
        .bind(resolution_status_str(entry.resolution_status))
        .execute(&self.pool)
        .await
        .context("create_dlq_entry")?;
        Ok(())
    }

    async fn get_dlq_entry(&self, id: Uuid) -> StorageResult<Option<DeadLetterEntry>> {
        let row = sqlx::query("SELECT entry FROM dead_letter_entries WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("get_dlq_entry")?;
        Ok(row.map(|r| r.get::<Json<DeadLetterEntry>, _>("entry").0))
    }

    async fn list_dlq_entries_by_user(&self, user_id: Uuid) -> StorageResult<Vec<DeadLetterEntry>> {
        let rows = sqlx::query("SELECT entry FROM dead_letter_entries WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .context("list_dlq_entries_by_user")?;
        Ok(rows
            .into_iter()
            .map(|r| r.get::<Json<DeadLetterEntry>, _>("entry").0)
            .collect())
    }

    async fn set_dlq_resolution(&self, id: Uuid, status: DlqResolutionStatus) -> StorageResult<()> {
        sqlx::query(
            "UPDATE dead_letter_entries SET resolution_status = $1,
                entry = jsonb_set(entry, '{resolution_status}', to_jsonb($1::text))
             WHERE id = $2",
        )
        .bind(resolution_status_str(status))
        .bind(id)
        .execute(&self.pool)
        .await
        .context("set_dlq_resolution")?;
        Ok(())
    }

    async fn get_posting_rule(&self, marketplace: &str) -> StorageResult<Option<MarketplacePostingRule>> {
        let row = sqlx::query("SELECT rule FROM marketplace_posting_rules WHERE marketplace = $1")
            .bind(marketplace)
            .fetch_optional(&self.pool)
            .await
            .context("get_posting_rule")?;
        Ok(row.map(|r| r.get::<Json<MarketplacePostingRule>, _>("rule").0))
    }

    async fn record_posting_analytics(&self, analytics: &PostingSuccessAnalytics) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO posting_success_analytics (user_id, marketplace, record) VALUES ($1, $2, $3)",
        )
        .bind(analytics.user_id)
        .bind(&analytics.marketplace)
        .bind(Json(analytics))
        .execute(&self.pool)
        .await
        .context("record_posting_analytics")?;
        Ok(())
    }

    async fn list_user_analytics(
        &self,
        user_id: Uuid,
        marketplace: &str,
    ) -> StorageResult<Vec<PostingSuccessAnalytics>> {
        let rows = sqlx::query(
            "SELECT record FROM posting_success_analytics WHERE user_id = $1 AND marketplace = $2",
        )
        .bind(user_id)
        .bind(marketplace)
        .fetch_all(&self.pool)
        .await
        .context("list_user_analytics")?;
        Ok(rows
            .into_iter()
            .map(|r| r.get::<Json<PostingSuccessAnalytics>, _>("record").0)
            .collect())
    }

    async fn create_audit_log(&self, entry: &AuditLog) -> StorageResult<()> {
        sqlx::query("INSERT INTO audit_log (id, entry) VALUES ($1, $2)")
            .bind(entry.id)
            .bind(Json(entry))
            .execute(&self.pool)
            .await
            .context("create_audit_log")?;
        Ok(())
    }

    async fn list_audit_logs_by_user(&self, user_id: Uuid) -> StorageResult<Vec<AuditLog>> {
        let rows = sqlx::query("SELECT entry FROM audit_log WHERE entry->>'user_id' = $1")
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("list_audit_logs_by_user")?;
        Ok(rows
            .into_iter()
            .map(|r| r.get::<Json<AuditLog>, _>("entry").0)
            .collect())
    }
}

fn resolution_status_str(status: DlqResolutionStatus) -> &'static str {
    match status {
        DlqResolutionStatus::Pending => "pending",
        DlqResolutionStatus::Resolved => "resolved",
        DlqResolutionStatus::Discarded => "discarded",
    }
}

fn row_to_job(row: sqlx::postgres::PgRow) -> Result<Job> {
    let job_type_str: String = row.get("job_type");
    let job_type = match job_type_str.as_str() {
        "post_listing" => JobType::PostListing,
        "delist_listing" => JobType::DelistListing,
        "sync_inventory" => JobType::SyncInventory,
        "automation_execute" => JobType::AutomationExecute,
        "automation_batch" => JobType::AutomationBatch,
        other => return Err(anyhow!("unknown job type {other}")),
    };

    Ok(Job {
        id: row.get("id"),
        user_id: row.get("user_id"),
        job_type,
        data: row.get::<Json<JobData>, _>("data").0,
        priority: row.get("priority"),
        status: parse_job_status(row.get("status"))?,
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        progress: row.get::<i16, _>("progress") as u8,
        result: row.get::<Option<Json<serde_json::Value>>, _>("result").map(|j| j.0),
        error_message: row.get("error_message"),
        scheduled_for: row.get("scheduled_for"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        marketplace_group: row.get("marketplace_group"),
        scheduling_metadata: row
            .get::<Option<Json<orchestrator_core::entities::SchedulingMetadata>>, _>("scheduling_metadata")
            .map(|j| j.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_round_trips_through_its_string_form() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(parse_job_status(job_status_str(status)).unwrap(), status);
        }
    }

    #[test]
    fn listing_status_round_trips_through_its_string_form() {
        for status in [
            ListingStatus::Draft,
            ListingStatus::Active,
            ListingStatus::Sold,
            ListingStatus::Delisted,
        ] {
            assert_eq!(parse_listing_status(status_str(status)).unwrap(), status);
        }
    }
}

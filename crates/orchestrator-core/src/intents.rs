//! The public API surface callers (an HTTP layer, a CLI, a cron) use to
//! enqueue and cancel work. Everything here is a thin, typed front door onto
//! [`Storage`] and the scheduler — no marketplace calls happen here.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::Clock;
use crate::entities::{Job, JobData, JobStatus, JobType, Marketplace};
use crate::error::OrchestratorError;
use crate::scheduler::SmartScheduler;
use crate::storage::{is_active_status, Storage};

/// One listing + destination marketplaces within a [`OrchestratorIntents::create_batch_posting_job`]
/// call.
#[derive(Debug, Clone)]
pub struct BatchPostingItem {
    pub listing_id: Uuid,
    pub marketplaces: Vec<Marketplace>,
}

pub struct OrchestratorIntents {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

fn new_job(user_id: Uuid, job_type: JobType, data: JobData, priority: i32) -> Job {
    Job {
        id: Uuid::new_v4(),
        user_id,
        job_type,
        data,
        priority,
        status: JobStatus::Pending,
        attempts: 0,
        max_attempts: 3,
        progress: 0,
        result: None,
        error_message: None,
        scheduled_for: chrono::Utc::now(),
        started_at: None,
        completed_at: None,
        marketplace_group: None,
        scheduling_metadata: None,
    }
}

impl OrchestratorIntents {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Create a post-listing job, letting the smart scheduler pick
    /// `scheduled_for` per marketplace unless `immediate` is set. Skips any
    /// marketplace that already has a pending or processing post/delist job
    /// for this listing, so retriggering a post doesn't queue a duplicate
    /// alongside one already in flight.
    pub async fn create_post_listing_job(
        &self,
        user_id: Uuid,
        listing_id: Uuid,
        marketplaces: Vec<Marketplace>,
        immediate: bool,
        requested_time: Option<DateTime<Utc>>,
        priority: i32,
    ) -> Result<Vec<Job>, OrchestratorError> {
        let active = self.active_marketplaces_for(listing_id).await?;
        let marketplaces: Vec<Marketplace> = marketplaces.into_iter().filter(|m| !active.contains(m)).collect();
        if marketplaces.is_empty() {
            return Ok(Vec::new());
        }

        let scheduler = SmartScheduler::new(self.storage.as_ref(), self.clock.as_ref());
        let plan = scheduler
            .schedule_batch(user_id, listing_id, &marketplaces, immediate, requested_time, priority)
            .await?;

        let group_id = Uuid::new_v4();
        let mut jobs = Vec::with_capacity(plan.slots.len());
        for slot in plan.slots {
            let mut job = new_job(
                user_id,
                JobType::PostListing,
                JobData::PostListing {
                    listing_id,
                    marketplaces: vec![slot.marketplace],
                },
                priority,
            );
            job.scheduled_for = slot.scheduled_for;
            job.marketplace_group = Some(group_id);
            job.scheduling_metadata = Some(slot.metadata);
            self.storage.create_job(&job).await.map_err(OrchestratorError::Storage)?;
            jobs.push(job);
        }
        Ok(jobs)
    }

    pub async fn create_delist_listing_job(
        &self,
        user_id: Uuid,
        listing_id: Uuid,
        marketplaces: Option<Vec<Marketplace>>,
        reason: Option<String>,
        urgent: bool,
    ) -> Result<Job, OrchestratorError> {
        let marketplaces = match marketplaces {
            Some(requested) => {
                let active = self.active_marketplaces_for(listing_id).await?;
                Some(requested.into_iter().filter(|m| !active.contains(m)).collect())
            }
            None => None,
        };

        let priority = if urgent { 9 } else { 5 };
        let mut job = new_job(
            user_id,
            JobType::DelistListing,
            JobData::DelistListing {
                listing_id,
                marketplaces,
                reason,
            },
            priority,
        );
        job.scheduled_for = self.clock.now();
        self.storage.create_job(&job).await.map_err(OrchestratorError::Storage)?;
        Ok(job)
    }

    /// Marketplaces that already have a pending or processing post/delist job
    /// for this listing, per the uniqueness rule that forbids queueing a
    /// second one alongside it.
    async fn active_marketplaces_for(&self, listing_id: Uuid) -> Result<HashSet<Marketplace>, OrchestratorError> {
        let jobs = self
            .storage
            .list_jobs_for_listing(listing_id)
            .await
            .map_err(OrchestratorError::Storage)?;

        let mut active = HashSet::new();
        for job in jobs {
            if !is_active_status(job.status) {
                continue;
            }
            match &job.data {
                JobData::PostListing { marketplaces, .. } => active.extend(marketplaces.iter().cloned()),
                JobData::DelistListing {
                    marketplaces: Some(marketplaces),
                    ..
                } => active.extend(marketplaces.iter().cloned()),
                _ => {}
            }
        }
        Ok(active)
    }

    pub async fn create_sync_inventory_job(
        &self,
        user_id: Uuid,
        listing_id: Uuid,
        sold_marketplace: Marketplace,
    ) -> Result<Job, OrchestratorError> {
        let mut job = new_job(
            user_id,
            JobType::SyncInventory,
            JobData::SyncInventory {
                listing_id,
                sold_marketplace,
            },
            10,
        );
        job.scheduled_for = self.clock.now();
        self.storage.create_job(&job).await.map_err(OrchestratorError::Storage)?;
        Ok(job)
    }

    /// Create one post-listing job per item, spread evenly across
    /// `distribution_minutes` starting at `requested_time` (or now) — a
    /// batch of unrelated listings going out over a window rather than all
    /// at once, distinct from [`Self::create_automation_batch_job`]'s single
    /// job covering many actions for one automation rule.
    pub async fn create_batch_posting_job(
        &self,
        user_id: Uuid,
        items: Vec<BatchPostingItem>,
        requested_time: Option<DateTime<Utc>>,
        distribution_minutes: i64,
    ) -> Result<Vec<Job>, OrchestratorError> {
        let start = requested_time.unwrap_or_else(|| self.clock.now());
        let total = items.len().max(1) as i64;
        let spacing_secs = (distribution_minutes.max(0) * 60) / total;

        let mut jobs = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            let mut job = new_job(
                user_id,
                JobType::PostListing,
                JobData::PostListing {
                    listing_id: item.listing_id,
                    marketplaces: item.marketplaces,
                },
                0,
            );
            job.scheduled_for = start + chrono::Duration::seconds(spacing_secs * i as i64);
            self.storage.create_job(&job).await.map_err(OrchestratorError::Storage)?;
            jobs.push(job);
        }
        Ok(jobs)
    }

    /// Create one `automation_execute` job for a rule's single action,
    /// tagged with the rule id as its marketplace group so
    /// [`Self::cancel_automation_jobs`] can find it later.
    pub async fn create_automation_execute_job(
        &self,
        user_id: Uuid,
        rule_id: Uuid,
        marketplace: Marketplace,
        action: String,
        params: serde_json::Value,
    ) -> Result<Job, OrchestratorError> {
        let mut job = new_job(
            user_id,
            JobType::AutomationExecute,
            JobData::AutomationExecute {
                rule_id,
                marketplace,
                action,
                params,
            },
            0,
        );
        job.scheduled_for = self.clock.now();
        job.marketplace_group = Some(rule_id);
        self.storage.create_job(&job).await.map_err(OrchestratorError::Storage)?;
        Ok(job)
    }

    /// Create one `automation_batch` job covering every item in the batch,
    /// scheduled immediately and tagged with the rule id as its marketplace
    /// group — batches are already a deliberate grouping by the caller, so
    /// the posting scheduler's per-marketplace spacing doesn't apply.
    pub async fn create_automation_batch_job(
        &self,
        user_id: Uuid,
        rule_id: Uuid,
        items: Vec<serde_json::Value>,
    ) -> Result<Job, OrchestratorError> {
        let mut job = new_job(
            user_id,
            JobType::AutomationBatch,
            JobData::AutomationBatch { rule_id, items },
            0,
        );
        job.scheduled_for = self.clock.now();
        job.marketplace_group = Some(rule_id);
        self.storage.create_job(&job).await.map_err(OrchestratorError::Storage)?;
        Ok(job)
    }

    /// Cancel every still-pending job belonging to an automation rule's
    /// marketplace group.
    pub async fn cancel_automation_jobs(&self, group_id: Uuid) -> Result<u32, OrchestratorError> {
        let jobs = self
            .storage
            .list_jobs_by_marketplace_group(group_id)
            .await
            .map_err(OrchestratorError::Storage)?;

        let mut cancelled = 0u32;
        for job in jobs {
            if self
                .storage
                .cancel_job(job.id)
                .await
                .map_err(OrchestratorError::Storage)?
            {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }
}

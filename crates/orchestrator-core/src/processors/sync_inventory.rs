use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::entities::{Job, JobData, JobStatus, JobType, ListingPostStatus, ListingStatus};
use crate::progress::ProgressEvent;

use super::{JobProcessor, ProcessorContext, ProcessorOutcome};

/// When a listing sells on one marketplace, delist it everywhere else so the
/// same item can't be sold twice. Emits no marketplace calls itself — it
/// hands off to a `delist-listing` job so the delist runs through the usual
/// circuit breaker and rate limiter.
pub struct SyncInventoryProcessor;

#[async_trait]
impl JobProcessor for SyncInventoryProcessor {
    fn job_type(&self) -> JobType {
        JobType::SyncInventory
    }

    async fn process(&self, job: &Job, ctx: &ProcessorContext<'_>) -> anyhow::Result<ProcessorOutcome> {
        let (listing_id, sold_marketplace) = match &job.data {
            JobData::SyncInventory {
                listing_id,
                sold_marketplace,
            } => (*listing_id, sold_marketplace.clone()),
            other => return Err(anyhow!("sync_inventory processor received {:?}", other.job_type())),
        };

        ctx.storage
            .update_listing_status(listing_id, ListingStatus::Sold)
            .await?;

        let other_marketplaces: Vec<_> = ctx
            .storage
            .list_listing_posts(listing_id)
            .await?
            .into_iter()
            .filter(|p| p.status == ListingPostStatus::Posted && p.marketplace != sold_marketplace)
            .map(|p| p.marketplace)
            .collect();

        if !other_marketplaces.is_empty() {
            let delist_job = Job {
                id: Uuid::new_v4(),
                user_id: job.user_id,
                job_type: JobType::DelistListing,
                data: JobData::DelistListing {
                    listing_id,
                    marketplaces: Some(other_marketplaces.clone()),
                    reason: Some("sold_on_other_marketplace".to_string()),
                },
                priority: 8,
                status: JobStatus::Pending,
                attempts: 0,
                max_attempts: 3,
                progress: 0,
                result: None,
                error_message: None,
                scheduled_for: ctx.clock.now() + chrono::Duration::seconds(10),
                started_at: None,
                completed_at: None,
                marketplace_group: None,
                scheduling_metadata: None,
            };
            ctx.storage.create_job(&delist_job).await?;
        }

        ctx.progress.emit(
            job.user_id,
            ProgressEvent::JobStatus {
                job_id: job.id,
                status: "inventory_synced".to_string(),
                at: ctx.clock.now(),
            },
        );

        let result = json!({ "sold_on": sold_marketplace, "delisted_from": other_marketplaces });
        Ok(ProcessorOutcome::Completed { result })
    }
}

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::json;

use crate::entities::{Job, JobData, JobType, ListingPostStatus, ListingStatus};
use crate::progress::ProgressEvent;

use super::{JobProcessor, ProcessorContext, ProcessorOutcome};

pub struct DelistListingProcessor;

#[async_trait]
impl JobProcessor for DelistListingProcessor {
    fn job_type(&self) -> JobType {
        JobType::DelistListing
    }

    async fn process(&self, job: &Job, ctx: &ProcessorContext<'_>) -> anyhow::Result<ProcessorOutcome> {
        let (listing_id, marketplaces, reason) = match &job.data {
            JobData::DelistListing {
                listing_id,
                marketplaces,
                reason,
            } => (*listing_id, marketplaces.clone(), reason.clone()),
            other => return Err(anyhow!("delist_listing processor received {:?}", other.job_type())),
        };

        let targets = match marketplaces {
            Some(explicit) => explicit,
            None => ctx
                .storage
                .list_listing_posts(listing_id)
                .await?
                .into_iter()
                .filter(|p| p.status == ListingPostStatus::Posted)
                .map(|p| p.marketplace)
                .collect(),
        };

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();

        for marketplace in &targets {
            let Some(mut post) = ctx.storage.find_listing_post(listing_id, marketplace).await? else {
                continue;
            };
            let Some(external_id) = post.external_id.clone() else {
                continue;
            };
            let Some(connection) = ctx.storage.get_connection(job.user_id, marketplace).await? else {
                failed.push(marketplace.clone());
                continue;
            };

            let client = ctx.registry.client(marketplace)?;
            match client.delete_listing(&external_id, &connection).await {
                Ok(()) => {
                    post.status = ListingPostStatus::Delisted;
                    post.error_message = None;
                    ctx.storage.upsert_listing_post(&post).await?;
                    succeeded.push(marketplace.clone());
                }
                Err(err) => {
                    post.error_message = Some(err.to_string());
                    ctx.storage.upsert_listing_post(&post).await?;
                    failed.push(marketplace.clone());
                }
            }
        }

        if !failed.is_empty() && succeeded.is_empty() && !targets.is_empty() {
            return Err(anyhow!("failed to delist from: {:?}", failed));
        }

        if failed.is_empty() {
            ctx.storage
                .update_listing_status(listing_id, ListingStatus::Delisted)
                .await?;
        }

        ctx.progress.emit(
            job.user_id,
            ProgressEvent::JobStatus {
                job_id: job.id,
                status: "delisted".to_string(),
                at: ctx.clock.now(),
            },
        );

        let result = json!({ "succeeded": succeeded, "failed": failed, "reason": reason });
        if failed.is_empty() {
            Ok(ProcessorOutcome::Completed { result })
        } else {
            Ok(ProcessorOutcome::PartialSuccess {
                result,
                failed_marketplaces: failed,
            })
        }
    }
}

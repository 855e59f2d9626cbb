use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::json;

use crate::entities::{Job, JobData, JobType, ListingPostStatus, ListingStatus};
use crate::marketplace::CreatedListing;
use crate::progress::ProgressEvent;
use crate::storage::find_or_create_pending_post;

use super::{JobProcessor, ProcessorContext, ProcessorOutcome};

pub struct PostListingProcessor;

#[async_trait]
impl JobProcessor for PostListingProcessor {
    fn job_type(&self) -> JobType {
        JobType::PostListing
    }

    async fn process(&self, job: &Job, ctx: &ProcessorContext<'_>) -> anyhow::Result<ProcessorOutcome> {
        let (listing_id, marketplaces) = match &job.data {
            JobData::PostListing {
                listing_id,
                marketplaces,
            } => (*listing_id, marketplaces.clone()),
            other => return Err(anyhow!("post_listing processor received {:?}", other.job_type())),
        };

        let listing = ctx
            .storage
            .get_listing(listing_id)
            .await?
            .ok_or_else(|| anyhow!("listing {listing_id} not found"))?;

        let total = marketplaces.len() as u32;
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        let mut last_error: Option<anyhow::Error> = None;

        for (i, marketplace) in marketplaces.iter().enumerate() {
            match self.post_one(job, &listing, marketplace, ctx).await {
                Ok(()) => succeeded.push(marketplace.clone()),
                Err(outcome) => match outcome {
                    PostOneError::Preempted { retry_after_ms } if marketplaces.len() == 1 => {
                        return Ok(ProcessorOutcome::Rescheduled { retry_after_ms })
                    }
                    PostOneError::Preempted { retry_after_ms } => {
                        failed.push(marketplace.clone());
                        last_error = Some(anyhow!("{marketplace} preempted, retry after {retry_after_ms}ms"));
                    }
                    PostOneError::Failed(err) => {
                        failed.push(marketplace.clone());
                        last_error = Some(err);
                    }
                },
            }

            ctx.progress.emit(
                job.user_id,
                ProgressEvent::JobProgress {
                    job_id: job.id,
                    progress: (((i + 1) as f64 / total as f64) * 100.0) as u8,
                },
            );
        }

        if succeeded.is_empty() {
            return Err(last_error.unwrap_or_else(|| anyhow!("all marketplaces failed: {:?}", failed)));
        }

        ctx.storage
            .update_listing_status(listing_id, ListingStatus::Active)
            .await?;

        let result = json!({ "succeeded": succeeded, "failed": failed });
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

enum PostOneError {
    Preempted { retry_after_ms: i64 },
    Failed(anyhow::Error),
}

impl PostListingProcessor {
    async fn post_one(
        &self,
        job: &Job,
        listing: &crate::entities::Listing,
        marketplace: &str,
        ctx: &ProcessorContext<'_>,
    ) -> Result<(), PostOneError> {
        let breaker = ctx.circuit_breaker();
        let decision = breaker
            .should_allow(&marketplace.to_string())
            .await
            .map_err(|e| PostOneError::Failed(e.into()))?;
        if !decision.is_allowed() {
            let retry_after_ms = match decision {
                crate::circuit_breaker::AllowDecision::RejectOpen { retry_after_ms } => retry_after_ms,
                _ => 1_000,
            };
            return Err(PostOneError::Preempted { retry_after_ms });
        }

        let limiter = ctx.rate_limiter();
        let check = limiter
            .acquire(&marketplace.to_string())
            .await
            .map_err(|e| PostOneError::Failed(e.into()))?;
        if !check.allowed {
            ctx.progress.emit(
                job.user_id,
                ProgressEvent::RateLimit {
                    marketplace: marketplace.to_string(),
                    retry_after_ms: check.retry_after_ms,
                },
            );
            return Err(PostOneError::Preempted {
                retry_after_ms: check.retry_after_ms,
            });
        }

        let client = ctx
            .registry
            .client(marketplace)
            .map_err(|e| PostOneError::Failed(e.into()))?;
        let connection = ctx
            .storage
            .get_connection(job.user_id, marketplace)
            .await
            .map_err(PostOneError::Failed)?
            .ok_or_else(|| PostOneError::Failed(anyhow!("no connection for {marketplace}")))?;

        let delay_ms = limiter
            .optimal_delay_ms(&marketplace.to_string(), job.priority)
            .await
            .map_err(|e| PostOneError::Failed(e.into()))?;
        if delay_ms > 1_000 {
            ctx.progress.emit(
                job.user_id,
                ProgressEvent::Delaying {
                    job_id: job.id,
                    marketplace: marketplace.to_string(),
                    delay_ms,
                },
            );
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms as u64)).await;
        }

        let call_result = client.create_listing(listing, &connection).await;

        let success = call_result.is_ok();
        limiter
            .record(&marketplace.to_string(), success)
            .await
            .map_err(|e| PostOneError::Failed(e.into()))?;
        if success {
            let _ = breaker.record_success(&marketplace.to_string()).await;
        } else {
            let _ = breaker.record_failure(&marketplace.to_string()).await;
        }

        match call_result {
            Ok(CreatedListing { external_id, url }) => {
                let mut post = find_or_create_pending_post(ctx.storage, listing.id, marketplace)
                    .await
                    .map_err(PostOneError::Failed)?;
                post.external_id = Some(external_id);
                post.external_url = Some(url);
                post.status = ListingPostStatus::Posted;
                post.posted_at = Some(ctx.clock.now());
                post.error_message = None;
                ctx.storage
                    .upsert_listing_post(&post)
                    .await
                    .map_err(PostOneError::Failed)?;
                Ok(())
            }
            Err(err) => {
                let mut post = find_or_create_pending_post(ctx.storage, listing.id, marketplace)
                    .await
                    .map_err(PostOneError::Failed)?;
                post.status = ListingPostStatus::Failed;
                post.error_message = Some(err.to_string());
                ctx.storage
                    .upsert_listing_post(&post)
                    .await
                    .map_err(PostOneError::Failed)?;
                Err(PostOneError::Failed(
                    anyhow::Error::new(err).context(format!("posting to {marketplace}")),
                ))
            }
        }
    }
}


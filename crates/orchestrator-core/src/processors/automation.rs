use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::json;

use crate::entities::{Job, JobData, JobType};
use crate::progress::ProgressEvent;

use super::{JobProcessor, ProcessorContext, ProcessorOutcome};

enum DispatchError {
    Preempted { retry_after_ms: i64 },
    Failed(anyhow::Error),
}

/// Dispatches one automation action against one marketplace through the
/// same breaker/limiter/client path `post_listing.rs` uses for a post call.
/// `external_id` and the update partial are read out of `params`, since
/// `MarketplaceClient` has no generic "run an action" method — every
/// automation action is expressed as a listing update.
async fn dispatch(
    ctx: &ProcessorContext<'_>,
    user_id: uuid::Uuid,
    marketplace: &str,
    params: &serde_json::Value,
) -> Result<(), DispatchError> {
    let breaker = ctx.circuit_breaker();
    let decision = breaker
        .should_allow(&marketplace.to_string())
        .await
        .map_err(|e| DispatchError::Failed(e.into()))?;
    if !decision.is_allowed() {
        let retry_after_ms = match decision {
            crate::circuit_breaker::AllowDecision::RejectOpen { retry_after_ms } => retry_after_ms,
            _ => 1_000,
        };
        return Err(DispatchError::Preempted { retry_after_ms });
    }

    let limiter = ctx.rate_limiter();
    let check = limiter
        .acquire(&marketplace.to_string())
        .await
        .map_err(|e| DispatchError::Failed(e.into()))?;
    if !check.allowed {
        return Err(DispatchError::Preempted {
            retry_after_ms: check.retry_after_ms,
        });
    }

    let external_id = params
        .get("external_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| DispatchError::Failed(anyhow!("action params missing external_id")))?;
    let client = ctx
        .registry
        .client(marketplace)
        .map_err(|e| DispatchError::Failed(e.into()))?;
    let connection = ctx
        .storage
        .get_connection(user_id, marketplace)
        .await
        .map_err(DispatchError::Failed)?
        .ok_or_else(|| DispatchError::Failed(anyhow!("no connection for {marketplace}")))?;

    let call_result = client.update_listing(external_id, params, &connection).await;
    let success = call_result.is_ok();
    let _ = limiter.record(&marketplace.to_string(), success).await;
    if success {
        let _ = breaker.record_success(&marketplace.to_string()).await;
    } else {
        let _ = breaker.record_failure(&marketplace.to_string()).await;
    }

    call_result.map_err(|e| DispatchError::Failed(anyhow::Error::new(e).context(format!("automation action against {marketplace}"))))
}

/// Runs one automation-rule action against one marketplace (e.g.
/// auto-reprice, auto-relist) — the single-item counterpart to
/// [`AutomationBatchProcessor`].
pub struct AutomationExecuteProcessor;

#[async_trait]
impl JobProcessor for AutomationExecuteProcessor {
    fn job_type(&self) -> JobType {
        JobType::AutomationExecute
    }

    async fn process(&self, job: &Job, ctx: &ProcessorContext<'_>) -> anyhow::Result<ProcessorOutcome> {
        let (rule_id, marketplace, action, params) = match &job.data {
            JobData::AutomationExecute {
                rule_id,
                marketplace,
                action,
                params,
            } => (*rule_id, marketplace.clone(), action.clone(), params.clone()),
            other => {
                return Err(anyhow!(
                    "automation_execute processor received {:?}",
                    other.job_type()
                ))
            }
        };

        match dispatch(ctx, job.user_id, &marketplace, &params).await {
            Ok(()) => {
                ctx.progress.emit(
                    job.user_id,
                    ProgressEvent::AutomationTriggered {
                        rule_id,
                        marketplace: marketplace.clone(),
                    },
                );
                Ok(ProcessorOutcome::Completed {
                    result: json!({ "rule_id": rule_id, "marketplace": marketplace, "action": action, "params": params }),
                })
            }
            Err(DispatchError::Preempted { retry_after_ms }) => Ok(ProcessorOutcome::Rescheduled { retry_after_ms }),
            Err(DispatchError::Failed(err)) => {
                ctx.progress.emit(
                    job.user_id,
                    ProgressEvent::AutomationFailed {
                        rule_id,
                        reason: err.to_string(),
                    },
                );
                Err(err)
            }
        }
    }
}

/// Fans an automation rule out over a batch of items — each item is its own
/// logical unit of work within the one job so a partial failure doesn't
/// lose progress on the rest.
pub struct AutomationBatchProcessor;

#[async_trait]
impl JobProcessor for AutomationBatchProcessor {
    fn job_type(&self) -> JobType {
        JobType::AutomationBatch
    }

    async fn process(&self, job: &Job, ctx: &ProcessorContext<'_>) -> anyhow::Result<ProcessorOutcome> {
        let (rule_id, items) = match &job.data {
            JobData::AutomationBatch { rule_id, items } => (*rule_id, items.clone()),
            other => return Err(anyhow!("automation_batch processor received {:?}", other.job_type())),
        };

        let total = items.len() as u32;
        ctx.progress.emit(
            job.user_id,
            ProgressEvent::BatchStarted {
                batch_id: job.id,
                total,
            },
        );

        let mut succeeded = 0u32;
        let mut failed = 0u32;

        for (i, item) in items.iter().enumerate() {
            match item.get("marketplace").and_then(|v| v.as_str()) {
                Some(marketplace) => match dispatch(ctx, job.user_id, marketplace, item).await {
                    Ok(()) => succeeded += 1,
                    Err(_) => failed += 1,
                },
                None => failed += 1,
            }
            ctx.progress.emit(
                job.user_id,
                ProgressEvent::JobProgress {
                    job_id: job.id,
                    progress: (((i + 1) as f64 / total.max(1) as f64) * 100.0) as u8,
                },
            );
        }

        ctx.progress.emit(
            job.user_id,
            ProgressEvent::BatchCompleted {
                batch_id: job.id,
                succeeded,
                failed,
            },
        );

        if succeeded == 0 && total > 0 {
            ctx.progress.emit(
                job.user_id,
                ProgressEvent::AutomationFailed {
                    rule_id,
                    reason: "no items in the batch could be processed".to_string(),
                },
            );
            return Err(anyhow!("automation batch {rule_id} had no successful items"));
        }

        Ok(ProcessorOutcome::Completed {
            result: json!({ "rule_id": rule_id, "succeeded": succeeded, "failed": failed }),
        })
    }
}

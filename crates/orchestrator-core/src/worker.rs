//! The worker loop — polls for due jobs, claims one atomically, checks the
//! owning marketplace's circuit breaker, dispatches to a processor, and
//! applies the retry/DLQ decision on failure.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use uuid::Uuid;

use crate::circuit_breaker::{AllowDecision, CircuitBreaker};
use crate::clock::Clock;
use crate::entities::{AuditLog, Job, JobStatus};
use crate::error::OrchestratorError;
use crate::failure::{FailureAnalysis, FailureCategorizer};
use crate::marketplace::MarketplaceRegistry;
use crate::processors::{ProcessorContext, ProcessorOutcome, ProcessorRegistry};
use crate::progress::{ProgressBus, ProgressEvent};
use crate::retry::RetryStrategy;
use crate::storage::Storage;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub tick_interval: StdDuration,
    pub claim_batch_size: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_interval: StdDuration::from_secs(2),
            claim_batch_size: 10,
        }
    }
}

/// Drives the orchestrator's job queue. Owns no state of its own beyond its
/// collaborators — everything it needs to resume after a restart lives in
/// [`Storage`].
pub struct Worker {
    storage: Arc<dyn Storage>,
    registry: Arc<MarketplaceRegistry>,
    processors: Arc<ProcessorRegistry>,
    progress: ProgressBus,
    clock: Arc<dyn Clock>,
    rng: fastrand::Rng,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<MarketplaceRegistry>,
        processors: Arc<ProcessorRegistry>,
        progress: ProgressBus,
        clock: Arc<dyn Clock>,
        rng: fastrand::Rng,
        config: WorkerConfig,
    ) -> Self {
        Self {
            storage,
            registry,
            processors,
            progress,
            clock,
            rng,
            config,
        }
    }

    /// Run forever, polling on `config.tick_interval`. Intended to be
    /// spawned as its own task; cancel by dropping the task handle.
    pub async fn run(&self) {
        loop {
            if let Err(err) = self.tick().await {
                tracing::error!(error = %err, "worker tick failed");
            }
            tokio::time::sleep(self.config.tick_interval).await;
        }
    }

    /// Process one batch of due jobs. Exposed separately from [`Self::run`]
    /// so tests can drive ticks explicitly against a [`crate::clock::FixedClock`]
    /// instead of waiting on real sleeps.
    pub async fn tick(&self) -> Result<(), OrchestratorError> {
        let now = self.clock.now();
        let due = self
            .storage
            .list_due_jobs(now, self.config.claim_batch_size)
            .await
            .map_err(OrchestratorError::Storage)?;

        for job in due {
            self.process_one(job.id).await?;
        }
        Ok(())
    }

    async fn process_one(&self, job_id: Uuid) -> Result<(), OrchestratorError> {
        let now = self.clock.now();
        let Some(job) = self
            .storage
            .claim_job(job_id, now)
            .await
            .map_err(OrchestratorError::Storage)?
        else {
            // Lost the race to another worker, or the job was cancelled
            // between listing and claiming. Not an error.
            return Ok(());
        };

        self.progress.emit(
            job.user_id,
            ProgressEvent::JobStatus {
                job_id: job.id,
                status: "processing".to_string(),
                at: now,
            },
        );

        if let Some(marketplace) = job.data.primary_marketplace() {
            let breaker = CircuitBreaker::new(self.storage.as_ref(), &self.registry, self.clock.as_ref());
            match breaker.should_allow(&marketplace.to_string()).await? {
                AllowDecision::Allow => {}
                AllowDecision::RejectOpen { retry_after_ms } => {
                    return self.reschedule(job, retry_after_ms_or_default(retry_after_ms)).await;
                }
                AllowDecision::RejectHalfOpenSaturated => {
                    return self.reschedule(job, retry_after_ms_or_default(0)).await;
                }
            }
        }

        let Some(processor) = self.processors.get(job.job_type) else {
            return self
                .fail_terminally(job, "no processor registered for job type".to_string())
                .await;
        };

        let ctx = ProcessorContext {
            storage: self.storage.as_ref(),
            registry: &self.registry,
            clock: self.clock.as_ref(),
            progress: &self.progress,
            rng: &self.rng,
        };

        let started = self.clock.now();
        let outcome = processor.process(&job, &ctx).await;
        let duration_ms = (self.clock.now() - started).num_milliseconds();

        match outcome {
            Ok(ProcessorOutcome::Completed { result }) => self.complete(job, result).await,
            Ok(ProcessorOutcome::PartialSuccess { result, .. }) => self.complete(job, result).await,
            Ok(ProcessorOutcome::Rescheduled { retry_after_ms }) => self.reschedule(job, retry_after_ms).await,
            Err(err) => self.handle_failure(job, err, duration_ms).await,
        }
    }

    async fn complete(&self, mut job: Job, result: serde_json::Value) -> Result<(), OrchestratorError> {
        job.status = JobStatus::Completed;
        job.progress = 100;
        job.result = Some(result);
        job.completed_at = Some(self.clock.now());
        self.storage.save_job(&job).await.map_err(OrchestratorError::Storage)?;
        self.progress.emit(
            job.user_id,
            ProgressEvent::JobStatus {
                job_id: job.id,
                status: "completed".to_string(),
                at: self.clock.now(),
            },
        );
        Ok(())
    }

    async fn reschedule(&self, mut job: Job, delay_ms: i64) -> Result<(), OrchestratorError> {
        job.status = JobStatus::Pending;
        job.attempts -= 1;
        job.scheduled_for = self.clock.now() + chrono::Duration::milliseconds(delay_ms);
        job.started_at = None;
        self.storage.save_job(&job).await.map_err(OrchestratorError::Storage)?;
        Ok(())
    }

    async fn handle_failure(
        &self,
        mut job: Job,
        error: anyhow::Error,
        duration_ms: i64,
    ) -> Result<(), OrchestratorError> {
        let marketplace = job.data.primary_marketplace().map(str::to_string);
        let analysis = match error.downcast_ref::<crate::marketplace::MarketplaceError>() {
            Some(marketplace_error) => FailureCategorizer::categorize(marketplace_error),
            None => FailureCategorizer::categorize_status(500, &error.to_string()),
        };

        if analysis.category == crate::entities::FailureCategory::Auth {
            if let Some(marketplace) = marketplace.as_deref() {
                self.maybe_refresh_token(&job, marketplace).await?;
            }
        }

        let retry_strategy = RetryStrategy::new(self.storage.as_ref(), self.clock.as_ref(), &self.rng);
        let decision = retry_strategy
            .decide(
                job.id,
                job.attempts,
                job.max_attempts,
                marketplace.as_ref(),
                &analysis,
                "processing_error",
                &error.to_string(),
                duration_ms,
            )
            .await?;

        if decision.should_retry {
            job.status = JobStatus::Pending;
            job.scheduled_for = decision.next_retry_at;
            job.started_at = None;
            job.error_message = Some(error.to_string());
            self.storage.save_job(&job).await.map_err(OrchestratorError::Storage)?;
            self.progress.emit(
                job.user_id,
                ProgressEvent::JobStatus {
                    job_id: job.id,
                    status: "retrying".to_string(),
                    at: self.clock.now(),
                },
            );
            Ok(())
        } else if decision.max_retries_reached && analysis.should_retry {
            self.dead_letter(job, &analysis, &error.to_string()).await
        } else {
            self.fail_without_dlq(job, error.to_string()).await
        }
    }

    /// Refreshes the marketplace connection's access token when it's expired
    /// and a refresh token is on file, recording an audit log entry on
    /// success. A failure to refresh is swallowed here — the retry/DLQ path
    /// still runs against the original auth error.
    async fn maybe_refresh_token(&self, job: &Job, marketplace: &str) -> Result<(), OrchestratorError> {
        let Some(mut connection) = self
            .storage
            .get_connection(job.user_id, marketplace)
            .await
            .map_err(OrchestratorError::Storage)?
        else {
            return Ok(());
        };

        let now = self.clock.now();
        if !connection.is_token_expired(now) {
            return Ok(());
        }
        let Some(refresh_token) = connection.refresh_token.clone() else {
            return Ok(());
        };

        let client = match self.registry.client(marketplace) {
            Ok(client) => client,
            Err(_) => return Ok(()),
        };

        match client.refresh_token(&refresh_token).await {
            Ok(exchanged) => {
                connection.access_token = exchanged.access_token;
                if let Some(new_refresh_token) = exchanged.refresh_token {
                    connection.refresh_token = Some(new_refresh_token);
                }
                connection.token_expires_at = exchanged.expires_at;
                self.storage
                    .save_connection(&connection)
                    .await
                    .map_err(OrchestratorError::Storage)?;
                self.storage
                    .create_audit_log(&AuditLog {
                        id: Uuid::new_v4(),
                        user_id: Some(job.user_id),
                        action: "auth_refreshed".to_string(),
                        detail: serde_json::json!({ "marketplace": marketplace, "job_id": job.id }),
                        created_at: now,
                    })
                    .await
                    .map_err(OrchestratorError::Storage)?;
            }
            Err(err) => {
                tracing::warn!(marketplace, error = %err, "token refresh failed");
            }
        }
        Ok(())
    }

    async fn fail_terminally(&self, mut job: Job, message: String) -> Result<(), OrchestratorError> {
        job.status = JobStatus::Failed;
        job.error_message = Some(message.clone());
        job.completed_at = Some(self.clock.now());
        self.storage.save_job(&job).await.map_err(OrchestratorError::Storage)?;
        self.dead_letter(job, &FailureCategorizer::unknown(), &message).await
    }

    /// Mark a job terminally failed without a DLQ entry — used for failures
    /// in a category the retry strategy never considered retryable, where a
    /// DLQ entry would just duplicate the original, non-actionable error.
    async fn fail_without_dlq(&self, mut job: Job, error: String) -> Result<(), OrchestratorError> {
        job.status = JobStatus::Failed;
        job.error_message = Some(error);
        job.completed_at = Some(self.clock.now());
        self.storage.save_job(&job).await.map_err(OrchestratorError::Storage)?;
        self.progress.emit(
            job.user_id,
            ProgressEvent::JobStatus {
                job_id: job.id,
                status: "failed".to_string(),
                at: self.clock.now(),
            },
        );
        Ok(())
    }

    async fn dead_letter(&self, mut job: Job, analysis: &FailureAnalysis, error: &str) -> Result<(), OrchestratorError> {
        job.status = JobStatus::Failed;
        job.error_message = Some(error.to_string());
        job.completed_at = Some(self.clock.now());
        self.storage.save_job(&job).await.map_err(OrchestratorError::Storage)?;

        let dlq = crate::dlq::DeadLetterQueue::new(self.storage.as_ref(), self.clock.as_ref());
        dlq.dead_letter(&job, analysis, error).await?;

        self.progress.emit(
            job.user_id,
            ProgressEvent::JobStatus {
                job_id: job.id,
                status: "dead_lettered".to_string(),
                at: self.clock.now(),
            },
        );
        Ok(())
    }
}

fn retry_after_ms_or_default(ms: i64) -> i64 {
    if ms <= 0 {
        1_000
    } else {
        ms
    }
}

//! The dead-letter queue a job lands in once retries are exhausted.

use uuid::Uuid;

use crate::clock::Clock;
use crate::entities::{DeadLetterEntry, DlqResolutionStatus, FailureCategory, Job};
use crate::error::OrchestratorError;
use crate::failure::FailureAnalysis;
use crate::storage::Storage;

/// Categories that still imply a human could fix the underlying cause
/// (reconnect an account, correct a listing) rather than a bug in the
/// orchestrator itself, plus anything the categorizer already flagged as
/// needing intervention.
fn requires_manual_review(requires_user_intervention: bool, category: FailureCategory) -> bool {
    requires_user_intervention
        || matches!(
            category,
            FailureCategory::Auth | FailureCategory::DataValidation | FailureCategory::Unknown
        )
}

pub struct DeadLetterQueue<'a> {
    storage: &'a dyn Storage,
    clock: &'a dyn Clock,
}

impl<'a> DeadLetterQueue<'a> {
    pub fn new(storage: &'a dyn Storage, clock: &'a dyn Clock) -> Self {
        Self { storage, clock }
    }

    /// A job lands in the DLQ when the retry strategy reports
    /// `maxRetriesReached` for a category it also marked retryable — a job
    /// whose category was never retryable to begin with fails outright
    /// instead, without a DLQ entry.
    pub async fn dead_letter(
        &self,
        job: &Job,
        analysis: &FailureAnalysis,
        last_error: &str,
    ) -> Result<DeadLetterEntry, OrchestratorError> {
        let entry = DeadLetterEntry {
            id: Uuid::new_v4(),
            original_job_id: job.id,
            job_type: job.job_type,
            user_id: job.user_id,
            final_failure_category: analysis.category,
            total_attempts: job.attempts,
            last_error: last_error.to_string(),
            payload: job.data.clone(),
            requires_manual_review: requires_manual_review(analysis.requires_user_intervention, analysis.category),
            resolution_status: DlqResolutionStatus::Pending,
            created_at: self.clock.now(),
        };
        self.storage
            .create_dlq_entry(&entry)
            .await
            .map_err(OrchestratorError::Storage)?;
        tracing::warn!(job_id = %job.id, category = ?analysis.category, "job dead-lettered");
        Ok(entry)
    }

    pub async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<DeadLetterEntry>, OrchestratorError> {
        self.storage
            .list_dlq_entries_by_user(user_id)
            .await
            .map_err(OrchestratorError::Storage)
    }

    pub async fn resolve(&self, id: Uuid) -> Result<(), OrchestratorError> {
        self.ensure_exists(id).await?;
        self.storage
            .set_dlq_resolution(id, DlqResolutionStatus::Resolved)
            .await
            .map_err(OrchestratorError::Storage)
    }

    pub async fn discard(&self, id: Uuid) -> Result<(), OrchestratorError> {
        self.ensure_exists(id).await?;
        self.storage
            .set_dlq_resolution(id, DlqResolutionStatus::Discarded)
            .await
            .map_err(OrchestratorError::Storage)
    }

    /// Re-enqueue the original job with a fresh attempt count, for when a
    /// user fixes the underlying cause (reconnects an account, corrects a
    /// listing) and wants the job retried.
    pub async fn replay(&self, id: Uuid) -> Result<Job, OrchestratorError> {
        let entry = self.ensure_exists(id).await?;
        let job = Job {
            id: Uuid::new_v4(),
            user_id: entry.user_id,
            job_type: entry.job_type,
            data: entry.payload.clone(),
            priority: 0,
            status: crate::entities::JobStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            progress: 0,
            result: None,
            error_message: None,
            scheduled_for: self.clock.now(),
            started_at: None,
            completed_at: None,
            marketplace_group: None,
            scheduling_metadata: None,
        };
        self.storage
            .create_job(&job)
            .await
            .map_err(OrchestratorError::Storage)?;
        self.storage
            .set_dlq_resolution(id, DlqResolutionStatus::Resolved)
            .await
            .map_err(OrchestratorError::Storage)?;
        Ok(job)
    }

    async fn ensure_exists(&self, id: Uuid) -> Result<DeadLetterEntry, OrchestratorError> {
        self.storage
            .get_dlq_entry(id)
            .await
            .map_err(OrchestratorError::Storage)?
            .ok_or(OrchestratorError::JobNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_validation_require_manual_review() {
        assert!(requires_manual_review(false, FailureCategory::Auth));
        assert!(requires_manual_review(false, FailureCategory::DataValidation));
        assert!(requires_manual_review(false, FailureCategory::Unknown));
        assert!(!requires_manual_review(false, FailureCategory::Network));
    }

    #[test]
    fn user_intervention_flag_forces_manual_review_regardless_of_category() {
        assert!(requires_manual_review(true, FailureCategory::Network));
    }
}

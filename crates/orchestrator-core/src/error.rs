//! Structured error type for orchestrator operations.
//!
//! A pattern-matchable error type sits at every public boundary instead of a
//! bare `anyhow::Error`: callers (the worker loop, the intent API) need to
//! distinguish "marketplace is unknown" from "storage is unreachable" from
//! "claim lost to another worker" to decide what to do next. `anyhow::Error`
//! is still used internally for marketplace-call failures, which are turned
//! into [`crate::failure::FailureAnalysis`] before they ever reach storage.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown marketplace: {0}")]
    UnknownMarketplace(String),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("listing not found: {0}")]
    ListingNotFound(Uuid),

    #[error("job {job_id} could not be claimed: {reason}")]
    InvalidClaim { job_id: Uuid, reason: String },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("failed to serialize job payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

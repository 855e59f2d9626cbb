//! One [`JobProcessor`] per [`JobType`], dispatched by the worker loop.

mod automation;
mod delist_listing;
mod post_listing;
mod sync_inventory;

pub use automation::{AutomationBatchProcessor, AutomationExecuteProcessor};
pub use delist_listing::DelistListingProcessor;
pub use post_listing::PostListingProcessor;
pub use sync_inventory::SyncInventoryProcessor;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::circuit_breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::entities::{Job, JobType};
use crate::marketplace::MarketplaceRegistry;
use crate::progress::ProgressBus;
use crate::rate_limiter::RateLimiter;
use crate::storage::Storage;

/// Shared collaborators every processor needs, bundled so the worker loop
/// builds it once per tick rather than threading five arguments through
/// every call.
pub struct ProcessorContext<'a> {
    pub storage: &'a dyn Storage,
    pub registry: &'a MarketplaceRegistry,
    pub clock: &'a dyn Clock,
    pub progress: &'a ProgressBus,
    pub rng: &'a fastrand::Rng,
}

impl<'a> ProcessorContext<'a> {
    pub fn rate_limiter(&self) -> RateLimiter<'a> {
        RateLimiter::new(self.storage, self.registry, self.clock)
    }

    pub fn circuit_breaker(&self) -> CircuitBreaker<'a> {
        CircuitBreaker::new(self.storage, self.registry, self.clock)
    }
}

/// Outcome of one processing attempt, distinct from the job's persisted
/// `JobStatus`: the worker loop uses this to decide what to do next
/// (persist completion, reschedule, or hand off to the retry strategy on
/// error).
#[derive(Debug, Clone)]
pub enum ProcessorOutcome {
    Completed { result: serde_json::Value },
    /// Not every marketplace in a multi-marketplace job succeeded, but at
    /// least one did and none of the failures were fatal — completed with a
    /// partial result rather than failed outright.
    PartialSuccess {
        result: serde_json::Value,
        failed_marketplaces: Vec<String>,
    },
    /// The marketplace rejected the call because of its own rate limit or
    /// circuit breaker, distinct from a processing error — the worker loop
    /// reschedules without charging an attempt.
    Rescheduled { retry_after_ms: i64 },
}

#[async_trait]
pub trait JobProcessor: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn process(&self, job: &Job, ctx: &ProcessorContext<'_>) -> anyhow::Result<ProcessorOutcome>;
}

/// Routes a claimed job to the processor registered for its [`JobType`].
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<JobType, Box<dyn JobProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, processor: Box<dyn JobProcessor>) -> &mut Self {
        self.processors.insert(processor.job_type(), processor);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<&dyn JobProcessor> {
        self.processors.get(&job_type).map(|p| p.as_ref())
    }

    /// The default registry wired with every built-in processor — the
    /// worker loop's starting point, extendable via [`Self::register`] for
    /// custom job types.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register(Box::new(PostListingProcessor))
            .register(Box::new(DelistListingProcessor))
            .register(Box::new(SyncInventoryProcessor))
            .register(Box::new(AutomationExecuteProcessor))
            .register(Box::new(AutomationBatchProcessor));
        registry
    }
}

//! Job queue, scheduling, and reliability substrate for a cross-marketplace
//! listing orchestrator.
//!
//! A listing gets posted, delisted, and kept in sync across several
//! reselling marketplaces (eBay, Poshmark, Mercari, Depop, Grailed,
//! Facebook, Vinted, ...), each with its own rate limits, outage patterns,
//! and optimal-posting-time folklore. This crate is the part that makes
//! that reliable: a durable job queue with atomic claiming
//! ([`storage::Storage`]), per-marketplace rate limiting
//! ([`rate_limiter::RateLimiter`]) and circuit breaking
//! ([`circuit_breaker::CircuitBreaker`]), a failure categorizer
//! ([`failure::FailureCategorizer`]) feeding an adaptive retry strategy
//! ([`retry::RetryStrategy`]), a dead-letter queue for jobs that exhaust
//! their retries ([`dlq::DeadLetterQueue`]), a smart scheduler that blends
//! static posting-time defaults with learned analytics
//! ([`scheduler::SmartScheduler`]), and a worker loop tying all of it
//! together ([`worker::Worker`]).
//!
//! Nothing in this crate reads the wall clock or a random source directly:
//! every component takes a `&dyn `[`clock::Clock`] and, where jitter is
//! needed, a seeded `fastrand::Rng`, so retry timing and scheduling are
//! exercised deterministically in tests.

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod dlq;
pub mod entities;
pub mod error;
pub mod failure;
pub mod intents;
pub mod marketplace;
pub mod processors;
pub mod progress;
pub mod rate_limiter;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod worker;

pub use circuit_breaker::{AllowDecision, CircuitBreaker};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{MarketplaceOverride, MarketplaceOverrides, OrchestratorConfig};
pub use dlq::DeadLetterQueue;
pub use error::OrchestratorError;
pub use failure::{FailureAnalysis, FailureCategorizer, RetryDefaults};
pub use intents::OrchestratorIntents;
pub use marketplace::{MarketplaceClient, MarketplaceConfig, MarketplaceError, MarketplaceRegistry, RateLimits};
pub use processors::{JobProcessor, ProcessorContext, ProcessorOutcome, ProcessorRegistry};
pub use progress::{ProgressBus, ProgressEvent};
pub use rate_limiter::{RateLimitCheck, RateLimiter};
pub use retry::{RetryDecision, RetryStrategy};
pub use scheduler::{Distribution, SchedulingPlan, SmartScheduler};
pub use storage::{Storage, StorageResult};
pub use worker::{Worker, WorkerConfig};

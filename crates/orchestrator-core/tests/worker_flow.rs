//! End-to-end coverage of the worker loop against `InMemoryStorage`: happy
//! path, rate limiting, circuit breaking, retry-to-DLQ, and inventory sync.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use orchestrator_core::entities::{
    CircuitBreakerThresholds, JobStatus, JobType, ListingPostStatus, ListingStatus, Marketplace,
};
use orchestrator_core::marketplace::{MarketplaceConfig, MarketplaceError, MarketplaceRegistry, RateLimits};
use orchestrator_core::processors::ProcessorRegistry;
use orchestrator_core::progress::ProgressBus;
use orchestrator_core::storage::Storage;
use orchestrator_core::worker::{Worker, WorkerConfig};
use orchestrator_core::FixedClock;
use orchestrator_testing::{fixtures, InMemoryStorage, MockMarketplaceClient};
use uuid::Uuid;

fn epoch() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-01-05T09:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn generous_rate_limits() -> RateLimits {
    RateLimits {
        per_minute: 1_000,
        per_hour: 10_000,
        per_day: 100_000,
    }
}

struct Harness {
    storage: Arc<InMemoryStorage>,
    registry: Arc<MarketplaceRegistry>,
    clock: Arc<FixedClock>,
    worker: Worker,
    ebay_client: Arc<MockMarketplaceClient>,
}

fn build_harness() -> Harness {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = Arc::new(FixedClock::new(epoch()));
    let ebay_client = Arc::new(MockMarketplaceClient::new());

    let mut registry = MarketplaceRegistry::new();
    registry.register(
        MarketplaceConfig::new("ebay", generous_rate_limits())
            .with_circuit_thresholds(CircuitBreakerThresholds {
                failure_threshold: 2,
                recovery_threshold: 1,
                timeout_ms: 60_000,
                half_open_max: 1,
            }),
        Box::new(ebay_client.clone()),
    );
    let registry = Arc::new(registry);

    let worker = Worker::new(
        storage.clone() as Arc<dyn orchestrator_core::storage::Storage>,
        registry.clone(),
        Arc::new(ProcessorRegistry::with_defaults()),
        ProgressBus::new(),
        clock.clone() as Arc<dyn orchestrator_core::clock::Clock>,
        fastrand::Rng::with_seed(42),
        WorkerConfig::default(),
    );

    Harness {
        storage,
        registry,
        clock,
        worker,
        ebay_client,
    }
}

#[tokio::test]
async fn happy_path_posts_to_a_single_marketplace() {
    let h = build_harness();
    let user_id = Uuid::new_v4();

    let listing = fixtures::listing(user_id);
    h.storage.seed_listing(listing.clone());
    h.storage.seed_connection(fixtures::connection(user_id, "ebay"));
    h.ebay_client.queue_create_success("ext-1", "https://example.test/ext-1");

    let job = fixtures::post_listing_job(user_id, listing.id, "ebay");
    h.storage.create_job(&job).await.unwrap();

    h.worker.tick().await.unwrap();

    let saved = h.storage.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(saved.status, JobStatus::Completed);

    let saved_listing = h.storage.get_listing(listing.id).await.unwrap().unwrap();
    assert_eq!(saved_listing.status, ListingStatus::Active);

    let post = h
        .storage
        .find_listing_post(listing.id, "ebay")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(post.status, ListingPostStatus::Posted);
    assert_eq!(post.external_id.as_deref(), Some("ext-1"));
}

#[tokio::test]
async fn exhausted_rate_limit_reschedules_without_charging_an_attempt() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = Arc::new(FixedClock::new(epoch()));
    let ebay_client = Arc::new(MockMarketplaceClient::new());

    let mut registry = MarketplaceRegistry::new();
    registry.register(
        MarketplaceConfig::new(
            "ebay",
            RateLimits {
                per_minute: 0,
                per_hour: 10_000,
                per_day: 100_000,
            },
        ),
        Box::new(ebay_client.clone()),
    );
    let registry = Arc::new(registry);

    let worker = Worker::new(
        storage.clone() as Arc<dyn orchestrator_core::storage::Storage>,
        registry,
        Arc::new(ProcessorRegistry::with_defaults()),
        ProgressBus::new(),
        clock.clone() as Arc<dyn orchestrator_core::clock::Clock>,
        fastrand::Rng::with_seed(7),
        WorkerConfig::default(),
    );

    let user_id = Uuid::new_v4();
    let listing = fixtures::listing(user_id);
    storage.seed_listing(listing.clone());
    storage.seed_connection(fixtures::connection(user_id, "ebay"));

    let job = fixtures::post_listing_job(user_id, listing.id, "ebay");
    storage.create_job(&job).await.unwrap();

    worker.tick().await.unwrap();

    let saved = storage.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(saved.status, JobStatus::Pending);
    assert_eq!(saved.attempts, 0, "preemptive rejection must not consume an attempt");
    assert!(saved.scheduled_for > epoch());
    assert_eq!(ebay_client.create_call_count(), 0);
}

#[tokio::test]
async fn circuit_breaker_opens_after_repeated_failures_and_stops_calling_out() {
    let h = build_harness();
    let user_id = Uuid::new_v4();
    let listing = fixtures::listing(user_id);
    h.storage.seed_listing(listing.clone());
    h.storage.seed_connection(fixtures::connection(user_id, "ebay"));

    h.ebay_client.queue_create_failure(MarketplaceError::Network("boom".to_string()));
    let job1 = fixtures::post_listing_job(user_id, listing.id, "ebay");
    h.storage.create_job(&job1).await.unwrap();
    h.worker.tick().await.unwrap();

    h.ebay_client.queue_create_failure(MarketplaceError::Network("boom again".to_string()));
    let job2 = fixtures::post_listing_job(user_id, listing.id, "ebay");
    h.storage.create_job(&job2).await.unwrap();
    h.worker.tick().await.unwrap();

    let breaker = orchestrator_core::circuit_breaker::CircuitBreaker::new(
        h.storage.as_ref(),
        h.registry.as_ref(),
        h.clock.as_ref(),
    );
    let decision = breaker.should_allow(&"ebay".to_string()).await.unwrap();
    assert!(!decision.is_allowed());

    let calls_before = h.ebay_client.create_call_count();
    let job3 = fixtures::post_listing_job(user_id, listing.id, "ebay");
    h.storage.create_job(&job3).await.unwrap();
    h.worker.tick().await.unwrap();
    assert_eq!(
        h.ebay_client.create_call_count(),
        calls_before,
        "an open circuit must pre-empt the marketplace call entirely"
    );

    let saved3 = h.storage.get_job(job3.id).await.unwrap().unwrap();
    assert_eq!(saved3.status, JobStatus::Pending);
}

#[tokio::test]
async fn auth_failure_retries_once_then_lands_in_the_dead_letter_queue() {
    let h = build_harness();
    let user_id = Uuid::new_v4();
    let listing = fixtures::listing(user_id);
    h.storage.seed_listing(listing.clone());
    h.storage.seed_connection(fixtures::connection(user_id, "ebay"));

    h.ebay_client
        .queue_create_failure(MarketplaceError::Auth("token revoked".to_string()));

    let mut job = fixtures::post_listing_job(user_id, listing.id, "ebay");
    job.max_attempts = 3;
    h.storage.create_job(&job).await.unwrap();

    h.worker.tick().await.unwrap();

    let after_first = h.storage.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(
        after_first.status,
        JobStatus::Pending,
        "auth's retry budget allows one retry before giving up"
    );
    assert!(h.storage.list_dlq_entries_by_user(user_id).await.unwrap().is_empty());

    h.clock.advance(chrono::Duration::seconds(10));
    h.ebay_client
        .queue_create_failure(MarketplaceError::Auth("token revoked".to_string()));
    h.worker.tick().await.unwrap();

    let saved = h.storage.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(saved.status, JobStatus::Failed);

    let dlq_entries = h.storage.list_dlq_entries_by_user(user_id).await.unwrap();
    assert_eq!(dlq_entries.len(), 1);
    assert!(dlq_entries[0].requires_manual_review);
    assert_eq!(dlq_entries[0].original_job_id, job.id);
}

#[tokio::test]
async fn expired_token_is_refreshed_before_the_job_retries() {
    let h = build_harness();
    let user_id = Uuid::new_v4();
    let listing = fixtures::listing(user_id);
    h.storage.seed_listing(listing.clone());

    let mut connection = fixtures::connection(user_id, "ebay");
    connection.refresh_token = Some("refresh-me".to_string());
    connection.token_expires_at = Some(epoch() - chrono::Duration::seconds(1));
    h.storage.seed_connection(connection);

    h.ebay_client
        .queue_create_failure(MarketplaceError::Auth("token expired".to_string()));
    h.ebay_client.queue_create_success("ext-1", "https://example.test/ext-1");

    let job = fixtures::post_listing_job(user_id, listing.id, "ebay");
    h.storage.create_job(&job).await.unwrap();

    h.worker.tick().await.unwrap();
    assert_eq!(h.ebay_client.refresh_call_count(), 1);

    let refreshed = h
        .storage
        .get_connection(user_id, "ebay")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.access_token, "mock-refreshed-token");

    let audit_logs = h.storage.list_audit_logs_by_user(user_id).await.unwrap();
    assert!(audit_logs.iter().any(|l| l.action == "auth_refreshed"));

    h.clock.advance(chrono::Duration::seconds(10));
    h.worker.tick().await.unwrap();

    let saved = h.storage.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(saved.status, JobStatus::Completed);
}

#[tokio::test]
async fn retryable_failure_is_rescheduled_before_eventually_dead_lettering() {
    let h = build_harness();
    let user_id = Uuid::new_v4();
    let listing = fixtures::listing(user_id);
    h.storage.seed_listing(listing.clone());
    h.storage.seed_connection(fixtures::connection(user_id, "ebay"));

    let mut job = fixtures::post_listing_job(user_id, listing.id, "ebay");
    job.max_attempts = 1;
    h.storage.create_job(&job).await.unwrap();

    h.ebay_client
        .queue_create_failure(MarketplaceError::Transient("upstream hiccup".to_string()));
    h.worker.tick().await.unwrap();

    let after_first = h.storage.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(after_first.status, JobStatus::Failed);

    let dlq_entries = h.storage.list_dlq_entries_by_user(user_id).await.unwrap();
    assert_eq!(dlq_entries.len(), 1);
}

#[tokio::test]
async fn sync_inventory_delists_from_every_other_posted_marketplace() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = Arc::new(FixedClock::new(epoch()));
    let ebay_client = Arc::new(MockMarketplaceClient::new());
    let poshmark_client = Arc::new(MockMarketplaceClient::new());

    let mut registry = MarketplaceRegistry::new();
    registry
        .register(
            MarketplaceConfig::new("ebay", generous_rate_limits()),
            Box::new(ebay_client.clone()),
        )
        .register(
            MarketplaceConfig::new("poshmark", generous_rate_limits()),
            Box::new(poshmark_client.clone()),
        );
    let registry = Arc::new(registry);

    let worker = Worker::new(
        storage.clone() as Arc<dyn orchestrator_core::storage::Storage>,
        registry,
        Arc::new(ProcessorRegistry::with_defaults()),
        ProgressBus::new(),
        clock.clone() as Arc<dyn orchestrator_core::clock::Clock>,
        fastrand::Rng::with_seed(3),
        WorkerConfig::default(),
    );

    let user_id = Uuid::new_v4();
    let listing = fixtures::listing(user_id);
    storage.seed_listing(listing.clone());
    storage.seed_connection(fixtures::connection(user_id, "ebay"));
    storage.seed_connection(fixtures::connection(user_id, "poshmark"));

    let posted_on_poshmark = orchestrator_core::entities::ListingPost {
        id: Uuid::new_v4(),
        listing_id: listing.id,
        marketplace: "poshmark".to_string(),
        external_id: Some("posh-1".to_string()),
        external_url: Some("https://example.test/posh-1".to_string()),
        status: ListingPostStatus::Posted,
        error_message: None,
        posted_at: Some(epoch()),
    };
    storage.upsert_listing_post(&posted_on_poshmark).await.unwrap();

    let job = orchestrator_core::entities::Job {
        id: Uuid::new_v4(),
        user_id,
        job_type: JobType::SyncInventory,
        data: orchestrator_core::entities::JobData::SyncInventory {
            listing_id: listing.id,
            sold_marketplace: "ebay".to_string() as Marketplace,
        },
        priority: 10,
        status: JobStatus::Pending,
        attempts: 0,
        max_attempts: 3,
        progress: 0,
        result: None,
        error_message: None,
        scheduled_for: epoch(),
        started_at: None,
        completed_at: None,
        marketplace_group: None,
        scheduling_metadata: None,
    };
    storage.create_job(&job).await.unwrap();

    worker.tick().await.unwrap();

    let saved_listing = storage.get_listing(listing.id).await.unwrap().unwrap();
    assert_eq!(saved_listing.status, ListingStatus::Sold);

    // The sync job hands off to a delist-listing job rather than calling
    // the marketplace client directly, so the delist itself still goes
    // through the circuit breaker and rate limiter.
    assert_eq!(poshmark_client.delete_call_count(), 0);

    let enqueued = storage.list_jobs_for_listing(listing.id).await.unwrap();
    let delist_job = enqueued
        .iter()
        .find(|j| j.job_type == JobType::DelistListing)
        .expect("sync_inventory must enqueue a delist-listing job");

    match &delist_job.data {
        orchestrator_core::entities::JobData::DelistListing { marketplaces, reason, .. } => {
            assert_eq!(marketplaces.as_deref(), Some(["poshmark".to_string()].as_slice()));
            assert_eq!(reason.as_deref(), Some("sold_on_other_marketplace"));
        }
        other => panic!("expected a delist-listing job, got {other:?}"),
    }
    assert_eq!(delist_job.priority, 8);
    assert!(delist_job.scheduled_for > epoch());
}

//! End-to-end scenarios over the in-memory store and bus.
//!
//! Producer → Orchestrator → JobStore → EventBus → Dispatcher → Worker → JobStore,
//! with the reclaimer sweep driven at explicit points in time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use assetflow_core::{JobId, OwnerId};
use assetflow_events::{EventBus, InMemoryEventBus, Subscription};
use assetflow_lifecycle::{
    ConcurrencyGate, Job, LifecycleStatus, MAX_MIGRATION_ATTEMPTS, MigrationRecord, MigrationState,
    NewJob, OwnerTier, RetrySchedule, StageGuard, ThumbnailRecord, ThumbnailRetryPolicy,
    ThumbnailState, ThumbnailStateMachine, TransitionEvent, WorkerKind,
};

use crate::clients::{Asset, ObjectMeta, ObjectStore, ObjectStoreError, TransformClient, TransformError};
use crate::dispatch::{DispatchError, Dispatcher, HttpWorkerInvoker, WorkerCall, WorkerInvoker};
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::reclaimer::{Reclaimer, ReclaimerConfig};
use crate::store::{
    AdmissionOutcome, CasOutcome, InMemoryJobStore, JobStats, JobStore, LifecycleChange, StoreError,
};
use crate::workers::{
    MigrationRequest, MigrationWorker, ThumbnailRequest, ThumbnailWorker, WorkerOutcome,
};

const DURABLE_BASE: &str = "https://durable.example/assets";

type Bus = Arc<InMemoryEventBus<TransitionEvent>>;

#[derive(Default)]
struct FakeObjectStore {
    sources: Mutex<HashMap<String, Asset>>,
    objects: Mutex<HashMap<String, Asset>>,
    puts: AtomicUsize,
}

impl FakeObjectStore {
    fn serve(&self, url: &str, body: &'static [u8]) {
        self.sources
            .lock()
            .unwrap()
            .insert(url.to_string(), Asset::new(body, "video/mp4"));
    }

    fn object(&self, key: &str) -> Option<Asset> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn fetch(&self, url: &str) -> Result<Asset, ObjectStoreError> {
        self.sources
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| ObjectStoreError::Status {
                method: "GET",
                url: url.to_string(),
                status: 404,
            })
    }

    async fn put(&self, key: &str, asset: &Asset) -> Result<(), ObjectStoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), asset.clone());
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, ObjectStoreError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|a| ObjectMeta { size: a.len() }))
    }

    fn public_url(&self, key: &str) -> String {
        format!("{DURABLE_BASE}/{key}")
    }
}

#[derive(Default)]
struct FakeTransform {
    failing: AtomicBool,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl TransformClient for FakeTransform {
    async fn thumbnail(&self, video_url: &str) -> Result<Asset, TransformError> {
        self.calls.lock().unwrap().push(video_url.to_string());
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransformError::Status { status: 502 });
        }
        Ok(Asset::new(format!("jpeg:{video_url}").into_bytes(), "image/jpeg"))
    }
}

#[derive(Default)]
struct RecordingInvoker {
    calls: Mutex<Vec<WorkerCall>>,
}

#[async_trait]
impl WorkerInvoker for RecordingInvoker {
    async fn invoke(&self, call: &WorkerCall) -> Result<(), DispatchError> {
        self.calls.lock().unwrap().push(call.clone());
        Ok(())
    }
}

struct Harness {
    store: Arc<InMemoryJobStore>,
    bus: Bus,
    orchestrator: Arc<Orchestrator<InMemoryJobStore, Bus>>,
    objects: Arc<FakeObjectStore>,
    transform: Arc<FakeTransform>,
    migration: MigrationWorker<InMemoryJobStore, Bus>,
    thumbnail: ThumbnailWorker<InMemoryJobStore, Bus>,
    reclaimer: Reclaimer<InMemoryJobStore, Bus>,
}

fn setup() -> Harness {
    setup_with(|_| {})
}

fn setup_with(tweak: impl FnOnce(&mut OrchestratorConfig)) -> Harness {
    let store = InMemoryJobStore::arc();
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let mut config = OrchestratorConfig {
        durable_base_url: DURABLE_BASE.to_string(),
        thumbnail: ThumbnailStateMachine::new(ThumbnailRetryPolicy {
            settle_delay: StdDuration::ZERO,
            schedule: RetrySchedule::new(vec![StdDuration::ZERO; 3]),
            ..ThumbnailRetryPolicy::default()
        }),
        ..OrchestratorConfig::default()
    };
    tweak(&mut config);
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), bus.clone(), config));
    let objects = Arc::new(FakeObjectStore::default());
    let transform = Arc::new(FakeTransform::default());

    let object_store: Arc<dyn ObjectStore> = objects.clone();
    let transform_client: Arc<dyn TransformClient> = transform.clone();
    Harness {
        migration: MigrationWorker::new(
            orchestrator.clone(),
            Some(object_store.clone()),
            StdDuration::from_secs(5),
        ),
        thumbnail: ThumbnailWorker::new(
            orchestrator.clone(),
            Some(object_store),
            Some(transform_client),
            StdDuration::from_secs(5),
        ),
        reclaimer: Reclaimer::new(orchestrator.clone(), ReclaimerConfig::default()),
        store,
        bus,
        orchestrator,
        objects,
        transform,
    }
}

fn new_job(owner: OwnerId, tier: OwnerTier) -> NewJob {
    NewJob {
        id: JobId::new(),
        owner_id: owner,
        owner_tier: tier,
        transient_asset_url: None,
    }
}

impl Harness {
    /// Submit a job and have the producer finish it with `url`.
    async fn completed_job(&self, url: &str) -> Job {
        let now = Utc::now();
        let job = self
            .orchestrator
            .submit(new_job(OwnerId::new(), OwnerTier::Premium), now)
            .await
            .unwrap();
        assert_eq!(job.lifecycle_status, LifecycleStatus::Processing);
        self.orchestrator
            .update_lifecycle(job.id, LifecycleStatus::Completed, Some(url), now)
            .await
            .unwrap()
    }

    async fn job(&self, id: JobId) -> Job {
        self.store.get(id).await.unwrap().unwrap()
    }

    async fn migrate(&self, job: &Job) -> WorkerOutcome {
        self.migration
            .run(MigrationRequest {
                job_id: job.id,
                asset_url: job.transient_asset_url.clone().unwrap_or_default(),
                force_remigrate: false,
            })
            .await
            .unwrap()
    }

    async fn derive_thumbnail(&self, job: &Job) -> WorkerOutcome {
        self.thumbnail
            .run(ThumbnailRequest {
                job_id: job.id,
                asset_url: job.transient_asset_url.clone().unwrap_or_default(),
                migration_completed_at: None,
                time_since_migration_seconds: None,
                asset_available_at: None,
            })
            .await
            .unwrap()
    }

    async fn sweep(&self, at: DateTime<Utc>) -> crate::reclaimer::SweepReport {
        self.reclaimer.sweep_once(at).await.unwrap()
    }
}

#[tokio::test]
async fn scenario_a_free_tier_second_job_waits_for_the_first() {
    let h = setup();
    let owner = OwnerId::new();
    let now = Utc::now();

    let first = h
        .orchestrator
        .submit(new_job(owner, OwnerTier::Free), now)
        .await
        .unwrap();
    let second = h
        .orchestrator
        .submit(new_job(owner, OwnerTier::Free), now)
        .await
        .unwrap();

    assert_eq!(first.lifecycle_status, LifecycleStatus::Processing);
    assert_eq!(second.lifecycle_status, LifecycleStatus::Pending);
    assert_eq!(second.queue.position, Some(1));

    h.orchestrator
        .update_lifecycle(
            first.id,
            LifecycleStatus::Completed,
            Some("https://origin.example/1.mp4"),
            now + Duration::seconds(30),
        )
        .await
        .unwrap();

    let second = h.job(second.id).await;
    assert_eq!(second.lifecycle_status, LifecycleStatus::Processing);
    assert_eq!(second.queue.position, None);
    assert_eq!(second.queue.started_at, Some(now + Duration::seconds(30)));
    assert_eq!(second.queue.wait_time(), Some(Duration::seconds(30)));
}

#[tokio::test]
async fn scenario_b_migration_backs_off_then_fails_terminally() {
    let h = setup();
    // Nothing serves the source, so every attempt fails.
    let job = h.completed_job("https://origin.example/missing.mp4").await;

    let mut expected_waits = [Duration::minutes(2), Duration::minutes(5)].into_iter();
    for attempt in 1..=MAX_MIGRATION_ATTEMPTS {
        let outcome = h.migrate(&job).await;
        assert!(
            matches!(outcome, WorkerOutcome::Failed { attempts, .. } if attempts == attempt),
            "attempt {attempt}: {outcome:?}"
        );
        let failed_at = h.job(job.id).await.migration.last_attempt_at.unwrap();

        let Some(wait) = expected_waits.next() else {
            break;
        };
        let early = h.sweep(failed_at + wait - Duration::seconds(1)).await;
        assert_eq!(early.migrations_rearmed, 0);
        assert_eq!(h.job(job.id).await.migration.state, MigrationState::Failed);

        let due = h.sweep(failed_at + wait).await;
        assert_eq!(due.migrations_rearmed, 1);
        assert_eq!(h.job(job.id).await.migration.state, MigrationState::Pending);
    }

    // Third failure is terminal: no fourth automatic retry, however long we wait.
    let failed_at = h.job(job.id).await.migration.last_attempt_at.unwrap();
    for days in [1, 30] {
        let report = h.sweep(failed_at + Duration::days(days)).await;
        assert_eq!(report.migrations_rearmed, 0);
    }
    let job = h.job(job.id).await;
    assert_eq!(job.migration.state, MigrationState::Failed);
    assert_eq!(job.migration.attempts, MAX_MIGRATION_ATTEMPTS);
    assert!(h.orchestrator.migration().policy().is_exhausted(&job.migration));
}

#[tokio::test]
async fn scenario_c_thumbnail_completes_from_transient_url_despite_failed_migration() {
    let h = setup();
    let transient = "https://origin.example/gone.mp4";
    let job = h.completed_job(transient).await;
    assert_eq!(job.thumbnail.state, ThumbnailState::Pending);

    let outcome = h.migrate(&job).await;
    assert!(matches!(outcome, WorkerOutcome::Failed { .. }));

    let outcome = h.derive_thumbnail(&job).await;
    assert!(matches!(outcome, WorkerOutcome::Completed { .. }), "{outcome:?}");
    assert_eq!(h.transform.calls.lock().unwrap().as_slice(), [transient]);

    let job = h.job(job.id).await;
    assert_eq!(job.migration.state, MigrationState::Failed);
    assert_eq!(job.thumbnail.state, ThumbnailState::Completed);
    assert!(job.thumbnail.generated_at.is_some());
    assert!(!job.thumbnail.is_placeholder());
    job.check_invariants().unwrap();
}

#[tokio::test]
async fn scenario_d_crashed_migration_worker_is_reclaimed() {
    let h = setup();
    let job = h.completed_job("https://origin.example/v.mp4").await;
    let claimed_at = Utc::now();

    // A worker claims the job and dies without writing anything back.
    let claim = h.orchestrator.migration().claim(&job.migration, claimed_at).unwrap();
    let claimed = h
        .orchestrator
        .transition_migration(&job, claim, claimed_at)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.migration.state, MigrationState::Downloading);

    let before = h.sweep(claimed_at + Duration::minutes(9)).await;
    assert_eq!(before.migrations_reclaimed, 0);

    let reclaimed_at = claimed_at + Duration::minutes(11);
    let report = h.sweep(reclaimed_at).await;
    assert_eq!(report.migrations_reclaimed, 1);
    let job = h.job(job.id).await;
    assert_eq!(job.migration.state, MigrationState::Failed);
    assert_eq!(job.migration.attempts, 1);

    // The zombie wakes up: its stale write loses.
    let late = h.orchestrator.migration().downloaded(&claimed.migration, Utc::now()).unwrap();
    let result = h
        .orchestrator
        .transition_migration(&claimed, late, Utc::now())
        .await
        .unwrap();
    assert!(result.is_none());

    // Normal retry path afterwards.
    let report = h.sweep(reclaimed_at + Duration::minutes(2)).await;
    assert_eq!(report.migrations_rearmed, 1);
    assert_eq!(h.job(job.id).await.migration.state, MigrationState::Pending);
}

#[tokio::test]
async fn migration_completion_rearms_failed_thumbnail_on_durable_url() {
    let h = setup();
    let transient = "https://origin.example/v.mp4";
    h.objects.serve(transient, b"video-bytes");
    let job = h.completed_job(transient).await;

    h.transform.failing.store(true, Ordering::SeqCst);
    let outcome = h.derive_thumbnail(&job).await;
    assert!(matches!(outcome, WorkerOutcome::Failed { attempts: 1, .. }));
    let failed = h.job(job.id).await;
    assert!(failed.thumbnail.is_placeholder());
    // One invocation walks the whole retry table.
    assert_eq!(h.transform.calls.lock().unwrap().len(), 3);

    // Migration succeeds regardless of the thumbnail outcome...
    let outcome = h.migrate(&job).await;
    let WorkerOutcome::Completed { asset_url } = outcome else {
        panic!("migration did not complete: {outcome:?}");
    };
    // ...and its completion is the second, independent thumbnail trigger.
    let job = h.job(job.id).await;
    assert_eq!(job.durable_asset_url(), Some(asset_url.as_str()));
    assert_eq!(job.thumbnail.state, ThumbnailState::Pending);

    h.transform.failing.store(false, Ordering::SeqCst);
    let outcome = h.derive_thumbnail(&job).await;
    assert!(matches!(outcome, WorkerOutcome::Completed { .. }));
    assert_eq!(
        h.transform.calls.lock().unwrap().last().map(String::as_str),
        Some(asset_url.as_str())
    );
    let job = h.job(job.id).await;
    assert_eq!(job.thumbnail.state, ThumbnailState::Completed);
    assert_eq!(job.thumbnail.attempts, 1);
}

#[tokio::test]
async fn second_thumbnail_trigger_is_a_no_op() {
    let h = setup();
    let transient = "https://origin.example/v.mp4";
    h.objects.serve(transient, b"video-bytes");
    let job = h.completed_job(transient).await;
    let armed_at = job.thumbnail.last_attempt_at;

    h.migrate(&job).await;
    let job = h.job(job.id).await;
    assert_eq!(job.migration.state, MigrationState::Completed);
    assert_eq!(job.thumbnail.state, ThumbnailState::Pending);
    assert_eq!(job.thumbnail.last_attempt_at, armed_at);
}

#[tokio::test]
async fn migration_worker_reentry_is_idempotent() {
    let h = setup();
    let transient = "https://origin.example/v.mp4";
    h.objects.serve(transient, b"video-bytes");
    let job = h.completed_job(transient).await;

    let (a, b) = tokio::join!(h.migrate(&job), h.migrate(&job));
    let urls: Vec<_> = [&a, &b]
        .into_iter()
        .filter_map(|o| match o {
            WorkerOutcome::Completed { asset_url } | WorkerOutcome::AlreadyCompleted { asset_url } => {
                Some(asset_url.clone())
            }
            _ => None,
        })
        .collect();
    assert!(
        [&a, &b]
            .iter()
            .filter(|o| matches!(o, WorkerOutcome::Completed { .. }))
            .count()
            == 1
    );

    let again = h.migrate(&job).await;
    let WorkerOutcome::AlreadyCompleted { asset_url } = again else {
        panic!("expected already completed, got {again:?}");
    };
    assert!(urls.iter().all(|u| *u == asset_url));

    let job = h.job(job.id).await;
    assert_eq!(job.migration.attempts, 0);
    assert_eq!(h.objects.puts.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.objects.object(&crate::workers::durable_video_key(job.id)).map(|a| a.bytes.to_vec()),
        Some(b"video-bytes".to_vec())
    );

    // Operator-forced re-migration writes the same key again.
    h.orchestrator
        .force_retry_migration(job.id, true, Utc::now())
        .await
        .unwrap();
    let outcome = h.migrate(&job).await;
    assert_eq!(outcome, WorkerOutcome::Completed { asset_url });
    assert_eq!(h.objects.puts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn stuck_thumbnail_is_failed_within_one_sweep() {
    let h = setup();
    let job = h.completed_job("https://origin.example/v.mp4").await;
    let now = Utc::now();
    let claim = h.orchestrator.thumbnail().claim(&job.thumbnail, now).unwrap();
    h.orchestrator
        .transition_thumbnail(&job, claim, now)
        .await
        .unwrap()
        .unwrap();

    let report = h.sweep(now + Duration::minutes(6)).await;
    assert_eq!(report.thumbnails_reclaimed, 1);
    let job = h.job(job.id).await;
    assert_eq!(job.thumbnail.state, ThumbnailState::Failed);
    assert_eq!(job.thumbnail.attempts, 1);
    assert!(job.thumbnail.is_placeholder());

    // Cooldown elapsed: back to pending for regeneration.
    let report = h.sweep(now + Duration::minutes(9)).await;
    assert_eq!(report.thumbnails_rearmed, 1);
}

#[tokio::test]
async fn durable_asset_is_not_migrated() {
    let h = setup();
    let job = h
        .completed_job(&format!("{DURABLE_BASE}/videos/already-there"))
        .await;
    assert_eq!(job.migration.state, MigrationState::None);
    assert_eq!(job.thumbnail.state, ThumbnailState::Pending);
}

#[tokio::test]
async fn dispatcher_sends_payloads_for_pending_stages() {
    let h = setup();
    let subscription: Subscription<TransitionEvent> = h.bus.subscribe();
    let invoker = Arc::new(RecordingInvoker::default());
    let dispatcher = Dispatcher::new(h.store.clone(), invoker.clone());

    let transient = "https://origin.example/v.mp4";
    let job = h.completed_job(transient).await;
    let delivered = dispatcher.drain(&subscription).await;
    assert_eq!(delivered, 2);

    let calls = invoker.calls.lock().unwrap().clone();
    let kinds: Vec<_> = calls.iter().map(WorkerCall::kind).collect();
    assert_eq!(kinds, vec![WorkerKind::Migration, WorkerKind::Thumbnail]);
    match &calls[0] {
        WorkerCall::Migration(req) => {
            assert_eq!(req.job_id, job.id);
            assert_eq!(req.asset_url, transient);
            assert!(!req.force_remigrate);
        }
        other => panic!("unexpected call {other:?}"),
    }
    match &calls[1] {
        WorkerCall::Thumbnail(req) => {
            assert_eq!(req.asset_url, transient);
            assert_eq!(req.migration_completed_at, None);
        }
        other => panic!("unexpected call {other:?}"),
    }
}

#[tokio::test]
async fn missing_dispatch_config_is_recorded_and_redispatched_without_charge() {
    let h = setup();
    let subscription = h.bus.subscribe();
    let invoker = Arc::new(HttpWorkerInvoker::new(None, None, StdDuration::from_secs(1)).unwrap());
    let dispatcher = Dispatcher::new(h.store.clone(), invoker);

    let job = h.completed_job("https://origin.example/v.mp4").await;
    assert_eq!(dispatcher.drain(&subscription).await, 0);

    let stuck = h.job(job.id).await;
    assert_eq!(stuck.migration.state, MigrationState::Pending);
    assert!(
        stuck
            .dispatch_error
            .as_deref()
            .is_some_and(|e| e.contains("WORKER_BASE_URL"))
    );

    let report = h.sweep(Utc::now() + Duration::minutes(11)).await;
    assert_eq!(report.migrations_reclaimed, 0);
    assert_eq!(report.thumbnails_reclaimed, 0);
    assert_eq!(report.redispatched, 2);

    let job = h.job(job.id).await;
    assert_eq!(job.dispatch_error, None);
    assert_eq!(job.migration.state, MigrationState::Pending);
    assert_eq!(job.migration.attempts, 0);
    assert_eq!(job.thumbnail.attempts, 0);
}

#[tokio::test]
async fn batch_retry_prefers_fewest_attempts_then_oldest() {
    let h = setup();
    let mut jobs = Vec::new();
    for n in 0..3 {
        let job = h.completed_job(&format!("https://origin.example/{n}.mp4")).await;
        h.migrate(&job).await;
        jobs.push(job);
    }
    // Give the first job a second failure.
    h.orchestrator
        .force_retry_migration(jobs[0].id, false, Utc::now())
        .await
        .unwrap();
    h.migrate(&jobs[0]).await;
    assert_eq!(h.job(jobs[0].id).await.migration.attempts, 2);

    let retried = h
        .orchestrator
        .retry_failed_migrations(2, Utc::now())
        .await
        .unwrap();
    assert_eq!(retried, vec![jobs[1].id, jobs[2].id]);
    assert_eq!(h.job(jobs[0].id).await.migration.state, MigrationState::Failed);
}

#[tokio::test]
async fn producer_replay_is_idempotent() {
    let h = setup();
    let job = h.completed_job("https://origin.example/v.mp4").await;
    let before = h.job(job.id).await;

    let replayed = h
        .orchestrator
        .update_lifecycle(
            job.id,
            LifecycleStatus::Completed,
            Some("https://origin.example/v.mp4"),
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(replayed.migration, before.migration);
    assert_eq!(replayed.thumbnail, before.thumbnail);

    let err = h
        .orchestrator
        .update_lifecycle(job.id, LifecycleStatus::Completed, Some("https://other/v.mp4"), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, crate::orchestrator::OrchestratorError::Domain(_)));
}

#[tokio::test]
async fn promotion_pages_past_owners_at_their_ceiling() {
    let h = setup_with(|config| config.promotion_batch = 2);
    let now = Utc::now();
    let busy = OwnerId::new();
    let other = OwnerId::new();

    let mut busy_jobs = Vec::new();
    for _ in 0..4 {
        let job = h.orchestrator.submit(new_job(busy, OwnerTier::Free), now).await.unwrap();
        busy_jobs.push(job);
    }
    let running = h.orchestrator.submit(new_job(other, OwnerTier::Free), now).await.unwrap();
    let waiting = h.orchestrator.submit(new_job(other, OwnerTier::Free), now).await.unwrap();
    assert_eq!(busy_jobs[3].queue.position, Some(3));
    assert_eq!(waiting.queue.position, Some(4));

    h.orchestrator
        .update_lifecycle(running.id, LifecycleStatus::Failed, None, now)
        .await
        .unwrap();

    let waiting = h.job(waiting.id).await;
    assert_eq!(waiting.lifecycle_status, LifecycleStatus::Processing);
    assert_eq!(waiting.queue.position, None);
    for job in &busy_jobs[1..] {
        assert_eq!(h.job(job.id).await.lifecycle_status, LifecycleStatus::Pending);
    }
}

#[tokio::test]
async fn sweep_promotes_jobs_a_lost_promotion_left_queued() {
    let h = setup();
    let now = Utc::now();
    let owner = OwnerId::new();
    let first = h.orchestrator.submit(new_job(owner, OwnerTier::Free), now).await.unwrap();
    let second = h.orchestrator.submit(new_job(owner, OwnerTier::Free), now).await.unwrap();

    // Written straight to the store: no promotion runs.
    h.store
        .set_lifecycle_status(first.id, LifecycleStatus::Failed, None, now)
        .await
        .unwrap();
    assert_eq!(h.job(second.id).await.lifecycle_status, LifecycleStatus::Pending);

    let report = h.sweep(now + Duration::minutes(5)).await;
    assert_eq!(report.promoted, 1);
    assert_eq!(h.job(second.id).await.lifecycle_status, LifecycleStatus::Processing);
}

#[tokio::test]
async fn reclaimed_claim_cannot_write_after_a_forced_rerun_past_the_cap() {
    let h = setup();
    let now = Utc::now();
    let sm = h.orchestrator.migration();
    let mut job = h.completed_job("https://origin.example/flaky.mp4").await;

    for _ in 0..MAX_MIGRATION_ATTEMPTS {
        let claimed = sm.claim(&job.migration, now).unwrap();
        job = h.orchestrator.transition_migration(&job, claimed, now).await.unwrap().unwrap();
        let failed = sm.fail(&job.migration, "origin 503", false, now).unwrap();
        job = h.orchestrator.transition_migration(&job, failed, now).await.unwrap().unwrap();
        job = h.orchestrator.force_retry_migration(job.id, false, now).await.unwrap();
    }
    assert_eq!(job.migration.attempts, MAX_MIGRATION_ATTEMPTS);

    // First worker claims, then stalls until the sweep reclaims it.
    let claimed = sm.claim(&job.migration, now).unwrap();
    let stalled = h.orchestrator.transition_migration(&job, claimed, now).await.unwrap().unwrap();
    let later = now + Duration::minutes(11);
    assert_eq!(h.sweep(later).await.migrations_reclaimed, 1);

    // Operator re-runs it and a second worker claims.
    let job = h.orchestrator.force_retry_migration(job.id, false, later).await.unwrap();
    let claimed = sm.claim(&job.migration, later).unwrap();
    let live = h.orchestrator.transition_migration(&job, claimed, later).await.unwrap().unwrap();
    assert_eq!(live.migration.guard().state, stalled.migration.guard().state);
    assert_eq!(live.migration.attempts, stalled.migration.attempts);

    let late = sm.downloaded(&stalled.migration, later).unwrap();
    let applied = h.orchestrator.transition_migration(&stalled, late, later).await.unwrap();
    assert!(applied.is_none());

    let current = h.job(job.id).await;
    assert_eq!(current.migration.state, MigrationState::Downloading);
    assert_eq!(current.migration.claim_seq, live.migration.claim_seq);
}

#[tokio::test]
async fn worker_honours_force_remigrate_on_a_completed_job() {
    let h = setup();
    let transient = "https://origin.example/again.mp4";
    h.objects.serve(transient, b"video-bytes");
    let job = h.completed_job(transient).await;

    let WorkerOutcome::Completed { asset_url } = h.migrate(&job).await else {
        panic!("first migration should complete");
    };
    assert_eq!(h.objects.puts.load(Ordering::SeqCst), 1);

    let outcome = h
        .migration
        .run(MigrationRequest {
            job_id: job.id,
            asset_url: transient.to_string(),
            force_remigrate: true,
        })
        .await
        .unwrap();
    assert_eq!(outcome, WorkerOutcome::Completed { asset_url });
    assert_eq!(h.objects.puts.load(Ordering::SeqCst), 2);

    let job = h.job(job.id).await;
    assert_eq!(job.migration.state, MigrationState::Completed);
    assert_eq!(job.migration.attempts, 0);
}

/// Delegates to the in-memory store but refuses to touch one job's dispatch
/// diagnostic.
struct BrokenDispatchStore {
    inner: InMemoryJobStore,
    broken: Mutex<Option<JobId>>,
}

#[async_trait]
impl JobStore for BrokenDispatchStore {
    async fn insert(&self, job: Job) -> Result<(), StoreError> {
        self.inner.insert(job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.inner.get(id).await
    }

    async fn set_lifecycle_status(
        &self,
        id: JobId,
        status: LifecycleStatus,
        transient_asset_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<LifecycleChange, StoreError> {
        self.inner.set_lifecycle_status(id, status, transient_asset_url, now).await
    }

    async fn admit(
        &self,
        id: JobId,
        gate: &ConcurrencyGate,
        now: DateTime<Utc>,
    ) -> Result<AdmissionOutcome, StoreError> {
        self.inner.admit(id, gate, now).await
    }

    async fn queued(&self, after_position: i64, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.inner.queued(after_position, limit).await
    }

    async fn swap_migration(
        &self,
        id: JobId,
        expected: StageGuard<MigrationState>,
        next: MigrationRecord,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError> {
        self.inner.swap_migration(id, expected, next, now).await
    }

    async fn swap_thumbnail(
        &self,
        id: JobId,
        expected: StageGuard<ThumbnailState>,
        next: ThumbnailRecord,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError> {
        self.inner.swap_thumbnail(id, expected, next, now).await
    }

    async fn set_dispatch_error(
        &self,
        id: JobId,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if error.is_none() && *self.broken.lock().unwrap() == Some(id) {
            return Err(StoreError::Storage("connection reset".to_string()));
        }
        self.inner.set_dispatch_error(id, error, now).await
    }

    async fn stale_migrations(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        self.inner.stale_migrations(cutoff, limit).await
    }

    async fn stale_thumbnails(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        self.inner.stale_thumbnails(cutoff, limit).await
    }

    async fn failed_migrations(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.inner.failed_migrations(limit).await
    }

    async fn failed_thumbnails(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.inner.failed_thumbnails(limit).await
    }

    async fn undispatched(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.inner.undispatched(limit).await
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        self.inner.stats().await
    }
}

#[tokio::test]
async fn one_failing_job_does_not_stop_the_rest_of_the_sweep() {
    let store = Arc::new(BrokenDispatchStore {
        inner: InMemoryJobStore::new(),
        broken: Mutex::new(None),
    });
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        bus,
        OrchestratorConfig {
            durable_base_url: DURABLE_BASE.to_string(),
            ..OrchestratorConfig::default()
        },
    ));
    let reclaimer = Reclaimer::new(orchestrator.clone(), ReclaimerConfig::default());
    let now = Utc::now();

    let mut jobs = Vec::new();
    for name in ["undispatched", "stuck"] {
        let job = orchestrator
            .submit(new_job(OwnerId::new(), OwnerTier::Premium), now)
            .await
            .unwrap();
        let url = format!("https://origin.example/{name}.mp4");
        jobs.push(
            orchestrator
                .update_lifecycle(job.id, LifecycleStatus::Completed, Some(&url), now)
                .await
                .unwrap(),
        );
    }
    let (undispatched, stuck) = (&jobs[0], &jobs[1]);

    store
        .set_dispatch_error(undispatched.id, Some("worker url not configured".into()), now)
        .await
        .unwrap();
    *store.broken.lock().unwrap() = Some(undispatched.id);

    let sm = orchestrator.migration();
    let claimed = sm.claim(&stuck.migration, now).unwrap();
    orchestrator
        .transition_migration(stuck, claimed, now)
        .await
        .unwrap()
        .unwrap();

    let report = reclaimer.sweep_once(now + Duration::minutes(11)).await.unwrap();
    assert_eq!(report.redispatched, 0);
    assert_eq!(report.migrations_reclaimed, 1);

    let stuck = store.get(stuck.id).await.unwrap().unwrap();
    assert_eq!(stuck.migration.state, MigrationState::Failed);
    assert_eq!(stuck.migration.attempts, 1);
}

mod common;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use exam_backend::assembly::gap_filler::GAP_FILL_CALL_TYPE;
use exam_backend::assembly::types::ItemId;
use exam_backend::cache::{keys, CacheError, ExamCache, MemoryCache, SessionSnapshot, SnapshotStatus};
use exam_backend::config::ExamConfig;
use exam_backend::db::models::{DeviceMeta, ExamSession, GenerationStatus};
use exam_backend::db::{ExamStore, MemoryExamStore};
use exam_backend::services::{ExamContext, SessionError, SessionManager};

use common::{
    fast_config, seed_catalog, CatalogShape, Harness, ManualClock, Script, ScriptedGenerator, CORRECT,
    SUBJECT,
};

const FP: &str = "fp-learner-1";

/// No ai-generated pool, so anything the gap filler produces is the only
/// ai-generated content and always lands in the exam.
const NO_AI: CatalogShape = CatalogShape {
    past: 40,
    exercise: 80,
    ai: 0,
    low: 10,
};

fn meta() -> DeviceMeta {
    DeviceMeta {
        ip: Some("10.0.0.7".to_string()),
        device: "Desktop".to_string(),
        location: "LAN".to_string(),
        user_agent: Some("Mozilla/5.0 (X11; Linux x86_64)".to_string()),
    }
}

/// Stores a submitted session in which every topic-1 question was missed.
async fn seed_failed_history(harness: &Harness) {
    let start = Utc::now() - chrono::Duration::days(2);
    let mut past = ExamSession::new(FP, SUBJECT, start, vec![1, 3, 5, 7], DeviceMeta::default(), false);
    past.answers = past.content_item_ids.iter().map(|id| (*id, "D".to_string())).collect();
    past.is_submitted = true;
    past.end_time = Some(start + chrono::Duration::minutes(30));
    harness.store.insert_session(&past).await.expect("seed history");
}

#[tokio::test]
async fn test_start_creates_full_exam() {
    let harness = Harness::new(CatalogShape::FULL);

    let snapshot = harness.manager.start(FP, SUBJECT, meta()).await.expect("start");

    assert_eq!(snapshot.status, SnapshotStatus::Created);
    assert_eq!(snapshot.questions.len(), 75);
    assert_eq!(snapshot.duration_left, 9000);
    assert!(!snapshot.degraded);
    assert!(snapshot.user_answers.is_empty());

    let ids: HashSet<_> = snapshot.questions.iter().map(|q| q.id).collect();
    assert_eq!(ids.len(), 75, "no duplicate questions");
    let low_salience = ids.iter().filter(|id| (131..=140).contains(*id)).count();
    assert!(low_salience >= 5, "low-salience quota honored, got {low_salience}");

    let stored = harness
        .store
        .get_session(&snapshot.session_id)
        .await
        .expect("read")
        .expect("persisted");
    assert_eq!(stored.content_item_ids.len(), 75);
    assert_eq!(stored.device_meta, meta());
}

#[tokio::test]
async fn test_blank_fingerprint_is_rejected() {
    let harness = Harness::new(CatalogShape::FULL);

    let err = harness.manager.start("   ", SUBJECT, meta()).await.unwrap_err();

    assert!(matches!(err, SessionError::Validation(_)));
    assert_eq!(harness.store.session_count("", SUBJECT), 0);
}

#[tokio::test]
async fn test_resume_counts_down_remaining_time() {
    let harness = Harness::new(CatalogShape::FULL);
    let first = harness.manager.start(FP, SUBJECT, meta()).await.expect("start");

    harness.clock.advance(100);
    let resumed = harness.manager.start(FP, SUBJECT, meta()).await.expect("resume");

    assert_eq!(resumed.session_id, first.session_id);
    assert_eq!(resumed.status, SnapshotStatus::Resumed);
    assert_eq!(resumed.duration_left, 8900);
    assert_eq!(resumed.questions, first.questions);
    assert_eq!(harness.store.session_count(FP, SUBJECT), 1);
}

#[tokio::test]
async fn test_resume_from_store_after_cache_eviction() {
    let harness = Harness::new(CatalogShape::FULL);
    let first = harness.manager.start(FP, SUBJECT, DeviceMeta::default()).await.expect("start");
    let key = keys::session_snapshot_key(FP, SUBJECT);
    harness.cache.delete_snapshot(&key).await.expect("evict");

    harness.clock.advance(60);
    let resumed = harness.manager.start(FP, SUBJECT, meta()).await.expect("resume");

    assert_eq!(resumed.session_id, first.session_id);
    assert_eq!(resumed.duration_left, 8940);
    let question_ids: Vec<_> = resumed.questions.iter().map(|q| q.id).collect();
    let first_ids: Vec<_> = first.questions.iter().map(|q| q.id).collect();
    assert_eq!(question_ids, first_ids, "question order survives the round trip");

    let stored = harness.store.get_session(&first.session_id).await.expect("read").expect("exists");
    assert_eq!(stored.device_meta, meta(), "device metadata refreshed on resume");
    assert!(harness.cache.get_snapshot(&key).await.expect("read").is_some(), "cache repopulated");
}

#[tokio::test]
async fn test_expired_session_is_closed_and_replaced() {
    let harness = Harness::new(CatalogShape::FULL);
    let first = harness.manager.start(FP, SUBJECT, meta()).await.expect("start");
    let answers: BTreeMap<_, _> = first
        .questions
        .iter()
        .take(10)
        .map(|q| (q.id, CORRECT.to_string()))
        .collect();
    harness.manager.sync(&first.session_id, answers).await.expect("sync");

    harness.clock.advance(9001);
    let second = harness.manager.start(FP, SUBJECT, meta()).await.expect("restart");

    assert_ne!(second.session_id, first.session_id);
    assert_eq!(second.status, SnapshotStatus::Created);
    assert_eq!(second.duration_left, 9000);

    let old = harness.store.get_session(&first.session_id).await.expect("read").expect("exists");
    assert!(old.is_submitted, "expired session closed");
    assert!(old.report.is_none());

    let report = harness.manager.submit(&first.session_id).await.expect("late submit");
    assert_eq!(report.score, 10);
    assert_eq!(report.total, 75);
    assert_eq!(report.accuracy, 13);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_share_one_session() {
    let harness = Harness::new(CatalogShape::FULL);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = Arc::clone(&harness.manager);
        handles.push(tokio::spawn(async move { manager.start(FP, SUBJECT, meta()).await }));
    }

    let mut session_ids = HashSet::new();
    for handle in handles {
        let snapshot = handle.await.expect("join").expect("start");
        assert_eq!(snapshot.questions.len(), 75);
        session_ids.insert(snapshot.session_id);
    }

    assert_eq!(session_ids.len(), 1);
    assert_eq!(harness.store.session_count(FP, SUBJECT), 1);
    assert!(!harness.cache.is_locked(&keys::generation_lock_key(FP, SUBJECT)));
}

#[tokio::test]
async fn test_held_lock_surfaces_retryable_error() {
    let config = exam_backend::config::ExamConfig {
        lock_poll_interval: Duration::from_millis(10),
        lock_poll_attempts: 3,
        ..fast_config()
    };
    let harness = Harness::build(CatalogShape::FULL, config, None);
    let lock_key = keys::generation_lock_key(FP, SUBJECT);
    assert!(harness
        .cache
        .try_acquire_lock(&lock_key, "other-worker", Duration::from_secs(30))
        .await
        .expect("lock"));

    let err = harness.manager.start(FP, SUBJECT, meta()).await.unwrap_err();

    assert!(matches!(err, SessionError::RetryableConcurrency));
    assert_eq!(harness.store.session_count(FP, SUBJECT), 0);
    assert!(harness.cache.is_locked(&lock_key), "foreign lock left untouched");
}

#[tokio::test]
async fn test_small_catalog_yields_degraded_exam() {
    let harness = Harness::new(CatalogShape::SMALL);

    let snapshot = harness.manager.start(FP, SUBJECT, meta()).await.expect("start");

    assert_eq!(snapshot.questions.len(), CatalogShape::SMALL.total());
    assert!(snapshot.degraded);
    let stored = harness.store.get_session(&snapshot.session_id).await.expect("read").expect("exists");
    assert!(stored.degraded);
}

#[tokio::test]
async fn test_sync_then_submit_grades_and_records_history() {
    let harness = Harness::new(CatalogShape::FULL);
    let snapshot = harness.manager.start(FP, SUBJECT, meta()).await.expect("start");
    let answers: BTreeMap<_, _> = snapshot
        .questions
        .iter()
        .enumerate()
        .take(30)
        .map(|(i, q)| (q.id, if i < 20 { CORRECT } else { "C" }.to_string()))
        .collect();

    harness.manager.sync(&snapshot.session_id, answers.clone()).await.expect("sync");
    harness.manager.sync(&snapshot.session_id, answers.clone()).await.expect("sync again");

    let key = keys::session_snapshot_key(FP, SUBJECT);
    let cached = harness.cache.get_snapshot(&key).await.expect("read").expect("cached");
    assert_eq!(cached.user_answers, answers, "cache mirrors synced answers");

    harness.clock.advance(42 * 60);
    let report = harness.manager.submit(&snapshot.session_id).await.expect("submit");
    assert_eq!(report.score, 20);
    assert_eq!(report.total, 75);
    assert_eq!(report.accuracy, 26);
    assert_eq!(report.duration_minutes, 42);
    assert_eq!(report.topics.iter().map(|t| t.total).sum::<i32>(), 75);

    let again = harness.manager.submit(&snapshot.session_id).await.expect("resubmit");
    assert_eq!(again, report);

    let late = harness.manager.sync(&snapshot.session_id, BTreeMap::new()).await.unwrap_err();
    assert!(matches!(late, SessionError::AlreadySubmitted(_)));

    assert!(harness.cache.get_snapshot(&key).await.expect("read").is_none());
    let history = harness
        .cache
        .history(&keys::learner_history_key(FP))
        .await
        .expect("history");
    let expected: HashSet<_> = snapshot.questions.iter().map(|q| q.id).collect();
    assert_eq!(history.iter().copied().collect::<HashSet<_>>(), expected);

    let next = harness.manager.start(FP, SUBJECT, meta()).await.expect("next exam");
    assert_ne!(next.session_id, snapshot.session_id);
    assert_eq!(next.status, SnapshotStatus::Created);
}

#[tokio::test]
async fn test_recent_history_is_avoided_when_catalog_allows() {
    let wide = CatalogShape {
        past: 60,
        exercise: 100,
        ai: 10,
        low: 10,
    };
    let harness = Harness::new(wide);
    let first = harness.manager.start(FP, SUBJECT, meta()).await.expect("start");
    harness.manager.submit(&first.session_id).await.expect("submit");

    let second = harness.manager.start(FP, SUBJECT, meta()).await.expect("second");

    let seen: HashSet<_> = first.questions.iter().map(|q| q.id).collect();
    let repeats = second.questions.iter().filter(|q| seen.contains(&q.id)).count();
    assert_eq!(second.questions.len(), 75);
    assert_eq!(repeats, 0);
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let harness = Harness::new(CatalogShape::FULL);

    let err = harness.manager.submit("missing").await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));

    let err = harness.manager.sync("missing", BTreeMap::new()).await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));

    let err = harness.manager.view("missing").await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));
}

#[tokio::test]
async fn test_view_reports_stored_answers() {
    let harness = Harness::new(CatalogShape::FULL);
    let snapshot = harness.manager.start(FP, SUBJECT, meta()).await.expect("start");
    let first_id = snapshot.questions[0].id;
    let answers = BTreeMap::from([(first_id, "B".to_string())]);
    harness.manager.sync(&snapshot.session_id, answers.clone()).await.expect("sync");

    let view = harness.manager.view(&snapshot.session_id).await.expect("view");

    assert_eq!(view.session_id, snapshot.session_id);
    assert_eq!(view.user_answers, answers);
    assert_eq!(view.questions[0].user_answer.as_deref(), Some("B"));
}

#[tokio::test]
async fn test_cache_outage_does_not_block_sessions() {
    let harness = Harness::new(CatalogShape::FULL);
    harness.cache.set_unavailable(true);

    let first = harness.manager.start(FP, SUBJECT, meta()).await.expect("start without cache");
    let resumed = harness.manager.start(FP, SUBJECT, meta()).await.expect("resume without cache");
    assert_eq!(resumed.session_id, first.session_id);
    assert_eq!(resumed.status, SnapshotStatus::Resumed);

    harness.manager.sync(&first.session_id, BTreeMap::new()).await.expect("sync");
    harness.manager.submit(&first.session_id).await.expect("submit");
}

#[tokio::test]
async fn test_store_outage_is_reported() {
    let harness = Harness::new(CatalogShape::FULL);
    harness.store.set_unavailable(true);

    let err = harness.manager.start(FP, SUBJECT, meta()).await.unwrap_err();

    assert!(matches!(err, SessionError::StoreUnavailable(_)));
    assert!(!harness.cache.is_locked(&keys::generation_lock_key(FP, SUBJECT)));
}

#[tokio::test]
async fn test_gap_filler_adds_variant_for_weak_topic() {
    let generator = ScriptedGenerator::new(Script::Echo);
    let harness = Harness::with_generator(NO_AI, generator.clone());
    seed_failed_history(&harness).await;
    let before = harness.store.item_count(SUBJECT);

    let snapshot = harness.manager.start(FP, SUBJECT, meta()).await.expect("start");

    assert_eq!(generator.calls(), 1);
    assert_eq!(generator.requests(), vec![vec![1]], "one seed for the weak topic");
    assert_eq!(harness.store.item_count(SUBJECT), before + 1);

    let logs = harness.store.generation_logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].call_type, GAP_FILL_CALL_TYPE);
    assert_eq!(logs[0].status, GenerationStatus::Success);
    assert_eq!(logs[0].item_count, 1);

    let new_id = (before + 1) as i64;
    let variant = snapshot
        .questions
        .iter()
        .find(|q| q.id == new_id)
        .expect("generated item allocated");
    assert!(variant.content.starts_with("Variant of question 1"));
    assert_eq!(snapshot.questions.len(), 75);
}

#[tokio::test]
async fn test_gap_filler_rejects_invalid_variants() {
    let generator = ScriptedGenerator::new(Script::EchoWithJunk);
    let harness = Harness::with_generator(NO_AI, generator.clone());
    seed_failed_history(&harness).await;
    let before = harness.store.item_count(SUBJECT);

    harness.manager.start(FP, SUBJECT, meta()).await.expect("start");

    assert_eq!(harness.store.item_count(SUBJECT), before + 1);
    let logs = harness.store.generation_logs();
    assert_eq!(logs[0].status, GenerationStatus::Success);
    assert_eq!(logs[0].item_count, 1);
}

#[tokio::test]
async fn test_generation_failure_is_absorbed() {
    let generator = ScriptedGenerator::new(Script::Fail);
    let harness = Harness::with_generator(NO_AI, generator.clone());
    seed_failed_history(&harness).await;
    let before = harness.store.item_count(SUBJECT);

    let snapshot = harness.manager.start(FP, SUBJECT, meta()).await.expect("start");

    assert_eq!(snapshot.questions.len(), 75);
    assert!(!snapshot.degraded);
    assert_eq!(harness.store.item_count(SUBJECT), before);

    let logs = harness.store.generation_logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, GenerationStatus::Failure);
    assert_eq!(logs[0].item_count, 0);
    assert!(logs[0].error_message.as_deref().is_some_and(|m| m.contains("upstream 503")));
}

#[tokio::test]
async fn test_covered_topics_skip_generation() {
    let generator = ScriptedGenerator::new(Script::Echo);
    let harness = Harness::with_generator(NO_AI, generator.clone());

    // Topics 1 and 2 are covered after the first pass; topic 3 has no seeds.
    harness.manager.start("fp-a", SUBJECT, meta()).await.expect("first");
    assert_eq!(generator.calls(), 1);
    assert_eq!(generator.requests()[0], vec![1, 2]);

    harness.manager.start("fp-b", SUBJECT, meta()).await.expect("second");
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn test_zero_poll_interval_still_waits_and_gives_up() {
    let config = ExamConfig {
        lock_poll_interval: Duration::ZERO,
        lock_poll_attempts: 3,
        ..fast_config()
    };
    let harness = Harness::build(CatalogShape::FULL, config, None);
    let lock_key = keys::generation_lock_key(FP, SUBJECT);
    harness
        .cache
        .try_acquire_lock(&lock_key, "other-worker", Duration::from_secs(30))
        .await
        .expect("lock");

    let err = harness.manager.start(FP, SUBJECT, meta()).await.unwrap_err();

    assert!(matches!(err, SessionError::RetryableConcurrency));
}

#[tokio::test]
async fn test_final_second_resumes_from_cache() {
    let config = ExamConfig {
        cache_ttl: Duration::from_secs(10_000),
        ..fast_config()
    };
    let harness = Harness::build(CatalogShape::FULL, config, None);
    let first = harness.manager.start(FP, SUBJECT, DeviceMeta::default()).await.expect("start");

    harness.clock.advance_millis(8_999_500);
    let resumed = harness.manager.start(FP, SUBJECT, meta()).await.expect("resume");

    assert_eq!(resumed.session_id, first.session_id);
    assert_eq!(resumed.status, SnapshotStatus::Resumed);
    assert_eq!(resumed.duration_left, 0);
    let stored = harness.store.get_session(&first.session_id).await.expect("read").expect("exists");
    assert_eq!(stored.device_meta, DeviceMeta::default(), "served from cache, store untouched");
}

fn generation_config(timeout: Duration) -> ExamConfig {
    ExamConfig {
        generation_timeout: timeout,
        ..fast_config()
    }
}

#[tokio::test]
async fn test_generation_timeout_is_absorbed() {
    let generator = ScriptedGenerator::new(Script::Hang);
    let harness = Harness::build(NO_AI, generation_config(Duration::from_millis(50)), Some(generator.clone()));
    seed_failed_history(&harness).await;
    let before = harness.store.item_count(SUBJECT);

    let snapshot = harness.manager.start(FP, SUBJECT, meta()).await.expect("start");

    assert_eq!(generator.calls(), 1);
    assert_eq!(snapshot.questions.len(), 75);
    assert!(!snapshot.degraded);
    assert_eq!(harness.store.item_count(SUBJECT), before);

    let logs = harness.store.generation_logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, GenerationStatus::Failure);
    assert_eq!(logs[0].item_count, 0);
    assert!(logs[0].latency_ms >= 50);
    assert!(logs[0].error_message.as_deref().is_some_and(|m| m.contains("timed out")));
}

#[tokio::test]
async fn test_abandoned_start_releases_local_lock() {
    let generator = ScriptedGenerator::new(Script::Hang);
    let harness = Harness::build(NO_AI, generation_config(Duration::from_millis(200)), Some(generator.clone()));
    seed_failed_history(&harness).await;
    harness.cache.set_unavailable(true);

    let manager = Arc::clone(&harness.manager);
    let abandoned = tokio::spawn(async move { manager.start(FP, SUBJECT, meta()).await });
    for _ in 0..200 {
        if generator.calls() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(generator.calls(), 1, "first start is inside generation");
    abandoned.abort();
    assert!(abandoned.await.unwrap_err().is_cancelled());

    let snapshot = harness.manager.start(FP, SUBJECT, meta()).await.expect("start after abort");

    assert_eq!(snapshot.status, SnapshotStatus::Created);
    assert_eq!(snapshot.questions.len(), 75);
    assert_eq!(harness.store.session_count(FP, SUBJECT), 1);
}

/// Memory cache whose next `put_snapshot` parks until released.
struct GatedCache {
    inner: MemoryCache,
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl ExamCache for GatedCache {
    async fn get_snapshot(&self, key: &str) -> Result<Option<SessionSnapshot>, CacheError> {
        self.inner.get_snapshot(key).await
    }

    async fn put_snapshot(&self, key: &str, snapshot: &SessionSnapshot, ttl: Duration) -> Result<(), CacheError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.put_snapshot(key, snapshot, ttl).await
    }

    async fn delete_snapshot(&self, key: &str) -> Result<(), CacheError> {
        self.inner.delete_snapshot(key).await
    }

    async fn try_acquire_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.inner.try_acquire_lock(key, token, ttl).await
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool, CacheError> {
        self.inner.release_lock(key, token).await
    }

    async fn history(&self, key: &str) -> Result<Vec<ItemId>, CacheError> {
        self.inner.history(key).await
    }

    async fn push_history(
        &self,
        key: &str,
        ids: &[ItemId],
        capacity: usize,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.inner.push_history(key, ids, capacity, ttl).await
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.inner.ping().await
    }
}

#[tokio::test]
async fn test_sync_overlapping_submit_does_not_revive_session() {
    let store = Arc::new(MemoryExamStore::new());
    seed_catalog(&store, CatalogShape::FULL);
    let clock = Arc::new(ManualClock::new());
    let cache = Arc::new(GatedCache {
        inner: MemoryCache::with_clock(clock.clone()),
        armed: AtomicBool::new(false),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let ctx = ExamContext::new(store.clone(), cache.clone(), fast_config()).with_clock(clock);
    let manager = Arc::new(SessionManager::new(ctx));

    let first = manager.start(FP, SUBJECT, meta()).await.expect("start");
    let session_id = first.session_id.clone();
    let answers = BTreeMap::from([(first.questions[0].id, CORRECT.to_string())]);

    cache.armed.store(true, Ordering::SeqCst);
    let sync = tokio::spawn({
        let manager = Arc::clone(&manager);
        let session_id = session_id.clone();
        async move { manager.sync(&session_id, answers).await }
    });
    cache.entered.notified().await;

    let report = manager.submit(&session_id).await.expect("submit");
    assert_eq!(report.score, 1);
    cache.release.notify_one();
    sync.await.expect("join").expect("answers saved before submit");

    let key = keys::session_snapshot_key(FP, SUBJECT);
    assert!(cache.get_snapshot(&key).await.expect("read").is_none());
    let next = manager.start(FP, SUBJECT, meta()).await.expect("next exam");
    assert_ne!(next.session_id, session_id);
    assert_eq!(next.status, SnapshotStatus::Created);
}

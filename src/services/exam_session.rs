use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;

use crate::assembly::types::{Catalog, ContentItem, ItemId, SubjectId};
use crate::assembly::weight::{tally_error_rates, AnswerSheet};
use crate::assembly::{
    ContentGapFiller, HistoryTracker, LearnerSignals, PoolAllocator, QuestionGenerator,
};
use crate::cache::{keys, ExamCache, SessionSnapshot, SnapshotStatus};
use crate::clock::{Clock, SystemClock};
use crate::config::ExamConfig;
use crate::db::models::{duration_left, DeviceMeta, ExamSession, SessionReport, SessionStatus};
use crate::db::store::{ExamStore, SaveOutcome, StoreError};
use crate::services::grading::grade_session;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("exam generation already in progress, retry shortly")]
    RetryableConcurrency,
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session {0} already submitted")]
    AlreadySubmitted(String),
    #[error("{0}")]
    Validation(String),
}

/// Everything the lifecycle manager talks to, passed in explicitly.
#[derive(Clone)]
pub struct ExamContext {
    pub store: Arc<dyn ExamStore>,
    pub cache: Arc<dyn ExamCache>,
    pub generator: Option<Arc<dyn QuestionGenerator>>,
    pub clock: Arc<dyn Clock>,
    pub config: ExamConfig,
}

impl ExamContext {
    pub fn new(store: Arc<dyn ExamStore>, cache: Arc<dyn ExamCache>, config: ExamConfig) -> Self {
        Self {
            store,
            cache,
            generator: None,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn QuestionGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

type LocalLockTable = Arc<Mutex<HashMap<String, (String, Instant)>>>;

/// Process-local generation lock used while the cache is unreachable.
/// Released on drop, so an abandoned `start` cannot wedge the key; an entry
/// past its deadline is treated as free.
struct LocalLock {
    table: LocalLockTable,
    key: String,
    token: String,
}

impl LocalLock {
    fn try_acquire(table: &LocalLockTable, key: &str, ttl: Duration) -> Option<Self> {
        let now = Instant::now();
        let mut held = table.lock();
        if held.get(key).is_some_and(|(_, deadline)| *deadline > now) {
            return None;
        }

        let token = uuid::Uuid::new_v4().to_string();
        held.insert(key.to_string(), (token.clone(), now + ttl));
        Some(Self {
            table: Arc::clone(table),
            key: key.to_string(),
            token,
        })
    }
}

impl Drop for LocalLock {
    fn drop(&mut self) {
        let mut held = self.table.lock();
        if held.get(&self.key).is_some_and(|(token, _)| *token == self.token) {
            held.remove(&self.key);
        }
    }
}

enum LockGuard {
    Cache { key: String, token: String },
    Local(LocalLock),
}

enum LockAttempt {
    Acquired(LockGuard),
    Contended,
}

/// Owns the session state machine: resume or create on start, answer
/// sync, and grading on submit.
pub struct SessionManager {
    ctx: ExamContext,
    allocator: PoolAllocator,
    history: HistoryTracker,
    gap_filler: Option<ContentGapFiller>,
    local_locks: LocalLockTable,
}

impl SessionManager {
    pub fn new(ctx: ExamContext) -> Self {
        let config = &ctx.config;
        let allocator = PoolAllocator::new(config.plan, config.weak_topics);
        let history = HistoryTracker::new(
            Arc::clone(&ctx.cache),
            config.history_capacity,
            config.history_ttl,
        );
        let gap_filler = ctx.generator.as_ref().map(|generator| {
            ContentGapFiller::new(
                Arc::clone(generator),
                Arc::clone(&ctx.store),
                config.generation_timeout,
            )
        });

        Self {
            ctx,
            allocator,
            history,
            gap_filler,
            local_locks: LocalLockTable::default(),
        }
    }

    pub fn context(&self) -> &ExamContext {
        &self.ctx
    }

    /// Returns the learner's live session for the subject, creating one
    /// when none exists.
    pub async fn start(
        &self,
        fingerprint: &str,
        subject_id: SubjectId,
        device_meta: DeviceMeta,
    ) -> Result<SessionSnapshot, SessionError> {
        let fingerprint = fingerprint.trim();
        if fingerprint.is_empty() {
            return Err(SessionError::Validation("user_fingerprint is required".to_string()));
        }

        let snapshot_key = keys::session_snapshot_key(fingerprint, subject_id);
        if let Some(snapshot) = self.cached_snapshot(&snapshot_key).await {
            tracing::debug!(fingerprint, subject_id, session_id = %snapshot.session_id, "resumed from cache");
            return Ok(snapshot);
        }

        if let Some(snapshot) = self.resume_from_store(fingerprint, subject_id, Some(&device_meta)).await? {
            return Ok(snapshot);
        }

        let lock_key = keys::generation_lock_key(fingerprint, subject_id);
        let guard = match self.acquire_lock(&lock_key).await {
            LockAttempt::Acquired(guard) => guard,
            LockAttempt::Contended => return self.wait_for_winner(fingerprint, subject_id).await,
        };

        let result = match self.resume_from_store(fingerprint, subject_id, None).await {
            Ok(Some(snapshot)) => Ok(snapshot),
            Ok(None) => self.create_session(fingerprint, subject_id, device_meta).await,
            Err(err) => Err(err),
        };

        self.release_lock(guard).await;
        result
    }

    /// Overwrites the stored answer map; the cache copy follows best-effort.
    pub async fn sync(
        &self,
        session_id: &str,
        answers: BTreeMap<ItemId, String>,
    ) -> Result<(), SessionError> {
        let session = match self.ctx.store.save_answers(session_id, &answers).await? {
            SaveOutcome::Saved(session) => session,
            SaveOutcome::Submitted(_) => return Err(SessionError::AlreadySubmitted(session_id.to_string())),
            SaveOutcome::Missing => return Err(SessionError::NotFound(session_id.to_string())),
        };

        self.mirror_answers(&session, answers).await;
        Ok(())
    }

    /// Grades and closes the session. Repeated calls return the first report.
    pub async fn submit(&self, session_id: &str) -> Result<SessionReport, SessionError> {
        let session = self
            .ctx
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        if session.is_submitted {
            return self.stored_report(session).await;
        }

        let items = self.ctx.store.items_by_ids(&session.content_item_ids).await?;
        let now = self.ctx.clock.now();
        let report = grade_session(&session, &items, now);

        if !self.ctx.store.complete_session(session_id, now, &report).await? {
            tracing::info!(session_id, "session submitted concurrently, returning stored result");
            let session = self
                .ctx
                .store
                .get_session(session_id)
                .await?
                .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
            return self.stored_report(session).await;
        }

        self.history
            .record(&session.learner_fingerprint, &session.content_item_ids)
            .await;

        let key = keys::session_snapshot_key(&session.learner_fingerprint, session.subject_id);
        if let Err(err) = self.ctx.cache.delete_snapshot(&key).await {
            tracing::warn!(session_id, error = %err, "cache invalidation after submit failed");
        }

        tracing::info!(
            session_id,
            fingerprint = %session.learner_fingerprint,
            subject_id = session.subject_id,
            score = report.score,
            total = report.total,
            "exam submitted"
        );
        Ok(report)
    }

    /// Resume payload of a stored session without touching assembly.
    pub async fn view(&self, session_id: &str) -> Result<SessionSnapshot, SessionError> {
        let session = self
            .ctx
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        self.snapshot_of(&session, SnapshotStatus::Resumed).await
    }

    async fn mirror_answers(&self, session: &ExamSession, answers: BTreeMap<ItemId, String>) {
        let session_id = session.id.as_str();
        let key = keys::session_snapshot_key(&session.learner_fingerprint, session.subject_id);
        let mut snapshot = match self.ctx.cache.get_snapshot(&key).await {
            Ok(Some(snapshot)) if snapshot.session_id == session.id => snapshot,
            Ok(_) => return,
            Err(err) => {
                tracing::warn!(session_id, error = %err, "cache read during sync failed");
                return;
            }
        };

        snapshot.set_answers(answers);
        if let Err(err) = self
            .ctx
            .cache
            .put_snapshot(&key, &snapshot, self.ctx.config.cache_ttl)
            .await
        {
            tracing::warn!(session_id, error = %err, "cache mirror of answers failed");
            return;
        }

        // A submit may have invalidated the key between the read and the write.
        let submitted = match self.ctx.store.get_session(session_id).await {
            Ok(current) => current.map_or(true, |current| current.is_submitted),
            Err(err) => {
                tracing::warn!(session_id, error = %err, "store re-read after cache mirror failed");
                true
            }
        };
        if submitted {
            if let Err(err) = self.ctx.cache.delete_snapshot(&key).await {
                tracing::warn!(session_id, error = %err, "dropping stale snapshot failed");
            }
        }
    }

    fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ctx.config.session_ttl.as_secs() as i64)
    }

    fn remaining(&self, start_time: DateTime<Utc>) -> i64 {
        duration_left(start_time, self.ctx.clock.now(), self.session_ttl())
    }

    async fn cached_snapshot(&self, key: &str) -> Option<SessionSnapshot> {
        let snapshot = match self.ctx.cache.get_snapshot(key).await {
            Ok(snapshot) => snapshot?,
            Err(err) => {
                tracing::warn!(key, error = %err, "cache read failed, falling back to store");
                return None;
            }
        };

        let now = self.ctx.clock.now();
        if now - snapshot.start_time < self.session_ttl() {
            let left = duration_left(snapshot.start_time, now, self.session_ttl());
            return Some(snapshot.resumed(left));
        }

        if let Err(err) = self.ctx.cache.delete_snapshot(key).await {
            tracing::warn!(key, error = %err, "evicting expired snapshot failed");
        }
        None
    }

    /// Resumes an unexpired unsubmitted session; an expired one is closed.
    async fn resume_from_store(
        &self,
        fingerprint: &str,
        subject_id: SubjectId,
        device_meta: Option<&DeviceMeta>,
    ) -> Result<Option<SessionSnapshot>, SessionError> {
        let Some(mut session) = self.ctx.store.find_active_session(fingerprint, subject_id).await? else {
            return Ok(None);
        };

        let now = self.ctx.clock.now();
        if session.status(now, self.session_ttl()) == SessionStatus::Expired {
            tracing::info!(session_id = %session.id, fingerprint, subject_id, "closing expired session");
            self.ctx.store.close_session(&session.id, now).await?;
            return Ok(None);
        }

        if let Some(meta) = device_meta {
            self.ctx.store.update_device_meta(&session.id, meta).await?;
            session.device_meta = meta.clone();
        }

        let snapshot = self.snapshot_of(&session, SnapshotStatus::Resumed).await?;
        self.cache_snapshot(fingerprint, subject_id, &snapshot).await;
        Ok(Some(snapshot))
    }

    async fn snapshot_of(
        &self,
        session: &ExamSession,
        status: SnapshotStatus,
    ) -> Result<SessionSnapshot, SessionError> {
        let items = self.ctx.store.items_by_ids(&session.content_item_ids).await?;
        let left = if session.is_submitted {
            0
        } else {
            self.remaining(session.start_time)
        };
        Ok(SessionSnapshot::build(session, &items, status, left))
    }

    async fn cache_snapshot(&self, fingerprint: &str, subject_id: SubjectId, snapshot: &SessionSnapshot) {
        let key = keys::session_snapshot_key(fingerprint, subject_id);
        if let Err(err) = self
            .ctx
            .cache
            .put_snapshot(&key, snapshot, self.ctx.config.cache_ttl)
            .await
        {
            tracing::warn!(fingerprint, subject_id, error = %err, "cache write failed");
        }
    }

    async fn acquire_lock(&self, key: &str) -> LockAttempt {
        let token = uuid::Uuid::new_v4().to_string();
        match self
            .ctx
            .cache
            .try_acquire_lock(key, &token, self.ctx.config.lock_ttl)
            .await
        {
            Ok(true) => LockAttempt::Acquired(LockGuard::Cache {
                key: key.to_string(),
                token,
            }),
            Ok(false) => LockAttempt::Contended,
            Err(err) => {
                tracing::warn!(key, error = %err, "cache lock unavailable, using process-local lock");
                match LocalLock::try_acquire(&self.local_locks, key, self.ctx.config.lock_ttl) {
                    Some(lock) => LockAttempt::Acquired(LockGuard::Local(lock)),
                    None => LockAttempt::Contended,
                }
            }
        }
    }

    async fn release_lock(&self, guard: LockGuard) {
        match guard {
            LockGuard::Cache { key, token } => match self.ctx.cache.release_lock(&key, &token).await {
                Ok(true) => {}
                Ok(false) => tracing::warn!(key = %key, "generation lock expired before release"),
                Err(err) => tracing::warn!(key = %key, error = %err, "generation lock release failed"),
            },
            LockGuard::Local(lock) => drop(lock),
        }
    }

    /// Polls the store while another worker assembles the session.
    async fn wait_for_winner(
        &self,
        fingerprint: &str,
        subject_id: SubjectId,
    ) -> Result<SessionSnapshot, SessionError> {
        let config = &self.ctx.config;
        let mut ticker = tokio::time::interval(config.lock_poll_interval.max(MIN_POLL_INTERVAL));
        ticker.tick().await;

        for attempt in 1..=config.lock_poll_attempts {
            ticker.tick().await;
            if let Some(snapshot) = self.resume_from_store(fingerprint, subject_id, None).await? {
                tracing::debug!(fingerprint, subject_id, attempt, "picked up session built by another worker");
                return Ok(snapshot);
            }
        }

        tracing::warn!(fingerprint, subject_id, "gave up waiting for concurrent exam generation");
        Err(SessionError::RetryableConcurrency)
    }

    async fn create_session(
        &self,
        fingerprint: &str,
        subject_id: SubjectId,
        device_meta: DeviceMeta,
    ) -> Result<SessionSnapshot, SessionError> {
        let store = &self.ctx.store;
        let topics = store.list_topics(subject_id).await?;
        let items = store.list_content_items(subject_id).await?;
        let mut catalog = Catalog::new(subject_id, topics, items);

        let signals = self.learner_signals(fingerprint, subject_id, &catalog).await?;
        let mut rng = StdRng::from_rng(&mut rand::rng());
        let allocation = self
            .allocator
            .allocate(&mut catalog, &signals, self.gap_filler.as_ref(), &mut rng)
            .await;

        let degraded = allocation.is_degraded();
        let breakdown = allocation.breakdown;
        if degraded {
            tracing::warn!(
                fingerprint,
                subject_id,
                shortfall = allocation.shortfall,
                "catalog too small for a full exam"
            );
        }

        let now = self.ctx.clock.now();
        let session = ExamSession::new(
            fingerprint,
            subject_id,
            now,
            allocation.item_ids,
            device_meta,
            degraded,
        );

        match store.insert_session(&session).await {
            Ok(()) => {}
            Err(StoreError::Conflict { .. }) => {
                tracing::info!(fingerprint, subject_id, "lost insert race, returning winning session");
                return self
                    .resume_from_store(fingerprint, subject_id, None)
                    .await?
                    .ok_or(SessionError::RetryableConcurrency);
            }
            Err(err) => return Err(err.into()),
        }

        let chosen: Vec<ContentItem> = session
            .content_item_ids
            .iter()
            .filter_map(|id| catalog.item(*id).cloned())
            .collect();
        let left = self.remaining(session.start_time);
        let snapshot = SessionSnapshot::build(&session, &chosen, SnapshotStatus::Created, left);
        self.cache_snapshot(fingerprint, subject_id, &snapshot).await;

        tracing::info!(
            session_id = %session.id,
            fingerprint,
            subject_id,
            items = session.content_item_ids.len(),
            ?breakdown,
            degraded = session.degraded,
            "exam session created"
        );
        Ok(snapshot)
    }

    async fn learner_signals(
        &self,
        fingerprint: &str,
        subject_id: SubjectId,
        catalog: &Catalog,
    ) -> Result<LearnerSignals, SessionError> {
        let recent = self
            .ctx
            .store
            .recent_submitted_sessions(fingerprint, subject_id, self.ctx.config.error_rate_window)
            .await?;
        let error_rates = tally_error_rates(
            recent.iter().map(|s| AnswerSheet {
                item_ids: &s.content_item_ids,
                answers: &s.answers,
            }),
            catalog,
        );
        let history = self.history.recent(fingerprint).await.to_exclusion_set();

        Ok(LearnerSignals {
            error_rates,
            history,
        })
    }

    async fn stored_report(&self, session: ExamSession) -> Result<SessionReport, SessionError> {
        if let Some(report) = session.report {
            return Ok(report);
        }
        // Closed by expiry: grade without persisting.
        let items = self.ctx.store.items_by_ids(&session.content_item_ids).await?;
        let end_time = session.end_time.unwrap_or_else(|| self.ctx.clock.now());
        Ok(grade_session(&session, &items, end_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_lock_released_on_drop() {
        let table = LocalLockTable::default();
        let held = LocalLock::try_acquire(&table, "k", Duration::from_secs(30)).expect("acquire");
        assert!(LocalLock::try_acquire(&table, "k", Duration::from_secs(30)).is_none());

        drop(held);
        assert!(table.lock().is_empty());
        assert!(LocalLock::try_acquire(&table, "k", Duration::from_secs(30)).is_some());
    }

    #[test]
    fn test_stale_local_lock_is_taken_over() {
        let table = LocalLockTable::default();
        let stale = LocalLock::try_acquire(&table, "k", Duration::ZERO).expect("acquire");
        let fresh = LocalLock::try_acquire(&table, "k", Duration::from_secs(30)).expect("take over");

        drop(stale);
        assert!(table.lock().contains_key("k"), "stale guard leaves the new owner alone");
        drop(fresh);
        assert!(table.lock().is_empty());
    }
}

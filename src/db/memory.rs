use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::assembly::types::{ContentItem, ItemId, NewContentItem, SubjectId, Topic};
use crate::db::models::{DeviceMeta, ExamSession, GenerationLog, SessionReport};
use crate::db::store::{ExamStore, SaveOutcome, StoreError};

#[derive(Default)]
struct Inner {
    topics: Vec<Topic>,
    items: Vec<(SubjectId, ContentItem)>,
    next_item_id: ItemId,
    sessions: HashMap<String, ExamSession>,
    generation_logs: Vec<GenerationLog>,
}

/// Process-local store used when no `DATABASE_URL` is configured.
#[derive(Default)]
pub struct MemoryExamStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryExamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_topics(&self, topics: impl IntoIterator<Item = Topic>) {
        self.inner.lock().topics.extend(topics);
    }

    pub fn add_items(&self, subject_id: SubjectId, items: impl IntoIterator<Item = ContentItem>) {
        let mut inner = self.inner.lock();
        for item in items {
            inner.next_item_id = inner.next_item_id.max(item.id);
            inner.items.push((subject_id, item));
        }
    }

    /// Makes every call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn session_count(&self, fingerprint: &str, subject_id: SubjectId) -> usize {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|s| s.learner_fingerprint == fingerprint && s.subject_id == subject_id)
            .count()
    }

    pub fn item_count(&self, subject_id: SubjectId) -> usize {
        self.inner
            .lock()
            .items
            .iter()
            .filter(|(subject, _)| *subject == subject_id)
            .count()
    }

    pub fn generation_logs(&self) -> Vec<GenerationLog> {
        self.inner.lock().generation_logs.clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ExamStore for MemoryExamStore {
    async fn list_topics(&self, subject_id: SubjectId) -> Result<Vec<Topic>, StoreError> {
        self.check()?;
        let inner = self.inner.lock();
        Ok(inner
            .topics
            .iter()
            .filter(|t| t.subject_id == subject_id)
            .cloned()
            .collect())
    }

    async fn list_content_items(&self, subject_id: SubjectId) -> Result<Vec<ContentItem>, StoreError> {
        self.check()?;
        let inner = self.inner.lock();
        Ok(inner
            .items
            .iter()
            .filter(|(subject, _)| *subject == subject_id)
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn items_by_ids(&self, ids: &[ItemId]) -> Result<Vec<ContentItem>, StoreError> {
        self.check()?;
        let inner = self.inner.lock();
        Ok(inner
            .items
            .iter()
            .filter(|(_, item)| ids.contains(&item.id))
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn insert_content_items(&self, items: &[NewContentItem]) -> Result<Vec<ContentItem>, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock();
        let mut inserted = Vec::with_capacity(items.len());
        for item in items {
            inner.next_item_id += 1;
            let stored = ContentItem {
                id: inner.next_item_id,
                topic_id: item.topic_id,
                pool: item.pool,
                source_detail: item.source_detail.clone(),
                payload: item.payload.clone(),
            };
            inner.items.push((item.subject_id, stored.clone()));
            inserted.push(stored);
        }
        Ok(inserted)
    }

    async fn find_active_session(
        &self,
        fingerprint: &str,
        subject_id: SubjectId,
    ) -> Result<Option<ExamSession>, StoreError> {
        self.check()?;
        let inner = self.inner.lock();
        Ok(inner
            .sessions
            .values()
            .filter(|s| {
                !s.is_submitted && s.learner_fingerprint == fingerprint && s.subject_id == subject_id
            })
            .max_by_key(|s| s.start_time)
            .cloned())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<ExamSession>, StoreError> {
        self.check()?;
        Ok(self.inner.lock().sessions.get(session_id).cloned())
    }

    async fn insert_session(&self, session: &ExamSession) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock();
        let clash = inner.sessions.values().any(|s| {
            !s.is_submitted
                && s.learner_fingerprint == session.learner_fingerprint
                && s.subject_id == session.subject_id
        });
        if clash && !session.is_submitted {
            return Err(StoreError::Conflict {
                fingerprint: session.learner_fingerprint.clone(),
                subject_id: session.subject_id,
            });
        }
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn update_device_meta(&self, session_id: &str, meta: &DeviceMeta) -> Result<(), StoreError> {
        self.check()?;
        if let Some(session) = self.inner.lock().sessions.get_mut(session_id) {
            session.device_meta = meta.clone();
        }
        Ok(())
    }

    async fn close_session(&self, session_id: &str, end_time: DateTime<Utc>) -> Result<(), StoreError> {
        self.check()?;
        if let Some(session) = self.inner.lock().sessions.get_mut(session_id) {
            if !session.is_submitted {
                session.is_submitted = true;
                session.end_time = Some(end_time);
            }
        }
        Ok(())
    }

    async fn save_answers(
        &self,
        session_id: &str,
        answers: &BTreeMap<ItemId, String>,
    ) -> Result<SaveOutcome, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock();
        Ok(match inner.sessions.get_mut(session_id) {
            None => SaveOutcome::Missing,
            Some(session) if session.is_submitted => SaveOutcome::Submitted(session.clone()),
            Some(session) => {
                session.answers = answers.clone();
                SaveOutcome::Saved(session.clone())
            }
        })
    }

    async fn complete_session(
        &self,
        session_id: &str,
        end_time: DateTime<Utc>,
        report: &SessionReport,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock();
        match inner.sessions.get_mut(session_id) {
            Some(session) if !session.is_submitted => {
                session.is_submitted = true;
                session.end_time = Some(end_time);
                session.score = Some(report.score);
                session.report = Some(report.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn recent_submitted_sessions(
        &self,
        fingerprint: &str,
        subject_id: SubjectId,
        limit: usize,
    ) -> Result<Vec<ExamSession>, StoreError> {
        self.check()?;
        let inner = self.inner.lock();
        let mut sessions: Vec<ExamSession> = inner
            .sessions
            .values()
            .filter(|s| {
                s.is_submitted && s.learner_fingerprint == fingerprint && s.subject_id == subject_id
            })
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        sessions.truncate(limit);
        Ok(sessions)
    }

    async fn record_generation(&self, log: &GenerationLog) -> Result<(), StoreError> {
        self.check()?;
        self.inner.lock().generation_logs.push(log.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}

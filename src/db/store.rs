use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::assembly::types::{ContentItem, ItemId, NewContentItem, SubjectId, Topic};
use crate::db::models::{DeviceMeta, ExamSession, GenerationLog, SessionReport};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("an active session already exists for {fingerprint}/{subject_id}")]
    Conflict {
        fingerprint: String,
        subject_id: SubjectId,
    },
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Result of overwriting a session's answer map.
#[derive(Debug, Clone)]
pub enum SaveOutcome {
    Saved(ExamSession),
    Submitted(ExamSession),
    Missing,
}

/// Durable store; the source of truth for catalog and sessions.
///
/// `insert_session` must refuse a second unsubmitted session for the same
/// learner and subject with [`StoreError::Conflict`].
#[async_trait]
pub trait ExamStore: Send + Sync {
    async fn list_topics(&self, subject_id: SubjectId) -> Result<Vec<Topic>, StoreError>;

    async fn list_content_items(&self, subject_id: SubjectId) -> Result<Vec<ContentItem>, StoreError>;

    async fn items_by_ids(&self, ids: &[ItemId]) -> Result<Vec<ContentItem>, StoreError>;

    async fn insert_content_items(&self, items: &[NewContentItem]) -> Result<Vec<ContentItem>, StoreError>;

    async fn find_active_session(
        &self,
        fingerprint: &str,
        subject_id: SubjectId,
    ) -> Result<Option<ExamSession>, StoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<ExamSession>, StoreError>;

    async fn insert_session(&self, session: &ExamSession) -> Result<(), StoreError>;

    async fn update_device_meta(&self, session_id: &str, meta: &DeviceMeta) -> Result<(), StoreError>;

    /// Marks an expired session submitted without grading it.
    async fn close_session(&self, session_id: &str, end_time: DateTime<Utc>) -> Result<(), StoreError>;

    async fn save_answers(
        &self,
        session_id: &str,
        answers: &BTreeMap<ItemId, String>,
    ) -> Result<SaveOutcome, StoreError>;

    /// Returns `false` when the session was already submitted.
    async fn complete_session(
        &self,
        session_id: &str,
        end_time: DateTime<Utc>,
        report: &SessionReport,
    ) -> Result<bool, StoreError>;

    /// Newest first.
    async fn recent_submitted_sessions(
        &self,
        fingerprint: &str,
        subject_id: SubjectId,
        limit: usize,
    ) -> Result<Vec<ExamSession>, StoreError>;

    async fn record_generation(&self, log: &GenerationLog) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

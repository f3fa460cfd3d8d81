pub mod catalog;
pub mod exam_sessions;
pub mod generation_logs;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::assembly::types::{ContentItem, ItemId, NewContentItem, SubjectId, Topic};
use crate::db::models::{DeviceMeta, ExamSession, GenerationLog, SessionReport};
use crate::db::store::{ExamStore, SaveOutcome, StoreError};
use crate::db::DatabaseProxy;

#[async_trait]
impl ExamStore for DatabaseProxy {
    async fn list_topics(&self, subject_id: SubjectId) -> Result<Vec<Topic>, StoreError> {
        catalog::list_topics(self.pool(), subject_id).await
    }

    async fn list_content_items(&self, subject_id: SubjectId) -> Result<Vec<ContentItem>, StoreError> {
        catalog::list_content_items(self.pool(), subject_id).await
    }

    async fn items_by_ids(&self, ids: &[ItemId]) -> Result<Vec<ContentItem>, StoreError> {
        catalog::items_by_ids(self.pool(), ids).await
    }

    async fn insert_content_items(&self, items: &[NewContentItem]) -> Result<Vec<ContentItem>, StoreError> {
        catalog::insert_content_items(self.pool(), items).await
    }

    async fn find_active_session(
        &self,
        fingerprint: &str,
        subject_id: SubjectId,
    ) -> Result<Option<ExamSession>, StoreError> {
        exam_sessions::find_active_session(self.pool(), fingerprint, subject_id).await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<ExamSession>, StoreError> {
        exam_sessions::get_session(self.pool(), session_id).await
    }

    async fn insert_session(&self, session: &ExamSession) -> Result<(), StoreError> {
        exam_sessions::insert_session(self.pool(), session).await
    }

    async fn update_device_meta(&self, session_id: &str, meta: &DeviceMeta) -> Result<(), StoreError> {
        exam_sessions::update_device_meta(self.pool(), session_id, meta).await
    }

    async fn close_session(&self, session_id: &str, end_time: DateTime<Utc>) -> Result<(), StoreError> {
        exam_sessions::close_session(self.pool(), session_id, end_time).await
    }

    async fn save_answers(
        &self,
        session_id: &str,
        answers: &BTreeMap<ItemId, String>,
    ) -> Result<SaveOutcome, StoreError> {
        exam_sessions::save_answers(self.pool(), session_id, answers).await
    }

    async fn complete_session(
        &self,
        session_id: &str,
        end_time: DateTime<Utc>,
        report: &SessionReport,
    ) -> Result<bool, StoreError> {
        exam_sessions::complete_session(self.pool(), session_id, end_time, report).await
    }

    async fn recent_submitted_sessions(
        &self,
        fingerprint: &str,
        subject_id: SubjectId,
        limit: usize,
    ) -> Result<Vec<ExamSession>, StoreError> {
        exam_sessions::recent_submitted_sessions(self.pool(), fingerprint, subject_id, limit).await
    }

    async fn record_generation(&self, log: &GenerationLog) -> Result<(), StoreError> {
        generation_logs::record_generation(self.pool(), log).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(self.pool()).await?;
        Ok(())
    }
}

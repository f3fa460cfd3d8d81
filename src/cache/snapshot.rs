use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::assembly::types::{ContentItem, ItemId};
use crate::db::models::ExamSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Created,
    Resumed,
}

/// A question as shown to the learner. Never carries the answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionView {
    pub id: ItemId,
    pub index: usize,
    pub content: String,
    pub options: Value,
    #[serde(rename = "type")]
    pub kind: String,
    pub user_answer: Option<String>,
}

impl QuestionView {
    pub fn from_item(item: &ContentItem, index: usize) -> Self {
        Self {
            id: item.id,
            index,
            content: item.payload.content.clone(),
            options: item.payload.options.clone(),
            kind: "single".to_string(),
            user_answer: None,
        }
    }
}

/// Resume payload of a session; both the cache entry and the start response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub status: SnapshotStatus,
    pub start_time: DateTime<Utc>,
    pub duration_left: i64,
    pub questions: Vec<QuestionView>,
    pub user_answers: BTreeMap<ItemId, String>,
    pub degraded: bool,
}

impl SessionSnapshot {
    /// Questions follow the session's item order; ids missing from `items`
    /// are skipped.
    pub fn build(
        session: &ExamSession,
        items: &[ContentItem],
        status: SnapshotStatus,
        duration_left: i64,
    ) -> Self {
        let by_id: HashMap<ItemId, &ContentItem> = items.iter().map(|item| (item.id, item)).collect();
        let questions = session
            .content_item_ids
            .iter()
            .filter_map(|id| by_id.get(id))
            .enumerate()
            .map(|(i, item)| {
                let mut view = QuestionView::from_item(item, i + 1);
                view.user_answer = session.answers.get(&item.id).cloned();
                view
            })
            .collect();

        Self {
            session_id: session.id.clone(),
            status,
            start_time: session.start_time,
            duration_left,
            questions,
            user_answers: session.answers.clone(),
            degraded: session.degraded,
        }
    }

    /// Replaces the answer map, keeping per-question answers in step.
    pub fn set_answers(&mut self, answers: BTreeMap<ItemId, String>) {
        for question in &mut self.questions {
            question.user_answer = answers.get(&question.id).cloned();
        }
        self.user_answers = answers;
    }

    pub fn resumed(mut self, duration_left: i64) -> Self {
        self.status = SnapshotStatus::Resumed;
        self.duration_left = duration_left;
        self
    }
}

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub type ItemId = i64;
pub type TopicId = i64;
pub type SubjectId = i64;

pub const DEFAULT_BASE_WEIGHT: f64 = 1.0;

/// Provenance partition of the question catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Pool {
    PastExam,
    Exercise,
    AiGenerated,
    LowSalience,
}

impl Pool {
    pub const fn as_str(self) -> &'static str {
        match self {
            Pool::PastExam => "past-exam",
            Pool::Exercise => "exercise",
            Pool::AiGenerated => "ai-generated",
            Pool::LowSalience => "low-salience",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "past-exam" | "past_paper" => Some(Pool::PastExam),
            "exercise" => Some(Pool::Exercise),
            "ai-generated" | "ai_generated" => Some(Pool::AiGenerated),
            "low-salience" | "low_salience" => Some(Pool::LowSalience),
            _ => None,
        }
    }

    pub const fn is_seed_source(self) -> bool {
        matches!(self, Pool::PastExam | Pool::Exercise)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub id: TopicId,
    pub subject_id: SubjectId,
    pub name: String,
    pub base_weight: f64,
    /// General, rare or out-of-syllabus knowledge points.
    pub low_salience: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionPayload {
    pub content: String,
    pub options: serde_json::Value,
    pub answer: String,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    pub id: ItemId,
    pub topic_id: Option<TopicId>,
    pub pool: Pool,
    pub source_detail: Option<String>,
    pub payload: QuestionPayload,
}

/// A content item that has not been assigned an id by the store yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewContentItem {
    pub subject_id: SubjectId,
    pub topic_id: Option<TopicId>,
    pub pool: Pool,
    pub source_detail: Option<String>,
    pub payload: QuestionPayload,
}

/// Read-only view of one subject's topics and items for a single assembly pass.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    subject_id: SubjectId,
    topics: HashMap<TopicId, Topic>,
    items: Vec<ContentItem>,
    index: HashMap<ItemId, usize>,
}

impl Catalog {
    pub fn new(subject_id: SubjectId, topics: Vec<Topic>, items: Vec<ContentItem>) -> Self {
        let mut catalog = Self {
            subject_id,
            topics: topics.into_iter().map(|t| (t.id, t)).collect(),
            items: Vec::with_capacity(items.len()),
            index: HashMap::with_capacity(items.len()),
        };
        catalog.extend(items);
        catalog
    }

    pub fn subject_id(&self) -> SubjectId {
        self.subject_id
    }

    pub fn topics(&self) -> impl Iterator<Item = &Topic> {
        self.topics.values()
    }

    pub fn topic(&self, id: TopicId) -> Option<&Topic> {
        self.topics.get(&id)
    }

    pub fn items(&self) -> &[ContentItem] {
        &self.items
    }

    pub fn item(&self, id: ItemId) -> Option<&ContentItem> {
        self.index.get(&id).map(|&idx| &self.items[idx])
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn pool(&self, pool: Pool) -> impl Iterator<Item = &ContentItem> {
        self.items.iter().filter(move |item| item.pool == pool)
    }

    /// Items tagged low-salience plus items whose topic is low-salience,
    /// whatever pool they were ingested into.
    pub fn low_salience_pool(&self) -> impl Iterator<Item = &ContentItem> {
        self.items.iter().filter(move |item| {
            item.pool == Pool::LowSalience
                || item
                    .topic_id
                    .and_then(|id| self.topics.get(&id))
                    .is_some_and(|topic| topic.low_salience)
        })
    }

    /// Appends items, ignoring ids already present.
    pub fn extend(&mut self, items: impl IntoIterator<Item = ContentItem>) {
        for item in items {
            if self.index.contains_key(&item.id) {
                continue;
            }
            self.index.insert(item.id, self.items.len());
            self.items.push(item);
        }
    }
}

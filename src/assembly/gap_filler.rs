use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::assembly::types::{
    Catalog, ContentItem, ItemId, NewContentItem, Pool, QuestionPayload, TopicId,
};
use crate::db::models::{GenerationLog, GenerationStatus};
use crate::db::store::ExamStore;

pub const GAP_FILL_CALL_TYPE: &str = "exam_gap_fill";
const MIN_CONTENT_CHARS: usize = 5;
const PLACEHOLDER_MARKER: &str = "xxx";
const MIN_OPTIONS: usize = 2;
const DEFAULT_EXPLANATION: &str = "AI Generated";

/// One seed question sent to the generation provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationSeed {
    pub id: ItemId,
    pub content: String,
    pub options: Value,
    pub answer: String,
    pub explanation: String,
    pub topic: String,
    pub topic_id: TopicId,
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Produces variant questions for a batch of seeds in one round trip.
///
/// Responses are untrusted: each element is validated field by field before
/// it becomes a content item.
#[async_trait]
pub trait QuestionGenerator: Send + Sync {
    async fn generate_variants(&self, seeds: &[GenerationSeed]) -> Result<Vec<Value>, GenerationError>;
}

/// A generated candidate that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidCandidate {
    pub based_on_id: ItemId,
    pub topic_id: TopicId,
    pub payload: QuestionPayload,
}

/// Chooses one seed per target topic that has no ai-generated item yet.
pub fn collect_seeds(catalog: &Catalog, targets: &[TopicId]) -> Vec<GenerationSeed> {
    let covered: HashSet<TopicId> = catalog
        .pool(Pool::AiGenerated)
        .filter_map(|item| item.topic_id)
        .collect();

    let mut seeds = Vec::new();
    for topic_id in targets {
        if covered.contains(topic_id) {
            tracing::debug!(topic_id, "ai-generated content already present, skipping");
            continue;
        }

        let seed = catalog
            .items()
            .iter()
            .filter(|item| item.pool.is_seed_source() && item.topic_id == Some(*topic_id))
            .min_by_key(|item| item.id);

        if let Some(item) = seed {
            let topic = catalog
                .topic(*topic_id)
                .map(|t| t.name.clone())
                .unwrap_or_else(|| "Unknown".to_string());
            seeds.push(GenerationSeed {
                id: item.id,
                content: item.payload.content.clone(),
                options: item.payload.options.clone(),
                answer: item.payload.answer.clone(),
                explanation: item.payload.explanation.clone(),
                topic,
                topic_id: *topic_id,
            });
        }
    }
    seeds
}

/// Validates one raw provider element against the seeds of its batch.
pub fn validate_candidate(raw: &Value, seed_topics: &HashMap<ItemId, TopicId>) -> Option<ValidCandidate> {
    let content = raw.get("content").and_then(Value::as_str)?.trim();
    if content.chars().count() < MIN_CONTENT_CHARS
        || content.to_lowercase().contains(PLACEHOLDER_MARKER)
    {
        return None;
    }

    let options = match raw.get("options")? {
        Value::String(text) => serde_json::from_str::<Value>(text).ok()?,
        other => other.clone(),
    };
    if options.as_array().map_or(true, |opts| opts.len() < MIN_OPTIONS) {
        return None;
    }

    let answer = raw.get("answer").and_then(Value::as_str)?.trim();
    if answer.is_empty() {
        return None;
    }

    let based_on_id = match raw.get("based_on_id")? {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    let topic_id = *seed_topics.get(&based_on_id)?;

    let explanation = raw
        .get("explanation")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_EXPLANATION);

    Some(ValidCandidate {
        based_on_id,
        topic_id,
        payload: QuestionPayload {
            content: content.to_string(),
            options,
            answer: answer.to_string(),
            explanation: explanation.to_string(),
        },
    })
}

/// Tops up the ai-generated pool for weak topics before the final allocation.
///
/// Every failure is absorbed: the pass continues with whatever ai-generated
/// items already exist.
#[derive(Clone)]
pub struct ContentGapFiller {
    generator: Arc<dyn QuestionGenerator>,
    store: Arc<dyn ExamStore>,
    timeout: Duration,
}

impl ContentGapFiller {
    pub fn new(generator: Arc<dyn QuestionGenerator>, store: Arc<dyn ExamStore>, timeout: Duration) -> Self {
        Self {
            generator,
            store,
            timeout,
        }
    }

    /// Returns the newly persisted ai-generated items (possibly empty).
    pub async fn fill(&self, catalog: &Catalog, targets: &[TopicId]) -> Vec<ContentItem> {
        let seeds = collect_seeds(catalog, targets);
        if seeds.is_empty() {
            return Vec::new();
        }

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.generator.generate_variants(&seeds))
            .await
            .unwrap_or(Err(GenerationError::Timeout(self.timeout)));
        let latency_ms = started.elapsed().as_millis() as i64;

        let raw = match outcome {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(seeds = seeds.len(), latency_ms, error = %err, "question generation failed");
                self.record(GenerationLog::new(
                    GAP_FILL_CALL_TYPE,
                    GenerationStatus::Failure,
                    latency_ms,
                    0,
                    Some(err.to_string()),
                ))
                .await;
                return Vec::new();
            }
        };

        let seed_topics: HashMap<ItemId, TopicId> = seeds.iter().map(|s| (s.id, s.topic_id)).collect();
        let new_items: Vec<NewContentItem> = raw
            .iter()
            .filter_map(|value| validate_candidate(value, &seed_topics))
            .map(|candidate| NewContentItem {
                subject_id: catalog.subject_id(),
                topic_id: Some(candidate.topic_id),
                pool: Pool::AiGenerated,
                source_detail: Some(format!("Error-Driven Variant of {}", candidate.based_on_id)),
                payload: candidate.payload,
            })
            .collect();

        tracing::info!(
            seeds = seeds.len(),
            returned = raw.len(),
            accepted = new_items.len(),
            latency_ms,
            "question generation finished"
        );

        let persisted = if new_items.is_empty() {
            Ok(Vec::new())
        } else {
            self.store.insert_content_items(&new_items).await
        };

        match persisted {
            Ok(items) => {
                self.record(GenerationLog::new(
                    GAP_FILL_CALL_TYPE,
                    GenerationStatus::Success,
                    latency_ms,
                    items.len() as i32,
                    None,
                ))
                .await;
                items
            }
            Err(err) => {
                tracing::warn!(error = %err, "persisting generated questions failed");
                self.record(GenerationLog::new(
                    GAP_FILL_CALL_TYPE,
                    GenerationStatus::Failure,
                    latency_ms,
                    0,
                    Some(err.to_string()),
                ))
                .await;
                Vec::new()
            }
        }
    }

    async fn record(&self, log: GenerationLog) {
        if let Err(err) = self.store.record_generation(&log).await {
            tracing::debug!(error = %err, "generation log not recorded");
        }
    }
}

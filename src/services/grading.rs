use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::assembly::types::{ContentItem, ItemId, TopicId};
use crate::db::models::{ExamSession, SessionReport, TopicBreakdown};

/// One point per item whose stored answer equals the canonical answer
/// exactly. Items missing from `items` are not graded.
pub fn grade_session(session: &ExamSession, items: &[ContentItem], end_time: DateTime<Utc>) -> SessionReport {
    let by_id: HashMap<ItemId, &ContentItem> = items.iter().map(|item| (item.id, item)).collect();
    let mut topics: BTreeMap<TopicId, TopicBreakdown> = BTreeMap::new();
    let mut score = 0;
    let mut total = 0;

    for id in &session.content_item_ids {
        let Some(item) = by_id.get(id) else {
            continue;
        };
        total += 1;
        let correct = session
            .answers
            .get(id)
            .is_some_and(|answer| *answer == item.payload.answer);
        if correct {
            score += 1;
        }

        if let Some(topic_id) = item.topic_id {
            let entry = topics.entry(topic_id).or_insert(TopicBreakdown {
                topic_id,
                total: 0,
                correct: 0,
            });
            entry.total += 1;
            if correct {
                entry.correct += 1;
            }
        }
    }

    let accuracy = if total > 0 { score * 100 / total } else { 0 };
    let duration_minutes = (end_time - session.start_time).num_minutes().max(0);

    SessionReport {
        score,
        total,
        accuracy,
        duration_minutes,
        topics: topics.into_values().collect(),
    }
}

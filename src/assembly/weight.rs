use std::collections::{BTreeMap, HashMap};

use crate::assembly::types::{Catalog, ItemId, Topic, TopicId, DEFAULT_BASE_WEIGHT};

pub const ERROR_RATE_FACTOR: f64 = 2.0;

/// `base * (1 + 2 * error_rate)`; non-positive bases fall back to 1 so the
/// result is always positive.
pub fn topic_weight(base_weight: f64, error_rate: f64) -> f64 {
    let base = if base_weight.is_finite() && base_weight > 0.0 {
        base_weight
    } else {
        DEFAULT_BASE_WEIGHT
    };
    let rate = if error_rate.is_finite() {
        error_rate.clamp(0.0, 1.0)
    } else {
        0.0
    };
    base * (1.0 + ERROR_RATE_FACTOR * rate)
}

/// Per-topic selection weights for one learner.
#[derive(Debug, Clone, Default)]
pub struct WeightTable {
    weights: HashMap<TopicId, f64>,
}

impl WeightTable {
    pub fn new<'a>(
        topics: impl IntoIterator<Item = &'a Topic>,
        error_rates: &HashMap<TopicId, f64>,
    ) -> Self {
        let weights = topics
            .into_iter()
            .map(|topic| {
                let rate = error_rates.get(&topic.id).copied().unwrap_or(0.0);
                (topic.id, topic_weight(topic.base_weight, rate))
            })
            .collect();
        Self { weights }
    }

    /// Unlinked items and unknown topics weigh 1.
    pub fn weight_of(&self, topic_id: Option<TopicId>) -> f64 {
        topic_id
            .and_then(|id| self.weights.get(&id).copied())
            .unwrap_or(DEFAULT_BASE_WEIGHT)
    }
}

/// Item ids and stored answers of one submitted session.
#[derive(Debug, Clone, Copy)]
pub struct AnswerSheet<'a> {
    pub item_ids: &'a [ItemId],
    pub answers: &'a BTreeMap<ItemId, String>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    attempts: u32,
    wrong: u32,
}

/// Error rate per topic (`wrong / attempts`) over the given sheets.
///
/// Sheets without any answer are skipped; inside a sheet an unanswered item
/// counts as wrong. Items no longer in the catalog, or without a topic, are
/// ignored.
pub fn tally_error_rates<'a>(
    sheets: impl IntoIterator<Item = AnswerSheet<'a>>,
    catalog: &Catalog,
) -> HashMap<TopicId, f64> {
    let mut tallies: HashMap<TopicId, Tally> = HashMap::new();

    for sheet in sheets {
        if sheet.answers.is_empty() {
            continue;
        }

        for item_id in sheet.item_ids {
            let Some(item) = catalog.item(*item_id) else {
                continue;
            };
            let Some(topic_id) = item.topic_id else {
                continue;
            };

            let tally = tallies.entry(topic_id).or_default();
            tally.attempts += 1;
            if sheet.answers.get(item_id).map(String::as_str) != Some(item.payload.answer.as_str()) {
                tally.wrong += 1;
            }
        }
    }

    tallies
        .into_iter()
        .filter(|(_, t)| t.attempts > 0)
        .map(|(topic_id, t)| (topic_id, f64::from(t.wrong) / f64::from(t.attempts)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::types::{ContentItem, Pool, QuestionPayload};

    fn topic(id: TopicId, base_weight: f64) -> Topic {
        Topic {
            id,
            subject_id: 1,
            name: format!("t{id}"),
            base_weight,
            low_salience: false,
        }
    }

    fn item(id: ItemId, topic_id: TopicId, answer: &str) -> ContentItem {
        ContentItem {
            id,
            topic_id: Some(topic_id),
            pool: Pool::Exercise,
            source_detail: None,
            payload: QuestionPayload {
                content: format!("q{id}"),
                options: serde_json::json!(["A", "B"]),
                answer: answer.to_string(),
                explanation: String::new(),
            },
        }
    }

    #[test]
    fn test_weight_formula() {
        assert!((topic_weight(10.0, 0.5) - 20.0).abs() < 1e-9);
        assert!((topic_weight(1.0, 0.0) - 1.0).abs() < 1e-9);
        assert!((topic_weight(3.0, 1.0) - 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_weight_non_positive_base_defaults_to_one() {
        assert!((topic_weight(0.0, 0.0) - 1.0).abs() < 1e-9);
        assert!((topic_weight(-4.0, 0.5) - 2.0).abs() < 1e-9);
        assert!(topic_weight(f64::NAN, f64::NAN) > 0.0);
    }

    #[test]
    fn test_weight_table_defaults() {
        let rates = HashMap::from([(1, 0.5)]);
        let topics = [topic(1, 10.0), topic(2, 1.0)];
        let table = WeightTable::new(topics.iter(), &rates);

        assert!((table.weight_of(Some(1)) - 20.0).abs() < 1e-9);
        assert!((table.weight_of(Some(2)) - 1.0).abs() < 1e-9);
        assert!((table.weight_of(Some(99)) - 1.0).abs() < 1e-9);
        assert!((table.weight_of(None) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_tally_counts_wrong_and_missing_answers() {
        let catalog = Catalog::new(
            1,
            vec![topic(1, 1.0), topic(2, 1.0)],
            vec![item(10, 1, "A"), item(11, 1, "B"), item(12, 2, "C")],
        );
        let ids = vec![10, 11, 12];
        let answers = BTreeMap::from([(10, "A".to_string()), (11, "C".to_string())]);

        let rates = tally_error_rates([AnswerSheet { item_ids: &ids, answers: &answers }], &catalog);

        assert!((rates[&1] - 0.5).abs() < 1e-9);
        assert!((rates[&2] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_tally_skips_unanswered_sheets() {
        let catalog = Catalog::new(1, vec![topic(1, 1.0)], vec![item(10, 1, "A")]);
        let ids = vec![10];
        let empty = BTreeMap::new();

        let rates = tally_error_rates([AnswerSheet { item_ids: &ids, answers: &empty }], &catalog);
        assert!(rates.is_empty());
    }
}

use std::collections::{HashMap, HashSet};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;

use crate::assembly::gap_filler::ContentGapFiller;
use crate::assembly::sampler::{uniform_sample, weighted_sample, Candidate};
use crate::assembly::types::{Catalog, ItemId, Pool, TopicId};
use crate::assembly::weight::WeightTable;

/// Slot quotas for one exam.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationPlan {
    pub target: usize,
    pub low_salience: usize,
    pub past_exam: usize,
    pub exercise: usize,
}

impl Default for AllocationPlan {
    fn default() -> Self {
        Self {
            target: 75,
            low_salience: 5,
            past_exam: 22,
            exercise: 45,
        }
    }
}

/// How weak topics are chosen for content generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeakTopicPolicy {
    pub threshold: f64,
    pub limit: usize,
}

impl Default for WeakTopicPolicy {
    fn default() -> Self {
        Self {
            threshold: 0.4,
            limit: 3,
        }
    }
}

/// Learner-specific inputs of an assembly pass.
#[derive(Debug, Clone, Default)]
pub struct LearnerSignals {
    pub error_rates: HashMap<TopicId, f64>,
    pub history: HashSet<ItemId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolBreakdown {
    pub low_salience: usize,
    pub past_exam: usize,
    pub exercise: usize,
    pub ai_generated: usize,
    pub backfill: usize,
    pub generated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub item_ids: Vec<ItemId>,
    pub shortfall: usize,
    pub breakdown: PoolBreakdown,
}

impl Allocation {
    /// The catalog could not supply the full target.
    pub fn is_degraded(&self) -> bool {
        self.shortfall > 0
    }
}

/// Up to `policy.limit` topics with error rate at or above the threshold,
/// worst first; without any, the highest base-weight topics instead.
pub fn weak_topics(
    catalog: &Catalog,
    error_rates: &HashMap<TopicId, f64>,
    policy: WeakTopicPolicy,
) -> Vec<TopicId> {
    let mut ranked: Vec<(TopicId, f64)> = error_rates
        .iter()
        .filter(|(_, rate)| **rate >= policy.threshold)
        .map(|(id, rate)| (*id, *rate))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    if !ranked.is_empty() {
        return ranked.into_iter().take(policy.limit).map(|(id, _)| id).collect();
    }

    let mut by_weight: Vec<(TopicId, f64)> = catalog.topics().map(|t| (t.id, t.base_weight)).collect();
    by_weight.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    by_weight.into_iter().take(policy.limit).map(|(id, _)| id).collect()
}

/// Fills the exam target from the content pools in a fixed order:
/// low-salience (uniform), past-exam, exercise, ai-generated (weighted),
/// then uniform backfill from the whole catalog.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolAllocator {
    plan: AllocationPlan,
    weak_topics: WeakTopicPolicy,
}

struct Selection {
    target: usize,
    ids: Vec<ItemId>,
    picked: HashSet<ItemId>,
}

impl Selection {
    fn new(target: usize) -> Self {
        Self {
            target,
            ids: Vec::with_capacity(target),
            picked: HashSet::with_capacity(target),
        }
    }

    fn remaining(&self) -> usize {
        self.target.saturating_sub(self.ids.len())
    }

    fn extend(&mut self, ids: Vec<ItemId>) -> usize {
        let mut added = 0;
        for id in ids {
            if self.ids.len() >= self.target {
                break;
            }
            if self.picked.insert(id) {
                self.ids.push(id);
                added += 1;
            }
        }
        added
    }
}

impl PoolAllocator {
    pub fn new(plan: AllocationPlan, weak_topics: WeakTopicPolicy) -> Self {
        Self { plan, weak_topics }
    }

    pub fn plan(&self) -> AllocationPlan {
        self.plan
    }

    /// Runs one assembly pass. New ai-generated items produced by the gap
    /// filler are added to `catalog` before the ai-generated pool is sampled.
    pub async fn allocate<R: Rng + Send>(
        &self,
        catalog: &mut Catalog,
        signals: &LearnerSignals,
        gap_filler: Option<&ContentGapFiller>,
        rng: &mut R,
    ) -> Allocation {
        let mut selection = Selection::new(self.plan.target);
        let mut breakdown = PoolBreakdown::default();

        let low: Vec<ItemId> = catalog.low_salience_pool().map(|item| item.id).collect();
        let quota = self.plan.low_salience.min(selection.remaining());
        breakdown.low_salience = selection.extend(uniform_sample(&low, &signals.history, quota, rng));

        let weights = WeightTable::new(catalog.topics(), &signals.error_rates);

        let past = pool_candidates(catalog, Pool::PastExam, &selection.picked, &weights);
        let quota = self.plan.past_exam.min(selection.remaining());
        breakdown.past_exam = selection.extend(weighted_sample(&past, &signals.history, quota, rng));

        let exercise = pool_candidates(catalog, Pool::Exercise, &selection.picked, &weights);
        let quota = self.plan.exercise.min(selection.remaining());
        breakdown.exercise = selection.extend(weighted_sample(&exercise, &signals.history, quota, rng));

        if let Some(filler) = gap_filler {
            let targets = weak_topics(catalog, &signals.error_rates, self.weak_topics);
            let generated = filler.fill(catalog, &targets).await;
            breakdown.generated = generated.len();
            catalog.extend(generated);
        }

        let ai = pool_candidates(catalog, Pool::AiGenerated, &selection.picked, &weights);
        let quota = selection.remaining();
        breakdown.ai_generated = selection.extend(weighted_sample(&ai, &signals.history, quota, rng));

        if selection.remaining() > 0 {
            let rest: Vec<ItemId> = catalog
                .items()
                .iter()
                .map(|item| item.id)
                .filter(|id| !selection.picked.contains(id))
                .collect();
            let quota = selection.remaining();
            breakdown.backfill = selection.extend(uniform_sample(&rest, &HashSet::new(), quota, rng));
            tracing::debug!(backfilled = breakdown.backfill, "backfilled from whole catalog");
        }

        let shortfall = selection.remaining();
        let mut item_ids = selection.ids;
        item_ids.shuffle(rng);

        Allocation {
            item_ids,
            shortfall,
            breakdown,
        }
    }
}

fn pool_candidates(
    catalog: &Catalog,
    pool: Pool,
    picked: &HashSet<ItemId>,
    weights: &WeightTable,
) -> Vec<Candidate> {
    catalog
        .pool(pool)
        .filter(|item| !picked.contains(&item.id))
        .map(|item| Candidate::new(item.id, weights.weight_of(item.topic_id)))
        .collect()
}

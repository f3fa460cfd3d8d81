use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::assembly::types::ItemId;
use crate::cache::{keys, ExamCache};

pub const DEFAULT_HISTORY_CAPACITY: usize = 200;
pub const DEFAULT_HISTORY_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Most-recent-first list of item ids a learner has been served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearnerHistory {
    ids: VecDeque<ItemId>,
    capacity: usize,
}

impl LearnerHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            ids: VecDeque::new(),
            capacity,
        }
    }

    /// Builds a history from a newest-first listing, trimmed to capacity.
    pub fn from_recent(ids: impl IntoIterator<Item = ItemId>, capacity: usize) -> Self {
        let mut ids: VecDeque<ItemId> = ids.into_iter().collect();
        ids.truncate(capacity);
        Self { ids, capacity }
    }

    /// Pushes each id to the front in order, like a list LPUSH, then trims.
    pub fn push_recent(&mut self, ids: &[ItemId]) {
        for id in ids {
            self.ids.push_front(*id);
        }
        self.ids.truncate(self.capacity);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ItemId> {
        self.ids.iter()
    }

    pub fn to_exclusion_set(&self) -> HashSet<ItemId> {
        self.ids.iter().copied().collect()
    }
}

impl Default for LearnerHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

/// Reads and appends learner histories through the fast cache.
///
/// History is advisory: read failures yield an empty history and write
/// failures are logged and dropped.
#[derive(Clone)]
pub struct HistoryTracker {
    cache: Arc<dyn ExamCache>,
    capacity: usize,
    ttl: Duration,
}

impl HistoryTracker {
    pub fn new(cache: Arc<dyn ExamCache>, capacity: usize, ttl: Duration) -> Self {
        Self {
            cache,
            capacity,
            ttl,
        }
    }

    pub async fn recent(&self, fingerprint: &str) -> LearnerHistory {
        let key = keys::learner_history_key(fingerprint);
        match self.cache.history(&key).await {
            Ok(ids) => LearnerHistory::from_recent(ids, self.capacity),
            Err(err) => {
                tracing::warn!(fingerprint, error = %err, "history read failed, assembling without exclusion");
                LearnerHistory::new(self.capacity)
            }
        }
    }

    pub async fn record(&self, fingerprint: &str, ids: &[ItemId]) {
        if ids.is_empty() {
            return;
        }
        let key = keys::learner_history_key(fingerprint);
        if let Err(err) = self
            .cache
            .push_history(&key, ids, self.capacity, self.ttl)
            .await
        {
            tracing::warn!(fingerprint, error = %err, "history update failed");
        }
    }
}

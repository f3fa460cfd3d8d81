use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::assembly::types::ItemId;
use crate::cache::{CacheError, ExamCache, SessionSnapshot};
use crate::clock::{Clock, SystemClock};

struct Expiring<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    snapshots: HashMap<String, Expiring<SessionSnapshot>>,
    locks: HashMap<String, Expiring<String>>,
    histories: HashMap<String, Expiring<VecDeque<ItemId>>>,
}

/// Process-local cache used when Redis is not configured or unreachable.
pub struct MemoryCache {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Makes every call fail with [`CacheError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn is_locked(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.inner
            .lock()
            .locks
            .get(key)
            .is_some_and(|lock| lock.expires_at > now)
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("memory cache disabled".to_string()));
        }
        Ok(())
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        self.clock.now() + chrono::Duration::milliseconds(ttl.as_millis() as i64)
    }
}

impl Inner {
    /// Drops every expired entry; run on writes so keys that are never read
    /// again do not pile up.
    fn sweep(&mut self, now: DateTime<Utc>) {
        self.snapshots.retain(|_, entry| entry.expires_at > now);
        self.locks.retain(|_, entry| entry.expires_at > now);
        self.histories.retain(|_, entry| entry.expires_at > now);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.snapshots.len() + self.locks.len() + self.histories.len()
    }
}

fn live<'a, T>(map: &'a mut HashMap<String, Expiring<T>>, key: &str, now: DateTime<Utc>) -> Option<&'a mut T> {
    if map.get(key).is_some_and(|entry| entry.expires_at <= now) {
        map.remove(key);
    }
    map.get_mut(key).map(|entry| &mut entry.value)
}

#[async_trait]
impl ExamCache for MemoryCache {
    async fn get_snapshot(&self, key: &str) -> Result<Option<SessionSnapshot>, CacheError> {
        self.check()?;
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        Ok(live(&mut inner.snapshots, key, now).map(|s| s.clone()))
    }

    async fn put_snapshot(&self, key: &str, snapshot: &SessionSnapshot, ttl: Duration) -> Result<(), CacheError> {
        self.check()?;
        let expires_at = self.expiry(ttl);
        let mut inner = self.inner.lock();
        inner.sweep(self.clock.now());
        inner.snapshots.insert(
            key.to_string(),
            Expiring {
                value: snapshot.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete_snapshot(&self, key: &str) -> Result<(), CacheError> {
        self.check()?;
        self.inner.lock().snapshots.remove(key);
        Ok(())
    }

    async fn try_acquire_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.check()?;
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut inner = self.inner.lock();
        inner.sweep(now);
        if live(&mut inner.locks, key, now).is_some() {
            return Ok(false);
        }
        inner.locks.insert(
            key.to_string(),
            Expiring {
                value: token.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool, CacheError> {
        self.check()?;
        let mut inner = self.inner.lock();
        if inner.locks.get(key).is_some_and(|lock| lock.value == token) {
            inner.locks.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn history(&self, key: &str) -> Result<Vec<ItemId>, CacheError> {
        self.check()?;
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        Ok(live(&mut inner.histories, key, now)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn push_history(
        &self,
        key: &str,
        ids: &[ItemId],
        capacity: usize,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.check()?;
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut inner = self.inner.lock();
        inner.sweep(now);
        let mut list = live(&mut inner.histories, key, now)
            .map(std::mem::take)
            .unwrap_or_default();
        for id in ids {
            list.push_front(*id);
        }
        list.truncate(capacity.max(1));
        inner.histories.insert(
            key.to_string(),
            Expiring {
                value: list,
                expires_at,
            },
        );
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.check()
    }
}

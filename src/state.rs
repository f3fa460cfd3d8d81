use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::cache::{ExamCache, MemoryCache, RedisCache};
use crate::config::ExamConfig;
use crate::db::config::redis_url_from_env;
use crate::db::{DatabaseProxy, ExamStore, MemoryExamStore};
use crate::services::question_generator::LlmQuestionGenerator;
use crate::services::{ExamContext, SessionManager};

#[derive(Clone)]
pub struct AppState {
    started_at: Instant,
    started_at_system: SystemTime,
    sessions: Arc<SessionManager>,
    db_proxy: Option<Arc<DatabaseProxy>>,
}

impl AppState {
    pub fn new(sessions: Arc<SessionManager>, db_proxy: Option<Arc<DatabaseProxy>>) -> Self {
        Self {
            started_at: Instant::now(),
            started_at_system: SystemTime::now(),
            sessions,
            db_proxy,
        }
    }

    /// Wires Postgres/Redis/LLM from the environment; each missing or
    /// unreachable backend falls back to its in-process counterpart.
    pub async fn from_env() -> Self {
        let db_proxy = match DatabaseProxy::from_env().await {
            Ok(proxy) => Some(proxy),
            Err(err) => {
                tracing::warn!(error = %err, "database proxy not initialized, using in-memory store");
                None
            }
        };
        let store: Arc<dyn ExamStore> = match &db_proxy {
            Some(proxy) => Arc::clone(proxy) as Arc<dyn ExamStore>,
            None => Arc::new(MemoryExamStore::new()),
        };

        let cache: Arc<dyn ExamCache> = match redis_url_from_env() {
            Some(url) => match RedisCache::connect(&url).await {
                Ok(cache) => Arc::new(cache),
                Err(err) => {
                    tracing::warn!(error = %err, "redis unreachable, using in-process cache");
                    Arc::new(MemoryCache::new())
                }
            },
            None => Arc::new(MemoryCache::new()),
        };

        let mut ctx = ExamContext::new(store, cache, ExamConfig::from_env());
        match LlmQuestionGenerator::from_env() {
            Some(generator) => ctx = ctx.with_generator(Arc::new(generator)),
            None => tracing::info!("LLM_API_KEY not set, content gap filling disabled"),
        }

        Self::new(Arc::new(SessionManager::new(ctx)), db_proxy)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn started_at_system(&self) -> SystemTime {
        self.started_at_system
    }

    pub fn sessions(&self) -> Arc<SessionManager> {
        Arc::clone(&self.sessions)
    }

    pub fn db_proxy(&self) -> Option<Arc<DatabaseProxy>> {
        self.db_proxy.clone()
    }
}

pub mod config;
pub mod memory;
pub mod migrate;
pub mod models;
pub mod operations;
pub mod store;

mod health_monitor;

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::db::config::{DbConfig, DbConfigError};
use crate::db::health_monitor::{HealthTracker, ProbeOutcome};
use crate::db::migrate::{run_migrations, MigrationError};

pub use health_monitor::HealthCheckSnapshot;
pub use memory::MemoryExamStore;
pub use store::{ExamStore, SaveOutcome, StoreError};

/// Postgres-backed store with a background health probe.
#[derive(Clone)]
pub struct DatabaseProxy {
    config: DbConfig,
    pool: PgPool,
    health: Arc<RwLock<HealthTracker>>,
}

impl DatabaseProxy {
    pub async fn from_env() -> Result<Arc<Self>, DbInitError> {
        let config = DbConfig::from_env()?;
        Self::connect(config).await
    }

    pub async fn connect(config: DbConfig) -> Result<Arc<Self>, DbInitError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(&config.primary_url)
            .await
            .map_err(DbInitError::Sqlx)?;

        run_migrations(&pool).await?;

        let proxy = Arc::new(Self {
            health: Arc::new(RwLock::new(HealthTracker::new(config.health_check.failure_threshold))),
            config,
            pool,
        });

        proxy.start_health_monitor();

        Ok(proxy)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_status(&self) -> HealthCheckSnapshot {
        let tracker = self.health.read().await;
        tracker.snapshot()
    }
}

impl DatabaseProxy {
    fn start_health_monitor(self: &Arc<Self>) {
        let proxy = Arc::clone(self);
        tokio::spawn(async move {
            proxy.health_monitor_loop().await;
        });
    }

    async fn health_monitor_loop(self: Arc<Self>) {
        let interval = self.config.health_check.interval;

        loop {
            let start = tokio::time::Instant::now();
            let outcome = self.check_health().await;
            if let ProbeOutcome::Failed(err) = &outcome {
                tracing::warn!(error = %err, "primary database health probe failed");
            }
            self.health.write().await.record(outcome, chrono::Utc::now());

            let elapsed = start.elapsed();
            if elapsed < interval {
                tokio::time::sleep(interval - elapsed).await;
            }
        }
    }

    async fn check_health(&self) -> ProbeOutcome {
        let timeout = self.config.health_check.timeout;
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(timeout, sqlx::query("SELECT 1").execute(&self.pool)).await;

        match result {
            Ok(Ok(_)) => ProbeOutcome::Ok(started.elapsed()),
            Ok(Err(err)) => ProbeOutcome::Failed(err.to_string()),
            Err(_) => ProbeOutcome::Failed("timeout".to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum DbInitError {
    #[error(transparent)]
    Config(#[from] DbConfigError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::assembly::{AllocationPlan, WeakTopicPolicy};

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(3000);

        let host = std::env::var("HOST")
            .ok()
            .and_then(|value| value.parse::<IpAddr>().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));

        let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        Self {
            host,
            port,
            log_level,
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Tunables of exam assembly and the session lifecycle.
#[derive(Debug, Clone)]
pub struct ExamConfig {
    pub plan: AllocationPlan,
    pub weak_topics: WeakTopicPolicy,
    pub session_ttl: Duration,
    pub cache_ttl: Duration,
    pub lock_ttl: Duration,
    pub lock_poll_interval: Duration,
    pub lock_poll_attempts: u32,
    pub history_capacity: usize,
    pub history_ttl: Duration,
    pub error_rate_window: usize,
    pub generation_timeout: Duration,
}

impl Default for ExamConfig {
    fn default() -> Self {
        Self {
            plan: AllocationPlan::default(),
            weak_topics: WeakTopicPolicy::default(),
            session_ttl: Duration::from_secs(9000),
            cache_ttl: Duration::from_secs(1800),
            lock_ttl: Duration::from_secs(30),
            lock_poll_interval: Duration::from_millis(500),
            lock_poll_attempts: 10,
            history_capacity: 200,
            history_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            error_rate_window: 20,
            generation_timeout: Duration::from_secs(60),
        }
    }
}

impl ExamConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let plan = AllocationPlan {
            target: env_usize("EXAM_TARGET_COUNT", defaults.plan.target),
            low_salience: env_usize("EXAM_LOW_SALIENCE_COUNT", defaults.plan.low_salience),
            past_exam: env_usize("EXAM_PAST_EXAM_COUNT", defaults.plan.past_exam),
            exercise: env_usize("EXAM_EXERCISE_COUNT", defaults.plan.exercise),
        };
        let weak_topics = WeakTopicPolicy {
            threshold: env_f64("EXAM_WEAK_TOPIC_THRESHOLD", defaults.weak_topics.threshold),
            limit: env_usize("EXAM_WEAK_TOPIC_LIMIT", defaults.weak_topics.limit),
        };

        Self {
            plan,
            weak_topics,
            session_ttl: Duration::from_secs(env_u64("EXAM_SESSION_TTL_SECS", 9000)),
            cache_ttl: Duration::from_secs(env_u64("EXAM_CACHE_TTL_SECS", 1800)),
            lock_ttl: Duration::from_secs(env_u64("EXAM_LOCK_TTL_SECS", 30)),
            lock_poll_interval: Duration::from_millis(env_u64("EXAM_LOCK_POLL_INTERVAL_MS", 500).max(1)),
            lock_poll_attempts: env_u64("EXAM_LOCK_POLL_ATTEMPTS", 10) as u32,
            history_capacity: env_usize("EXAM_HISTORY_CAPACITY", defaults.history_capacity),
            history_ttl: Duration::from_secs(env_u64("EXAM_HISTORY_TTL_DAYS", 30) * 24 * 60 * 60),
            error_rate_window: env_usize("EXAM_ERROR_RATE_WINDOW", defaults.error_rate_window),
            generation_timeout: Duration::from_secs(env_u64("EXAM_GENERATION_TIMEOUT_SECS", 60)),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
}

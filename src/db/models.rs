use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::assembly::types::{ItemId, SubjectId, TopicId};

/// Request-side client metadata. Logged and stored, never used for assembly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMeta {
    pub ip: Option<String>,
    pub device: String,
    pub location: String,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCounters {
    pub pdf_download_count: i32,
    pub share_count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicBreakdown {
    pub topic_id: TopicId,
    pub total: i32,
    pub correct: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub score: i32,
    pub total: i32,
    pub accuracy: i32,
    pub duration_minutes: i64,
    pub topics: Vec<TopicBreakdown>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Expired,
    Submitted,
}

impl SessionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Expired => "EXPIRED",
            SessionStatus::Submitted => "SUBMITTED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamSession {
    pub id: String,
    pub learner_fingerprint: String,
    pub subject_id: SubjectId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub content_item_ids: Vec<ItemId>,
    pub answers: BTreeMap<ItemId, String>,
    pub is_submitted: bool,
    pub score: Option<i32>,
    pub report: Option<SessionReport>,
    pub device_meta: DeviceMeta,
    pub counters: SessionCounters,
    /// Fewer items than the target were available.
    pub degraded: bool,
}

impl ExamSession {
    pub fn new(
        learner_fingerprint: impl Into<String>,
        subject_id: SubjectId,
        start_time: DateTime<Utc>,
        content_item_ids: Vec<ItemId>,
        device_meta: DeviceMeta,
        degraded: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            learner_fingerprint: learner_fingerprint.into(),
            subject_id,
            start_time,
            end_time: None,
            content_item_ids,
            answers: BTreeMap::new(),
            is_submitted: false,
            score: None,
            report: None,
            device_meta,
            counters: SessionCounters::default(),
            degraded,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.start_time >= ttl
    }

    /// Whole seconds left, never negative.
    pub fn duration_left(&self, now: DateTime<Utc>, ttl: Duration) -> i64 {
        duration_left(self.start_time, now, ttl)
    }

    pub fn status(&self, now: DateTime<Utc>, ttl: Duration) -> SessionStatus {
        if self.is_submitted {
            SessionStatus::Submitted
        } else if self.is_expired(now, ttl) {
            SessionStatus::Expired
        } else {
            SessionStatus::Active
        }
    }
}

pub fn duration_left(start_time: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> i64 {
    (ttl - (now - start_time)).num_seconds().max(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Success,
    Failure,
}

impl GenerationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            GenerationStatus::Success => "success",
            GenerationStatus::Failure => "failure",
        }
    }
}

/// Observability record of one generation provider call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationLog {
    pub call_type: String,
    pub status: GenerationStatus,
    pub latency_ms: i64,
    pub item_count: i32,
    pub error_message: Option<String>,
}

impl GenerationLog {
    pub fn new(
        call_type: impl Into<String>,
        status: GenerationStatus,
        latency_ms: i64,
        item_count: i32,
        error_message: Option<String>,
    ) -> Self {
        Self {
            call_type: call_type.into(),
            status,
            latency_ms,
            item_count,
            error_message,
        }
    }
}

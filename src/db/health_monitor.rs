use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Outcome of one `SELECT 1` probe against the primary database.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    Ok(Duration),
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSnapshot {
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    pub checked_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub degraded: bool,
}

/// Last probe plus a failure streak; degraded once the streak reaches
/// `failure_threshold`. One success clears it.
#[derive(Debug)]
pub struct HealthTracker {
    failure_threshold: u32,
    consecutive_failures: u32,
    last: Option<(ProbeOutcome, DateTime<Utc>)>,
}

impl HealthTracker {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            consecutive_failures: 0,
            last: None,
        }
    }

    pub fn record(&mut self, outcome: ProbeOutcome, at: DateTime<Utc>) {
        match outcome {
            ProbeOutcome::Ok(_) => self.consecutive_failures = 0,
            ProbeOutcome::Failed(_) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1)
            }
        }
        self.last = Some((outcome, at));
    }

    pub fn snapshot(&self) -> HealthCheckSnapshot {
        let (healthy, latency_ms, error) = match self.last.as_ref().map(|(outcome, _)| outcome) {
            Some(ProbeOutcome::Ok(latency)) => (true, Some(latency.as_millis() as u64), None),
            Some(ProbeOutcome::Failed(err)) => (false, None, Some(err.clone())),
            None => (false, None, None),
        };

        HealthCheckSnapshot {
            healthy,
            latency_ms,
            error,
            checked_at: self.last.as_ref().map(|(_, at)| *at),
            consecutive_failures: self.consecutive_failures,
            degraded: self.consecutive_failures >= self.failure_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_accumulate_until_threshold() {
        let mut tracker = HealthTracker::new(3);
        for _ in 0..2 {
            tracker.record(ProbeOutcome::Failed("refused".to_string()), Utc::now());
        }
        assert!(!tracker.snapshot().degraded);

        tracker.record(ProbeOutcome::Failed("refused".to_string()), Utc::now());
        let snapshot = tracker.snapshot();
        assert!(!snapshot.healthy);
        assert_eq!(snapshot.consecutive_failures, 3);
        assert_eq!(snapshot.error.as_deref(), Some("refused"));
        assert!(snapshot.degraded);
    }

    #[test]
    fn test_success_clears_streak() {
        let mut tracker = HealthTracker::new(3);
        for _ in 0..4 {
            tracker.record(ProbeOutcome::Failed("blip".to_string()), Utc::now());
        }
        tracker.record(ProbeOutcome::Ok(Duration::from_millis(4)), Utc::now());

        let snapshot = tracker.snapshot();
        assert!(snapshot.healthy);
        assert_eq!(snapshot.latency_ms, Some(4));
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(!snapshot.degraded);
    }

    #[test]
    fn test_unprobed_tracker_is_not_degraded() {
        let snapshot = HealthTracker::new(3).snapshot();
        assert!(!snapshot.healthy);
        assert!(snapshot.checked_at.is_none());
        assert!(!snapshot.degraded);
    }
}

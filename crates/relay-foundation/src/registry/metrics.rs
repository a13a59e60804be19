//! Load statistics and per-model usage accounting.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

/// Bounded history length for latency windows.
pub const HISTORY_LIMIT: usize = 100;

/// Success rate above which the registry reports itself healthy.
const HEALTHY_SUCCESS_RATE: f64 = 0.8;

/// How a generation session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Summary the orchestrator reports when a session on a model ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub chunks: u64,
    pub bytes: u64,
    pub duration: Duration,
    /// Heuristic quality score of a completed answer, in `[0, 1]`.
    pub confidence: Option<f64>,
}

/// Usage counters for one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageStats {
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub sessions_cancelled: u64,
    pub output_chunks: u64,
    pub output_bytes: u64,
    /// Latency of the most recent sessions, newest last.
    pub recent_latency_ms: VecDeque<u64>,
    /// Confidence of the most recent completed answers, newest last.
    pub recent_confidence: VecDeque<f64>,
}

impl UsageStats {
    pub(crate) fn record(&mut self, report: &SessionReport) {
        match report.outcome {
            SessionOutcome::Completed => self.sessions_completed += 1,
            SessionOutcome::Failed => self.sessions_failed += 1,
            SessionOutcome::Cancelled => self.sessions_cancelled += 1,
        }
        self.output_chunks += report.chunks;
        self.output_bytes += report.bytes;
        push_bounded(&mut self.recent_latency_ms, millis(report.duration));
        if let Some(confidence) = report.confidence {
            push_bounded(&mut self.recent_confidence, confidence);
        }
    }

    pub fn total_sessions(&self) -> u64 {
        self.sessions_completed + self.sessions_failed + self.sessions_cancelled
    }

    pub fn average_latency_ms(&self) -> Option<f64> {
        average(&self.recent_latency_ms)
    }

    pub fn average_confidence(&self) -> Option<f64> {
        if self.recent_confidence.is_empty() {
            None
        } else {
            Some(self.recent_confidence.iter().sum::<f64>() / self.recent_confidence.len() as f64)
        }
    }
}

/// Aggregate load accounting across all models.
#[derive(Debug, Clone, Default)]
pub(crate) struct LoadStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub recent_load_ms: VecDeque<u64>,
}

impl LoadStats {
    pub(crate) fn record_success(&mut self, elapsed: Duration) {
        self.attempts += 1;
        self.successes += 1;
        push_bounded(&mut self.recent_load_ms, millis(elapsed));
    }

    pub(crate) fn record_failure(&mut self) {
        self.attempts += 1;
        self.failures += 1;
    }

    pub(crate) fn record_timeout(&mut self) {
        self.attempts += 1;
        self.timeouts += 1;
    }

    fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            1.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Point-in-time health summary of the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryHealth {
    pub status: HealthStatus,
    pub load_attempts: u64,
    pub load_successes: u64,
    pub load_failures: u64,
    pub load_timeouts: u64,
    pub success_rate: f64,
    pub average_load_ms: Option<f64>,
    pub committed_mb: u64,
    pub capacity_mb: u64,
    pub registered_models: usize,
    pub resident_models: usize,
    pub degraded_models: usize,
}

impl RegistryHealth {
    pub(crate) fn from_parts(
        stats: &LoadStats,
        committed_mb: u64,
        capacity_mb: u64,
        registered_models: usize,
        resident_models: usize,
        degraded_models: usize,
    ) -> Self {
        let success_rate = stats.success_rate();
        Self {
            status: if success_rate > HEALTHY_SUCCESS_RATE {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            load_attempts: stats.attempts,
            load_successes: stats.successes,
            load_failures: stats.failures,
            load_timeouts: stats.timeouts,
            success_rate,
            average_load_ms: average(&stats.recent_load_ms),
            committed_mb,
            capacity_mb,
            registered_models,
            resident_models,
            degraded_models,
        }
    }
}

fn push_bounded<T>(window: &mut VecDeque<T>, value: T) {
    if window.len() == HISTORY_LIMIT {
        window.pop_front();
    }
    window.push_back(value);
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn average(window: &VecDeque<u64>) -> Option<f64> {
    if window.is_empty() {
        None
    } else {
        Some(window.iter().sum::<u64>() as f64 / window.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(outcome: SessionOutcome, ms: u64) -> SessionReport {
        SessionReport {
            outcome,
            chunks: 3,
            bytes: 12,
            duration: Duration::from_millis(ms),
            confidence: None,
        }
    }

    #[test]
    fn usage_counts_outcomes_and_bounds_history() {
        let mut usage = UsageStats::default();
        for i in 0..150 {
            usage.record(&report(SessionOutcome::Completed, i));
        }
        usage.record(&report(SessionOutcome::Failed, 10));
        usage.record(&report(SessionOutcome::Cancelled, 10));

        assert_eq!(usage.sessions_completed, 150);
        assert_eq!(usage.sessions_failed, 1);
        assert_eq!(usage.sessions_cancelled, 1);
        assert_eq!(usage.total_sessions(), 152);
        assert_eq!(usage.output_chunks, 456);
        assert_eq!(usage.recent_latency_ms.len(), HISTORY_LIMIT);
        assert_eq!(usage.recent_latency_ms.back(), Some(&10));
        assert_eq!(usage.average_confidence(), None);
    }

    #[test]
    fn confidence_window_tracks_completed_answers() {
        let mut usage = UsageStats::default();
        for score in [0.5, 1.0] {
            usage.record(&SessionReport {
                confidence: Some(score),
                ..report(SessionOutcome::Completed, 5)
            });
        }
        usage.record(&report(SessionOutcome::Failed, 5));

        assert_eq!(usage.recent_confidence.len(), 2);
        assert_eq!(usage.average_confidence(), Some(0.75));
    }

    #[test]
    fn health_degrades_at_or_below_eighty_percent() {
        let mut stats = LoadStats::default();
        let fresh = RegistryHealth::from_parts(&stats, 0, 100, 0, 0, 0);
        assert_eq!(fresh.status, HealthStatus::Healthy);
        assert_eq!(fresh.average_load_ms, None);

        for _ in 0..4 {
            stats.record_success(Duration::from_millis(20));
        }
        stats.record_failure();
        let health = RegistryHealth::from_parts(&stats, 10, 100, 2, 1, 0);
        assert_eq!(health.success_rate, 0.8);
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.average_load_ms, Some(20.0));

        stats.record_success(Duration::from_millis(20));
        let health = RegistryHealth::from_parts(&stats, 10, 100, 2, 1, 0);
        assert_eq!(health.status, HealthStatus::Healthy);
    }
}

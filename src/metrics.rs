use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing ingestion activity.
#[derive(Default)]
pub struct PipelineMetrics {
    files_ingested: AtomicU64,
    files_failed: AtomicU64,
    artifacts_stored: AtomicU64,
    rows_sampled: AtomicU64,
    degraded_stages: AtomicU64,
}

impl PipelineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finalized ingestion and how many of its sub-stages degraded.
    pub fn record_success(&self, degraded_stages: u64) {
        self.files_ingested.fetch_add(1, Ordering::Relaxed);
        self.degraded_stages
            .fetch_add(degraded_stages, Ordering::Relaxed);
    }

    /// Record an ingestion that terminated in the failed state.
    pub fn record_failure(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a columnar artifact accepted by the store.
    pub fn record_artifact(&self) {
        self.artifacts_stored.fetch_add(1, Ordering::Relaxed);
    }

    /// Record rows forwarded to the embedder.
    pub fn record_sampled(&self, rows: u64) {
        self.rows_sampled.fetch_add(rows, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            files_ingested: self.files_ingested.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            artifacts_stored: self.artifacts_stored.load(Ordering::Relaxed),
            rows_sampled: self.rows_sampled.load(Ordering::Relaxed),
            degraded_stages: self.degraded_stages.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of ingestion counters used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Ingestions that reached the finalized state.
    pub files_ingested: u64,
    /// Ingestions that failed (parser unavailable or parse failure).
    pub files_failed: u64,
    /// Columnar artifacts accepted by the store.
    pub artifacts_stored: u64,
    /// Rows forwarded to the embedder across all ingestions.
    pub rows_sampled: u64,
    /// Skipped or degraded sub-stages across all finalized ingestions.
    pub degraded_stages: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_outcomes_and_artifacts() {
        let metrics = PipelineMetrics::new();
        metrics.record_success(0);
        metrics.record_success(2);
        metrics.record_failure();
        metrics.record_artifact();
        metrics.record_sampled(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.files_ingested, 2);
        assert_eq!(snapshot.files_failed, 1);
        assert_eq!(snapshot.artifacts_stored, 1);
        assert_eq!(snapshot.rows_sampled, 3);
        assert_eq!(snapshot.degraded_stages, 2);
    }

    #[test]
    fn snapshot_starts_empty() {
        let snapshot = PipelineMetrics::new().snapshot();
        assert_eq!(snapshot.files_ingested, 0);
        assert_eq!(snapshot.rows_sampled, 0);
    }
}

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::pipeline::HelperKind;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    /// Keyed by helper id (`kind:key`).
    pub helpers: BTreeMap<String, HelperMetrics>,
    pub runs: u64,
    pub failed_runs: u64,
    pub total_duration_ms: f64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct HelperMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_helper(&self, kind: HelperKind, key: &str) -> HelperTimer {
        HelperTimer {
            helper: format!("{kind}:{key}"),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            elapsed: None,
        }
    }

    pub fn record_run(&self, duration: Duration, succeeded: bool) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.runs += 1;
        if !succeeded {
            guard.failed_runs += 1;
        }
        guard.total_duration_ms += duration.as_secs_f64() * 1_000.0;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset(&self) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = MetricsSnapshot::default();
    }
}

/// Records the helper's duration once, on `finish` or on drop.
pub struct HelperTimer {
    helper: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    elapsed: Option<f64>,
}

impl HelperTimer {
    /// Stop the timer and return the elapsed milliseconds.
    pub fn finish(mut self) -> f64 {
        self.record()
    }

    fn record(&mut self) -> f64 {
        if let Some(duration_ms) = self.elapsed {
            return duration_ms;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        {
            let mut guard = self.collector.lock().unwrap_or_else(PoisonError::into_inner);
            let metrics = guard.helpers.entry(self.helper.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            helper = self.helper.as_str(),
            duration_ms, "Helper duration recorded"
        );
        self.elapsed = Some(duration_ms);
        duration_ms
    }
}

impl Drop for HelperTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        runs = snapshot.runs,
        failed_runs = snapshot.failed_runs,
        total_duration_ms = snapshot.total_duration_ms,
        helper_count = snapshot.helpers.len(),
        "Pipeline metrics summary"
    );
    for (helper, metrics) in &snapshot.helpers {
        debug!(
            helper = helper.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Helper metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_records_once() {
        let collector = MetricsCollector::new();
        let timer = collector.start_helper(HelperKind::Fragment, "ir.meta");
        let elapsed = timer.finish();
        assert!(elapsed >= 0.0);

        let snapshot = collector.snapshot();
        let metrics = &snapshot.helpers["fragment:ir.meta"];
        assert_eq!(metrics.calls, 1);
        assert!(metrics.max_duration_ms >= 0.0);
    }

    #[test]
    fn dropped_timer_still_counts() {
        let collector = MetricsCollector::new();
        {
            let _timer = collector.start_helper(HelperKind::Builder, "php");
        }
        collector.record_run(Duration::from_millis(3), false);
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.helpers["builder:php"].calls, 1);
        assert_eq!(snapshot.runs, 1);
        assert_eq!(snapshot.failed_runs, 1);

        collector.reset();
        assert!(collector.snapshot().helpers.is_empty());
    }
}

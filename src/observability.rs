use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub steps: BTreeMap<String, StepMetrics>,
    pub total_duration_ms: f64,
    pub reference_lookups: u64,
    pub reference_retries: u64,
    pub reference_cache_hits: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StepMetrics {
    pub calls: u64,
    pub failures: u64,
    pub skips: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Counters shared by every run of one engine.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    pub fn start_step(&self, step_name: &str) -> StepTimer {
        StepTimer {
            step: step_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn record_step_failure(&self, step_name: &str) {
        self.with_step(step_name, |metrics| metrics.failures += 1);
    }

    pub fn record_step_skip(&self, step_name: &str) {
        self.with_step(step_name, |metrics| metrics.skips += 1);
    }

    pub fn record_reference_lookup(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.reference_lookups += 1;
        }
    }

    pub fn record_reference_retry(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.reference_retries += 1;
        }
    }

    pub fn record_cache_hit(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.reference_cache_hits += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }

    fn with_step(&self, step_name: &str, update: impl FnOnce(&mut StepMetrics)) {
        if let Ok(mut guard) = self.inner.lock() {
            update(guard.steps.entry(step_name.to_string()).or_default());
        }
    }
}

/// Records one call and its duration when dropped.
pub struct StepTimer {
    step: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StepTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.steps.entry(self.step.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(step = self.step.as_str(), duration_ms, "Step duration recorded");
        self.recorded = true;
    }
}

impl Drop for StepTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        step_count = snapshot.steps.len(),
        reference_lookups = snapshot.reference_lookups,
        reference_retries = snapshot.reference_retries,
        reference_cache_hits = snapshot.reference_cache_hits,
        "Run metrics summary"
    );
    for (step, metrics) in &snapshot.steps {
        info!(
            step = step.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            skips = metrics.skips,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Step metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        for (name, help, value) in [
            (
                "calpipe_reference_lookups_total",
                "Reference service calls, retries included",
                self.reference_lookups,
            ),
            (
                "calpipe_reference_retries_total",
                "Reference lookups retried after a transient failure",
                self.reference_retries,
            ),
            (
                "calpipe_reference_cache_hits_total",
                "Reference bindings served from the run cache",
                self.reference_cache_hits,
            ),
        ] {
            output.push_str(&format!("# HELP {name} {help}\n"));
            output.push_str(&format!("# TYPE {name} counter\n"));
            output.push_str(&format!("{name} {value}\n"));
        }

        output.push_str("# HELP calpipe_step_calls_total Step invocation count\n");
        output.push_str("# TYPE calpipe_step_calls_total counter\n");
        output.push_str("# HELP calpipe_step_failures_total Failed step invocations\n");
        output.push_str("# TYPE calpipe_step_failures_total counter\n");
        output.push_str("# HELP calpipe_step_skips_total Skipped step invocations\n");
        output.push_str("# TYPE calpipe_step_skips_total counter\n");
        output.push_str(
            "# HELP calpipe_step_duration_seconds_total Accumulated step duration in seconds\n",
        );
        output.push_str("# TYPE calpipe_step_duration_seconds_total counter\n");
        output
            .push_str("# HELP calpipe_step_duration_seconds_max Maximum step duration in seconds\n");
        output.push_str("# TYPE calpipe_step_duration_seconds_max gauge\n");
        for (step, metrics) in &self.steps {
            output.push_str(&format!(
                "calpipe_step_calls_total{{step=\"{}\"}} {}\n",
                step, metrics.calls
            ));
            output.push_str(&format!(
                "calpipe_step_failures_total{{step=\"{}\"}} {}\n",
                step, metrics.failures
            ));
            output.push_str(&format!(
                "calpipe_step_skips_total{{step=\"{}\"}} {}\n",
                step, metrics.skips
            ));
            output.push_str(&format!(
                "calpipe_step_duration_seconds_total{{step=\"{}\"}} {:.6}\n",
                step,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "calpipe_step_duration_seconds_max{{step=\"{}\"}} {:.6}\n",
                step,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP calpipe_run_duration_seconds Total run duration\n");
        output.push_str("# TYPE calpipe_run_duration_seconds gauge\n");
        output.push_str(&format!(
            "calpipe_run_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output
    }
}

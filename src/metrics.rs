//! Per-stage timing histograms for the assistant pipeline.
//! Each turn carries a turn_id; spans record into a fixed-capacity ring so
//! p50/p95/p99 stay cheap to compute for long-running sessions.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Start of one wake-to-idle turn.
#[derive(Debug, Clone)]
pub struct TurnIds {
    pub turn_id: String,
    pub turn: u64,
}

impl TurnIds {
    pub fn new(turn: u64) -> Self {
        Self {
            turn_id: uuid::Uuid::new_v4().to_string(),
            turn,
        }
    }
}

/// A span measuring elapsed time from creation to explicit end.
pub struct TimingSpan {
    name: &'static str,
    start: Instant,
    registry: Arc<MetricsRegistry>,
}

impl TimingSpan {
    pub fn new(name: &'static str, registry: Arc<MetricsRegistry>) -> Self {
        Self {
            name,
            start: Instant::now(),
            registry,
        }
    }

    /// End the span, recording elapsed duration in milliseconds.
    pub fn finish(self) -> f64 {
        let elapsed_ms = self.elapsed_ms();
        self.registry.record(self.name, elapsed_ms);
        let whole_ms = elapsed_ms as u64;
        tracing::info!(stage = self.name, elapsed_ms = whole_ms, "stage took {} ms", whole_ms);
        elapsed_ms
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

/// Fixed-capacity ring buffer for histogram samples.
struct SampleRing {
    samples: Vec<f64>,
    pos: usize,
    count: usize,
    capacity: usize,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity],
            pos: 0,
            count: 0,
            capacity,
        }
    }

    fn push(&mut self, value: f64) {
        self.samples[self.pos] = value;
        self.pos = (self.pos + 1) % self.capacity;
        if self.count < self.capacity {
            self.count += 1;
        }
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples[..self.count].to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((p / 100.0) * (self.count as f64 - 1.0)).round() as usize;
        sorted[idx.min(self.count - 1)]
    }
}

/// Stores histograms for all named stages.
pub struct MetricsRegistry {
    histograms: Mutex<BTreeMap<&'static str, SampleRing>>,
    ring_capacity: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(ring_capacity: usize) -> Self {
        Self {
            histograms: Mutex::new(BTreeMap::new()),
            ring_capacity: ring_capacity.max(1),
        }
    }

    /// Record a sample (in milliseconds) for the named stage.
    pub fn record(&self, name: &'static str, value_ms: f64) {
        let mut hists = self.histograms.lock();
        hists
            .entry(name)
            .or_insert_with(|| SampleRing::new(self.ring_capacity))
            .push(value_ms);
        tracing::debug!(metric = name, value_ms, "metric_recorded");
    }

    /// Start a timing span that records on finish.
    pub fn span(self: &Arc<Self>, name: &'static str) -> TimingSpan {
        TimingSpan::new(name, Arc::clone(self))
    }

    /// Percentile (0-100) for a stage, in milliseconds.
    pub fn percentile(&self, name: &str, p: f64) -> f64 {
        self.histograms
            .lock()
            .get(name)
            .map(|ring| ring.percentile(p))
            .unwrap_or(0.0)
    }

    /// p50/p95/p99 per stage, ordered by stage name.
    pub fn summary(&self) -> BTreeMap<String, MetricSummary> {
        self.histograms
            .lock()
            .iter()
            .map(|(&name, ring)| {
                (
                    name.to_string(),
                    MetricSummary {
                        p50_ms: ring.percentile(50.0),
                        p95_ms: ring.percentile(95.0),
                        p99_ms: ring.percentile(99.0),
                        count: ring.count,
                    },
                )
            })
            .collect()
    }

    /// Emit the summary through tracing, one event per stage.
    pub fn log_summary(&self) {
        for (stage, s) in self.summary() {
            tracing::info!(
                stage = %stage,
                count = s.count,
                p50_ms = s.p50_ms as u64,
                p95_ms = s.p95_ms as u64,
                p99_ms = s.p99_ms as u64,
                "metrics_summary"
            );
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricSummary {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub count: usize,
}

/// Well-known stage names (constants to avoid typos).
pub mod metric_names {
    pub const RECORD: &str = "record";
    pub const RECOGNIZE: &str = "recognize";
    pub const DIALOGUE: &str = "dialogue";
    pub const SYNTHESIZE: &str = "synthesize";
    pub const PLAYBACK: &str = "playback";
    pub const TURN: &str = "turn";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentiles_over_samples() {
        let registry = MetricsRegistry::new();
        for v in 1..=100 {
            registry.record(metric_names::RECOGNIZE, v as f64);
        }
        assert_eq!(registry.percentile(metric_names::RECOGNIZE, 50.0), 51.0);
        assert_eq!(registry.percentile(metric_names::RECOGNIZE, 99.0), 99.0);
        assert_eq!(registry.percentile("missing", 50.0), 0.0);
    }

    #[test]
    fn test_ring_keeps_only_recent_samples() {
        let registry = MetricsRegistry::with_capacity(4);
        for v in [1000.0, 1.0, 2.0, 3.0, 4.0] {
            registry.record(metric_names::TURN, v);
        }
        let summary = registry.summary();
        let turn = &summary[metric_names::TURN];
        assert_eq!(turn.count, 4);
        assert_eq!(turn.p99_ms, 4.0);
    }

    #[test]
    fn test_span_records_on_finish() {
        let registry = Arc::new(MetricsRegistry::new());
        let span = registry.span(metric_names::PLAYBACK);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let elapsed = span.finish();
        assert!(elapsed >= 5.0);
        assert_eq!(registry.summary()[metric_names::PLAYBACK].count, 1);
    }
}

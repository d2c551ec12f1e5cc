use hdrhistogram::{CreationError, Histogram};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Highest recordable latency, in microseconds.
const MAX_LATENCY_US: u64 = 60_000_000;

#[derive(Debug, Default)]
struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    fn add(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }

        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    fn stddev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / (self.count as f64 - 1.0)).sqrt()
    }
}

#[derive(Debug)]
struct MarkerState {
    stats: RunningStats,
    histogram: Histogram<u64>,
    failures: u64,
}

/// Per-runner latency recorder.
#[derive(Debug)]
pub struct LatencyMarker {
    state: Mutex<MarkerState>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencySummary {
    pub count: u64,
    pub failures: u64,
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub stddev_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
}

fn round_to_3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

impl LatencyMarker {
    pub fn new() -> Result<Self, CreationError> {
        Ok(Self {
            state: Mutex::new(MarkerState {
                stats: RunningStats::default(),
                histogram: Histogram::new_with_bounds(1, MAX_LATENCY_US, 3)?,
                failures: 0,
            }),
        })
    }

    pub fn record(&self, elapsed: Duration, success: bool) {
        let latency_ms = elapsed.as_secs_f64() * 1000.0;
        let latency_us = (latency_ms * 1000.0).round().max(1.0) as u64;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.stats.add(latency_ms);
        let _ = state.histogram.record(latency_us.min(MAX_LATENCY_US));
        if !success {
            state.failures += 1;
        }
    }

    pub fn summary(&self) -> LatencySummary {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.stats.count == 0 {
            return LatencySummary::default();
        }
        let quantile = |q: f64| round_to_3(state.histogram.value_at_quantile(q) as f64 / 1000.0);
        LatencySummary {
            count: state.stats.count,
            failures: state.failures,
            min_ms: round_to_3(state.stats.min),
            avg_ms: round_to_3(state.stats.mean),
            max_ms: round_to_3(state.stats.max),
            stddev_ms: round_to_3(state.stats.stddev()),
            p50_ms: quantile(0.50),
            p90_ms: quantile(0.90),
            p99_ms: quantile(0.99),
        }
    }
}

impl fmt::Display for LatencySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "count={} errors={} min={}ms avg={}ms max={}ms stddev={}ms p50={}ms p90={}ms p99={}ms",
            self.count,
            self.failures,
            self.min_ms,
            self.avg_ms,
            self.max_ms,
            self.stddev_ms,
            self.p50_ms,
            self.p90_ms,
            self.p99_ms
        )
    }
}

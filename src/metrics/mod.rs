use dashmap::DashMap;
use hdrhistogram::Histogram;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Rate: WebSocket upgrade handshake succeeded (the "status 101" check)
pub const CONNECT_OK: &str = "connect_ok";
/// Rate: join reply carried status "ok"
pub const JOIN_OK: &str = "join_ok";
/// Rate: subscribe reply carried status "ok"
pub const SUBSCRIBE_OK: &str = "subscribe_ok";
/// Rate: no subscribe reply was seen when the ack timeout fired
pub const SUBSCRIBE_TIMEOUT: &str = "subscribe_timeout";
/// Trend: subscribe send → matching reply, in milliseconds
pub const SUBSCRIBE_LATENCY_MS: &str = "subscribe_latency_ms";
/// Rate: a subscribed domain event was delivered
pub const BROADCAST_RECEIVED: &str = "broadcast_received";
/// Trend: publish (`sent_at`) → delivery, in milliseconds
pub const BROADCAST_LATENCY_MS: &str = "broadcast_latency_ms";

/// A boolean-observation series: fraction of `true` among all observations.
#[derive(Debug, Default)]
pub struct RateSeries {
    hits: AtomicU64,
    total: AtomicU64,
}

impl RateSeries {
    fn record(&self, observation: bool) {
        if observation {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RateSnapshot {
        RateSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSnapshot {
    pub hits: u64,
    pub total: u64,
}

impl RateSnapshot {
    /// Fraction of `true` observations; `None` when nothing was recorded.
    pub fn fraction(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.hits as f64 / self.total as f64)
        }
    }
}

/// A numeric-sample series backed by an HDR histogram.
///
/// The histogram auto-resizes, so any non-negative millisecond value can be
/// recorded. Per-series locking only: writers to different series never
/// contend, and a single record is O(1).
#[derive(Debug)]
pub struct TrendSeries {
    hist: Mutex<Histogram<u64>>,
}

impl TrendSeries {
    fn new() -> Self {
        // 3 significant figures is plenty for latency thresholds
        let hist = Histogram::new(3).expect("sigfigs within histogram bounds");
        Self {
            hist: Mutex::new(hist),
        }
    }

    fn record(&self, value: u64) {
        let mut hist = self.hist.lock().unwrap_or_else(|e| e.into_inner());
        // Auto-resizing histogram only rejects values above u64 tracking range
        let _ = hist.record(value);
    }

    pub fn snapshot(&self) -> TrendSnapshot {
        let hist = self.hist.lock().unwrap_or_else(|e| e.into_inner());
        TrendSnapshot { hist: hist.clone() }
    }
}

#[derive(Debug, Clone)]
pub struct TrendSnapshot {
    hist: Histogram<u64>,
}

impl TrendSnapshot {
    pub fn count(&self) -> u64 {
        self.hist.len()
    }

    /// Value at the given percentile (0..=100); `None` when empty.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.hist.is_empty() {
            None
        } else {
            Some(self.hist.value_at_percentile(p) as f64)
        }
    }

    pub fn mean(&self) -> Option<f64> {
        if self.hist.is_empty() {
            None
        } else {
            Some(self.hist.mean())
        }
    }

    pub fn max(&self) -> u64 {
        self.hist.max()
    }
}

/// Process-wide aggregator of named Rate and Trend series.
///
/// One instance is created per run and an `Arc` handle is injected into every
/// virtual client. Writes are append-only: no series is ever reset or
/// corrected mid-run, and insertion order carries no meaning.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    rates: DashMap<String, Arc<RateSeries>>,
    trends: DashMap<String, Arc<TrendSeries>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_rate(&self, series: &str, observation: bool) {
        if let Some(existing) = self.rates.get(series) {
            existing.record(observation);
            return;
        }
        self.rates
            .entry(series.to_string())
            .or_insert_with(|| Arc::new(RateSeries::default()))
            .record(observation);
    }

    pub fn record_trend(&self, series: &str, value: u64) {
        if let Some(existing) = self.trends.get(series) {
            existing.record(value);
            return;
        }
        self.trends
            .entry(series.to_string())
            .or_insert_with(|| Arc::new(TrendSeries::new()))
            .record(value);
    }

    pub fn rate(&self, series: &str) -> Option<RateSnapshot> {
        self.rates.get(series).map(|s| s.snapshot())
    }

    pub fn trend(&self, series: &str) -> Option<TrendSnapshot> {
        self.trends.get(series).map(|s| s.snapshot())
    }

    /// Names of all rate series recorded so far, sorted for stable output.
    pub fn rate_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rates.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Names of all trend series recorded so far, sorted for stable output.
    pub fn trend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.trends.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

//! Runtime statistics: aggregate counters plus per-link accounting.
//!
//! Counters are plain atomics so the forwarding path never takes a lock to
//! update them. Derived rates (throughput, loss) are computed on the periodic
//! tick or at read time, off the hot path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{Bandwidth, IfIndex, LinkMetrics};

/// Smoothing factor for throughput and latency estimates.
pub const EMA_ALPHA: f64 = 0.2;

/// Statistics reporting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// How often to log a traffic summary.
    #[serde(default = "default_report_interval", with = "humantime_serde")]
    pub report_interval: Duration,
}

fn default_report_interval() -> Duration {
    Duration::from_secs(10)
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            report_interval: default_report_interval(),
        }
    }
}

/// Throughput estimate from observed forwarded bytes, EMA-smoothed.
///
/// `record` is the only hot-path entry point and is a single atomic add.
#[derive(Debug)]
pub struct ThroughputMeter {
    bytes: AtomicU64,
    state: Mutex<MeterState>,
}

#[derive(Debug)]
struct MeterState {
    last_update: Instant,
    rate: f64,
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self {
            bytes: AtomicU64::new(0),
            state: Mutex::new(MeterState {
                last_update: Instant::now(),
                rate: 0.0,
            }),
        }
    }
}

impl ThroughputMeter {
    pub fn record(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Fold bytes accumulated since the last tick into the rate estimate.
    pub fn tick(&self) {
        self.tick_at(Instant::now());
    }

    fn tick_at(&self, now: Instant) {
        let mut state = self.state.lock();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        if elapsed < 0.1 {
            return;
        }

        let bytes = self.bytes.swap(0, Ordering::Relaxed) as f64;
        let instant_rate = bytes / elapsed;
        state.rate = EMA_ALPHA * instant_rate + (1.0 - EMA_ALPHA) * state.rate;
        state.last_update = now;
    }

    pub fn current(&self) -> Bandwidth {
        Bandwidth::from_bps(self.state.lock().rate)
    }
}

/// Per-link traffic accounting.
#[derive(Debug, Default)]
pub struct LinkStats {
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    meter: ThroughputMeter,
    last_used: Mutex<Option<Instant>>,
}

impl LinkStats {
    fn note_sent(&self, bytes: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.meter.record(bytes);
        *self.last_used.lock() = Some(Instant::now());
    }

    fn note_received(&self, bytes: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.meter.record(bytes);
        *self.last_used.lock() = Some(Instant::now());
    }

    pub fn throughput(&self) -> Bandwidth {
        self.meter.current()
    }
}

/// Process-lifetime statistics, shared behind an `Arc`.
pub struct StatsRegistry {
    started_at: Mutex<Instant>,
    packets_received: AtomicU64,
    packets_forwarded: AtomicU64,
    packets_dropped: AtomicU64,
    packets_retried: AtomicU64,
    bytes_received: AtomicU64,
    bytes_forwarded: AtomicU64,
    /// EWMA latency across usable links, in nanoseconds. 0 = no estimate yet.
    latency_ns: AtomicU64,
    bandwidth: ThroughputMeter,
    links: DashMap<IfIndex, Arc<LinkStats>>,
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self {
            started_at: Mutex::new(Instant::now()),
            packets_received: AtomicU64::new(0),
            packets_forwarded: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            packets_retried: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_forwarded: AtomicU64::new(0),
            latency_ns: AtomicU64::new(0),
            bandwidth: ThroughputMeter::default(),
            links: DashMap::new(),
        }
    }

    fn link(&self, index: IfIndex) -> Arc<LinkStats> {
        self.links.entry(index).or_default().clone()
    }

    /// A unit arrived from the virtual adapter for dispatch.
    pub fn on_outbound_received(&self, bytes: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A unit went out through a physical link.
    pub fn on_outbound_forwarded(&self, index: IfIndex, bytes: u64) {
        self.packets_forwarded.fetch_add(1, Ordering::Relaxed);
        self.bytes_forwarded.fetch_add(bytes, Ordering::Relaxed);
        self.bandwidth.record(bytes);
        self.link(index).note_sent(bytes);
    }

    /// A unit arrived from a physical link.
    pub fn on_inbound_received(&self, index: IfIndex, bytes: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.link(index).note_received(bytes);
    }

    /// A unit was handed to the virtual adapter.
    pub fn on_inbound_delivered(&self, bytes: u64) {
        self.packets_forwarded.fetch_add(1, Ordering::Relaxed);
        self.bytes_forwarded.fetch_add(bytes, Ordering::Relaxed);
        self.bandwidth.record(bytes);
    }

    pub fn on_drop(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_retry(&self) {
        self.packets_retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a fresh latency observation into the running estimate.
    pub fn note_latency(&self, latency: Duration) {
        let sample = latency.as_nanos() as u64;
        let prev = self.latency_ns.load(Ordering::Relaxed);
        let next = if prev == 0 {
            sample
        } else {
            (EMA_ALPHA * sample as f64 + (1.0 - EMA_ALPHA) * prev as f64) as u64
        };
        self.latency_ns.store(next, Ordering::Relaxed);
    }

    /// Advance all rate estimators. Called from the engine's maintenance tick.
    pub fn tick(&self) {
        self.bandwidth.tick();
        for entry in self.links.iter() {
            entry.value().meter.tick();
        }
    }

    /// Current throughput estimate for one link.
    pub fn link_throughput(&self, index: IfIndex) -> Bandwidth {
        self.links
            .get(&index)
            .map_or(Bandwidth::ZERO, |s| s.throughput())
    }

    pub fn remove_link(&self, index: IfIndex) {
        self.links.remove(&index);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.lock().elapsed()
    }

    /// Zero every counter and restart the uptime clock.
    pub fn reset(&self) {
        *self.started_at.lock() = Instant::now();
        self.packets_received.store(0, Ordering::Relaxed);
        self.packets_forwarded.store(0, Ordering::Relaxed);
        self.packets_dropped.store(0, Ordering::Relaxed);
        self.packets_retried.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.bytes_forwarded.store(0, Ordering::Relaxed);
        self.latency_ns.store(0, Ordering::Relaxed);
        self.links.clear();
    }

    /// Point-in-time view, safe to serialize and ship to a control plane.
    pub fn snapshot(&self) -> StatsSnapshot {
        let packets_received = self.packets_received.load(Ordering::Relaxed);
        let packets_dropped = self.packets_dropped.load(Ordering::Relaxed);
        let loss_rate = if packets_received == 0 {
            0.0
        } else {
            packets_dropped as f64 / packets_received as f64
        };

        let latency_ns = self.latency_ns.load(Ordering::Relaxed);
        let latency = (latency_ns > 0).then(|| Duration::from_nanos(latency_ns));

        let mut links: Vec<LinkStatsSnapshot> = self
            .links
            .iter()
            .map(|entry| {
                let stats = entry.value();
                LinkStatsSnapshot {
                    index: *entry.key(),
                    packets_sent: stats.packets_sent.load(Ordering::Relaxed),
                    packets_received: stats.packets_received.load(Ordering::Relaxed),
                    bytes_sent: stats.bytes_sent.load(Ordering::Relaxed),
                    bytes_received: stats.bytes_received.load(Ordering::Relaxed),
                    throughput: stats.throughput(),
                    idle_for: stats.last_used.lock().map(|t| t.elapsed()),
                }
            })
            .collect();
        links.sort_by_key(|l| l.index);

        StatsSnapshot {
            uptime: self.uptime(),
            packets_received,
            packets_forwarded: self.packets_forwarded.load(Ordering::Relaxed),
            packets_dropped,
            packets_retried: self.packets_retried.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            loss_rate,
            latency,
            bandwidth: self.bandwidth.current(),
            links,
        }
    }
}

/// Serializable aggregate view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    #[serde(with = "humantime_serde")]
    pub uptime: Duration,
    pub packets_received: u64,
    pub packets_forwarded: u64,
    pub packets_dropped: u64,
    pub packets_retried: u64,
    pub bytes_received: u64,
    pub bytes_forwarded: u64,
    pub loss_rate: f64,
    #[serde(default, with = "humantime_serde::option")]
    pub latency: Option<Duration>,
    pub bandwidth: Bandwidth,
    pub links: Vec<LinkStatsSnapshot>,
}

/// Serializable per-link view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkStatsSnapshot {
    pub index: IfIndex,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub throughput: Bandwidth,
    #[serde(default, with = "humantime_serde::option")]
    pub idle_for: Option<Duration>,
}

/// Composite quality score (0-100) for a link's current metrics.
pub fn quality_score(metrics: &LinkMetrics) -> u32 {
    let rtt_ms = metrics.latency_ms();
    let rtt_score = if rtt_ms <= 0.0 {
        1.0
    } else {
        1.0 / (1.0 + rtt_ms / 100.0)
    };
    let loss_score = 1.0 - metrics.loss.min(1.0);

    ((rtt_score * 0.5 + loss_score * 0.5) * 100.0) as u32
}

/// Human-readable bucket for a quality score.
pub fn quality_label(score: u32) -> &'static str {
    match score {
        90..=100 => "excellent",
        70..=89 => "good",
        50..=69 => "fair",
        30..=49 => "poor",
        _ => "critical",
    }
}

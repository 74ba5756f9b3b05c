//! Routing policy: pick a link for a flow.
//!
//! One scoring function per mode, dispatched over a plain enum. The engine
//! carries no per-flow state; flow affinity is the flow table's job.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, trace};

use crate::error::{Error, Result};
use crate::registry::{HealthSnapshot, LinkEntry};
use crate::types::{IfIndex, LinkState};

/// Routing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    /// Blend of latency, loss and throughput, scaled by link weight.
    #[default]
    Balanced,
    /// Strict rotation over the candidate set.
    RoundRobin,
    /// Lowest smoothed latency; Degraded links only when nothing is Up.
    LatencyBased,
    /// Highest observed throughput.
    BandwidthBased,
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PolicyMode::Balanced => "balanced",
            PolicyMode::RoundRobin => "round_robin",
            PolicyMode::LatencyBased => "latency_based",
            PolicyMode::BandwidthBased => "bandwidth_based",
        };
        write!(f, "{name}")
    }
}

impl FromStr for PolicyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "balanced" => Ok(PolicyMode::Balanced),
            "round_robin" => Ok(PolicyMode::RoundRobin),
            "latency_based" | "latency" => Ok(PolicyMode::LatencyBased),
            "bandwidth_based" | "bandwidth" => Ok(PolicyMode::BandwidthBased),
            other => Err(Error::InvalidConfig(format!("unknown policy mode: {other}"))),
        }
    }
}

/// Routing policy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Mode the engine starts in.
    #[serde(default)]
    pub mode: PolicyMode,
}

/// Why a flow was pinned or moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    /// First packet of a new flow.
    Initial,
    /// The pinned link went down or vanished.
    Failover,
    /// Operator action moved the flow.
    Rebalance,
}

impl fmt::Display for RouteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteReason::Initial => write!(f, "initial"),
            RouteReason::Failover => write!(f, "failover"),
            RouteReason::Rebalance => write!(f, "rebalance"),
        }
    }
}

/// Outcome of a selection, traceable to the snapshot that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingDecision {
    pub index: IfIndex,
    pub reason: RouteReason,
    pub snapshot_version: u64,
}

/// The policy engine. Mode switches apply to subsequent selections only.
pub struct PolicyEngine {
    mode: RwLock<PolicyMode>,
    rr_cursor: AtomicUsize,
    /// When each link last won a selection, for the Balanced tie-break.
    last_assigned: Mutex<HashMap<IfIndex, Instant>>,
}

impl PolicyEngine {
    pub fn new(mode: PolicyMode) -> Self {
        Self {
            mode: RwLock::new(mode),
            rr_cursor: AtomicUsize::new(0),
            last_assigned: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> PolicyMode {
        *self.mode.read()
    }

    /// Switch modes. Returns the previous mode.
    pub fn set_mode(&self, mode: PolicyMode) -> PolicyMode {
        let mut guard = self.mode.write();
        let previous = *guard;
        *guard = mode;
        drop(guard);
        if previous != mode {
            info!(from = %previous, to = %mode, "routing mode changed");
        }
        previous
    }

    /// Pick a link from the snapshot's eligible set.
    ///
    /// Down and Disabled links are never candidates. An empty candidate set is
    /// a total outage, reported as an error rather than a sentinel index.
    pub fn select(&self, snapshot: &HealthSnapshot, reason: RouteReason) -> Result<RoutingDecision> {
        let mode = self.mode();
        let candidates: Vec<&LinkEntry> = snapshot.eligible().collect();
        if candidates.is_empty() {
            return Err(Error::TotalOutage);
        }

        let index = match mode {
            PolicyMode::Balanced => self.select_balanced(&candidates),
            PolicyMode::RoundRobin => self.select_round_robin(&candidates),
            PolicyMode::LatencyBased => select_latency(&candidates),
            PolicyMode::BandwidthBased => select_bandwidth(&candidates),
        };
        debug_assert!(snapshot.is_eligible(index));

        self.last_assigned.lock().insert(index, Instant::now());
        trace!(%index, %mode, %reason, version = snapshot.version, "link selected");

        Ok(RoutingDecision {
            index,
            reason,
            snapshot_version: snapshot.version,
        })
    }

    /// Drop bookkeeping for a removed link.
    pub fn forget(&self, index: IfIndex) {
        self.last_assigned.lock().remove(&index);
    }

    fn select_balanced(&self, candidates: &[&LinkEntry]) -> IfIndex {
        // Normalize each component across the candidate set so no single
        // metric's unit dominates the blend.
        let max_inv_latency = candidates
            .iter()
            .map(|e| inverse_latency(e))
            .fold(0.0, f64::max);
        let max_throughput = candidates
            .iter()
            .map(|e| e.metrics.throughput.bytes_per_sec)
            .fold(0.0, f64::max);

        let score = |e: &LinkEntry| -> f64 {
            let latency = if max_inv_latency > 0.0 {
                inverse_latency(e) / max_inv_latency
            } else {
                1.0
            };
            let loss = 1.0 - e.metrics.loss.min(1.0);
            let throughput = if max_throughput > 0.0 {
                e.metrics.throughput.bytes_per_sec / max_throughput
            } else {
                0.0
            };

            let blend = (latency + loss + throughput) / 3.0;
            blend * f64::from(e.weight) / 100.0
        };

        let best = candidates
            .iter()
            .map(|e| score(e))
            .fold(f64::MIN, f64::max);
        let tied: Vec<&&LinkEntry> = candidates
            .iter()
            .filter(|e| (score(e) - best).abs() < 1e-9)
            .collect();

        // Ties go to the link that has waited longest since its last win;
        // never-assigned sorts before any timestamp.
        let last = self.last_assigned.lock();
        tied.iter()
            .min_by_key(|e| last.get(&e.index).copied())
            .map_or(candidates[0].index, |e| e.index)
    }

    fn select_round_robin(&self, candidates: &[&LinkEntry]) -> IfIndex {
        let i = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates[i].index
    }
}

fn inverse_latency(entry: &LinkEntry) -> f64 {
    match entry.metrics.latency {
        Some(latency) if !latency.is_zero() => 1.0 / (latency.as_secs_f64() * 1000.0),
        _ => 0.0,
    }
}

fn select_latency(candidates: &[&LinkEntry]) -> IfIndex {
    let ups: Vec<&LinkEntry> = candidates
        .iter()
        .copied()
        .filter(|e| e.state == LinkState::Up)
        .collect();
    let pool = if ups.is_empty() {
        candidates.to_vec()
    } else {
        ups
    };

    pool.iter()
        .min_by(|a, b| {
            let la = a.metrics.latency.unwrap_or(Duration::MAX);
            let lb = b.metrics.latency.unwrap_or(Duration::MAX);
            la.cmp(&lb).then_with(|| {
                a.metrics
                    .loss
                    .partial_cmp(&b.metrics.loss)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        })
        .map_or(candidates[0].index, |e| e.index)
}

fn select_bandwidth(candidates: &[&LinkEntry]) -> IfIndex {
    candidates
        .iter()
        .max_by(|a, b| {
            let ta = a.metrics.throughput.bytes_per_sec;
            let tb = b.metrics.throughput.bytes_per_sec;
            ta.partial_cmp(&tb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    // On equal throughput the lower latency wins.
                    let la = a.metrics.latency.unwrap_or(Duration::MAX);
                    let lb = b.metrics.latency.unwrap_or(Duration::MAX);
                    lb.cmp(&la)
                })
        })
        .map_or(candidates[0].index, |e| e.index)
}

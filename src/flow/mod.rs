//! Flow tracking and sticky routing.
//!
//! The table pins each flow to one link on first sight and keeps that pin
//! until the link dies, the flow tears down, or it idles out. Per-packet
//! work is a keyed lookup plus counter updates; the policy engine runs
//! only when a pin is created or replaced.
//!
//! A per-link index of pinned keys keeps failover proportional to the
//! flows actually riding the lost link.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::policy::{PolicyEngine, RouteReason, RoutingDecision};
use crate::registry::HealthSnapshot;
use crate::types::IfIndex;

pub mod packet;

pub use packet::{FlowKey, PacketView, Proto};

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_accept_unsolicited() -> bool {
    true
}

/// Flow table configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Idle time after which a flow is evicted.
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Whether inbound units with no matching flow open a new flow
    /// (server-style traffic) or are dropped.
    #[serde(default = "default_accept_unsolicited")]
    pub accept_unsolicited: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            accept_unsolicited: default_accept_unsolicited(),
        }
    }
}

/// Coarse traffic class derived from well-known ports. Observability only.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ServiceClass {
    Web,
    Dns,
    Voice,
    Gaming,
    Streaming,
    FileTransfer,
    Unknown,
}

impl ServiceClass {
    /// Classify a flow from its endpoints. The remote port is the signal;
    /// the local port covers the server side of inbound-initiated flows.
    pub fn classify(key: &FlowKey) -> Self {
        let remote = key.remote.port();
        let local = key.local.port();
        match key.proto {
            Proto::Tcp => match remote {
                80 | 443 | 8080 | 8443 => ServiceClass::Web,
                53 => ServiceClass::Dns,
                21 | 22 | 989 | 990 => ServiceClass::FileTransfer,
                554 | 1935 => ServiceClass::Streaming,
                _ => match local {
                    80 | 443 | 8080 | 8443 => ServiceClass::Web,
                    _ => ServiceClass::Unknown,
                },
            },
            Proto::Udp => match remote {
                53 => ServiceClass::Dns,
                5060 | 5061 => ServiceClass::Voice,
                3074 | 27015 | 7777..=7784 => ServiceClass::Gaming,
                5004 | 5005 => ServiceClass::Streaming,
                _ if local == 53 => ServiceClass::Dns,
                _ => ServiceClass::Unknown,
            },
            _ => ServiceClass::Unknown,
        }
    }
}

impl fmt::Display for ServiceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceClass::Web => "web",
            ServiceClass::Dns => "dns",
            ServiceClass::Voice => "voice",
            ServiceClass::Gaming => "gaming",
            ServiceClass::Streaming => "streaming",
            ServiceClass::FileTransfer => "file_transfer",
            ServiceClass::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Where a flow is pinned and which snapshot justified it.
#[derive(Debug, Clone, Copy)]
pub struct PinState {
    pub index: IfIndex,
    pub snapshot_version: u64,
    pub pinned_at: Instant,
}

impl PinState {
    fn from_decision(decision: &RoutingDecision) -> Self {
        Self {
            index: decision.index,
            snapshot_version: decision.snapshot_version,
            pinned_at: Instant::now(),
        }
    }
}

/// One tracked flow. The pin mutex serializes assign and failover for
/// this flow only; different flows never contend.
#[derive(Debug)]
pub struct Flow {
    pub key: FlowKey,
    pub class: ServiceClass,
    pub created_at: Instant,
    pin: Mutex<PinState>,
    last_seen: Mutex<Instant>,
    packets_out: AtomicU64,
    bytes_out: AtomicU64,
    packets_in: AtomicU64,
    bytes_in: AtomicU64,
}

impl Flow {
    fn new(key: FlowKey, class: ServiceClass, decision: &RoutingDecision) -> Self {
        let now = Instant::now();
        Self {
            key,
            class,
            created_at: now,
            pin: Mutex::new(PinState::from_decision(decision)),
            last_seen: Mutex::new(now),
            packets_out: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            packets_in: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
        }
    }

    /// The link this flow currently rides.
    pub fn pinned(&self) -> IfIndex {
        self.pin.lock().index
    }

    pub fn pin_state(&self) -> PinState {
        *self.pin.lock()
    }

    pub fn note_outbound(&self, bytes: usize) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn note_inbound(&self, bytes: usize) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn packets(&self) -> (u64, u64) {
        (
            self.packets_out.load(Ordering::Relaxed),
            self.packets_in.load(Ordering::Relaxed),
        )
    }

    pub fn bytes(&self) -> (u64, u64) {
        (
            self.bytes_out.load(Ordering::Relaxed),
            self.bytes_in.load(Ordering::Relaxed),
        )
    }

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_seen.lock())
    }
}

/// Outcome of draining one link's flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub from: IfIndex,
    /// Flows repinned to a surviving link.
    pub moved: usize,
    /// Flows evicted because no link could take them.
    pub evicted: usize,
}

impl DrainReport {
    pub fn affected(&self) -> usize {
        self.moved + self.evicted
    }
}

/// Concurrent flow table with per-flow pin locking.
pub struct FlowTable {
    config: FlowConfig,
    policy: Arc<PolicyEngine>,
    flows: DashMap<FlowKey, Arc<Flow>>,
    by_link: DashMap<IfIndex, DashSet<FlowKey>>,
}

impl FlowTable {
    pub fn new(config: FlowConfig, policy: Arc<PolicyEngine>) -> Self {
        Self {
            config,
            policy,
            flows: DashMap::new(),
            by_link: DashMap::new(),
        }
    }

    pub fn accept_unsolicited(&self) -> bool {
        self.config.accept_unsolicited
    }

    /// Look up or create the flow for `key` and return its pin.
    ///
    /// Existing flows return their pinned link without consulting the
    /// policy engine, unless `snapshot` says that link is no longer
    /// eligible; such a pin is repaired here with a failover selection.
    /// New flows get one selection against `snapshot`. Both paths fail
    /// with `TotalOutage` when nothing is eligible, and an unplaceable
    /// existing flow is evicted rather than left on a dead link.
    pub fn assign(&self, snapshot: &HealthSnapshot, key: FlowKey) -> Result<Arc<Flow>> {
        use dashmap::mapref::entry::Entry;

        match self.flows.entry(key) {
            Entry::Occupied(entry) => {
                let flow = Arc::clone(entry.get());
                flow.touch();
                let mut pin = flow.pin.lock();
                if snapshot.is_eligible(pin.index) {
                    drop(pin);
                    return Ok(flow);
                }

                // A flow committed from an older snapshot misses the drain
                // that ran on its link's Down transition; repair the pin
                // here instead of handing back a dead link.
                let from = pin.index;
                match self.policy.select(snapshot, RouteReason::Failover) {
                    Ok(decision) => {
                        *pin = PinState::from_decision(&decision);
                        drop(pin);
                        self.unindex(&key, from);
                        self.by_link.entry(decision.index).or_default().insert(key);
                        debug!(flow = %key, from = %from, to = %decision.index, "stale pin repaired");
                        Ok(flow)
                    }
                    Err(e) => {
                        drop(pin);
                        self.unindex(&key, from);
                        entry.remove();
                        Err(e)
                    }
                }
            }
            Entry::Vacant(entry) => {
                let decision = self.policy.select(snapshot, RouteReason::Initial)?;
                let class = ServiceClass::classify(&key);
                let flow = Arc::new(Flow::new(key, class, &decision));
                self.by_link.entry(decision.index).or_default().insert(key);
                entry.insert(Arc::clone(&flow));
                debug!(flow = %key, link = %decision.index, %class, "flow pinned");
                Ok(flow)
            }
        }
    }

    /// Find an existing flow without creating one. Touches activity.
    pub fn lookup(&self, key: &FlowKey) -> Option<Arc<Flow>> {
        self.flows.get(key).map(|entry| {
            let flow = Arc::clone(entry.value());
            flow.touch();
            flow
        })
    }

    /// Failover: repin every flow riding `index` using `snapshot`.
    ///
    /// The snapshot already excludes the lost link, so each affected flow
    /// gets a fresh selection over the survivors. Flows that cannot be
    /// placed anywhere are evicted rather than left pinned to a dead link.
    pub fn reassign_for_down(&self, snapshot: &HealthSnapshot, index: IfIndex) -> DrainReport {
        self.drain(snapshot, index, RouteReason::Failover)
    }

    /// Drain a link that was administratively disabled or removed.
    pub fn drain_link(&self, snapshot: &HealthSnapshot, index: IfIndex) -> DrainReport {
        self.drain(snapshot, index, RouteReason::Rebalance)
    }

    fn drain(&self, snapshot: &HealthSnapshot, from: IfIndex, reason: RouteReason) -> DrainReport {
        let mut report = DrainReport {
            from,
            moved: 0,
            evicted: 0,
        };

        // Take the whole key set in one shot so a concurrent drain of the
        // same link finds nothing to do.
        let Some((_, keys)) = self.by_link.remove(&from) else {
            return report;
        };

        for key in keys {
            let Some(flow) = self.flows.get(&key).map(|e| Arc::clone(e.value())) else {
                continue;
            };

            let mut pin = flow.pin.lock();
            if pin.index != from {
                // Already moved by a concurrent path; keep its new home.
                self.by_link.entry(pin.index).or_default().insert(key);
                continue;
            }

            match self.policy.select(snapshot, reason) {
                Ok(decision) => {
                    *pin = PinState::from_decision(&decision);
                    drop(pin);
                    self.by_link.entry(decision.index).or_default().insert(key);
                    report.moved += 1;
                    debug!(flow = %key, from = %from, to = %decision.index, %reason, "flow repinned");
                }
                Err(Error::TotalOutage) => {
                    drop(pin);
                    self.flows.remove(&key);
                    report.evicted += 1;
                }
                Err(e) => {
                    drop(pin);
                    self.flows.remove(&key);
                    report.evicted += 1;
                    // select's contract is a decision or TotalOutage;
                    // anything else means routing state is corrupt.
                    let e = Error::Invariant(format!("drain selection failed: {e}"));
                    debug_assert!(false, "{e}");
                    error!(flow = %key, error = %e, "flow evicted");
                }
            }
        }

        if report.affected() > 0 {
            info!(
                link = %from,
                moved = report.moved,
                evicted = report.evicted,
                %reason,
                "link drained"
            );
        }

        report
    }

    /// Remove a flow whose close was observed in-band (TCP FIN/RST).
    /// A trailing segment simply opens a short-lived flow that idles out.
    pub fn note_teardown(&self, key: &FlowKey) {
        if let Some((_, flow)) = self.flows.remove(key) {
            self.unindex(key, flow.pinned());
            debug!(flow = %key, "flow closed");
        }
    }

    /// Evict flows idle past the configured timeout. Called from the
    /// maintenance cycle, not a dedicated timer.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let timeout = self.config.idle_timeout;
        let expired: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|entry| entry.value().idle_for(now) >= timeout)
            .map(|entry| *entry.key())
            .collect();

        let mut evicted = 0;
        for key in expired {
            // Re-check under removal; the flow may have seen traffic since.
            if let Some((_, flow)) = self
                .flows
                .remove_if(&key, |_, f| f.idle_for(now) >= timeout)
            {
                self.unindex(&key, flow.pinned());
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!(count = evicted, "idle flows evicted");
        }
        evicted
    }

    fn unindex(&self, key: &FlowKey, index: IfIndex) {
        if let Some(set) = self.by_link.get(&index) {
            set.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Number of flows currently pinned to `index`.
    pub fn flows_on(&self, index: IfIndex) -> usize {
        self.by_link.get(&index).map_or(0, |set| set.len())
    }

    /// Flow counts per traffic class, for stats reporting.
    pub fn class_counts(&self) -> BTreeMap<ServiceClass, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.flows.iter() {
            *counts.entry(entry.value().class).or_insert(0) += 1;
        }
        counts
    }

    /// Drop all flows, as part of engine drain on stop.
    pub fn clear(&self) {
        self.flows.clear();
        self.by_link.clear();
    }
}

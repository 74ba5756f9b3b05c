//! Authoritative record of physical links and their health.
//!
//! Every routing decision reads from an immutable [`HealthSnapshot`]. Mutations
//! build a new snapshot and swap the whole thing in under a short write lock,
//! so readers never observe a half-updated view. Snapshot versions are
//! monotonic; a decision can always be traced back to the exact view it used.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::{AdminState, IfIndex, LinkKind, LinkMetrics, LinkState};

mod discovery;

pub use discovery::{diff_links, scan_links, DiscoveredLink, DiscoveryConfig};

/// One physical link as seen by the routing planes.
#[derive(Debug, Clone)]
pub struct LinkEntry {
    pub index: IfIndex,
    pub name: String,
    pub kind: LinkKind,
    pub admin: AdminState,
    pub state: LinkState,
    /// Routing weight, derived from the kind unless overridden.
    pub weight: u32,
    pub metrics: LinkMetrics,
}

impl LinkEntry {
    /// New links start Degraded until the prober has a verdict.
    pub fn new(index: IfIndex, name: impl Into<String>, kind: LinkKind) -> Self {
        Self {
            index,
            name: name.into(),
            kind,
            admin: AdminState::Enabled,
            state: LinkState::Degraded,
            weight: kind.base_weight(),
            metrics: LinkMetrics::default(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_admin(mut self, admin: AdminState) -> Self {
        self.admin = admin;
        self
    }

    pub fn with_state(mut self, state: LinkState) -> Self {
        self.state = state;
        self
    }

    pub fn with_metrics(mut self, metrics: LinkMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Whether this link may carry traffic at all.
    pub fn is_eligible(&self) -> bool {
        self.admin.is_enabled() && self.state.is_usable()
    }
}

/// Immutable, versioned view of every known link.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub version: u64,
    pub links: BTreeMap<IfIndex, LinkEntry>,
}

impl HealthSnapshot {
    pub fn empty() -> Self {
        Self {
            version: 0,
            links: BTreeMap::new(),
        }
    }

    pub fn get(&self, index: IfIndex) -> Option<&LinkEntry> {
        self.links.get(&index)
    }

    pub fn contains(&self, index: IfIndex) -> bool {
        self.links.contains_key(&index)
    }

    /// Links that may carry traffic, in ascending index order.
    pub fn eligible(&self) -> impl Iterator<Item = &LinkEntry> {
        self.links.values().filter(|e| e.is_eligible())
    }

    pub fn eligible_count(&self) -> usize {
        self.eligible().count()
    }

    pub fn is_eligible(&self, index: IfIndex) -> bool {
        self.get(index).is_some_and(LinkEntry::is_eligible)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Outcome of one probe sweep for a single link.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub index: IfIndex,
    pub state: LinkState,
    pub metrics: LinkMetrics,
}

/// A link state change captured while applying reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTransition {
    pub index: IfIndex,
    pub from: LinkState,
    pub to: LinkState,
}

impl LinkTransition {
    pub fn went_down(&self) -> bool {
        self.to == LinkState::Down && self.from != LinkState::Down
    }

    pub fn recovered(&self) -> bool {
        self.from == LinkState::Down && self.to != LinkState::Down
    }
}

/// A freshly swapped-in snapshot plus the transitions that produced it.
#[derive(Debug, Clone)]
pub struct SnapshotUpdate {
    pub snapshot: Arc<HealthSnapshot>,
    pub transitions: Vec<LinkTransition>,
}

impl SnapshotUpdate {
    pub fn lost_links(&self) -> impl Iterator<Item = IfIndex> + '_ {
        self.transitions
            .iter()
            .filter(|t| t.went_down())
            .map(|t| t.index)
    }
}

/// The registry itself. Cheap to share behind an `Arc`.
pub struct LinkRegistry {
    snapshot: RwLock<Arc<HealthSnapshot>>,
}

impl Default for LinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(HealthSnapshot::empty())),
        }
    }

    /// Current snapshot. Cheap; clones an `Arc` under a read lock.
    pub fn current(&self) -> Arc<HealthSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn version(&self) -> u64 {
        self.snapshot.read().version
    }

    /// Insert or replace a link. Returns the snapshot the change landed in.
    pub fn register(&self, entry: LinkEntry) -> Arc<HealthSnapshot> {
        let name = entry.name.clone();
        let index = entry.index;
        let kind = entry.kind;

        let (next, replaced) = self.mutate(|links| links.insert(index, entry).is_some());

        if replaced {
            debug!(link = %name, %index, "replaced link registration");
        } else {
            info!(link = %name, %index, %kind, "registered link");
        }
        next
    }

    /// Remove a link entirely. Unknown indices are an error so CLI callers
    /// get feedback instead of a silent no-op.
    pub fn remove(&self, index: IfIndex) -> Result<Arc<HealthSnapshot>> {
        let mut removed_name = None;
        let (next, found) = self.mutate(|links| {
            if let Some(entry) = links.remove(&index) {
                removed_name = Some(entry.name);
                true
            } else {
                false
            }
        });

        if found {
            info!(link = removed_name.as_deref().unwrap_or("?"), %index, "removed link");
            Ok(next)
        } else {
            Err(Error::UnknownLink(index))
        }
    }

    /// Administratively enable or disable a link.
    pub fn set_admin(&self, index: IfIndex, admin: AdminState) -> Result<Arc<HealthSnapshot>> {
        let (next, found) = self.mutate(|links| match links.get_mut(&index) {
            Some(entry) => {
                entry.admin = admin;
                true
            }
            None => false,
        });

        if found {
            info!(%index, state = %admin, "admin state changed");
            Ok(next)
        } else {
            Err(Error::UnknownLink(index))
        }
    }

    /// Apply a batch of probe reports as a single snapshot swap.
    ///
    /// Reports for unknown indices are logged and skipped; a probe cycle that
    /// raced a removal must not resurrect the link.
    pub fn apply_reports(&self, reports: Vec<ProbeReport>) -> SnapshotUpdate {
        let mut transitions = Vec::new();

        let (snapshot, ()) = self.mutate(|links| {
            for report in reports {
                match links.get_mut(&report.index) {
                    Some(entry) => {
                        if entry.state != report.state {
                            transitions.push(LinkTransition {
                                index: report.index,
                                from: entry.state,
                                to: report.state,
                            });
                        }
                        entry.state = report.state;
                        entry.metrics = report.metrics;
                    }
                    None => {
                        warn!(index = %report.index, "probe report for unknown link, skipping");
                    }
                }
            }
        });

        for t in &transitions {
            if t.went_down() {
                warn!(index = %t.index, from = %t.from, "link went down");
            } else {
                info!(index = %t.index, from = %t.from, to = %t.to, "link state changed");
            }
        }

        SnapshotUpdate {
            snapshot,
            transitions,
        }
    }

    /// Force a link Down, outside the normal probe cadence. Used when sends
    /// fail hard enough that waiting for the next sweep would strand traffic.
    pub fn mark_down(&self, index: IfIndex) -> Option<SnapshotUpdate> {
        let mut transition = None;
        let (snapshot, found) = self.mutate(|links| match links.get_mut(&index) {
            Some(entry) => {
                if entry.state != LinkState::Down {
                    transition = Some(LinkTransition {
                        index,
                        from: entry.state,
                        to: LinkState::Down,
                    });
                    entry.state = LinkState::Down;
                }
                true
            }
            None => false,
        });

        if !found {
            warn!(%index, "mark_down for unknown link, skipping");
            return None;
        }

        if transition.is_some() {
            warn!(%index, "link forced down after send failures");
        }

        Some(SnapshotUpdate {
            snapshot,
            transitions: transition.into_iter().collect(),
        })
    }

    /// Clear all links, e.g. when the engine stops.
    pub fn clear(&self) -> Arc<HealthSnapshot> {
        let (next, ()) = self.mutate(BTreeMap::clear);
        next
    }

    /// Clone-and-swap helper. The closure edits the cloned map; the new
    /// snapshot gets the next version and replaces the old one atomically.
    fn mutate<T>(&self, f: impl FnOnce(&mut BTreeMap<IfIndex, LinkEntry>) -> T) -> (Arc<HealthSnapshot>, T) {
        let mut guard = self.snapshot.write();
        let mut links = guard.links.clone();
        let out = f(&mut links);
        let next = Arc::new(HealthSnapshot {
            version: guard.version + 1,
            links,
        });
        *guard = Arc::clone(&next);
        (next, out)
    }
}

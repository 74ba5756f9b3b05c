//! The engine: owns every subsystem and runs the loops that connect them.
//!
//! Three long-lived tasks do the work. The outbound pump reads units from the
//! virtual adapter and dispatches them through the flow table; the inbound
//! pump demuxes units arriving on any physical link back to the adapter; the
//! maintenance task multiplexes probe sweeps, flow-table sweeps, the stats
//! window and hotplug rescans over one `select!` loop.
//!
//! The control plane talks to the engine through `start`/`stop`/`reset`, the
//! admin operations, and a broadcast stream of [`EngineEvent`]s. Everything is
//! callable from any task; operations that need a Running engine say so with
//! [`Error::NotRunning`] instead of blocking.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::adapter::{
    inbound_channel, InboundReceiver, InboundSender, InboundUnit, LinkProvider, LinkTransport,
    VirtualAdapter,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::flow::{Flow, FlowKey, FlowTable, PacketView, ServiceClass};
use crate::metrics::{StatsRegistry, StatsSnapshot};
use crate::policy::{PolicyEngine, PolicyMode};
use crate::probe::{HealthProber, Pinger, UdpPinger};
use crate::registry::{
    diff_links, scan_links, DiscoveredLink, HealthSnapshot, LinkEntry, LinkRegistry,
    SnapshotUpdate,
};
use crate::types::{AdminState, EngineState, IfIndex, LinkKind, LinkState};

/// Event buffer per subscriber; slow consumers lag rather than block.
const EVENT_QUEUE: usize = 256;

/// Cadence of the stats window tick and the idle-flow sweep.
const FLOW_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle and link-state notifications for control-plane subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Started,
    Stopped,
    LinkStateChanged {
        index: IfIndex,
        from: LinkState,
        to: LinkState,
    },
    LinkDiscovered {
        index: IfIndex,
        name: String,
    },
    LinkRemoved {
        index: IfIndex,
    },
    /// Flows were forced off a link that became unusable.
    FailoverExecuted {
        index: IfIndex,
        moved: usize,
        evicted: usize,
    },
    ModeChanged {
        from: PolicyMode,
        to: PolicyMode,
    },
    OutageStarted,
    OutageCleared,
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "engine started"),
            Self::Stopped => write!(f, "engine stopped"),
            Self::LinkStateChanged { index, from, to } => {
                write!(f, "link {index}: {from} -> {to}")
            }
            Self::LinkDiscovered { index, name } => write!(f, "link {index} ({name}) added"),
            Self::LinkRemoved { index } => write!(f, "link {index} removed"),
            Self::FailoverExecuted {
                index,
                moved,
                evicted,
            } => write!(f, "failover from link {index}: {moved} moved, {evicted} evicted"),
            Self::ModeChanged { from, to } => write!(f, "mode {from} -> {to}"),
            Self::OutageStarted => write!(f, "total outage: no usable link"),
            Self::OutageCleared => write!(f, "outage cleared"),
        }
    }
}

/// What `stop` actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// The engine was already stopped (or mid-stop); nothing to do.
    AlreadyStopped,
}

/// Control-plane view of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub state: EngineState,
    /// Name of the virtual adapter the engine fronts.
    pub adapter: String,
    pub mode: PolicyMode,
    #[serde(with = "humantime_serde")]
    pub uptime: Duration,
    pub links_total: usize,
    pub links_usable: usize,
    pub flows: usize,
    pub total_outage: bool,
    /// Failure cause when the state is Failed.
    pub failure: Option<String>,
}

/// Aggregate traffic counters plus flow-table context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    #[serde(flatten)]
    pub traffic: StatsSnapshot,
    pub flows: usize,
    pub flow_classes: BTreeMap<ServiceClass, usize>,
}

/// The multi-path engine.
///
/// Construction wires the subsystems together but starts nothing; `start`
/// acquires the adapter, seeds the link set and spawns the loops. The engine
/// is shared behind an `Arc` so background tasks and the control plane see
/// the same instance.
pub struct Engine {
    config: Config,
    state: RwLock<EngineState>,
    failure: RwLock<Option<String>>,

    registry: Arc<LinkRegistry>,
    policy: Arc<PolicyEngine>,
    flows: Arc<FlowTable>,
    stats: Arc<StatsRegistry>,
    prober: HealthProber,

    adapter: Arc<dyn VirtualAdapter>,
    provider: Arc<dyn LinkProvider>,
    links: DashMap<IfIndex, Arc<dyn LinkTransport>>,
    /// Sender cloned into every link transport; fresh per run.
    inbound_tx: RwLock<Option<InboundSender>>,

    event_tx: broadcast::Sender<EngineEvent>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Latched while no usable link exists, so the outage is visible in
    /// status between probe cycles.
    outage: AtomicBool,
}

impl Engine {
    /// Build an engine around an adapter and a link provider, probing with
    /// the real UDP pinger.
    pub fn new(
        config: Config,
        adapter: Arc<dyn VirtualAdapter>,
        provider: Arc<dyn LinkProvider>,
    ) -> Arc<Self> {
        Self::with_pinger(config, adapter, provider, Arc::new(UdpPinger))
    }

    /// Same as [`Engine::new`] with the pinger swapped, for scripted probes.
    pub fn with_pinger(
        config: Config,
        adapter: Arc<dyn VirtualAdapter>,
        provider: Arc<dyn LinkProvider>,
        pinger: Arc<dyn Pinger>,
    ) -> Arc<Self> {
        let registry = Arc::new(LinkRegistry::new());
        let stats = Arc::new(StatsRegistry::new());
        let policy = Arc::new(PolicyEngine::new(config.policy.mode));
        let flows = Arc::new(FlowTable::new(config.flows.clone(), Arc::clone(&policy)));
        let prober = HealthProber::new(
            config.probe.clone(),
            pinger,
            Arc::clone(&registry),
            Arc::clone(&stats),
        );
        let (event_tx, _) = broadcast::channel(EVENT_QUEUE);
        let (shutdown, _) = broadcast::channel(1);

        Arc::new(Self {
            config,
            state: RwLock::new(EngineState::Stopped),
            failure: RwLock::new(None),
            registry,
            policy,
            flows,
            stats,
            prober,
            adapter,
            provider,
            links: DashMap::new(),
            inbound_tx: RwLock::new(None),
            event_tx,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            outage: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    pub fn mode(&self) -> PolicyMode {
        self.policy.mode()
    }

    /// Subscribe to lifecycle and link-state events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    /// Change the routing mode. Applies to subsequent decisions only;
    /// already-pinned flows keep their link.
    pub fn set_mode(&self, mode: PolicyMode) {
        let previous = self.policy.set_mode(mode);
        if previous != mode {
            self.publish(EngineEvent::ModeChanged {
                from: previous,
                to: mode,
            });
        }
    }

    /// Bring the engine up: validate config, acquire the adapter, seed the
    /// link set, spawn the loops.
    ///
    /// A validation or adapter failure leaves the engine Failed; it must be
    /// reset (or stopped) before another attempt. The engine never retries
    /// starting on its own.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write();
            match *state {
                EngineState::Stopped => {}
                EngineState::Failed => {
                    let reason = self.failure.read().clone().unwrap_or_default();
                    return Err(Error::FailedState(reason));
                }
                _ => return Err(Error::AlreadyRunning),
            }
            *state = EngineState::Starting;
        }
        info!(
            adapter = %self.adapter.name(),
            mode = %self.policy.mode(),
            "engine starting"
        );

        let inbound_rx = match self.initialize().await {
            Ok(rx) => rx,
            Err(e) => {
                self.enter_failed(e.to_string());
                return Err(e);
            }
        };

        self.seed_links().await;
        self.spawn_loops(inbound_rx);

        *self.state.write() = EngineState::Running;
        self.publish(EngineEvent::Started);
        // An empty or all-Down seed is an outage from the first moment,
        // not from the first probe cycle or dropped unit.
        let snapshot = self.registry.current();
        self.refresh_outage(&snapshot);
        info!(links = snapshot.len(), "engine running");
        Ok(())
    }

    /// The part of startup that can fail the engine.
    async fn initialize(&self) -> Result<InboundReceiver> {
        self.config.validate()?;
        self.adapter.open().await?;
        self.stats.reset();
        self.outage.store(false, Ordering::Relaxed);

        let (tx, rx) = inbound_channel();
        *self.inbound_tx.write() = Some(tx);
        Ok(rx)
    }

    /// Populate the registry before the loops start: one scan when discovery
    /// is on, plus any configured links the scan missed. Individual link
    /// failures are logged and skipped; startup proceeds with what opened.
    async fn seed_links(&self) {
        let mut seeded: Vec<DiscoveredLink> = Vec::new();

        if self.config.discovery.enabled {
            match scan_links(&self.config.discovery) {
                Ok(scan) => seeded = scan,
                Err(e) => {
                    warn!(error = %e, "interface scan failed, starting without discovered links");
                }
            }
        }

        for over in &self.config.links {
            if seeded.iter().any(|d| d.name == over.name) {
                continue;
            }
            let Some(index) = crate::util::if_nametoindex(&over.name) else {
                warn!(link = %over.name, "configured link not present, skipping");
                continue;
            };
            seeded.push(DiscoveredLink {
                index: IfIndex::new(index),
                name: over.name.clone(),
                kind: over
                    .kind
                    .unwrap_or_else(|| crate::util::guess_link_kind(&over.name)),
                oper_up: true,
            });
        }

        for link in seeded {
            if let Err(e) = self
                .register_link(link.index, &link.name, link.kind, link.initial_state())
                .await
            {
                warn!(link = %link.name, error = %e, "could not open link at startup");
            }
        }
    }

    /// Stop the engine and release everything it holds. Idempotent: stopping
    /// a stopped (or mid-stop) engine reports [`StopOutcome::AlreadyStopped`].
    /// A Failed engine may be stopped; that clears the failure.
    pub async fn stop(&self) -> Result<StopOutcome> {
        {
            let mut state = self.state.write();
            match *state {
                EngineState::Stopped | EngineState::Stopping => {
                    return Ok(StopOutcome::AlreadyStopped)
                }
                _ => *state = EngineState::Stopping,
            }
        }
        info!("engine stopping");

        self.teardown().await;

        *self.state.write() = EngineState::Stopped;
        *self.failure.write() = None;
        self.publish(EngineEvent::Stopped);
        info!("engine stopped");
        Ok(StopOutcome::Stopped)
    }

    /// Clear a Failed engine back to Stopped. Also valid on a Stopped engine,
    /// where it just resets counters.
    pub async fn reset(&self) -> Result<()> {
        match self.state() {
            EngineState::Stopped | EngineState::Failed => {}
            _ => return Err(Error::AlreadyRunning),
        }

        self.teardown().await;
        *self.state.write() = EngineState::Stopped;
        *self.failure.write() = None;
        self.stats.reset();
        info!("engine reset");
        Ok(())
    }

    /// Cooperative shutdown: close the adapter so the outbound pump drains,
    /// signal the loops, wait for them, then drop all shared state.
    async fn teardown(&self) {
        if let Err(e) = self.adapter.close().await {
            debug!(error = %e, "adapter close reported an error");
        }
        let _ = self.shutdown.send(());

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for result in join_all(tasks).await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    warn!(error = %e, "engine task ended abnormally");
                }
            }
        }

        *self.inbound_tx.write() = None;
        self.flows.clear();
        self.links.clear();
        self.registry.clear();
        self.outage.store(false, Ordering::Relaxed);
    }

    /// Control-plane status summary.
    pub fn status(&self) -> EngineStatus {
        let snapshot = self.registry.current();
        let state = self.state();
        EngineStatus {
            state,
            adapter: self.adapter.name().to_string(),
            mode: self.policy.mode(),
            uptime: if state.is_active() {
                self.stats.uptime()
            } else {
                Duration::ZERO
            },
            links_total: snapshot.len(),
            links_usable: snapshot.eligible_count(),
            flows: self.flows.len(),
            total_outage: self.outage.load(Ordering::Relaxed),
            failure: self.failure.read().clone(),
        }
    }

    /// Aggregate counters plus per-class flow counts.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            traffic: self.stats.snapshot(),
            flows: self.flows.len(),
            flow_classes: self.flows.class_counts(),
        }
    }

    /// Every known link, in index order. Valid in any state.
    pub fn list_interfaces(&self) -> Vec<LinkEntry> {
        self.registry.current().links.values().cloned().collect()
    }

    /// Register a link by hand, outside the discovery flow.
    pub async fn add_interface(&self, index: IfIndex, name: &str, kind: LinkKind) -> Result<()> {
        self.ensure_running()?;
        if self.registry.current().contains(index) {
            return Err(Error::InvalidConfig(format!(
                "link {index} is already registered"
            )));
        }
        self.register_link(index, name, kind, LinkState::Degraded)
            .await
    }

    /// Drop a link entirely. Its pinned flows fail over immediately.
    pub fn remove_interface(&self, index: IfIndex) -> Result<()> {
        self.ensure_running()?;
        self.unregister_link(index)
    }

    /// Administratively enable or disable a link. Disabling drains its flows
    /// through the rebalance path.
    pub fn set_interface_enabled(&self, index: IfIndex, enabled: bool) -> Result<()> {
        self.ensure_running()?;
        let admin = if enabled {
            AdminState::Enabled
        } else {
            AdminState::Disabled
        };
        let snapshot = self.registry.set_admin(index, admin)?;

        if !enabled {
            let report = self.flows.drain_link(&snapshot, index);
            if report.affected() > 0 {
                self.publish(EngineEvent::FailoverExecuted {
                    index,
                    moved: report.moved,
                    evicted: report.evicted,
                });
            }
        }
        self.refresh_outage(&snapshot);
        Ok(())
    }

    /// Open a transport for the link, then make it visible to routing. The
    /// transport comes first so a link never enters the snapshot unsendable.
    async fn register_link(
        &self,
        index: IfIndex,
        name: &str,
        kind: LinkKind,
        initial: LinkState,
    ) -> Result<()> {
        let mut entry = LinkEntry::new(index, name, kind).with_state(initial);
        if let Some(over) = self.config.link_override(name) {
            if let Some(kind) = over.kind {
                entry.kind = kind;
                entry.weight = kind.base_weight();
            }
            if let Some(weight) = over.weight {
                entry = entry.with_weight(weight);
            }
            if !over.enabled {
                entry = entry.with_admin(AdminState::Disabled);
            }
        }

        let Some(tx) = self.inbound_tx.read().clone() else {
            return Err(Error::NotRunning(self.state()));
        };
        let transport = self.provider.open(index, name, tx).await?;
        self.links.insert(index, transport);

        let snapshot = self.registry.register(entry);
        self.publish(EngineEvent::LinkDiscovered {
            index,
            name: name.to_string(),
        });
        self.refresh_outage(&snapshot);
        Ok(())
    }

    /// Remove a link from every plane and fail its flows over.
    fn unregister_link(&self, index: IfIndex) -> Result<()> {
        let snapshot = self.registry.remove(index)?;
        self.links.remove(&index);

        let report = self.flows.reassign_for_down(&snapshot, index);
        if report.affected() > 0 {
            self.publish(EngineEvent::FailoverExecuted {
                index,
                moved: report.moved,
                evicted: report.evicted,
            });
        }

        self.stats.remove_link(index);
        self.policy.forget(index);
        self.publish(EngineEvent::LinkRemoved { index });
        self.refresh_outage(&snapshot);
        Ok(())
    }

    /// One outbound unit: parse, pin, send. Failures never propagate past
    /// here; they end in counters.
    async fn handle_outbound(&self, data: Vec<u8>) {
        self.stats.on_outbound_received(data.len() as u64);

        let (key, teardown) = match PacketView::parse(&data) {
            Ok(packet) => (packet.flow_key(), packet.is_teardown()),
            Err(e) => {
                trace!(error = %e, "unparseable outbound unit, dropping");
                self.stats.on_drop();
                return;
            }
        };

        let snapshot = self.registry.current();
        let flow = match self.flows.assign(&snapshot, key) {
            Ok(flow) => flow,
            Err(e) => {
                self.count_drop(&e, key);
                return;
            }
        };
        // A committed decision is proof the outage is over.
        if self.outage.load(Ordering::Relaxed) {
            self.set_outage(false);
        }

        if let Err(e) = self.dispatch(flow, key, &data).await {
            self.count_drop(&e, key);
        }
        if teardown {
            self.flows.note_teardown(&key);
        }
    }

    /// Send one unit on the flow's pinned link, with the single-retry rule:
    /// a transient failure gets one more send on the same pin; an unavailable
    /// link is forced Down and the unit gets one send on the replacement pin.
    /// Any second failure is the caller's drop.
    async fn dispatch(&self, flow: Arc<Flow>, key: FlowKey, data: &[u8]) -> Result<()> {
        let index = flow.pinned();
        let first = match self.send_on(index, data).await {
            Ok(()) => {
                self.note_forwarded(&flow, index, data.len());
                return Ok(());
            }
            Err(e) => e,
        };

        self.stats.on_retry();
        let (flow, index) = if first.is_transient() {
            trace!(flow = %key, link = %index, error = %first, "send failed, retrying once");
            (flow, index)
        } else if let Some(bad) = first.routes_around() {
            warn!(flow = %key, link = %bad, error = %first, "link failed mid-send, forcing down");
            let snapshot = self.force_down(bad);
            let flow = self.flows.assign(&snapshot, key)?;
            let index = flow.pinned();
            (flow, index)
        } else {
            return Err(first);
        };

        self.send_on(index, data).await?;
        self.note_forwarded(&flow, index, data.len());
        Ok(())
    }

    fn note_forwarded(&self, flow: &Flow, index: IfIndex, len: usize) {
        self.stats.on_outbound_forwarded(index, len as u64);
        flow.note_outbound(len);
    }

    /// Bounded send through one link's transport.
    async fn send_on(&self, index: IfIndex, data: &[u8]) -> Result<()> {
        let transport = self
            .links
            .get(&index)
            .map(|t| Arc::clone(t.value()))
            .ok_or(Error::UnknownLink(index))?;

        match tokio::time::timeout(self.config.adapter.send_timeout, transport.send(data)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Transient {
                index,
                reason: "send timed out".into(),
            }),
        }
    }

    /// Force a link Down outside the probe cadence and fail its flows over.
    /// Returns the snapshot to re-pin against.
    fn force_down(&self, index: IfIndex) -> Arc<HealthSnapshot> {
        match self.registry.mark_down(index) {
            Some(update) => {
                let snapshot = Arc::clone(&update.snapshot);
                self.apply_update(&update);
                // Stragglers can still be pinned to a link that was
                // already Down; apply_update only drains on a transition.
                let report = self.flows.reassign_for_down(&snapshot, index);
                if report.affected() > 0 {
                    self.publish(EngineEvent::FailoverExecuted {
                        index,
                        moved: report.moved,
                        evicted: report.evicted,
                    });
                }
                snapshot
            }
            None => {
                // Never registered; drop the orphaned transport if any.
                self.links.remove(&index);
                self.registry.current()
            }
        }
    }

    fn count_drop(&self, err: &Error, key: FlowKey) {
        self.stats.on_drop();
        if err.is_outage() {
            self.set_outage(true);
            trace!(flow = %key, "no usable link, unit dropped");
        } else {
            debug!(flow = %key, error = %err, "unit dropped");
        }
    }

    /// One inbound unit: link-agnostic demux back to the adapter. A reply on
    /// a different link than the flow's pin is still the flow's traffic.
    async fn handle_inbound(&self, unit: InboundUnit) {
        let InboundUnit { index, data } = unit;
        self.stats.on_inbound_received(index, data.len() as u64);

        let (key, teardown) = match PacketView::parse(&data) {
            Ok(packet) => (packet.reverse_key(), packet.is_teardown()),
            Err(e) => {
                trace!(link = %index, error = %e, "unparseable inbound unit, dropping");
                self.stats.on_drop();
                return;
            }
        };

        match self.flows.lookup(&key) {
            Some(flow) => flow.note_inbound(data.len()),
            None if self.flows.accept_unsolicited() => {
                // Track the new flow when a link is available; deliver
                // either way.
                let snapshot = self.registry.current();
                match self.flows.assign(&snapshot, key) {
                    Ok(flow) => flow.note_inbound(data.len()),
                    Err(e) => trace!(flow = %key, error = %e, "inbound flow not tracked"),
                }
            }
            None => {
                debug!(flow = %key, link = %index, "unsolicited unit dropped");
                self.stats.on_drop();
                return;
            }
        }

        let len = data.len() as u64;
        match self.adapter.deliver_inbound(data).await {
            Ok(()) => self.stats.on_inbound_delivered(len),
            Err(e) => {
                debug!(error = %e, "inbound delivery failed");
                self.stats.on_drop();
            }
        }
        if teardown {
            self.flows.note_teardown(&key);
        }
    }

    fn spawn_loops(self: &Arc<Self>, inbound_rx: InboundReceiver) {
        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_outbound_pump());
        tasks.push(self.spawn_inbound_pump(inbound_rx));
        tasks.push(self.spawn_maintenance());
    }

    fn spawn_outbound_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    unit = engine.adapter.next_outbound() => match unit {
                        Ok(Some(data)) => engine.handle_outbound(data).await,
                        Ok(None) => {
                            debug!("virtual adapter closed, outbound pump exiting");
                            break;
                        }
                        Err(e) => {
                            engine.enter_failed(format!("virtual adapter read failed: {e}"));
                            break;
                        }
                    },
                }
            }
        })
    }

    fn spawn_inbound_pump(self: &Arc<Self>, mut inbound_rx: InboundReceiver) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    unit = inbound_rx.recv() => match unit {
                        Some(unit) => engine.handle_inbound(unit).await,
                        None => break,
                    },
                }
            }
        })
    }

    /// One task multiplexes every periodic duty, so shutdown has a single
    /// subscription to watch.
    fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut probe = tokio::time::interval(engine.prober.config().interval);
            probe.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let mut sweep = tokio::time::interval(FLOW_SWEEP_INTERVAL);

            // Reports and rescans skip the immediate first tick; there is
            // nothing to report yet and startup already seeded the links.
            let report_every = engine.config.stats.report_interval;
            let mut report =
                tokio::time::interval_at(tokio::time::Instant::now() + report_every, report_every);

            let rescan_every = engine.config.discovery.poll_interval;
            let mut rescan =
                tokio::time::interval_at(tokio::time::Instant::now() + rescan_every, rescan_every);
            rescan.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let hotplug = engine.config.discovery.enabled;

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = probe.tick() => engine.run_probe_cycle().await,
                    _ = sweep.tick() => {
                        engine.stats.tick();
                        engine.flows.evict_idle(Instant::now());
                    }
                    _ = report.tick() => engine.log_report(),
                    _ = rescan.tick(), if hotplug => engine.run_discovery_cycle().await,
                }
            }
        })
    }

    /// One probe sweep: refresh the snapshot, fail over off links that went
    /// Down, fold usable-link latency into the aggregate estimate.
    async fn run_probe_cycle(&self) {
        let update = self.prober.sweep_once().await;
        self.apply_update(&update);

        let latencies: Vec<Duration> = update
            .snapshot
            .eligible()
            .filter_map(|e| e.metrics.latency)
            .collect();
        if !latencies.is_empty() {
            let total: Duration = latencies.iter().sum();
            self.stats.note_latency(total / latencies.len() as u32);
        }
    }

    /// React to a snapshot change: publish transitions, move flows off links
    /// that went Down, re-evaluate the outage latch. Reassignment happens
    /// here, synchronously with the transition, not on some later tick.
    fn apply_update(&self, update: &SnapshotUpdate) {
        for t in &update.transitions {
            self.publish(EngineEvent::LinkStateChanged {
                index: t.index,
                from: t.from,
                to: t.to,
            });
        }

        for index in update.lost_links() {
            let report = self.flows.reassign_for_down(&update.snapshot, index);
            if report.affected() > 0 {
                self.publish(EngineEvent::FailoverExecuted {
                    index,
                    moved: report.moved,
                    evicted: report.evicted,
                });
            }
        }

        self.refresh_outage(&update.snapshot);
    }

    /// Diff the kernel's interface list against the registry; open links
    /// that appeared, retire links that vanished.
    async fn run_discovery_cycle(&self) {
        let scan = match scan_links(&self.config.discovery) {
            Ok(scan) => scan,
            Err(e) => {
                debug!(error = %e, "interface scan failed");
                return;
            }
        };

        let snapshot = self.registry.current();
        let (added, removed) = diff_links(&scan, &snapshot);

        for link in added {
            if let Err(e) = self
                .register_link(link.index, &link.name, link.kind, link.initial_state())
                .await
            {
                warn!(link = %link.name, error = %e, "could not open discovered link");
            }
        }

        for index in removed {
            info!(%index, "link vanished");
            if let Err(e) = self.unregister_link(index) {
                debug!(%index, error = %e, "link already gone");
            }
        }
    }

    fn log_report(&self) {
        let traffic = self.stats.snapshot();
        let snapshot = self.registry.current();
        info!(
            uptime = %crate::util::format_duration(traffic.uptime),
            forwarded = traffic.packets_forwarded,
            dropped = traffic.packets_dropped,
            retried = traffic.packets_retried,
            bandwidth = %traffic.bandwidth,
            links = snapshot.len(),
            usable = snapshot.eligible_count(),
            flows = self.flows.len(),
            "traffic report"
        );
    }

    /// Re-evaluate the outage latch against a snapshot.
    fn refresh_outage(&self, snapshot: &HealthSnapshot) {
        self.set_outage(snapshot.eligible_count() == 0);
    }

    fn set_outage(&self, outage: bool) {
        let was = self.outage.swap(outage, Ordering::Relaxed);
        if outage && !was {
            warn!("total outage: no usable link");
            self.publish(EngineEvent::OutageStarted);
        } else if !outage && was {
            info!("outage cleared");
            self.publish(EngineEvent::OutageCleared);
        }
    }

    fn ensure_running(&self) -> Result<()> {
        let state = self.state();
        if state.is_running() {
            Ok(())
        } else {
            Err(Error::NotRunning(state))
        }
    }

    fn enter_failed(&self, reason: String) {
        error!(%reason, "engine entered failed state");
        *self.failure.write() = Some(reason);
        *self.state.write() = EngineState::Failed;
    }

    fn publish(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("mode", &self.mode())
            .field("links", &self.links.len())
            .field("flows", &self.flows.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterHandle, ChannelAdapter, MemoryLinks};
    use crate::probe::ScriptedPinger;
    use crate::registry::ProbeReport;
    use crate::types::LinkMetrics;

    struct Rig {
        engine: Arc<Engine>,
        handle: AdapterHandle,
        links: Arc<MemoryLinks>,
        pinger: Arc<ScriptedPinger>,
    }

    fn rig_config(mode: PolicyMode) -> Config {
        let mut config = Config::default();
        config.policy.mode = mode;
        config.discovery.enabled = false;
        // Sweeps are driven by hand in tests.
        config.probe.interval = Duration::from_secs(3600);
        config.probe.targets = vec!["192.0.2.1:53".into()];
        config
    }

    fn rig(mode: PolicyMode) -> Rig {
        rig_with(rig_config(mode))
    }

    fn rig_with(config: Config) -> Rig {
        let (adapter, handle) = ChannelAdapter::pair(&config.adapter.name, config.adapter.mtu);
        let links = Arc::new(MemoryLinks::new());
        let pinger = Arc::new(ScriptedPinger::new());
        let engine = Engine::with_pinger(
            config,
            adapter,
            Arc::clone(&links) as Arc<dyn LinkProvider>,
            Arc::clone(&pinger) as Arc<dyn Pinger>,
        );
        Rig {
            engine,
            handle,
            links,
            pinger,
        }
    }

    async fn add_links(rig: &Rig, count: u32) {
        for i in 1..=count {
            rig.engine
                .add_interface(IfIndex::new(i), &format!("eth{}", i - 1), LinkKind::Wired)
                .await
                .unwrap();
        }
    }

    fn tcp_unit(src_port: u16, dst_port: u16, flags: u8) -> Vec<u8> {
        let mut p = vec![
            0x45, 0x00, 0x00, 0x28, 0x00, 0x01, 0x00, 0x00, 0x40, 6, 0x00, 0x00, 10, 0, 0, 5, 93,
            184, 216, 34,
        ];
        p.extend_from_slice(&src_port.to_be_bytes());
        p.extend_from_slice(&dst_port.to_be_bytes());
        p.extend_from_slice(&[0; 8]);
        p.extend_from_slice(&[0x50, flags, 0x00, 0x00]);
        p.extend_from_slice(&[0; 4]);
        p
    }

    /// The reply direction of [`tcp_unit`]: src and dst swapped.
    fn tcp_reply(src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut p = vec![
            0x45, 0x00, 0x00, 0x28, 0x00, 0x01, 0x00, 0x00, 0x40, 6, 0x00, 0x00, 93, 184, 216,
            34, 10, 0, 0, 5,
        ];
        p.extend_from_slice(&dst_port.to_be_bytes());
        p.extend_from_slice(&src_port.to_be_bytes());
        p.extend_from_slice(&[0; 8]);
        p.extend_from_slice(&[0x50, 0x10, 0x00, 0x00]);
        p.extend_from_slice(&[0; 4]);
        p
    }

    fn drain_events(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let rig = rig(PolicyMode::Balanced);
        let mut events = rig.engine.subscribe();

        assert_eq!(rig.engine.state(), EngineState::Stopped);
        rig.engine.start().await.unwrap();
        assert_eq!(rig.engine.state(), EngineState::Running);

        assert_eq!(rig.engine.stop().await.unwrap(), StopOutcome::Stopped);
        assert_eq!(rig.engine.state(), EngineState::Stopped);
        assert_eq!(
            rig.engine.stop().await.unwrap(),
            StopOutcome::AlreadyStopped
        );

        let events = drain_events(&mut events);
        assert!(events.contains(&EngineEvent::Started));
        assert!(events.contains(&EngineEvent::Stopped));

        // The adapter can be reacquired after a stop.
        rig.engine.start().await.unwrap();
        assert_eq!(rig.engine.state(), EngineState::Running);
        rig.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_is_an_error() {
        let rig = rig(PolicyMode::Balanced);
        rig.engine.start().await.unwrap();
        assert!(matches!(
            rig.engine.start().await,
            Err(Error::AlreadyRunning)
        ));
        rig.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_fails_start_until_reset() {
        let mut config = rig_config(PolicyMode::Balanced);
        config.adapter.mtu = 100;
        let rig = rig_with(config);

        assert!(rig.engine.start().await.is_err());
        assert_eq!(rig.engine.state(), EngineState::Failed);
        assert!(rig.engine.status().failure.is_some());

        // Failed stays failed until an explicit reset.
        assert!(matches!(
            rig.engine.start().await,
            Err(Error::FailedState(_))
        ));

        rig.engine.reset().await.unwrap();
        assert_eq!(rig.engine.state(), EngineState::Stopped);
        assert!(rig.engine.status().failure.is_none());
    }

    #[tokio::test]
    async fn test_admin_ops_require_running() {
        let rig = rig(PolicyMode::Balanced);
        assert!(matches!(
            rig.engine
                .add_interface(IfIndex::new(1), "eth0", LinkKind::Wired)
                .await,
            Err(Error::NotRunning(EngineState::Stopped))
        ));
        assert!(matches!(
            rig.engine.remove_interface(IfIndex::new(1)),
            Err(Error::NotRunning(_))
        ));
        assert!(matches!(
            rig.engine.set_interface_enabled(IfIndex::new(1), false),
            Err(Error::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_forwarding_pins_flows() {
        let rig = rig(PolicyMode::RoundRobin);
        rig.engine.start().await.unwrap();
        add_links(&rig, 2).await;

        // Two units of one flow, one unit of another.
        rig.engine.handle_outbound(tcp_unit(40000, 443, 0x02)).await;
        rig.engine.handle_outbound(tcp_unit(40000, 443, 0x10)).await;
        rig.engine.handle_outbound(tcp_unit(40001, 443, 0x02)).await;

        assert_eq!(rig.engine.stats().traffic.packets_forwarded, 3);
        assert_eq!(rig.engine.stats().flows, 2);

        // Flow affinity: the repeated flow went out one link both times.
        let a = rig.links.sent_count(IfIndex::new(1));
        let b = rig.links.sent_count(IfIndex::new(2));
        assert_eq!(a + b, 3);
        assert_eq!(a.max(b), 2);
        assert_eq!(a.min(b), 1);

        rig.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_outbound_pump_end_to_end() {
        let rig = rig(PolicyMode::Balanced);
        rig.engine.start().await.unwrap();
        add_links(&rig, 1).await;

        rig.handle
            .send_outbound(tcp_unit(40000, 443, 0x02))
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while rig.links.total_sent() < 1 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(rig.links.total_sent(), 1);
        assert_eq!(rig.engine.stats().traffic.packets_forwarded, 1);

        rig.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_inbound_demux_to_adapter() {
        let mut rig = rig(PolicyMode::Balanced);
        rig.engine.start().await.unwrap();
        add_links(&rig, 2).await;

        rig.engine.handle_outbound(tcp_unit(40000, 443, 0x02)).await;

        // The reply arrives on the other link; demux is link-agnostic.
        rig.engine
            .handle_inbound(InboundUnit {
                index: IfIndex::new(2),
                data: tcp_reply(40000, 443),
            })
            .await;

        assert!(rig.handle.try_recv_inbound().is_some());
        assert_eq!(rig.engine.stats().flows, 1);
        assert_eq!(rig.engine.stats().traffic.packets_dropped, 0);

        rig.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsolicited_inbound_honors_config() {
        let mut config = rig_config(PolicyMode::Balanced);
        config.flows.accept_unsolicited = false;
        let mut rig = rig_with(config);
        rig.engine.start().await.unwrap();
        add_links(&rig, 1).await;

        rig.engine
            .handle_inbound(InboundUnit {
                index: IfIndex::new(1),
                data: tcp_reply(40000, 443),
            })
            .await;
        assert!(rig.handle.try_recv_inbound().is_none());
        assert_eq!(rig.engine.stats().traffic.packets_dropped, 1);
        rig.engine.stop().await.unwrap();

        let mut rig = self::rig(PolicyMode::Balanced);
        rig.engine.start().await.unwrap();
        add_links(&rig, 1).await;
        rig.engine
            .handle_inbound(InboundUnit {
                index: IfIndex::new(1),
                data: tcp_reply(40000, 443),
            })
            .await;
        assert!(rig.handle.try_recv_inbound().is_some());
        assert_eq!(rig.engine.stats().flows, 1);
        rig.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failure_retries_same_link() {
        let rig = rig(PolicyMode::Balanced);
        rig.engine.start().await.unwrap();
        add_links(&rig, 1).await;

        rig.links.link(IfIndex::new(1)).unwrap().fail_next(1);
        rig.engine.handle_outbound(tcp_unit(40000, 443, 0x02)).await;

        let traffic = rig.engine.stats().traffic;
        assert_eq!(traffic.packets_retried, 1);
        assert_eq!(traffic.packets_forwarded, 1);
        assert_eq!(traffic.packets_dropped, 0);
        assert_eq!(rig.links.sent_count(IfIndex::new(1)), 1);

        rig.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_link_forces_down_and_flow_moves() {
        let rig = rig(PolicyMode::LatencyBased);
        rig.engine.start().await.unwrap();
        add_links(&rig, 2).await;
        let mut events = rig.engine.subscribe();

        // Both links tie on metrics, so the pin lands on the lower index.
        rig.links.link(IfIndex::new(1)).unwrap().set_dead(true);
        rig.engine.handle_outbound(tcp_unit(40000, 443, 0x02)).await;

        assert_eq!(rig.links.sent_count(IfIndex::new(2)), 1);
        assert_eq!(rig.engine.stats().traffic.packets_dropped, 0);

        let snapshot = rig.engine.registry.current();
        assert_eq!(
            snapshot.get(IfIndex::new(1)).unwrap().state,
            LinkState::Down
        );

        let events = drain_events(&mut events);
        assert!(events.contains(&EngineEvent::LinkStateChanged {
            index: IfIndex::new(1),
            from: LinkState::Degraded,
            to: LinkState::Down,
        }));
        assert!(events.contains(&EngineEvent::FailoverExecuted {
            index: IfIndex::new(1),
            moved: 1,
            evicted: 0,
        }));

        // Later units of the flow follow the new pin.
        rig.engine.handle_outbound(tcp_unit(40000, 443, 0x10)).await;
        assert_eq!(rig.links.sent_count(IfIndex::new(2)), 2);

        rig.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_pin_heals_on_next_send() {
        let rig = rig(PolicyMode::RoundRobin);
        rig.engine.start().await.unwrap();
        add_links(&rig, 2).await;

        // Link 1 goes Down and the drain for that transition runs while
        // the table is still empty.
        let stale = rig.engine.registry.current();
        let update = rig.engine.registry.apply_reports(vec![ProbeReport {
            index: IfIndex::new(1),
            state: LinkState::Down,
            metrics: LinkMetrics::default(),
        }]);
        rig.engine.apply_update(&update);
        rig.links.link(IfIndex::new(1)).unwrap().set_dead(true);

        // A flow then commits from the older view and lands on the dead
        // link after its only drain has come and gone.
        let key = PacketView::parse(&tcp_unit(40000, 443, 0x02))
            .unwrap()
            .flow_key();
        let flow = rig.engine.flows.assign(&stale, key).unwrap();
        assert_eq!(flow.pinned(), IfIndex::new(1));

        // The next unit must leave on the survivor, not burn both sends
        // against the dead pin.
        rig.engine.handle_outbound(tcp_unit(40000, 443, 0x10)).await;

        assert_eq!(rig.links.sent_count(IfIndex::new(2)), 1);
        assert_eq!(rig.engine.stats().traffic.packets_dropped, 0);
        assert_eq!(
            rig.engine.flows.lookup(&key).unwrap().pinned(),
            IfIndex::new(2)
        );

        rig.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_total_outage_drops_then_clears() {
        let rig = rig(PolicyMode::Balanced);
        rig.engine.start().await.unwrap();
        add_links(&rig, 1).await;
        let mut events = rig.engine.subscribe();

        rig.links.link(IfIndex::new(1)).unwrap().set_dead(true);
        rig.engine.handle_outbound(tcp_unit(40000, 443, 0x02)).await;
        rig.engine.handle_outbound(tcp_unit(40001, 443, 0x02)).await;

        // Both units counted as drops; the engine keeps running.
        assert_eq!(rig.engine.stats().traffic.packets_dropped, 2);
        assert_eq!(rig.engine.state(), EngineState::Running);
        assert!(rig.engine.status().total_outage);
        assert!(drain_events(&mut events).contains(&EngineEvent::OutageStarted));

        // A fresh usable link ends the outage.
        rig.engine
            .add_interface(IfIndex::new(2), "wlan0", LinkKind::Wireless)
            .await
            .unwrap();
        assert!(!rig.engine.status().total_outage);
        assert!(drain_events(&mut events).contains(&EngineEvent::OutageCleared));

        rig.engine.handle_outbound(tcp_unit(40000, 443, 0x10)).await;
        assert_eq!(rig.links.sent_count(IfIndex::new(2)), 1);

        rig.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_with_no_links_reports_outage() {
        let rig = rig(PolicyMode::Balanced);
        let mut events = rig.engine.subscribe();
        rig.engine.start().await.unwrap();

        // The latch is set before start returns, not on the first drop.
        assert_eq!(rig.engine.state(), EngineState::Running);
        assert!(rig.engine.status().total_outage);
        assert!(drain_events(&mut events).contains(&EngineEvent::OutageStarted));

        add_links(&rig, 1).await;
        assert!(!rig.engine.status().total_outage);
        assert!(drain_events(&mut events).contains(&EngineEvent::OutageCleared));

        rig.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_disable_drains_and_reenable_restores() {
        let rig = rig(PolicyMode::RoundRobin);
        rig.engine.start().await.unwrap();
        add_links(&rig, 2).await;

        rig.engine.handle_outbound(tcp_unit(40000, 443, 0x02)).await;
        rig.engine.handle_outbound(tcp_unit(40001, 443, 0x02)).await;
        assert_eq!(rig.engine.flows.flows_on(IfIndex::new(1)), 1);

        rig.engine
            .set_interface_enabled(IfIndex::new(1), false)
            .unwrap();
        assert_eq!(rig.engine.flows.flows_on(IfIndex::new(1)), 0);
        assert_eq!(rig.engine.flows.flows_on(IfIndex::new(2)), 2);

        // While disabled, everything lands on the survivor.
        rig.engine.handle_outbound(tcp_unit(40002, 443, 0x02)).await;
        assert_eq!(rig.engine.flows.flows_on(IfIndex::new(2)), 3);

        rig.engine
            .set_interface_enabled(IfIndex::new(1), true)
            .unwrap();
        let snapshot = rig.engine.registry.current();
        assert!(snapshot.is_eligible(IfIndex::new(1)));

        rig.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_interface_fails_over() {
        let rig = rig(PolicyMode::RoundRobin);
        rig.engine.start().await.unwrap();
        add_links(&rig, 2).await;
        let mut events = rig.engine.subscribe();

        rig.engine.handle_outbound(tcp_unit(40000, 443, 0x02)).await;
        rig.engine.handle_outbound(tcp_unit(40001, 443, 0x02)).await;

        rig.engine.remove_interface(IfIndex::new(1)).unwrap();
        assert_eq!(rig.engine.list_interfaces().len(), 1);
        assert_eq!(rig.engine.flows.flows_on(IfIndex::new(2)), 2);
        assert!(drain_events(&mut events)
            .contains(&EngineEvent::LinkRemoved { index: IfIndex::new(1) }));

        // Removing again reports the unknown index.
        assert!(matches!(
            rig.engine.remove_interface(IfIndex::new(1)),
            Err(Error::UnknownLink(_))
        ));

        rig.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_add_rejected() {
        let rig = rig(PolicyMode::Balanced);
        rig.engine.start().await.unwrap();
        add_links(&rig, 1).await;
        assert!(rig
            .engine
            .add_interface(IfIndex::new(1), "eth0", LinkKind::Wired)
            .await
            .is_err());
        rig.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_cycle_fails_over_down_link() {
        let rig = rig(PolicyMode::RoundRobin);
        rig.engine.start().await.unwrap();
        add_links(&rig, 2).await;

        rig.engine.handle_outbound(tcp_unit(40000, 443, 0x02)).await;
        rig.engine.handle_outbound(tcp_unit(40001, 443, 0x02)).await;
        assert_eq!(rig.engine.flows.flows_on(IfIndex::new(2)), 1);

        rig.pinger.always(IfIndex::new(1), Duration::from_millis(10));
        rig.pinger.never(IfIndex::new(2));

        // Hysteresis is two probes.
        rig.engine.run_probe_cycle().await;
        rig.engine.run_probe_cycle().await;

        let snapshot = rig.engine.registry.current();
        assert_eq!(snapshot.get(IfIndex::new(1)).unwrap().state, LinkState::Up);
        assert_eq!(
            snapshot.get(IfIndex::new(2)).unwrap().state,
            LinkState::Down
        );
        assert_eq!(rig.engine.flows.flows_on(IfIndex::new(2)), 0);
        assert_eq!(rig.engine.flows.flows_on(IfIndex::new(1)), 2);
        assert_eq!(rig.engine.status().links_usable, 1);

        // The sweep's latency feeds the aggregate estimate.
        let latency = rig.engine.stats().traffic.latency;
        assert!(latency.is_some());

        rig.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_set_mode_affects_new_flows_only() {
        let rig = rig(PolicyMode::RoundRobin);
        rig.engine.start().await.unwrap();
        add_links(&rig, 2).await;
        let mut events = rig.engine.subscribe();

        rig.pinger.always(IfIndex::new(1), Duration::from_millis(50));
        rig.pinger.always(IfIndex::new(2), Duration::from_millis(5));
        rig.engine.run_probe_cycle().await;
        rig.engine.run_probe_cycle().await;

        // Round robin starts at the first candidate.
        rig.engine.handle_outbound(tcp_unit(40000, 443, 0x02)).await;
        assert_eq!(rig.engine.flows.flows_on(IfIndex::new(1)), 1);

        rig.engine.set_mode(PolicyMode::LatencyBased);
        assert!(drain_events(&mut events).contains(&EngineEvent::ModeChanged {
            from: PolicyMode::RoundRobin,
            to: PolicyMode::LatencyBased,
        }));

        // The pinned flow stays; a new flow follows the new mode.
        rig.engine.handle_outbound(tcp_unit(40000, 443, 0x10)).await;
        assert_eq!(rig.engine.flows.flows_on(IfIndex::new(1)), 1);
        rig.engine.handle_outbound(tcp_unit(40001, 443, 0x02)).await;
        assert_eq!(rig.engine.flows.flows_on(IfIndex::new(2)), 1);

        rig.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_reflects_engine() {
        let rig = rig(PolicyMode::Balanced);
        let status = rig.engine.status();
        assert_eq!(status.state, EngineState::Stopped);
        assert_eq!(status.uptime, Duration::ZERO);
        assert_eq!(status.links_total, 0);

        rig.engine.start().await.unwrap();
        add_links(&rig, 2).await;

        let status = rig.engine.status();
        assert_eq!(status.state, EngineState::Running);
        assert_eq!(status.adapter, "weft0");
        assert_eq!(status.mode, PolicyMode::Balanced);
        assert_eq!(status.links_total, 2);
        assert_eq!(status.links_usable, 2);
        assert!(!status.total_outage);

        rig.engine.stop().await.unwrap();
        assert_eq!(rig.engine.status().links_total, 0);
    }

    #[tokio::test]
    async fn test_stop_clears_flow_table() {
        let rig = rig(PolicyMode::Balanced);
        rig.engine.start().await.unwrap();
        add_links(&rig, 1).await;
        rig.engine.handle_outbound(tcp_unit(40000, 443, 0x02)).await;
        assert_eq!(rig.engine.stats().flows, 1);

        rig.engine.stop().await.unwrap();
        assert_eq!(rig.engine.stats().flows, 0);
        assert!(rig.engine.list_interfaces().is_empty());
    }
}

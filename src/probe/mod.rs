//! Link health probing.
//!
//! Each enabled link gets a lightweight DNS round trip through that specific
//! device at a fixed cadence. Outcomes drive a small hysteresis machine: a
//! link is Up when the last K probes all succeeded, Down after K consecutive
//! failures, and Degraded in between or when smoothed latency crosses the
//! configured threshold. A wider sliding window feeds the reported loss rate
//! but never the classification, so one dropped probe cannot flap a link.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Error, Result};
use crate::metrics::StatsRegistry;
use crate::registry::{LinkEntry, LinkRegistry, ProbeReport, SnapshotUpdate};
use crate::types::{Bandwidth, IfIndex, LinkMetrics, LinkState};
use crate::util::parse_addr_with_default_port;

/// Probe targets used when none are configured.
pub const DEFAULT_PROBE_TARGETS: &[&str] = &["8.8.8.8:53", "1.1.1.1:53", "9.9.9.9:53"];

/// Health probing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Time between probe sweeps.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Timeout for a single probe round trip.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Probe destinations; a port defaults to 53 when omitted.
    #[serde(default = "default_targets")]
    pub targets: Vec<String>,

    /// Sliding window length for the reported loss rate.
    #[serde(default = "default_window")]
    pub window: usize,

    /// Consecutive probes needed to settle Up or Down.
    #[serde(default = "default_hysteresis")]
    pub hysteresis: u32,

    /// Smoothed latency above this marks the link Degraded.
    #[serde(default = "default_degraded_latency", with = "humantime_serde")]
    pub degraded_latency: Duration,
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_timeout() -> Duration {
    Duration::from_millis(500)
}
fn default_targets() -> Vec<String> {
    DEFAULT_PROBE_TARGETS.iter().map(|s| (*s).to_string()).collect()
}
fn default_window() -> usize {
    10
}
fn default_hysteresis() -> u32 {
    2
}
fn default_degraded_latency() -> Duration {
    Duration::from_millis(250)
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            timeout: default_timeout(),
            targets: default_targets(),
            window: default_window(),
            hysteresis: default_hysteresis(),
            degraded_latency: default_degraded_latency(),
        }
    }
}

/// Smoothed RTT with Jacobson/Karels gains.
#[derive(Debug, Default)]
pub struct RttEstimator {
    smoothed: Duration,
    var: Duration,
}

impl RttEstimator {
    pub fn record(&mut self, rtt: Duration) {
        if self.smoothed == Duration::ZERO {
            self.smoothed = rtt;
            self.var = rtt / 2;
        } else {
            let rtt_f = rtt.as_secs_f64();
            let srtt_f = self.smoothed.as_secs_f64();
            let var_f = self.var.as_secs_f64();

            let delta = (rtt_f - srtt_f).abs();
            self.var = Duration::from_secs_f64(var_f * 0.75 + delta * 0.25);
            self.smoothed = Duration::from_secs_f64(srtt_f * 0.875 + rtt_f * 0.125);
        }
    }

    pub fn smoothed(&self) -> Option<Duration> {
        (self.smoothed > Duration::ZERO).then_some(self.smoothed)
    }

    pub fn variance(&self) -> Duration {
        self.var
    }
}

/// Probe outcomes over a sliding window, for the reported loss rate.
#[derive(Debug)]
pub struct LossWindow {
    outcomes: VecDeque<bool>,
    size: usize,
}

impl LossWindow {
    pub fn new(size: usize) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(size),
            size: size.max(1),
        }
    }

    pub fn record(&mut self, ok: bool) {
        if self.outcomes.len() >= self.size {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(ok);
    }

    pub fn loss(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failed = self.outcomes.iter().filter(|ok| !**ok).count();
        failed as f64 / self.outcomes.len() as f64
    }
}

/// Classification over the last K probe outcomes.
#[derive(Debug)]
pub struct HealthMachine {
    recent: VecDeque<bool>,
    k: usize,
    state: LinkState,
}

impl HealthMachine {
    pub fn new(hysteresis: u32, initial: LinkState) -> Self {
        let k = (hysteresis as usize).max(1);
        Self {
            recent: VecDeque::with_capacity(k),
            k,
            state: initial,
        }
    }

    /// Fold in one probe outcome and return the resulting state.
    pub fn observe(&mut self, ok: bool, latency_degraded: bool) -> LinkState {
        if self.recent.len() >= self.k {
            self.recent.pop_front();
        }
        self.recent.push_back(ok);

        let successes = self.recent.iter().filter(|ok| **ok).count();
        let settled = self.recent.len() >= self.k;

        self.state = if settled && successes == 0 {
            LinkState::Down
        } else if settled && successes == self.recent.len() && !latency_degraded {
            LinkState::Up
        } else {
            LinkState::Degraded
        };
        self.state
    }

    pub fn state(&self) -> LinkState {
        self.state
    }
}

/// One probe round trip through a specific link.
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self, link: &LinkEntry, target: SocketAddr, timeout: Duration)
        -> Result<Duration>;
}

/// Probes by sending a minimal DNS query through a device-bound UDP socket.
pub struct UdpPinger;

#[async_trait]
impl Pinger for UdpPinger {
    async fn ping(
        &self,
        link: &LinkEntry,
        target: SocketAddr,
        timeout: Duration,
    ) -> Result<Duration> {
        let start = Instant::now();
        let socket = crate::util::bind_udp_to_device(&link.name, target.is_ipv6())?;

        let query = build_dns_query();
        socket.send_to(&query, target).await?;

        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| Error::Transient {
                index: link.index,
                reason: "probe timeout".into(),
            })??;

        // Sanity check: full DNS header and our transaction id echoed back.
        if len < 12 || buf[..2] != query[..2] {
            return Err(Error::Transient {
                index: link.index,
                reason: "malformed probe reply".into(),
            });
        }

        Ok(start.elapsed())
    }
}

/// Build a minimal DNS query for the root domain.
fn build_dns_query() -> Vec<u8> {
    let mut query = Vec::with_capacity(17);

    let txn_id: u16 = rand::random();
    query.extend_from_slice(&txn_id.to_be_bytes());

    // Flags: standard query, recursion desired
    query.extend_from_slice(&[0x01, 0x00]);
    // Questions: 1, everything else: 0
    query.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    // Root label, type A, class IN
    query.push(0x00);
    query.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);

    query
}

/// Deterministic pinger for tests and dry runs.
///
/// Each link gets a queue of replies; `None` means timeout. The last entry is
/// sticky, so `always`/`never` keep answering the same way. Configure a single
/// probe target so each sweep consumes exactly one entry per link.
#[derive(Default)]
pub struct ScriptedPinger {
    replies: DashMap<IfIndex, VecDeque<Option<Duration>>>,
}

impl ScriptedPinger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, index: IfIndex, replies: impl IntoIterator<Item = Option<Duration>>) {
        self.replies.insert(index, replies.into_iter().collect());
    }

    pub fn always(&self, index: IfIndex, latency: Duration) {
        self.script(index, [Some(latency)]);
    }

    pub fn never(&self, index: IfIndex) {
        self.script(index, [None]);
    }

    fn next_reply(&self, index: IfIndex) -> Option<Duration> {
        let mut queue = self.replies.get_mut(&index)?;
        if queue.len() > 1 {
            queue.pop_front().flatten()
        } else {
            queue.front().copied().flatten()
        }
    }
}

#[async_trait]
impl Pinger for ScriptedPinger {
    async fn ping(
        &self,
        link: &LinkEntry,
        _target: SocketAddr,
        _timeout: Duration,
    ) -> Result<Duration> {
        match self.next_reply(link.index) {
            Some(rtt) => Ok(rtt),
            None => Err(Error::Transient {
                index: link.index,
                reason: "scripted timeout".into(),
            }),
        }
    }
}

/// Per-link probe history.
struct LinkTracker {
    rtt: RttEstimator,
    window: LossWindow,
    machine: HealthMachine,
    last_ok: Option<Instant>,
}

impl LinkTracker {
    fn new(config: &ProbeConfig, initial: LinkState) -> Self {
        Self {
            rtt: RttEstimator::default(),
            window: LossWindow::new(config.window),
            machine: HealthMachine::new(config.hysteresis, initial),
            last_ok: None,
        }
    }

    fn observe(
        &mut self,
        index: IfIndex,
        rtt: Option<Duration>,
        config: &ProbeConfig,
        throughput: Bandwidth,
    ) -> ProbeReport {
        let ok = rtt.is_some();
        if let Some(rtt) = rtt {
            self.rtt.record(rtt);
            self.last_ok = Some(Instant::now());
        }
        self.window.record(ok);

        let latency_degraded = self
            .rtt
            .smoothed()
            .is_some_and(|s| s > config.degraded_latency);
        let state = self.machine.observe(ok, latency_degraded);

        ProbeReport {
            index,
            state,
            metrics: LinkMetrics {
                latency: self.rtt.smoothed(),
                loss: self.window.loss(),
                throughput,
                probe_age: self.last_ok.map(|t| t.elapsed()),
            },
        }
    }
}

/// Drives probe sweeps and folds the results into the registry.
pub struct HealthProber {
    config: ProbeConfig,
    pinger: Arc<dyn Pinger>,
    registry: Arc<LinkRegistry>,
    stats: Arc<StatsRegistry>,
    trackers: DashMap<IfIndex, LinkTracker>,
    sweep_seq: AtomicUsize,
}

impl HealthProber {
    pub fn new(
        config: ProbeConfig,
        pinger: Arc<dyn Pinger>,
        registry: Arc<LinkRegistry>,
        stats: Arc<StatsRegistry>,
    ) -> Self {
        Self {
            config,
            pinger,
            registry,
            stats,
            trackers: DashMap::new(),
            sweep_seq: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Probe every enabled link once and swap the results into the registry
    /// as a single update.
    pub async fn sweep_once(&self) -> SnapshotUpdate {
        let snapshot = self.registry.current();
        let targets = self.targets();
        let seq = self.sweep_seq.fetch_add(1, Ordering::Relaxed);

        let mut probes = Vec::new();
        for entry in snapshot.links.values() {
            if !entry.admin.is_enabled() {
                continue;
            }
            let entry = entry.clone();
            let pinger = Arc::clone(&self.pinger);
            let timeout = self.config.timeout;
            // Rotate the starting target across sweeps so one dead server
            // does not shoulder every first attempt.
            let order: Vec<SocketAddr> = (0..targets.len())
                .map(|i| targets[(seq + i) % targets.len()])
                .collect();

            probes.push(async move {
                let index = entry.index;
                (index, probe_link(&*pinger, &entry, &order, timeout).await)
            });
        }

        let results = join_all(probes).await;

        let mut reports = Vec::with_capacity(results.len());
        for (index, rtt) in results {
            reports.push(self.track(index, rtt, &snapshot));
        }

        self.trackers.retain(|index, _| snapshot.contains(*index));
        self.registry.apply_reports(reports)
    }

    fn track(
        &self,
        index: IfIndex,
        rtt: Option<Duration>,
        snapshot: &crate::registry::HealthSnapshot,
    ) -> ProbeReport {
        let initial = snapshot
            .get(index)
            .map_or(LinkState::Degraded, |e| e.state);
        let throughput = self.stats.link_throughput(index);

        let mut tracker = self
            .trackers
            .entry(index)
            .or_insert_with(|| LinkTracker::new(&self.config, initial));
        tracker.observe(index, rtt, &self.config, throughput)
    }

    /// Resolved probe targets; falls back to the built-ins when none parse.
    fn targets(&self) -> Vec<SocketAddr> {
        let parsed: Vec<SocketAddr> = self
            .config
            .targets
            .iter()
            .filter_map(|s| parse_addr_with_default_port(s, 53).ok())
            .collect();
        if !parsed.is_empty() {
            return parsed;
        }
        DEFAULT_PROBE_TARGETS
            .iter()
            .filter_map(|s| parse_addr_with_default_port(s, 53).ok())
            .collect()
    }
}

/// Try targets in order until one answers.
async fn probe_link(
    pinger: &dyn Pinger,
    entry: &LinkEntry,
    targets: &[SocketAddr],
    timeout: Duration,
) -> Option<Duration> {
    for target in targets {
        match pinger.ping(entry, *target, timeout).await {
            Ok(rtt) => return Some(rtt),
            Err(e) => {
                trace!(link = %entry.name, %target, error = %e, "probe attempt failed");
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AdminState, LinkKind};

    #[test]
    fn test_rtt_estimator_smoothing() {
        let mut rtt = RttEstimator::default();
        assert!(rtt.smoothed().is_none());

        rtt.record(Duration::from_millis(100));
        assert_eq!(rtt.smoothed(), Some(Duration::from_millis(100)));
        assert_eq!(rtt.variance(), Duration::from_millis(50));

        // A higher sample pulls the estimate up by 1/8 of the delta.
        rtt.record(Duration::from_millis(180));
        let smoothed = rtt.smoothed().unwrap();
        assert!(smoothed >= Duration::from_millis(109) && smoothed <= Duration::from_millis(111));
    }

    #[test]
    fn test_loss_window_ratio() {
        let mut window = LossWindow::new(4);
        assert_eq!(window.loss(), 0.0);

        window.record(true);
        window.record(false);
        assert!((window.loss() - 0.5).abs() < f64::EPSILON);

        // Fill past capacity; the early failure ages out.
        window.record(true);
        window.record(true);
        window.record(true);
        assert!((window.loss() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_health_machine_settles_up() {
        let mut machine = HealthMachine::new(2, LinkState::Degraded);
        assert_eq!(machine.observe(true, false), LinkState::Degraded);
        assert_eq!(machine.observe(true, false), LinkState::Up);
    }

    #[test]
    fn test_health_machine_down_needs_consecutive_failures() {
        let mut machine = HealthMachine::new(2, LinkState::Degraded);
        machine.observe(true, false);
        machine.observe(true, false);
        assert_eq!(machine.state(), LinkState::Up);

        // One miss degrades but does not kill the link.
        assert_eq!(machine.observe(false, false), LinkState::Degraded);
        assert_eq!(machine.observe(false, false), LinkState::Down);
    }

    #[test]
    fn test_health_machine_recovers_from_down() {
        let mut machine = HealthMachine::new(2, LinkState::Down);
        machine.observe(false, false);
        machine.observe(false, false);
        assert_eq!(machine.state(), LinkState::Down);

        assert_eq!(machine.observe(true, false), LinkState::Degraded);
        assert_eq!(machine.observe(true, false), LinkState::Up);
    }

    #[test]
    fn test_health_machine_latency_threshold() {
        let mut machine = HealthMachine::new(2, LinkState::Up);
        machine.observe(true, false);
        machine.observe(true, false);
        assert_eq!(machine.state(), LinkState::Up);

        // Successful probes with bad latency still mean Degraded.
        assert_eq!(machine.observe(true, true), LinkState::Degraded);
        assert_eq!(machine.observe(true, false), LinkState::Up);
    }

    #[test]
    fn test_scripted_pinger_sticky_last() {
        let pinger = ScriptedPinger::new();
        let index = IfIndex::new(1);
        pinger.script(
            index,
            [Some(Duration::from_millis(5)), None, Some(Duration::from_millis(7))],
        );

        assert_eq!(pinger.next_reply(index), Some(Duration::from_millis(5)));
        assert_eq!(pinger.next_reply(index), None);
        assert_eq!(pinger.next_reply(index), Some(Duration::from_millis(7)));
        // Last entry repeats.
        assert_eq!(pinger.next_reply(index), Some(Duration::from_millis(7)));
        // Unscripted links time out.
        assert_eq!(pinger.next_reply(IfIndex::new(9)), None);
    }

    #[test]
    fn test_dns_query_shape() {
        let query = build_dns_query();
        assert_eq!(query.len(), 17);
        // Standard query, not a response.
        assert_eq!(query[2] & 0x80, 0x00);
        // One question.
        assert_eq!(&query[4..6], &[0x00, 0x01]);
    }

    fn test_config() -> ProbeConfig {
        ProbeConfig {
            targets: vec!["192.0.2.1:53".into()],
            ..Default::default()
        }
    }

    fn test_prober(pinger: Arc<dyn Pinger>) -> (HealthProber, Arc<LinkRegistry>) {
        let registry = Arc::new(LinkRegistry::new());
        let stats = Arc::new(StatsRegistry::new());
        let prober = HealthProber::new(test_config(), pinger, Arc::clone(&registry), stats);
        (prober, registry)
    }

    #[tokio::test]
    async fn test_sweep_promotes_and_demotes() {
        let pinger = Arc::new(ScriptedPinger::new());
        pinger.always(IfIndex::new(1), Duration::from_millis(10));
        pinger.never(IfIndex::new(2));

        let (prober, registry) = test_prober(pinger.clone());
        registry.register(LinkEntry::new(IfIndex::new(1), "eth0", LinkKind::Wired));
        registry.register(LinkEntry::new(IfIndex::new(2), "wlan0", LinkKind::Wireless));

        // Two sweeps settle both hysteresis machines.
        prober.sweep_once().await;
        let update = prober.sweep_once().await;

        let snap = &update.snapshot;
        assert_eq!(snap.get(IfIndex::new(1)).unwrap().state, LinkState::Up);
        assert_eq!(snap.get(IfIndex::new(2)).unwrap().state, LinkState::Down);
        assert_eq!(update.lost_links().collect::<Vec<_>>(), vec![IfIndex::new(2)]);

        let metrics = snap.get(IfIndex::new(1)).unwrap().metrics;
        assert_eq!(metrics.latency, Some(Duration::from_millis(10)));
        assert_eq!(metrics.loss, 0.0);
    }

    #[tokio::test]
    async fn test_sweep_skips_disabled_links() {
        let pinger = Arc::new(ScriptedPinger::new());
        pinger.always(IfIndex::new(1), Duration::from_millis(10));

        let (prober, registry) = test_prober(pinger.clone());
        registry.register(
            LinkEntry::new(IfIndex::new(1), "eth0", LinkKind::Wired)
                .with_admin(AdminState::Disabled),
        );

        let update = prober.sweep_once().await;
        assert!(update.transitions.is_empty());
        assert_eq!(
            update.snapshot.get(IfIndex::new(1)).unwrap().state,
            LinkState::Degraded
        );
    }
}

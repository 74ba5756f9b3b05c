//! Failover behavior when links die, vanish or get disabled: every affected
//! flow must land on a usable link in the same step that records the
//! transition, and a total outage must evict flows rather than strand them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use weft::flow::{FlowConfig, FlowKey, FlowTable, Proto};
use weft::policy::{PolicyEngine, PolicyMode};
use weft::registry::{HealthSnapshot, LinkEntry, LinkRegistry, ProbeReport};
use weft::types::{AdminState, Bandwidth, IfIndex, LinkKind, LinkMetrics, LinkState};

// Helper to build a link entry in a known state with fixed health metrics
fn link(index: u32, state: LinkState, latency_ms: u64, mbps: f64) -> LinkEntry {
    LinkEntry::new(
        IfIndex::new(index),
        format!("eth{}", index - 1),
        LinkKind::Wired,
    )
    .with_state(state)
    .with_metrics(LinkMetrics {
        latency: (latency_ms > 0).then(|| Duration::from_millis(latency_ms)),
        loss: 0.0,
        throughput: Bandwidth::from_mbps(mbps),
        probe_age: Some(Duration::from_millis(100)),
    })
}

// Helper for a distinct outbound TCP flow per n
fn flow_key(n: u16) -> FlowKey {
    let local: SocketAddr = format!("10.0.0.5:{}", 40000 + n).parse().unwrap();
    let remote: SocketAddr = "93.184.216.34:443".parse().unwrap();
    FlowKey::new(Proto::Tcp, local, remote)
}

// Helper wiring a registry, policy engine and flow table together
fn setup(mode: PolicyMode) -> (LinkRegistry, Arc<PolicyEngine>, FlowTable) {
    let registry = LinkRegistry::new();
    let policy = Arc::new(PolicyEngine::new(mode));
    let table = FlowTable::new(FlowConfig::default(), Arc::clone(&policy));
    (registry, policy, table)
}

// Helper to push one link's state through the registry as a probe sweep would
fn report(registry: &LinkRegistry, index: u32, state: LinkState) -> Arc<HealthSnapshot> {
    let update = registry.apply_reports(vec![ProbeReport {
        index: IfIndex::new(index),
        state,
        metrics: LinkMetrics::default(),
    }]);
    update.snapshot
}

// ============================================================================
// Deterministic failover
// ============================================================================

#[test]
fn test_down_link_reassigns_every_flow() {
    let (registry, _policy, table) = setup(PolicyMode::RoundRobin);
    for i in 1u32..=3 {
        registry.register(link(i, LinkState::Up, 10, 100.0));
    }

    let snapshot = registry.current();
    for n in 0..100 {
        table.assign(&snapshot, flow_key(n)).unwrap();
    }
    let victims = table.flows_on(IfIndex::new(2));
    assert!(victims > 0);

    let snapshot = report(&registry, 2, LinkState::Down);
    let drained = table.reassign_for_down(&snapshot, IfIndex::new(2));

    assert_eq!(drained.from, IfIndex::new(2));
    assert_eq!(drained.moved, victims);
    assert_eq!(drained.evicted, 0);
    assert_eq!(table.flows_on(IfIndex::new(2)), 0);
    assert_eq!(table.len(), 100, "failover must not lose flows");

    // Every flow now sits on a link that is still usable.
    for n in 0..100 {
        let pinned = table.lookup(&flow_key(n)).unwrap().pinned();
        assert!(snapshot.is_eligible(pinned));
    }
}

#[test]
fn test_degraded_link_is_a_valid_failover_target() {
    let (registry, _policy, table) = setup(PolicyMode::LatencyBased);
    registry.register(link(1, LinkState::Up, 5, 100.0));
    registry.register(link(2, LinkState::Degraded, 50, 10.0));

    let snapshot = registry.current();
    for n in 0..5 {
        assert_eq!(
            table.assign(&snapshot, flow_key(n)).unwrap().pinned(),
            IfIndex::new(1)
        );
    }

    let snapshot = report(&registry, 1, LinkState::Down);
    let drained = table.reassign_for_down(&snapshot, IfIndex::new(1));
    assert_eq!(drained.moved, 5);
    assert_eq!(drained.evicted, 0);
    assert_eq!(table.flows_on(IfIndex::new(2)), 5);
}

#[test]
fn test_failover_without_survivors_evicts() {
    let (registry, _policy, table) = setup(PolicyMode::Balanced);
    registry.register(link(1, LinkState::Up, 10, 100.0));

    let snapshot = registry.current();
    for n in 0..5 {
        table.assign(&snapshot, flow_key(n)).unwrap();
    }

    let snapshot = report(&registry, 1, LinkState::Down);
    let drained = table.reassign_for_down(&snapshot, IfIndex::new(1));
    assert_eq!(drained.moved, 0);
    assert_eq!(drained.evicted, 5);
    assert!(
        table.is_empty(),
        "stranded flows must be evicted, not left pinned"
    );

    // New traffic is refused until a link comes back...
    assert!(table.assign(&snapshot, flow_key(9)).unwrap_err().is_outage());

    // ...and accepted again the moment one does.
    let snapshot = report(&registry, 1, LinkState::Up);
    assert_eq!(
        table.assign(&snapshot, flow_key(9)).unwrap().pinned(),
        IfIndex::new(1)
    );
}

#[test]
fn test_removed_link_frees_its_flows() {
    let (registry, _policy, table) = setup(PolicyMode::RoundRobin);
    registry.register(link(1, LinkState::Up, 10, 100.0));
    registry.register(link(2, LinkState::Up, 10, 100.0));

    let snapshot = registry.current();
    for n in 0..10 {
        table.assign(&snapshot, flow_key(n)).unwrap();
    }
    assert_eq!(table.flows_on(IfIndex::new(1)), 5);

    let snapshot = registry.remove(IfIndex::new(1)).unwrap();
    let drained = table.reassign_for_down(&snapshot, IfIndex::new(1));
    assert_eq!(drained.moved, 5);
    assert_eq!(table.flows_on(IfIndex::new(2)), 10);
}

#[test]
fn test_disabling_a_link_drains_it() {
    let (registry, _policy, table) = setup(PolicyMode::RoundRobin);
    registry.register(link(1, LinkState::Up, 10, 100.0));
    registry.register(link(2, LinkState::Up, 10, 100.0));

    let snapshot = registry.current();
    for n in 0..10 {
        table.assign(&snapshot, flow_key(n)).unwrap();
    }

    let snapshot = registry
        .set_admin(IfIndex::new(1), AdminState::Disabled)
        .unwrap();
    let drained = table.drain_link(&snapshot, IfIndex::new(1));
    assert_eq!(drained.moved, 5);
    assert_eq!(drained.evicted, 0);
    assert_eq!(table.flows_on(IfIndex::new(1)), 0);
    assert_eq!(table.flows_on(IfIndex::new(2)), 10);

    // Re-enabling does not pull the moved flows back.
    registry
        .set_admin(IfIndex::new(1), AdminState::Enabled)
        .unwrap();
    assert_eq!(table.flows_on(IfIndex::new(1)), 0);
    assert_eq!(table.flows_on(IfIndex::new(2)), 10);
}

// ============================================================================
// Randomized transitions
// ============================================================================

// Whatever order links flap in, a surviving flow is never left pinned to a
// Down link, and assignment fails only while nothing at all is usable.
#[test]
fn test_random_transitions_never_strand_a_flow() {
    let mut rng = StdRng::seed_from_u64(0xf10e_5eed);
    let (registry, _policy, table) = setup(PolicyMode::Balanced);
    for i in 1u32..=4 {
        registry.register(link(i, LinkState::Up, 5 * u64::from(i), 50.0));
    }

    let mut live_keys: Vec<FlowKey> = Vec::new();
    let mut next_flow: u16 = 0;

    for _ in 0..400 {
        match rng.gen_range(0..4u8) {
            // A link dies. The registry change and the drain are one step,
            // exactly as the engine applies them.
            0 => {
                let index = IfIndex::new(rng.gen_range(1..=4u32));
                let update = registry.apply_reports(vec![ProbeReport {
                    index,
                    state: LinkState::Down,
                    metrics: LinkMetrics::default(),
                }]);
                table.reassign_for_down(&update.snapshot, index);
            }
            // A link recovers, fully or partially.
            1 => {
                let state = if rng.gen_bool(0.5) {
                    LinkState::Up
                } else {
                    LinkState::Degraded
                };
                report(&registry, rng.gen_range(1..=4u32), state);
            }
            // New traffic shows up.
            _ => {
                let snapshot = registry.current();
                let key = flow_key(next_flow);
                next_flow += 1;
                match table.assign(&snapshot, key) {
                    Ok(flow) => {
                        assert!(snapshot.is_eligible(flow.pinned()));
                        live_keys.push(key);
                    }
                    Err(err) => {
                        assert!(err.is_outage());
                        assert_eq!(snapshot.eligible_count(), 0);
                    }
                }
            }
        }

        // Invariant after every step: no tracked flow sits on a Down link.
        let snapshot = registry.current();
        live_keys.retain(|key| table.lookup(key).is_some());
        for key in &live_keys {
            let pinned = table.lookup(key).unwrap().pinned();
            let state = snapshot.get(pinned).map(|entry| entry.state);
            assert_ne!(
                state,
                Some(LinkState::Down),
                "flow {key:?} left on a down link"
            );
        }
    }
}

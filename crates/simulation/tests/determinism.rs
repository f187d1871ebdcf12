//! Tests for deterministic simulation.
//!
//! These tests verify that the simulation produces identical results
//! given the same seed, which is the core property we need for debugging
//! and replay.

use pbft_core::Event;
use pbft_simulation::{SimulationConfig, SimulationRunner};
use pbft_types::{BlockNumber, Hash};
use std::time::Duration;
use tracing_test::traced_test;

fn lossy_config(seed: u64) -> SimulationConfig {
    let mut config = SimulationConfig {
        seed,
        ..SimulationConfig::default()
    };
    config.network.packet_loss_rate = 0.02;
    config.network.jitter_fraction = 0.3;
    config
}

fn run_for(config: SimulationConfig, duration: Duration) -> SimulationRunner {
    let mut runner = SimulationRunner::new(config).unwrap();
    runner.initialize();
    runner.run_until(duration);
    runner
}

/// Committed (index, hash) pairs of every node.
fn committed_logs(runner: &SimulationRunner) -> Vec<Vec<(BlockNumber, Hash)>> {
    (0..runner.num_nodes() as u32)
        .map(|node| {
            runner
                .committed(node)
                .iter()
                .map(|(p, _)| (p.index, p.hash))
                .collect()
        })
        .collect()
}

#[test]
fn test_simulation_runner_creation() {
    let runner = SimulationRunner::new(SimulationConfig::default()).unwrap();

    assert_eq!(runner.num_nodes(), 4);
    for node in 0..4 {
        assert!(runner.node(node).is_some());
    }
    assert!(runner.node(4).is_none());
    assert_eq!(runner.network().total_nodes(), 4);
}

#[test]
fn test_observers_follow_sealers_in_node_order() {
    let runner = SimulationRunner::new(SimulationConfig {
        sealers: 4,
        observers: 2,
        ..SimulationConfig::default()
    })
    .unwrap();

    assert_eq!(runner.num_nodes(), 6);
    for node in 0..4 {
        assert!(runner.node(node).unwrap().is_sealer());
    }
    for node in 4..6 {
        assert!(!runner.node(node).unwrap().is_sealer());
    }
}

#[test]
fn test_idle_cluster_only_runs_timers() {
    let mut runner = SimulationRunner::new(SimulationConfig {
        auto_propose: false,
        ..SimulationConfig::default()
    })
    .unwrap();
    runner.initialize();
    runner.run_until(Duration::from_millis(500));

    assert_eq!(runner.stats().proposals_submitted, 0);
    assert!(runner.stats().timers_set >= 4);
    assert!(runner.committed(0).is_empty());
}

#[test]
fn test_scheduled_submission_is_committed() {
    let mut runner = SimulationRunner::new(SimulationConfig {
        auto_propose: false,
        ..SimulationConfig::default()
    })
    .unwrap();
    runner.initialize();

    let leader = runner.node(0).unwrap().snapshot().leader.unwrap();
    let payload = b"hand-built".to_vec();
    runner.schedule_initial_event(
        leader.0,
        Duration::from_millis(10),
        Event::SubmitProposal {
            index: BlockNumber(1),
            hash: Hash::from_bytes(&payload),
            payload: payload.clone(),
            tx_count: 1,
        },
    );
    runner.run_until(Duration::from_millis(500));

    for node in 0..4 {
        let log = runner.committed(node);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0.payload, payload);
    }
}

#[test]
#[traced_test]
fn test_same_seed_same_outcome() {
    let duration = Duration::from_secs(5);
    let first = run_for(lossy_config(7), duration);
    let second = run_for(lossy_config(7), duration);

    assert_eq!(first.stats(), second.stats());
    assert_eq!(committed_logs(&first), committed_logs(&second));
    for node in 0..4 {
        assert_eq!(
            first.node(node).unwrap().snapshot(),
            second.node(node).unwrap().snapshot()
        );
        assert_eq!(first.persisted(node), second.persisted(node));
    }
    assert!(
        first.executor(0).applied_index() > BlockNumber(0),
        "nothing committed in five simulated seconds"
    );
}

#[test]
fn test_same_seed_with_crash_is_reproducible() {
    let scenario = || {
        let mut runner = SimulationRunner::new(lossy_config(11)).unwrap();
        runner.initialize();
        runner.run_until(Duration::from_secs(1));
        runner.crash_node(1);
        runner.run_until(Duration::from_secs(4));
        runner.restart_node(1).unwrap();
        runner.run_until(Duration::from_secs(8));
        runner
    };
    let first = scenario();
    let second = scenario();

    assert_eq!(first.stats(), second.stats());
    assert_eq!(committed_logs(&first), committed_logs(&second));
    assert!(first.stats().events_dropped_crashed > 0);
}

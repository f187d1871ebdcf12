//! Multi-node consensus scenarios under the deterministic simulator.

use pbft_core::Event;
use pbft_messages::{PbftMessage, PrePrepareMsg};
use pbft_simulation::{SimulationConfig, SimulationRunner};
use pbft_types::{BlockNumber, ConsensusNode, Hash, LedgerConfig, Phase, Proposal, View};
use std::time::Duration;
use tracing_test::traced_test;

const DEADLINE: Duration = Duration::from_secs(120);

fn started(config: SimulationConfig) -> SimulationRunner {
    let mut runner = SimulationRunner::new(config).unwrap();
    runner.initialize();
    runner
}

fn assert_no_disagreement(runner: &SimulationRunner) {
    assert_eq!(runner.first_disagreement(), None);
}

/// Committed indices must be gap-free and ascending on every node.
fn assert_ordered_logs(runner: &SimulationRunner) {
    for node in 0..runner.num_nodes() as u32 {
        let indices: Vec<u64> = runner
            .committed(node)
            .iter()
            .map(|(p, _)| p.index.0)
            .collect();
        let expected: Vec<u64> = (1..=indices.len() as u64).collect();
        assert_eq!(indices, expected, "node {} committed out of order", node);
    }
}

fn max_applied(runner: &SimulationRunner) -> BlockNumber {
    (0..runner.num_nodes() as u32)
        .map(|i| runner.executor(i).applied_index())
        .max()
        .unwrap_or(BlockNumber::GENESIS)
}

#[test]
#[traced_test]
fn test_happy_path_commits_in_order() {
    let mut runner = started(SimulationConfig::default());

    assert!(runner.run_until_applied(BlockNumber(10), DEADLINE));
    assert_ordered_logs(&runner);
    assert_no_disagreement(&runner);
    assert!(runner.equivocations().is_empty());
    assert!(runner.apply_alerts().is_empty());

    let stats = runner.node(0).unwrap().stats();
    assert_eq!(stats.view_changes, 0);
    assert!(stats.proposals_committed >= 10);

    // Every ledger computed the same results.
    for index in 1..=10 {
        let index = BlockNumber(index);
        let expected = runner.executor(0).result_hash(index);
        for node in 1..4 {
            assert_eq!(runner.executor(node).result_hash(index), expected);
        }
    }

    // Durable state follows the ledger.
    assert!(runner.persisted(0).committed_index >= BlockNumber(10));
}

#[test]
#[traced_test]
fn test_crashed_leader_is_replaced_by_view_change() {
    let mut runner = started(SimulationConfig::default());
    assert!(runner.run_until_applied(BlockNumber(2), DEADLINE));

    let view = runner.node(0).unwrap().view();
    let next = runner.node(0).unwrap().committed_index().next();
    let leader = runner
        .node(0)
        .unwrap()
        .view_config()
        .leader_of(view, next)
        .unwrap();
    runner.crash_node(leader.0);

    let target = BlockNumber(next.0 + 5);
    assert!(
        runner.run_until_applied(target, DEADLINE),
        "survivors did not progress without the leader"
    );
    assert_no_disagreement(&runner);

    let survivor = (leader.0 + 1) % 4;
    let state = runner.node(survivor).unwrap();
    assert!(state.view() > view);
    assert!(state.stats().view_changes >= 1);
    assert!(state.stats().view_change_requests >= 1);
}

#[test]
#[traced_test]
fn test_crashed_node_recovers_after_restart() {
    let mut runner = started(SimulationConfig::default());
    assert!(runner.run_until_applied(BlockNumber(3), DEADLINE));

    runner.crash_node(3);
    let saved = runner.persisted(3).committed_index;
    assert!(saved >= BlockNumber(3));

    assert!(runner.run_until_applied(BlockNumber(10), DEADLINE));
    assert!(runner.executor(3).applied_index() < BlockNumber(10));

    runner.restart_node(3).unwrap();
    assert_eq!(
        runner.node(3).unwrap().committed_index(),
        runner.persisted(3).committed_index
    );

    assert!(
        runner.run_until_applied(BlockNumber(14), DEADLINE),
        "restarted node did not catch up"
    );
    assert_no_disagreement(&runner);
    assert!(runner.node(3).unwrap().stats().recover_requests >= 1);
}

#[test]
#[traced_test]
fn test_minority_partition_cannot_commit_until_healed() {
    let mut runner = started(SimulationConfig::default());
    assert!(runner.run_until_applied(BlockNumber(3), DEADLINE));

    runner.network_mut().partition_groups(&[0, 1], &[2, 3]);
    // Let messages already in flight land.
    let settle = runner.now() + Duration::from_millis(500);
    runner.run_until(settle);
    let frozen = max_applied(&runner);

    let later = runner.now() + Duration::from_secs(5);
    runner.run_until(later);
    assert_eq!(max_applied(&runner), frozen, "a 2-2 split must not commit");
    assert!(runner.stats().messages_dropped_partition > 0);

    runner.network_mut().heal_all();
    let target = BlockNumber(frozen.0 + 3);
    assert!(
        runner.run_until_applied(target, runner.now() + DEADLINE),
        "cluster did not resume after heal"
    );
    assert_ordered_logs(&runner);
    assert_no_disagreement(&runner);
}

#[test]
#[traced_test]
fn test_equivocating_leader_is_reported() {
    let mut runner = started(SimulationConfig {
        auto_propose: false,
        ..SimulationConfig::default()
    });

    let index = BlockNumber(1);
    let leader = runner
        .node(0)
        .unwrap()
        .view_config()
        .leader_of(View(0), index)
        .unwrap();
    let key = runner.key(leader.0).clone();
    let conflicting = |payload: &[u8]| {
        let hash = Hash::from_bytes(payload);
        let proposal = Proposal::new(index, View(0), hash, payload.to_vec(), 1, leader, &key);
        PbftMessage::PrePrepare(PrePrepareMsg::new(View(0), proposal, leader, false, &key))
    };
    let a = conflicting(b"block-a");
    let b = conflicting(b"block-b");

    let others: Vec<u32> = (0..4).filter(|n| *n != leader.0).collect();
    // First two honest nodes see A first, the third sees B first.
    for (i, &to) in others.iter().enumerate() {
        let (first, second) = if i < 2 { (&a, &b) } else { (&b, &a) };
        runner.inject_message(leader.0, to, first.clone(), Duration::from_millis(1));
        runner.inject_message(leader.0, to, second.clone(), Duration::from_millis(20));
    }
    runner.run_until(Duration::from_millis(200));

    let reports = runner.equivocations();
    assert_eq!(reports.len(), 3, "every honest node reports the leader");
    for (_, evidence) in reports {
        assert_eq!(evidence.node, leader);
        assert_eq!(evidence.phase, Phase::PrePrepare);
        assert_eq!(evidence.index, index);
        assert_ne!(evidence.first.0, evidence.second.0);
    }

    // Honest nodes replace the leader and keep going.
    runner.set_auto_propose(true);
    assert!(runner.run_until_applied(BlockNumber(3), DEADLINE));
    assert_no_disagreement(&runner);
}

#[test]
#[traced_test]
fn test_apply_failures_retry_and_alert() {
    let mut runner = started(SimulationConfig::default());
    runner.executor_mut(2).fail_next(3);

    assert!(runner.run_until_applied(BlockNumber(4), DEADLINE));
    assert!(runner.apply_alerts().is_empty());
    assert_eq!(runner.node(2).unwrap().stats().apply_failures, 3);

    runner.executor_mut(1).fail_next(6);
    assert!(runner.run_until_applied(BlockNumber(10), DEADLINE));
    let alerts: Vec<_> = runner
        .apply_alerts()
        .iter()
        .filter(|(node, _, _)| *node == 1)
        .collect();
    assert_eq!(alerts.len(), 1, "alert is raised once per failure streak");
    assert_eq!(alerts[0].2, 5);
    assert_eq!(runner.node(1).unwrap().snapshot().consecutive_apply_failures, 0);
    assert_no_disagreement(&runner);
}

#[test]
#[traced_test]
fn test_divergent_ledger_is_detected_at_checkpoint() {
    let mut runner = started(SimulationConfig::default());
    runner.executor_mut(3).diverge(b"faulty-disk");

    assert!(runner.run_until_applied(BlockNumber(5), DEADLINE));
    // Agreement on proposals is unaffected; only node 3's results differ.
    assert_no_disagreement(&runner);
    assert!(runner.node(3).unwrap().stats().checkpoint_mismatches >= 1);
    assert_eq!(runner.node(0).unwrap().stats().checkpoint_mismatches, 0);
    assert_ne!(
        runner.executor(3).result_hash(BlockNumber(1)),
        runner.executor(0).result_hash(BlockNumber(1))
    );
}

#[test]
#[traced_test]
fn test_observer_follows_and_joins_sealers() {
    let mut config = SimulationConfig {
        sealers: 4,
        observers: 1,
        ..SimulationConfig::default()
    };
    config.pbft.water_mark_limit = 1;
    let mut runner = started(config);
    let observer: u32 = 4;
    assert!(!runner.node(observer).unwrap().is_sealer());

    assert!(runner.run_until_applied(BlockNumber(3), DEADLINE));
    assert_no_disagreement(&runner);
    assert_eq!(
        runner.committed(observer).len() as u64,
        runner.executor(observer).applied_index().0
    );

    let enable_index = BlockNumber(max_applied(&runner).0 + 3);
    let membership: Vec<ConsensusNode> = runner
        .genesis()
        .membership
        .iter()
        .map(|n| ConsensusNode::sealer(n.node_id, 1))
        .collect();
    runner.set_ledger_config(LedgerConfig {
        enable_index,
        ..LedgerConfig::new(membership)
    });

    let target = BlockNumber(enable_index.0 + 5);
    assert!(
        runner.run_until_applied(target, DEADLINE),
        "cluster stalled across the membership change"
    );
    assert_no_disagreement(&runner);

    let snapshot = runner.node(0).unwrap().snapshot();
    assert_eq!(snapshot.membership.sealers.len(), 5);
    assert_eq!(snapshot.membership.quorum, 4);
    assert!(runner.node(observer).unwrap().is_sealer());
}

#[test]
#[traced_test]
fn test_membership_change_survives_failed_config_fetches() {
    let mut runner = started(SimulationConfig {
        sealers: 4,
        observers: 1,
        auto_propose: false,
        ..SimulationConfig::default()
    });
    let membership: Vec<ConsensusNode> = runner
        .genesis()
        .membership
        .iter()
        .map(|n| ConsensusNode::sealer(n.node_id, 1))
        .collect();
    runner.set_ledger_config(LedgerConfig {
        enable_index: BlockNumber(2),
        ..LedgerConfig::new(membership)
    });
    runner.executor_mut(0).fail_config_fetches(2);

    // One commit triggers the only configuration poll; nothing else follows.
    let leader = runner.node(0).unwrap().snapshot().leader.unwrap();
    let payload = b"block-1".to_vec();
    runner.schedule_initial_event(
        leader.0,
        Duration::from_millis(10),
        Event::SubmitProposal {
            index: BlockNumber(1),
            hash: Hash::from_bytes(&payload),
            payload,
            tx_count: 1,
        },
    );
    runner.run_until(Duration::from_millis(900));

    let node = runner.node(0).unwrap();
    assert_eq!(node.committed_index(), BlockNumber(1));
    assert_eq!(node.stats().ledger_config_fetch_failures, 2);
    assert_eq!(node.snapshot().membership.sealers.len(), 5);
    assert_eq!(runner.node(1).unwrap().snapshot().membership.sealers.len(), 5);
}

#[test]
#[traced_test]
fn test_progress_under_packet_loss() {
    let mut config = SimulationConfig::default();
    config.network.packet_loss_rate = 0.05;
    let mut runner = started(config);

    assert!(runner.run_until_applied(BlockNumber(5), DEADLINE));
    assert_no_disagreement(&runner);
    assert!(runner.stats().messages_dropped_loss > 0);
    assert!(runner.stats().delivery_rate() < 1.0);
}

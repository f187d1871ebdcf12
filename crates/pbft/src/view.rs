//! View, leader and membership configuration.
//!
//! [`ViewConfig`] answers the questions every other component asks: who is
//! the leader of `(view, index)`, how much weight makes a quorum, and which
//! sealers are in force. Membership updates are scheduled against an enable
//! index and only take effect when the engine is about to process that index.

use pbft_types::{
    BlockNumber, ConsensusNode, Feature, Features, Keyring, LedgerConfig, Membership,
    MembershipError, NodeId, NodeIndex, QuorumPolicyKind, View,
};
use std::fmt;
use tracing::info;

/// Inputs a leader selection strategy may consult.
#[derive(Debug, Clone, Copy)]
pub struct LeaderContext<'a> {
    pub membership: &'a Membership,
    pub features: &'a Features,
    /// Consecutive indices one leader keeps within a view.
    pub leader_period: u64,
}

/// Strategy mapping `(view, index)` to a sealer.
///
/// Must be a pure function of its inputs: every node has to agree on the
/// leader without communicating.
pub trait LeaderSelection: Send + Sync + fmt::Debug {
    fn leader_of(&self, ctx: &LeaderContext<'_>, view: View, index: BlockNumber)
        -> Option<NodeIndex>;
}

/// Round-robin over sealers: `(view + index / leader_period) % n`.
///
/// Once [`Feature::WeightedLeaderRotation`] is active at `index`, each sealer
/// owns a number of consecutive slots equal to its weight.
#[derive(Debug, Clone, Copy, Default)]
pub struct RotatingLeader;

impl LeaderSelection for RotatingLeader {
    fn leader_of(
        &self,
        ctx: &LeaderContext<'_>,
        view: View,
        index: BlockNumber,
    ) -> Option<NodeIndex> {
        let sealers = ctx.membership.sealers();
        if sealers.is_empty() {
            return None;
        }
        let period = ctx.leader_period.max(1);
        let position = view.0.wrapping_add(index.0 / period);

        if !ctx.features.is_active(Feature::WeightedLeaderRotation, index) {
            return Some(NodeIndex((position % sealers.len() as u64) as u32));
        }

        let total = ctx.membership.total_weight();
        let mut slot = position % total;
        for (i, sealer) in sealers.iter().enumerate() {
            if slot < sealer.weight {
                return Some(NodeIndex(i as u32));
            }
            slot -= sealer.weight;
        }
        None
    }
}

/// Strategy deriving the quorum weight from total sealer weight.
pub trait QuorumPolicy: Send + Sync + fmt::Debug {
    fn quorum(&self, total_weight: u64) -> u64;
}

/// `total - floor((total - 1) / 3)`: 2f+1 when total = 3f+1, and n-f otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByzantineQuorum;

impl QuorumPolicy for ByzantineQuorum {
    fn quorum(&self, total_weight: u64) -> u64 {
        if total_weight == 0 {
            return 0;
        }
        total_weight - (total_weight - 1) / 3
    }
}

/// A configured weighted threshold, capped at the total weight.
#[derive(Debug, Clone, Copy)]
pub struct FixedQuorum(pub u64);

impl QuorumPolicy for FixedQuorum {
    fn quorum(&self, total_weight: u64) -> u64 {
        self.0.clamp(1, total_weight.max(1))
    }
}

fn policy_from_kind(kind: QuorumPolicyKind) -> Box<dyn QuorumPolicy> {
    match kind {
        QuorumPolicyKind::Byzantine => Box::new(ByzantineQuorum),
        QuorumPolicyKind::Fixed { weight } => Box::new(FixedQuorum(weight)),
    }
}

/// Result of applying a scheduled configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipChange {
    pub enable_index: BlockNumber,
    pub old_quorum: u64,
    pub new_quorum: u64,
}

impl MembershipChange {
    pub fn quorum_changed(&self) -> bool {
        self.old_quorum != self.new_quorum
    }
}

/// A validated configuration waiting for its enable index.
#[derive(Debug)]
struct PendingConfig {
    enable_index: BlockNumber,
    membership: Membership,
    quorum_policy: Option<QuorumPolicyKind>,
    leader_period: Option<u64>,
    features: Option<Features>,
    block_tx_count_limit: Option<u64>,
}

/// Copy-on-read view of the configuration for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewSnapshot {
    pub view: View,
    pub sealers: Vec<ConsensusNode>,
    pub observers: Vec<ConsensusNode>,
    pub total_weight: u64,
    pub quorum: u64,
    pub weak_quorum: u64,
    pub leader_period: u64,
    pub pending_enable_index: Option<BlockNumber>,
}

/// Current view plus the membership, leader and quorum rules in force.
pub struct ViewConfig {
    view: View,
    membership: Membership,
    pending: Option<PendingConfig>,
    /// First index governed by the active membership.
    active_from: BlockNumber,
    leader_selection: Box<dyn LeaderSelection>,
    quorum_policy: Box<dyn QuorumPolicy>,
    leader_period: u64,
    features: Features,
    block_tx_count_limit: u64,
}

impl fmt::Debug for ViewConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewConfig")
            .field("view", &self.view)
            .field("sealers", &self.membership.sealer_count())
            .field("quorum", &self.quorum_size())
            .field("pending", &self.pending.as_ref().map(|p| p.enable_index))
            .finish()
    }
}

impl ViewConfig {
    /// Build the configuration from the genesis ledger config.
    pub fn new(genesis: &LedgerConfig) -> Result<Self, MembershipError> {
        let membership = Membership::new(genesis.membership.clone())?;
        Ok(Self {
            view: View(0),
            membership,
            pending: None,
            active_from: BlockNumber(1),
            leader_selection: Box::new(RotatingLeader),
            quorum_policy: policy_from_kind(genesis.quorum_policy),
            leader_period: genesis.leader_period.max(1),
            features: genesis.features.clone(),
            block_tx_count_limit: genesis.block_tx_count_limit,
        })
    }

    /// Replace the leader selection strategy.
    pub fn with_leader_selection(mut self, selection: Box<dyn LeaderSelection>) -> Self {
        self.leader_selection = selection;
        self
    }

    /// Replace the quorum policy.
    pub fn with_quorum_policy(mut self, policy: Box<dyn QuorumPolicy>) -> Self {
        self.quorum_policy = policy;
        self
    }

    pub fn current_view(&self) -> View {
        self.view
    }

    /// Move to `view`. Views never decrease.
    pub fn set_view(&mut self, view: View) {
        if view > self.view {
            self.view = view;
        }
    }

    pub fn leader_of(&self, view: View, index: BlockNumber) -> Option<NodeIndex> {
        let ctx = LeaderContext {
            membership: &self.membership,
            features: &self.features,
            leader_period: self.leader_period,
        };
        self.leader_selection.leader_of(&ctx, view, index)
    }

    pub fn is_leader(&self, node: NodeIndex, view: View, index: BlockNumber) -> bool {
        self.leader_of(view, index) == Some(node)
    }

    pub fn quorum_size(&self) -> u64 {
        self.quorum_policy.quorum(self.membership.total_weight())
    }

    /// Weight that guarantees at least one honest member: `total - quorum + 1`.
    pub fn weak_quorum_size(&self) -> u64 {
        let total = self.membership.total_weight();
        total.saturating_sub(self.quorum_size()) + 1
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn features(&self) -> &Features {
        &self.features
    }

    pub fn block_tx_count_limit(&self) -> u64 {
        self.block_tx_count_limit
    }

    pub fn index_of(&self, node_id: &NodeId) -> Option<NodeIndex> {
        self.membership.index_of(node_id)
    }

    pub fn weight_of(&self, node: NodeIndex) -> u64 {
        self.membership.weight_of(node)
    }

    pub fn keyring(&self) -> Keyring {
        self.membership.keyring()
    }

    pub fn pending_enable_index(&self) -> Option<BlockNumber> {
        self.pending.as_ref().map(|p| p.enable_index)
    }

    /// Schedule a new sealer set for `enable_index`.
    ///
    /// The set is validated immediately; an invalid set is rejected and the
    /// previous membership (and any earlier schedule) stays in force.
    pub fn update_membership(
        &mut self,
        nodes: Vec<ConsensusNode>,
        enable_index: BlockNumber,
    ) -> Result<(), MembershipError> {
        let membership = self.validate(nodes, enable_index)?;
        self.pending = Some(PendingConfig {
            enable_index,
            membership,
            quorum_policy: None,
            leader_period: None,
            features: None,
            block_tx_count_limit: None,
        });
        Ok(())
    }

    /// Schedule a complete ledger configuration at its enable index.
    pub fn schedule(&mut self, config: LedgerConfig) -> Result<(), MembershipError> {
        let membership = self.validate(config.membership, config.enable_index)?;
        self.pending = Some(PendingConfig {
            enable_index: config.enable_index,
            membership,
            quorum_policy: Some(config.quorum_policy),
            leader_period: Some(config.leader_period.max(1)),
            features: Some(config.features),
            block_tx_count_limit: Some(config.block_tx_count_limit),
        });
        Ok(())
    }

    fn validate(
        &self,
        nodes: Vec<ConsensusNode>,
        enable_index: BlockNumber,
    ) -> Result<Membership, MembershipError> {
        if enable_index < self.active_from {
            return Err(MembershipError::EnableIndexPassed {
                enable: enable_index.0,
                committed: self.active_from.0.saturating_sub(1),
            });
        }
        Membership::new(nodes)
    }

    /// Called when the engine is about to process `next_index`.
    ///
    /// Applies a scheduled configuration whose enable index has been reached.
    pub fn apply_pending(&mut self, next_index: BlockNumber) -> Option<MembershipChange> {
        self.active_from = self.active_from.max(next_index);
        let ready = self
            .pending
            .as_ref()
            .is_some_and(|p| p.enable_index <= next_index);
        if !ready {
            return None;
        }
        let pending = self.pending.take()?;

        let old_quorum = self.quorum_size();
        self.membership = pending.membership;
        if let Some(kind) = pending.quorum_policy {
            self.quorum_policy = policy_from_kind(kind);
        }
        if let Some(period) = pending.leader_period {
            self.leader_period = period;
        }
        if let Some(features) = pending.features {
            self.features = features;
        }
        if let Some(limit) = pending.block_tx_count_limit {
            self.block_tx_count_limit = limit;
        }
        let change = MembershipChange {
            enable_index: pending.enable_index,
            old_quorum,
            new_quorum: self.quorum_size(),
        };

        info!(
            enable_index = change.enable_index.0,
            sealers = self.membership.sealer_count(),
            old_quorum = change.old_quorum,
            new_quorum = change.new_quorum,
            "Applied scheduled membership"
        );
        Some(change)
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            view: self.view,
            sealers: self.membership.sealers().to_vec(),
            observers: self.membership.observers().to_vec(),
            total_weight: self.membership.total_weight(),
            quorum: self.quorum_size(),
            weak_quorum: self.weak_quorum_size(),
            leader_period: self.leader_period,
            pending_enable_index: self.pending_enable_index(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbft_types::test_utils::{test_committee, test_weighted_committee};
    use tracing_test::traced_test;

    fn config(n: u8) -> ViewConfig {
        let (_, nodes) = test_committee(n);
        ViewConfig::new(&LedgerConfig::new(nodes)).unwrap()
    }

    #[test]
    fn test_byzantine_quorum_sizes() {
        assert_eq!(ByzantineQuorum.quorum(4), 3);
        assert_eq!(ByzantineQuorum.quorum(7), 5);
        assert_eq!(ByzantineQuorum.quorum(1), 1);
        // n - f when n is not of the form 3f+1
        assert_eq!(ByzantineQuorum.quorum(5), 4);
        assert_eq!(ByzantineQuorum.quorum(6), 5);
        assert_eq!(FixedQuorum(10).quorum(4), 4);
        assert_eq!(FixedQuorum(2).quorum(4), 2);
    }

    #[test]
    fn test_weak_quorum_is_f_plus_one() {
        let config = config(4);
        assert_eq!(config.quorum_size(), 3);
        assert_eq!(config.weak_quorum_size(), 2);
    }

    #[test]
    fn test_leader_rotates_with_view_and_index() {
        let config = config(4);
        assert_eq!(config.leader_of(View(0), BlockNumber(1)), Some(NodeIndex(1)));
        assert_eq!(config.leader_of(View(1), BlockNumber(1)), Some(NodeIndex(2)));
        assert_eq!(config.leader_of(View(0), BlockNumber(4)), Some(NodeIndex(0)));
        assert_eq!(config.leader_of(View(3), BlockNumber(2)), Some(NodeIndex(1)));
    }

    #[test]
    fn test_leader_period_keeps_leader_for_consecutive_indices() {
        let (_, nodes) = test_committee(4);
        let mut ledger = LedgerConfig::new(nodes);
        ledger.leader_period = 3;
        let config = ViewConfig::new(&ledger).unwrap();
        let leaders: Vec<_> = (3..6)
            .map(|i| config.leader_of(View(0), BlockNumber(i)))
            .collect();
        assert!(leaders.iter().all(|l| *l == Some(NodeIndex(1))));
        assert_eq!(config.leader_of(View(0), BlockNumber(6)), Some(NodeIndex(2)));
    }

    #[test]
    fn test_weighted_rotation_respects_activation_height() {
        let (_, nodes) = test_weighted_committee(&[3, 1]);
        let mut ledger = LedgerConfig::new(nodes);
        ledger.features = Features::new().with(Feature::WeightedLeaderRotation, BlockNumber(10));
        let config = ViewConfig::new(&ledger).unwrap();

        // Below activation: plain round robin over two sealers.
        assert_eq!(config.leader_of(View(0), BlockNumber(1)), Some(NodeIndex(1)));

        // Above activation: sealer 0 owns three of every four slots.
        let weighted: Vec<_> = (12..16)
            .map(|i| config.leader_of(View(0), BlockNumber(i)))
            .collect();
        let zero = weighted.iter().filter(|l| **l == Some(NodeIndex(0))).count();
        assert_eq!(zero, 3);
    }

    #[traced_test]
    #[test]
    fn test_membership_applies_only_at_enable_index() {
        let mut config = config(4);
        let (_, larger) = test_committee(7);

        config
            .update_membership(larger, BlockNumber(5))
            .unwrap();
        assert_eq!(config.apply_pending(BlockNumber(4)), None);
        assert_eq!(config.membership().sealer_count(), 4);

        let change = config.apply_pending(BlockNumber(5)).unwrap();
        assert!(change.quorum_changed());
        assert_eq!(change.new_quorum, 5);
        assert_eq!(config.membership().sealer_count(), 7);
    }

    #[test]
    fn test_invalid_membership_is_rejected() {
        let mut config = config(4);
        let (_, nodes) = test_committee(4);
        let mut duplicated = nodes.clone();
        duplicated.push(nodes[0].clone());

        assert!(matches!(
            config.update_membership(duplicated, BlockNumber(5)),
            Err(MembershipError::DuplicateNode(_))
        ));
        assert!(matches!(
            config.update_membership(vec![], BlockNumber(5)),
            Err(MembershipError::NoSealers)
        ));
        assert_eq!(config.pending_enable_index(), None);
        assert_eq!(config.membership().sealer_count(), 4);
    }

    #[test]
    fn test_enable_index_in_the_past_is_rejected() {
        let mut config = config(4);
        config.apply_pending(BlockNumber(10));
        let (_, nodes) = test_committee(4);
        assert!(matches!(
            config.update_membership(nodes, BlockNumber(3)),
            Err(MembershipError::EnableIndexPassed { .. })
        ));
    }

    #[test]
    fn test_view_never_decreases() {
        let mut config = config(4);
        config.set_view(View(3));
        config.set_view(View(2));
        assert_eq!(config.current_view(), View(3));
    }
}

//! Catch-up for restarted or lagging nodes.

use crate::validator::MessageValidator;
use crate::view::ViewConfig;
use pbft_messages::CommittedProposal;
use pbft_types::{BlockNumber, NodeIndex, View};
use std::collections::BTreeMap;
use std::time::Duration;

/// Rate limiting for recovery requests, the view and height reports they
/// return, and how far this node still has to catch up.
#[derive(Debug)]
pub struct RecoveryState {
    interval: Duration,
    last_request: Option<Duration>,
    /// Latest view reported by each responder.
    view_reports: BTreeMap<NodeIndex, View>,
    /// Latest committed index reported by each responder.
    height_reports: BTreeMap<NodeIndex, BlockNumber>,
    /// Committed index proven by a checkpoint quorum or a NewView.
    proven_target: BlockNumber,
    /// Committed index when a view change was last deferred for catch-up.
    deferred_at: Option<BlockNumber>,
}

impl RecoveryState {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_request: None,
            view_reports: BTreeMap::new(),
            height_reports: BTreeMap::new(),
            proven_target: BlockNumber::GENESIS,
            deferred_at: None,
        }
    }

    /// Whether a request may be sent at `now`. Records the attempt if so.
    pub fn try_request(&mut self, now: Duration) -> bool {
        let allowed = self
            .last_request
            .map_or(true, |last| now.saturating_sub(last) >= self.interval);
        if allowed {
            self.last_request = Some(now);
        }
        allowed
    }

    /// Record a responder's view. Returns the highest view above `current`
    /// that a quorum of responders has reached, if any.
    pub fn record_view(
        &mut self,
        from: NodeIndex,
        view: View,
        config: &ViewConfig,
    ) -> Option<View> {
        let entry = self.view_reports.entry(from).or_default();
        *entry = (*entry).max(view);

        let mut reports: Vec<(View, u64)> = self
            .view_reports
            .iter()
            .map(|(node, view)| (*view, config.weight_of(*node)))
            .collect();
        reports.sort_by(|a, b| b.0.cmp(&a.0));

        let mut weight = 0;
        for (view, w) in reports {
            weight += w;
            if weight >= config.quorum_size() {
                return (view > config.current_view()).then_some(view);
            }
        }
        None
    }

    /// Record a responder's committed index.
    pub fn record_height(&mut self, from: NodeIndex, index: BlockNumber) {
        let entry = self.height_reports.entry(from).or_default();
        *entry = (*entry).max(index);
    }

    /// Raise the catch-up target to an index known to be committed.
    pub fn raise_target(&mut self, index: BlockNumber) {
        self.proven_target = self.proven_target.max(index);
    }

    /// Highest index known to be committed by peers: the proven target, or
    /// the highest height reported by weak-quorum weight.
    pub fn sync_target(&self, config: &ViewConfig) -> BlockNumber {
        let mut reports: Vec<(BlockNumber, u64)> = self
            .height_reports
            .iter()
            .map(|(node, index)| (*index, config.weight_of(*node)))
            .collect();
        reports.sort_by(|a, b| b.0.cmp(&a.0));

        let mut weight = 0;
        let mut reported = BlockNumber::GENESIS;
        for (index, w) in reports {
            weight += w;
            if weight >= config.weak_quorum_size() {
                reported = index;
                break;
            }
        }
        self.proven_target.max(reported)
    }

    /// Whether a consensus timeout should re-arm instead of starting a view
    /// change. True while peers are ahead of `committed` and catch-up has
    /// advanced since the previous deferral.
    pub fn defer_view_change(&mut self, committed: BlockNumber, config: &ViewConfig) -> bool {
        if self.sync_target(config) <= committed {
            self.deferred_at = None;
            return false;
        }
        if self.deferred_at.is_some_and(|at| at >= committed) {
            return false;
        }
        self.deferred_at = Some(committed);
        true
    }

    /// Forget view reports at or below an adopted view.
    pub fn on_view_adopted(&mut self, view: View) {
        self.view_reports.retain(|_, v| *v > view);
    }

    /// Whether a committed proposal carries a Commit quorum for its hash.
    pub fn has_commit_quorum(committed: &CommittedProposal, config: &ViewConfig) -> bool {
        MessageValidator::vote_weight(&committed.commits, &committed.proposal.hash, config)
            >= config.quorum_size()
    }
}

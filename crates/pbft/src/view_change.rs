//! View change collection and NewView construction.
//!
//! # Joining a higher view
//!
//! A node that times out broadcasts a ViewChange for the next view. A node
//! that has not timed out still joins once view changes for higher views
//! carry weak-quorum weight (f+1), since at least one honest node has
//! given up on the current leader. It joins the smallest such view.
//!
//! # NewView
//!
//! When a quorum of view changes for the same view is collected, the leader of
//! that view re-proposes the highest-view prepared proposal for every index
//! above the quorum's lowest committed index.
//!
//! Only each sender's highest view change is kept, so the collectors hold at
//! most one vote per sealer.

use crate::validator::highest_prepared;
use crate::view::ViewConfig;
use pbft_messages::{lowest_committed_index, NewViewMsg, PrePrepareMsg, ViewChangeMsg};
use pbft_types::{KeyPair, NodeIndex, View};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Result of recording a view change vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewChangeOutcome {
    /// Recorded. `join` is set when the weak-quorum rule asks us to move to
    /// a higher view than we are targeting.
    Added { join: Option<View> },
    /// This sender already voted for this view or a higher one.
    Duplicate,
    /// This vote completed a quorum for `view`. Fires once per view.
    QuorumReached { view: View, join: Option<View> },
}

#[derive(Debug, Default)]
pub struct ViewChangeState {
    /// Votes per target view, one per sender.
    collectors: BTreeMap<View, BTreeMap<NodeIndex, ViewChangeMsg>>,
    /// Highest view each sender has voted for.
    latest: BTreeMap<NodeIndex, View>,
    /// Views whose quorum has already been announced.
    reached: BTreeSet<View>,
    /// View we are currently trying to move to, if any.
    target: Option<View>,
    /// Our last broadcast vote, kept for re-broadcast.
    last_sent: Option<ViewChangeMsg>,
}

impl ViewChangeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(&self) -> Option<View> {
        self.target
    }

    pub fn last_sent(&self) -> Option<&ViewChangeMsg> {
        self.last_sent.as_ref()
    }

    /// The view to ask for on the next timeout: one past both the current
    /// view and any view we already asked for.
    pub fn next_target(&self, current: View) -> View {
        let base = self.target.map_or(current, |t| t.max(current));
        base.next()
    }

    /// Remember our own vote. The caller records it with [`Self::add`] as well.
    pub fn on_sent(&mut self, vote: ViewChangeMsg) {
        self.target = Some(self.target.map_or(vote.to_view, |t| t.max(vote.to_view)));
        self.last_sent = Some(vote);
    }

    /// Record a verified view change.
    pub fn add(&mut self, vote: ViewChangeMsg, config: &ViewConfig) -> ViewChangeOutcome {
        let view = vote.to_view;
        let from = vote.from;
        match self.latest.get(&from) {
            Some(latest) if *latest >= view => return ViewChangeOutcome::Duplicate,
            Some(latest) => {
                let superseded = *latest;
                if let Some(votes) = self.collectors.get_mut(&superseded) {
                    votes.remove(&from);
                    if votes.is_empty() {
                        self.collectors.remove(&superseded);
                    }
                }
            }
            None => {}
        }
        self.latest.insert(from, view);
        let votes = self.collectors.entry(view).or_default();
        votes.insert(from, vote);

        let weight: u64 = votes.keys().map(|n| config.weight_of(*n)).sum();
        debug!(
            view = view.0,
            from = from.0,
            weight,
            quorum = config.quorum_size(),
            "View change recorded"
        );

        let join = self.join_target(config);
        if weight >= config.quorum_size() && self.reached.insert(view) {
            info!(view = view.0, weight, "View change quorum reached");
            return ViewChangeOutcome::QuorumReached { view, join };
        }
        ViewChangeOutcome::Added { join }
    }

    /// Smallest higher view backed by weak-quorum weight, if we are not
    /// already targeting it or something above it.
    fn join_target(&self, config: &ViewConfig) -> Option<View> {
        let floor = self
            .target
            .map_or(config.current_view(), |t| t.max(config.current_view()));
        let mut senders = BTreeSet::new();
        let mut smallest: Option<View> = None;
        for (view, votes) in self.collectors.range(floor.next()..) {
            smallest.get_or_insert(*view);
            senders.extend(votes.keys().copied());
        }
        let weight: u64 = senders.iter().map(|n| config.weight_of(*n)).sum();
        if weight >= config.weak_quorum_size() {
            smallest
        } else {
            None
        }
    }

    /// Votes collected for `view`.
    pub fn votes_for(&self, view: View) -> Vec<ViewChangeMsg> {
        self.collectors
            .get(&view)
            .map(|votes| votes.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Build the NewView for `view` if we are its leader.
    pub fn build_new_view(
        &self,
        view: View,
        config: &ViewConfig,
        self_index: NodeIndex,
        key: &KeyPair,
    ) -> Option<NewViewMsg> {
        let view_changes = self.votes_for(view);
        let base = lowest_committed_index(&view_changes);
        if !config.is_leader(self_index, view, base.next()) {
            return None;
        }

        let pre_prepares = highest_prepared(&view_changes, base, config)
            .into_values()
            .map(|cert| {
                PrePrepareMsg::new(view, cert.pre_prepare.proposal, self_index, true, key)
            })
            .collect::<Vec<_>>();

        info!(
            view = view.0,
            base_index = base.0,
            reproposed = pre_prepares.len(),
            "Building new view"
        );
        Some(NewViewMsg::new(view, self_index, view_changes, pre_prepares, key))
    }

    /// A view was adopted: forget everything at or below it.
    pub fn on_view_adopted(&mut self, view: View) {
        self.collectors.retain(|v, _| *v > view);
        self.latest.retain(|_, v| *v > view);
        self.reached.retain(|v| *v > view);
        if self.target.is_some_and(|t| t <= view) {
            self.target = None;
            self.last_sent = None;
        }
    }
}

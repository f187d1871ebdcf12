//! PBFT consensus state machine.
//!
//! This crate provides a synchronous PBFT implementation that can be used for
//! both simulation and production.
//!
//! # Architecture
//!
//! The state machine processes events synchronously:
//!
//! - `Event::SubmitProposal` → Broadcast a PrePrepare if we lead the index
//! - `Event::MessageReceived` → Admission checks, then delegated signature verification
//! - `Event::MessageVerified` → Count votes, advance slots, handle view changes
//! - `Event::QuorumReached` → Prepare → Commit → apply → checkpoint
//! - `Event::ConsensusTimeout` → Request a view change
//!
//! All I/O is performed by the runner via returned `Action`s.
//!
//! # Terminology
//!
//! - **Index**: Position in the committed sequence (1, 2, 3, ...). Proposals are
//!   applied strictly in index order; several may be in flight up to the high
//!   water mark (`committed_index + water_mark_limit`).
//!
//! - **View**: Epoch of leadership. The leader of `(view, index)` rotates with
//!   both, so a view change moves leadership for every pending index.
//!
//! - **Sealer / Observer**: Sealers vote and carry weight; observers follow
//!   the committed sequence but never sign.
//!
//! - **Quorum**: Weighted threshold, `n - f` of total weight by default. The
//!   weak quorum (`f + 1`) is enough to convince a node to join a view change.
//!
//! - **Checkpoint**: Vote on the post-execution result of an applied index. A
//!   checkpoint backed by quorum is stable and releases everything below it.
//!
//! # Protocol
//!
//! ## Safety
//!
//! - **One hash per slot**: a node votes for at most one hash per
//!   `(view, index, phase)`; a second hash is recorded as equivocation.
//!
//! - **Prepared evidence**: a proposal that gathered a prepare quorum is carried
//!   into every view change, and the next leader must re-propose it.
//!
//! - **Commit finality**: once a commit quorum exists for an index, no other hash
//!   is accepted there, even after a view change.
//!
//! ## Liveness
//!
//! - **Exponential timeout**: every commit resets the consensus timeout; every
//!   expiry doubles it and asks for the next view.
//!
//! - **Recovery**: nodes that fall behind fetch committed proposals together
//!   with their commit quorum, and adopt a view reported by a quorum of peers.

mod cache;
mod config;
mod quorum;
mod recovery;
mod state;
mod timeout;
mod validator;
mod view;
mod view_change;

pub use cache::{InsertOutcome, ProposalCache, Slot, SlotPhase};
pub use config::PbftConfig;
pub use quorum::{QuorumCertificate, QuorumStore, VoteOutcome};
pub use recovery::RecoveryState;
pub use state::{ConsensusSnapshot, PbftState, PbftStats, SubmitError};
pub use timeout::{TimeoutController, TimerState};
pub use validator::{
    highest_prepared, MessageValidator, NewViewPlan, RejectReason, ValidationContext, Verdict,
};
pub use view::{
    ByzantineQuorum, FixedQuorum, LeaderContext, LeaderSelection, MembershipChange,
    QuorumPolicy, RotatingLeader, ViewConfig, ViewSnapshot,
};
pub use view_change::{ViewChangeOutcome, ViewChangeState};

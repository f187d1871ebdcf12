//! Deterministic simulation for PBFT consensus.
//!
//! Every node is a [`pbft::PbftState`] driven by a single global event queue.
//! Network latency, jitter, packet loss and partitions come from a seeded
//! RNG; signature checks and proposal application run inline. Given the same
//! seed and the same scenario, a run is reproducible event for event.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │ SimulationRunner                                          │
//! │   event_queue: BTreeMap<(time, priority, node, seq), Ev>  │
//! │        │                                                  │
//! │        ▼                                                  │
//! │   node.handle(event) ──► actions ──► schedule new events  │
//! │                              │                            │
//! │          SimulatedNetwork ◄──┘──► SimExecutor (inline)    │
//! └───────────────────────────────────────────────────────────┘
//! ```

mod event_queue;
mod executor;
mod network;
mod runner;

pub use event_queue::EventKey;
pub use executor::SimExecutor;
pub use network::{NetworkConfig, SimulatedNetwork};
pub use runner::{SimulationConfig, SimulationRunner, SimulationStats};

/// Position of a node in the simulation. Sealers of the genesis
/// configuration come first, in sealer index order, followed by observers.
pub type NodeIndex = u32;

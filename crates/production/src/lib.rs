//! Production runner with async I/O.
//!
//! This crate wraps the deterministic PBFT state machine with real I/O:
//!
//! - Network messages via a pluggable [`Transport`]
//! - Timers via tokio tasks
//! - Signature verification on a dedicated rayon thread pool
//! - Proposal application on a dedicated rayon thread pool
//! - Durable consensus state via a [`ConsensusStore`]
//!
//! # Architecture
//!
//! Uses the event aggregator pattern: a single task owns the state machine
//! and receives events via mpsc channels. This avoids mutex contention.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            PBFT Node                                    │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │  PbftRunner                                                         ││
//! │  │    └─ loop { event = recv(); actions = state.handle(event); }       ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! │                                │                                        │
//! │    ┌───────────────────────────┼───────────────────────────────┐        │
//! │    ▼                           ▼                               ▼        │
//! │  Crypto Pool (rayon)      Apply Pool (rayon)           I/O Pool (tokio) │
//! │  - Ed25519 verification   - Executor::apply_proposal   - Transport      │
//! │  - Certificate checks     - Ledger config fetch        - Timers         │
//! │                                                        - HTTP endpoint  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Wiring a node
//!
//! ```no_run
//! use pbft_production::{LoopbackNetwork, MemoryLedger, PbftRunner};
//! use pbft_types::{ConsensusNode, KeyPair, LedgerConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let key = KeyPair::from_seed(&[1; 32])?;
//! let genesis = LedgerConfig::new(vec![ConsensusNode::sealer(key.node_id(), 1)]);
//! let network = LoopbackNetwork::new();
//!
//! let mut runner = PbftRunner::builder()
//!     .signing_key(key.clone())
//!     .genesis(genesis.clone())
//!     .transport(Arc::new(network.transport(key.node_id())))
//!     .executor(Arc::new(MemoryLedger::new(genesis)))
//!     .build()?;
//! network.attach(key.node_id(), runner.inbound_handle());
//!
//! let submitter = runner.proposal_submitter();
//! let shutdown = runner.shutdown_handle();
//! tokio::spawn(runner.run());
//! # let _ = (submitter, shutdown);
//! # Ok(())
//! # }
//! ```

mod codec;
mod config;
mod executor;
pub mod metrics;
mod runner;
mod status;
mod storage;
pub mod telemetry;
mod thread_pools;
mod timers;
mod transport;

pub use codec::{decode_message, encode_message, CodecError, MAX_FRAME_SIZE, WIRE_VERSION};
pub use config::{
    load_keypair, parse_node_id, ConfigError, ConsensusSection, FeatureActivation, GenesisNode,
    GenesisSection, NodeConfig, NodeSection, TelemetrySection, ThreadsSection,
};
pub use executor::{Executor, MemoryLedger};
pub use runner::{
    PbftRunner, PbftRunnerBuilder, ProposalError, ProposalSubmitter, RunnerError, ShutdownHandle,
};
pub use status::{NodeStatusResponse, StatusHandle};
pub use storage::{ConsensusStore, FileStore, MemoryStore, StorageError};
pub use telemetry::{init_telemetry, LogFormat, TelemetryConfig, TelemetryError, TelemetryGuard};
pub use thread_pools::{ThreadPoolConfig, ThreadPoolConfigBuilder, ThreadPoolError, ThreadPoolManager};
pub use timers::TimerManager;
pub use transport::{InboundHandle, LoopbackNetwork, LoopbackTransport, Transport, TransportError};

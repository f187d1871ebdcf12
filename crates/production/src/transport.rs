//! Transport seam between the runner and whatever carries bytes between nodes.
//!
//! Outbound, the runner encodes each message once and hands the frame to a
//! [`Transport`]. Inbound, the transport calls
//! [`InboundHandle::on_receive_message`] with the authenticated sender and the
//! raw frame; the handle decodes it and queues it for the state machine.
//!
//! [`LoopbackNetwork`] connects several runners inside one process and is
//! used by the integration tests.

use crate::codec::{decode_message, CodecError};
use crate::metrics;
use parking_lot::RwLock;
use pbft_core::Event;
use pbft_types::NodeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Errors surfaced to the transport when an inbound frame is not queued.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to decode frame: {0}")]
    Decode(#[from] CodecError),

    #[error("Consensus channel full")]
    ChannelFull,

    #[error("Consensus channel closed")]
    ChannelClosed,
}

/// Sends encoded frames to other consensus nodes.
///
/// Implementations must not block: the runner calls these from its event loop.
/// Delivery is best effort; the protocol tolerates loss through timeouts,
/// checkpoint re-broadcast and recovery.
pub trait Transport: Send + Sync {
    /// Send a frame to one node.
    fn send_to(&self, to: NodeId, frame: Vec<u8>);

    /// Send a frame to every other node.
    fn broadcast(&self, frame: Vec<u8>);
}

/// Inbound entry point handed to the transport.
#[derive(Clone)]
pub struct InboundHandle {
    consensus_tx: mpsc::Sender<Event>,
}

impl InboundHandle {
    pub(crate) fn new(consensus_tx: mpsc::Sender<Event>) -> Self {
        Self { consensus_tx }
    }

    /// Decode a frame received from `from` and queue it for the state machine.
    ///
    /// `from` must be the identity authenticated by the transport. A full
    /// channel drops the frame rather than stalling the transport.
    pub fn on_receive_message(&self, from: NodeId, raw: &[u8]) -> Result<(), TransportError> {
        let message = match decode_message(raw) {
            Ok(message) => message,
            Err(e) => {
                debug!(peer = %from, error = %e, "Failed to decode message");
                metrics::record_decode_failure();
                return Err(e.into());
            }
        };
        metrics::record_network_message_received(message.type_name());

        match self
            .consensus_tx
            .try_send(Event::MessageReceived { from, message })
        {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(peer = %from, "Consensus channel full, dropping message");
                Err(TransportError::ChannelFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::ChannelClosed),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Loopback
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct LoopbackInner {
    peers: HashMap<NodeId, InboundHandle>,
    offline: HashSet<NodeId>,
}

/// In-process hub connecting runners by [`NodeId`].
///
/// Nodes marked offline neither send nor receive, which simulates a crash
/// without tearing down the runner.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<RwLock<LoopbackInner>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route frames addressed to `node_id` into `inbound`. Re-attaching
    /// replaces the previous handle, which is how a restarted runner rejoins.
    pub fn attach(&self, node_id: NodeId, inbound: InboundHandle) {
        self.inner.write().peers.insert(node_id, inbound);
    }

    pub fn detach(&self, node_id: NodeId) {
        self.inner.write().peers.remove(&node_id);
    }

    /// The transport `local` should send through.
    pub fn transport(&self, local: NodeId) -> LoopbackTransport {
        LoopbackTransport {
            local,
            network: self.clone(),
        }
    }

    pub fn set_online(&self, node_id: NodeId, online: bool) {
        let mut inner = self.inner.write();
        if online {
            inner.offline.remove(&node_id);
        } else {
            inner.offline.insert(node_id);
        }
    }

    fn deliver(&self, from: NodeId, to: NodeId, frame: &[u8]) {
        let inner = self.inner.read();
        if inner.offline.contains(&from) || inner.offline.contains(&to) {
            trace!(%from, %to, "Dropping frame for offline node");
            return;
        }
        if let Some(handle) = inner.peers.get(&to) {
            // Errors are already logged by the handle.
            let _ = handle.on_receive_message(from, frame);
        }
    }

    fn peers_except(&self, node_id: NodeId) -> Vec<NodeId> {
        self.inner
            .read()
            .peers
            .keys()
            .filter(|id| **id != node_id)
            .copied()
            .collect()
    }
}

/// A node's view of the [`LoopbackNetwork`].
#[derive(Clone)]
pub struct LoopbackTransport {
    local: NodeId,
    network: LoopbackNetwork,
}

impl Transport for LoopbackTransport {
    fn send_to(&self, to: NodeId, frame: Vec<u8>) {
        self.network.deliver(self.local, to, &frame);
    }

    fn broadcast(&self, frame: Vec<u8>) {
        for to in self.network.peers_except(self.local) {
            self.network.deliver(self.local, to, &frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_message;
    use pbft_messages::{PbftMessage, RecoverRequestMsg};
    use pbft_types::test_utils::test_keypair;
    use pbft_types::{BlockNumber, NodeIndex, View};

    fn frame() -> Vec<u8> {
        let key = test_keypair(1);
        let msg = RecoverRequestMsg::new(View(0), BlockNumber(3), NodeIndex(0), &key);
        encode_message(&PbftMessage::RecoverRequest(msg)).unwrap()
    }

    #[tokio::test]
    async fn test_inbound_handle_queues_decoded_message() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = InboundHandle::new(tx);
        let from = test_keypair(1).node_id();

        handle.on_receive_message(from, &frame()).unwrap();

        match rx.recv().await {
            Some(Event::MessageReceived { from: got, message }) => {
                assert_eq!(got, from);
                assert_eq!(message.index(), BlockNumber(3));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inbound_handle_rejects_bad_frames() {
        let (tx, _rx) = mpsc::channel(4);
        let handle = InboundHandle::new(tx);
        let result = handle.on_receive_message(test_keypair(1).node_id(), &[7, 1, 2]);
        assert!(matches!(result, Err(TransportError::Decode(_))));
    }

    #[tokio::test]
    async fn test_inbound_handle_reports_full_channel() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = InboundHandle::new(tx);
        let from = test_keypair(1).node_id();

        handle.on_receive_message(from, &frame()).unwrap();
        assert!(matches!(
            handle.on_receive_message(from, &frame()),
            Err(TransportError::ChannelFull)
        ));
    }

    #[tokio::test]
    async fn test_loopback_broadcast_skips_self_and_offline() {
        let network = LoopbackNetwork::new();
        let ids: Vec<NodeId> = (1..=3).map(|s| test_keypair(s).node_id()).collect();
        let mut receivers = Vec::new();
        let mut transports = Vec::new();
        for id in &ids {
            let (tx, rx) = mpsc::channel(8);
            network.attach(*id, InboundHandle::new(tx));
            transports.push(network.transport(*id));
            receivers.push(rx);
        }

        network.set_online(ids[2], false);
        transports[0].broadcast(frame());

        assert!(receivers[0].try_recv().is_err());
        assert!(receivers[1].try_recv().is_ok());
        assert!(receivers[2].try_recv().is_err());

        network.set_online(ids[2], true);
        transports[0].send_to(ids[2], frame());
        assert!(receivers[2].try_recv().is_ok());
    }
}

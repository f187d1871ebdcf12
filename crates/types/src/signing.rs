//! Domain-separated signing payloads.
//!
//! Every signed message kind gets its own domain tag so a signature produced
//! for one kind can never be replayed as another.

use crate::{BlockNumber, Hash, NodeIndex, View};

pub const DOMAIN_PROPOSAL: &[u8] = b"pbft/proposal:";
pub const DOMAIN_PRE_PREPARE: &[u8] = b"pbft/pre_prepare:";
pub const DOMAIN_VOTE: &[u8] = b"pbft/vote:";
pub const DOMAIN_VIEW_CHANGE: &[u8] = b"pbft/view_change:";
pub const DOMAIN_NEW_VIEW: &[u8] = b"pbft/new_view:";
pub const DOMAIN_RECOVER_REQUEST: &[u8] = b"pbft/recover_request:";
pub const DOMAIN_RECOVER_RESPONSE: &[u8] = b"pbft/recover_response:";

/// Little-endian builder for signing payloads.
#[derive(Debug, Clone)]
pub struct SigningBuffer {
    bytes: Vec<u8>,
}

impl SigningBuffer {
    pub fn new(domain: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(domain.len() + 96);
        bytes.extend_from_slice(domain);
        Self { bytes }
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.bytes.push(v);
        self
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn bool(self, v: bool) -> Self {
        self.u8(v as u8)
    }

    pub fn view(self, v: View) -> Self {
        self.u64(v.0)
    }

    pub fn index(self, v: BlockNumber) -> Self {
        self.u64(v.0)
    }

    pub fn node(mut self, v: NodeIndex) -> Self {
        self.bytes.extend_from_slice(&v.0.to_le_bytes());
        self
    }

    pub fn hash(mut self, v: &Hash) -> Self {
        self.bytes.extend_from_slice(v.as_bytes());
        self
    }

    /// Length-prefixed raw bytes.
    pub fn bytes(mut self, v: &[u8]) -> Self {
        self.bytes.extend_from_slice(&(v.len() as u64).to_le_bytes());
        self.bytes.extend_from_slice(v);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

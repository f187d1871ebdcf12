//! Message encoding and decoding for network transport.
//!
//! # Wire Format
//!
//! ```text
//! [version: u8][payload: SBOR-encoded PbftMessage]
//! ```
//!
//! - Version is currently `1`
//! - The message kind is carried by the SBOR enum discriminator, so the
//!   transport does not need topics or per-kind channels.

use pbft_messages::PbftMessage;
use thiserror::Error;

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Frames larger than this are refused before decoding.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unknown wire version: {0}")]
    UnknownVersion(u8),

    #[error("Message too short")]
    MessageTooShort,

    #[error("Frame of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("SBOR decode error: {0}")]
    SborDecode(String),

    #[error("SBOR encode error: {0}")]
    SborEncode(String),
}

/// Encode a message to wire format.
pub fn encode_message(message: &PbftMessage) -> Result<Vec<u8>, CodecError> {
    let payload =
        sbor::basic_encode(message).map_err(|e| CodecError::SborEncode(format!("{:?}", e)))?;

    let mut bytes = Vec::with_capacity(1 + payload.len());
    bytes.push(WIRE_VERSION);
    bytes.extend(payload);

    if bytes.len() > MAX_FRAME_SIZE {
        return Err(CodecError::TooLarge {
            size: bytes.len(),
            limit: MAX_FRAME_SIZE,
        });
    }
    Ok(bytes)
}

/// Decode a message from wire format.
pub fn decode_message(data: &[u8]) -> Result<PbftMessage, CodecError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(CodecError::TooLarge {
            size: data.len(),
            limit: MAX_FRAME_SIZE,
        });
    }

    let (&version, payload) = data.split_first().ok_or(CodecError::MessageTooShort)?;
    if version != WIRE_VERSION {
        return Err(CodecError::UnknownVersion(version));
    }
    if payload.is_empty() {
        return Err(CodecError::MessageTooShort);
    }

    sbor::basic_decode(payload).map_err(|e| CodecError::SborDecode(format!("{:?}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbft_messages::{PrePrepareMsg, VoteMsg};
    use pbft_types::test_utils::test_keypair;
    use pbft_types::{BlockNumber, Hash, NodeIndex, Phase, Proposal, View};

    fn sample_pre_prepare() -> PbftMessage {
        let key = test_keypair(1);
        let hash = Hash::from_bytes(b"block-7");
        let proposal = Proposal::new(
            BlockNumber(7),
            View(2),
            hash,
            b"payload".to_vec(),
            3,
            NodeIndex(0),
            &key,
        );
        PbftMessage::PrePrepare(PrePrepareMsg::new(View(2), proposal, NodeIndex(0), false, &key))
    }

    #[test]
    fn test_encode_prepends_version() {
        let bytes = encode_message(&sample_pre_prepare()).unwrap();
        assert_eq!(bytes[0], WIRE_VERSION);
        assert!(bytes.len() > 1);
    }

    #[test]
    fn test_decode_preserves_message_kind_and_signature() {
        let key = test_keypair(2);
        let vote = VoteMsg::new(
            Phase::Commit,
            View(1),
            BlockNumber(4),
            Hash::from_bytes(b"h"),
            NodeIndex(1),
            &key,
        );
        let message = PbftMessage::Commit(vote);

        let decoded = decode_message(&encode_message(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert!(key
            .public_key()
            .verify(&decoded.signing_bytes(), decoded.signature()));
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let mut bytes = encode_message(&sample_pre_prepare()).unwrap();
        bytes[0] = 99;
        assert!(matches!(
            decode_message(&bytes),
            Err(CodecError::UnknownVersion(99))
        ));
    }

    #[test]
    fn test_decode_rejects_short_frames() {
        assert!(matches!(
            decode_message(&[]),
            Err(CodecError::MessageTooShort)
        ));
        assert!(matches!(
            decode_message(&[WIRE_VERSION]),
            Err(CodecError::MessageTooShort)
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let bytes = [WIRE_VERSION, 0xde, 0xad, 0xbe, 0xef];
        assert!(matches!(
            decode_message(&bytes),
            Err(CodecError::SborDecode(_))
        ));
    }
}

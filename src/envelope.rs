//! # Envelope Codec
//!
//! Stateless, deterministic codec between [`Message`] values and the
//! multipart wire envelope. Frame layout, in order:
//!
//! 1. identity frame (replies only; the opaque reply-routing token)
//! 2. empty delimiter frame
//! 3. version frame: encoded [`AppProtocolVersion`]
//! 4. type frame: one byte [`MessageKind`] tag
//! 5. sender peer frame: encoded [`Peer`]
//! 6. body frame(s): message-kind specific
//! 7. signature frame: Ed25519 over the concatenation of frames 3..=N-1
//!
//! The signature is domain-separated and verified with `verify_strict`
//! against the sender peer's public key. Any layout violation or
//! verification failure decodes to [`TransportError::InvalidMessage`].

use ed25519_dalek::Signature;

use crate::error::TransportError;
use crate::identity::{Keypair, Peer};
use crate::messages::{self, InboundMessage, Message, MessageKind};

/// Domain separation prefix for envelope signatures.
const ENVELOPE_SIGNATURE_DOMAIN: &[u8] = b"lattica-envelope-v1:";

/// Frames in an envelope before any body frame (delimiter, version, type,
/// sender), not counting the reply identity frame.
const LEADING_FRAMES: usize = 4;

/// Minimum frame count for a request envelope: leading frames plus the
/// signature. Bodies may be absent.
const MIN_REQUEST_FRAMES: usize = LEADING_FRAMES + 1;

/// A decoded, signature-verified envelope.
#[derive(Clone, Debug)]
pub struct DecodedEnvelope {
    pub reply_token: Option<Vec<u8>>,
    pub remote: Peer,
    pub message: Message,
    /// blake3 digest of the signed region, for history/dedup bookkeeping.
    pub digest: [u8; 32],
}

impl DecodedEnvelope {
    pub fn into_inbound(self) -> InboundMessage {
        InboundMessage {
            remote: self.remote,
            message: self.message,
            reply_token: self.reply_token,
        }
    }
}

/// Encode a request envelope (no identity frame).
pub fn encode(
    message: &Message,
    keypair: &Keypair,
    self_peer: &Peer,
) -> anyhow::Result<Vec<Vec<u8>>> {
    let mut frames = Vec::with_capacity(MIN_REQUEST_FRAMES + 1);
    frames.push(Vec::new());
    push_signed_frames(&mut frames, message, keypair, self_peer)?;
    Ok(frames)
}

/// Encode a reply envelope: the reply-routing token the router handed us
/// is echoed back as the leading identity frame.
pub fn encode_reply(
    message: &Message,
    keypair: &Keypair,
    self_peer: &Peer,
    reply_token: &[u8],
) -> anyhow::Result<Vec<Vec<u8>>> {
    anyhow::ensure!(!reply_token.is_empty(), "reply token must not be empty");
    let mut frames = Vec::with_capacity(MIN_REQUEST_FRAMES + 2);
    frames.push(reply_token.to_vec());
    frames.push(Vec::new());
    push_signed_frames(&mut frames, message, keypair, self_peer)?;
    Ok(frames)
}

fn push_signed_frames(
    frames: &mut Vec<Vec<u8>>,
    message: &Message,
    keypair: &Keypair,
    self_peer: &Peer,
) -> anyhow::Result<()> {
    let signed_start = frames.len();
    frames.push(messages::serialize(&self_peer.app_version)?);
    frames.push(vec![message.kind().as_byte()]);
    frames.push(messages::serialize(self_peer)?);
    frames.push(messages::serialize(message)?);

    let mut signed = Vec::with_capacity(ENVELOPE_SIGNATURE_DOMAIN.len());
    signed.extend_from_slice(ENVELOPE_SIGNATURE_DOMAIN);
    for frame in &frames[signed_start..] {
        signed.extend_from_slice(frame);
    }
    frames.push(keypair.sign(&signed).to_bytes().to_vec());
    Ok(())
}

/// Digest of the signed region of an encoded envelope, matching the digest
/// produced by [`decode`] for the same frames.
pub fn digest(frames: &[Vec<u8>], is_reply: bool) -> Option<[u8; 32]> {
    let start = if is_reply { 2 } else { 1 };
    if frames.len() < start + LEADING_FRAMES {
        return None;
    }
    let mut hasher = blake3::Hasher::new();
    for frame in &frames[start..frames.len() - 1] {
        hasher.update(frame);
    }
    Some(*hasher.finalize().as_bytes())
}

/// Decode and verify an envelope.
///
/// `is_reply` selects the expected layout: replies carry the identity
/// frame, initial requests do not.
pub fn decode(frames: &[Vec<u8>], is_reply: bool) -> Result<DecodedEnvelope, TransportError> {
    let (reply_token, rest) = if is_reply {
        let min = MIN_REQUEST_FRAMES + 1;
        if frames.len() < min {
            return Err(invalid(format!(
                "reply envelope has {} frames, expected at least {}",
                frames.len(),
                min
            )));
        }
        if frames[0].is_empty() {
            return Err(invalid("reply envelope has empty identity frame"));
        }
        (Some(frames[0].clone()), &frames[1..])
    } else {
        if frames.len() < MIN_REQUEST_FRAMES {
            return Err(invalid(format!(
                "request envelope has {} frames, expected at least {}",
                frames.len(),
                MIN_REQUEST_FRAMES
            )));
        }
        (None, frames)
    };

    if !rest[0].is_empty() {
        return Err(invalid("missing empty delimiter frame"));
    }

    let signed_frames = &rest[1..rest.len() - 1];
    let signature_frame = &rest[rest.len() - 1];

    let version: crate::version::AppProtocolVersion = messages::deserialize_bounded(&signed_frames[0])
        .map_err(|e| invalid(format!("bad version frame: {}", e)))?;

    if signed_frames[1].len() != 1 {
        return Err(invalid("type frame must be exactly one byte"));
    }
    let kind = MessageKind::from_byte(signed_frames[1][0])
        .ok_or_else(|| invalid(format!("unknown message kind 0x{:02x}", signed_frames[1][0])))?;

    let remote: Peer = messages::deserialize_bounded(&signed_frames[2])
        .map_err(|e| invalid(format!("bad sender peer frame: {}", e)))?;

    if remote.app_version != version {
        return Err(invalid("version frame does not match sender peer record"));
    }

    let bodies = &signed_frames[3..];
    if bodies.len() != 1 {
        return Err(invalid(format!("expected one body frame, got {}", bodies.len())));
    }
    let message: Message = messages::deserialize_bounded(&bodies[0])
        .map_err(|e| invalid(format!("bad body frame: {}", e)))?;
    if message.kind() != kind {
        return Err(invalid("type frame does not match message body"));
    }

    verify_signature(&remote, signed_frames, signature_frame)?;

    let mut hasher = blake3::Hasher::new();
    for frame in signed_frames {
        hasher.update(frame);
    }

    Ok(DecodedEnvelope {
        reply_token,
        remote,
        message,
        digest: *hasher.finalize().as_bytes(),
    })
}

fn verify_signature(
    remote: &Peer,
    signed_frames: &[Vec<u8>],
    signature_frame: &[u8],
) -> Result<(), TransportError> {
    if signature_frame.is_empty() {
        return Err(invalid("signature frame is missing"));
    }
    if signature_frame.len() != 64 {
        return Err(invalid("signature frame has invalid length"));
    }
    let verifying_key = remote
        .identity
        .verifying_key()
        .ok_or_else(|| invalid("sender public key is not a valid Ed25519 point"))?;
    let sig_bytes: [u8; 64] = signature_frame
        .try_into()
        .map_err(|_| invalid("signature frame has invalid length"))?;
    let signature = Signature::from_bytes(&sig_bytes);

    let mut signed = Vec::with_capacity(ENVELOPE_SIGNATURE_DOMAIN.len());
    signed.extend_from_slice(ENVELOPE_SIGNATURE_DOMAIN);
    for frame in signed_frames {
        signed.extend_from_slice(frame);
    }

    verifying_key
        .verify_strict(&signed, &signature)
        .map_err(|_| invalid("signature verification failed"))
}

fn invalid(reason: impl Into<String>) -> TransportError {
    TransportError::InvalidMessage(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::BoundPeer;
    use crate::version::AppProtocolVersion;

    fn test_peer() -> (Keypair, Peer) {
        let keypair = Keypair::generate();
        let version = AppProtocolVersion::signed(1, Vec::new(), &keypair);
        let peer = Peer::new(keypair.identity(), version);
        (keypair, peer)
    }

    fn bound(peer: &Peer, port: u16) -> BoundPeer {
        BoundPeer::new(peer.clone(), format!("127.0.0.1:{}", port).parse().unwrap())
    }

    #[test]
    fn round_trip_preserves_sender() {
        let (keypair, peer) = test_peer();
        let message = Message::Ping {
            from: bound(&peer, 4100),
        };

        let frames = encode(&message, &keypair, &peer).unwrap();
        let decoded = decode(&frames, false).unwrap();

        assert_eq!(decoded.remote, peer);
        assert!(decoded.reply_token.is_none());
        assert_eq!(decoded.message.kind(), MessageKind::Ping);
        assert_eq!(decoded.digest, digest(&frames, false).unwrap());
    }

    #[test]
    fn reply_round_trip_carries_token() {
        let (keypair, peer) = test_peer();
        let message = Message::Pong {
            from: bound(&peer, 4101),
        };
        let token = b"originator-token".to_vec();

        let frames = encode_reply(&message, &keypair, &peer, &token).unwrap();
        let decoded = decode(&frames, true).unwrap();

        assert_eq!(decoded.reply_token, Some(token));
        assert_eq!(decoded.remote, peer);
    }

    #[test]
    fn bit_flip_in_any_signed_frame_rejected() {
        let (keypair, peer) = test_peer();
        let message = Message::FindNeighbors {
            from: bound(&peer, 4102),
            target: crate::identity::Address::from_bytes([7; 20]),
        };
        let frames = encode(&message, &keypair, &peer).unwrap();

        // Frames 1..len-1 are signed (delimiter excluded, signature last).
        for frame_idx in 1..frames.len() - 1 {
            for byte_idx in 0..frames[frame_idx].len() {
                for bit in [0x01u8, 0x80u8] {
                    let mut tampered = frames.clone();
                    tampered[frame_idx][byte_idx] ^= bit;
                    assert!(
                        matches!(
                            decode(&tampered, false),
                            Err(TransportError::InvalidMessage(_))
                        ),
                        "bit flip in frame {} byte {} not rejected",
                        frame_idx,
                        byte_idx
                    );
                }
            }
        }
    }

    #[test]
    fn truncated_envelope_rejected() {
        let (keypair, peer) = test_peer();
        let message = Message::Ping {
            from: bound(&peer, 4103),
        };
        let frames = encode(&message, &keypair, &peer).unwrap();

        for keep in 0..frames.len() - 1 {
            let truncated: Vec<Vec<u8>> = frames[..keep].to_vec();
            assert!(decode(&truncated, false).is_err());
        }
    }

    #[test]
    fn missing_signature_rejected() {
        let (keypair, peer) = test_peer();
        let message = Message::Ping {
            from: bound(&peer, 4104),
        };
        let mut frames = encode(&message, &keypair, &peer).unwrap();
        let last = frames.len() - 1;
        frames[last] = Vec::new();
        assert!(matches!(
            decode(&frames, false),
            Err(TransportError::InvalidMessage(_))
        ));
    }

    #[test]
    fn wrong_signer_rejected() {
        let (_keypair, peer) = test_peer();
        let imposter = Keypair::generate();
        let message = Message::Ping {
            from: bound(&peer, 4105),
        };
        // Signed with a key that does not match the claimed sender.
        let frames = encode(&message, &imposter, &peer).unwrap();
        assert!(matches!(
            decode(&frames, false),
            Err(TransportError::InvalidMessage(_))
        ));
    }

    #[test]
    fn kind_tag_must_match_body() {
        let (keypair, peer) = test_peer();
        let message = Message::Ping {
            from: bound(&peer, 4106),
        };
        let mut frames = encode(&message, &keypair, &peer).unwrap();
        // Swap the type frame to Pong; signature check would also fail,
        // but layout validation catches it first.
        frames[2] = vec![MessageKind::Pong.as_byte()];
        assert!(decode(&frames, false).is_err());
    }

    #[test]
    fn request_layout_rejected_as_reply() {
        let (keypair, peer) = test_peer();
        let message = Message::Ping {
            from: bound(&peer, 4107),
        };
        let frames = encode(&message, &keypair, &peer).unwrap();
        // Leading delimiter is empty, which is not a valid identity frame.
        assert!(decode(&frames, true).is_err());
    }
}

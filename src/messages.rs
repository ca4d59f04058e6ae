//! # Wire Protocol Messages
//!
//! Serializable message types carried inside envelopes, plus the bounded
//! bincode helpers used for every wire body and the [`MessageHistory`]
//! diagnostic ring.
//!
//! | Kind | Body | Expects reply |
//! |------|------|---------------|
//! | `Ping` | sender's bound record | `Pong` |
//! | `Pong` | sender's bound record | none |
//! | `FindNeighbors` | target address | `Neighbors` |
//! | `Neighbors` | bound peers | none |
//! | `Application` | opaque payload | application-defined |
//!
//! Protocol messages carry the sender's [`BoundPeer`] record so the
//! receiving routing table can learn how to reach the sender; the
//! envelope's sender frame only proves who signed.

use std::collections::VecDeque;
use std::sync::Mutex;

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::{Address, BoundPeer, Peer};

/// Maximum size of a single envelope body frame (1 MiB).
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization, slightly above the body limit
/// to allow for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_BODY_SIZE as u64) + 4096;

/// Bincode options with size limits enforced. Always use these for wire
/// data; fixint keeps the encoding byte-exact across versions.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// One-byte wire tag identifying the message kind (envelope type frame).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    Ping = 0x01,
    Pong = 0x02,
    FindNeighbors = 0x03,
    Neighbors = 0x04,
    Application = 0x10,
}

impl MessageKind {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(MessageKind::Ping),
            0x02 => Some(MessageKind::Pong),
            0x03 => Some(MessageKind::FindNeighbors),
            0x04 => Some(MessageKind::Neighbors),
            0x10 => Some(MessageKind::Application),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    Ping {
        from: BoundPeer,
    },
    Pong {
        from: BoundPeer,
    },
    FindNeighbors {
        from: BoundPeer,
        target: Address,
    },
    Neighbors {
        from: BoundPeer,
        peers: Vec<BoundPeer>,
    },
    /// Opaque application payload; the transport never interprets it.
    Application {
        tag: u8,
        payload: Vec<u8>,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Ping { .. } => MessageKind::Ping,
            Message::Pong { .. } => MessageKind::Pong,
            Message::FindNeighbors { .. } => MessageKind::FindNeighbors,
            Message::Neighbors { .. } => MessageKind::Neighbors,
            Message::Application { .. } => MessageKind::Application,
        }
    }

    /// The sender's bound record, for protocol messages that carry one.
    pub fn bound_sender(&self) -> Option<&BoundPeer> {
        match self {
            Message::Ping { from } => Some(from),
            Message::Pong { from } => Some(from),
            Message::FindNeighbors { from, .. } => Some(from),
            Message::Neighbors { from, .. } => Some(from),
            Message::Application { .. } => None,
        }
    }
}

/// A fully validated inbound message: the verified sender record, the
/// parsed message, and (router side) the opaque reply-routing token.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub remote: Peer,
    pub message: Message,
    pub reply_token: Option<Vec<u8>>,
}

/// Number of observations retained by [`MessageHistory`].
pub const MESSAGE_HISTORY_CAPACITY: usize = 30;

/// One observed message: who, what kind, and a digest of the signed
/// frames for dedup checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    pub sender: Address,
    pub kind: MessageKind,
    pub digest: [u8; 32],
}

/// Bounded FIFO of the most recent observed messages.
///
/// Shared between the router (inbound) and the dealer workers (sent
/// requests and received replies); used for diagnostics and dedup checks
/// only, so recording never fails and overflow silently evicts the oldest.
#[derive(Debug, Default)]
pub struct MessageHistory {
    entries: Mutex<VecDeque<HistoryEntry>>,
}

impl MessageHistory {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(MESSAGE_HISTORY_CAPACITY)),
        }
    }

    pub fn record(&self, entry: HistoryEntry) {
        let mut entries = self.entries.lock().expect("history lock poisoned");
        if entries.len() == MESSAGE_HISTORY_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn contains(&self, digest: &[u8; 32]) -> bool {
        let entries = self.entries.lock().expect("history lock poisoned");
        entries.iter().any(|e| &e.digest == digest)
    }

    /// The retained entries, oldest first.
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        let entries = self.entries.lock().expect("history lock poisoned");
        entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("history lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::version::AppProtocolVersion;

    fn test_bound_peer(seed: u8) -> BoundPeer {
        let keypair = Keypair::generate();
        let version = AppProtocolVersion::signed(1, Vec::new(), &keypair);
        BoundPeer::new(
            Peer::new(keypair.identity(), version),
            format!("127.0.0.1:{}", 4000 + seed as u16).parse().unwrap(),
        )
    }

    fn entry(n: u8) -> HistoryEntry {
        HistoryEntry {
            sender: Address::from_bytes([n; 20]),
            kind: MessageKind::Ping,
            digest: [n; 32],
        }
    }

    #[test]
    fn kind_byte_round_trip() {
        for kind in [
            MessageKind::Ping,
            MessageKind::Pong,
            MessageKind::FindNeighbors,
            MessageKind::Neighbors,
            MessageKind::Application,
        ] {
            assert_eq!(MessageKind::from_byte(kind.as_byte()), Some(kind));
        }
        assert_eq!(MessageKind::from_byte(0x7f), None);
    }

    #[test]
    fn message_kind_accessor() {
        let from = test_bound_peer(1);
        assert_eq!(Message::Ping { from: from.clone() }.kind(), MessageKind::Ping);
        assert_eq!(
            Message::Neighbors {
                from,
                peers: Vec::new()
            }
            .kind(),
            MessageKind::Neighbors
        );
        assert_eq!(
            Message::Application {
                tag: 7,
                payload: Vec::new()
            }
            .kind(),
            MessageKind::Application
        );
    }

    #[test]
    fn message_round_trip() {
        let from = test_bound_peer(1);
        let message = Message::FindNeighbors {
            from: from.clone(),
            target: Address::from_bytes([9; 20]),
        };
        let bytes = serialize(&message).unwrap();
        let decoded: Message = deserialize_bounded(&bytes).unwrap();
        match decoded {
            Message::FindNeighbors { from: f, target } => {
                assert_eq!(f, from);
                assert_eq!(target, Address::from_bytes([9; 20]));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn malformed_body_rejected() {
        let garbage = vec![0xff, 0xfe, 0xfd];
        assert!(deserialize_bounded::<Message>(&garbage).is_err());
    }

    #[test]
    fn history_bounded_to_capacity_in_arrival_order() {
        let history = MessageHistory::new();
        for n in 0..40u8 {
            history.record(entry(n));
        }
        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), MESSAGE_HISTORY_CAPACITY);
        // The 30 most recent, oldest first.
        for (i, e) in snapshot.iter().enumerate() {
            assert_eq!(e.digest, [(10 + i) as u8; 32]);
        }
    }

    #[test]
    fn history_dedup_check() {
        let history = MessageHistory::new();
        history.record(entry(1));
        assert!(history.contains(&[1; 32]));
        assert!(!history.contains(&[2; 32]));
    }
}

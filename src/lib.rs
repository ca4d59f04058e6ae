//! # Lattica - Peer-to-Peer Message Transport Core
//!
//! Lattica is the message transport layer of a blockchain-style gossip
//! network:
//!
//! - **Identity**: Ed25519-based peer identities with 20-byte routing
//!   addresses (blake3-derived)
//! - **Envelopes**: signed multipart wire messages with per-message
//!   version gating
//! - **Sockets**: a router/dealer pair over TCP; an inbound router socket
//!   with handover semantics and short-lived outbound dealer connections
//! - **Routing**: a Kademlia-style peer table consulted for broadcast
//!   fan-out and discovery
//! - **NAT Traversal**: a TURN client (RFC 5766/6062) with relay proxies
//!   tunneling relayed streams to the local router
//!
//! ## Architecture
//!
//! Long-lived state is held by actors behind cheap-to-clone handles; the
//! facade owns three periodic loops (table refresh, neighborhood rebuild,
//! inbound dispatch) plus a fixed pool of dealer workers that serialize,
//! send, and correlate replies to outbound requests.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `transport` | Facade: lifecycle, configuration, periodic loops |
//! | `identity` | Keypairs, identities, peer records |
//! | `version` | Signed protocol version records and the compatibility gate |
//! | `envelope` | Envelope codec: framing layout, signatures |
//! | `messages` | Wire message kinds, bounded serialization, history ring |
//! | `framing` | Multipart frame codec over TCP |
//! | `router` | Inbound router endpoint and reply queue |
//! | `dealer` | Request queue, correlator, dealer worker pool |
//! | `kad` | Kademlia routing table and protocol state machines |
//! | `turn` | STUN/TURN client for NAT traversal |
//! | `relay` | Relay proxy tunneling relayed streams to the router |
//!
//! ## Quick Start
//!
//! ```ignore
//! let keypair = Keypair::generate();
//! let version = AppProtocolVersion::signed(1, Vec::new(), &keypair);
//! let transport = Transport::builder()
//!     .keypair(keypair)
//!     .app_version(version)
//!     .host("198.51.100.7")
//!     .message_handler(Arc::new(|msg| println!("got {:?}", msg.message.kind())))
//!     .build()?;
//!
//! transport.start().await?;
//! tokio::spawn(async move { transport.run().await });
//! ```

mod dealer;
mod envelope;
mod error;
mod framing;
mod identity;
mod kad;
mod messages;
mod relay;
mod router;
mod transport;
mod turn;
mod version;

pub use dealer::{RequestSender, FIRE_AND_AWAIT_TIMEOUT, MAX_REQUEST_RETRIES};
pub use envelope::{decode, encode, encode_reply, DecodedEnvelope};
pub use error::TransportError;
pub use identity::{Address, BoundPeer, Keypair, Peer, PeerIdentity, ADDRESS_LEN};
pub use kad::{
    RequestNetwork, RoutingProtocol, RoutingTable, DEFAULT_BUCKET_SIZE, DEFAULT_TABLE_SIZE,
};
pub use messages::{
    HistoryEntry, InboundMessage, Message, MessageHistory, MessageKind,
    MESSAGE_HISTORY_CAPACITY,
};
pub use relay::DEFAULT_RELAY_WORKERS;
pub use transport::{
    DifferentVersionHandler, MessageHandler, Transport, TransportBuilder, DEFAULT_WORKERS,
};
pub use turn::{IceServer, StunError, TurnClient, DEFAULT_ALLOCATION_LIFETIME, PERMISSION_LIFETIME};
pub use version::{AppProtocolVersion, VersionGate};

//! # STUN/TURN Client
//!
//! Pure-Rust STUN (RFC 5389) and TURN (RFC 5766) client used for NAT
//! traversal, speaking TCP to the server and requesting TCP allocations
//! (RFC 6062) so relayed peers reach us as ordinary byte streams.
//!
//! ## Operations
//!
//! - `reflexive_addr`: server-reflexive address via a Binding request
//! - `is_behind_nat`: reflexive address differs from every local interface
//! - `allocate` / `refresh_allocation`: relayed transport address lease
//! - `create_permission`: authorize a peer IP on the allocation
//! - `accept_relayed_stream`: next inbound relayed TCP stream
//!   (ConnectionAttempt indication answered with ConnectionBind on a
//!   fresh data connection)
//!
//! ## Authentication
//!
//! Requests are first attempted anonymously; a 401/438 challenge with
//! REALM and NONCE triggers a retry carrying USERNAME and a HMAC-SHA1
//! MESSAGE-INTEGRITY keyed by `MD5(username:realm:password)` (long-term
//! credentials, RFC 5389 §15.4).
//!
//! ## Failure policy
//!
//! Refresh callers log errors and keep their loop alive; the next tick
//! retries. Stream acceptance errors are logged and the accept loop
//! immediately retries. Only cancellation terminates the client.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace, warn};

/// STUN/TURN protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StunError {
    #[error("message parse error: {0}")]
    ParseError(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("timeout waiting for response")]
    Timeout,
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),
    #[error("server error {0}: {1}")]
    ServerError(u16, String),
    #[error("unsupported address family")]
    UnsupportedAddressFamily,
    #[error("client closed")]
    Closed,
}

pub type StunResult<T> = Result<T, StunError>;

/// A TURN/STUN server entry from the transport configuration.
#[derive(Clone, Debug)]
pub struct IceServer {
    /// `host:port` of the server.
    pub addr: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Default TURN allocation lifetime requested by the transport.
pub const DEFAULT_ALLOCATION_LIFETIME: Duration = Duration::from_secs(777);

/// Permission lifetime fixed by RFC 5766.
pub const PERMISSION_LIFETIME: Duration = Duration::from_secs(300);

/// Refresh loops fire this long before a lease expires.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Deadline for a single STUN request/response round trip.
const STUN_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// REQUESTED-TRANSPORT protocol number for TCP (RFC 6062).
const REQUESTED_TRANSPORT_TCP: u8 = 6;

/// STUN message magic cookie.
const MAGIC_COOKIE: u32 = 0x2112A442;

/// Capacity of the inbound relayed-stream channel.
const INCOMING_STREAM_CHANNEL: usize = 16;

// ============================================================================
// STUN Message Constants
// ============================================================================

/// Combined method+class message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    // STUN (RFC 5389)
    BindingRequest = 0x0001,
    BindingResponse = 0x0101,
    BindingErrorResponse = 0x0111,

    // TURN (RFC 5766)
    AllocateRequest = 0x0003,
    AllocateResponse = 0x0103,
    AllocateErrorResponse = 0x0113,
    RefreshRequest = 0x0004,
    RefreshResponse = 0x0104,
    RefreshErrorResponse = 0x0114,
    CreatePermissionRequest = 0x0008,
    CreatePermissionResponse = 0x0108,
    CreatePermissionErrorResponse = 0x0118,

    // TURN TCP allocations (RFC 6062)
    ConnectRequest = 0x000A,
    ConnectResponse = 0x010A,
    ConnectErrorResponse = 0x011A,
    ConnectionBindRequest = 0x000B,
    ConnectionBindResponse = 0x010B,
    ConnectionBindErrorResponse = 0x011B,
    ConnectionAttemptIndication = 0x001C,
}

impl MessageType {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::BindingRequest),
            0x0101 => Some(Self::BindingResponse),
            0x0111 => Some(Self::BindingErrorResponse),
            0x0003 => Some(Self::AllocateRequest),
            0x0103 => Some(Self::AllocateResponse),
            0x0113 => Some(Self::AllocateErrorResponse),
            0x0004 => Some(Self::RefreshRequest),
            0x0104 => Some(Self::RefreshResponse),
            0x0114 => Some(Self::RefreshErrorResponse),
            0x0008 => Some(Self::CreatePermissionRequest),
            0x0108 => Some(Self::CreatePermissionResponse),
            0x0118 => Some(Self::CreatePermissionErrorResponse),
            0x000A => Some(Self::ConnectRequest),
            0x010A => Some(Self::ConnectResponse),
            0x011A => Some(Self::ConnectErrorResponse),
            0x000B => Some(Self::ConnectionBindRequest),
            0x010B => Some(Self::ConnectionBindResponse),
            0x011B => Some(Self::ConnectionBindErrorResponse),
            0x001C => Some(Self::ConnectionAttemptIndication),
            _ => None,
        }
    }

    fn is_error_response(self) -> bool {
        (self as u16) & 0x0110 == 0x0110
    }
}

/// STUN attribute types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AttributeType {
    MappedAddress = 0x0001,
    Username = 0x0006,
    MessageIntegrity = 0x0008,
    ErrorCode = 0x0009,
    Realm = 0x0014,
    Nonce = 0x0015,
    XorMappedAddress = 0x0020,

    Lifetime = 0x000D,
    XorPeerAddress = 0x0012,
    XorRelayedAddress = 0x0016,
    RequestedTransport = 0x0019,

    // RFC 6062
    ConnectionId = 0x002A,
}

// ============================================================================
// STUN Message Structure
// ============================================================================

#[derive(Debug, Clone)]
pub struct StunHeader {
    pub message_type: MessageType,
    pub length: u16,
    pub transaction_id: [u8; 12],
}

#[derive(Debug, Clone)]
pub struct StunAttribute {
    pub attr_type: u16,
    pub value: Bytes,
}

#[derive(Debug, Clone)]
pub struct StunMessage {
    pub header: StunHeader,
    pub attributes: Vec<StunAttribute>,
}

fn align_to_4(len: usize) -> usize {
    (len + 3) & !3
}

impl StunMessage {
    /// Create a message with a random transaction ID.
    pub fn new(message_type: MessageType) -> Self {
        let mut transaction_id = [0u8; 12];
        for byte in &mut transaction_id {
            *byte = rand::random();
        }
        Self {
            header: StunHeader {
                message_type,
                length: 0,
                transaction_id,
            },
            attributes: Vec::new(),
        }
    }

    pub fn add_attribute(&mut self, attr_type: u16, value: Bytes) {
        self.attributes.push(StunAttribute { attr_type, value });
    }

    pub fn add_username(&mut self, username: &str) {
        self.add_attribute(
            AttributeType::Username as u16,
            Bytes::copy_from_slice(username.as_bytes()),
        );
    }

    pub fn add_realm(&mut self, realm: &str) {
        self.add_attribute(
            AttributeType::Realm as u16,
            Bytes::copy_from_slice(realm.as_bytes()),
        );
    }

    pub fn add_nonce(&mut self, nonce: &str) {
        self.add_attribute(
            AttributeType::Nonce as u16,
            Bytes::copy_from_slice(nonce.as_bytes()),
        );
    }

    pub fn add_lifetime(&mut self, seconds: u32) {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(seconds);
        self.add_attribute(AttributeType::Lifetime as u16, buf.freeze());
    }

    pub fn add_requested_transport(&mut self, protocol: u8) {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u8(protocol);
        buf.put_bytes(0, 3);
        self.add_attribute(AttributeType::RequestedTransport as u16, buf.freeze());
    }

    pub fn add_connection_id(&mut self, id: u32) {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(id);
        self.add_attribute(AttributeType::ConnectionId as u16, buf.freeze());
    }

    pub fn add_xor_peer_address(&mut self, addr: SocketAddr) {
        let value = encode_xor_address(addr, &self.header.transaction_id);
        self.add_attribute(AttributeType::XorPeerAddress as u16, value);
    }

    pub fn get_attribute(&self, attr_type: u16) -> Option<&StunAttribute> {
        self.attributes.iter().find(|a| a.attr_type == attr_type)
    }

    pub fn get_xor_mapped_address(&self) -> StunResult<Option<SocketAddr>> {
        match self.get_attribute(AttributeType::XorMappedAddress as u16) {
            Some(attr) => decode_xor_address(&attr.value, &self.header.transaction_id).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_mapped_address(&self) -> StunResult<Option<SocketAddr>> {
        match self.get_attribute(AttributeType::MappedAddress as u16) {
            Some(attr) => decode_plain_address(&attr.value).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_xor_relayed_address(&self) -> StunResult<Option<SocketAddr>> {
        match self.get_attribute(AttributeType::XorRelayedAddress as u16) {
            Some(attr) => decode_xor_address(&attr.value, &self.header.transaction_id).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_xor_peer_address(&self) -> StunResult<Option<SocketAddr>> {
        match self.get_attribute(AttributeType::XorPeerAddress as u16) {
            Some(attr) => decode_xor_address(&attr.value, &self.header.transaction_id).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_lifetime(&self) -> StunResult<Option<u32>> {
        match self.get_attribute(AttributeType::Lifetime as u16) {
            Some(attr) if attr.value.len() == 4 => {
                let mut cursor = attr.value.clone();
                Ok(Some(cursor.get_u32()))
            }
            Some(_) => Err(StunError::InvalidAttribute("invalid LIFETIME length".into())),
            None => Ok(None),
        }
    }

    pub fn get_connection_id(&self) -> StunResult<Option<u32>> {
        match self.get_attribute(AttributeType::ConnectionId as u16) {
            Some(attr) if attr.value.len() == 4 => {
                let mut cursor = attr.value.clone();
                Ok(Some(cursor.get_u32()))
            }
            Some(_) => Err(StunError::InvalidAttribute(
                "invalid CONNECTION-ID length".into(),
            )),
            None => Ok(None),
        }
    }

    /// ERROR-CODE attribute as `(code, reason)`.
    pub fn get_error_code(&self) -> Option<(u16, String)> {
        let attr = self.get_attribute(AttributeType::ErrorCode as u16)?;
        if attr.value.len() < 4 {
            return None;
        }
        let class = (attr.value[2] & 0x07) as u16;
        let number = attr.value[3] as u16;
        let reason = String::from_utf8_lossy(&attr.value[4..]).into_owned();
        Some((class * 100 + number, reason))
    }

    pub fn get_text_attribute(&self, attr_type: AttributeType) -> Option<String> {
        self.get_attribute(attr_type as u16)
            .map(|a| String::from_utf8_lossy(&a.value).into_owned())
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Bytes {
        self.encode_with_extra_len(0)
    }

    /// Serialize with the header length inflated by `extra_len`; used to
    /// compute MESSAGE-INTEGRITY, whose HMAC input counts the pending
    /// integrity attribute in the header length.
    fn encode_with_extra_len(&self, extra_len: usize) -> Bytes {
        let attrs_len: usize = self
            .attributes
            .iter()
            .map(|a| 4 + align_to_4(a.value.len()))
            .sum();

        let mut buf = BytesMut::with_capacity(20 + attrs_len);
        buf.put_u16(self.header.message_type as u16);
        buf.put_u16((attrs_len + extra_len) as u16);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(&self.header.transaction_id);

        for attr in &self.attributes {
            buf.put_u16(attr.attr_type);
            buf.put_u16(attr.value.len() as u16);
            buf.put_slice(&attr.value);
            buf.put_bytes(0, align_to_4(attr.value.len()) - attr.value.len());
        }
        buf.freeze()
    }

    /// Parse from wire bytes.
    pub fn decode(data: &[u8]) -> StunResult<Self> {
        if data.len() < 20 {
            return Err(StunError::ParseError("message too short".into()));
        }

        let mut cursor = data;
        let msg_type_raw = cursor.get_u16();
        let message_type = MessageType::from_u16(msg_type_raw).ok_or_else(|| {
            StunError::ParseError(format!("unknown message type 0x{:04x}", msg_type_raw))
        })?;

        let length = cursor.get_u16();
        let magic = cursor.get_u32();
        if magic != MAGIC_COOKIE {
            return Err(StunError::ParseError("invalid magic cookie".into()));
        }

        let mut transaction_id = [0u8; 12];
        cursor.copy_to_slice(&mut transaction_id);

        let mut attributes = Vec::new();
        let mut remaining = length as usize;
        while remaining > 0 {
            if cursor.len() < 4 {
                break;
            }
            let attr_type = cursor.get_u16();
            let attr_len = cursor.get_u16() as usize;
            if cursor.len() < attr_len {
                return Err(StunError::ParseError("truncated attribute".into()));
            }
            let value = Bytes::copy_from_slice(&cursor[..attr_len]);
            cursor.advance(attr_len);
            attributes.push(StunAttribute { attr_type, value });

            let padding = align_to_4(attr_len) - attr_len;
            if cursor.len() < padding {
                return Err(StunError::ParseError("truncated padding".into()));
            }
            cursor.advance(padding);
            remaining = remaining.saturating_sub(4 + attr_len + padding);
        }

        Ok(Self {
            header: StunHeader {
                message_type,
                length,
                transaction_id,
            },
            attributes,
        })
    }

    /// Append a MESSAGE-INTEGRITY attribute (HMAC-SHA1 over the message
    /// with the header length covering the pending attribute).
    pub fn add_message_integrity(&mut self, key: &[u8]) -> StunResult<()> {
        type HmacSha1 = Hmac<Sha1>;
        let encoded = self.encode_with_extra_len(24);
        let mut mac = HmacSha1::new_from_slice(key)
            .map_err(|e| StunError::AuthenticationFailed(e.to_string()))?;
        mac.update(&encoded);
        let integrity = mac.finalize().into_bytes();
        self.add_attribute(
            AttributeType::MessageIntegrity as u16,
            Bytes::copy_from_slice(&integrity[..]),
        );
        Ok(())
    }
}

// ============================================================================
// Address attribute encoding
// ============================================================================

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

fn encode_xor_address(addr: SocketAddr, transaction_id: &[u8; 12]) -> Bytes {
    let mut buf = BytesMut::with_capacity(20);
    buf.put_u8(0);
    let xport = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(FAMILY_IPV4);
            buf.put_u16(xport);
            let raw = u32::from_be_bytes(ip.octets()) ^ MAGIC_COOKIE;
            buf.put_u32(raw);
        }
        IpAddr::V6(ip) => {
            buf.put_u8(FAMILY_IPV6);
            buf.put_u16(xport);
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(transaction_id);
            let octets = ip.octets();
            for (i, byte) in octets.iter().enumerate() {
                buf.put_u8(*byte ^ mask[i]);
            }
        }
    }
    buf.freeze()
}

fn decode_xor_address(value: &[u8], transaction_id: &[u8; 12]) -> StunResult<SocketAddr> {
    if value.len() < 8 {
        return Err(StunError::InvalidAttribute("address too short".into()));
    }
    let family = value[1];
    let xport = u16::from_be_bytes([value[2], value[3]]);
    let port = xport ^ (MAGIC_COOKIE >> 16) as u16;
    match family {
        FAMILY_IPV4 => {
            let raw = u32::from_be_bytes([value[4], value[5], value[6], value[7]]) ^ MAGIC_COOKIE;
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(raw)), port))
        }
        FAMILY_IPV6 => {
            if value.len() < 20 {
                return Err(StunError::InvalidAttribute("IPv6 address too short".into()));
            }
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(transaction_id);
            let mut octets = [0u8; 16];
            for i in 0..16 {
                octets[i] = value[4 + i] ^ mask[i];
            }
            Ok(SocketAddr::new(IpAddr::V6(octets.into()), port))
        }
        _ => Err(StunError::UnsupportedAddressFamily),
    }
}

fn decode_plain_address(value: &[u8]) -> StunResult<SocketAddr> {
    if value.len() < 8 {
        return Err(StunError::InvalidAttribute("address too short".into()));
    }
    let family = value[1];
    let port = u16::from_be_bytes([value[2], value[3]]);
    match family {
        FAMILY_IPV4 => {
            let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        FAMILY_IPV6 => {
            if value.len() < 20 {
                return Err(StunError::InvalidAttribute("IPv6 address too short".into()));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            Ok(SocketAddr::new(IpAddr::V6(octets.into()), port))
        }
        _ => Err(StunError::UnsupportedAddressFamily),
    }
}

/// Long-term credential key: `MD5(username ":" realm ":" password)`.
fn long_term_key(username: &str, realm: &str, password: &str) -> Vec<u8> {
    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(realm.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

// ============================================================================
// TURN Client
// ============================================================================

#[derive(Clone, Debug)]
struct Credentials {
    username: String,
    realm: String,
    nonce: String,
    key: Vec<u8>,
}

enum TurnCommand {
    Roundtrip {
        message: StunMessage,
        reply: oneshot::Sender<StunResult<StunMessage>>,
    },
    Quit,
}

struct TurnClientActor {
    write_half: OwnedWriteHalf,
    pending: HashMap<[u8; 12], oneshot::Sender<StunResult<StunMessage>>>,
    server_addr: SocketAddr,
    incoming_tx: mpsc::Sender<TcpStream>,
    credentials: Arc<Mutex<Option<Credentials>>>,
}

/// Handle to the TURN control connection. Cheap to clone; all state lives
/// in the actor and shared cells.
#[derive(Clone)]
pub struct TurnClient {
    cmd_tx: mpsc::Sender<TurnCommand>,
    server_addr: SocketAddr,
    control_local: SocketAddr,
    config: IceServer,
    credentials: Arc<Mutex<Option<Credentials>>>,
    relayed_addr: Arc<Mutex<Option<SocketAddr>>>,
    incoming_rx: Arc<Mutex<mpsc::Receiver<TcpStream>>>,
}

impl TurnClient {
    /// Open the control connection to the server and start the demux
    /// actor.
    pub async fn connect(config: IceServer) -> anyhow::Result<Self> {
        let server_addr = resolve(&config.addr).await?;
        let stream = TcpStream::connect(server_addr)
            .await
            .map_err(|e| anyhow::anyhow!("TURN control connect to {} failed: {}", server_addr, e))?;
        let _ = stream.set_nodelay(true);
        let control_local = stream.local_addr()?;
        let (read_half, write_half) = stream.into_split();

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_STREAM_CHANNEL);
        let credentials = Arc::new(Mutex::new(None));

        let actor = TurnClientActor {
            write_half,
            pending: HashMap::new(),
            server_addr,
            incoming_tx,
            credentials: credentials.clone(),
        };
        tokio::spawn(actor.run(read_half, cmd_rx));

        debug!(server = %server_addr, "TURN control connection established");
        Ok(Self {
            cmd_tx,
            server_addr,
            control_local,
            config,
            credentials,
            relayed_addr: Arc::new(Mutex::new(None)),
            incoming_rx: Arc::new(Mutex::new(incoming_rx)),
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// The server-reflexive address of this host.
    pub async fn reflexive_addr(&self) -> StunResult<SocketAddr> {
        let response = self
            .request(MessageType::BindingRequest, |_| {})
            .await?;
        if let Some(addr) = response.get_xor_mapped_address()? {
            return Ok(addr);
        }
        if let Some(addr) = response.get_mapped_address()? {
            return Ok(addr);
        }
        Err(StunError::InvalidAttribute(
            "binding response carries no mapped address".into(),
        ))
    }

    /// True iff the reflexive address matches none of the local
    /// interface addresses.
    pub async fn is_behind_nat(&self) -> StunResult<bool> {
        let reflexive = self.reflexive_addr().await?;
        let mut local_ips = local_interface_ips();
        local_ips.push(self.control_local.ip());
        Ok(!local_ips.contains(&reflexive.ip()))
    }

    /// Obtain a relayed TCP transport address with the given lease.
    pub async fn allocate(&self, lifetime: Duration) -> StunResult<SocketAddr> {
        let seconds = lifetime.as_secs() as u32;
        let response = self
            .request(MessageType::AllocateRequest, move |msg| {
                msg.add_requested_transport(REQUESTED_TRANSPORT_TCP);
                msg.add_lifetime(seconds);
            })
            .await?;
        let relayed = response
            .get_xor_relayed_address()?
            .ok_or_else(|| StunError::InvalidAttribute("allocation has no relayed address".into()))?;
        *self.relayed_addr.lock().await = Some(relayed);
        debug!(relayed = %relayed, lifetime = seconds, "TURN allocation obtained");
        Ok(relayed)
    }

    /// Extend the allocation lease; returns the server-granted lifetime.
    pub async fn refresh_allocation(&self, lifetime: Duration) -> StunResult<Duration> {
        let seconds = lifetime.as_secs() as u32;
        let response = self
            .request(MessageType::RefreshRequest, move |msg| {
                msg.add_lifetime(seconds);
            })
            .await?;
        let granted = response.get_lifetime()?.unwrap_or(seconds);
        trace!(granted, "TURN allocation refreshed");
        Ok(Duration::from_secs(granted as u64))
    }

    /// Authorize a peer IP to send through the allocation.
    pub async fn create_permission(&self, peer_ip: IpAddr) -> StunResult<()> {
        let peer = SocketAddr::new(peer_ip, 0);
        self.request(MessageType::CreatePermissionRequest, move |msg| {
            msg.add_xor_peer_address(peer);
        })
        .await?;
        trace!(peer = %peer_ip, "TURN permission created");
        Ok(())
    }

    /// Await the next inbound relayed TCP stream. Returns `None` once the
    /// client has shut down.
    pub async fn accept_relayed_stream(&self) -> Option<TcpStream> {
        self.incoming_rx.lock().await.recv().await
    }

    /// The relayed address from the most recent allocation.
    pub async fn relayed_addr(&self) -> Option<SocketAddr> {
        *self.relayed_addr.lock().await
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(TurnCommand::Quit).await;
    }

    /// Send a request, transparently answering a 401/438 long-term
    /// credential challenge when the configuration carries credentials.
    async fn request(
        &self,
        message_type: MessageType,
        build: impl Fn(&mut StunMessage),
    ) -> StunResult<StunMessage> {
        let message = self.build_request(message_type, &build).await?;
        let response = self.roundtrip(message).await?;

        if !response.header.message_type.is_error_response() {
            return Ok(response);
        }

        let (code, reason) = response
            .get_error_code()
            .unwrap_or((0, "unknown error".into()));
        let challenged = code == 401 || code == 438;
        let (Some(username), Some(password)) = (
            self.config.username.as_ref(),
            self.config.credential.as_ref(),
        ) else {
            return Err(StunError::ServerError(code, reason));
        };
        if !challenged {
            return Err(StunError::ServerError(code, reason));
        }

        let realm = response
            .get_text_attribute(AttributeType::Realm)
            .ok_or_else(|| StunError::AuthenticationFailed("challenge without realm".into()))?;
        let nonce = response
            .get_text_attribute(AttributeType::Nonce)
            .ok_or_else(|| StunError::AuthenticationFailed("challenge without nonce".into()))?;
        let key = long_term_key(username, &realm, password);
        *self.credentials.lock().await = Some(Credentials {
            username: username.clone(),
            realm,
            nonce,
            key,
        });
        debug!(code, "TURN challenge received, retrying with credentials");

        let message = self.build_request(message_type, &build).await?;
        let response = self.roundtrip(message).await?;
        if response.header.message_type.is_error_response() {
            let (code, reason) = response
                .get_error_code()
                .unwrap_or((0, "unknown error".into()));
            return Err(StunError::ServerError(code, reason));
        }
        Ok(response)
    }

    async fn build_request(
        &self,
        message_type: MessageType,
        build: &impl Fn(&mut StunMessage),
    ) -> StunResult<StunMessage> {
        let mut message = StunMessage::new(message_type);
        build(&mut message);
        if let Some(creds) = self.credentials.lock().await.as_ref() {
            message.add_username(&creds.username);
            message.add_realm(&creds.realm);
            message.add_nonce(&creds.nonce);
            message.add_message_integrity(&creds.key)?;
        }
        Ok(message)
    }

    async fn roundtrip(&self, message: StunMessage) -> StunResult<StunMessage> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(TurnCommand::Roundtrip {
                message,
                reply: reply_tx,
            })
            .await
            .map_err(|_| StunError::Closed)?;
        match tokio::time::timeout(STUN_REQUEST_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StunError::Closed),
            Err(_) => Err(StunError::Timeout),
        }
    }
}

impl TurnClientActor {
    async fn run(mut self, mut read_half: OwnedReadHalf, mut cmd_rx: mpsc::Receiver<TurnCommand>) {
        // A dedicated reader keeps message framing intact: selecting on
        // the stream directly could cancel a partial read and desync it.
        let (msg_tx, mut msg_rx) = mpsc::channel::<StunResult<StunMessage>>(32);
        tokio::spawn(async move {
            loop {
                let message = read_stun_message(&mut read_half).await;
                let failed = message.is_err();
                if msg_tx.send(message).await.is_err() || failed {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(TurnCommand::Roundtrip { message, reply }) => {
                        let txid = message.header.transaction_id;
                        let encoded = message.encode();
                        if let Err(e) = self.write_half.write_all(&encoded).await {
                            let _ = reply.send(Err(StunError::NetworkError(e.to_string())));
                            continue;
                        }
                        self.pending.insert(txid, reply);
                    }
                    Some(TurnCommand::Quit) | None => {
                        debug!("TURN client actor shutting down");
                        break;
                    }
                },
                message = msg_rx.recv() => match message {
                    Some(Ok(message)) => self.dispatch(message).await,
                    Some(Err(e)) => {
                        warn!(error = %e, "TURN control connection lost");
                        for (_, reply) in self.pending.drain() {
                            let _ = reply.send(Err(StunError::Closed));
                        }
                        break;
                    }
                    None => break,
                },
            }
        }
    }

    async fn dispatch(&mut self, message: StunMessage) {
        if message.header.message_type == MessageType::ConnectionAttemptIndication {
            self.handle_connection_attempt(message).await;
            return;
        }
        if let Some(reply) = self.pending.remove(&message.header.transaction_id) {
            let _ = reply.send(Ok(message));
        } else {
            trace!(
                message_type = ?message.header.message_type,
                "dropping unsolicited STUN message"
            );
        }
    }

    /// A peer connected to our relayed address: open a data connection
    /// and bind it to the advertised CONNECTION-ID.
    async fn handle_connection_attempt(&self, message: StunMessage) {
        let connection_id = match message.get_connection_id() {
            Ok(Some(id)) => id,
            _ => {
                warn!("ConnectionAttempt without CONNECTION-ID");
                return;
            }
        };
        let peer = message.get_xor_peer_address().ok().flatten();
        debug!(connection_id, peer = ?peer, "relayed connection attempt");

        let server_addr = self.server_addr;
        let incoming_tx = self.incoming_tx.clone();
        let credentials = self.credentials.clone();
        tokio::spawn(async move {
            match bind_data_connection(server_addr, connection_id, credentials).await {
                Ok(stream) => {
                    if incoming_tx.send(stream).await.is_err() {
                        debug!("relayed stream dropped: accept channel closed");
                    }
                }
                Err(e) => warn!(connection_id, error = %e, "ConnectionBind failed"),
            }
        });
    }
}

/// Open a fresh data connection and issue ConnectionBind; on success the
/// stream carries the peer's bytes verbatim.
async fn bind_data_connection(
    server_addr: SocketAddr,
    connection_id: u32,
    credentials: Arc<Mutex<Option<Credentials>>>,
) -> StunResult<TcpStream> {
    let mut stream = TcpStream::connect(server_addr)
        .await
        .map_err(|e| StunError::NetworkError(e.to_string()))?;
    let _ = stream.set_nodelay(true);

    let mut bind = StunMessage::new(MessageType::ConnectionBindRequest);
    bind.add_connection_id(connection_id);
    if let Some(creds) = credentials.lock().await.as_ref() {
        bind.add_username(&creds.username);
        bind.add_realm(&creds.realm);
        bind.add_nonce(&creds.nonce);
        bind.add_message_integrity(&creds.key)?;
    }
    stream
        .write_all(&bind.encode())
        .await
        .map_err(|e| StunError::NetworkError(e.to_string()))?;

    let response = tokio::time::timeout(STUN_REQUEST_TIMEOUT, read_stun_message(&mut stream))
        .await
        .map_err(|_| StunError::Timeout)??;
    if response.header.message_type != MessageType::ConnectionBindResponse {
        let (code, reason) = response.get_error_code().unwrap_or((0, "bind failed".into()));
        return Err(StunError::ServerError(code, reason));
    }
    Ok(stream)
}

/// Read one STUN message from a TCP stream (RFC 5766 stream framing:
/// consecutive STUN messages).
async fn read_stun_message<R>(reader: &mut R) -> StunResult<StunMessage>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut header = [0u8; 20];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| StunError::NetworkError(e.to_string()))?;
    let length = u16::from_be_bytes([header[2], header[3]]) as usize;
    let mut buf = vec![0u8; 20 + length];
    buf[..20].copy_from_slice(&header);
    reader
        .read_exact(&mut buf[20..])
        .await
        .map_err(|e| StunError::NetworkError(e.to_string()))?;
    StunMessage::decode(&buf)
}

async fn resolve(addr: &str) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to resolve {}: {}", addr, e))?
        .next()
        .ok_or_else(|| anyhow::anyhow!("no address for {}", addr))
}

/// Local interface addresses, discovered by connecting UDP sockets toward
/// public resolvers and reading the chosen source address. No packets are
/// sent by `connect` on UDP.
pub(crate) fn local_interface_ips() -> Vec<IpAddr> {
    let mut ips = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
    let probe_targets = ["8.8.8.8:53", "1.1.1.1:53"];
    for target in probe_targets {
        if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
            if socket.connect(target).is_ok() {
                if let Ok(local) = socket.local_addr() {
                    if !ips.contains(&local.ip()) {
                        ips.push(local.ip());
                    }
                }
            }
        }
    }
    ips
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_encode_decode_round_trip() {
        let mut message = StunMessage::new(MessageType::AllocateRequest);
        message.add_requested_transport(REQUESTED_TRANSPORT_TCP);
        message.add_lifetime(777);

        let encoded = message.encode();
        let decoded = StunMessage::decode(&encoded).unwrap();

        assert_eq!(decoded.header.message_type, MessageType::AllocateRequest);
        assert_eq!(
            decoded.header.transaction_id,
            message.header.transaction_id
        );
        assert_eq!(decoded.get_lifetime().unwrap(), Some(777));
        let transport = decoded
            .get_attribute(AttributeType::RequestedTransport as u16)
            .unwrap();
        assert_eq!(transport.value[0], REQUESTED_TRANSPORT_TCP);
    }

    #[test]
    fn xor_address_round_trip_v4() {
        let txid = [7u8; 12];
        let addr: SocketAddr = "203.0.113.9:3478".parse().unwrap();
        let encoded = encode_xor_address(addr, &txid);
        assert_eq!(decode_xor_address(&encoded, &txid).unwrap(), addr);
    }

    #[test]
    fn xor_address_round_trip_v6() {
        let txid = [3u8; 12];
        let addr: SocketAddr = "[2001:db8::1]:49152".parse().unwrap();
        let encoded = encode_xor_address(addr, &txid);
        assert_eq!(decode_xor_address(&encoded, &txid).unwrap(), addr);
    }

    #[test]
    fn error_code_attribute_parse() {
        let mut message = StunMessage::new(MessageType::AllocateErrorResponse);
        let mut value = BytesMut::new();
        value.put_u16(0);
        value.put_u8(4); // class
        value.put_u8(1); // number
        value.put_slice(b"Unauthorized");
        message.add_attribute(AttributeType::ErrorCode as u16, value.freeze());

        let encoded = message.encode();
        let decoded = StunMessage::decode(&encoded).unwrap();
        assert_eq!(
            decoded.get_error_code(),
            Some((401, "Unauthorized".to_string()))
        );
        assert!(decoded.header.message_type.is_error_response());
    }

    #[test]
    fn connection_id_round_trip() {
        let mut message = StunMessage::new(MessageType::ConnectionBindRequest);
        message.add_connection_id(0xDEADBEEF);
        let decoded = StunMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded.get_connection_id().unwrap(), Some(0xDEADBEEF));
    }

    #[test]
    fn message_integrity_is_deterministic_for_key() {
        let key = long_term_key("alice", "example.org", "secret");
        let mut a = StunMessage::new(MessageType::AllocateRequest);
        a.add_lifetime(600);
        let mut b = StunMessage {
            header: StunHeader {
                message_type: a.header.message_type,
                length: 0,
                transaction_id: a.header.transaction_id,
            },
            attributes: a.attributes.clone(),
        };

        a.add_message_integrity(&key).unwrap();
        b.add_message_integrity(&key).unwrap();

        let mi_a = a.get_attribute(AttributeType::MessageIntegrity as u16).unwrap();
        let mi_b = b.get_attribute(AttributeType::MessageIntegrity as u16).unwrap();
        assert_eq!(mi_a.value, mi_b.value);
        assert_eq!(mi_a.value.len(), 20);
    }

    #[test]
    fn truncated_message_rejected() {
        let mut message = StunMessage::new(MessageType::BindingRequest);
        message.add_lifetime(1);
        let encoded = message.encode();
        assert!(StunMessage::decode(&encoded[..10]).is_err());
        assert!(StunMessage::decode(&encoded[..encoded.len() - 2]).is_err());
    }

    #[test]
    fn padding_applied_to_odd_length_attributes() {
        let mut message = StunMessage::new(MessageType::AllocateRequest);
        message.add_nonce("abcde"); // 5 bytes, padded to 8
        let encoded = message.encode();
        // header(20) + attr header(4) + padded value(8)
        assert_eq!(encoded.len(), 32);
        let decoded = StunMessage::decode(&encoded).unwrap();
        assert_eq!(
            decoded.get_text_attribute(AttributeType::Nonce),
            Some("abcde".to_string())
        );
    }
}

//! # Kademlia Routing Protocol
//!
//! Bucketed peer-routing table keyed by [`Address`] plus the PING/FIND/
//! NEIGHBORS state machines the transport consults for broadcast and
//! discovery.
//!
//! ## Table shape
//!
//! `table_size` buckets of up to `bucket_size` entries, ordered by
//! recency (tail = most recently seen). The bucket for a peer is the
//! number of leading zero bits in the XOR distance between its address
//! and the local address, clamped to the table size. A peer therefore
//! occupies exactly one bucket.
//!
//! Each bucket carries a *replacement cache*: when a bucket is full, the
//! newcomer is cached and the oldest entry is PINGed; if the ping fails
//! the oldest is evicted and a cached candidate is promoted.
//!
//! ## Ownership
//!
//! The protocol consumes the transport through the [`RequestNetwork`]
//! capability trait injected at construction, and the transport holds the
//! protocol by composition reference, so neither side owns the other
//! fully. Table state lives in an actor; the public handle is cheap to
//! clone (same shape as the rest of the codebase).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::identity::{distance_cmp, Address, BoundPeer, ADDRESS_LEN};
use crate::messages::{InboundMessage, Message, MessageKind};

/// Default number of buckets: one per bit of the 160-bit address space.
pub const DEFAULT_TABLE_SIZE: usize = 160;

/// Default bucket capacity (Kademlia k).
pub const DEFAULT_BUCKET_SIZE: usize = 20;

/// Timeout for liveness pings issued by table maintenance.
const LIVENESS_PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for the lookups issued by `rebuild_connection`.
const REBUILD_FIND_TIMEOUT: Duration = Duration::from_secs(5);

/// Lookup depth used when rebuilding neighborhoods.
const REBUILD_DEPTH: usize = 3;

/// Peers consulted per rebuild pass.
const REBUILD_FANOUT: usize = 3;

/// Command channel capacity for the routing actor.
const COMMAND_CHANNEL_SIZE: usize = 100;

/// Transport capability consumed by the routing protocol.
#[async_trait]
pub trait RequestNetwork: Send + Sync + 'static {
    /// Send a request and await up to `expected_replies` replies.
    async fn send_with_reply(
        &self,
        peer: &BoundPeer,
        message: Message,
        timeout: Duration,
        expected_replies: usize,
    ) -> Result<Vec<InboundMessage>, TransportError>;

    /// Fire-and-await send with no expected replies.
    async fn send(&self, peer: &BoundPeer, message: Message) -> Result<(), TransportError>;

    /// This node's own bound record, used as the `from` field of
    /// protocol messages.
    fn self_bound(&self) -> &BoundPeer;
}

// ============================================================================
// Routing Table
// ============================================================================

#[derive(Clone, Debug)]
struct EntrySlot {
    peer: BoundPeer,
    last_seen: Instant,
}

#[derive(Debug)]
enum TouchOutcome {
    Inserted,
    Refreshed,
    /// Bucket full: the newcomer went to the replacement cache and the
    /// oldest entry should be liveness-checked.
    Full { oldest: BoundPeer },
}

#[derive(Clone, Debug)]
struct RoutingBucket {
    entries: Vec<EntrySlot>,
    replacements: Vec<BoundPeer>,
}

impl RoutingBucket {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            replacements: Vec::new(),
        }
    }

    fn touch(&mut self, peer: BoundPeer, k: usize) -> TouchOutcome {
        let addr = peer.address();
        if let Some(pos) = self.entries.iter().position(|e| e.peer.address() == addr) {
            // Known peer: move to tail with the freshest endpoint record.
            self.entries.remove(pos);
            self.entries.push(EntrySlot {
                peer,
                last_seen: Instant::now(),
            });
            return TouchOutcome::Refreshed;
        }

        if self.entries.len() < k {
            self.entries.push(EntrySlot {
                peer,
                last_seen: Instant::now(),
            });
            return TouchOutcome::Inserted;
        }

        // Full bucket: cache the newcomer as a replacement candidate.
        self.replacements.retain(|c| c.address() != addr);
        self.replacements.push(peer);
        if self.replacements.len() > k {
            self.replacements.remove(0);
        }
        let oldest = self.entries[0].peer.clone();
        TouchOutcome::Full { oldest }
    }

    fn refresh(&mut self, addr: &Address) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e.peer.address() == *addr) {
            let mut slot = self.entries.remove(pos);
            slot.last_seen = Instant::now();
            self.entries.push(slot);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, addr: &Address) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e.peer.address() == *addr) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }
}

/// The bucketed routing table. Synchronous; owned by the routing actor.
#[derive(Debug)]
pub struct RoutingTable {
    self_addr: Address,
    bucket_size: usize,
    buckets: Vec<RoutingBucket>,
}

impl RoutingTable {
    pub fn new(self_addr: Address, table_size: usize, bucket_size: usize) -> Self {
        assert!(table_size > 0, "table_size must be positive");
        assert!(bucket_size > 0, "bucket_size must be positive");
        Self {
            self_addr,
            bucket_size,
            buckets: vec![RoutingBucket::new(); table_size],
        }
    }

    /// Leading zero bits of the XOR distance, clamped to the table size.
    fn bucket_index(&self, addr: &Address) -> usize {
        let dist = self.self_addr.xor_distance(addr);
        let mut leading = 0usize;
        for byte in dist.iter() {
            if *byte == 0 {
                leading += 8;
            } else {
                leading += byte.leading_zeros() as usize;
                break;
            }
        }
        leading.min(self.buckets.len() - 1)
    }

    fn touch(&mut self, peer: BoundPeer) -> Option<TouchOutcome> {
        if peer.address() == self.self_addr {
            return None;
        }
        let idx = self.bucket_index(&peer.address());
        Some(self.buckets[idx].touch(peer, self.bucket_size))
    }

    fn refresh(&mut self, addr: &Address) -> bool {
        if *addr == self.self_addr {
            return false;
        }
        let idx = self.bucket_index(addr);
        self.buckets[idx].refresh(addr)
    }

    fn remove(&mut self, addr: &Address) -> bool {
        if *addr == self.self_addr {
            return false;
        }
        let idx = self.bucket_index(addr);
        self.buckets[idx].remove(addr)
    }

    pub fn contains(&self, addr: &Address) -> bool {
        if *addr == self.self_addr {
            return false;
        }
        let idx = self.bucket_index(addr);
        self.buckets[idx]
            .entries
            .iter()
            .any(|e| e.peer.address() == *addr)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries, most recently seen last within each bucket.
    pub fn peers(&self) -> Vec<BoundPeer> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| e.peer.clone()))
            .collect()
    }

    /// The `k` entries closest to `target` by XOR distance.
    pub fn closest(&self, target: &Address, k: usize) -> Vec<BoundPeer> {
        let mut all: Vec<(
            [u8; ADDRESS_LEN],
            BoundPeer,
        )> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter())
            .map(|e| (e.peer.address().xor_distance(target), e.peer.clone()))
            .collect();
        all.sort_by(|a, b| distance_cmp(&a.0, &b.0));
        all.into_iter().take(k).map(|(_, peer)| peer).collect()
    }

    fn stale_entries(&self, max_age: Duration) -> Vec<BoundPeer> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter())
            .filter(|e| e.last_seen.elapsed() > max_age)
            .map(|e| e.peer.clone())
            .collect()
    }

    /// Pop one replacement candidate for every bucket with spare room.
    fn take_replacement_candidates(&mut self) -> Vec<(usize, BoundPeer)> {
        let mut out = Vec::new();
        for (idx, bucket) in self.buckets.iter_mut().enumerate() {
            if bucket.entries.len() < self.bucket_size {
                if let Some(candidate) = bucket.replacements.pop() {
                    out.push((idx, candidate));
                }
            }
        }
        out
    }

    fn promote(&mut self, bucket_idx: usize, peer: BoundPeer) {
        if bucket_idx >= self.buckets.len() || peer.address() == self.self_addr {
            return;
        }
        // The candidate may belong elsewhere if the table was resized;
        // recompute to preserve the one-bucket invariant.
        if self.bucket_index(&peer.address()) != bucket_idx {
            return;
        }
        let bucket = &mut self.buckets[bucket_idx];
        let addr = peer.address();
        if bucket.entries.len() < self.bucket_size
            && !bucket.entries.iter().any(|e| e.peer.address() == addr)
        {
            bucket.entries.push(EntrySlot {
                peer,
                last_seen: Instant::now(),
            });
        }
    }
}

// ============================================================================
// Routing Protocol (handle + actor)
// ============================================================================

enum Command {
    Observe {
        peer: BoundPeer,
        /// Resolves to the bucket's oldest entry when the bucket is full
        /// and a liveness check is needed.
        check_oldest: oneshot::Sender<Option<BoundPeer>>,
    },
    PingResult {
        oldest: Address,
        alive: bool,
    },
    Refreshed {
        addr: Address,
    },
    Remove {
        addr: Address,
    },
    Closest {
        target: Address,
        k: usize,
        reply: oneshot::Sender<Vec<BoundPeer>>,
    },
    PeersToBroadcast {
        except: Option<Address>,
        reply: oneshot::Sender<Vec<BoundPeer>>,
    },
    StaleEntries {
        max_age: Duration,
        reply: oneshot::Sender<Vec<BoundPeer>>,
    },
    TakeReplacements {
        reply: oneshot::Sender<Vec<(usize, BoundPeer)>>,
    },
    Len {
        reply: oneshot::Sender<usize>,
    },
    Quit,
}

struct RoutingActor {
    table: RoutingTable,
    cmd_rx: mpsc::Receiver<Command>,
}

impl RoutingActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Observe { peer, check_oldest } => {
                    let oldest = match self.table.touch(peer) {
                        Some(TouchOutcome::Full { oldest }) => Some(oldest),
                        _ => None,
                    };
                    let _ = check_oldest.send(oldest);
                }
                Command::PingResult { oldest, alive } => {
                    if alive {
                        self.table.refresh(&oldest);
                    } else if self.table.remove(&oldest) {
                        debug!(addr = %oldest.to_hex(), "evicted unresponsive peer");
                        // The cached newcomer is promoted on the next
                        // replacement-cache pass.
                    }
                }
                Command::Refreshed { addr } => {
                    self.table.refresh(&addr);
                }
                Command::Remove { addr } => {
                    if self.table.remove(&addr) {
                        debug!(addr = %addr.to_hex(), "removed peer from routing table");
                    }
                }
                Command::Closest { target, k, reply } => {
                    let _ = reply.send(self.table.closest(&target, k));
                }
                Command::PeersToBroadcast { except, reply } => {
                    let peers = self
                        .table
                        .peers()
                        .into_iter()
                        .filter(|p| Some(p.address()) != except)
                        .collect();
                    let _ = reply.send(peers);
                }
                Command::StaleEntries { max_age, reply } => {
                    let _ = reply.send(self.table.stale_entries(max_age));
                }
                Command::TakeReplacements { reply } => {
                    let _ = reply.send(self.table.take_replacement_candidates());
                }
                Command::Len { reply } => {
                    let _ = reply.send(self.table.len());
                }
                Command::Quit => {
                    debug!("routing actor shutting down");
                    break;
                }
            }
        }
    }
}

/// Public handle to the routing protocol.
pub struct RoutingProtocol<N: RequestNetwork> {
    cmd_tx: mpsc::Sender<Command>,
    network: Arc<N>,
    self_addr: Address,
    bucket_size: usize,
}

impl<N: RequestNetwork> Clone for RoutingProtocol<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            network: self.network.clone(),
            self_addr: self.self_addr,
            bucket_size: self.bucket_size,
        }
    }
}

impl<N: RequestNetwork> RoutingProtocol<N> {
    pub fn new(network: Arc<N>, table_size: usize, bucket_size: usize) -> Self {
        let self_addr = network.self_bound().address();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let actor = RoutingActor {
            table: RoutingTable::new(self_addr, table_size, bucket_size),
            cmd_rx,
        };
        tokio::spawn(actor.run());
        Self {
            cmd_tx,
            network,
            self_addr,
            bucket_size,
        }
    }

    pub fn self_addr(&self) -> Address {
        self.self_addr
    }

    /// Update liveness/buckets from a validated inbound message. Only the
    /// message's own sender record is trusted here; peers advertised in
    /// NEIGHBORS bodies enter the table through the lookup state machine.
    pub async fn receive(&self, message: &InboundMessage) {
        let Some(bound) = message.message.bound_sender() else {
            return;
        };
        if bound.identity() != message.remote.identity {
            debug!(
                claimed = %bound.identity().to_hex(),
                signed = %message.remote.identity.to_hex(),
                "ignoring sender record that does not match envelope signer"
            );
            return;
        }
        self.observe(bound.clone()).await;
    }

    /// Insert or refresh a peer. A full bucket triggers a liveness check
    /// of its oldest entry in the background.
    pub async fn observe(&self, peer: BoundPeer) {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Observe {
                peer,
                check_oldest: tx,
            })
            .await
            .is_err()
        {
            return;
        }
        let Ok(Some(oldest)) = rx.await else {
            return;
        };

        let protocol = self.clone();
        tokio::spawn(async move {
            let alive = protocol
                .ping(&oldest, LIVENESS_PING_TIMEOUT)
                .await
                .is_ok();
            let _ = protocol
                .cmd_tx
                .send(Command::PingResult {
                    oldest: oldest.address(),
                    alive,
                })
                .await;
        });
    }

    /// PING a peer and await its PONG.
    pub async fn ping(&self, peer: &BoundPeer, timeout: Duration) -> Result<(), TransportError> {
        let from = self.network.self_bound().clone();
        let replies = self
            .network
            .send_with_reply(peer, Message::Ping { from }, timeout, 1)
            .await?;
        match replies.first() {
            Some(reply) if reply.message.kind() == MessageKind::Pong => {
                let _ = self
                    .cmd_tx
                    .send(Command::Refreshed {
                        addr: peer.address(),
                    })
                    .await;
                Ok(())
            }
            other => Err(TransportError::Unexpected(anyhow::anyhow!(
                "unexpected reply to PING: {:?}",
                other.map(|r| r.message.kind())
            ))),
        }
    }

    /// Iterative FIND toward `target` starting at `via`, up to `depth`
    /// rounds. Every peer learned along the way is observed. Returns the
    /// target's record if encountered.
    pub async fn find_specific_peer(
        &self,
        target: Address,
        via: &BoundPeer,
        depth: usize,
        timeout: Duration,
    ) -> Result<Option<BoundPeer>, TransportError> {
        let mut frontier = vec![via.clone()];
        let mut queried: HashSet<Address> = HashSet::new();

        for _round in 0..depth {
            frontier.sort_by(|a, b| {
                distance_cmp(
                    &a.address().xor_distance(&target),
                    &b.address().xor_distance(&target),
                )
            });
            let Some(next) = frontier
                .iter()
                .find(|p| !queried.contains(&p.address()))
                .cloned()
            else {
                break;
            };
            queried.insert(next.address());

            let from = self.network.self_bound().clone();
            let replies = match self
                .network
                .send_with_reply(
                    &next,
                    Message::FindNeighbors { from, target },
                    timeout,
                    1,
                )
                .await
            {
                Ok(replies) => replies,
                Err(e) => {
                    trace!(peer = %next.endpoint, error = %e, "FIND hop failed");
                    continue;
                }
            };

            let Some(reply) = replies.into_iter().next() else {
                continue;
            };
            if let Message::Neighbors { peers, .. } = reply.message {
                for peer in peers {
                    if peer.address() == self.self_addr {
                        continue;
                    }
                    self.observe(peer.clone()).await;
                    if peer.address() == target {
                        return Ok(Some(peer));
                    }
                    if queried.len() + frontier.len() < self.bucket_size * 4 {
                        frontier.push(peer);
                    }
                }
            }
        }
        Ok(None)
    }

    /// Answer a FIND_NEIGHBORS request: our closest entries to `target`.
    pub async fn neighbors_of(&self, target: Address) -> Vec<BoundPeer> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Closest {
                target,
                k: self.bucket_size,
                reply: tx,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Prime the table from seed peers: PING each, then run a self-lookup
    /// through every live seed to discover its neighborhood.
    pub async fn bootstrap(
        &self,
        seeds: &[BoundPeer],
        ping_timeout: Duration,
        find_timeout: Duration,
        depth: usize,
    ) -> usize {
        let mut live = 0usize;
        for seed in seeds {
            if seed.address() == self.self_addr {
                continue;
            }
            match self.ping(seed, ping_timeout).await {
                Ok(()) => {
                    live += 1;
                    self.observe(seed.clone()).await;
                    if let Err(e) = self
                        .find_specific_peer(self.self_addr, seed, depth, find_timeout)
                        .await
                    {
                        debug!(seed = %seed.endpoint, error = %e, "bootstrap lookup failed");
                    }
                }
                Err(e) => {
                    warn!(seed = %seed.endpoint, error = %e, "bootstrap seed unreachable");
                }
            }
        }
        live
    }

    /// Broadcast fan-out selection: every table entry except `except`.
    pub async fn peers_to_broadcast(&self, except: Option<Address>) -> Vec<BoundPeer> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::PeersToBroadcast { except, reply: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Re-PING entries older than `max_age`; evict the unresponsive.
    pub async fn refresh_table(&self, max_age: Duration) {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::StaleEntries {
                max_age,
                reply: tx,
            })
            .await
            .is_err()
        {
            return;
        }
        let stale = rx.await.unwrap_or_default();
        for peer in stale {
            if self.ping(&peer, LIVENESS_PING_TIMEOUT).await.is_err() {
                let _ = self
                    .cmd_tx
                    .send(Command::Remove {
                        addr: peer.address(),
                    })
                    .await;
            }
        }
    }

    /// Promote live replacement candidates into buckets with spare room.
    pub async fn check_replacement_cache(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::TakeReplacements { reply: tx })
            .await
            .is_err()
        {
            return;
        }
        let candidates = rx.await.unwrap_or_default();
        for (_bucket, peer) in candidates {
            if self.ping(&peer, LIVENESS_PING_TIMEOUT).await.is_ok() {
                self.observe(peer).await;
            }
        }
    }

    /// Re-establish useful neighborhoods after table decay: self-lookups
    /// through the freshest known peers.
    pub async fn rebuild_connection(&self) {
        let peers = self.peers_to_broadcast(None).await;
        if peers.is_empty() {
            trace!("rebuild skipped: routing table is empty");
            return;
        }
        for peer in peers.iter().rev().take(REBUILD_FANOUT) {
            if let Err(e) = self
                .find_specific_peer(self.self_addr, peer, REBUILD_DEPTH, REBUILD_FIND_TIMEOUT)
                .await
            {
                debug!(peer = %peer.endpoint, error = %e, "rebuild lookup failed");
            }
        }
    }

    pub async fn len(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Len { reply: tx }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::identity::{Keypair, Peer};
    use crate::version::AppProtocolVersion;

    fn make_bound(port: u16) -> BoundPeer {
        let keypair = Keypair::generate();
        let version = AppProtocolVersion::signed(1, Vec::new(), &keypair);
        BoundPeer::new(
            Peer::new(keypair.identity(), version),
            format!("127.0.0.1:{}", port).parse().unwrap(),
        )
    }

    // ------------------------------------------------------------------
    // RoutingTable
    // ------------------------------------------------------------------

    #[test]
    fn peer_lands_in_exactly_one_bucket() {
        let me = make_bound(4000);
        let mut table = RoutingTable::new(me.address(), 160, 20);
        for port in 4001..4040 {
            table.touch(make_bound(port));
        }
        let total = table.len();
        let unique: HashSet<Address> = table.peers().iter().map(|p| p.address()).collect();
        assert_eq!(total, unique.len());
    }

    #[test]
    fn touching_known_peer_refreshes_not_duplicates() {
        let me = make_bound(4000);
        let peer = make_bound(4001);
        let mut table = RoutingTable::new(me.address(), 160, 20);
        table.touch(peer.clone());
        table.touch(peer.clone());
        assert_eq!(table.len(), 1);
        assert!(table.contains(&peer.address()));
    }

    #[test]
    fn self_never_inserted() {
        let me = make_bound(4000);
        let mut table = RoutingTable::new(me.address(), 160, 20);
        assert!(table.touch(me.clone()).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn full_bucket_reports_oldest_and_caches_newcomer() {
        let me = make_bound(4000);
        // bucket_size 1 with a single bucket forces every peer to collide.
        let mut table = RoutingTable::new(me.address(), 1, 1);
        let first = make_bound(4001);
        let second = make_bound(4002);

        assert!(matches!(table.touch(first.clone()), Some(TouchOutcome::Inserted)));
        match table.touch(second.clone()) {
            Some(TouchOutcome::Full { oldest }) => {
                assert_eq!(oldest.address(), first.address());
            }
            other => panic!("expected Full, got {:?}", other),
        }

        // Evict the oldest; the cached newcomer becomes promotable.
        assert!(table.remove(&first.address()));
        let candidates = table.take_replacement_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].1.address(), second.address());
        let (idx, candidate) = candidates.into_iter().next().unwrap();
        table.promote(idx, candidate);
        assert!(table.contains(&second.address()));
    }

    #[test]
    fn closest_orders_by_xor_distance() {
        let me = make_bound(4000);
        let mut table = RoutingTable::new(me.address(), 160, 20);
        let peers: Vec<BoundPeer> = (4001..4020).map(make_bound).collect();
        for peer in &peers {
            table.touch(peer.clone());
        }
        let target = make_bound(5000).address();
        let closest = table.closest(&target, 5);
        assert_eq!(closest.len(), 5);
        for window in closest.windows(2) {
            let a = window[0].address().xor_distance(&target);
            let b = window[1].address().xor_distance(&target);
            assert_ne!(distance_cmp(&a, &b), std::cmp::Ordering::Greater);
        }
    }

    #[test]
    fn stale_entries_by_age() {
        let me = make_bound(4000);
        let mut table = RoutingTable::new(me.address(), 160, 20);
        table.touch(make_bound(4001));
        assert!(table.stale_entries(Duration::from_secs(60)).is_empty());
        assert_eq!(table.stale_entries(Duration::ZERO).len(), 1);
    }

    // ------------------------------------------------------------------
    // RoutingProtocol with a scripted network
    // ------------------------------------------------------------------

    struct TestNetwork {
        self_bound: BoundPeer,
        alive: Mutex<HashSet<Address>>,
        neighbors: Mutex<HashMap<Address, Vec<BoundPeer>>>,
        pings: Mutex<Vec<Address>>,
    }

    impl TestNetwork {
        fn new(self_bound: BoundPeer) -> Self {
            Self {
                self_bound,
                alive: Mutex::new(HashSet::new()),
                neighbors: Mutex::new(HashMap::new()),
                pings: Mutex::new(Vec::new()),
            }
        }

        fn set_alive(&self, peer: &BoundPeer, alive: bool) {
            let mut set = self.alive.lock().unwrap();
            if alive {
                set.insert(peer.address());
            } else {
                set.remove(&peer.address());
            }
        }

        fn set_neighbors(&self, peer: &BoundPeer, neighbors: Vec<BoundPeer>) {
            self.neighbors
                .lock()
                .unwrap()
                .insert(peer.address(), neighbors);
        }
    }

    #[async_trait]
    impl RequestNetwork for TestNetwork {
        async fn send_with_reply(
            &self,
            peer: &BoundPeer,
            message: Message,
            _timeout: Duration,
            _expected_replies: usize,
        ) -> Result<Vec<InboundMessage>, TransportError> {
            if !self.alive.lock().unwrap().contains(&peer.address()) {
                return Err(TransportError::Timeout);
            }
            let reply = match message {
                Message::Ping { .. } => {
                    self.pings.lock().unwrap().push(peer.address());
                    Message::Pong { from: peer.clone() }
                }
                Message::FindNeighbors { .. } => Message::Neighbors {
                    from: peer.clone(),
                    peers: self
                        .neighbors
                        .lock()
                        .unwrap()
                        .get(&peer.address())
                        .cloned()
                        .unwrap_or_default(),
                },
                other => {
                    return Err(TransportError::Unexpected(anyhow::anyhow!(
                        "unexpected message: {:?}",
                        other.kind()
                    )))
                }
            };
            Ok(vec![InboundMessage {
                remote: peer.peer.clone(),
                message: reply,
                reply_token: None,
            }])
        }

        async fn send(&self, _peer: &BoundPeer, _message: Message) -> Result<(), TransportError> {
            Ok(())
        }

        fn self_bound(&self) -> &BoundPeer {
            &self.self_bound
        }
    }

    #[tokio::test]
    async fn ping_live_peer_succeeds() {
        let me = make_bound(4000);
        let network = Arc::new(TestNetwork::new(me));
        let protocol = RoutingProtocol::new(network.clone(), 160, 20);

        let peer = make_bound(4001);
        network.set_alive(&peer, true);
        assert!(protocol.ping(&peer, Duration::from_secs(1)).await.is_ok());

        network.set_alive(&peer, false);
        assert!(protocol.ping(&peer, Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn receive_rejects_mismatched_sender_record() {
        let me = make_bound(4000);
        let network = Arc::new(TestNetwork::new(me));
        let protocol = RoutingProtocol::new(network, 160, 20);

        let envelope_signer = make_bound(4001);
        let claimed = make_bound(4002);
        protocol
            .receive(&InboundMessage {
                remote: envelope_signer.peer.clone(),
                message: Message::Ping { from: claimed },
                reply_token: None,
            })
            .await;
        assert_eq!(protocol.len().await, 0);
    }

    #[tokio::test]
    async fn receive_observes_consistent_sender() {
        let me = make_bound(4000);
        let network = Arc::new(TestNetwork::new(me));
        let protocol = RoutingProtocol::new(network, 160, 20);

        let peer = make_bound(4001);
        protocol
            .receive(&InboundMessage {
                remote: peer.peer.clone(),
                message: Message::Ping { from: peer.clone() },
                reply_token: None,
            })
            .await;
        assert_eq!(protocol.len().await, 1);
    }

    #[tokio::test]
    async fn refresh_table_evicts_dead_peers() {
        let me = make_bound(4000);
        let network = Arc::new(TestNetwork::new(me));
        let protocol = RoutingProtocol::new(network.clone(), 160, 20);

        let live = make_bound(4001);
        let dead = make_bound(4002);
        network.set_alive(&live, true);
        protocol.observe(live.clone()).await;
        protocol.observe(dead.clone()).await;
        assert_eq!(protocol.len().await, 2);

        protocol.refresh_table(Duration::ZERO).await;
        // Give the actor a beat to process removals.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let peers = protocol.peers_to_broadcast(None).await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].address(), live.address());
    }

    #[tokio::test]
    async fn broadcast_selection_excludes_peer() {
        let me = make_bound(4000);
        let network = Arc::new(TestNetwork::new(me));
        let protocol = RoutingProtocol::new(network, 160, 20);

        let peers: Vec<BoundPeer> = (4001..4006).map(make_bound).collect();
        for peer in &peers {
            protocol.observe(peer.clone()).await;
        }

        let excluded = peers[2].address();
        let selected = protocol.peers_to_broadcast(Some(excluded)).await;
        assert_eq!(selected.len(), peers.len() - 1);
        assert!(selected.iter().all(|p| p.address() != excluded));
    }

    #[tokio::test]
    async fn bootstrap_learns_seed_neighborhood() {
        let me = make_bound(4000);
        let network = Arc::new(TestNetwork::new(me));
        let protocol = RoutingProtocol::new(network.clone(), 160, 20);

        let seed = make_bound(4001);
        let friends: Vec<BoundPeer> = (4002..4007).map(make_bound).collect();
        network.set_alive(&seed, true);
        for friend in &friends {
            network.set_alive(friend, true);
        }
        network.set_neighbors(&seed, friends.clone());

        let live = protocol
            .bootstrap(&[seed.clone()], Duration::from_secs(1), Duration::from_secs(1), 2)
            .await;
        assert_eq!(live, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let len = protocol.len().await;
        assert!(
            len >= friends.len(),
            "expected at least {} entries, got {}",
            friends.len(),
            len
        );
    }

    #[tokio::test]
    async fn find_specific_peer_walks_the_graph() {
        let me = make_bound(4000);
        let network = Arc::new(TestNetwork::new(me));
        let protocol = RoutingProtocol::new(network.clone(), 160, 20);

        let hop = make_bound(4001);
        let target = make_bound(4002);
        network.set_alive(&hop, true);
        network.set_alive(&target, true);
        network.set_neighbors(&hop, vec![target.clone()]);

        let found = protocol
            .find_specific_peer(target.address(), &hop, 3, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(found.map(|p| p.address()), Some(target.address()));
    }
}

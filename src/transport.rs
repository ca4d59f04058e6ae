//! # Transport Facade
//!
//! Wires the envelope codec, router endpoint, dealer worker pool, TURN
//! client, relay proxies, and routing protocol into one lifecycle-managed
//! unit.
//!
//! ## Lifecycle
//!
//! `New → Starting → Running → Stopping → Stopped → Disposed`, one-way.
//! [`Transport::start`] binds the router socket, determines the public
//! endpoint (directly from `host`, or via TURN when only `ice_servers`
//! are configured), and spawns the worker pool plus, when behind NAT,
//! the relay proxies and the allocation/permission refresh loops.
//! [`Transport::run`] marks the transport running and drives the three
//! periodic loops (table refresh, neighborhood rebuild, inbound
//! dispatch); it returns when the first of them completes, which means
//! failure or shutdown. The instance is single-use: a stopped transport
//! cannot be started again.
//!
//! ## Inbound pipeline
//!
//! Per received multipart: drop on shutdown; decode (log+drop on
//! failure); record in history; version-gate non-PING senders (the
//! different-version event fires and the message is dropped); deliver to
//! the routing protocol; answer protocol requests (PING, FIND_NEIGHBORS);
//! invoke the application message handler.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::dealer::{
    DealerContext, MessageRequest, RequestSender, WorkerPool, REQUEST_QUEUE_SIZE,
};
use crate::envelope;
use crate::error::TransportError;
use crate::identity::{Address, BoundPeer, Keypair, Peer};
use crate::kad::{RequestNetwork, RoutingProtocol, DEFAULT_BUCKET_SIZE, DEFAULT_TABLE_SIZE};
use crate::messages::{HistoryEntry, InboundMessage, Message, MessageHistory, MessageKind};
use crate::relay::{spawn_relay_proxies, DEFAULT_RELAY_WORKERS};
use crate::router::{RouterEndpoint, RouterInbound};
use crate::turn::{
    IceServer, TurnClient, DEFAULT_ALLOCATION_LIFETIME, PERMISSION_LIFETIME, REFRESH_MARGIN,
};
use crate::version::{AppProtocolVersion, VersionGate};

/// Callback invoked for every valid inbound message.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Callback invoked when a peer with an incompatible version is
/// encountered, inbound or outbound.
pub type DifferentVersionHandler = Arc<dyn Fn(Peer) + Send + Sync>;

/// Default dealer worker count.
pub const DEFAULT_WORKERS: usize = 5;

/// Interval of the routing-table refresh loop.
const REFRESH_TABLE_INTERVAL: Duration = Duration::from_secs(10);

/// Entry age passed to `refresh_table` on each tick.
const REFRESH_TABLE_MAX_AGE: Duration = Duration::from_secs(10);

/// Interval of the neighborhood rebuild loop.
const REBUILD_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Default bound on each reply send attempt.
const DEFAULT_REPLY_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Capacity of the broadcast queue.
const BROADCAST_QUEUE_SIZE: usize = 64;

/// Concurrency limit of the broadcast fan-out.
const BROADCAST_CONCURRENCY: usize = 8;

/// Capacity of the liveness channel from workers to the protocol.
const LIVENESS_CHANNEL_SIZE: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    New,
    Starting,
    Running,
    Stopping,
    Stopped,
    Disposed,
}

/// Builder for [`Transport`].
pub struct TransportBuilder {
    keypair: Option<Keypair>,
    app_version: Option<AppProtocolVersion>,
    trusted_signers: HashSet<[u8; 32]>,
    table_size: usize,
    bucket_size: usize,
    workers: usize,
    host: Option<String>,
    listen_port: Option<u16>,
    ice_servers: Vec<IceServer>,
    relay_workers: usize,
    reply_send_timeout: Duration,
    different_version_handler: Option<DifferentVersionHandler>,
    message_handler: Option<MessageHandler>,
}

impl Default for TransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportBuilder {
    pub fn new() -> Self {
        Self {
            keypair: None,
            app_version: None,
            trusted_signers: HashSet::new(),
            table_size: DEFAULT_TABLE_SIZE,
            bucket_size: DEFAULT_BUCKET_SIZE,
            workers: DEFAULT_WORKERS,
            host: None,
            listen_port: None,
            ice_servers: Vec::new(),
            relay_workers: DEFAULT_RELAY_WORKERS,
            reply_send_timeout: DEFAULT_REPLY_SEND_TIMEOUT,
            different_version_handler: None,
            message_handler: None,
        }
    }

    /// Identity and signing key. Required.
    pub fn keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    /// Local protocol version record. Required.
    pub fn app_version(mut self, version: AppProtocolVersion) -> Self {
        self.app_version = Some(version);
        self
    }

    /// Public keys whose foreign version records are accepted.
    pub fn trusted_signer(mut self, signer: [u8; 32]) -> Self {
        self.trusted_signers.insert(signer);
        self
    }

    pub fn table_size(mut self, table_size: usize) -> Self {
        self.table_size = table_size;
        self
    }

    pub fn bucket_size(mut self, bucket_size: usize) -> Self {
        self.bucket_size = bucket_size;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Public DNS name or IP this node is reachable at. When set, no NAT
    /// traversal is attempted.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Router listen port; a random port is bound when absent.
    pub fn listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    /// TURN/STUN servers; required when `host` is absent.
    pub fn ice_server(mut self, server: IceServer) -> Self {
        self.ice_servers.push(server);
        self
    }

    /// Number of relay-proxy accept workers used behind NAT.
    pub fn relay_workers(mut self, workers: usize) -> Self {
        self.relay_workers = workers.max(1);
        self
    }

    /// Bound on each router reply send attempt.
    pub fn reply_send_timeout(mut self, timeout: Duration) -> Self {
        self.reply_send_timeout = timeout;
        self
    }

    pub fn different_version_handler(mut self, handler: DifferentVersionHandler) -> Self {
        self.different_version_handler = Some(handler);
        self
    }

    pub fn message_handler(mut self, handler: MessageHandler) -> Self {
        self.message_handler = Some(handler);
        self
    }

    pub fn build(self) -> Result<Transport, TransportError> {
        let keypair = self
            .keypair
            .ok_or_else(|| TransportError::Unexpected(anyhow::anyhow!("keypair is required")))?;
        let app_version = self.app_version.ok_or_else(|| {
            TransportError::Unexpected(anyhow::anyhow!("app_version is required"))
        })?;

        let gate = Arc::new(VersionGate::new(app_version.clone(), self.trusted_signers));
        let (running_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Transport {
            keypair: Arc::new(keypair),
            app_version,
            gate,
            table_size: self.table_size,
            bucket_size: self.bucket_size,
            workers: self.workers,
            host: self.host,
            listen_port: self.listen_port,
            ice_servers: self.ice_servers,
            relay_workers: self.relay_workers,
            reply_send_timeout: self.reply_send_timeout,
            different_version_handler: self.different_version_handler,
            message_handler: self.message_handler,
            history: Arc::new(MessageHistory::new()),
            state: StdMutex::new(Lifecycle::New),
            running_tx,
            shutdown_tx,
            active: Mutex::new(None),
            worker_pool: Mutex::new(None),
        })
    }
}

/// Runtime pieces created by `start`.
struct Active {
    router: Arc<RouterEndpoint>,
    sender: RequestSender,
    protocol: RoutingProtocol<RequestSender>,
    inbound_rx: Option<mpsc::Receiver<RouterInbound>>,
    broadcast_tx: mpsc::Sender<(Option<Address>, Message)>,
    broadcast_rx: Option<mpsc::Receiver<(Option<Address>, Message)>>,
    turn: Option<TurnClient>,
    nat_tasks: Vec<JoinHandle<()>>,
    self_bound: BoundPeer,
}

/// The peer-to-peer message transport.
pub struct Transport {
    keypair: Arc<Keypair>,
    app_version: AppProtocolVersion,
    gate: Arc<VersionGate>,
    table_size: usize,
    bucket_size: usize,
    workers: usize,
    host: Option<String>,
    listen_port: Option<u16>,
    ice_servers: Vec<IceServer>,
    relay_workers: usize,
    reply_send_timeout: Duration,
    different_version_handler: Option<DifferentVersionHandler>,
    message_handler: Option<MessageHandler>,
    history: Arc<MessageHistory>,
    state: StdMutex<Lifecycle>,
    running_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
    active: Mutex<Option<Active>>,
    worker_pool: Mutex<Option<WorkerPool>>,
}

#[async_trait]
impl RequestNetwork for RequestSender {
    async fn send_with_reply(
        &self,
        peer: &BoundPeer,
        message: Message,
        timeout: Duration,
        expected_replies: usize,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        RequestSender::send_with_reply(self, peer, message, timeout, expected_replies).await
    }

    async fn send(&self, peer: &BoundPeer, message: Message) -> Result<(), TransportError> {
        RequestSender::send_message(self, peer, message).await
    }

    fn self_bound(&self) -> &BoundPeer {
        RequestSender::self_bound(self)
    }
}

impl Transport {
    pub fn builder() -> TransportBuilder {
        TransportBuilder::new()
    }

    pub fn identity(&self) -> crate::identity::PeerIdentity {
        self.keypair.identity()
    }

    pub fn history(&self) -> &MessageHistory {
        &self.history
    }

    /// Bind sockets and determine the public endpoint. Fails with
    /// `AlreadyRunning` unless the transport is in its initial state, and
    /// with a configuration error when neither `host` nor `ice_servers`
    /// is present. Does not begin the periodic loops; see [`run`].
    ///
    /// [`run`]: Transport::run
    pub async fn start(&self) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            match *state {
                Lifecycle::New => *state = Lifecycle::Starting,
                Lifecycle::Disposed => return Err(TransportError::Disposed),
                _ => return Err(TransportError::AlreadyRunning),
            }
        }
        match self.start_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut state = self.state.lock().expect("state lock poisoned");
                *state = Lifecycle::Stopped;
                Err(TransportError::Unexpected(e))
            }
        }
    }

    async fn start_inner(&self) -> anyhow::Result<()> {
        if self.host.is_none() && self.ice_servers.is_empty() {
            anyhow::bail!("either host or ice_servers must be configured");
        }

        let listen_addr: SocketAddr =
            SocketAddr::from(([0, 0, 0, 0], self.listen_port.unwrap_or(0)));
        let (router, inbound_rx) = RouterEndpoint::bind(
            listen_addr,
            self.reply_send_timeout,
            self.shutdown_tx.subscribe(),
        )
        .await?;
        let listen_port = router.local_addr().port();

        let mut turn = None;
        let mut nat_tasks = Vec::new();
        let public_endpoint = if let Some(host) = &self.host {
            resolve_host(host, listen_port).await?
        } else {
            let client = connect_any_ice_server(&self.ice_servers).await?;
            let endpoint = if client.is_behind_nat().await? {
                let relayed = client.allocate(DEFAULT_ALLOCATION_LIFETIME).await?;
                info!(relayed = %relayed, "behind NAT, advertising TURN-relayed endpoint");
                nat_tasks.extend(spawn_relay_proxies(
                    client.clone(),
                    listen_port,
                    self.relay_workers,
                    self.shutdown_tx.subscribe(),
                ));
                nat_tasks.push(tokio::spawn(refresh_allocation_loop(
                    client.clone(),
                    self.shutdown_tx.subscribe(),
                )));
                relayed
            } else {
                let reflexive = client.reflexive_addr().await?;
                SocketAddr::new(reflexive.ip(), listen_port)
            };
            turn = Some(client);
            endpoint
        };

        let self_peer = Peer::new(self.keypair.identity(), self.app_version.clone())
            .with_public_ip(public_endpoint.ip());
        let self_bound = BoundPeer::new(self_peer.clone(), public_endpoint);

        let (queue_tx, queue_rx) = mpsc::channel::<MessageRequest>(REQUEST_QUEUE_SIZE);
        let (liveness_tx, mut liveness_rx) = mpsc::channel::<InboundMessage>(LIVENESS_CHANNEL_SIZE);

        let ctx = Arc::new(DealerContext {
            keypair: self.keypair.clone(),
            self_peer: self_peer.clone(),
            gate: self.gate.clone(),
            history: self.history.clone(),
            liveness_tx,
            different_version: self.different_version_handler.clone(),
            queue_tx: queue_tx.clone(),
        });
        let pool = WorkerPool::spawn(self.workers, queue_rx, ctx, self.shutdown_tx.subscribe());
        *self.worker_pool.lock().await = Some(pool);

        let sender = RequestSender::new(queue_tx, self_bound.clone());
        let protocol = RoutingProtocol::new(
            Arc::new(sender.clone()),
            self.table_size,
            self.bucket_size,
        );

        // Worker-observed replies feed routing liveness.
        {
            let protocol = protocol.clone();
            nat_tasks.push(tokio::spawn(async move {
                while let Some(message) = liveness_rx.recv().await {
                    protocol.receive(&message).await;
                }
            }));
        }

        // When behind NAT, peers must hold TURN permissions to reach us.
        if let Some(client) = &turn {
            if client.relayed_addr().await.is_some() {
                nat_tasks.push(tokio::spawn(refresh_permissions_loop(
                    client.clone(),
                    protocol.clone(),
                    self.shutdown_tx.subscribe(),
                )));
            }
        }

        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_QUEUE_SIZE);

        info!(
            listen_port,
            endpoint = %public_endpoint,
            identity = %self.keypair.identity().to_hex(),
            "transport started"
        );

        *self.active.lock().await = Some(Active {
            router: Arc::new(router),
            sender,
            protocol,
            inbound_rx: Some(inbound_rx),
            broadcast_tx,
            broadcast_rx: Some(broadcast_rx),
            turn,
            nat_tasks,
            self_bound,
        });
        Ok(())
    }

    /// Mark the transport running and drive the periodic loops. Returns
    /// when the first loop completes (failure or shutdown).
    pub async fn run(&self) -> Result<(), TransportError> {
        let (mut inbound_rx, mut broadcast_rx, protocol, sender, router, self_bound) = {
            let mut active = self.active.lock().await;
            let active = active.as_mut().ok_or_else(|| {
                TransportError::Unexpected(anyhow::anyhow!("run called before start"))
            })?;
            (
                active
                    .inbound_rx
                    .take()
                    .ok_or(TransportError::AlreadyRunning)?,
                active
                    .broadcast_rx
                    .take()
                    .ok_or(TransportError::AlreadyRunning)?,
                active.protocol.clone(),
                active.sender.clone(),
                active.router.clone(),
                active.self_bound.clone(),
            )
        };
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if *state != Lifecycle::Starting {
                return Err(TransportError::AlreadyRunning);
            }
            *state = Lifecycle::Running;
        }
        self.running_tx.send_replace(true);
        debug!("transport running");

        let refresh = {
            let protocol = protocol.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(REFRESH_TABLE_INTERVAL);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                        _ = ticker.tick() => {
                            protocol.refresh_table(REFRESH_TABLE_MAX_AGE).await;
                            protocol.check_replacement_cache().await;
                        }
                    }
                }
            })
        };

        let rebuild = {
            let protocol = protocol.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    protocol.rebuild_connection().await;
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                        _ = tokio::time::sleep(REBUILD_INTERVAL) => {}
                    }
                }
            })
        };

        let pipeline = {
            let deps = PipelineDeps {
                keypair: self.keypair.clone(),
                gate: self.gate.clone(),
                history: self.history.clone(),
                protocol: protocol.clone(),
                router: router.clone(),
                self_bound,
                message_handler: self.message_handler.clone(),
                different_version_handler: self.different_version_handler.clone(),
            };
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    let inbound = tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                            continue;
                        }
                        inbound = inbound_rx.recv() => inbound,
                    };
                    let Some(inbound) = inbound else {
                        return;
                    };
                    deps.handle_inbound(inbound).await;
                }
            })
        };

        let broadcast = {
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let semaphore = Arc::new(Semaphore::new(BROADCAST_CONCURRENCY));
                loop {
                    let item = tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                            continue;
                        }
                        item = broadcast_rx.recv() => item,
                    };
                    let Some((except, message)) = item else {
                        return;
                    };
                    let peers = protocol.peers_to_broadcast(except).await;
                    trace!(fanout = peers.len(), "draining broadcast");
                    for peer in peers {
                        let Ok(permit) = semaphore.clone().acquire_owned().await else {
                            return;
                        };
                        let sender = sender.clone();
                        let message = message.clone();
                        tokio::spawn(async move {
                            if let Err(e) = sender.send_message(&peer, message).await {
                                trace!(peer = %peer.endpoint, error = %e, "broadcast send failed");
                            }
                            drop(permit);
                        });
                    }
                }
            })
        };

        // First completion means shutdown or failure.
        tokio::select! {
            _ = refresh => {}
            _ = rebuild => {}
            _ = pipeline => {}
            _ = broadcast => {}
        }
        debug!("transport run loop exited");
        Ok(())
    }

    /// Resolves once `run` has marked the transport running. Callers must
    /// not cache the result across lifecycles.
    pub async fn wait_for_running(&self) {
        let mut rx = self.running_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running_tx.borrow()
    }

    /// This node's advertised bound record. Available after `start`.
    pub async fn self_bound(&self) -> Option<BoundPeer> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|a| a.self_bound.clone())
    }

    /// The router's local listen address. Available after `start`.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|a| a.router.local_addr())
    }

    /// Handle to the routing protocol. Available after `start`.
    pub async fn routing(&self) -> Option<RoutingProtocol<RequestSender>> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|a| a.protocol.clone())
    }

    /// Total outbound requests enqueued.
    pub async fn request_count(&self) -> u64 {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|a| a.sender.request_count())
            .unwrap_or(0)
    }

    /// Send a request and await up to `expected_replies` replies.
    pub async fn send_with_reply(
        &self,
        peer: &BoundPeer,
        message: Message,
        timeout: Duration,
        expected_replies: usize,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        let sender = self.request_sender().await?;
        sender
            .send_with_reply(peer, message, timeout, expected_replies)
            .await
    }

    /// Fire-and-await send with no expected replies.
    pub async fn send_message(
        &self,
        peer: &BoundPeer,
        message: Message,
    ) -> Result<(), TransportError> {
        let sender = self.request_sender().await?;
        sender.send_message(peer, message).await
    }

    /// Send an application payload expecting `expected_replies` replies.
    pub async fn send_application(
        &self,
        peer: &BoundPeer,
        tag: u8,
        payload: Vec<u8>,
        timeout: Duration,
        expected_replies: usize,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        self.send_with_reply(
            peer,
            Message::Application { tag, payload },
            timeout,
            expected_replies,
        )
        .await
    }

    /// PING a peer through the routing protocol.
    pub async fn ping(&self, peer: &BoundPeer, timeout: Duration) -> Result<(), TransportError> {
        let protocol = self.routing().await.ok_or(TransportError::Disposed)?;
        protocol.ping(peer, timeout).await
    }

    /// Enqueue a broadcast. The drain loop asks the routing protocol for
    /// the fan-out (minus `except`) and issues one fire-and-forget send
    /// per peer; failures are swallowed.
    pub async fn broadcast_message(
        &self,
        except: Option<Address>,
        message: Message,
    ) -> Result<(), TransportError> {
        let broadcast_tx = {
            let active = self.active.lock().await;
            active
                .as_ref()
                .ok_or(TransportError::Disposed)?
                .broadcast_tx
                .clone()
        };
        broadcast_tx
            .send((except, message))
            .await
            .map_err(|_| TransportError::Disposed)
    }

    /// Reply to an inbound message using its reply-routing token.
    pub async fn reply(
        &self,
        reply_token: &[u8],
        message: Message,
    ) -> Result<(), TransportError> {
        let (router, self_peer) = {
            let active = self.active.lock().await;
            let active = active.as_ref().ok_or(TransportError::Disposed)?;
            (active.router.clone(), active.self_bound.peer.clone())
        };
        let frames = envelope::encode_reply(&message, &self.keypair, &self_peer, reply_token)
            .map_err(TransportError::Unexpected)?;
        if let Some(digest) = envelope::digest(&frames, true) {
            self.history.record(HistoryEntry {
                sender: self_peer.address(),
                kind: message.kind(),
                digest,
            });
        }
        router
            .enqueue_reply(reply_token.to_vec(), frames)
            .await
            .map_err(TransportError::Unexpected)
    }

    /// Cancel the worker pool, wait `wait_for`, then tear down sockets,
    /// queues, and the TURN client.
    pub async fn stop(&self, wait_for: Duration) {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if matches!(*state, Lifecycle::Stopped | Lifecycle::Disposed) {
                return;
            }
            *state = Lifecycle::Stopping;
        }
        debug!("transport stopping");
        self.shutdown_tx.send_replace(true);
        tokio::time::sleep(wait_for).await;

        if let Some(active) = self.active.lock().await.take() {
            active.protocol.quit().await;
            if let Some(turn) = &active.turn {
                turn.quit().await;
            }
            for task in active.nat_tasks {
                task.abort();
            }
            // Router listener and connections close with their tasks.
        }
        self.running_tx.send_replace(false);
        let mut state = self.state.lock().expect("state lock poisoned");
        *state = Lifecycle::Stopped;
        debug!("transport stopped");
    }

    /// Join the worker pool. The transport is unusable afterwards.
    pub async fn dispose(&self) {
        self.shutdown_tx.send_replace(true);
        if let Some(pool) = self.worker_pool.lock().await.take() {
            pool.join().await;
        }
        let mut state = self.state.lock().expect("state lock poisoned");
        *state = Lifecycle::Disposed;
        debug!("transport disposed");
    }

    async fn request_sender(&self) -> Result<RequestSender, TransportError> {
        let active = self.active.lock().await;
        Ok(active.as_ref().ok_or(TransportError::Disposed)?.sender.clone())
    }
}

/// Everything the inbound pipeline needs, bundled for the spawn.
struct PipelineDeps {
    keypair: Arc<Keypair>,
    gate: Arc<VersionGate>,
    history: Arc<MessageHistory>,
    protocol: RoutingProtocol<RequestSender>,
    router: Arc<RouterEndpoint>,
    self_bound: BoundPeer,
    message_handler: Option<MessageHandler>,
    different_version_handler: Option<DifferentVersionHandler>,
}

impl PipelineDeps {
    async fn handle_inbound(&self, inbound: RouterInbound) {
        let RouterInbound { token, frames } = inbound;

        let decoded = match envelope::decode(&frames, false) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(error = %e, "dropping invalid inbound message");
                return;
            }
        };

        self.history.record(HistoryEntry {
            sender: decoded.remote.address(),
            kind: decoded.message.kind(),
            digest: decoded.digest,
        });

        let kind = decoded.message.kind();
        if !self.gate.compatible(&decoded.remote.app_version) {
            debug!(
                remote = %decoded.remote.identity.to_hex(),
                "inbound message from incompatible version"
            );
            if let Some(handler) = &self.different_version_handler {
                handler(decoded.remote.clone());
            }
            // PING stays answerable across versions so liveness checks
            // work; everything else is dropped here.
            if kind != MessageKind::Ping {
                return;
            }
            self.answer_protocol(&token, &decoded.message).await;
            return;
        }

        let mut message = decoded.into_inbound();
        message.reply_token = Some(token.clone());

        self.protocol.receive(&message).await;
        self.answer_protocol(&token, &message.message).await;

        if let Some(handler) = &self.message_handler {
            handler(message);
        }
    }

    /// Serve the routing protocol's request messages.
    async fn answer_protocol(&self, token: &[u8], message: &Message) {
        let reply = match message {
            Message::Ping { .. } => Some(Message::Pong {
                from: self.self_bound.clone(),
            }),
            Message::FindNeighbors { target, .. } => {
                let peers = self.protocol.neighbors_of(*target).await;
                Some(Message::Neighbors {
                    from: self.self_bound.clone(),
                    peers,
                })
            }
            _ => None,
        };
        let Some(reply) = reply else {
            return;
        };

        let frames = match envelope::encode_reply(
            &reply,
            &self.keypair,
            &self.self_bound.peer,
            token,
        ) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, "failed to encode protocol reply");
                return;
            }
        };
        if let Some(digest) = envelope::digest(&frames, true) {
            self.history.record(HistoryEntry {
                sender: self.self_bound.address(),
                kind: reply.kind(),
                digest,
            });
        }
        if let Err(e) = self.router.enqueue_reply(token.to_vec(), frames).await {
            warn!(error = %e, "failed to enqueue protocol reply");
        }
    }
}

async fn resolve_host(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve host {}", host))?
        .collect();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no address found for host {}", host))
}

async fn connect_any_ice_server(servers: &[IceServer]) -> anyhow::Result<TurnClient> {
    let mut last_error = None;
    for server in servers {
        match TurnClient::connect(server.clone()).await {
            Ok(client) => return Ok(client),
            Err(e) => {
                warn!(server = %server.addr, error = %e, "ICE server unreachable");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no ICE servers configured")))
}

/// Extends the TURN allocation at `lease - 60 s`. Errors are logged and
/// the loop continues; the next tick retries.
async fn refresh_allocation_loop(turn: TurnClient, mut shutdown: watch::Receiver<bool>) {
    let mut lease = DEFAULT_ALLOCATION_LIFETIME;
    loop {
        let pause = lease.saturating_sub(REFRESH_MARGIN).max(Duration::from_secs(1));
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(pause) => {
                match turn.refresh_allocation(DEFAULT_ALLOCATION_LIFETIME).await {
                    Ok(granted) => {
                        trace!(granted = granted.as_secs(), "allocation refreshed");
                        lease = granted;
                    }
                    Err(e) => {
                        warn!(error = %e, "allocation refresh failed");
                    }
                }
            }
        }
    }
}

/// Re-creates permissions for every known peer IP at
/// `permission_lifetime - 60 s`. Errors are logged per peer.
async fn refresh_permissions_loop(
    turn: TurnClient,
    protocol: RoutingProtocol<RequestSender>,
    mut shutdown: watch::Receiver<bool>,
) {
    let pause = PERMISSION_LIFETIME.saturating_sub(REFRESH_MARGIN);
    loop {
        let peers = protocol.peers_to_broadcast(None).await;
        let ips: HashSet<std::net::IpAddr> = peers.iter().map(|p| p.endpoint.ip()).collect();
        for ip in ips {
            if let Err(e) = turn.create_permission(ip).await {
                warn!(peer_ip = %ip, error = %e, "permission refresh failed");
            }
        }
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

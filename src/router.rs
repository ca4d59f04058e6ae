//! # Router Endpoint
//!
//! The single inbound socket of the transport. Dealers connect over TCP,
//! announce themselves with a one-frame identity greeting, and then send
//! multipart envelopes. The router:
//!
//! - keys each connection by its greeting token, with *handover*
//!   semantics: a new connection with an already-registered token
//!   displaces the older one,
//! - forwards every received multipart (token + frames) to the transport
//!   pipeline through a bounded channel,
//! - drains a single reply queue in enqueue order, writing each reply to
//!   the originating connection under a bounded send timeout. A failed
//!   reply send is logged and dropped: the remote caller owns the
//!   timeout.
//!
//! The router never parses envelopes; that is the transport pipeline's
//! job. It owns only socket mechanics.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lru::LruCache;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::{debug, trace, warn};

use crate::framing;

/// Capacity of the inbound multipart channel.
const INBOUND_CHANNEL_SIZE: usize = 256;

/// Capacity of the reply queue.
const REPLY_CHANNEL_SIZE: usize = 256;

/// Maximum connections tracked by the router. Oldest-idle entries are
/// evicted when the bound is hit.
const MAX_ROUTER_CONNECTIONS: usize = 1024;

/// Time allowed for a freshly accepted connection to send its greeting.
const GREETING_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum length of a greeting token.
const MAX_TOKEN_LEN: usize = 64;

/// One raw multipart received from a connection, tagged with the
/// reply-routing token of the connection it arrived on.
#[derive(Debug)]
pub struct RouterInbound {
    pub token: Vec<u8>,
    pub frames: Vec<Vec<u8>>,
}

struct ConnectionSlot {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    /// Serial of the connection occupying this slot; prevents a dying
    /// displaced connection from unregistering its successor.
    serial: u64,
    /// Signals the displaced connection's reader to exit on handover.
    displaced: Arc<Notify>,
}

type Registry = Arc<Mutex<LruCache<Vec<u8>, ConnectionSlot>>>;

/// Inbound-only router socket.
pub struct RouterEndpoint {
    local_addr: SocketAddr,
    reply_tx: mpsc::Sender<(Vec<u8>, Vec<Vec<u8>>)>,
    connections: Registry,
}

impl RouterEndpoint {
    /// Bind the router socket and spawn its accept loop and reply poller.
    /// Port 0 requests a random bind.
    pub async fn bind(
        listen_addr: SocketAddr,
        reply_send_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, mpsc::Receiver<RouterInbound>)> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("failed to bind router socket on {}", listen_addr))?;
        let local_addr = listener.local_addr().context("router local_addr")?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_CHANNEL_SIZE);

        let connections: Registry = Arc::new(Mutex::new(LruCache::new(
            NonZeroUsize::new(MAX_ROUTER_CONNECTIONS).expect("connection bound must be non-zero"),
        )));

        tokio::spawn(accept_loop(
            listener,
            connections.clone(),
            inbound_tx,
            shutdown.clone(),
        ));
        tokio::spawn(reply_poller(
            reply_rx,
            connections.clone(),
            reply_send_timeout,
            shutdown,
        ));

        debug!(addr = %local_addr, "router socket bound");
        Ok((
            Self {
                local_addr,
                reply_tx,
                connections,
            },
            inbound_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Enqueue a reply for the connection registered under `token`.
    /// Replies drain in enqueue order through a single poller.
    pub async fn enqueue_reply(&self, token: Vec<u8>, frames: Vec<Vec<u8>>) -> Result<()> {
        self.reply_tx
            .send((token, frames))
            .await
            .map_err(|_| anyhow::anyhow!("router reply queue closed"))
    }

    /// Number of live registered connections (diagnostics).
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }
}

async fn accept_loop(
    listener: TcpListener,
    connections: Registry,
    inbound_tx: mpsc::Sender<RouterInbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    let serials = Arc::new(AtomicU64::new(0));
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("router accept loop shutting down");
                    return;
                }
                continue;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                trace!(remote = %remote, "router accepted connection");
                tokio::spawn(connection_task(
                    stream,
                    remote,
                    connections.clone(),
                    inbound_tx.clone(),
                    shutdown.clone(),
                    serials.clone(),
                ));
            }
            Err(e) => {
                warn!(error = %e, "router accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn connection_task(
    stream: TcpStream,
    remote: SocketAddr,
    connections: Registry,
    inbound_tx: mpsc::Sender<RouterInbound>,
    mut shutdown: watch::Receiver<bool>,
    serials: Arc<AtomicU64>,
) {
    let _ = stream.set_nodelay(true);
    let (mut read_half, write_half) = stream.into_split();

    // Identity greeting: a single non-empty frame naming the peer.
    let greeting =
        match tokio::time::timeout(GREETING_TIMEOUT, framing::read_multipart(&mut read_half)).await
        {
            Ok(Ok(frames)) => frames,
            Ok(Err(e)) => {
                debug!(remote = %remote, error = %e, "router greeting read failed");
                return;
            }
            Err(_) => {
                debug!(remote = %remote, "router greeting timed out");
                return;
            }
        };
    if greeting.len() != 1 || greeting[0].is_empty() || greeting[0].len() > MAX_TOKEN_LEN {
        debug!(remote = %remote, "router rejected malformed greeting");
        return;
    }
    let token = greeting[0].clone();
    let serial = serials.fetch_add(1, Ordering::Relaxed);
    let displaced = Arc::new(Notify::new());

    {
        let mut registry = connections.lock().await;
        if let Some(old) = registry.put(
            token.clone(),
            ConnectionSlot {
                writer: Arc::new(Mutex::new(write_half)),
                serial,
                displaced: displaced.clone(),
            },
        ) {
            debug!(
                remote = %remote,
                token = %hex::encode(&token),
                "router handover: displacing older connection"
            );
            old.displaced.notify_one();
        }
    }

    loop {
        let frames = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = displaced.notified() => {
                trace!(remote = %remote, "router connection displaced by handover");
                return; // Successor owns the registry slot.
            }
            frames = framing::read_multipart(&mut read_half) => frames,
        };

        match frames {
            Ok(frames) => {
                if inbound_tx
                    .send(RouterInbound {
                        token: token.clone(),
                        frames,
                    })
                    .await
                    .is_err()
                {
                    break; // Pipeline gone; transport is stopping.
                }
            }
            Err(e) => {
                trace!(remote = %remote, error = %e, "router connection closed");
                break;
            }
        }
    }

    // Unregister only if this connection still owns the slot.
    let mut registry = connections.lock().await;
    let owns_slot = registry
        .peek(&token)
        .map(|slot| slot.serial == serial)
        .unwrap_or(false);
    if owns_slot {
        registry.pop(&token);
    }
}

/// Drains the reply queue in enqueue order. Each send is bounded by
/// `reply_send_timeout`; failures are logged, never retried.
async fn reply_poller(
    mut reply_rx: mpsc::Receiver<(Vec<u8>, Vec<Vec<u8>>)>,
    connections: Registry,
    reply_send_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("router reply poller shutting down");
                    return;
                }
                continue;
            }
            next = reply_rx.recv() => next,
        };

        let Some((token, frames)) = next else {
            return;
        };

        let writer = {
            let mut registry = connections.lock().await;
            registry.get(&token).map(|slot| slot.writer.clone())
        };
        let Some(writer) = writer else {
            warn!(
                token = %hex::encode(&token),
                "dropping reply: originator connection is gone"
            );
            continue;
        };

        let mut writer = writer.lock().await;
        match tokio::time::timeout(
            reply_send_timeout,
            framing::write_multipart(&mut *writer, &frames),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(token = %hex::encode(&token), error = %e, "reply send failed");
            }
            Err(_) => {
                warn!(token = %hex::encode(&token), "reply send timed out");
            }
        }
    }
}

//! # Dealer Worker Pool and Request Correlator
//!
//! Outbound requests flow through a bounded queue into a fixed pool of
//! dealer workers. Each worker:
//!
//! 1. takes one [`MessageRequest`] from the queue,
//! 2. opens a short-lived outbound connection to the target peer,
//! 3. sends the encoded envelope,
//! 4. receives `expected_replies` envelopes sequentially, each bounded by
//!    the request timeout, validating signature and version on each,
//! 5. resolves the request's completion handle.
//!
//! Connection attempts are retried inside the request deadline (a dealer
//! keeps dialing until the peer appears or the timeout fires), so an
//! unreachable peer surfaces as `Timeout`, not a connect error. Other
//! failures requeue the request with a 100 ms backoff until the retry
//! budget is exhausted; the final failure is surfaced on the handle.
//!
//! The connection is torn down in scope: the write half is shut down
//! after the last receive, so no delay is needed between completing a
//! request and releasing the socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::envelope;
use crate::error::TransportError;
use crate::identity::{BoundPeer, Keypair, Peer};
use crate::messages::{HistoryEntry, InboundMessage, Message, MessageHistory, MessageKind};
use crate::transport::DifferentVersionHandler;
use crate::version::VersionGate;

/// Retry budget for a single outbound request.
pub const MAX_REQUEST_RETRIES: u32 = 10;

/// Backoff before a failed request is requeued.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Interval between connection attempts inside one request deadline.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Timeout used by `send_message` (fire-and-await, no replies).
pub const FIRE_AND_AWAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Capacity of the request queue.
pub(crate) const REQUEST_QUEUE_SIZE: usize = 256;

type ReplyHandle = oneshot::Sender<Result<Vec<InboundMessage>, TransportError>>;

/// One outbound request awaiting completion.
pub struct MessageRequest {
    pub id: Uuid,
    pub message: Message,
    pub peer: BoundPeer,
    pub enqueued_at: Instant,
    pub timeout: Duration,
    pub expected_replies: usize,
    pub retries: u32,
    handle: ReplyHandle,
}

impl MessageRequest {
    pub fn retryable(&self) -> bool {
        self.retries < MAX_REQUEST_RETRIES
    }
}

impl std::fmt::Debug for MessageRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRequest")
            .field("id", &self.id)
            .field("kind", &self.message.kind())
            .field("peer", &self.peer.endpoint)
            .field("expected_replies", &self.expected_replies)
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

/// State shared by all dealer workers.
pub(crate) struct DealerContext {
    pub keypair: Arc<Keypair>,
    pub self_peer: Peer,
    pub gate: Arc<VersionGate>,
    pub history: Arc<MessageHistory>,
    /// First reply of each request is forwarded here for routing-table
    /// liveness updates.
    pub liveness_tx: mpsc::Sender<InboundMessage>,
    pub different_version: Option<DifferentVersionHandler>,
    /// Requeue path for retried requests.
    pub queue_tx: mpsc::Sender<MessageRequest>,
}

/// Cheap-to-clone handle for enqueueing outbound requests.
#[derive(Clone)]
pub struct RequestSender {
    queue_tx: mpsc::Sender<MessageRequest>,
    request_count: Arc<AtomicU64>,
    self_bound: BoundPeer,
}

impl RequestSender {
    pub(crate) fn new(queue_tx: mpsc::Sender<MessageRequest>, self_bound: BoundPeer) -> Self {
        Self {
            queue_tx,
            request_count: Arc::new(AtomicU64::new(0)),
            self_bound,
        }
    }

    /// Enqueue a request expecting `expected_replies` replies and await
    /// its completion. Dropping the returned future abandons only this
    /// request; an in-flight send is not aborted.
    pub async fn send_with_reply(
        &self,
        peer: &BoundPeer,
        message: Message,
        timeout: Duration,
        expected_replies: usize,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        let (handle, completion) = oneshot::channel();
        let request = MessageRequest {
            id: Uuid::new_v4(),
            message,
            peer: peer.clone(),
            enqueued_at: Instant::now(),
            timeout,
            expected_replies,
            retries: 0,
            handle,
        };
        self.request_count.fetch_add(1, Ordering::Relaxed);
        trace!(id = %request.id, peer = %peer.endpoint, "enqueueing request");
        self.queue_tx
            .send(request)
            .await
            .map_err(|_| TransportError::Disposed)?;
        completion.await.map_err(|_| TransportError::Cancelled)?
    }

    /// Fire-and-await: send with no expected replies and a 3 s deadline.
    pub async fn send_message(
        &self,
        peer: &BoundPeer,
        message: Message,
    ) -> Result<(), TransportError> {
        self.send_with_reply(peer, message, FIRE_AND_AWAIT_TIMEOUT, 0)
            .await
            .map(|_| ())
    }

    /// Total requests enqueued over this transport's lifetime.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn self_bound(&self) -> &BoundPeer {
        &self.self_bound
    }
}

/// The fixed pool of dealer worker tasks.
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        workers: usize,
        queue_rx: mpsc::Receiver<MessageRequest>,
        ctx: Arc<DealerContext>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let handles = (0..workers)
            .map(|n| {
                tokio::spawn(worker_loop(
                    n,
                    queue_rx.clone(),
                    ctx.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();
        Self { handles }
    }

    /// Join all workers. Call after the shutdown token has been set.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    worker: usize,
    queue_rx: Arc<Mutex<mpsc::Receiver<MessageRequest>>>,
    ctx: Arc<DealerContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    trace!(worker, "dealer worker started");
    loop {
        let request = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            request = async { queue_rx.lock().await.recv().await } => match request {
                Some(request) => request,
                None => break,
            },
        };
        handle_request(&ctx, request).await;
    }
    trace!(worker, "dealer worker exiting");
}

async fn handle_request(ctx: &DealerContext, request: MessageRequest) {
    match execute_request(ctx, &request).await {
        Ok(replies) => {
            trace!(id = %request.id, replies = replies.len(), "request completed");
            let _ = request.handle.send(Ok(replies));
        }
        Err(err @ (TransportError::Timeout | TransportError::DifferentVersion)) => {
            debug!(id = %request.id, peer = %request.peer.endpoint, error = %err, "request failed");
            let _ = request.handle.send(Err(err));
        }
        Err(err) => {
            if err.is_retryable_kind() && request.retryable() {
                debug!(
                    id = %request.id,
                    retries = request.retries,
                    error = %err,
                    "request failed, requeueing"
                );
                tokio::time::sleep(RETRY_BACKOFF).await;
                let retried = MessageRequest {
                    retries: request.retries + 1,
                    enqueued_at: Instant::now(),
                    ..request
                };
                if ctx.queue_tx.send(retried).await.is_err() {
                    debug!("request queue closed during requeue");
                }
            } else {
                warn!(
                    id = %request.id,
                    peer = %request.peer.endpoint,
                    retries = request.retries,
                    error = %err,
                    "request exhausted retries, discarding"
                );
                let _ = request.handle.send(Err(err));
            }
        }
    }
}

async fn execute_request(
    ctx: &DealerContext,
    request: &MessageRequest,
) -> Result<Vec<InboundMessage>, TransportError> {
    let stream = connect_with_deadline(&request.peer, request.timeout).await?;
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();

    // Announce a fresh connection token; the remote router assigns it as
    // this connection's reply-routing key. Per-connection randomness keeps
    // concurrent requests to one peer on distinct reply paths.
    let token: [u8; 16] = rand::random();
    let greeting = vec![token.to_vec()];
    bounded(request.timeout, crate::framing::write_multipart(&mut write_half, &greeting)).await?;

    let frames = envelope::encode(&request.message, &ctx.keypair, &ctx.self_peer)
        .map_err(TransportError::Unexpected)?;
    bounded(request.timeout, crate::framing::write_multipart(&mut write_half, &frames)).await?;

    if let Some(digest) = envelope::digest(&frames, false) {
        ctx.history.record(HistoryEntry {
            sender: ctx.self_peer.address(),
            kind: request.message.kind(),
            digest,
        });
    }

    let mut replies = Vec::with_capacity(request.expected_replies);
    for _ in 0..request.expected_replies {
        let reply_frames =
            bounded(request.timeout, crate::framing::read_multipart(&mut read_half)).await?;
        let decoded = envelope::decode(&reply_frames, true)
            .map_err(|e| TransportError::Unexpected(anyhow::anyhow!(e)))?;

        if decoded.message.kind() != MessageKind::Ping
            && !ctx.gate.compatible(&decoded.remote.app_version)
        {
            if let Some(handler) = &ctx.different_version {
                handler(decoded.remote.clone());
            }
            return Err(TransportError::DifferentVersion);
        }

        ctx.history.record(HistoryEntry {
            sender: decoded.remote.address(),
            kind: decoded.message.kind(),
            digest: decoded.digest,
        });
        replies.push(decoded.into_inbound());
    }

    // Scoped teardown: the write half is shut down before the halves
    // drop, so the poller on the remote side observes an orderly close.
    let _ = write_half.shutdown().await;

    if let Some(first) = replies.first() {
        let _ = ctx.liveness_tx.send(first.clone()).await;
    }

    Ok(replies)
}

/// Dial the peer until the request deadline. A dealer keeps reconnecting
/// under the hood, so connection refusal surfaces as `Timeout` once the
/// deadline passes, never as a transport fault.
async fn connect_with_deadline(
    peer: &BoundPeer,
    timeout: Duration,
) -> Result<TcpStream, TransportError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::Timeout);
        }
        match tokio::time::timeout(remaining, TcpStream::connect(peer.endpoint)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                trace!(peer = %peer.endpoint, error = %e, "dealer connect attempt failed");
                let pause = CONNECT_RETRY_INTERVAL
                    .min(deadline.saturating_duration_since(Instant::now()));
                if pause.is_zero() {
                    return Err(TransportError::Timeout);
                }
                tokio::time::sleep(pause).await;
            }
            Err(_) => return Err(TransportError::Timeout),
        }
    }
}

/// Bound a stage of the request by the per-request timeout.
async fn bounded<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = anyhow::Result<T>>,
) -> Result<T, TransportError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TransportError::Unexpected(e)),
        Err(_) => Err(TransportError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::AppProtocolVersion;

    fn test_bound_peer(endpoint: &str) -> BoundPeer {
        let keypair = Keypair::generate();
        let version = AppProtocolVersion::signed(1, Vec::new(), &keypair);
        BoundPeer::new(
            Peer::new(keypair.identity(), version),
            endpoint.parse().unwrap(),
        )
    }

    #[test]
    fn retry_budget() {
        let (handle, _completion) = oneshot::channel();
        let mut request = MessageRequest {
            id: Uuid::new_v4(),
            message: Message::Application {
                tag: 0,
                payload: Vec::new(),
            },
            peer: test_bound_peer("127.0.0.1:1"),
            enqueued_at: Instant::now(),
            timeout: Duration::from_secs(1),
            expected_replies: 0,
            retries: 0,
            handle,
        };
        assert!(request.retryable());
        request.retries = MAX_REQUEST_RETRIES - 1;
        assert!(request.retryable());
        request.retries = MAX_REQUEST_RETRIES;
        assert!(!request.retryable());
    }

    #[tokio::test]
    async fn unreachable_peer_times_out_at_deadline() {
        // Reserve a port, then free it so nothing is listening.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap();
        drop(listener);

        let peer = test_bound_peer(&endpoint.to_string());
        let started = Instant::now();
        let result = connect_with_deadline(&peer, Duration::from_millis(200)).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(TransportError::Timeout)));
        assert!(
            elapsed >= Duration::from_millis(150) && elapsed < Duration::from_millis(500),
            "deadline not honored: {:?}",
            elapsed
        );
    }
}

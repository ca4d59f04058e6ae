//! # Relay Proxy
//!
//! When the transport sits behind NAT it advertises its TURN-relayed
//! address. Peers dialing that address arrive as relayed TCP streams on
//! the TURN client; the relay proxy tunnels each of them into the local
//! router socket so the rest of the transport never knows the difference.
//!
//! A small pool of accept workers pulls relayed streams; each accepted
//! stream gets a detached task that opens a fresh loopback connection to
//! the listen port and pumps bytes both ways until either side closes.
//! Accept errors are logged and the loop immediately retries.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::turn::TurnClient;

/// Default number of relay-proxy accept workers.
pub const DEFAULT_RELAY_WORKERS: usize = 3;

/// Spawn `workers` accept loops tunneling relayed streams to
/// `127.0.0.1:listen_port`.
pub(crate) fn spawn_relay_proxies(
    turn: TurnClient,
    listen_port: u16,
    workers: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|n| {
            let turn = turn.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(relay_proxy_loop(n, turn, listen_port, shutdown))
        })
        .collect()
}

async fn relay_proxy_loop(
    worker: usize,
    turn: TurnClient,
    listen_port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    trace!(worker, "relay proxy worker started");
    loop {
        let stream = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            stream = turn.accept_relayed_stream() => stream,
        };

        match stream {
            Some(stream) => {
                debug!(worker, "accepted relayed stream");
                tokio::spawn(tunnel(stream, listen_port));
            }
            None => {
                // Client shut down; nothing more to accept.
                break;
            }
        }
    }
    trace!(worker, "relay proxy worker exiting");
}

/// Pump bytes between the relayed stream and a fresh loopback connection
/// to the router. The task owns both sockets; either side closing (or any
/// error) closes both.
async fn tunnel(mut relayed: TcpStream, listen_port: u16) {
    let local_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, listen_port));
    let mut local = match TcpStream::connect(local_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "relay tunnel could not reach local router");
            return;
        }
    };
    let _ = local.set_nodelay(true);

    match tokio::io::copy_bidirectional(&mut relayed, &mut local).await {
        Ok((to_local, to_relay)) => {
            trace!(to_local, to_relay, "relay tunnel closed");
        }
        Err(e) => {
            debug!(error = %e, "relay tunnel terminated");
        }
    }
}

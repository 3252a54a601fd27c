//! Relay proxy (spec.md §4.C): tunnels accepted relayed streams to the
//! local listening port, so the application-facing router socket never
//! needs to know whether a connection arrived directly or via TURN.
//!
//! Grounded in the teacher's detached-task-per-connection idiom
//! (`transport::swarm` spawns one task per accepted substream) but
//! reworked around a plain bidirectional TCP copy rather than a libp2p
//! stream, since the TURN client here hands back a `tokio::net::TcpStream`
//! (spec.md §4.B).

use std::sync::Arc;

use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::turn::TurnClient;

/// Runs `worker_count` relay-proxy loops concurrently, each repeatedly
/// accepting a relayed stream and forking a detached bidirectional-copy
/// task to `127.0.0.1:listen_port` (spec.md §4.C). Accept errors are
/// logged and the loop retries immediately (spec.md §4.B Failure policy,
/// which governs `accept_relayed_stream` too). Returns once `cancel`
/// fires.
pub async fn run_relay_proxy_workers(
    client: Arc<TurnClient>,
    listen_port: u16,
    worker_count: usize,
    cancel: CancellationToken,
) {
    let mut workers = Vec::with_capacity(worker_count);
    for id in 0..worker_count {
        let client = client.clone();
        let cancel = cancel.clone();
        workers.push(tokio::spawn(async move {
            run_single_worker(id, client, listen_port, cancel).await;
        }));
    }
    for worker in workers {
        let _ = worker.await;
    }
}

async fn run_single_worker(
    worker_id: usize,
    client: Arc<TurnClient>,
    listen_port: u16,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = client.accept_relayed_stream() => accepted,
        };

        match accepted {
            Ok(relayed) => {
                let cancel = cancel.clone();
                tokio::spawn(tunnel(relayed, listen_port, cancel));
            }
            Err(e) => {
                warn!(worker_id, error = %e, "relay proxy accept failed, retrying");
            }
        }
    }
}

/// Owns `relayed` for its lifetime: opens a fresh loopback connection to
/// `listen_port` and copies bytes in both directions until either side
/// closes or errors, at which point both ends close (spec.md §4.C).
async fn tunnel(mut relayed: TcpStream, listen_port: u16, cancel: CancellationToken) {
    let local = tokio::select! {
        _ = cancel.cancelled() => return,
        local = TcpStream::connect(("127.0.0.1", listen_port)) => local,
    };

    let mut local = match local {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, listen_port, "relay proxy could not reach local listener");
            return;
        }
    };

    match copy_bidirectional(&mut relayed, &mut local).await {
        Ok((to_local, to_relay)) => {
            debug!(to_local, to_relay, "relay proxy tunnel closed");
        }
        Err(e) => {
            debug!(error = %e, "relay proxy tunnel closed with error");
        }
    }
}

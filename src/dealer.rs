//! Dealer worker pool (spec.md §4.E): a fixed pool of tasks draining the
//! request queue, each opening a short-lived outbound connection per
//! request and resolving its completion handle.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::envelope::{self, DecodedMessage, MessageKind};
use crate::error::TransportError;
use crate::history::{HistoryEntry, MessageHistory};
use crate::identity::IdentityKeys;
use crate::kademlia::RoutingProtocol;
use crate::peer::{AppProtocolVersion, BoundPeer, Peer};
use crate::queue::RequestQueue;
use crate::request::MessageRequest;
use crate::wire;

/// Default pause before disposing a dealer connection, avoiding a race
/// between the reply-read loop and socket teardown (spec.md §4.E step 7,
/// §9 Design Notes — kept configurable pending a scoped-lifetime redesign).
pub const DEFAULT_PREDISPOSE_DELAY: Duration = Duration::from_millis(100);

/// Delay before requeueing a retryable failure (spec.md §4.E error table).
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Context shared by every worker in the pool.
pub struct DealerContext {
    pub identity: Arc<IdentityKeys>,
    pub local_peer: Peer,
    pub local_version: AppProtocolVersion,
    pub trusted_signers: Vec<Vec<u8>>,
    pub accept_foreign: Arc<dyn Fn(&AppProtocolVersion, &[Vec<u8>]) -> bool + Send + Sync>,
    pub routing: Arc<dyn RoutingProtocol>,
    pub requests: RequestQueue,
    pub predispose_delay: Duration,
    /// Records each reply this worker itself receives — spec.md §3's
    /// "inbound and own-received replies" — so the requester's own history
    /// carries the replies it got, not just what the router saw (§8 S1).
    pub history: Arc<MessageHistory>,
}

enum Outcome {
    Replies(Vec<DecodedMessage>),
    DifferentVersion,
    Timeout,
    Retryable(String),
}

/// Spawns `workers` tasks sharing `rx`, all exiting once `cancel` fires and
/// the queue drains. Returns their join handles so the facade can await a
/// clean shutdown.
pub fn spawn_workers(
    workers: usize,
    rx: mpsc::Receiver<MessageRequest>,
    context: Arc<DealerContext>,
    cancel: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let rx = Arc::new(AsyncMutex::new(rx));
    (0..workers)
        .map(|_| {
            let rx = rx.clone();
            let context = context.clone();
            let cancel = cancel.clone();
            tokio::spawn(worker_loop(rx, context, cancel))
        })
        .collect()
}

async fn worker_loop(
    rx: Arc<AsyncMutex<mpsc::Receiver<MessageRequest>>>,
    context: Arc<DealerContext>,
    cancel: CancellationToken,
) {
    loop {
        let request = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                request = rx.recv() => request,
            }
        };
        let Some(request) = request else { break };

        match exchange(&request, &context).await {
            Outcome::Replies(replies) => {
                if let Some(first) = replies.first() {
                    let bound = BoundPeer::new(
                        first.sender.clone(),
                        request.peer.host.clone(),
                        request.peer.port,
                    );
                    context.routing.receive(&bound);
                }
                request.resolve(Ok(replies));
            }
            Outcome::DifferentVersion => request.resolve(Err(TransportError::DifferentVersion)),
            Outcome::Timeout => request.resolve(Err(TransportError::Timeout)),
            Outcome::Retryable(reason) => {
                if request.retryable() {
                    let requests = context.requests.clone();
                    let retried = request.retry_copy();
                    tokio::spawn(async move {
                        tokio::time::sleep(RETRY_DELAY).await;
                        if requests.enqueue(retried).await.is_err() {
                            debug!("dealer: request queue closed, dropping retry");
                        }
                    });
                } else {
                    warn!(reason, "dealer: retries exhausted, discarding request");
                    // Completion handle is left unresolved: dropping `request`
                    // drops its oneshot sender, and the caller observes
                    // `Cancelled` once it stops waiting (spec.md §4.E).
                }
            }
        }

        // A cancellation observed while this exchange was in flight still
        // exits the loop after resolving (or deliberately not resolving)
        // the request just handled, per spec.md §4.E.
        if cancel.is_cancelled() {
            break;
        }
    }
}

async fn exchange(request: &MessageRequest, context: &DealerContext) -> Outcome {
    let connect = tokio::time::timeout(
        request.timeout,
        TcpStream::connect(request.peer.endpoint()),
    )
    .await;
    let mut stream = match connect {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Outcome::Retryable(format!("connect failed: {e}")),
        Err(_) => return Outcome::Timeout,
    };

    let frames = match envelope::encode(
        request.kind,
        request.body.clone(),
        &context.local_version,
        &context.local_peer,
        &context.identity,
        None,
    ) {
        Ok(frames) => frames,
        Err(e) => return Outcome::Retryable(format!("encode failed: {e}")),
    };

    if tokio::time::timeout(request.timeout, wire::write_multipart(&mut stream, &frames))
        .await
        .is_err()
    {
        return Outcome::Timeout;
    }

    let mut replies = Vec::with_capacity(request.expected_replies);
    for _ in 0..request.expected_replies {
        let read = tokio::time::timeout(request.timeout, wire::read_multipart(&mut stream)).await;
        let frames = match read {
            Ok(Ok(frames)) => frames,
            Ok(Err(e)) => return Outcome::Retryable(format!("read failed: {e}")),
            Err(_) => return Outcome::Timeout,
        };

        let decoded = match envelope::decode(frames, true) {
            Ok(decoded) => decoded,
            Err(e) => return Outcome::Retryable(format!("decode failed: {e}")),
        };

        if decoded.kind != MessageKind::Ping {
            let accept_foreign = context.accept_foreign.clone();
            let compatible = context.local_version.compatible(
                &decoded.version,
                &context.trusted_signers,
                |remote, trusted| accept_foreign(remote, trusted),
            );
            if !compatible {
                return Outcome::DifferentVersion;
            }
        }

        if let Ok(peer_address) = decoded.sender.address() {
            context.history.record(HistoryEntry {
                peer_address,
                kind: decoded.kind,
                observed_at: std::time::Instant::now(),
            });
        }

        replies.push(decoded);
    }

    let predispose_delay = context.predispose_delay;
    tokio::spawn(async move {
        tokio::time::sleep(predispose_delay).await;
        drop(stream);
    });

    Outcome::Replies(replies)
}

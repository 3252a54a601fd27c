//! Router endpoint (spec.md §4.D): a single inbound socket with *handover*
//! semantics — on identity collision the newer connection displaces the
//! older — and the six-step receive pipeline.
//!
//! There is no persistent ZeroMQ ROUTER identity table here (§3's framing
//! note); the "identity" a reply is addressed to is the sender's own
//! address, and "the connection currently registered for that address" is
//! the handover unit. Registering a new connection for an address simply
//! drops the old map entry, which starves the old connection's writer task
//! of further sends and lets it close.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::envelope::{self, DecodedMessage, MessageKind};
use crate::error::TransportError;
use crate::history::{HistoryEntry, MessageHistory};
use crate::identity::{Address, IdentityKeys};
use crate::kademlia::RoutingProtocol;
use crate::peer::{AppProtocolVersion, BoundPeer, Peer};
use crate::wire;

/// Default send timeout applied by the reply poller (REDESIGN FLAGS,
/// configurable as `router_reply_timeout`).
pub const DEFAULT_ROUTER_REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Called once per message whose sender's `AppProtocolVersion` failed the
/// compatibility gate (spec.md §4.D step 4).
pub trait DifferentVersionHandler: Send + Sync {
    fn on_different_version(&self, peer: Peer);
}

/// Invoked for every valid `Application` message the router accepts,
/// after history/routing-table bookkeeping (spec.md §4.D step 6). Internal
/// kinds (`Ping`/`FindNode`) are answered directly by the router and never
/// reach this handler.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &DecodedMessage, replier: &Replier<'_>);
}

/// A handler that never replies, for configurations that only consume
/// broadcasts / fire-and-forget sends.
pub struct NoopMessageHandler;

#[async_trait]
impl MessageHandler for NoopMessageHandler {
    async fn handle(&self, _message: &DecodedMessage, _replier: &Replier<'_>) {}
}

/// Enqueues a reply addressed to whichever connection is currently
/// registered for `token`; dropped silently if none is (the requester is
/// expected to time out, per spec.md §4.D).
pub struct Replier<'a> {
    router: &'a RouterEndpoint,
    token: Address,
    local_identity: &'a IdentityKeys,
    local_peer: &'a Peer,
    local_version: &'a AppProtocolVersion,
}

impl Replier<'_> {
    pub async fn reply(&self, kind: MessageKind, body: Vec<Vec<u8>>) -> Result<(), TransportError> {
        let frames = envelope::encode(
            kind,
            body,
            self.local_version,
            self.local_peer,
            self.local_identity,
            Some(self.token.to_vec()),
        )?;
        self.router.enqueue_reply(self.token, frames).await
    }
}

/// The router's half of the socket: the handover map and the reply queue
/// feeding the single poller task.
pub struct RouterEndpoint {
    connections: Mutex<HashMap<Address, mpsc::Sender<Vec<Vec<u8>>>>>,
    reply_tx: mpsc::Sender<(Address, Vec<Vec<u8>>)>,
}

impl RouterEndpoint {
    fn new(reply_tx: mpsc::Sender<(Address, Vec<Vec<u8>>)>) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            reply_tx,
        }
    }

    async fn enqueue_reply(&self, token: Address, frames: Vec<Vec<u8>>) -> Result<(), TransportError> {
        self.reply_tx
            .send((token, frames))
            .await
            .map_err(|_| TransportError::Unexpected("reply queue is closed".into()))
    }

    /// Handover: register (or displace) the writer channel for `address`.
    fn register(&self, address: Address, tx: mpsc::Sender<Vec<Vec<u8>>>) {
        self.connections.lock().insert(address, tx);
    }

    fn deregister_if_current(&self, address: &Address, tx: &mpsc::Sender<Vec<Vec<u8>>>) {
        let mut connections = self.connections.lock();
        if connections.get(address).is_some_and(|current| current.same_channel(tx)) {
            connections.remove(address);
        }
    }
}

/// Drains the reply queue for the router's lifetime, forwarding each reply
/// to whichever connection is currently registered for its token, bounded
/// by `send_timeout` (spec.md §4.D: "failure to send is logged, not
/// retried").
async fn run_reply_poller(
    router: Arc<RouterEndpoint>,
    mut reply_rx: mpsc::Receiver<(Address, Vec<Vec<u8>>)>,
    send_timeout: Duration,
) {
    while let Some((token, frames)) = reply_rx.recv().await {
        let sender = router.connections.lock().get(&token).cloned();
        let Some(sender) = sender else {
            debug!("reply dropped: no live connection for this token");
            continue;
        };
        if tokio::time::timeout(send_timeout, sender.send(frames))
            .await
            .is_err()
        {
            warn!("reply send timed out, not retried");
        }
    }
}

/// Shared, caller-supplied context the router needs to answer internal
/// kinds and dispatch application messages.
pub struct RouterContext {
    pub identity: Arc<IdentityKeys>,
    pub local_peer: Peer,
    pub local_version: AppProtocolVersion,
    pub trusted_signers: Vec<Vec<u8>>,
    pub history: Arc<MessageHistory>,
    pub routing: Arc<dyn RoutingProtocol>,
    pub message_handler: Arc<dyn MessageHandler>,
    pub different_version_handler: Arc<dyn DifferentVersionHandler>,
    pub accept_foreign: Arc<dyn Fn(&AppProtocolVersion, &[Vec<u8>]) -> bool + Send + Sync>,
}

/// Runs the accept loop until `cancel` fires, spawning one task per
/// connection and the single reply-poller task.
pub async fn run(
    listener: TcpListener,
    context: Arc<RouterContext>,
    reply_timeout: Duration,
    cancel: CancellationToken,
) {
    let (reply_tx, reply_rx) = mpsc::channel(256);
    let router = Arc::new(RouterEndpoint::new(reply_tx));

    let poller = tokio::spawn(run_reply_poller(router.clone(), reply_rx, reply_timeout));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        trace!(%peer_addr, "router accepted connection");
                        tokio::spawn(handle_connection(
                            stream,
                            router.clone(),
                            context.clone(),
                            cancel.clone(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "router accept failed"),
                }
            }
        }
    }

    poller.abort();
}

async fn handle_connection(
    mut stream: TcpStream,
    router: Arc<RouterEndpoint>,
    context: Arc<RouterContext>,
    cancel: CancellationToken,
) {
    // Step 1: if cancellation is already pending, drop.
    if cancel.is_cancelled() {
        return;
    }

    let frames = match wire::read_multipart(&mut stream).await {
        Ok(frames) => frames,
        Err(e) => {
            debug!(error = %e, "router: failed to read multipart, dropping");
            return;
        }
    };

    // Step 2: parse envelope; if parse fails, log and drop. Inbound
    // connections never carry a reply identity frame (replies travel back
    // on the same connection that originated the request).
    let decoded = match envelope::decode(frames, false) {
        Ok(decoded) => decoded,
        Err(e) => {
            debug!(error = %e, "router: envelope parse/verify failed, dropping");
            return;
        }
    };

    let Ok(sender_address) = decoded.sender.address() else {
        debug!("router: sender identity bytes invalid, dropping");
        return;
    };

    // Step 3: append to history.
    context.history.record(HistoryEntry {
        peer_address: sender_address,
        kind: decoded.kind,
        observed_at: std::time::Instant::now(),
    });

    // Step 4: version gate, skipped for PING.
    if decoded.kind != MessageKind::Ping {
        let accept_foreign = context.accept_foreign.clone();
        let compatible = context.local_version.compatible(
            &decoded.version,
            &context.trusted_signers,
            |remote, trusted| accept_foreign(remote, trusted),
        );
        if !compatible {
            context
                .different_version_handler
                .on_different_version(decoded.sender.clone());
            return;
        }
    }

    // Register this connection for handover before dispatch, so a reply
    // enqueued synchronously during dispatch has somewhere to go.
    let (writer_tx, writer_rx) = mpsc::channel::<Vec<Vec<u8>>>(4);
    router.register(sender_address, writer_tx.clone());

    let bound_peer = decoded.sender.public_ip.map(|ip: IpAddr| {
        BoundPeer::new(decoded.sender.clone(), ip.to_string(), remote_listen_port(&decoded))
    });

    // Step 5: deliver to routing protocol.
    if let Some(bound_peer) = &bound_peer {
        context.routing.receive(bound_peer);
    }

    // Step 6: dispatch. Ping/FindNode are internal kinds answered directly;
    // everything else reaches the application handler.
    let replier = Replier {
        router: &router,
        token: sender_address,
        local_identity: &context.identity,
        local_peer: &context.local_peer,
        local_version: &context.local_version,
    };

    match decoded.kind {
        MessageKind::Ping => {
            let _ = replier.reply(MessageKind::Pong, vec![]).await;
        }
        MessageKind::FindNode => {
            let candidates = context.routing.peers_to_broadcast(None);
            let body = candidates
                .iter()
                .take(crate::kademlia::DEFAULT_BUCKET_SIZE)
                .filter_map(|p| bincode::serialize(p).ok())
                .collect();
            let _ = replier.reply(MessageKind::Neighbors, body).await;
        }
        MessageKind::Pong | MessageKind::Neighbors => {
            debug!("router: reply-only kind received as a request, dropping");
        }
        MessageKind::Application => {
            context.message_handler.handle(&decoded, &replier).await;
        }
    }

    // The writer task forwards whatever the handler enqueued, then exits
    // once displaced by a future connection from the same address or once
    // the stream errors out.
    write_replies(stream, writer_rx).await;
    router.deregister_if_current(&sender_address, &writer_tx);
}

/// PING/FIND_NODE requests don't currently carry the sender's own listen
/// port in the envelope; until spec.md's wire format is extended with one,
/// inbound connections from peers who haven't previously announced a
/// `BoundPeer` (e.g. via bootstrap) cannot be placed in the routing table
/// from the router side alone. We use port 0 as a sentinel meaning
/// "address only, no known endpoint" rather than guessing the ephemeral
/// source port of the TCP connection.
fn remote_listen_port(_decoded: &DecodedMessage) -> u16 {
    0
}

async fn write_replies(mut stream: TcpStream, mut writer_rx: mpsc::Receiver<Vec<Vec<u8>>>) {
    while let Some(frames) = writer_rx.recv().await {
        if let Err(e) = wire::write_multipart(&mut stream, &frames).await {
            debug!(error = %e, "router: failed to write reply, closing connection");
            return;
        }
    }
}

//! Gossip transport core (spec.md §1–§2): identity-authenticated
//! router/dealer messaging, TURN NAT traversal, and a Kademlia routing
//! table, wired together behind one lifecycle-managed facade.
//!
//! Payload semantics, ledger state, and persistent storage are deliberately
//! out of scope — this crate is the transport, not the application above
//! it (spec.md §1 Non-goals).

pub mod config;
pub mod dealer;
pub mod envelope;
pub mod error;
pub mod history;
pub mod identity;
pub mod kademlia;
pub mod peer;
pub mod queue;
pub mod relay;
pub mod request;
pub mod router;
pub mod turn;
pub mod wire;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use config::TransportConfig;
pub use envelope::{DecodedMessage, MessageKind};
pub use error::{LifecycleError, TransportError};
pub use history::MessageHistory;
pub use identity::{Address, IdentityKeys, PeerIdentity};
pub use kademlia::{KademliaTable, RoutingProtocol};
pub use peer::{AppProtocolVersion, BoundPeer, Peer};
pub use request::MAX_RETRIES;

use dealer::DealerContext;
use kademlia::TransportCapability;
use queue::{BroadcastQueue, RequestQueue};
use router::RouterContext;

/// The six lifecycle states (spec.md §3). Transitions are one-way; once
/// `Stopped` or `Disposed`, an instance cannot be restarted — it is
/// single-use, per spec.md §3's `Stopped -> Starting` prohibition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    New,
    Starting,
    Running,
    Stopping,
    Stopped,
    Disposed,
}

/// Resources created by `Start` and torn down by `Stop`/`Dispose`. Held
/// behind a lock so `Stop` can take them out exactly once.
struct RunningResources {
    lifetime_cancel: CancellationToken,
    dealer_workers: Vec<tokio::task::JoinHandle<()>>,
    router_task: tokio::task::JoinHandle<()>,
    turn_tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Transport-capability view handed to the Kademlia routing protocol at
/// construction (spec.md §9 Design Notes): lets the protocol issue
/// outbound requests without owning the facade. Composition in both
/// directions, full ownership in neither.
struct RequestQueueCapability {
    requests: RequestQueue,
}

#[async_trait]
impl TransportCapability for RequestQueueCapability {
    async fn send_with_reply(
        &self,
        peer: &BoundPeer,
        kind: MessageKind,
        body: Vec<Vec<u8>>,
        timeout: Duration,
        expected_replies: usize,
    ) -> Result<Vec<DecodedMessage>, TransportError> {
        self.requests
            .send_with_reply(
                peer.clone(),
                kind,
                body,
                timeout,
                expected_replies,
                &CancellationToken::new(),
            )
            .await
    }
}

/// Wires components A–G behind one facade (spec.md §4.H): owns lifecycle,
/// exposes the send/broadcast/reply surface, and runs the periodic
/// RefreshTable/RebuildConnection loops while `Running`.
pub struct Transport {
    config: Arc<TransportConfig>,
    identity: Arc<IdentityKeys>,
    local_peer: Peer,
    history: Arc<MessageHistory>,
    routing: Arc<dyn RoutingProtocol>,
    requests: RequestQueue,
    broadcast: BroadcastQueue,
    request_count: Arc<AtomicU64>,
    state: Arc<RwLock<LifecycleState>>,
    running_tx: watch::Sender<bool>,
    running_rx: watch::Receiver<bool>,
    resources: Arc<tokio::sync::Mutex<Option<RunningResources>>>,
    listen_port: Arc<RwLock<u16>>,
    public_host: Arc<RwLock<Option<String>>>,
    pending: Option<PendingReceivers>,
}

impl Transport {
    /// Construct a new transport. Does not bind any sockets or spawn any
    /// tasks — that happens in `start`.
    pub fn new(config: TransportConfig) -> Self {
        // Idempotent: harmless if the host application already installed
        // its own subscriber.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .try_init();

        let config = Arc::new(config);
        let identity = Arc::new(config.identity.clone());
        let local_peer = Peer::new(identity.identity(), config.app_version.clone());

        let (requests, request_rx) = RequestQueue::bounded(config.request_queue_capacity);
        let (broadcast, broadcast_rx) = BroadcastQueue::bounded(config.request_queue_capacity);

        let capability = Arc::new(RequestQueueCapability { requests: requests.clone() });
        let routing: Arc<dyn RoutingProtocol> = Arc::new(KademliaTable::new(
            identity.identity().address(),
            config.table_size,
            config.bucket_size,
            capability,
        ));

        // Stash the request-queue receiver and broadcast-queue receiver
        // behind the config clone until `start` spawns the consuming
        // tasks; see `PendingReceivers` below.
        let pending = PendingReceivers { request_rx: Some(request_rx), broadcast_rx: Some(broadcast_rx) };

        let (running_tx, running_rx) = watch::channel(false);

        Self {
            config,
            identity,
            local_peer,
            history: Arc::new(MessageHistory::new()),
            routing,
            requests,
            broadcast,
            request_count: Arc::new(AtomicU64::new(0)),
            state: Arc::new(RwLock::new(LifecycleState::New)),
            running_tx,
            running_rx,
            resources: Arc::new(tokio::sync::Mutex::new(None)),
            listen_port: Arc::new(RwLock::new(0)),
            public_host: Arc::new(RwLock::new(None)),
            pending: Some(pending),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    pub fn local_address(&self) -> Address {
        self.identity.identity().address()
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn routing_protocol(&self) -> Arc<dyn RoutingProtocol> {
        self.routing.clone()
    }

    /// `WaitForRunning`: resolves once `Running` transitions to true.
    /// Callers must not cache the returned receiver across a
    /// `Stop`/restart cycle — there is none here, since this instance is
    /// single-use after `Stop` (spec.md §3).
    pub async fn wait_for_running(&self) {
        let mut rx = self.running_rx.clone();
        let _ = rx.wait_for(|running| *running).await;
    }

    /// `Start` (spec.md §4.H): validate config, bind the router socket,
    /// set up TURN/NAT traversal if configured, spawn the router accept
    /// loop and dealer worker pool. Idempotent guard: fails with
    /// `AlreadyRunning` if not called from `New`.
    pub async fn start(&mut self) -> Result<(), TransportError> {
        {
            let mut state = self.state.write();
            if *state != LifecycleState::New {
                return Err(TransportError::Lifecycle(LifecycleError::AlreadyRunning));
            }
            *state = LifecycleState::Starting;
        }

        self.config.validate()?;

        let bind_addr = format!("0.0.0.0:{}", self.config.listen_port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| TransportError::Unexpected(format!("router bind failed: {e}")))?;
        let bound_port = listener
            .local_addr()
            .map_err(|e| TransportError::Unexpected(format!("router local_addr failed: {e}")))?
            .port();
        *self.listen_port.write() = bound_port;

        let lifetime_cancel = CancellationToken::new();
        let mut turn_tasks = Vec::new();

        let public_host = if let Some(host) = &self.config.host {
            Some(host.clone())
        } else if let Some(first_ice) = self.config.ice_servers.first() {
            let server_addr: SocketAddr = first_ice
                .parse()
                .map_err(|e| TransportError::Unexpected(format!("invalid ice_servers entry: {e}")))?;
            let client = Arc::new(
                turn::TurnClient::connect(server_addr, self.identity.identity().as_bytes().to_vec()).await?,
            );

            let mapped = client.get_mapped_address().await?;
            let local_host = mapped.ip().to_string();

            let behind_nat = client.is_behind_nat(&[mapped]).await.unwrap_or(true);
            if behind_nat {
                let allocation = client.allocate(turn::DEFAULT_ALLOCATION_LIFETIME).await?;
                info!(relayed = %allocation.relayed_address, "allocated TURN relay");

                let refresh_cancel = lifetime_cancel.clone();
                let refresh_client = client.clone();
                let lifetime = allocation.lifetime;
                turn_tasks.push(tokio::spawn(async move {
                    turn::run_allocation_refresh_loop(refresh_client, lifetime, refresh_cancel).await;
                }));

                let permission_cancel = lifetime_cancel.clone();
                let permission_client = client.clone();
                let permission_routing = self.routing.clone();
                turn_tasks.push(tokio::spawn(async move {
                    turn::run_permission_refresh_loop(permission_client, permission_routing, permission_cancel)
                        .await;
                }));

                let proxy_cancel = lifetime_cancel.clone();
                turn_tasks.push(tokio::spawn(relay::run_relay_proxy_workers(
                    client,
                    bound_port,
                    self.config.relay_proxy_workers,
                    proxy_cancel,
                )));

                Some(allocation.relayed_address.ip().to_string())
            } else {
                Some(local_host)
            }
        } else {
            // `validate` already guarantees one of the two is present.
            None
        };
        *self.public_host.write() = public_host;

        let router_context = Arc::new(RouterContext {
            identity: self.identity.clone(),
            local_peer: self.local_peer.clone(),
            local_version: self.config.app_version.clone(),
            trusted_signers: self.config.trusted_signers.clone(),
            history: self.history.clone(),
            routing: self.routing.clone(),
            message_handler: self.config.message_handler.clone(),
            different_version_handler: self.config.different_version_handler.clone(),
            accept_foreign: Arc::new(peer::signer_is_trusted),
        });

        let router_cancel = lifetime_cancel.clone();
        let reply_timeout = self.config.router_reply_timeout;
        let router_task = tokio::spawn(router::run(listener, router_context, reply_timeout, router_cancel));

        let request_rx = self
            .pending
            .as_mut()
            .and_then(|p| p.request_rx.take())
            .ok_or_else(|| TransportError::Lifecycle(LifecycleError::AlreadyRunning))?;

        let dealer_context = Arc::new(DealerContext {
            identity: self.identity.clone(),
            local_peer: self.local_peer.clone(),
            local_version: self.config.app_version.clone(),
            trusted_signers: self.config.trusted_signers.clone(),
            accept_foreign: Arc::new(peer::signer_is_trusted),
            routing: self.routing.clone(),
            requests: self.requests.clone(),
            predispose_delay: self.config.dealer_predispose_delay,
            history: self.history.clone(),
        });
        let dealer_workers = dealer::spawn_workers(
            self.config.workers,
            request_rx,
            dealer_context,
            lifetime_cancel.clone(),
        );

        *self.resources.lock().await = Some(RunningResources {
            lifetime_cancel,
            dealer_workers,
            router_task,
            turn_tasks,
        });

        *self.state.write() = LifecycleState::Running;
        Ok(())
    }

    /// `Run`: marks `Running` (resolving `WaitForRunning`), launches the
    /// RefreshTable, RebuildConnection, and broadcast-drain loops, and
    /// returns once the first of them completes.
    pub async fn run(&mut self) -> Result<(), TransportError> {
        if self.state() != LifecycleState::Running {
            return Err(TransportError::Lifecycle(LifecycleError::NotRunning));
        }

        let cancel = {
            let resources = self.resources.lock().await;
            resources
                .as_ref()
                .ok_or(TransportError::Lifecycle(LifecycleError::NotRunning))?
                .lifetime_cancel
                .clone()
        };

        self.running_tx.send_replace(true);

        let broadcast_rx = self
            .pending
            .as_mut()
            .and_then(|p| p.broadcast_rx.take())
            .ok_or(TransportError::Lifecycle(LifecycleError::NotRunning))?;

        let broadcast_loop = {
            let requests = self.requests.clone();
            let routing = self.routing.clone();
            let concurrency = self.config.broadcast_concurrency;
            tokio::spawn(queue::run_broadcast_loop(broadcast_rx, requests, routing, concurrency))
        };

        let refresh_loop = {
            let routing = self.routing.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(kademlia::REFRESH_TABLE_INTERVAL) => {}
                    }
                    if cancel.is_cancelled() {
                        break;
                    }
                    routing.refresh_table(kademlia::REFRESH_TABLE_INTERVAL).await;
                    routing.check_replacement_cache();
                }
            })
        };

        let rebuild_loop = {
            let routing = self.routing.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    routing.rebuild_connection().await;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(kademlia::REBUILD_CONNECTION_INTERVAL) => {}
                    }
                }
            })
        };

        tokio::select! {
            _ = refresh_loop => {},
            _ = rebuild_loop => {},
            _ = broadcast_loop => {},
            _ = cancel.cancelled() => {},
        }

        Ok(())
    }

    /// `Stop(wait_for)`: cancel the lifetime token, give in-flight work
    /// `wait_for` to settle, then tear down the router and dealer tasks.
    pub async fn stop(&mut self, wait_for: Duration) {
        {
            let mut state = self.state.write();
            if *state != LifecycleState::Running {
                return;
            }
            *state = LifecycleState::Stopping;
        }

        let resources = self.resources.lock().await.take();
        if let Some(resources) = resources {
            resources.lifetime_cancel.cancel();
            tokio::time::sleep(wait_for).await;

            resources.router_task.abort();
            for worker in resources.dealer_workers {
                worker.abort();
            }
            for task in resources.turn_tasks {
                task.abort();
            }
        }

        self.running_tx.send_replace(false);
        *self.state.write() = LifecycleState::Stopped;
        info!("transport stopped");
    }

    /// `Dispose`: cancel and join the worker-pool task; terminal state.
    pub async fn dispose(&mut self) {
        let resources = self.resources.lock().await.take();
        if let Some(resources) = resources {
            resources.lifetime_cancel.cancel();
            resources.router_task.abort();
            for worker in resources.dealer_workers {
                let _ = worker.await;
            }
            for task in resources.turn_tasks {
                task.abort();
            }
        }
        *self.state.write() = LifecycleState::Disposed;
    }

    /// `SendWithReply`: enqueue a request to `peer` and await up to
    /// `expected_replies` replies, bounded by `timeout`.
    pub async fn send_with_reply(
        &self,
        peer: BoundPeer,
        kind: MessageKind,
        body: Vec<Vec<u8>>,
        timeout: Duration,
        expected_replies: usize,
    ) -> Result<Vec<DecodedMessage>, TransportError> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.requests
            .send_with_reply(peer, kind, body, timeout, expected_replies, &CancellationToken::new())
            .await
    }

    /// `SendWithReply` variant taking a caller-supplied cancellation
    /// token: cancelling it resolves the caller with `Cancelled` without
    /// aborting an in-flight dealer send (spec.md §5).
    pub async fn send_with_reply_cancellable(
        &self,
        peer: BoundPeer,
        kind: MessageKind,
        body: Vec<Vec<u8>>,
        timeout: Duration,
        expected_replies: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<DecodedMessage>, TransportError> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.requests.send_with_reply(peer, kind, body, timeout, expected_replies, cancel).await
    }

    /// `SendMessage`: fire-and-await, 3s timeout, no replies expected.
    pub async fn send_message(
        &self,
        peer: BoundPeer,
        kind: MessageKind,
        body: Vec<Vec<u8>>,
    ) -> Result<Vec<DecodedMessage>, TransportError> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.requests.send_message(peer, kind, body).await
    }

    /// `BroadcastMessage`: fan out to every peer the routing protocol
    /// selects, excluding `except`.
    pub async fn broadcast_message(
        &self,
        except: Option<Address>,
        kind: MessageKind,
        body: Vec<Vec<u8>>,
    ) -> Result<(), TransportError> {
        self.broadcast.broadcast(except, kind, body).await
    }

    /// Seeds the routing table from `seeds`: pings each reachable seed and
    /// walks outward from it looking for this node's own address (spec.md
    /// §8 property 5, bootstrap convergence).
    pub async fn bootstrap(&self, seeds: Vec<BoundPeer>, ping_timeout: Duration, find_timeout: Duration, depth: usize) {
        self.routing.bootstrap(seeds, ping_timeout, find_timeout, depth).await;
    }

    pub fn history(&self) -> Arc<MessageHistory> {
        self.history.clone()
    }

    pub fn listen_port(&self) -> u16 {
        *self.listen_port.read()
    }

    pub fn public_host(&self) -> Option<String> {
        self.public_host.read().clone()
    }

    pub fn bound_self(&self) -> Option<BoundPeer> {
        self.public_host()
            .map(|host| BoundPeer::new(self.local_peer.clone(), host, self.listen_port()))
    }
}

/// The request-queue and broadcast-queue receivers are created alongside
/// their sender halves in `new` but only consumed once `start`/`run`
/// spawn the tasks that drain them; this holds them in the gap.
struct PendingReceivers {
    request_rx: Option<tokio::sync::mpsc::Receiver<request::MessageRequest>>,
    broadcast_rx: Option<tokio::sync::mpsc::Receiver<queue::BroadcastJob>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn config_with_host() -> TransportConfig {
        TransportConfig::default().with_host("127.0.0.1").with_workers(2)
    }

    #[tokio::test]
    async fn lifecycle_rejects_double_start() {
        let mut transport = Transport::new(config_with_host());
        transport.start().await.unwrap();
        assert_eq!(transport.state(), LifecycleState::Running);

        let result = transport.start().await;
        assert!(matches!(
            result,
            Err(TransportError::Lifecycle(LifecycleError::AlreadyRunning))
        ));

        transport.stop(StdDuration::from_millis(10)).await;
        assert_eq!(transport.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn start_without_host_or_ice_servers_fails() {
        let mut transport = Transport::new(TransportConfig::default());
        let result = transport.start().await;
        assert!(matches!(
            result,
            Err(TransportError::Lifecycle(LifecycleError::MissingEndpointSource))
        ));
    }

    #[tokio::test]
    async fn wait_for_running_resolves_after_run_is_entered() {
        let mut transport = Transport::new(config_with_host());
        transport.start().await.unwrap();

        let port = transport.listen_port();
        assert_ne!(port, 0);

        let cancel_stop = {
            let mut runner = transport;
            let handle = tokio::spawn(async move {
                runner.run().await.unwrap();
                runner
            });
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            handle
        };
        cancel_stop.abort();
    }

    #[tokio::test]
    async fn ping_pong_between_two_in_process_transports() {
        let mut a = Transport::new(TransportConfig::default().with_host("127.0.0.1").with_listen_port(0));
        a.start().await.unwrap();

        let mut b = Transport::new(TransportConfig::default().with_host("127.0.0.1").with_listen_port(0));
        b.start().await.unwrap();

        let b_peer = BoundPeer::new(b.local_peer.clone(), "127.0.0.1", b.listen_port());

        let replies = a
            .send_with_reply(b_peer, MessageKind::Ping, vec![], StdDuration::from_secs(1), 1)
            .await
            .unwrap();

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind, MessageKind::Pong);

        a.dispose().await;
        b.dispose().await;
    }

    #[tokio::test]
    async fn send_with_reply_times_out_against_an_unbound_port() {
        let mut a = Transport::new(TransportConfig::default().with_host("127.0.0.1").with_listen_port(0));
        a.start().await.unwrap();

        let dead_peer = BoundPeer::new(a.local_peer.clone(), "127.0.0.1", 1);
        let start = std::time::Instant::now();
        let result = a
            .send_with_reply(dead_peer, MessageKind::Ping, vec![], StdDuration::from_millis(200), 1)
            .await;
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(TransportError::Timeout) | Err(TransportError::Unexpected(_))));
        assert!(elapsed < StdDuration::from_millis(500));

        a.dispose().await;
    }
}

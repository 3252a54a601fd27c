//! Transport configuration (spec.md §6): a single builder-style struct,
//! validated once at the top of `Start`, in the teacher's `XxxConfig` +
//! `Default` + `with_*` idiom (`InternetTransportConfig`).

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::dealer::DEFAULT_PREDISPOSE_DELAY;
use crate::error::{LifecycleError, TransportError};
use crate::identity::IdentityKeys;
use crate::kademlia::{DEFAULT_BUCKET_SIZE, DEFAULT_TABLE_SIZE};
use crate::peer::{AppProtocolVersion, Peer};
use crate::queue::DEFAULT_BROADCAST_CONCURRENCY;
use crate::router::{DifferentVersionHandler, MessageHandler, NoopMessageHandler, DEFAULT_ROUTER_REPLY_TIMEOUT};

/// Default worker count for the dealer pool.
pub const DEFAULT_WORKERS: usize = 8;
/// Default worker count for the relay proxy (REDESIGN FLAGS, spec.md §9).
pub const DEFAULT_RELAY_PROXY_WORKERS: usize = 3;
/// Default bound on the request queue (REDESIGN FLAGS, spec.md §9).
pub const DEFAULT_REQUEST_QUEUE_CAPACITY: usize = 256;

/// Logs a different-version sighting and otherwise does nothing.
pub struct LoggingDifferentVersionHandler;

impl DifferentVersionHandler for LoggingDifferentVersionHandler {
    fn on_different_version(&self, peer: Peer) {
        info!(version = peer.app_version.version, "peer announced a different protocol version");
    }
}

pub struct TransportConfig {
    pub identity: IdentityKeys,
    pub app_version: AppProtocolVersion,
    pub trusted_signers: Vec<Vec<u8>>,
    pub table_size: usize,
    pub bucket_size: usize,
    pub workers: usize,
    pub host: Option<String>,
    pub listen_port: u16,
    pub ice_servers: Vec<String>,
    pub different_version_handler: Arc<dyn DifferentVersionHandler>,
    pub message_handler: Arc<dyn MessageHandler>,
    pub relay_proxy_workers: usize,
    pub router_reply_timeout: Duration,
    pub dealer_predispose_delay: Duration,
    pub request_queue_capacity: usize,
    pub broadcast_concurrency: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            identity: IdentityKeys::generate(),
            app_version: AppProtocolVersion::new(1, vec![], vec![], vec![]),
            trusted_signers: vec![],
            table_size: DEFAULT_TABLE_SIZE,
            bucket_size: DEFAULT_BUCKET_SIZE,
            workers: DEFAULT_WORKERS,
            host: None,
            listen_port: 0,
            ice_servers: vec![],
            different_version_handler: Arc::new(LoggingDifferentVersionHandler),
            message_handler: Arc::new(NoopMessageHandler),
            relay_proxy_workers: DEFAULT_RELAY_PROXY_WORKERS,
            router_reply_timeout: DEFAULT_ROUTER_REPLY_TIMEOUT,
            dealer_predispose_delay: DEFAULT_PREDISPOSE_DELAY,
            request_queue_capacity: DEFAULT_REQUEST_QUEUE_CAPACITY,
            broadcast_concurrency: DEFAULT_BROADCAST_CONCURRENCY,
        }
    }
}

impl TransportConfig {
    pub fn with_identity(mut self, identity: IdentityKeys) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_app_version(mut self, app_version: AppProtocolVersion) -> Self {
        self.app_version = app_version;
        self
    }

    pub fn with_trusted_signers(mut self, signers: Vec<Vec<u8>>) -> Self {
        self.trusted_signers = signers;
        self
    }

    pub fn with_table_size(mut self, table_size: usize) -> Self {
        self.table_size = table_size;
        self
    }

    pub fn with_bucket_size(mut self, bucket_size: usize) -> Self {
        self.bucket_size = bucket_size;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_listen_port(mut self, listen_port: u16) -> Self {
        self.listen_port = listen_port;
        self
    }

    pub fn with_ice_servers(mut self, ice_servers: Vec<String>) -> Self {
        self.ice_servers = ice_servers;
        self
    }

    pub fn with_different_version_handler(mut self, handler: Arc<dyn DifferentVersionHandler>) -> Self {
        self.different_version_handler = handler;
        self
    }

    pub fn with_message_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.message_handler = handler;
        self
    }

    pub fn with_relay_proxy_workers(mut self, workers: usize) -> Self {
        self.relay_proxy_workers = workers;
        self
    }

    pub fn with_router_reply_timeout(mut self, timeout: Duration) -> Self {
        self.router_reply_timeout = timeout;
        self
    }

    pub fn with_dealer_predispose_delay(mut self, delay: Duration) -> Self {
        self.dealer_predispose_delay = delay;
        self
    }

    pub fn with_request_queue_capacity(mut self, capacity: usize) -> Self {
        self.request_queue_capacity = capacity;
        self
    }

    pub fn with_broadcast_concurrency(mut self, limit: usize) -> Self {
        self.broadcast_concurrency = limit;
        self
    }

    /// Run at the top of `Start` (spec.md §6): at least one of `host` or
    /// `ice_servers` must be present, or the transport has no way to be
    /// reached.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.host.is_none() && self.ice_servers.is_empty() {
            return Err(TransportError::Lifecycle(LifecycleError::MissingEndpointSource));
        }
        Ok(())
    }
}

//! Kademlia routing protocol (spec.md §4.G).
//!
//! Only the interface the transport consumes is normative here (spec.md
//! §1 Non-goals) — this is a bucketed routing table keyed by peer address,
//! not a full DHT. The table owns its own locking discipline (spec.md §5);
//! callers never hold a lock across an `await`.

mod bucket;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::envelope::{DecodedMessage, MessageKind};
use crate::error::TransportError;
use crate::identity::Address;
use crate::peer::BoundPeer;
use bucket::Bucket;

/// Default number of buckets: one per bit of the 160-bit address space.
pub const DEFAULT_TABLE_SIZE: usize = 160;
/// Default entries (and replacement-cache slots) per bucket.
pub const DEFAULT_BUCKET_SIZE: usize = 20;

/// How `refresh_table` ages out entries, run on the 10s RefreshTable loop.
pub const REFRESH_TABLE_INTERVAL: Duration = Duration::from_secs(10);
/// How often `rebuild_connection` runs.
pub const REBUILD_CONNECTION_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// The transport-capability interface passed into the routing protocol at
/// construction, resolving the cyclic-ownership problem in spec.md §9: the
/// protocol can issue outbound requests through the transport without
/// owning it.
#[async_trait]
pub trait TransportCapability: Send + Sync {
    async fn send_with_reply(
        &self,
        peer: &BoundPeer,
        kind: MessageKind,
        body: Vec<Vec<u8>>,
        timeout: Duration,
        expected_replies: usize,
    ) -> Result<Vec<DecodedMessage>, TransportError>;
}

/// The contract the transport consumes from a routing protocol (spec.md
/// §4.G).
#[async_trait]
pub trait RoutingProtocol: Send + Sync {
    fn receive(&self, remote: &BoundPeer);
    fn peers_to_broadcast(&self, except: Option<&Address>) -> Vec<BoundPeer>;
    async fn bootstrap(
        &self,
        seeds: Vec<BoundPeer>,
        ping_timeout: Duration,
        find_timeout: Duration,
        depth: usize,
    );
    async fn ping(&self, peer: &BoundPeer, timeout: Duration) -> Result<(), TransportError>;
    async fn find_specific_peer(
        &self,
        target: Address,
        via: BoundPeer,
        depth: usize,
        search_address: Address,
        timeout: Duration,
    ) -> Option<BoundPeer>;
    async fn refresh_table(&self, max_age: Duration);
    fn check_replacement_cache(&self);
    async fn rebuild_connection(&self);
}

struct BucketEntry {
    bucket: Mutex<Bucket>,
    /// Timestamp of the oldest entry's last sighting, used by
    /// `refresh_table` to decide whether to re-PING or evict.
    last_refreshed: Mutex<std::time::Instant>,
}

/// A literal Kademlia table: `table_size` buckets, each of `bucket_size`,
/// indexed by the bit-length of the XOR distance to the local address.
pub struct KademliaTable {
    local_address: Address,
    bucket_size: usize,
    buckets: Vec<BucketEntry>,
    capability: Arc<dyn TransportCapability>,
}

impl KademliaTable {
    pub fn new(
        local_address: Address,
        table_size: usize,
        bucket_size: usize,
        capability: Arc<dyn TransportCapability>,
    ) -> Self {
        let buckets = (0..table_size)
            .map(|_| BucketEntry {
                bucket: Mutex::new(Bucket::new(bucket_size)),
                last_refreshed: Mutex::new(std::time::Instant::now()),
            })
            .collect();
        Self {
            local_address,
            bucket_size,
            buckets,
            capability,
        }
    }

    /// Bucket index for `address`: the bit-length of the XOR distance to
    /// the local address, clamped into `[0, table_size)`. Returns `None`
    /// for the local address itself.
    fn bucket_index(&self, address: &Address) -> Option<usize> {
        let mut distance = [0u8; 20];
        for i in 0..20 {
            distance[i] = self.local_address[i] ^ address[i];
        }
        if distance == [0u8; 20] {
            return None;
        }

        let mut leading_zero_bits = 0usize;
        for byte in distance.iter() {
            if *byte == 0 {
                leading_zero_bits += 8;
            } else {
                leading_zero_bits += byte.leading_zeros() as usize;
                break;
            }
        }
        let bit_length = distance.len() * 8 - leading_zero_bits;
        Some((bit_length - 1).min(self.buckets.len() - 1))
    }

    fn see(&self, peer: &BoundPeer) {
        let Ok(address) = peer.address() else {
            return;
        };
        let Some(index) = self.bucket_index(&address) else {
            return;
        };
        self.buckets[index].bucket.lock().see(peer.clone());
        *self.buckets[index].last_refreshed.lock() = std::time::Instant::now();
    }
}

#[async_trait]
impl RoutingProtocol for KademliaTable {
    fn receive(&self, remote: &BoundPeer) {
        self.see(remote);
    }

    fn peers_to_broadcast(&self, except: Option<&Address>) -> Vec<BoundPeer> {
        let mut peers = Vec::new();
        for bucket_entry in &self.buckets {
            for peer in bucket_entry.bucket.lock().entries() {
                if let Ok(address) = peer.address() {
                    if except.map(|e| e == &address).unwrap_or(false) {
                        continue;
                    }
                }
                peers.push(peer.clone());
            }
        }
        peers
    }

    async fn bootstrap(
        &self,
        seeds: Vec<BoundPeer>,
        ping_timeout: Duration,
        find_timeout: Duration,
        depth: usize,
    ) {
        for seed in seeds {
            if self.ping(&seed, ping_timeout).await.is_ok() {
                self.see(&seed);
                let _ = self
                    .find_specific_peer(
                        self.local_address,
                        seed,
                        depth,
                        self.local_address,
                        find_timeout,
                    )
                    .await;
            }
        }
    }

    async fn ping(&self, peer: &BoundPeer, timeout: Duration) -> Result<(), TransportError> {
        let replies = self
            .capability
            .send_with_reply(peer, MessageKind::Ping, vec![], timeout, 1)
            .await?;
        if replies.is_empty() {
            return Err(TransportError::Timeout);
        }
        self.see(peer);
        Ok(())
    }

    async fn find_specific_peer(
        &self,
        target: Address,
        via: BoundPeer,
        depth: usize,
        search_address: Address,
        timeout: Duration,
    ) -> Option<BoundPeer> {
        if depth == 0 {
            return None;
        }

        let body = vec![target.to_vec(), search_address.to_vec()];
        let replies = self
            .capability
            .send_with_reply(&via, MessageKind::FindNode, body, timeout, 1)
            .await
            .ok()?;

        for reply in replies {
            for frame in reply.body {
                if let Ok(candidate) = bincode::deserialize::<BoundPeer>(&frame) {
                    if candidate.address().ok()? == target {
                        self.see(&candidate);
                        return Some(candidate);
                    }
                    self.see(&candidate);
                }
            }
        }
        None
    }

    async fn refresh_table(&self, max_age: Duration) {
        for bucket_entry in &self.buckets {
            let is_stale = bucket_entry.last_refreshed.lock().elapsed() > max_age;
            if !is_stale {
                continue;
            }
            let oldest = bucket_entry.bucket.lock().oldest().cloned();
            let Some(oldest) = oldest else { continue };

            if self.ping(&oldest, Duration::from_secs(2)).await.is_err() {
                debug!(peer = %oldest.endpoint(), "evicting stale bucket entry");
                bucket_entry.bucket.lock().evict_stale_and_promote();
            }
            *bucket_entry.last_refreshed.lock() = std::time::Instant::now();
        }
    }

    fn check_replacement_cache(&self) {
        for bucket_entry in &self.buckets {
            bucket_entry.bucket.lock().promote_replacement();
        }
    }

    async fn rebuild_connection(&self) {
        let known_peers = self.peers_to_broadcast(None);
        if known_peers.is_empty() {
            warn!("rebuild_connection: routing table is empty, nothing to rebuild from");
            return;
        }
        self.bootstrap(known_peers, Duration::from_secs(2), Duration::from_secs(2), 1)
            .await;
    }
}

impl KademliaTable {
    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    pub fn table_size(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeys;
    use crate::peer::{AppProtocolVersion, Peer};

    struct NoopCapability;

    #[async_trait]
    impl TransportCapability for NoopCapability {
        async fn send_with_reply(
            &self,
            _peer: &BoundPeer,
            _kind: MessageKind,
            _body: Vec<Vec<u8>>,
            _timeout: Duration,
            _expected_replies: usize,
        ) -> Result<Vec<DecodedMessage>, TransportError> {
            Err(TransportError::Timeout)
        }
    }

    fn peer() -> BoundPeer {
        let keys = IdentityKeys::generate();
        let peer = Peer::new(keys.identity(), AppProtocolVersion::new(1, vec![], vec![], vec![]));
        BoundPeer::new(peer, "127.0.0.1", 4001)
    }

    #[test]
    fn every_peer_lands_in_exactly_one_bucket() {
        let local = [0u8; 20];
        let table = KademliaTable::new(local, 160, 20, Arc::new(NoopCapability));

        let remote = peer();
        table.receive(&remote);

        let occupied = table
            .buckets
            .iter()
            .filter(|b| b.bucket.lock().len() > 0)
            .count();
        assert_eq!(occupied, 1);
    }

    #[test]
    fn self_address_is_not_placed_in_any_bucket() {
        let keys = IdentityKeys::generate();
        let local = keys.identity().address();
        let table = KademliaTable::new(local, 160, 20, Arc::new(NoopCapability));

        let self_peer = BoundPeer::new(
            Peer::new(keys.identity(), AppProtocolVersion::new(1, vec![], vec![], vec![])),
            "127.0.0.1",
            4001,
        );
        table.receive(&self_peer);

        let occupied = table
            .buckets
            .iter()
            .filter(|b| b.bucket.lock().len() > 0)
            .count();
        assert_eq!(occupied, 0);
    }

    #[tokio::test]
    async fn broadcast_excludes_named_peer() {
        let local = [0u8; 20];
        let table = KademliaTable::new(local, 160, 20, Arc::new(NoopCapability));

        let a = peer();
        let b = peer();
        let except = a.address().unwrap();
        table.receive(&a);
        table.receive(&b);

        let fanout = table.peers_to_broadcast(Some(&except));
        assert!(fanout.iter().all(|p| p.address().unwrap() != except));
    }
}

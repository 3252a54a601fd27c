//! A single Kademlia bucket and its replacement cache (spec.md §3).

use std::collections::VecDeque;

use crate::peer::BoundPeer;

/// An ordered list of peers with recency, plus a same-sized replacement
/// cache of candidates to swap in on PING failure.
pub struct Bucket {
    entries: VecDeque<BoundPeer>,
    replacement: VecDeque<BoundPeer>,
    capacity: usize,
}

impl Bucket {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            replacement: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn contains(&self, address: &[u8; 20]) -> bool {
        self.entries
            .iter()
            .any(|p| p.address().map(|a| &a == address).unwrap_or(false))
    }

    /// Record a sighting: move an existing entry to the most-recently-seen
    /// end, or insert a new one. If the bucket is full, stash the candidate
    /// in the replacement cache instead (eviction happens on PING failure
    /// via `check_replacement_cache`, §4.G).
    pub fn see(&mut self, peer: BoundPeer) {
        let Ok(address) = peer.address() else {
            return;
        };

        if let Some(pos) = self
            .entries
            .iter()
            .position(|p| p.address().map(|a| a == address).unwrap_or(false))
        {
            self.entries.remove(pos);
            self.entries.push_back(peer);
            return;
        }

        if self.is_full() {
            if self.replacement.len() >= self.capacity {
                self.replacement.pop_front();
            }
            self.replacement.push_back(peer);
        } else {
            self.entries.push_back(peer);
        }
    }

    /// Evict the least-recently-seen entry and promote the newest
    /// replacement candidate, if any.
    pub fn evict_stale_and_promote(&mut self) -> Option<BoundPeer> {
        let evicted = self.entries.pop_front();
        if let Some(candidate) = self.replacement.pop_back() {
            self.entries.push_back(candidate);
        }
        evicted
    }

    pub fn promote_replacement(&mut self) {
        if !self.is_full() {
            if let Some(candidate) = self.replacement.pop_back() {
                self.entries.push_back(candidate);
            }
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &BoundPeer> {
        self.entries.iter()
    }

    pub fn oldest(&self) -> Option<&BoundPeer> {
        self.entries.front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeys;
    use crate::peer::{AppProtocolVersion, Peer};

    fn peer(port: u16) -> BoundPeer {
        let keys = IdentityKeys::generate();
        let peer = Peer::new(keys.identity(), AppProtocolVersion::new(1, vec![], vec![], vec![]));
        BoundPeer::new(peer, "127.0.0.1", port)
    }

    #[test]
    fn full_bucket_routes_new_sightings_to_replacement_cache() {
        let mut bucket = Bucket::new(2);
        bucket.see(peer(1));
        bucket.see(peer(2));
        assert!(bucket.is_full());

        bucket.see(peer(3));
        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket.replacement.len(), 1);
    }

    #[test]
    fn eviction_promotes_from_replacement_cache() {
        let mut bucket = Bucket::new(1);
        bucket.see(peer(1));
        bucket.see(peer(2)); // goes to replacement cache

        bucket.evict_stale_and_promote();
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket.oldest().unwrap().port, 2);
    }
}

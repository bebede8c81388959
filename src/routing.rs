//! # K-bucket routing table
//!
//! 256 LRU buckets of up to `k` peers each, indexed by the position of the
//! most significant set bit of `XOR(self, peer)` (bucket 0 = closest pair,
//! bucket 255 = farthest).
//!
//! Peer records live in an arena keyed by [`NodeId`]; buckets hold only ids.
//! This keeps peers, metrics, and liveness state in one owner with no
//! reference cycles: eviction deletes the arena entry.
//!
//! ## Eviction policy
//!
//! A full bucket accepts a new peer only by replacing one whose
//! `last_seen` is older than the staleness threshold. A bucket full of
//! live peers rejects the newcomer; long-lived peers are never evicted to
//! make room. (Kademlia's bias toward old peers: uptime predicts uptime.)
//!
//! ## Invariants
//!
//! - a peer resides only in the bucket matching its distance to self
//! - no peer appears twice; self is never inserted
//! - `bucket.len() <= k` at all times

use std::collections::HashMap;

use tracing::trace;

use crate::identity::{bucket_index, distance_cmp, now_ms, Contact, NodeId, PeerInfo, PeerState, ID_BITS};

/// Result of offering a contact to the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddPeerOutcome {
    /// New peer inserted into a bucket with room.
    Added,
    /// Peer was already known; moved to the bucket tail and refreshed.
    Refreshed,
    /// Bucket was full; a stale peer was evicted to make room.
    ReplacedStale(NodeId),
    /// Bucket full of live peers, or the contact is self. Not inserted.
    Rejected,
}

#[derive(Debug, Default)]
struct Bucket {
    /// Insertion-ordered ids, least recently seen first.
    ids: Vec<NodeId>,
    /// Milliseconds since epoch of the last mutation or refresh.
    last_updated: u64,
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    stale_after_ms: u64,
    buckets: Vec<Bucket>,
    peers: HashMap<NodeId, PeerInfo>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize, stale_after_ms: u64) -> Self {
        let mut buckets = Vec::with_capacity(ID_BITS);
        buckets.resize_with(ID_BITS, Bucket::default);
        Self {
            self_id,
            k,
            stale_after_ms,
            buckets,
            peers: HashMap::new(),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn size(&self) -> usize {
        self.peers.len()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn peer(&self, id: &NodeId) -> Option<&PeerInfo> {
        self.peers.get(id)
    }

    pub fn peer_mut(&mut self, id: &NodeId) -> Option<&mut PeerInfo> {
        self.peers.get_mut(id)
    }

    /// Offer a contact to the table.
    ///
    /// Known peers are refreshed (moved to the tail, `last_seen` updated,
    /// newer contact info adopted). Unknown peers are appended when the
    /// bucket has room, replace a stale peer when it doesn't, and are
    /// rejected when every occupant is live.
    pub fn add_peer(&mut self, contact: Contact) -> AddPeerOutcome {
        let Some(bucket_idx) = bucket_index(&self.self_id, &contact.id) else {
            return AddPeerOutcome::Rejected;
        };
        let now = now_ms();
        let stale_after = self.stale_after_ms;
        let bucket = &mut self.buckets[bucket_idx];

        if let Some(pos) = bucket.ids.iter().position(|id| *id == contact.id) {
            let id = bucket.ids.remove(pos);
            bucket.ids.push(id);
            bucket.last_updated = now;
            if let Some(info) = self.peers.get_mut(&contact.id) {
                info.contact = contact;
                info.touch();
            }
            return AddPeerOutcome::Refreshed;
        }

        if bucket.ids.len() < self.k {
            bucket.ids.push(contact.id);
            bucket.last_updated = now;
            let mut info = PeerInfo::new(contact);
            info.state = PeerState::Connected;
            self.peers.insert(info.contact.id, info);
            return AddPeerOutcome::Added;
        }

        // Full: replace the first stale occupant, preserving the relative
        // order of everyone else. Live occupants are never displaced.
        let stale_pos = bucket.ids.iter().position(|id| {
            self.peers
                .get(id)
                .map(|p| now.saturating_sub(p.last_seen) > stale_after)
                .unwrap_or(true)
        });
        match stale_pos {
            Some(pos) => {
                let evicted = bucket.ids.remove(pos);
                self.peers.remove(&evicted);
                bucket.ids.push(contact.id);
                bucket.last_updated = now;
                let mut info = PeerInfo::new(contact);
                info.state = PeerState::Connected;
                self.peers.insert(info.contact.id, info);
                trace!(bucket = bucket_idx, evicted = %evicted, "replaced stale peer");
                AddPeerOutcome::ReplacedStale(evicted)
            }
            None => AddPeerOutcome::Rejected,
        }
    }

    /// Remove a peer. Idempotent.
    pub fn remove_peer(&mut self, id: &NodeId) -> bool {
        let Some(bucket_idx) = bucket_index(&self.self_id, id) else {
            return false;
        };
        let bucket = &mut self.buckets[bucket_idx];
        if let Some(pos) = bucket.ids.iter().position(|b| b == id) {
            bucket.ids.remove(pos);
            bucket.last_updated = now_ms();
        }
        self.peers.remove(id).is_some()
    }

    /// Record a successful exchange with a known peer.
    pub fn record_success(&mut self, id: &NodeId, latency_ms: Option<f64>) {
        if let Some(info) = self.peers.get_mut(id) {
            info.touch();
            info.metrics.record_success();
            if let Some(sample) = latency_ms {
                info.metrics.record_latency(sample);
            }
        }
        // Move to the bucket tail: most recently seen last.
        if let Some(bucket_idx) = bucket_index(&self.self_id, id) {
            let bucket = &mut self.buckets[bucket_idx];
            if let Some(pos) = bucket.ids.iter().position(|b| b == id) {
                let moved = bucket.ids.remove(pos);
                bucket.ids.push(moved);
            }
        }
    }

    pub fn record_failure(&mut self, id: &NodeId) {
        if let Some(info) = self.peers.get_mut(id) {
            info.metrics.record_failure();
        }
    }

    /// The `count` peers closest to `key` by XOR distance, ascending.
    ///
    /// Buckets are walked outward from the key's home bucket; the union is
    /// sorted on raw distance, so the result is exact regardless of how the
    /// bucket partition (which is relative to self, not to `key`) slices
    /// the id space.
    pub fn get_closest(&self, key: &NodeId, count: usize) -> Vec<Contact> {
        let home = bucket_index(&self.self_id, key).unwrap_or(0);
        let mut order: Vec<usize> = Vec::with_capacity(ID_BITS);
        order.push(home);
        for step in 1..ID_BITS {
            if let Some(idx) = home.checked_sub(step) {
                order.push(idx);
            }
            if home + step < ID_BITS {
                order.push(home + step);
            }
        }

        let mut candidates: Vec<&PeerInfo> = Vec::with_capacity(self.peers.len());
        for idx in order {
            for id in &self.buckets[idx].ids {
                if let Some(info) = self.peers.get(id) {
                    candidates.push(info);
                }
            }
        }
        candidates.sort_by(|a, b| {
            let da = a.contact.id.xor_distance(key);
            let db = b.contact.id.xor_distance(key);
            distance_cmp(&da, &db)
        });
        candidates
            .into_iter()
            .take(count)
            .map(|info| info.contact.clone())
            .collect()
    }

    /// Peers whose `last_seen` is older than `threshold_ms`, flagged stale.
    /// The liveness task pings these and removes the unresponsive.
    pub fn peers_older_than(&mut self, threshold_ms: u64) -> Vec<Contact> {
        let now = now_ms();
        let mut out = Vec::new();
        for info in self.peers.values_mut() {
            if now.saturating_sub(info.last_seen) > threshold_ms {
                info.state = PeerState::Stale;
                out.push(info.contact.clone());
            }
        }
        out
    }

    /// Indices of buckets not updated within `threshold_ms`. Used by the
    /// refresh task to probe quiet regions of the id space.
    pub fn stale_bucket_indices(&self, threshold_ms: u64) -> Vec<usize> {
        let now = now_ms();
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                !b.ids.is_empty() && now.saturating_sub(b.last_updated) > threshold_ms
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.last_updated = now_ms();
        }
    }

    /// All known contacts, unordered.
    pub fn contacts(&self) -> Vec<Contact> {
        self.peers.values().map(|p| p.contact.clone()).collect()
    }

    #[cfg(test)]
    fn bucket_ids(&self, idx: usize) -> &[NodeId] {
        &self.buckets[idx].ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::random_id_for_bucket;

    const HOUR_MS: u64 = 60 * 60 * 1000;

    fn table() -> RoutingTable {
        RoutingTable::new(NodeId::from_bytes([0u8; 32]), 20, HOUR_MS)
    }

    fn contact_for_bucket(table: &RoutingTable, bucket: usize, salt: usize) -> Contact {
        // random_id_for_bucket guarantees the bucket; salt only names the addr.
        let id = random_id_for_bucket(&table.self_id(), bucket);
        Contact::single(id, format!("10.0.{bucket}.{salt}:4100"))
    }

    #[test]
    fn self_is_never_inserted() {
        let mut t = table();
        let outcome = t.add_peer(Contact::single(t.self_id(), "127.0.0.1:4100"));
        assert_eq!(outcome, AddPeerOutcome::Rejected);
        assert_eq!(t.size(), 0);
    }

    #[test]
    fn peers_land_in_their_distance_bucket() {
        let mut t = table();
        for bucket in [3usize, 100, 255] {
            let c = contact_for_bucket(&t, bucket, 0);
            assert_eq!(t.add_peer(c.clone()), AddPeerOutcome::Added);
            assert!(t.bucket_ids(bucket).contains(&c.id));
        }
        assert_eq!(t.size(), 3);
    }

    #[test]
    fn no_peer_appears_twice() {
        let mut t = table();
        let c = contact_for_bucket(&t, 200, 0);
        assert_eq!(t.add_peer(c.clone()), AddPeerOutcome::Added);
        assert_eq!(t.add_peer(c.clone()), AddPeerOutcome::Refreshed);
        assert_eq!(t.size(), 1);
        assert_eq!(t.bucket_ids(200).len(), 1);
    }

    #[test]
    fn refresh_moves_peer_to_tail() {
        let mut t = table();
        let first = contact_for_bucket(&t, 250, 0);
        let second = contact_for_bucket(&t, 250, 1);
        t.add_peer(first.clone());
        t.add_peer(second.clone());
        t.add_peer(first.clone());
        let ids = t.bucket_ids(250);
        assert_eq!(ids.last(), Some(&first.id));
    }

    #[test]
    fn full_bucket_rejects_when_all_live() {
        let mut t = table();
        for salt in 0..20 {
            assert_eq!(
                t.add_peer(contact_for_bucket(&t, 255, salt)),
                AddPeerOutcome::Added
            );
        }
        let newcomer = contact_for_bucket(&t, 255, 99);
        assert_eq!(t.add_peer(newcomer), AddPeerOutcome::Rejected);
        assert_eq!(t.bucket_ids(255).len(), 20);
    }

    #[test]
    fn full_bucket_replaces_only_the_stale_peer() {
        let mut t = table();
        let mut members = Vec::new();
        for salt in 0..20 {
            let c = contact_for_bucket(&t, 255, salt);
            t.add_peer(c.clone());
            members.push(c.id);
        }

        // Age the third member two hours into the past.
        let stale_id = members[2];
        t.peer_mut(&stale_id).unwrap().last_seen = now_ms() - 2 * HOUR_MS;

        let newcomer = contact_for_bucket(&t, 255, 99);
        assert_eq!(
            t.add_peer(newcomer.clone()),
            AddPeerOutcome::ReplacedStale(stale_id)
        );
        assert!(!t.contains(&stale_id));
        assert!(t.contains(&newcomer.id));

        // All other members remain, in their original relative order.
        let expected: Vec<NodeId> = members
            .iter()
            .filter(|id| **id != stale_id)
            .copied()
            .chain(std::iter::once(newcomer.id))
            .collect();
        assert_eq!(t.bucket_ids(255), &expected[..]);
    }

    #[test]
    fn remove_peer_is_idempotent() {
        let mut t = table();
        let c = contact_for_bucket(&t, 10, 0);
        t.add_peer(c.clone());
        assert!(t.remove_peer(&c.id));
        assert!(!t.remove_peer(&c.id));
        assert_eq!(t.size(), 0);
    }

    #[test]
    fn get_closest_sorts_by_distance_and_caps_count() {
        let mut t = table();
        for bucket in 240..=255 {
            t.add_peer(contact_for_bucket(&t, bucket, 0));
        }
        let target = random_id_for_bucket(&t.self_id(), 248);
        let closest = t.get_closest(&target, 5);
        assert_eq!(closest.len(), 5);
        for pair in closest.windows(2) {
            let da = pair[0].id.xor_distance(&target);
            let db = pair[1].id.xor_distance(&target);
            assert_ne!(distance_cmp(&da, &db), std::cmp::Ordering::Greater);
        }
    }

    #[test]
    fn get_closest_returns_everything_when_short() {
        let mut t = table();
        t.add_peer(contact_for_bucket(&t, 100, 0));
        t.add_peer(contact_for_bucket(&t, 101, 0));
        assert_eq!(t.get_closest(&NodeId::random(), 20).len(), 2);
    }

    #[test]
    fn peers_older_than_flags_stale_state() {
        let mut t = table();
        let c = contact_for_bucket(&t, 50, 0);
        t.add_peer(c.clone());
        assert!(t.peers_older_than(HOUR_MS).is_empty());

        t.peer_mut(&c.id).unwrap().last_seen = now_ms() - 2 * HOUR_MS;
        let stale = t.peers_older_than(HOUR_MS);
        assert_eq!(stale.len(), 1);
        assert_eq!(t.peer(&c.id).unwrap().state, PeerState::Stale);

        // A successful exchange returns the peer to connected.
        t.record_success(&c.id, Some(12.0));
        assert_eq!(t.peer(&c.id).unwrap().state, PeerState::Connected);
    }

    #[test]
    fn stale_buckets_are_reported_and_clearable() {
        let mut t = table();
        t.add_peer(contact_for_bucket(&t, 77, 0));
        assert!(t.stale_bucket_indices(HOUR_MS).is_empty());
        t.buckets[77].last_updated = now_ms() - 2 * HOUR_MS;
        assert_eq!(t.stale_bucket_indices(HOUR_MS), vec![77]);
        t.mark_bucket_refreshed(77);
        assert!(t.stale_bucket_indices(HOUR_MS).is_empty());
    }
}

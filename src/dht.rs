//! # Kademlia-style DHT node
//!
//! Iterative lookups over the XOR metric with replication to the k closest
//! peers. The three wire operations are `FIND_NODE`, `FIND_VALUE`, and
//! `STORE` (with `DELETE` as a tombstone store); `PING` backs liveness.
//!
//! ## Actor architecture
//!
//! [`Dht`] is a cheap-to-clone handle; `DhtActor` privately owns the
//! routing table and the local value store and processes commands
//! sequentially from an mpsc channel. Exactly one task ever mutates a
//! bucket; lookups run on the handle and touch state only through commands.
//!
//! ## Lookup algorithm
//!
//! Seed the shortlist with the k closest local contacts. While any of the
//! k current best is unqueried, query up to α of them in parallel, merge
//! returned contacts in arrival order, and re-sort by distance. Individual
//! RPC failures are counted but non-fatal; the lookup ends when the k best
//! are exhausted, the iteration cap trips, or the overall deadline passes.
//! Results are reported in XOR-distance order.
//!
//! ## Maintenance
//!
//! A periodic liveness task pings peers that have gone quiet and evicts
//! the unresponsive; buckets untouched for the refresh horizon are probed
//! with a random-id lookup. A second task republishes owned values to the
//! current k-closest set so placement follows membership.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::NodeConfig;
use crate::error::{LodestoreError, Result};
use crate::events::{EventBus, NodeEvent};
use crate::identity::{distance_cmp, now_ms, random_id_for_bucket, Contact, Key, Keypair, NodeId};
use crate::messages::{AckBody, DhtType, Message, NodesBody, ValueBody, ValueEnvelope};
use crate::routing::{AddPeerOutcome, RoutingTable};
use crate::transport::{DhtRpc, InboundRequest};

/// Hard cap on lookup rounds, independent of the time deadline.
const MAX_LOOKUP_ITERATIONS: usize = 20;

#[derive(Clone, Debug)]
struct StoredValue {
    envelope: ValueEnvelope,
    /// Owned values were written by this node and are republished.
    owned: bool,
}

/// Local key→envelope store with last-writer-wins conflict resolution.
/// Tombstones are retained so late-arriving older writes stay dead.
#[derive(Default)]
struct LocalStore {
    values: std::collections::HashMap<Key, StoredValue>,
}

impl LocalStore {
    /// Apply a write. Returns false when the incoming envelope is stale or
    /// fails signature verification.
    fn store(&mut self, key: Key, envelope: ValueEnvelope, owned: bool) -> bool {
        if !envelope.verify() {
            debug!(key = %key, "rejected envelope with bad signature");
            return false;
        }
        match self.values.get(&key) {
            Some(current) if !envelope.supersedes(&current.envelope) => false,
            _ => {
                self.values.insert(key, StoredValue { envelope, owned });
                true
            }
        }
    }

    /// Read a value. Tombstones read as absent.
    fn get(&self, key: &Key) -> Option<&ValueEnvelope> {
        self.values
            .get(key)
            .map(|v| &v.envelope)
            .filter(|env| !env.is_tombstone())
    }

    fn owned_entries(&self) -> Vec<(Key, ValueEnvelope)> {
        self.values
            .iter()
            .filter(|(_, v)| v.owned)
            .map(|(k, v)| (*k, v.envelope.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.values.len()
    }
}

enum Command {
    ObserveContact(Contact),
    RemovePeer(NodeId),
    RecordSuccess(NodeId, Option<f64>),
    RecordFailure(NodeId),
    GetClosest(Key, usize, oneshot::Sender<Vec<Contact>>),
    StoreLocal(Key, ValueEnvelope, bool, oneshot::Sender<bool>),
    GetLocal(Key, oneshot::Sender<Option<ValueEnvelope>>),
    OwnedEntries(oneshot::Sender<Vec<(Key, ValueEnvelope)>>),
    PeersOlderThan(u64, oneshot::Sender<Vec<Contact>>),
    StaleBuckets(u64, oneshot::Sender<Vec<usize>>),
    MarkBucketRefreshed(usize),
    PeerLatency(NodeId, oneshot::Sender<Option<f64>>),
    Stats(oneshot::Sender<DhtStats>),
    Quit,
}

/// Point-in-time counters for diagnostics and the CLI status line.
#[derive(Clone, Copy, Debug, Default)]
pub struct DhtStats {
    pub peers: usize,
    pub values: usize,
}

struct DhtActor {
    routing: RoutingTable,
    store: LocalStore,
    cmd_rx: mpsc::Receiver<Command>,
    events: EventBus,
}

impl DhtActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::ObserveContact(contact) => self.observe_contact(contact),
                Command::RemovePeer(id) => {
                    if self.routing.remove_peer(&id) {
                        self.events.emit(NodeEvent::PeerDisconnect { peer_id: id });
                    }
                }
                Command::RecordSuccess(id, latency) => self.routing.record_success(&id, latency),
                Command::RecordFailure(id) => self.routing.record_failure(&id),
                Command::GetClosest(key, count, tx) => {
                    let _ = tx.send(self.routing.get_closest(&key, count));
                }
                Command::StoreLocal(key, envelope, owned, tx) => {
                    let _ = tx.send(self.store.store(key, envelope, owned));
                }
                Command::GetLocal(key, tx) => {
                    let _ = tx.send(self.store.get(&key).cloned());
                }
                Command::OwnedEntries(tx) => {
                    let _ = tx.send(self.store.owned_entries());
                }
                Command::PeersOlderThan(ms, tx) => {
                    let _ = tx.send(self.routing.peers_older_than(ms));
                }
                Command::StaleBuckets(ms, tx) => {
                    let _ = tx.send(self.routing.stale_bucket_indices(ms));
                }
                Command::MarkBucketRefreshed(idx) => self.routing.mark_bucket_refreshed(idx),
                Command::PeerLatency(id, tx) => {
                    let latency = self
                        .routing
                        .peer(&id)
                        .map(|p| p.metrics.latency_ms)
                        .filter(|l| *l > 0.0);
                    let _ = tx.send(latency);
                }
                Command::Stats(tx) => {
                    let _ = tx.send(DhtStats {
                        peers: self.routing.size(),
                        values: self.store.len(),
                    });
                }
                Command::Quit => break,
            }
        }
        trace!("dht actor stopped");
    }

    fn observe_contact(&mut self, contact: Contact) {
        let id = contact.id;
        match self.routing.add_peer(contact) {
            AddPeerOutcome::Added => {
                self.events.emit(NodeEvent::PeerConnect { peer_id: id });
            }
            AddPeerOutcome::ReplacedStale(evicted) => {
                self.events
                    .emit(NodeEvent::PeerDisconnect { peer_id: evicted });
                self.events.emit(NodeEvent::PeerConnect { peer_id: id });
            }
            AddPeerOutcome::Refreshed | AddPeerOutcome::Rejected => {}
        }
    }
}

/// Public handle to the DHT node. Clones share the actor.
pub struct Dht {
    cmd_tx: mpsc::Sender<Command>,
    id: NodeId,
    self_contact: Contact,
    rpc: Arc<dyn DhtRpc>,
    keypair: Option<Arc<Keypair>>,
    config: NodeConfig,
    events: EventBus,
    /// Monotonic envelope-timestamp floor shared by all clones, so two
    /// writes from this node in the same millisecond still order.
    write_clock: Arc<AtomicU64>,
}

impl Clone for Dht {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            id: self.id,
            self_contact: self.self_contact.clone(),
            rpc: self.rpc.clone(),
            keypair: self.keypair.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            write_clock: self.write_clock.clone(),
        }
    }
}

impl Dht {
    pub fn new(
        self_contact: Contact,
        rpc: Arc<dyn DhtRpc>,
        keypair: Option<Keypair>,
        config: NodeConfig,
        events: EventBus,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(128);
        let actor = DhtActor {
            routing: RoutingTable::new(
                self_contact.id,
                config.k,
                config.stale_after.as_millis() as u64,
            ),
            store: LocalStore::default(),
            cmd_rx,
            events: events.clone(),
        };
        tokio::spawn(actor.run());

        let node = Self {
            cmd_tx,
            id: self_contact.id,
            self_contact,
            rpc,
            keypair: keypair.map(Arc::new),
            config,
            events,
            write_clock: Arc::new(AtomicU64::new(0)),
        };
        node.spawn_liveness_task();
        node.spawn_republish_task();
        node
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn contact(&self) -> Contact {
        self.self_contact.clone()
    }

    pub async fn stats(&self) -> DhtStats {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stats(tx)).await.is_err() {
            return DhtStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Feed a peer observation into the routing table.
    pub async fn observe_contact(&self, contact: Contact) {
        if contact.id == self.id {
            return;
        }
        let _ = self.cmd_tx.send(Command::ObserveContact(contact)).await;
    }

    pub async fn remove_peer(&self, id: NodeId) {
        let _ = self.cmd_tx.send(Command::RemovePeer(id)).await;
    }

    /// Smoothed RTT for a known peer, when one has been observed.
    pub async fn peer_latency(&self, id: &NodeId) -> Option<f64> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::PeerLatency(*id, tx))
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// The k closest locally-known contacts to `key`.
    pub async fn closest_local(&self, key: Key, count: usize) -> Vec<Contact> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::GetClosest(key, count, tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Join the network through a seed contact: insert it, then look up our
    /// own id so the nearby neighborhood fills in.
    pub async fn bootstrap(&self, seed: Contact) -> Result<Vec<Contact>> {
        self.observe_contact(seed.clone()).await;
        self.iterative_find_node_seeded(self.id, Some(seed)).await
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    // ------------------------------------------------------------------
    // Iterative lookups
    // ------------------------------------------------------------------

    /// Locate the k closest peers to `target` across the network.
    pub async fn iterative_find_node(&self, target: Key) -> Result<Vec<Contact>> {
        self.iterative_find_node_seeded(target, None).await
    }

    async fn iterative_find_node_seeded(
        &self,
        target: Key,
        seed: Option<Contact>,
    ) -> Result<Vec<Contact>> {
        let outcome = self.lookup(target, LookupMode::Nodes, seed).await?;
        Ok(outcome.closest)
    }

    /// Look up a value. Short-circuits on the first verified envelope and
    /// caches it at the closest peer that answered without the value.
    async fn iterative_find_value(&self, key: Key) -> Result<Option<ValueEnvelope>> {
        let outcome = self.lookup(key, LookupMode::Value, None).await?;
        if let Some(envelope) = &outcome.value {
            if let Some(cache_at) = outcome.closest_without_value {
                let rpc = self.rpc.clone();
                let envelope = envelope.clone();
                tokio::spawn(async move {
                    let _ = rpc.store(&cache_at, key, envelope).await;
                });
            }
        }
        Ok(outcome.value)
    }

    async fn lookup(
        &self,
        target: Key,
        mode: LookupMode,
        seed: Option<Contact>,
    ) -> Result<LookupOutcome> {
        let started = Instant::now();
        let deadline = self.config.lookup_timeout;
        let k = self.config.k;
        let alpha = self.config.alpha.max(1);

        let mut shortlist = self.closest_local(target, k).await;
        if let Some(seed) = seed {
            if seed.id != self.id && !shortlist.iter().any(|c| c.id == seed.id) {
                shortlist.push(seed);
            }
        }

        let mut seen: HashSet<NodeId> = shortlist.iter().map(|c| c.id).collect();
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut responded_without_value: Vec<Contact> = Vec::new();
        let mut failures = 0usize;
        let mut attempts = 0usize;

        for iteration in 0.. {
            if iteration >= MAX_LOOKUP_ITERATIONS {
                warn!(target = %target, iterations = iteration, "lookup hit iteration cap");
                break;
            }
            if started.elapsed() > deadline {
                debug!(
                    target = %target,
                    elapsed_ms = started.elapsed().as_millis(),
                    "lookup deadline passed, returning current results"
                );
                break;
            }

            // Up to alpha unqueried peers among the current k best.
            let candidates: Vec<Contact> = shortlist
                .iter()
                .take(k)
                .filter(|c| !queried.contains(&c.id) && c.id != self.id)
                .take(alpha)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            for c in &candidates {
                queried.insert(c.id);
            }
            attempts += candidates.len();

            let mut join_set = JoinSet::new();
            for contact in candidates {
                let rpc = self.rpc.clone();
                let timeout = self.config.rpc_timeout;
                join_set.spawn(async move {
                    let start = Instant::now();
                    let result = tokio::time::timeout(timeout, async {
                        match mode {
                            LookupMode::Nodes => rpc
                                .find_node(&contact, target)
                                .await
                                .map(|nodes| (None, nodes)),
                            LookupMode::Value => rpc.find_value(&contact, target).await,
                        }
                    })
                    .await
                    .unwrap_or_else(|_| {
                        Err(LodestoreError::PeerUnreachable("rpc timeout".into()))
                    });
                    (contact, start.elapsed(), result)
                });
            }

            // Merge in arrival order; distance ordering is restored by the
            // sort below.
            let mut found_value: Option<ValueEnvelope> = None;
            while let Some(joined) = join_set.join_next().await {
                let Ok((contact, elapsed, result)) = joined else {
                    continue;
                };
                match result {
                    Ok((value, nodes)) => {
                        let latency = elapsed.as_secs_f64() * 1000.0;
                        let _ = self
                            .cmd_tx
                            .send(Command::RecordSuccess(contact.id, Some(latency)))
                            .await;
                        self.observe_contact(contact.clone()).await;

                        for node in nodes {
                            if node.id == self.id {
                                continue;
                            }
                            self.observe_contact(node.clone()).await;
                            if seen.insert(node.id) {
                                shortlist.push(node);
                            }
                        }

                        match value {
                            Some(envelope) if envelope.verify() => {
                                found_value = Some(envelope);
                            }
                            Some(_) => {
                                debug!(from = %contact.id, "ignored envelope with bad signature");
                                responded_without_value.push(contact);
                            }
                            None => responded_without_value.push(contact),
                        }
                    }
                    Err(err) => {
                        failures += 1;
                        trace!(peer = %contact.id, error = %err, "lookup rpc failed");
                        let _ = self.cmd_tx.send(Command::RecordFailure(contact.id)).await;
                    }
                }
            }

            shortlist.sort_by(|a, b| {
                let da = a.id.xor_distance(&target);
                let db = b.id.xor_distance(&target);
                distance_cmp(&da, &db)
            });
            shortlist.truncate(k);

            if let Some(envelope) = found_value {
                responded_without_value.sort_by(|a, b| {
                    let da = a.id.xor_distance(&target);
                    let db = b.id.xor_distance(&target);
                    distance_cmp(&da, &db)
                });
                return Ok(LookupOutcome {
                    closest: shortlist,
                    value: Some(envelope),
                    closest_without_value: responded_without_value.into_iter().next(),
                });
            }
        }

        if attempts > 0 && failures == attempts && shortlist.is_empty() {
            // Every branch failed and nothing was learned; a bare empty
            // result would be indistinguishable from convergence.
            return Err(LodestoreError::PeerUnreachable(format!(
                "lookup for {target}: all {failures} rpcs failed"
            )));
        }

        shortlist.sort_by(|a, b| {
            let da = a.id.xor_distance(&target);
            let db = b.id.xor_distance(&target);
            distance_cmp(&da, &db)
        });
        shortlist.truncate(k);
        debug!(
            target = %target,
            found = shortlist.len(),
            queried = queried.len(),
            failures,
            "iterative lookup completed"
        );
        Ok(LookupOutcome {
            closest: shortlist,
            value: None,
            closest_without_value: None,
        })
    }

    // ------------------------------------------------------------------
    // Key/value operations
    // ------------------------------------------------------------------

    /// Strictly increasing write timestamp: wall clock, bumped past the
    /// previous write when the clock has not advanced.
    fn next_write_ts(&self) -> u64 {
        let now = now_ms();
        let mut prev = self.write_clock.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self.write_clock.compare_exchange_weak(
                prev,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(observed) => prev = observed,
            }
        }
    }

    fn make_envelope(&self, payload: JsonValue) -> ValueEnvelope {
        let ts = self.next_write_ts();
        match &self.keypair {
            Some(keypair) => ValueEnvelope::signed_at(payload, ts, keypair),
            None => ValueEnvelope {
                payload,
                ts,
                signature: None,
            },
        }
    }

    /// Store a payload under `key` at the k closest peers. Returns the
    /// number of acknowledged remote replicas (0 in a single-node network,
    /// where the local copy is the only one).
    pub async fn put(&self, key: Key, payload: JsonValue) -> Result<usize> {
        self.put_envelope(key, self.make_envelope(payload)).await
    }

    /// Delete is a tombstone store: it overrides older writes by `ts` and
    /// reads as absent everywhere it lands.
    pub async fn delete(&self, key: Key) -> Result<usize> {
        self.put_envelope(key, self.make_envelope(JsonValue::Null))
            .await
    }

    async fn put_envelope(&self, key: Key, envelope: ValueEnvelope) -> Result<usize> {
        self.store_local(key, envelope.clone(), true).await;

        let closest = self.iterative_find_node(key).await?;
        let mut join_set = JoinSet::new();
        for contact in closest.into_iter().take(self.config.k) {
            let rpc = self.rpc.clone();
            let envelope = envelope.clone();
            let timeout = self.config.rpc_timeout;
            join_set.spawn(async move {
                tokio::time::timeout(timeout, rpc.store(&contact, key, envelope))
                    .await
                    .ok()
                    .and_then(|r| r.ok())
                    .unwrap_or(false)
            });
        }
        let mut acks = 0;
        while let Some(joined) = join_set.join_next().await {
            if matches!(joined, Ok(true)) {
                acks += 1;
            }
        }
        trace!(key = %key, acks, "put completed");
        Ok(acks)
    }

    /// Fetch the payload stored under `key`, local store first.
    pub async fn get(&self, key: Key) -> Result<Option<JsonValue>> {
        if let Some(envelope) = self.get_local(key).await {
            return Ok(Some(envelope.payload));
        }
        let envelope = self.iterative_find_value(key).await?;
        Ok(envelope.filter(|e| !e.is_tombstone()).map(|e| e.payload))
    }

    /// Named-key convenience: `put` under `SHA-256(name)`.
    pub async fn put_named(&self, name: &str, payload: JsonValue) -> Result<usize> {
        self.put(Key::for_name(name), payload).await
    }

    pub async fn get_named(&self, name: &str) -> Result<Option<JsonValue>> {
        self.get(Key::for_name(name)).await
    }

    pub async fn delete_named(&self, name: &str) -> Result<usize> {
        self.delete(Key::for_name(name)).await
    }

    async fn store_local(&self, key: Key, envelope: ValueEnvelope, owned: bool) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::StoreLocal(key, envelope, owned, tx))
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    async fn get_local(&self, key: Key) -> Option<ValueEnvelope> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetLocal(key, tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    // ------------------------------------------------------------------
    // Server side
    // ------------------------------------------------------------------

    /// Handle a peer's FIND_NODE: our k closest contacts to the target.
    pub async fn handle_find_node_request(&self, from: &Contact, target: Key) -> Vec<Contact> {
        self.observe_contact(from.clone()).await;
        self.closest_local(target, self.config.k).await
    }

    /// Handle a peer's FIND_VALUE: the value when held, else closer peers.
    pub async fn handle_find_value_request(
        &self,
        from: &Contact,
        key: Key,
    ) -> (Option<ValueEnvelope>, Vec<Contact>) {
        self.observe_contact(from.clone()).await;
        match self.get_local(key).await {
            Some(envelope) => (Some(envelope), Vec::new()),
            None => (None, self.closest_local(key, self.config.k).await),
        }
    }

    /// Handle a peer's STORE or DELETE. Returns whether the write landed.
    pub async fn handle_store_request(
        &self,
        from: &Contact,
        key: Key,
        envelope: ValueEnvelope,
    ) -> bool {
        self.observe_contact(from.clone()).await;
        self.store_local(key, envelope, false).await
    }

    pub async fn handle_ping(&self, from: &Contact) {
        self.observe_contact(from.clone()).await;
    }

    /// Dispatch a validated-or-droppable inbound message. `None` means the
    /// message was dropped (replay, malformed, or unknown operation).
    pub async fn handle_message(&self, msg: Message) -> Option<Message> {
        match msg.validate(now_ms()) {
            Ok(()) => {}
            Err(LodestoreError::Replay { age_ms }) => {
                debug!(age_ms, "dropping replayed message");
                return None;
            }
            Err(err) => {
                debug!(error = %err, "dropping invalid message");
                return None;
            }
        }
        // Unknown operations are dropped silently for forward compatibility.
        let dht_type = msg.dht_type()?;
        let from = msg.payload.sender.clone();
        self.events.emit(NodeEvent::MessageReceived {
            from: from.id,
            dht_type: msg.dht_type.clone(),
        });

        let body = match dht_type {
            DhtType::Ping => {
                self.handle_ping(&from).await;
                serde_json::to_value(AckBody { acked: true }).ok()?
            }
            DhtType::FindNode => {
                let target = msg.key().ok()?;
                let nodes = self.handle_find_node_request(&from, target).await;
                serde_json::to_value(NodesBody { nodes }).ok()?
            }
            DhtType::FindValue => {
                let key = msg.key().ok()?;
                let (value, nodes) = self.handle_find_value_request(&from, key).await;
                serde_json::to_value(ValueBody { value, nodes }).ok()?
            }
            DhtType::Store | DhtType::Delete => {
                let key = msg.key().ok()?;
                let envelope = msg.payload.value.clone()?;
                let acked = self.handle_store_request(&from, key, envelope).await;
                serde_json::to_value(AckBody { acked }).ok()?
            }
        };
        Some(Message::response(&msg, self.self_contact.clone(), body))
    }

    // ------------------------------------------------------------------
    // Maintenance tasks
    // ------------------------------------------------------------------

    fn spawn_liveness_task(&self) {
        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.refresh_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                if !node.ping_quiet_peers().await {
                    break;
                }
                node.refresh_stale_buckets().await;
            }
        });
    }

    /// Ping peers unseen past the refresh horizon; evict the unresponsive.
    /// Returns false when the actor has shut down.
    async fn ping_quiet_peers(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        let threshold = self.config.refresh_after.as_millis() as u64;
        if self
            .cmd_tx
            .send(Command::PeersOlderThan(threshold, tx))
            .await
            .is_err()
        {
            return false;
        }
        let Ok(quiet) = rx.await else { return false };

        let mut join_set = JoinSet::new();
        for contact in quiet {
            let rpc = self.rpc.clone();
            let timeout = self.config.rpc_timeout;
            join_set.spawn(async move {
                let alive = tokio::time::timeout(timeout, rpc.ping(&contact))
                    .await
                    .map(|r| r.is_ok())
                    .unwrap_or(false);
                (contact, alive)
            });
        }
        while let Some(joined) = join_set.join_next().await {
            let Ok((contact, alive)) = joined else { continue };
            if alive {
                let _ = self
                    .cmd_tx
                    .send(Command::RecordSuccess(contact.id, None))
                    .await;
            } else {
                debug!(peer = %contact.id, "evicting unresponsive peer");
                let _ = self.cmd_tx.send(Command::RemovePeer(contact.id)).await;
            }
        }
        true
    }

    /// Probe buckets that have gone quiet with a random-id lookup so the
    /// table keeps coverage of the whole id space.
    async fn refresh_stale_buckets(&self) {
        let (tx, rx) = oneshot::channel();
        let threshold = self.config.refresh_after.as_millis() as u64;
        if self
            .cmd_tx
            .send(Command::StaleBuckets(threshold, tx))
            .await
            .is_err()
        {
            return;
        }
        let Ok(stale) = rx.await else { return };
        for bucket_idx in stale {
            let target = random_id_for_bucket(&self.id, bucket_idx);
            if let Err(err) = self.iterative_find_node(target).await {
                debug!(bucket = bucket_idx, error = %err, "bucket refresh lookup failed");
            }
            let _ = self
                .cmd_tx
                .send(Command::MarkBucketRefreshed(bucket_idx))
                .await;
        }
    }

    fn spawn_republish_task(&self) {
        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.republish_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let (tx, rx) = oneshot::channel();
                if node.cmd_tx.send(Command::OwnedEntries(tx)).await.is_err() {
                    break;
                }
                let Ok(entries) = rx.await else { break };
                for (key, envelope) in entries {
                    // Placement follows membership: re-store at whoever is
                    // closest now, not whoever was closest at write time.
                    if let Err(err) = node.put_envelope(key, envelope).await {
                        debug!(key = %key, error = %err, "republish failed");
                    }
                }
            }
        });
    }
}

/// Serve inbound transport requests against a DHT node until the stream
/// closes. One task per node; responses preserve request ids.
pub fn spawn_message_server(dht: Dht, mut incoming: mpsc::Receiver<InboundRequest>) {
    tokio::spawn(async move {
        while let Some(request) = incoming.recv().await {
            let dht = dht.clone();
            tokio::spawn(async move {
                if let Some(response) = dht.handle_message(request.message).await {
                    let _ = request.reply.send(response);
                }
            });
        }
    });
}

#[derive(Clone, Copy)]
enum LookupMode {
    Nodes,
    Value,
}

struct LookupOutcome {
    closest: Vec<Contact>,
    value: Option<ValueEnvelope>,
    /// For cache-on-hit: the closest peer that answered without the value.
    closest_without_value: Option<Contact>,
}

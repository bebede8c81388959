//! # Transport seam
//!
//! The core never talks to sockets directly. Two traits cover everything it
//! needs from the outside world:
//!
//! - [`Transport`]: request/response delivery of framed [`Message`]s to an
//!   addressed peer, plus `dial` and `close`
//! - [`ChunkTransfer`]: bulk chunk bytes moving between peers; the DHT only
//!   carries locators, never chunk payloads
//!
//! [`DhtRpc`] sits one level up: typed DHT operations (`find_node`,
//! `find_value`, `store`, `ping`) expressed over any `Transport` by
//! [`WireClient`]. The DHT node depends on `DhtRpc`, so tests can drive it
//! with a scripted fake without any wire codec involved.
//!
//! [`MemoryTransport`] is the in-process adapter: a shared [`MemoryHub`]
//! routes messages and chunk bytes between registered peers with injectable
//! latency, drop rates, and offline flags. Simulations and the test suite
//! run entire networks on it; production deployments plug a real socket
//! transport into the same traits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::error::{LodestoreError, Result};
use crate::events::{EventBus, NodeEvent};
use crate::identity::{Contact, Key, NodeId};
use crate::messages::{response_body, AckBody, Message, NodesBody, ValueBody, ValueEnvelope};

/// An inbound request paired with its reply slot. The serving loop answers
/// by sending exactly one response message.
pub struct InboundRequest {
    pub message: Message,
    pub reply: oneshot::Sender<Message>,
}

/// Framed message delivery to addressed peers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a request and wait for the peer's response.
    async fn send(&self, to: &Contact, msg: Message) -> Result<Message>;

    /// Resolve an address into a contact (reachability probe included).
    async fn dial(&self, addr: &str) -> Result<Contact>;

    /// Take the inbound request stream. Yields `Some` exactly once.
    fn take_incoming(&self) -> Option<mpsc::Receiver<InboundRequest>>;

    /// Stop accepting traffic and release resources.
    async fn close(&self);
}

/// Bulk chunk movement between peers. Kept apart from [`Transport`] so the
/// message path never carries megabyte payloads.
#[async_trait]
pub trait ChunkTransfer: Send + Sync + 'static {
    async fn push_chunk(&self, to: &Contact, checksum: &str, bytes: &[u8]) -> Result<()>;
    async fn pull_chunk(&self, from: &Contact, checksum: &str) -> Result<Vec<u8>>;
}

/// Typed DHT operations against a single remote peer.
#[async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    /// Ask a peer for the k closest contacts to `target` it knows.
    async fn find_node(&self, to: &Contact, target: Key) -> Result<Vec<Contact>>;

    /// Ask a peer for a value; it answers with the value and/or closer peers.
    async fn find_value(&self, to: &Contact, key: Key)
        -> Result<(Option<ValueEnvelope>, Vec<Contact>)>;

    /// Store an envelope on a peer. `Ok(true)` means acknowledged.
    async fn store(&self, to: &Contact, key: Key, value: ValueEnvelope) -> Result<bool>;

    /// Ping a peer to check liveness.
    async fn ping(&self, to: &Contact) -> Result<()>;
}

/// [`DhtRpc`] over any [`Transport`]: builds wire messages, validates
/// responses, decodes typed bodies.
pub struct WireClient {
    transport: Arc<dyn Transport>,
    self_contact: Contact,
    events: EventBus,
}

impl WireClient {
    pub fn new(transport: Arc<dyn Transport>, self_contact: Contact, events: EventBus) -> Self {
        Self {
            transport,
            self_contact,
            events,
        }
    }

    async fn request(&self, to: &Contact, msg: Message) -> Result<Message> {
        self.events.emit(NodeEvent::MessageSent {
            to: to.id,
            dht_type: msg.dht_type.clone(),
        });
        let response = self.transport.send(to, msg).await?;
        response.validate(crate::identity::now_ms())?;
        Ok(response)
    }
}

#[async_trait]
impl DhtRpc for WireClient {
    async fn find_node(&self, to: &Contact, target: Key) -> Result<Vec<Contact>> {
        let msg = Message::find_node(self.self_contact.clone(), to.id, target);
        let response = self.request(to, msg).await?;
        let body: NodesBody = response_body(&response);
        Ok(body.nodes)
    }

    async fn find_value(
        &self,
        to: &Contact,
        key: Key,
    ) -> Result<(Option<ValueEnvelope>, Vec<Contact>)> {
        let msg = Message::find_value(self.self_contact.clone(), to.id, key);
        let response = self.request(to, msg).await?;
        let body: ValueBody = response_body(&response);
        Ok((body.value, body.nodes))
    }

    async fn store(&self, to: &Contact, key: Key, value: ValueEnvelope) -> Result<bool> {
        let msg = if value.is_tombstone() {
            Message::delete(self.self_contact.clone(), to.id, key, value)
        } else {
            Message::store(self.self_contact.clone(), to.id, key, value)
        };
        let response = self.request(to, msg).await?;
        let body: AckBody = serde_json::from_value(
            response
                .payload
                .data
                .clone()
                .unwrap_or(serde_json::Value::Null),
        )
        .unwrap_or(AckBody { acked: false });
        Ok(body.acked)
    }

    async fn ping(&self, to: &Contact) -> Result<()> {
        let msg = Message::ping(self.self_contact.clone(), to.id);
        self.request(to, msg).await.map(|_| ())
    }
}

/// Connection attempts per endpoint before moving to the next one.
pub const MAX_DIAL_RETRIES: u32 = 3;

/// Dial a peer through its advertised endpoints in priority order, retrying
/// each up to [`MAX_DIAL_RETRIES`] times with exponential backoff.
pub async fn dial_with_backoff(
    transport: &Arc<dyn Transport>,
    addrs: &[String],
    base_delay: Duration,
) -> Result<Contact> {
    let mut last_error = LodestoreError::PeerUnreachable("no endpoints to dial".into());
    for addr in addrs {
        let mut delay = base_delay;
        for attempt in 1..=MAX_DIAL_RETRIES {
            match transport.dial(addr).await {
                Ok(contact) => return Ok(contact),
                Err(err) => {
                    trace!(addr = %addr, attempt, error = %err, "dial attempt failed");
                    last_error = err;
                    if attempt < MAX_DIAL_RETRIES {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
    }
    Err(last_error)
}

// ============================================================================
// In-memory transport
// ============================================================================

struct PeerSlot {
    contact: Contact,
    inbound: mpsc::Sender<InboundRequest>,
    /// Chunk shelf: what this peer is holding for others.
    shelf: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    latency: Duration,
    drop_rate: f64,
    offline: bool,
}

/// Routing fabric shared by every [`MemoryTransport`] in one process.
/// Fault injection (latency, drops, offline peers) applies per peer.
#[derive(Default)]
pub struct MemoryHub {
    slots: Mutex<HashMap<NodeId, PeerSlot>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a peer and hand back its transport endpoint.
    pub fn register(self: &Arc<Self>, contact: Contact) -> MemoryTransport {
        let (tx, rx) = mpsc::channel(256);
        let shelf = Arc::new(Mutex::new(HashMap::new()));
        let slot = PeerSlot {
            contact: contact.clone(),
            inbound: tx,
            shelf: shelf.clone(),
            latency: Duration::ZERO,
            drop_rate: 0.0,
            offline: false,
        };
        self.lock().insert(contact.id, slot);
        MemoryTransport {
            hub: self.clone(),
            local: contact,
            incoming: Mutex::new(Some(rx)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<NodeId, PeerSlot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Simulate a peer death: requests fail, the shelf disappears.
    pub fn remove(&self, id: &NodeId) {
        self.lock().remove(id);
    }

    pub fn set_latency(&self, id: &NodeId, latency: Duration) {
        if let Some(slot) = self.lock().get_mut(id) {
            slot.latency = latency;
        }
    }

    /// Fraction of requests to this peer that vanish (uniform random).
    pub fn set_drop_rate(&self, id: &NodeId, rate: f64) {
        if let Some(slot) = self.lock().get_mut(id) {
            slot.drop_rate = rate.clamp(0.0, 1.0);
        }
    }

    pub fn set_offline(&self, id: &NodeId, offline: bool) {
        if let Some(slot) = self.lock().get_mut(id) {
            slot.offline = offline;
        }
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.lock().values().map(|s| s.contact.clone()).collect()
    }

    /// Admission check + parameters for one delivery attempt.
    fn delivery(&self, to: &NodeId) -> Result<(mpsc::Sender<InboundRequest>, Duration)> {
        let slots = self.lock();
        let slot = slots
            .get(to)
            .ok_or_else(|| LodestoreError::PeerUnreachable(format!("{to} not registered")))?;
        if slot.offline {
            return Err(LodestoreError::PeerUnreachable(format!("{to} offline")));
        }
        if slot.drop_rate > 0.0 && rand::random::<f64>() < slot.drop_rate {
            return Err(LodestoreError::PeerUnreachable(format!("{to} dropped request")));
        }
        Ok((slot.inbound.clone(), slot.latency))
    }

    fn shelf(&self, id: &NodeId) -> Result<Arc<Mutex<HashMap<String, Vec<u8>>>>> {
        let slots = self.lock();
        let slot = slots
            .get(id)
            .ok_or_else(|| LodestoreError::PeerUnreachable(format!("{id} not registered")))?;
        if slot.offline {
            return Err(LodestoreError::PeerUnreachable(format!("{id} offline")));
        }
        Ok(slot.shelf.clone())
    }
}

/// One peer's endpoint on a [`MemoryHub`].
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    local: Contact,
    incoming: Mutex<Option<mpsc::Receiver<InboundRequest>>>,
}

impl MemoryTransport {
    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }

    pub fn local_contact(&self) -> &Contact {
        &self.local
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, to: &Contact, msg: Message) -> Result<Message> {
        let (inbound, latency) = self.hub.delivery(&to.id)?;
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }
        trace!(to = %to.id, dht_type = %msg.dht_type, "memory transport delivering");
        let (reply_tx, reply_rx) = oneshot::channel();
        inbound
            .send(InboundRequest {
                message: msg,
                reply: reply_tx,
            })
            .await
            .map_err(|_| LodestoreError::PeerUnreachable(format!("{} closed", to.id)))?;
        reply_rx
            .await
            .map_err(|_| LodestoreError::PeerUnreachable(format!("{} dropped reply", to.id)))
    }

    async fn dial(&self, addr: &str) -> Result<Contact> {
        self.hub
            .lock()
            .values()
            .find(|slot| !slot.offline && slot.contact.addrs.iter().any(|a| a == addr))
            .map(|slot| slot.contact.clone())
            .ok_or_else(|| LodestoreError::PeerUnreachable(format!("no peer at {addr}")))
    }

    fn take_incoming(&self) -> Option<mpsc::Receiver<InboundRequest>> {
        self.incoming
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    async fn close(&self) {
        self.hub.remove(&self.local.id);
    }
}

#[async_trait]
impl ChunkTransfer for MemoryTransport {
    async fn push_chunk(&self, to: &Contact, checksum: &str, bytes: &[u8]) -> Result<()> {
        let shelf = self.hub.shelf(&to.id)?;
        shelf
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(checksum.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn pull_chunk(&self, from: &Contact, checksum: &str) -> Result<Vec<u8>> {
        let shelf = self.hub.shelf(&from.id)?;
        let guard = shelf.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .get(checksum)
            .cloned()
            .ok_or_else(|| LodestoreError::NotFound(format!("chunk {checksum} on {}", from.id)))
    }
}

//! # Wire protocol
//!
//! JSON-framed messages exchanged between DHT peers, protocol `"dht"`
//! version `"1.0.0"`. Every message is an envelope:
//!
//! ```json
//! {
//!   "type": "query" | "response" | "update" | "announce",
//!   "dht_type": "FIND_NODE" | "FIND_VALUE" | "STORE" | "DELETE" | "PING",
//!   "protocol": "dht",
//!   "version": "1.0.0",
//!   "payload": { "id", "timestamp", "sender", "receiver"?, "key"?, "value"?, "data"? }
//! }
//! ```
//!
//! ## Validation
//!
//! A message is rejected when `dht_type` or `sender` is missing, when a
//! present `key` is not 64 hex characters, or when its timestamp falls
//! outside the ±5 minute replay window. Unknown `dht_type` values survive
//! deserialization (the field stays a string) and are dropped silently by
//! receivers, so new message types can be added without breaking old nodes.
//!
//! ## Value envelopes
//!
//! DHT values are UTF-8 JSON envelopes `{payload, ts, signature?}` with
//! last-writer-wins ordering by `ts`. A null payload is a tombstone: it
//! overrides earlier writes and reads as absent.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{LodestoreError, Result};
use crate::identity::{now_ms, verify_signature, Contact, Key, Keypair, NodeId};

/// Protocol identifier carried in every message.
pub const PROTOCOL: &str = "dht";

/// Wire protocol version. Minor additions (new `dht_type`) must stay
/// backward compatible; receivers drop unknown types.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Replay window: messages timestamped more than this far from local time
/// (either direction) are dropped.
pub const REPLAY_WINDOW_MS: u64 = 5 * 60 * 1000;

/// Top-level message classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Query,
    Response,
    Update,
    Announce,
}

/// Known DHT operations. The wire field is a free-form string; parsing to
/// this enum is a separate, fallible step so unknown operations pass
/// through deserialization and can be dropped rather than erroring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DhtType {
    FindNode,
    FindValue,
    Store,
    Delete,
    Ping,
}

impl DhtType {
    pub fn as_wire(&self) -> &'static str {
        match self {
            DhtType::FindNode => "FIND_NODE",
            DhtType::FindValue => "FIND_VALUE",
            DhtType::Store => "STORE",
            DhtType::Delete => "DELETE",
            DhtType::Ping => "PING",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "FIND_NODE" => Some(DhtType::FindNode),
            "FIND_VALUE" => Some(DhtType::FindValue),
            "STORE" => Some(DhtType::Store),
            "DELETE" => Some(DhtType::Delete),
            "PING" => Some(DhtType::Ping),
            _ => None,
        }
    }

    /// The message kind this operation travels under: lookups and pings are
    /// queries, writes are updates.
    pub fn kind(&self) -> MessageKind {
        match self {
            DhtType::FindNode | DhtType::FindValue | DhtType::Ping => MessageKind::Query,
            DhtType::Store | DhtType::Delete => MessageKind::Update,
        }
    }
}

/// Message payload. `sender` carries the full contact so receivers can
/// refresh their routing table from any exchange.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Payload {
    pub id: String,
    pub timestamp: u64,
    pub sender: Contact,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ValueEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub dht_type: String,
    pub protocol: String,
    pub version: String,
    pub payload: Payload,
}

fn random_message_id() -> String {
    let mut bytes = [0u8; 16];
    if getrandom::getrandom(&mut bytes).is_err() {
        bytes[..8].copy_from_slice(&now_ms().to_be_bytes());
    }
    hex::encode(bytes)
}

impl Message {
    fn request(dht_type: DhtType, sender: Contact, receiver: Option<NodeId>) -> Self {
        Self {
            kind: dht_type.kind(),
            dht_type: dht_type.as_wire().to_string(),
            protocol: PROTOCOL.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            payload: Payload {
                id: random_message_id(),
                timestamp: now_ms(),
                sender,
                receiver,
                key: None,
                value: None,
                data: None,
            },
        }
    }

    pub fn find_node(sender: Contact, receiver: NodeId, target: Key) -> Self {
        let mut msg = Self::request(DhtType::FindNode, sender, Some(receiver));
        msg.payload.key = Some(target.to_hex());
        msg
    }

    pub fn find_value(sender: Contact, receiver: NodeId, key: Key) -> Self {
        let mut msg = Self::request(DhtType::FindValue, sender, Some(receiver));
        msg.payload.key = Some(key.to_hex());
        msg
    }

    pub fn store(sender: Contact, receiver: NodeId, key: Key, value: ValueEnvelope) -> Self {
        let mut msg = Self::request(DhtType::Store, sender, Some(receiver));
        msg.payload.key = Some(key.to_hex());
        msg.payload.value = Some(value);
        msg
    }

    /// DELETE is a STORE of a tombstone under its own operation name; the
    /// envelope timestamp decides whether it overrides the current value.
    pub fn delete(sender: Contact, receiver: NodeId, key: Key, tombstone: ValueEnvelope) -> Self {
        let mut msg = Self::request(DhtType::Delete, sender, Some(receiver));
        msg.payload.key = Some(key.to_hex());
        msg.payload.value = Some(tombstone);
        msg
    }

    pub fn ping(sender: Contact, receiver: NodeId) -> Self {
        Self::request(DhtType::Ping, sender, Some(receiver))
    }

    /// Build a response carrying the originating request id.
    pub fn response(request: &Message, sender: Contact, data: JsonValue) -> Self {
        Self {
            kind: MessageKind::Response,
            dht_type: request.dht_type.clone(),
            protocol: PROTOCOL.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            payload: Payload {
                id: request.payload.id.clone(),
                timestamp: now_ms(),
                sender,
                receiver: Some(request.payload.sender.id),
                key: request.payload.key.clone(),
                value: None,
                data: Some(data),
            },
        }
    }

    /// Parse the operation, if it is one this node understands.
    pub fn dht_type(&self) -> Option<DhtType> {
        DhtType::from_wire(&self.dht_type)
    }

    /// Structural and freshness validation. Does not interpret the
    /// operation; unknown `dht_type` strings pass (the receiver drops them
    /// after parsing returns `None`).
    pub fn validate(&self, now: u64) -> Result<()> {
        if self.dht_type.is_empty() {
            return Err(LodestoreError::InvalidMessage("missing dht_type".into()));
        }
        if self.protocol != PROTOCOL {
            return Err(LodestoreError::InvalidMessage(format!(
                "unexpected protocol {:?}",
                self.protocol
            )));
        }
        if self.payload.sender.id.as_bytes() == &[0u8; 32] {
            return Err(LodestoreError::InvalidMessage("missing sender".into()));
        }
        if let Some(key) = &self.payload.key {
            if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(LodestoreError::InvalidMessage(format!(
                    "key must be 64 hex chars, got {} chars",
                    key.len()
                )));
            }
        }
        let age = now as i64 - self.payload.timestamp as i64;
        if age.unsigned_abs() > REPLAY_WINDOW_MS {
            return Err(LodestoreError::Replay { age_ms: age });
        }
        Ok(())
    }

    /// The payload key parsed into the id space. Callers validate first.
    pub fn key(&self) -> Result<Key> {
        let raw = self
            .payload
            .key
            .as_deref()
            .ok_or_else(|| LodestoreError::InvalidMessage("missing key".into()))?;
        Key::from_hex(raw)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ============================================================================
// Response bodies
// ============================================================================

/// FIND_NODE response: the k closest contacts the responder knows.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodesBody {
    pub nodes: Vec<Contact>,
}

/// FIND_VALUE response: the value when held, otherwise closer contacts.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ValueBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ValueEnvelope>,
    #[serde(default)]
    pub nodes: Vec<Contact>,
}

/// STORE / DELETE / PING acknowledgement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AckBody {
    pub acked: bool,
}

/// Decode a typed body out of a response's `data` field.
pub fn response_body<T: serde::de::DeserializeOwned + Default>(msg: &Message) -> T {
    msg.payload
        .data
        .as_ref()
        .and_then(|data| serde_json::from_value(data.clone()).ok())
        .unwrap_or_default()
}

// ============================================================================
// Value envelopes
// ============================================================================

/// Signature block on a value envelope: the writer's ed25519 public key and
/// a signature over `canonical(payload) || ts`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeSignature {
    pub signer: String,
    pub sig: String,
}

/// DHT value envelope, serialised as UTF-8 JSON.
///
/// Readers resolve conflicts last-writer-wins by `ts`. Signatures are
/// optional: the network's integrity guarantee is content addressing, and
/// unsigned writes interoperate with peers that never configured a keypair.
/// When a signature is present it must verify, so a holder cannot silently
/// swap a signed record's payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueEnvelope {
    pub payload: JsonValue,
    pub ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<EnvelopeSignature>,
}

impl ValueEnvelope {
    pub fn new(payload: JsonValue) -> Self {
        Self {
            payload,
            ts: now_ms(),
            signature: None,
        }
    }

    /// A tombstone overrides earlier writes and reads as absent.
    pub fn tombstone() -> Self {
        Self::new(JsonValue::Null)
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload.is_null()
    }

    fn signable_bytes(&self) -> Vec<u8> {
        let mut bytes = serde_json::to_vec(&self.payload).unwrap_or_default();
        bytes.extend_from_slice(&self.ts.to_be_bytes());
        bytes
    }

    pub fn signed(payload: JsonValue, keypair: &Keypair) -> Self {
        Self::signed_at(payload, now_ms(), keypair)
    }

    /// Sign with an explicit timestamp. The DHT node uses this with its
    /// monotonic write clock so consecutive writes never tie on `ts`.
    pub fn signed_at(payload: JsonValue, ts: u64, keypair: &Keypair) -> Self {
        let mut envelope = Self {
            payload,
            ts,
            signature: None,
        };
        let sig = keypair.sign(&envelope.signable_bytes());
        envelope.signature = Some(EnvelopeSignature {
            signer: hex::encode(keypair.public_key_bytes()),
            sig: hex::encode(sig.to_bytes()),
        });
        envelope
    }

    /// True when the envelope is unsigned, or signed and the signature
    /// verifies. Envelopes with broken signatures are ignored by readers.
    pub fn verify(&self) -> bool {
        let Some(block) = &self.signature else {
            return true;
        };
        let Ok(signer_bytes) = hex::decode(&block.signer) else {
            return false;
        };
        let signer: [u8; 32] = match signer_bytes.try_into() {
            Ok(arr) => arr,
            Err(_) => return false,
        };
        let Ok(sig_bytes) = hex::decode(&block.sig) else {
            return false;
        };
        verify_signature(&signer, &self.signable_bytes(), &sig_bytes)
    }

    /// Last-writer-wins: strictly newer timestamps replace the current
    /// value; ties keep what is already stored.
    pub fn supersedes(&self, current: &ValueEnvelope) -> bool {
        self.ts > current.ts
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

//! # Node identity and the XOR metric
//!
//! This module defines the identifier types shared by routing and storage:
//!
//! - [`NodeId`]: 256-bit identifier for both nodes and DHT keys
//! - [`Contact`]: wire-visible peer descriptor (id, addresses, capabilities)
//! - [`PeerInfo`]: arena entry owned by the routing table (contact + liveness
//!   state + observed metrics)
//! - [`Keypair`]: optional ed25519 keystore for signing value envelopes
//!
//! ## Identity model
//!
//! A node id is 32 random bytes, generated at first start and persisted under
//! `<root>/identity.json`. DHT keys live in the same 256-bit space and are
//! derived by SHA-256 over a logical name (`"metadata:" || artifact_id`,
//! `"chunk:" || checksum`, ...), so "closest-k" means the same thing for
//! routing and for replica placement.
//!
//! ## Invariants
//!
//! - `NodeId::from_hex(id.to_hex()) == id` (round-trip preservation)
//! - XOR distance is symmetric; `distance_cmp` orders lexicographically on
//!   the big-endian 32-byte distance
//! - Every routing decision uses raw bytes; the hex form is wire-only

use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::{LodestoreError, Result};

/// Number of k-buckets / bits in an identifier.
pub const ID_BITS: usize = 256;

/// Returns current time as milliseconds since Unix epoch.
/// Used for timestamps in wire messages and value envelopes.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// 256-bit identifier for nodes and DHT keys.
///
/// Rendered as a fixed 64-character lowercase hex string on the wire;
/// internally always the raw 32 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 32]);

/// DHT keys share the identifier space with node ids.
pub type Key = NodeId;

impl NodeId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        // OsRng failure leaves a time-derived pattern; ids only need to be
        // unique, not secret.
        if getrandom::getrandom(&mut bytes).is_err() {
            let seed = now_ms().to_be_bytes();
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = seed[i % 8].wrapping_mul(i as u8 | 1);
            }
        }
        Self(bytes)
    }

    /// Derive a key from a logical name by hashing it into the id space.
    ///
    /// All DHT namespaces (`metadata:`, `chunk:`, `content:`, `index:...`)
    /// go through this, so replica placement and routing agree on distance.
    pub fn for_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn xor_distance(&self, other: &NodeId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 64-character hex string. Uppercase input is accepted
    /// and normalised; anything else is rejected.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| LodestoreError::InvalidMessage(format!("bad id hex: {e}")))?;
        if bytes.len() != 32 {
            return Err(LodestoreError::InvalidMessage(format!(
                "id must be 64 hex chars, got {}",
                s.len()
            )));
        }
        let mut id = [0u8; 32];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({}..)", &self.to_hex()[..8])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Lexicographic comparison of two XOR distances (big-endian).
///
/// ```ignore
/// let da = target.xor_distance(&a);
/// let db = target.xor_distance(&b);
/// if distance_cmp(&da, &db) == Ordering::Less { /* a is closer */ }
/// ```
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    for i in 0..32 {
        if a[i] != b[i] {
            return a[i].cmp(&b[i]);
        }
    }
    std::cmp::Ordering::Equal
}

/// Bucket index for a pair of distinct identifiers.
///
/// Index of the most significant set bit of the XOR distance, numbering
/// bits from the least significant end: bucket 0 holds the closest possible
/// pair (distance 1), bucket 255 the farthest (top bit differs). Returns
/// `None` for identical ids; self is never bucketed.
pub fn bucket_index(a: &NodeId, b: &NodeId) -> Option<usize> {
    let dist = a.xor_distance(b);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            let leading = byte.leading_zeros() as usize;
            return Some(ID_BITS - 1 - (byte_idx * 8 + leading));
        }
    }
    None
}

/// Generate a random id whose distance from `self_id` lands in `bucket_idx`.
/// Used by bucket refresh to probe under-populated regions of the id space.
pub fn random_id_for_bucket(self_id: &NodeId, bucket_idx: usize) -> NodeId {
    debug_assert!(bucket_idx < ID_BITS);
    let mut distance = [0u8; 32];
    if getrandom::getrandom(&mut distance).is_err() {
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = (bucket_idx.wrapping_mul(i + 1)) as u8;
        }
    }

    // The distance's most significant set bit must sit at `bucket_idx`
    // counted from the LSB: zero everything above it, force the bit itself.
    let msb_from_top = ID_BITS - 1 - bucket_idx;
    let byte_idx = msb_from_top / 8;
    let bit_pos = msb_from_top % 8;

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }
    let target_bit = 0x80u8 >> bit_pos;
    let below_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & below_mask);

    let self_bytes = self_id.as_bytes();
    let mut target = [0u8; 32];
    for i in 0..32 {
        target[i] = self_bytes[i] ^ distance[i];
    }
    NodeId::from_bytes(target)
}

// ============================================================================
// Peer records
// ============================================================================

/// Coarse peer classification advertised in contacts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    Global,
    Regional,
    Local,
    #[default]
    Unknown,
}

/// Wire-visible peer descriptor. The static part of a peer record: what a
/// node advertises about itself, carried inside FIND_NODE responses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    #[serde(default)]
    pub addrs: Vec<String>,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub kind: PeerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Contact {
    pub fn new(id: NodeId, addrs: Vec<String>) -> Self {
        Self {
            id,
            addrs,
            protocols: vec!["dht".to_string()],
            kind: PeerKind::Unknown,
            region: None,
            version: None,
            capabilities: Vec::new(),
        }
    }

    pub fn single(id: NodeId, addr: impl Into<String>) -> Self {
        Self::new(id, vec![addr.into()])
    }

    pub fn primary_addr(&self) -> Option<&str> {
        self.addrs.first().map(|s| s.as_str())
    }
}

/// Storage capacity advertised by a peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageSpace {
    pub total: u64,
    pub used: u64,
    pub available: u64,
}

/// Observed transfer quality for a peer. Updated on every successful
/// exchange; reliability decays toward 0 on failures.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PeerMetrics {
    pub latency_ms: f64,
    pub bandwidth_bps: f64,
    pub reliability: f64,
    pub storage: StorageSpace,
}

impl Default for PeerMetrics {
    fn default() -> Self {
        Self {
            latency_ms: 0.0,
            bandwidth_bps: 0.0,
            reliability: 1.0,
            storage: StorageSpace::default(),
        }
    }
}

impl PeerMetrics {
    /// Exponential moving average over RTT samples.
    pub fn record_latency(&mut self, sample_ms: f64) {
        if self.latency_ms == 0.0 {
            self.latency_ms = sample_ms;
        } else {
            self.latency_ms = self.latency_ms * 0.8 + sample_ms * 0.2;
        }
    }

    pub fn record_success(&mut self) {
        self.reliability = (self.reliability * 0.9 + 0.1).min(1.0);
    }

    pub fn record_failure(&mut self) {
        self.reliability *= 0.9;
    }
}

/// Liveness state of a known peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    Unknown,
    Connecting,
    Connected,
    Stale,
}

/// Arena entry for a known peer. The routing table owns these exclusively;
/// buckets hold only `NodeId` values pointing into the arena.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub contact: Contact,
    pub state: PeerState,
    /// Milliseconds since epoch of the last successful exchange.
    pub last_seen: u64,
    /// Milliseconds since epoch of first observation.
    pub first_seen: u64,
    pub metrics: PeerMetrics,
}

impl PeerInfo {
    pub fn new(contact: Contact) -> Self {
        let now = now_ms();
        Self {
            contact,
            state: PeerState::Unknown,
            last_seen: now,
            first_seen: now,
            metrics: PeerMetrics::default(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = now_ms();
        self.state = PeerState::Connected;
    }

    pub fn is_stale(&self, threshold_ms: u64) -> bool {
        now_ms().saturating_sub(self.last_seen) > threshold_ms
    }

    pub fn uptime_ms(&self) -> u64 {
        self.last_seen.saturating_sub(self.first_seen)
    }
}

// ============================================================================
// Keystore
// ============================================================================

/// Ed25519 signing keypair for value envelopes.
///
/// Signing is optional: nodes without a keypair write unsigned envelopes,
/// and readers accept both. The trust boundary is content integrity
/// (checksums), not write authentication; see `ValueEnvelope`.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

/// Verify a detached signature against a raw public key.
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &sig).is_ok()
}

// ============================================================================
// Persisted identity
// ============================================================================

/// On-disk identity record (`<root>/identity.json`).
#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    secret_key: Option<String>,
}

/// Load the node identity from `<root>/identity.json`, generating and
/// persisting a fresh one on first start.
///
/// The id is process-wide and immutable between `start` and `stop`.
pub fn load_or_generate_identity(
    root: &Path,
    with_keypair: bool,
) -> Result<(NodeId, Option<Keypair>)> {
    let path = root.join("identity.json");
    if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        let stored: StoredIdentity = serde_json::from_str(&raw)
            .map_err(|e| LodestoreError::InvalidMetadata(format!("identity.json: {e}")))?;
        let keypair = match stored.secret_key.as_deref() {
            Some(hex_key) => {
                let bytes = hex::decode(hex_key)
                    .map_err(|e| LodestoreError::InvalidMetadata(format!("identity key: {e}")))?;
                let arr: [u8; 32] = bytes.try_into().map_err(|_| {
                    LodestoreError::InvalidMetadata("identity key must be 32 bytes".into())
                })?;
                Some(Keypair::from_secret_key_bytes(&arr))
            }
            None => None,
        };
        return Ok((stored.id, keypair));
    }

    std::fs::create_dir_all(root)?;
    let id = NodeId::random();
    let keypair = with_keypair.then(Keypair::generate);
    let stored = StoredIdentity {
        id,
        secret_key: keypair.as_ref().map(|kp| hex::encode(kp.secret_key_bytes())),
    };
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(&stored)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok((id, keypair))
}

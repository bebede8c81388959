//! # Storage providers
//!
//! A provider places chunk bytes somewhere durable and serves them back
//! with integrity verification. All three variants implement the same
//! [`StorageProvider`] contract; they differ only in where chunks live:
//!
//! - [`LocalProvider`]: synchronous writes under `<root>/chunks/<id>/<index>`
//!   with metadata JSON at `<root>/metadata/<id>` (atomic tmp+rename)
//! - [`NetworkProvider`]: chunk replicas pushed to the k-closest nodes to
//!   each chunk's key, locators and metadata kept in the DHT
//! - [`P2pProvider`]: local chunk cache plus a map of which peers announced
//!   which chunks; periodic announcements at `p2p:announce:<node_id>`
//!
//! Every retrieval path re-hashes chunk bytes before they reach the caller;
//! a mismatch is `ChunkValidation`, never silent corruption.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::chunk::{
    sha256_hex, ArtifactMetadata, ChunkLocation, ChunkManager, ChunkedArtifact, CompressionInfo,
    EncryptionInfo, StorageType,
};
use crate::dht::Dht;
use crate::error::{LodestoreError, Result};
use crate::identity::{now_ms, Contact, NodeId};
use crate::transport::ChunkTransfer;

/// Per-request placement options.
#[derive(Clone, Debug, Default)]
pub struct StoreOptions {
    /// Replica count for network placement; falls back to the provider's
    /// configured minimum.
    pub replicas: Option<usize>,
    /// Chunk size override, consumed by the storage manager at split time.
    pub chunk_size: Option<usize>,
    pub encryption: Option<EncryptionInfo>,
    pub compression: Option<CompressionInfo>,
}

/// Partial metadata update. Unset fields are left alone; `modified` always
/// advances.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetadataPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_type: Option<StorageType>,
}

impl MetadataPatch {
    fn apply(&self, meta: &mut ArtifactMetadata) {
        if let Some(replicas) = self.replicas {
            meta.replicas = replicas;
        }
        if let Some(storage_type) = self.storage_type {
            meta.storage_type = storage_type;
        }
        meta.modified = now_ms();
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ProviderStats {
    pub artifacts: u64,
    pub chunks: u64,
    pub bytes: u64,
}

/// Uniform chunk-level storage contract.
#[async_trait]
pub trait StorageProvider: Send + Sync + 'static {
    fn storage_type(&self) -> StorageType;

    /// Place a pre-split artifact. Returns the located metadata.
    async fn store(
        &self,
        artifact: &ChunkedArtifact,
        options: &StoreOptions,
    ) -> Result<ArtifactMetadata>;

    /// Fetch and reassemble an artifact, verifying every chunk and the
    /// artifact checksum.
    async fn retrieve(&self, id: &str) -> Result<Vec<u8>>;

    /// Best-effort removal. `Ok(true)` when this provider held the artifact.
    async fn delete(&self, id: &str) -> Result<bool>;

    async fn get_metadata(&self, id: &str) -> Result<ArtifactMetadata>;

    async fn update_metadata(&self, id: &str, patch: MetadataPatch) -> Result<ArtifactMetadata>;

    /// Re-read and re-hash the stored artifact. `Ok(false)` on mismatch.
    async fn validate_checksum(&self, id: &str) -> Result<bool>;

    async fn get_stats(&self) -> Result<ProviderStats>;

    /// Remove orphaned or expired state. Returns entries cleaned.
    async fn cleanup(&self) -> Result<u64>;
}

// ============================================================================
// Local disk provider
// ============================================================================

/// One replica on the local filesystem. Chunk files are written first, then
/// metadata lands via atomic rename, so a crash never leaves metadata
/// pointing at missing chunks.
pub struct LocalProvider {
    root: PathBuf,
    node_id: NodeId,
    chunker: ChunkManager,
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>, node_id: NodeId) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("chunks"))?;
        std::fs::create_dir_all(root.join("metadata"))?;
        Ok(Self {
            root,
            node_id,
            chunker: ChunkManager::default(),
        })
    }

    fn chunk_dir(&self, id: &str) -> PathBuf {
        self.root.join("chunks").join(id)
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.root.join("metadata").join(id)
    }

    fn read_metadata(&self, id: &str) -> Result<ArtifactMetadata> {
        let path = self.metadata_path(id);
        if !path.exists() {
            return Err(LodestoreError::NotFound(format!("metadata for {id}")));
        }
        let raw = std::fs::read_to_string(&path)?;
        let meta: ArtifactMetadata = serde_json::from_str(&raw)
            .map_err(|e| LodestoreError::InvalidMetadata(format!("{id}: {e}")))?;
        meta.validate()?;
        Ok(meta)
    }

    fn write_metadata(&self, meta: &ArtifactMetadata) -> Result<()> {
        let path = self.metadata_path(&meta.id);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(meta)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_chunks(&self, meta: &ArtifactMetadata) -> Result<Vec<u8>> {
        let dir = self.chunk_dir(&meta.id);
        let mut chunks = Vec::with_capacity(meta.chunks.len());
        for descriptor in &meta.chunks {
            let path = dir.join(descriptor.index.to_string());
            if !path.exists() {
                return Err(LodestoreError::NotFound(format!(
                    "chunk {} of {}",
                    descriptor.index, meta.id
                )));
            }
            chunks.push((descriptor.clone(), std::fs::read(&path)?));
        }
        let bytes = self.chunker.combine(chunks)?;
        self.chunker.verify_artifact(&bytes, meta)?;
        Ok(bytes)
    }
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn storage_type(&self) -> StorageType {
        StorageType::Local
    }

    async fn store(
        &self,
        artifact: &ChunkedArtifact,
        options: &StoreOptions,
    ) -> Result<ArtifactMetadata> {
        let dir = self.chunk_dir(&artifact.id);
        std::fs::create_dir_all(&dir)?;
        for chunk in &artifact.chunks {
            std::fs::write(dir.join(chunk.descriptor.index.to_string()), &chunk.bytes)?;
        }

        let mut meta = ArtifactMetadata::from_artifact(artifact, StorageType::Local, 1);
        meta.encryption_info = options.encryption.clone();
        meta.compression_info = options.compression.clone();
        for descriptor in &mut meta.chunks {
            descriptor.location = Some(ChunkLocation::new(self.node_id, StorageType::Local));
            descriptor.replicas = 1;
        }
        self.write_metadata(&meta)?;
        debug!(id = %meta.id, chunks = meta.chunks.len(), "stored artifact locally");
        Ok(meta)
    }

    async fn retrieve(&self, id: &str) -> Result<Vec<u8>> {
        let meta = self.read_metadata(id)?;
        self.read_chunks(&meta)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut existed = false;
        let dir = self.chunk_dir(id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            existed = true;
        }
        let meta = self.metadata_path(id);
        if meta.exists() {
            std::fs::remove_file(&meta)?;
            existed = true;
        }
        Ok(existed)
    }

    async fn get_metadata(&self, id: &str) -> Result<ArtifactMetadata> {
        self.read_metadata(id)
    }

    async fn update_metadata(&self, id: &str, patch: MetadataPatch) -> Result<ArtifactMetadata> {
        let mut meta = self.read_metadata(id)?;
        patch.apply(&mut meta);
        self.write_metadata(&meta)?;
        Ok(meta)
    }

    async fn validate_checksum(&self, id: &str) -> Result<bool> {
        let meta = self.read_metadata(id)?;
        match self.read_chunks(&meta) {
            Ok(_) => Ok(true),
            Err(LodestoreError::ChunkValidation(reason)) => {
                warn!(id, reason = %reason, "local checksum validation failed");
                Ok(false)
            }
            Err(other) => Err(other),
        }
    }

    async fn get_stats(&self) -> Result<ProviderStats> {
        let mut stats = ProviderStats::default();
        let chunks_root = self.root.join("chunks");
        for entry in std::fs::read_dir(&chunks_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            stats.artifacts += 1;
            for chunk in std::fs::read_dir(entry.path())? {
                let chunk = chunk?;
                stats.chunks += 1;
                stats.bytes += chunk.metadata()?.len();
            }
        }
        Ok(stats)
    }

    /// Remove chunk directories with no metadata file (interrupted stores).
    async fn cleanup(&self) -> Result<u64> {
        let mut removed = 0;
        for entry in std::fs::read_dir(self.root.join("chunks"))? {
            let entry = entry?;
            let id = entry.file_name().to_string_lossy().to_string();
            if !self.metadata_path(&id).exists() {
                std::fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

// ============================================================================
// Network (DHT-backed) provider
// ============================================================================

/// Chunk locator stored at `chunk:<checksum>`: which nodes hold a replica.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChunkLocator {
    pub checksum: String,
    pub size: u64,
    pub holders: Vec<Contact>,
    pub ts: u64,
}

/// Replicated placement: each chunk is pushed to the n nodes closest to
/// `SHA-256("chunk:" || checksum)` and located through the DHT. Bulk bytes
/// travel over [`ChunkTransfer`]; the DHT carries only locators and
/// metadata.
pub struct NetworkProvider {
    dht: Dht,
    transfer: Arc<dyn ChunkTransfer>,
    min_replicas: usize,
    chunker: ChunkManager,
    stats: Mutex<ProviderStats>,
}

impl NetworkProvider {
    pub fn new(dht: Dht, transfer: Arc<dyn ChunkTransfer>, min_replicas: usize) -> Self {
        Self {
            dht,
            transfer,
            min_replicas: min_replicas.max(1),
            chunker: ChunkManager::default(),
            stats: Mutex::new(ProviderStats::default()),
        }
    }

    fn chunk_key_name(checksum: &str) -> String {
        format!("chunk:{checksum}")
    }

    fn metadata_key_name(id: &str) -> String {
        format!("metadata:{id}")
    }

    async fn metadata_from_dht(&self, id: &str) -> Result<ArtifactMetadata> {
        let value = self
            .dht
            .get_named(&Self::metadata_key_name(id))
            .await?
            .ok_or_else(|| LodestoreError::NotFound(format!("metadata for {id}")))?;
        let meta: ArtifactMetadata = serde_json::from_value(value)
            .map_err(|e| LodestoreError::InvalidMetadata(format!("{id}: {e}")))?;
        meta.validate()?;
        Ok(meta)
    }
}

/// Pull one chunk from its advertised holders, first verified copy wins.
async fn fetch_network_chunk(
    dht: &Dht,
    transfer: &Arc<dyn ChunkTransfer>,
    checksum: &str,
    expected_size: u64,
) -> Result<Vec<u8>> {
    let value = dht
        .get_named(&NetworkProvider::chunk_key_name(checksum))
        .await?
        .ok_or_else(|| LodestoreError::NotFound(format!("locator for chunk {checksum}")))?;
    let locator: ChunkLocator = serde_json::from_value(value)
        .map_err(|e| LodestoreError::InvalidMetadata(format!("locator {checksum}: {e}")))?;

    let mut last_error = LodestoreError::NotFound(format!("no holders for chunk {checksum}"));
    for holder in &locator.holders {
        match transfer.pull_chunk(holder, checksum).await {
            Ok(bytes) => {
                if bytes.len() as u64 == expected_size && sha256_hex(&bytes) == checksum {
                    return Ok(bytes);
                }
                warn!(holder = %holder.id, checksum, "holder returned corrupt chunk");
                last_error = LodestoreError::ChunkValidation(format!(
                    "chunk {checksum} from {} failed verification",
                    holder.id
                ));
            }
            Err(err) => {
                trace!(holder = %holder.id, error = %err, "chunk pull failed");
                last_error = err;
            }
        }
    }
    Err(last_error)
}

#[async_trait]
impl StorageProvider for NetworkProvider {
    fn storage_type(&self) -> StorageType {
        StorageType::Network
    }

    async fn store(
        &self,
        artifact: &ChunkedArtifact,
        options: &StoreOptions,
    ) -> Result<ArtifactMetadata> {
        let replicas = options.replicas.unwrap_or(self.min_replicas).max(1);

        // Place every chunk in parallel; each spawned task returns the
        // holders that acknowledged its chunk.
        let mut join_set = JoinSet::new();
        for chunk in artifact.chunks.clone() {
            let dht = self.dht.clone();
            let transfer = self.transfer.clone();
            join_set.spawn(async move {
                let checksum = chunk.descriptor.checksum.clone();
                let key = crate::identity::Key::for_name(&Self::chunk_key_name(&checksum));
                let mut candidates = dht.iterative_find_node(key).await.unwrap_or_default();

                // This node competes for placement on the same metric as
                // everyone else; lookups never report self, so add it here.
                candidates.push(dht.contact());
                candidates.sort_by(|a, b| {
                    let da = a.id.xor_distance(&key);
                    let db = b.id.xor_distance(&key);
                    crate::identity::distance_cmp(&da, &db)
                });

                let mut holders = Vec::new();
                for contact in candidates.into_iter().take(replicas) {
                    match transfer.push_chunk(&contact, &checksum, &chunk.bytes).await {
                        Ok(()) => holders.push(contact),
                        Err(err) => {
                            trace!(holder = %contact.id, error = %err, "chunk push failed")
                        }
                    }
                }
                (chunk.descriptor, holders)
            });
        }

        let mut located = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let Ok((descriptor, holders)) = joined else {
                continue;
            };
            if holders.is_empty() {
                return Err(LodestoreError::NetworkStore(format!(
                    "chunk {} of {} reached no replica",
                    descriptor.index, artifact.id
                )));
            }
            let locator = ChunkLocator {
                checksum: descriptor.checksum.clone(),
                size: descriptor.size,
                holders: holders.clone(),
                ts: now_ms(),
            };
            self.dht
                .put_named(
                    &Self::chunk_key_name(&descriptor.checksum),
                    serde_json::to_value(&locator)?,
                )
                .await?;
            located.push((descriptor, holders));
        }

        located.sort_by_key(|(d, _)| d.index);
        let mut meta =
            ArtifactMetadata::from_artifact(artifact, StorageType::Network, replicas as u32);
        meta.encryption_info = options.encryption.clone();
        meta.compression_info = options.compression.clone();
        for (descriptor, (_, holders)) in meta.chunks.iter_mut().zip(&located) {
            descriptor.replicas = holders.len() as u32;
            descriptor.location = holders.first().map(|holder| {
                let mut location = ChunkLocation::new(holder.id, StorageType::Network);
                location.endpoint = holder.primary_addr().map(String::from);
                location.region = holder.region.clone();
                location
            });
        }

        self.dht
            .put_named(&Self::metadata_key_name(&meta.id), serde_json::to_value(&meta)?)
            .await?;

        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.artifacts += 1;
        stats.chunks += meta.chunks.len() as u64;
        stats.bytes += meta.size;
        debug!(id = %meta.id, replicas, "stored artifact across network");
        Ok(meta)
    }

    async fn retrieve(&self, id: &str) -> Result<Vec<u8>> {
        let meta = self.metadata_from_dht(id).await?;

        // Fetch chunks concurrently; assembly order comes from descriptors.
        let mut join_set = JoinSet::new();
        for descriptor in meta.chunks.clone() {
            let dht = self.dht.clone();
            let transfer = self.transfer.clone();
            join_set.spawn(async move {
                let bytes =
                    fetch_network_chunk(&dht, &transfer, &descriptor.checksum, descriptor.size)
                        .await;
                (descriptor, bytes)
            });
        }

        let mut chunks = Vec::with_capacity(meta.chunks.len());
        while let Some(joined) = join_set.join_next().await {
            let Ok((descriptor, bytes)) = joined else {
                return Err(LodestoreError::Retrieve(format!(
                    "chunk fetch task failed for {id}"
                )));
            };
            chunks.push((descriptor, bytes?));
        }
        let bytes = self.chunker.combine(chunks)?;
        self.chunker.verify_artifact(&bytes, &meta)?;
        Ok(bytes)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let Ok(meta) = self.metadata_from_dht(id).await else {
            return Ok(false);
        };
        for descriptor in &meta.chunks {
            let _ = self
                .dht
                .delete_named(&Self::chunk_key_name(&descriptor.checksum))
                .await;
        }
        self.dht.delete_named(&Self::metadata_key_name(id)).await?;
        Ok(true)
    }

    async fn get_metadata(&self, id: &str) -> Result<ArtifactMetadata> {
        self.metadata_from_dht(id).await
    }

    async fn update_metadata(&self, id: &str, patch: MetadataPatch) -> Result<ArtifactMetadata> {
        let mut meta = self.metadata_from_dht(id).await?;
        patch.apply(&mut meta);
        self.dht
            .put_named(&Self::metadata_key_name(id), serde_json::to_value(&meta)?)
            .await?;
        Ok(meta)
    }

    async fn validate_checksum(&self, id: &str) -> Result<bool> {
        match self.retrieve(id).await {
            Ok(_) => Ok(true),
            Err(LodestoreError::ChunkValidation(_)) => Ok(false),
            Err(other) => Err(other),
        }
    }

    async fn get_stats(&self) -> Result<ProviderStats> {
        Ok(*self.stats.lock().unwrap_or_else(|e| e.into_inner()))
    }

    async fn cleanup(&self) -> Result<u64> {
        // Remote replicas are reclaimed by their holders; nothing local.
        Ok(0)
    }
}

// ============================================================================
// Peer-to-peer provider
// ============================================================================

/// Announcement payload published at `p2p:announce:<node_id>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnnounceBody {
    pub node_id: NodeId,
    pub chunks: Vec<String>,
    pub ts: u64,
}

#[derive(Default)]
struct PeerChunkMap {
    /// checksum → holder → last announcement timestamp (ms).
    holders: HashMap<String, HashMap<NodeId, u64>>,
    contacts: HashMap<NodeId, Contact>,
}

impl PeerChunkMap {
    fn note(&mut self, contact: Contact, chunks: &[String], ts: u64) {
        for checksum in chunks {
            self.holders
                .entry(checksum.clone())
                .or_default()
                .insert(contact.id, ts);
        }
        self.contacts.insert(contact.id, contact);
    }

    fn holders_of(&self, checksum: &str) -> Vec<Contact> {
        self.holders
            .get(checksum)
            .map(|peers| {
                peers
                    .keys()
                    .filter_map(|id| self.contacts.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn prune(&mut self, cutoff_ms: u64) -> u64 {
        let mut pruned = 0;
        for peers in self.holders.values_mut() {
            let before = peers.len();
            peers.retain(|_, ts| *ts >= cutoff_ms);
            pruned += (before - peers.len()) as u64;
        }
        self.holders.retain(|_, peers| !peers.is_empty());
        pruned
    }
}

/// Cache-and-announce placement: chunks live in a local content-addressed
/// cache and are served to peers over [`ChunkTransfer`]; discovery runs on
/// periodic announcements rather than per-chunk locator writes.
pub struct P2pProvider {
    dht: Dht,
    transfer: Arc<dyn ChunkTransfer>,
    cache_dir: PathBuf,
    self_contact: Contact,
    chunker: ChunkManager,
    peer_chunks: Mutex<PeerChunkMap>,
    announce_interval: Duration,
    stale_after: Duration,
}

impl P2pProvider {
    pub fn new(
        dht: Dht,
        transfer: Arc<dyn ChunkTransfer>,
        root: impl Into<PathBuf>,
        announce_interval: Duration,
        stale_after: Duration,
    ) -> Result<Arc<Self>> {
        let cache_dir = root.into().join("p2p");
        std::fs::create_dir_all(&cache_dir)?;
        let provider = Arc::new(Self {
            self_contact: dht.contact(),
            dht,
            transfer,
            cache_dir,
            chunker: ChunkManager::default(),
            peer_chunks: Mutex::new(PeerChunkMap::default()),
            announce_interval,
            stale_after,
        });
        provider.spawn_announce_task();
        Ok(provider)
    }

    fn announce_key_name(node_id: &NodeId) -> String {
        format!("p2p:announce:{}", node_id.to_hex())
    }

    fn cache_path(&self, checksum: &str) -> PathBuf {
        self.cache_dir.join(checksum)
    }

    fn cached_checksums(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.cache_dir)? {
            out.push(entry?.file_name().to_string_lossy().to_string());
        }
        out.sort();
        Ok(out)
    }

    /// Record a peer's announcement into the holder map.
    pub fn note_announcement(&self, contact: Contact, body: &AnnounceBody) {
        let mut map = self.peer_chunks.lock().unwrap_or_else(|e| e.into_inner());
        map.note(contact, &body.chunks, body.ts);
    }

    /// Publish our cached chunk set at `p2p:announce:<node_id>`.
    pub async fn announce(&self) -> Result<()> {
        let chunks = self.cached_checksums()?;
        let body = AnnounceBody {
            node_id: self.self_contact.id,
            chunks,
            ts: now_ms(),
        };
        self.dht
            .put_named(
                &Self::announce_key_name(&self.self_contact.id),
                serde_json::to_value(&body)?,
            )
            .await?;
        Ok(())
    }

    fn spawn_announce_task(self: &Arc<Self>) {
        let provider = Arc::downgrade(self);
        let interval_duration = self.announce_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                // Rate limit: one announcement per interval, stop with the
                // provider.
                let Some(provider) = provider.upgrade() else { break };
                if let Err(err) = provider.announce().await {
                    debug!(error = %err, "p2p announcement failed");
                }
                provider.poll_neighbor_announcements().await;
            }
        });
    }

    /// Read the announcements of our nearest neighbors and merge them into
    /// the holder map.
    async fn poll_neighbor_announcements(&self) {
        let neighbors = self
            .dht
            .closest_local(self.self_contact.id, 20)
            .await;
        for contact in neighbors {
            let key = Self::announce_key_name(&contact.id);
            match self.dht.get_named(&key).await {
                Ok(Some(value)) => {
                    if let Ok(body) = serde_json::from_value::<AnnounceBody>(value) {
                        if body.node_id == contact.id {
                            self.note_announcement(contact, &body);
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => trace!(peer = %contact.id, error = %err, "announcement fetch failed"),
            }
        }
    }

    async fn cache_chunk(&self, checksum: &str, bytes: &[u8]) -> Result<()> {
        std::fs::write(self.cache_path(checksum), bytes)?;
        // Publish to our own shelf so peers can pull it over the transfer
        // channel.
        self.transfer
            .push_chunk(&self.self_contact, checksum, bytes)
            .await
    }

    /// Local cache first, then advertised holders ordered by observed
    /// latency (unknown latency sorts last).
    async fn fetch_chunk(&self, checksum: &str, expected_size: u64) -> Result<Vec<u8>> {
        let path = self.cache_path(checksum);
        if path.exists() {
            let bytes = std::fs::read(&path)?;
            if bytes.len() as u64 == expected_size && sha256_hex(&bytes) == checksum {
                return Ok(bytes);
            }
            warn!(checksum, "local p2p cache entry corrupt, falling back to peers");
        }

        let mut holders = {
            let map = self.peer_chunks.lock().unwrap_or_else(|e| e.into_inner());
            map.holders_of(checksum)
        };
        let mut ranked = Vec::with_capacity(holders.len());
        for holder in holders.drain(..) {
            let latency = self.dht.peer_latency(&holder.id).await;
            ranked.push((latency.unwrap_or(f64::MAX), holder));
        }
        ranked.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut last_error = LodestoreError::NotFound(format!("chunk {checksum} unavailable"));
        for (_, holder) in ranked {
            if holder.id == self.self_contact.id {
                continue;
            }
            match self.transfer.pull_chunk(&holder, checksum).await {
                Ok(bytes) => {
                    if bytes.len() as u64 == expected_size && sha256_hex(&bytes) == checksum {
                        // Opportunistic cache fill for later requests.
                        let _ = self.cache_chunk(checksum, &bytes).await;
                        return Ok(bytes);
                    }
                    last_error = LodestoreError::ChunkValidation(format!(
                        "chunk {checksum} from {} failed verification",
                        holder.id
                    ));
                }
                Err(err) => last_error = err,
            }
        }
        Err(last_error)
    }

    fn metadata_key_name(id: &str) -> String {
        format!("metadata:{id}")
    }

    async fn metadata_from_dht(&self, id: &str) -> Result<ArtifactMetadata> {
        let value = self
            .dht
            .get_named(&Self::metadata_key_name(id))
            .await?
            .ok_or_else(|| LodestoreError::NotFound(format!("metadata for {id}")))?;
        let meta: ArtifactMetadata = serde_json::from_value(value)
            .map_err(|e| LodestoreError::InvalidMetadata(format!("{id}: {e}")))?;
        meta.validate()?;
        Ok(meta)
    }
}

#[async_trait]
impl StorageProvider for P2pProvider {
    fn storage_type(&self) -> StorageType {
        StorageType::P2p
    }

    async fn store(
        &self,
        artifact: &ChunkedArtifact,
        options: &StoreOptions,
    ) -> Result<ArtifactMetadata> {
        for chunk in &artifact.chunks {
            self.cache_chunk(&chunk.descriptor.checksum, &chunk.bytes)
                .await?;
        }

        let mut meta = ArtifactMetadata::from_artifact(artifact, StorageType::P2p, 1);
        meta.encryption_info = options.encryption.clone();
        meta.compression_info = options.compression.clone();
        for descriptor in &mut meta.chunks {
            let mut location = ChunkLocation::new(self.self_contact.id, StorageType::P2p);
            location.endpoint = self.self_contact.primary_addr().map(String::from);
            descriptor.location = Some(location);
            descriptor.replicas = 1;
        }
        self.dht
            .put_named(&Self::metadata_key_name(&meta.id), serde_json::to_value(&meta)?)
            .await?;

        // Announce immediately rather than waiting out the interval, so
        // fresh content is discoverable right away.
        self.announce().await?;
        debug!(id = %meta.id, chunks = meta.chunks.len(), "cached artifact for p2p serving");
        Ok(meta)
    }

    async fn retrieve(&self, id: &str) -> Result<Vec<u8>> {
        let meta = self.metadata_from_dht(id).await?;
        let mut chunks = Vec::with_capacity(meta.chunks.len());
        for descriptor in meta.chunks.clone() {
            let bytes = self
                .fetch_chunk(&descriptor.checksum, descriptor.size)
                .await?;
            chunks.push((descriptor, bytes));
        }
        let bytes = self.chunker.combine(chunks)?;
        self.chunker.verify_artifact(&bytes, &meta)?;
        Ok(bytes)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let Ok(meta) = self.metadata_from_dht(id).await else {
            return Ok(false);
        };
        let mut existed = false;
        for descriptor in &meta.chunks {
            let path = self.cache_path(&descriptor.checksum);
            if path.exists() {
                std::fs::remove_file(&path)?;
                existed = true;
            }
        }
        self.dht.delete_named(&Self::metadata_key_name(id)).await?;
        self.announce().await?;
        Ok(existed)
    }

    async fn get_metadata(&self, id: &str) -> Result<ArtifactMetadata> {
        self.metadata_from_dht(id).await
    }

    async fn update_metadata(&self, id: &str, patch: MetadataPatch) -> Result<ArtifactMetadata> {
        let mut meta = self.metadata_from_dht(id).await?;
        patch.apply(&mut meta);
        self.dht
            .put_named(&Self::metadata_key_name(id), serde_json::to_value(&meta)?)
            .await?;
        Ok(meta)
    }

    async fn validate_checksum(&self, id: &str) -> Result<bool> {
        let meta = self.metadata_from_dht(id).await?;
        for descriptor in &meta.chunks {
            let path = self.cache_path(&descriptor.checksum);
            if !path.exists() {
                return Err(LodestoreError::NotFound(format!(
                    "chunk {} of {id} not cached",
                    descriptor.index
                )));
            }
            let bytes = std::fs::read(&path)?;
            if sha256_hex(&bytes) != descriptor.checksum {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn get_stats(&self) -> Result<ProviderStats> {
        let mut stats = ProviderStats::default();
        for entry in std::fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            stats.chunks += 1;
            stats.bytes += entry.metadata()?.len();
        }
        Ok(stats)
    }

    /// Drop holder entries whose announcements have gone stale.
    async fn cleanup(&self) -> Result<u64> {
        let cutoff = now_ms().saturating_sub(self.stale_after.as_millis() as u64);
        let mut map = self.peer_chunks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map.prune(cutoff))
    }
}

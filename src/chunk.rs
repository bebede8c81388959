//! # Chunk manager
//!
//! Deterministic splitting and recombination of artifact bytes.
//!
//! An artifact of length `N` splits into `ceil(N / C)` ordered chunks of
//! size `C` (default 1 MiB); chunk `i` covers bytes `[i*C, min((i+1)*C, N))`
//! and carries its own SHA-256 checksum. Combining verifies every chunk's
//! length and checksum before concatenating in index order; an integrity
//! failure aborts the whole operation and never yields partial data.
//!
//! Split and combine are CPU-only; all I/O lives in the providers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{LodestoreError, Result};
use crate::identity::{now_ms, NodeId};

/// Default chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Derive an artifact id: SHA-256 over the content concatenated with the
/// current millisecond timestamp. Semi-deterministic on purpose: two
/// concurrent publishes of identical bytes get distinct ids, while content
/// integrity stays with the separate `checksum` field.
pub fn derive_artifact_id(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.update(now_ms().to_be_bytes());
    hex::encode(hasher.finalize())
}

/// Where a stored chunk lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Local,
    Network,
    P2p,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Local => "local",
            StorageType::Network => "network",
            StorageType::P2p => "p2p",
        }
    }
}

/// Placement record for one chunk replica.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkLocation {
    pub node_id: NodeId,
    pub storage_type: StorageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Fraction of recent probes that found the replica reachable.
    pub availability: f64,
    pub last_seen: u64,
    /// Holder-reported health in `[0, 1]`.
    pub health: f64,
}

impl ChunkLocation {
    pub fn new(node_id: NodeId, storage_type: StorageType) -> Self {
        Self {
            node_id,
            storage_type,
            endpoint: None,
            region: None,
            availability: 1.0,
            last_seen: now_ms(),
            health: 1.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncryptionInfo {
    pub iv: String,
    pub algorithm: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompressionInfo {
    pub algorithm: String,
    pub original_size: u64,
}

/// Descriptor for one chunk of an artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub index: u32,
    pub size: u64,
    /// SHA-256 of the chunk bytes, lowercase hex.
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<ChunkLocation>,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionInfo>,
}

/// One chunk's bytes paired with its descriptor. Produced by `split`,
/// consumed by providers.
#[derive(Clone, Debug)]
pub struct ChunkPayload {
    pub descriptor: ChunkDescriptor,
    pub bytes: Vec<u8>,
}

/// A fully split artifact ready for placement: the manager splits once and
/// hands the same chunk set to every provider in the strategy.
#[derive(Clone, Debug)]
pub struct ChunkedArtifact {
    pub id: String,
    pub size: u64,
    /// SHA-256 of the whole artifact, lowercase hex.
    pub checksum: String,
    pub chunks: Vec<ChunkPayload>,
}

impl ChunkedArtifact {
    pub fn descriptors(&self) -> Vec<ChunkDescriptor> {
        self.chunks.iter().map(|c| c.descriptor.clone()).collect()
    }
}

/// Artifact-level metadata persisted by providers and the DHT.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub id: String,
    pub size: u64,
    pub chunks: Vec<ChunkDescriptor>,
    pub created: u64,
    pub modified: u64,
    /// SHA-256 over the full byte sequence, lowercase hex.
    pub checksum: String,
    pub storage_type: StorageType,
    pub replicas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_info: Option<EncryptionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_info: Option<CompressionInfo>,
}

impl ArtifactMetadata {
    pub fn from_artifact(
        artifact: &ChunkedArtifact,
        storage_type: StorageType,
        replicas: u32,
    ) -> Self {
        let now = now_ms();
        Self {
            id: artifact.id.clone(),
            size: artifact.size,
            chunks: artifact.descriptors(),
            created: now,
            modified: now,
            checksum: artifact.checksum.clone(),
            storage_type,
            replicas,
            encryption_info: None,
            compression_info: None,
        }
    }

    /// Structural invariants: chunk list ordered by index from 0 with no
    /// gaps, and `size` equal to the chunk sizes summed.
    pub fn validate(&self) -> Result<()> {
        let mut total = 0u64;
        for (i, chunk) in self.chunks.iter().enumerate() {
            if chunk.index as usize != i {
                return Err(LodestoreError::InvalidMetadata(format!(
                    "artifact {}: chunk index {} at position {i}",
                    self.id, chunk.index
                )));
            }
            if chunk.checksum.len() != 64 {
                return Err(LodestoreError::InvalidMetadata(format!(
                    "artifact {}: chunk {} has malformed checksum",
                    self.id, chunk.index
                )));
            }
            total += chunk.size;
        }
        if total != self.size {
            return Err(LodestoreError::InvalidMetadata(format!(
                "artifact {}: size {} != chunk sum {total}",
                self.id, self.size
            )));
        }
        Ok(())
    }
}

/// Splits and recombines artifact bytes. Stateless apart from the
/// configured default chunk size.
#[derive(Clone, Debug)]
pub struct ChunkManager {
    chunk_size: usize,
}

impl Default for ChunkManager {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl ChunkManager {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Split `bytes` into checksummed chunks. `chunk_size` overrides the
    /// configured default for this request only.
    pub fn split(&self, bytes: &[u8], chunk_size: Option<usize>) -> ChunkedArtifact {
        let size = chunk_size.unwrap_or(self.chunk_size).max(1);
        let chunks = bytes
            .chunks(size)
            .enumerate()
            .map(|(index, window)| ChunkPayload {
                descriptor: ChunkDescriptor {
                    index: index as u32,
                    size: window.len() as u64,
                    checksum: sha256_hex(window),
                    location: None,
                    replicas: 0,
                    encryption: None,
                    compression: None,
                },
                bytes: window.to_vec(),
            })
            .collect();
        ChunkedArtifact {
            id: derive_artifact_id(bytes),
            size: bytes.len() as u64,
            checksum: sha256_hex(bytes),
            chunks,
        }
    }

    /// Reassemble an artifact from descriptor/bytes pairs.
    ///
    /// Verifies each chunk's length and checksum, sorts by index, and
    /// requires a gapless index sequence starting at 0. Any failure aborts
    /// with `ChunkValidation`; no partial buffer is ever returned.
    pub fn combine(&self, mut chunks: Vec<(ChunkDescriptor, Vec<u8>)>) -> Result<Vec<u8>> {
        for (descriptor, bytes) in &chunks {
            if bytes.len() as u64 != descriptor.size {
                return Err(LodestoreError::ChunkValidation(format!(
                    "chunk {}: expected {} bytes, got {}",
                    descriptor.index,
                    descriptor.size,
                    bytes.len()
                )));
            }
            let actual = sha256_hex(bytes);
            if actual != descriptor.checksum {
                return Err(LodestoreError::ChunkValidation(format!(
                    "chunk {}: checksum mismatch (expected {}, got {actual})",
                    descriptor.index, descriptor.checksum
                )));
            }
        }

        chunks.sort_by_key(|(d, _)| d.index);
        let mut out = Vec::with_capacity(chunks.iter().map(|(d, _)| d.size as usize).sum());
        for (position, (descriptor, bytes)) in chunks.into_iter().enumerate() {
            if descriptor.index as usize != position {
                return Err(LodestoreError::ChunkValidation(format!(
                    "chunk sequence broken at index {} (position {position})",
                    descriptor.index
                )));
            }
            out.extend_from_slice(&bytes);
        }
        Ok(out)
    }

    /// Verify a reassembled artifact against its metadata checksum.
    pub fn verify_artifact(&self, bytes: &[u8], metadata: &ArtifactMetadata) -> Result<()> {
        let actual = sha256_hex(bytes);
        if actual != metadata.checksum {
            return Err(LodestoreError::ChunkValidation(format!(
                "artifact {}: checksum mismatch (expected {}, got {actual})",
                metadata.id, metadata.checksum
            )));
        }
        if bytes.len() as u64 != metadata.size {
            return Err(LodestoreError::ChunkValidation(format!(
                "artifact {}: size mismatch (expected {}, got {})",
                metadata.id,
                metadata.size,
                bytes.len()
            )));
        }
        Ok(())
    }
}

//! Error types shared across the crate.
//!
//! Every fallible public operation returns [`LodestoreError`]. Callers match
//! on the variant rather than on strings; the storage manager in particular
//! relies on distinguishing `ChunkValidation` (try the next provider) from
//! `NotFound` (give up on this provider) during retrieval failover.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LodestoreError>;

#[derive(Debug, Error)]
pub enum LodestoreError {
    /// Missing metadata, chunk, or DHT value.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed or incomplete artifact metadata.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// A chunk failed size or checksum verification.
    #[error("chunk validation failed: {0}")]
    ChunkValidation(String),

    /// A write to remote peers did not reach any replica.
    #[error("network store failed: {0}")]
    NetworkStore(String),

    /// No provider produced verified bytes for a retrieval.
    #[error("retrieve failed: {0}")]
    Retrieve(String),

    /// The configured strategy has no backing provider.
    #[error("no providers configured for strategy {0}")]
    NoProviders(String),

    /// Lifecycle misuse: `start` while already running.
    #[error("node is already running")]
    AlreadyRunning,

    /// Lifecycle misuse: operation before `start` or after `stop`.
    #[error("node is not running")]
    NotRunning,

    /// A version string is already recorded for this artifact.
    #[error("version already exists: {0}")]
    VersionExists(String),

    /// A version string is empty or malformed.
    #[error("invalid version: {0}")]
    InvalidVersion(String),

    /// Message timestamp outside the replay window. Receivers drop these
    /// silently; the variant exists so codec tests can assert the reason.
    #[error("message outside replay window ({age_ms} ms)")]
    Replay { age_ms: i64 },

    /// A peer could not be reached. Non-fatal during lookups.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// Malformed wire message (missing fields, bad key encoding).
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LodestoreError {
    /// True for errors that mean "this provider cannot serve the request,
    /// try the next one" rather than "the request itself is bad".
    pub fn is_provider_failover(&self) -> bool {
        matches!(
            self,
            LodestoreError::NotFound(_)
                | LodestoreError::ChunkValidation(_)
                | LodestoreError::Retrieve(_)
                | LodestoreError::NetworkStore(_)
                | LodestoreError::PeerUnreachable(_)
                | LodestoreError::Io(_)
        )
    }
}

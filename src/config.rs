//! Node configuration.
//!
//! Every tunable lives here so simulations and tests can shrink intervals
//! without touching component code. Defaults match the protocol constants:
//! k=20, α=3, 30 s RPC deadline, 1 h staleness and republish horizons.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Provider-selection strategy for artifact storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    LocalOnly,
    NetworkOnly,
    P2pOnly,
    #[default]
    Hybrid,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::LocalOnly => "local-only",
            Strategy::NetworkOnly => "network-only",
            Strategy::P2pOnly => "p2p-only",
            Strategy::Hybrid => "hybrid",
        }
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local-only" | "local" => Ok(Strategy::LocalOnly),
            "network-only" | "network" => Ok(Strategy::NetworkOnly),
            "p2p-only" | "p2p" => Ok(Strategy::P2pOnly),
            "hybrid" => Ok(Strategy::Hybrid),
            other => Err(format!("unknown strategy {other:?}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Replication width and per-bucket capacity.
    pub k: usize,
    /// Lookup concurrency.
    pub alpha: usize,
    /// Per-RPC deadline.
    #[serde(with = "duration_ms")]
    pub rpc_timeout: Duration,
    /// Overall deadline for one iterative lookup.
    #[serde(with = "duration_ms")]
    pub lookup_timeout: Duration,
    /// How often the liveness task pings quiet peers.
    #[serde(with = "duration_ms")]
    pub refresh_interval: Duration,
    /// Peers unseen for longer than this are ping candidates.
    #[serde(with = "duration_ms")]
    pub refresh_after: Duration,
    /// Peers unseen for longer than this are evictable; also the provider
    /// staleness horizon in content records.
    #[serde(with = "duration_ms")]
    pub stale_after: Duration,
    /// How often owned values are re-pushed to the current k-closest set.
    #[serde(with = "duration_ms")]
    pub republish_interval: Duration,
    /// How often the p2p provider broadcasts its chunk announcement.
    #[serde(with = "duration_ms")]
    pub announce_interval: Duration,
    /// Chunk size used when a store request does not override it.
    pub chunk_size: usize,
    /// Default replica count for network placement.
    pub min_replicas: usize,
    /// Provider-selection strategy.
    pub strategy: Strategy,
    /// Storage root: identity file, chunk store, metadata.
    pub storage_root: PathBuf,
    /// Address advertised to peers.
    pub listen_addr: String,
    /// Cap on discovery index arrays.
    pub index_cap: usize,
    /// Metadata cache capacity (artifacts).
    pub metadata_cache_size: usize,
    /// Generate and persist a signing keypair for value envelopes.
    pub sign_envelopes: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            rpc_timeout: Duration::from_secs(30),
            lookup_timeout: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(60),
            refresh_after: Duration::from_secs(15 * 60),
            stale_after: Duration::from_secs(60 * 60),
            republish_interval: Duration::from_secs(60 * 60),
            announce_interval: Duration::from_secs(60),
            chunk_size: 1024 * 1024,
            min_replicas: 3,
            strategy: Strategy::default(),
            storage_root: PathBuf::from("./lodestore-data"),
            listen_addr: "127.0.0.1:0".to_string(),
            index_cap: 1000,
            metadata_cache_size: 1024,
            sign_envelopes: false,
        }
    }
}

impl NodeConfig {
    /// Compressed timings for in-process simulations: second-scale
    /// maintenance, sub-second RPC deadlines.
    pub fn for_tests(storage_root: PathBuf) -> Self {
        Self {
            rpc_timeout: Duration::from_millis(500),
            lookup_timeout: Duration::from_secs(5),
            refresh_interval: Duration::from_millis(200),
            refresh_after: Duration::from_millis(500),
            stale_after: Duration::from_secs(2),
            republish_interval: Duration::from_secs(1),
            announce_interval: Duration::from_millis(200),
            storage_root,
            ..Self::default()
        }
    }
}

/// Durations serialize as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

//! # Lodestore: decentralized content-addressed artifact store
//!
//! Lodestore distributes large immutable artifacts (datasets, models,
//! checkpoints) across a peer-to-peer network:
//!
//! - **Identity**: 256-bit node ids and keys in one XOR-metric space
//! - **Routing**: 256 k-buckets with stale-replacement eviction
//! - **DHT**: iterative `FIND_NODE` / `FIND_VALUE` / `STORE` lookups with
//!   replication to the k closest peers and periodic republish
//! - **Storage**: deterministic chunking with per-chunk SHA-256, placed
//!   through local, network, and peer-to-peer providers under a strategy
//! - **Publishing**: content records, discovery indexes, version history
//!
//! ## Architecture
//!
//! Components with mutable state follow the **actor pattern**: a public
//! cheaply-clonable handle, a private actor owning the state, and an async
//! command channel between them. Seams to the outside world (`Transport`,
//! `ChunkTransfer`, `DhtRpc`, `StorageProvider`) are `async_trait` objects,
//! so simulations and tests swap in in-process fakes.
//!
//! ## Integrity model
//!
//! Every chunk is hashed on the way in and re-hashed on the way out; every
//! artifact checksum is verified after reassembly. Corrupt replicas are
//! rejected and the next provider or holder is tried. DHT values travel in
//! JSON envelopes ordered last-writer-wins by timestamp, with optional
//! ed25519 signatures.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | High-level API combining all components |
//! | `identity` | Node ids, XOR metric, contacts, peer records, keystore |
//! | `routing` | K-bucket routing table |
//! | `messages` | JSON wire protocol and value envelopes |
//! | `transport` | Transport seams and the in-memory adapter |
//! | `dht` | Kademlia-style DHT node (lookups, replication, liveness) |
//! | `chunk` | Deterministic splitting and recombination |
//! | `provider` | Local / network / p2p storage providers |
//! | `storage` | Strategy routing and cross-provider replication |
//! | `publisher` | Content records, discovery indexes, versions |
//! | `events` | Synchronous event bus |
//! | `config` | Tunables |
//! | `error` | Typed error kinds |

pub mod chunk;
pub mod config;
pub mod dht;
pub mod error;
pub mod events;
pub mod identity;
pub mod messages;
pub mod node;
pub mod provider;
pub mod publisher;
pub mod routing;
pub mod storage;
pub mod transport;

pub use chunk::{ArtifactMetadata, ChunkDescriptor, ChunkManager, StorageType};
pub use config::{NodeConfig, Strategy};
pub use dht::Dht;
pub use error::{LodestoreError, Result};
pub use events::{EventBus, EventKind, NodeEvent};
pub use identity::{Contact, Key, Keypair, NodeId};
pub use node::{Node, NodeBuilder};
pub use provider::{StorageProvider, StoreOptions};
pub use publisher::{ContentRecord, PublishMeta, VersionInfo};
pub use transport::{MemoryHub, Transport};

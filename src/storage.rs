//! # Storage manager
//!
//! Routes artifact operations across the configured providers.
//!
//! The strategy fixes the provider order: `local-only`, `network-only`, and
//! `p2p-only` run a single provider; `hybrid` writes to the primary (first
//! configured) synchronously and replicates to the rest in the background.
//! A secondary failure emits `replication-failed` but never fails the
//! primary store.
//!
//! Retrieval walks providers in priority order. A provider whose bytes
//! fail checksum verification is rejected and the next is tried; only when
//! every provider has failed does the caller see an error. Metadata reads
//! go through a last-writer-wins LRU cache.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::chunk::{ArtifactMetadata, ChunkManager, StorageType};
use crate::config::Strategy;
use crate::error::{LodestoreError, Result};
use crate::events::{EventBus, NodeEvent};
use crate::provider::{MetadataPatch, ProviderStats, StorageProvider, StoreOptions};

pub struct StorageManager {
    strategy: Strategy,
    /// Priority order; index 0 is the primary.
    providers: Vec<Arc<dyn StorageProvider>>,
    chunker: ChunkManager,
    cache: Mutex<LruCache<String, ArtifactMetadata>>,
    events: EventBus,
}

impl StorageManager {
    pub fn new(
        strategy: Strategy,
        providers: Vec<Arc<dyn StorageProvider>>,
        chunk_size: usize,
        cache_size: usize,
        events: EventBus,
    ) -> Result<Self> {
        if providers.is_empty() {
            return Err(LodestoreError::NoProviders(strategy.as_str().to_string()));
        }
        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            strategy,
            providers,
            chunker: ChunkManager::new(chunk_size),
            cache: Mutex::new(LruCache::new(cache_size)),
            events,
        })
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn provider_types(&self) -> Vec<StorageType> {
        self.providers.iter().map(|p| p.storage_type()).collect()
    }

    fn cache_put(&self, meta: &ArtifactMetadata) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        // Last writer wins: replace only with same-or-newer modifications.
        if let Some(current) = cache.peek(&meta.id) {
            if current.modified > meta.modified {
                return;
            }
        }
        cache.put(meta.id.clone(), meta.clone());
    }

    fn cache_get(&self, id: &str) -> Option<ArtifactMetadata> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    fn cache_evict(&self, id: &str) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop(id);
    }

    /// Split once, store at the primary synchronously, fan replication out
    /// to the remaining providers in the background.
    pub async fn store(&self, bytes: &[u8], options: StoreOptions) -> Result<ArtifactMetadata> {
        let artifact = Arc::new(self.chunker.split(bytes, options.chunk_size));
        let primary = &self.providers[0];
        let meta = primary.store(&artifact, &options).await?;
        self.cache_put(&meta);
        self.events.emit(NodeEvent::Stored {
            id: meta.id.clone(),
            size: meta.size,
            provider: primary.storage_type().as_str().to_string(),
        });

        for secondary in self.providers.iter().skip(1).cloned() {
            let artifact = artifact.clone();
            let options = options.clone();
            let events = self.events.clone();
            let id = meta.id.clone();
            tokio::spawn(async move {
                let provider_name = secondary.storage_type().as_str().to_string();
                match secondary.store(&artifact, &options).await {
                    Ok(_) => events.emit(NodeEvent::Replicated {
                        id,
                        provider: provider_name,
                    }),
                    Err(err) => {
                        warn!(id = %id, provider = %provider_name, error = %err, "replication failed");
                        events.emit(NodeEvent::ReplicationFailed {
                            id,
                            provider: provider_name,
                            error: err.to_string(),
                        });
                    }
                }
            });
        }
        Ok(meta)
    }

    /// Try providers in priority order until one produces verified bytes.
    pub async fn retrieve(&self, id: &str) -> Result<Vec<u8>> {
        let mut not_found = 0usize;
        let mut last_error: Option<LodestoreError> = None;
        for provider in &self.providers {
            match provider.retrieve(id).await {
                Ok(bytes) => {
                    self.events.emit(NodeEvent::Retrieved {
                        id: id.to_string(),
                        size: bytes.len() as u64,
                        provider: provider.storage_type().as_str().to_string(),
                    });
                    return Ok(bytes);
                }
                Err(err) if err.is_provider_failover() => {
                    debug!(
                        id,
                        provider = provider.storage_type().as_str(),
                        error = %err,
                        "provider failed, trying next"
                    );
                    if matches!(err, LodestoreError::NotFound(_)) {
                        not_found += 1;
                    }
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        if not_found == self.providers.len() {
            return Err(LodestoreError::NotFound(format!("artifact {id}")));
        }
        let err = match last_error {
            Some(err) => err,
            None => LodestoreError::Retrieve(format!("no provider produced {id}")),
        };
        self.events.emit(NodeEvent::Error {
            message: format!("retrieve {id}: {err}"),
        });
        Err(err)
    }

    /// Cached metadata when fresh, otherwise the first provider that knows
    /// the artifact.
    pub async fn get_metadata(&self, id: &str) -> Result<ArtifactMetadata> {
        if let Some(meta) = self.cache_get(id) {
            return Ok(meta);
        }
        let mut last_error = LodestoreError::NotFound(format!("artifact {id}"));
        for provider in &self.providers {
            match provider.get_metadata(id).await {
                Ok(meta) => {
                    self.cache_put(&meta);
                    return Ok(meta);
                }
                Err(err) => last_error = err,
            }
        }
        Err(last_error)
    }

    /// Patch metadata on every provider holding it; at least one must
    /// succeed.
    pub async fn update_metadata(
        &self,
        id: &str,
        patch: MetadataPatch,
    ) -> Result<ArtifactMetadata> {
        let mut updated: Option<ArtifactMetadata> = None;
        for provider in &self.providers {
            match provider.update_metadata(id, patch.clone()).await {
                Ok(meta) => updated = Some(meta),
                Err(LodestoreError::NotFound(_)) => {}
                Err(err) => {
                    debug!(id, error = %err, "metadata update failed on one provider");
                }
            }
        }
        match updated {
            Some(meta) => {
                self.cache_put(&meta);
                Ok(meta)
            }
            None => Err(LodestoreError::NotFound(format!("artifact {id}"))),
        }
    }

    /// Best-effort deletion: `Ok(true)` when at least one provider removed
    /// the artifact. Callers needing full removal poll `get_metadata` until
    /// every provider reports `NotFound`.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let mut any = false;
        for provider in &self.providers {
            match provider.delete(id).await {
                Ok(removed) => any |= removed,
                Err(err) => {
                    debug!(id, provider = provider.storage_type().as_str(), error = %err,
                        "delete failed on one provider");
                }
            }
        }
        self.cache_evict(id);
        if any {
            self.events.emit(NodeEvent::Deleted { id: id.to_string() });
        }
        Ok(any)
    }

    /// Re-verify stored bytes on the first provider that holds the
    /// artifact.
    pub async fn validate_checksum(&self, id: &str) -> Result<bool> {
        let mut last_error = LodestoreError::NotFound(format!("artifact {id}"));
        for provider in &self.providers {
            match provider.validate_checksum(id).await {
                Ok(valid) => return Ok(valid),
                Err(err) => last_error = err,
            }
        }
        Err(last_error)
    }

    /// Per-provider stats, in priority order.
    pub async fn stats(&self) -> Vec<(StorageType, ProviderStats)> {
        let mut out = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            let stats = provider.get_stats().await.unwrap_or_default();
            out.push((provider.storage_type(), stats));
        }
        out
    }

    /// Run provider cleanups concurrently; returns total entries removed.
    pub async fn cleanup(&self) -> u64 {
        let mut join_set = JoinSet::new();
        for provider in self.providers.iter().cloned() {
            join_set.spawn(async move { provider.cleanup().await.unwrap_or(0) });
        }
        let mut total = 0;
        while let Some(joined) = join_set.join_next().await {
            total += joined.unwrap_or(0);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::identity::{now_ms, NodeId};
    use crate::provider::LocalProvider;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn temp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("lodestore-storage-test")
            .join(format!("{tag}-{}", now_ms()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn local(root: &PathBuf) -> Arc<dyn StorageProvider> {
        Arc::new(LocalProvider::new(root, NodeId::random()).unwrap())
    }

    fn manager_with(
        strategy: Strategy,
        providers: Vec<Arc<dyn StorageProvider>>,
        events: EventBus,
    ) -> StorageManager {
        StorageManager::new(strategy, providers, 256, 64, events).unwrap()
    }

    #[test]
    fn empty_provider_list_is_a_configuration_error() {
        let result = StorageManager::new(Strategy::Hybrid, vec![], 256, 64, EventBus::new());
        assert!(matches!(result, Err(LodestoreError::NoProviders(_))));
    }

    #[tokio::test]
    async fn store_retrieve_round_trip_local_only() {
        let root = temp_root("rt");
        let manager = manager_with(Strategy::LocalOnly, vec![local(&root)], EventBus::new());
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();

        let meta = manager.store(&data, StoreOptions::default()).await.unwrap();
        assert_eq!(meta.size, 2000);
        assert_eq!(manager.retrieve(&meta.id).await.unwrap(), data);
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn unknown_artifact_is_not_found() {
        let root = temp_root("nf");
        let manager = manager_with(Strategy::LocalOnly, vec![local(&root)], EventBus::new());
        assert!(matches!(
            manager.retrieve("no-such-artifact").await,
            Err(LodestoreError::NotFound(_))
        ));
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn hybrid_store_replicates_to_secondary() {
        let (root_a, root_b) = (temp_root("hyb-a"), temp_root("hyb-b"));
        let events = EventBus::new();
        let replicated = Arc::new(AtomicUsize::new(0));
        let counter = replicated.clone();
        events.subscribe(EventKind::Replicated, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let secondary = local(&root_b);
        let manager = manager_with(
            Strategy::Hybrid,
            vec![local(&root_a), secondary.clone()],
            events,
        );
        let meta = manager
            .store(&[9u8; 1024], StoreOptions::default())
            .await
            .unwrap();

        // Replication is asynchronous; wait for it to land.
        for _ in 0..50 {
            if replicated.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(replicated.load(Ordering::SeqCst), 1);
        assert_eq!(secondary.retrieve(&meta.id).await.unwrap(), vec![9u8; 1024]);
        std::fs::remove_dir_all(&root_a).ok();
        std::fs::remove_dir_all(&root_b).ok();
    }

    #[tokio::test]
    async fn corrupt_primary_fails_over_to_intact_secondary() {
        let (root_a, root_b) = (temp_root("fo-a"), temp_root("fo-b"));
        let events = EventBus::new();
        let retrieved_from = Arc::new(Mutex::new(String::new()));
        let tag = retrieved_from.clone();
        events.subscribe(EventKind::Retrieved, move |event| {
            if let NodeEvent::Retrieved { provider, .. } = event {
                *tag.lock().unwrap() = provider.clone();
            }
        });

        let manager = manager_with(
            Strategy::Hybrid,
            vec![local(&root_a), local(&root_b)],
            events,
        );
        let data = vec![5u8; 1500];
        let meta = manager.store(&data, StoreOptions::default()).await.unwrap();

        // Wait for the secondary replica, then corrupt the primary copy.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let chunk0 = root_a.join("chunks").join(&meta.id).join("0");
        let mut bytes = std::fs::read(&chunk0).unwrap();
        bytes[0] ^= 0xFF;
        std::fs::write(&chunk0, &bytes).unwrap();

        assert!(!manager.validate_checksum(&meta.id).await.unwrap());
        assert_eq!(manager.retrieve(&meta.id).await.unwrap(), data);
        assert_eq!(retrieved_from.lock().unwrap().as_str(), "local");
        std::fs::remove_dir_all(&root_a).ok();
        std::fs::remove_dir_all(&root_b).ok();
    }

    #[tokio::test]
    async fn corruption_everywhere_surfaces_chunk_validation() {
        let root = temp_root("all-bad");
        let manager = manager_with(Strategy::LocalOnly, vec![local(&root)], EventBus::new());
        let meta = manager
            .store(&[3u8; 600], StoreOptions::default())
            .await
            .unwrap();

        let chunk0 = root.join("chunks").join(&meta.id).join("1");
        std::fs::write(&chunk0, b"garbage").unwrap();
        assert!(matches!(
            manager.retrieve(&meta.id).await,
            Err(LodestoreError::ChunkValidation(_))
        ));
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn delete_succeeds_when_any_provider_removes() {
        let (root_a, root_b) = (temp_root("del-a"), temp_root("del-b"));
        let events = EventBus::new();
        let deleted = Arc::new(AtomicUsize::new(0));
        let counter = deleted.clone();
        events.subscribe(EventKind::Deleted, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let manager = manager_with(
            Strategy::Hybrid,
            vec![local(&root_a), local(&root_b)],
            events,
        );
        let meta = manager
            .store(&[1u8; 64], StoreOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(manager.delete(&meta.id).await.unwrap());
        assert_eq!(deleted.load(Ordering::SeqCst), 1);
        assert!(!manager.delete(&meta.id).await.unwrap());
        assert!(matches!(
            manager.retrieve(&meta.id).await,
            Err(LodestoreError::NotFound(_))
        ));
        std::fs::remove_dir_all(&root_a).ok();
        std::fs::remove_dir_all(&root_b).ok();
    }

    #[tokio::test]
    async fn metadata_cache_serves_after_provider_loss() {
        let root = temp_root("cache");
        let manager = manager_with(Strategy::LocalOnly, vec![local(&root)], EventBus::new());
        let meta = manager
            .store(&[8u8; 128], StoreOptions::default())
            .await
            .unwrap();

        // Wipe the backing store; the cache still answers metadata reads.
        std::fs::remove_dir_all(&root).unwrap();
        let cached = manager.get_metadata(&meta.id).await.unwrap();
        assert_eq!(cached.checksum, meta.checksum);
    }

    #[tokio::test]
    async fn update_metadata_patches_and_caches() {
        let root = temp_root("patch");
        let manager = manager_with(Strategy::LocalOnly, vec![local(&root)], EventBus::new());
        let meta = manager
            .store(&[4u8; 64], StoreOptions::default())
            .await
            .unwrap();

        let patched = manager
            .update_metadata(
                &meta.id,
                MetadataPatch {
                    replicas: Some(7),
                    storage_type: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(patched.replicas, 7);
        assert_eq!(manager.get_metadata(&meta.id).await.unwrap().replicas, 7);
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn stats_aggregate_per_provider() {
        let root = temp_root("stats");
        let manager = manager_with(Strategy::LocalOnly, vec![local(&root)], EventBus::new());
        manager
            .store(&[2u8; 512], StoreOptions::default())
            .await
            .unwrap();
        let stats = manager.stats().await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].0, StorageType::Local);
        assert_eq!(stats[0].1.artifacts, 1);
        std::fs::remove_dir_all(&root).ok();
    }
}

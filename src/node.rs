//! # High-level node API
//!
//! [`Node`] wires the components into one lifecycle: identity, DHT,
//! storage providers, manager, and publisher. Build one with
//! [`NodeBuilder`], `start` it, and use the typed operations:
//!
//! ```ignore
//! let node = Node::builder()
//!     .config(config)
//!     .build();
//! node.start().await?;
//!
//! let record = node
//!     .publish_content(&bytes, PublishMeta::default(), StoreOptions::default())
//!     .await?;
//! let (bytes, _) = node.retrieve_content(&record.metadata.id).await?;
//!
//! node.stop().await?;
//! ```
//!
//! Node identity and the storage root are initialised once at `start` and
//! immutable until `stop`; every other piece of state lives inside the
//! component actors. `start` on a running node is `AlreadyRunning`; any
//! operation on a stopped node is `NotRunning`.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::chunk::ArtifactMetadata;
use crate::config::{NodeConfig, Strategy};
use crate::dht::{spawn_message_server, Dht, DhtStats};
use crate::error::{LodestoreError, Result};
use crate::events::{EventBus, EventKind, NodeEvent};
use crate::identity::{load_or_generate_identity, Contact, Key, NodeId};
use crate::provider::{
    LocalProvider, NetworkProvider, P2pProvider, ProviderStats, StorageProvider, StoreOptions,
};
use crate::publisher::{ContentPublisher, ContentRecord, PublishMeta, VersionInfo};
use crate::storage::StorageManager;
use crate::transport::{dial_with_backoff, ChunkTransfer, MemoryHub, Transport, WireClient};
use crate::chunk::StorageType;

/// Everything that exists only while the node runs.
struct Running {
    contact: Contact,
    dht: Dht,
    storage: Arc<StorageManager>,
    publisher: Arc<ContentPublisher>,
    transport: Arc<dyn Transport>,
}

pub struct Node {
    config: NodeConfig,
    events: EventBus,
    hub: Arc<MemoryHub>,
    bootstrap: Vec<Contact>,
    running: Mutex<Option<Running>>,
}

#[derive(Default)]
pub struct NodeBuilder {
    config: Option<NodeConfig>,
    hub: Option<Arc<MemoryHub>>,
    bootstrap: Vec<Contact>,
}

impl NodeBuilder {
    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Attach to a shared in-process hub so multiple nodes form a network.
    /// Without one, the node gets a private hub (single-node operation).
    pub fn memory_hub(mut self, hub: Arc<MemoryHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Seed contacts dialed at `start`.
    pub fn bootstrap(mut self, seeds: Vec<Contact>) -> Self {
        self.bootstrap = seeds;
        self
    }

    pub fn build(self) -> Node {
        Node {
            config: self.config.unwrap_or_default(),
            events: EventBus::new(),
            hub: self.hub.unwrap_or_else(MemoryHub::new),
            bootstrap: self.bootstrap,
            running: Mutex::new(None),
        }
    }
}

impl Node {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::default()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Register an event handler. Usable before `start`; subscriptions
    /// survive restarts.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&NodeEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(kind, handler);
    }

    /// Bring the node up: load identity, bind transport, start the DHT and
    /// storage stack, dial bootstrap seeds.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(LodestoreError::AlreadyRunning);
        }

        let (id, keypair) =
            load_or_generate_identity(&self.config.storage_root, self.config.sign_envelopes)?;
        let contact = Contact::single(id, self.config.listen_addr.clone());

        let transport = Arc::new(self.hub.register(contact.clone()));
        let incoming = transport
            .take_incoming()
            .ok_or_else(|| LodestoreError::InvalidMessage("transport already bound".into()))?;
        let transport_dyn: Arc<dyn Transport> = transport.clone();
        let chunk_transfer: Arc<dyn ChunkTransfer> = transport.clone();

        let rpc = Arc::new(WireClient::new(
            transport_dyn.clone(),
            contact.clone(),
            self.events.clone(),
        ));
        let dht = Dht::new(
            contact.clone(),
            rpc,
            keypair,
            self.config.clone(),
            self.events.clone(),
        );
        spawn_message_server(dht.clone(), incoming);

        let providers = self.build_providers(&dht, chunk_transfer)?;
        let storage = Arc::new(StorageManager::new(
            self.config.strategy,
            providers,
            self.config.chunk_size,
            self.config.metadata_cache_size,
            self.events.clone(),
        )?);
        let publisher = Arc::new(ContentPublisher::new(
            dht.clone(),
            storage.clone(),
            self.events.clone(),
            self.config.index_cap,
            self.config.stale_after.as_millis() as u64,
        ));

        for seed in &self.bootstrap {
            // Confirm reachability (retry with backoff across the seed's
            // endpoints) before spending a lookup on it.
            let seed = match dial_with_backoff(
                &transport_dyn,
                &seed.addrs,
                std::time::Duration::from_millis(100),
            )
            .await
            {
                Ok(contact) => contact,
                Err(err) => {
                    debug!(seed = %seed.id, error = %err, "bootstrap seed unreachable");
                    continue;
                }
            };
            match dht.bootstrap(seed.clone()).await {
                Ok(found) => debug!(seed = %seed.id, found = found.len(), "bootstrap complete"),
                Err(err) => debug!(seed = %seed.id, error = %err, "bootstrap failed"),
            }
        }

        *running = Some(Running {
            contact: contact.clone(),
            dht,
            storage,
            publisher,
            transport: transport_dyn,
        });
        drop(running);

        info!(id = %id, strategy = self.config.strategy.as_str(), "node started");
        self.events.emit(NodeEvent::Started { node_id: id });
        Ok(())
    }

    /// Graceful drain: no new operations are accepted, the DHT actor and
    /// maintenance tasks wind down, the transport deregisters.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(state) = running.take() else {
            return Err(LodestoreError::NotRunning);
        };
        let id = state.contact.id;
        state.dht.quit().await;
        state.transport.close().await;
        drop(running);

        info!(id = %id, "node stopped");
        self.events.emit(NodeEvent::Stopped { node_id: id });
        Ok(())
    }

    fn build_providers(
        &self,
        dht: &Dht,
        chunk_transfer: Arc<dyn ChunkTransfer>,
    ) -> Result<Vec<Arc<dyn StorageProvider>>> {
        let root = &self.config.storage_root;
        let local = || -> Result<Arc<dyn StorageProvider>> {
            Ok(Arc::new(LocalProvider::new(root, dht.id())?))
        };
        let network = || -> Arc<dyn StorageProvider> {
            Arc::new(NetworkProvider::new(
                dht.clone(),
                chunk_transfer.clone(),
                self.config.min_replicas,
            ))
        };
        let p2p = || -> Result<Arc<dyn StorageProvider>> {
            let provider = P2pProvider::new(
                dht.clone(),
                chunk_transfer.clone(),
                root,
                self.config.announce_interval,
                self.config.stale_after,
            )?;
            Ok(provider)
        };

        Ok(match self.config.strategy {
            Strategy::LocalOnly => vec![local()?],
            Strategy::NetworkOnly => vec![network()],
            Strategy::P2pOnly => vec![p2p()?],
            Strategy::Hybrid => vec![local()?, network(), p2p()?],
        })
    }

    async fn with_running<T>(
        &self,
        f: impl FnOnce(&Running) -> T,
    ) -> Result<T> {
        let running = self.running.lock().await;
        match running.as_ref() {
            Some(state) => Ok(f(state)),
            None => Err(LodestoreError::NotRunning),
        }
    }

    pub async fn id(&self) -> Result<NodeId> {
        self.with_running(|state| state.contact.id).await
    }

    pub async fn contact(&self) -> Result<Contact> {
        self.with_running(|state| state.contact.clone()).await
    }

    pub async fn dht_stats(&self) -> Result<DhtStats> {
        let dht = self.with_running(|state| state.dht.clone()).await?;
        Ok(dht.stats().await)
    }

    pub async fn storage_stats(&self) -> Result<Vec<(StorageType, ProviderStats)>> {
        let storage = self.with_running(|state| state.storage.clone()).await?;
        Ok(storage.stats().await)
    }

    // ------------------------------------------------------------------
    // Generic DHT key/value surface
    // ------------------------------------------------------------------

    /// Store a JSON payload under a string key (hashed into the id space).
    /// Returns the count of acknowledged remote replicas.
    pub async fn put(&self, key: &str, value: JsonValue) -> Result<usize> {
        let dht = self.with_running(|state| state.dht.clone()).await?;
        dht.put_named(key, value).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<JsonValue>> {
        let dht = self.with_running(|state| state.dht.clone()).await?;
        dht.get_named(key).await
    }

    pub async fn delete(&self, key: &str) -> Result<usize> {
        let dht = self.with_running(|state| state.dht.clone()).await?;
        dht.delete_named(key).await
    }

    /// The k closest known peers to a key, via iterative lookup.
    pub async fn find_closest(&self, key: &str) -> Result<Vec<Contact>> {
        let dht = self.with_running(|state| state.dht.clone()).await?;
        dht.iterative_find_node(Key::for_name(key)).await
    }

    pub async fn add_peer(&self, contact: Contact) -> Result<()> {
        let dht = self.with_running(|state| state.dht.clone()).await?;
        dht.observe_contact(contact).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Content surface
    // ------------------------------------------------------------------

    /// Chunk, place, and advertise an artifact. The returned record's
    /// `metadata.id` is the retrieval handle.
    pub async fn publish_content(
        &self,
        bytes: &[u8],
        meta: PublishMeta,
        options: StoreOptions,
    ) -> Result<ContentRecord> {
        let publisher = self.with_running(|state| state.publisher.clone()).await?;
        publisher.publish(bytes, meta, options).await
    }

    /// Fetch an artifact's bytes and content record, verified end to end.
    pub async fn retrieve_content(&self, id: &str) -> Result<(Vec<u8>, ContentRecord)> {
        let publisher = self.with_running(|state| state.publisher.clone()).await?;
        publisher.retrieve(id).await
    }

    /// Best-effort removal across providers plus record tombstone.
    pub async fn delete_content(&self, id: &str) -> Result<bool> {
        let publisher = self.with_running(|state| state.publisher.clone()).await?;
        publisher.unpublish(id).await
    }

    pub async fn get_content_metadata(&self, id: &str) -> Result<ArtifactMetadata> {
        let storage = self.with_running(|state| state.storage.clone()).await?;
        storage.get_metadata(id).await
    }

    pub async fn validate_content(&self, id: &str) -> Result<bool> {
        let storage = self.with_running(|state| state.storage.clone()).await?;
        storage.validate_checksum(id).await
    }

    pub async fn record_version(
        &self,
        artifact_id: &str,
        version: &str,
        note: Option<String>,
    ) -> Result<VersionInfo> {
        let publisher = self.with_running(|state| state.publisher.clone()).await?;
        publisher.record_version(artifact_id, version, note).await
    }

    pub async fn list_versions(&self, artifact_id: &str) -> Result<Vec<VersionInfo>> {
        let publisher = self.with_running(|state| state.publisher.clone()).await?;
        publisher.list_versions(artifact_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::now_ms;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("lodestore-node-test")
            .join(format!("{tag}-{}", now_ms()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn local_node(root: &PathBuf) -> Node {
        let mut config = NodeConfig::for_tests(root.clone());
        config.strategy = Strategy::LocalOnly;
        config.refresh_interval = std::time::Duration::from_secs(3600);
        config.republish_interval = std::time::Duration::from_secs(3600);
        Node::builder().config(config).build()
    }

    #[tokio::test]
    async fn lifecycle_guards_operations() {
        let root = temp_root("lifecycle");
        let node = local_node(&root);

        // Operations before start are rejected.
        assert!(matches!(
            node.get("anything").await,
            Err(LodestoreError::NotRunning)
        ));
        assert!(matches!(node.stop().await, Err(LodestoreError::NotRunning)));

        node.start().await.unwrap();
        assert!(matches!(
            node.start().await,
            Err(LodestoreError::AlreadyRunning)
        ));

        node.stop().await.unwrap();
        assert!(matches!(
            node.get("anything").await,
            Err(LodestoreError::NotRunning)
        ));
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn started_and_stopped_events_fire() {
        let root = temp_root("events");
        let node = local_node(&root);
        let fired = Arc::new(AtomicUsize::new(0));
        for kind in [EventKind::Started, EventKind::Stopped] {
            let counter = fired.clone();
            node.subscribe(kind, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        node.start().await.unwrap();
        node.stop().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn identity_survives_restart() {
        let root = temp_root("restart");
        let node = local_node(&root);
        node.start().await.unwrap();
        let first = node.id().await.unwrap();
        node.stop().await.unwrap();

        node.start().await.unwrap();
        assert_eq!(node.id().await.unwrap(), first);
        node.stop().await.unwrap();
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn single_node_publish_retrieve() {
        let root = temp_root("publish");
        let node = local_node(&root);
        node.start().await.unwrap();

        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        let record = node
            .publish_content(&data, PublishMeta::default(), StoreOptions::default())
            .await
            .unwrap();
        let (bytes, fetched) = node.retrieve_content(&record.metadata.id).await.unwrap();
        assert_eq!(bytes, data);
        assert_eq!(fetched.metadata.checksum, record.metadata.checksum);

        node.stop().await.unwrap();
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn generic_put_get_delete() {
        let root = temp_root("kv");
        let node = local_node(&root);
        node.start().await.unwrap();

        node.put("registry:abc", serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(
            node.get("registry:abc").await.unwrap(),
            Some(serde_json::json!({"x": 1}))
        );
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        node.delete("registry:abc").await.unwrap();
        assert_eq!(node.get("registry:abc").await.unwrap(), None);

        node.stop().await.unwrap();
        std::fs::remove_dir_all(&root).ok();
    }
}

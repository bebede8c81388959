//! # Content publisher
//!
//! Binds artifact-level metadata to its chunk set and makes it
//! discoverable:
//!
//! 1. the storage manager places the chunks per strategy
//! 2. a [`ContentRecord`] (metadata + provider list + stats) lands at
//!    `content:<artifact_id>`
//! 3. discovery index keys are written: a direct marker per id plus capped
//!    entry arrays per type / tag / region / metadata field
//! 4. version history lives at `versions:<artifact_id>`
//!
//! Index arrays are idempotent append-with-dedup, sorted by
//! `(score desc, ts desc)` and truncated at the configured cap, so a
//! republish never duplicates entries and hot keys cannot grow without
//! bound.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::chunk::ArtifactMetadata;
use crate::dht::Dht;
use crate::error::{LodestoreError, Result};
use crate::events::{EventBus, NodeEvent};
use crate::identity::{now_ms, Contact, NodeId};
use crate::provider::StoreOptions;
use crate::storage::StorageManager;

/// Longest accepted version string.
const MAX_VERSION_LEN: usize = 64;

/// Semantic description attached at publish time.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PublishMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form key/value fields, indexed under `index:metadata:<f>:<v>`.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Discovery ranking score.
    #[serde(default)]
    pub score: f64,
}

/// One advertised holder of an artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub last_seen: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ContentStats {
    pub total_downloads: u64,
    pub active_providers: u32,
    pub total_size: u64,
    pub reliability: f64,
}

/// Artifact metadata plus the provider set and usage stats; the value at
/// `content:<artifact_id>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentRecord {
    pub metadata: ArtifactMetadata,
    #[serde(default)]
    pub publish: PublishMeta,
    pub providers: Vec<ProviderEntry>,
    pub stats: ContentStats,
    pub created: u64,
}

impl ContentRecord {
    /// Append-with-dedup: re-adding a known provider refreshes its entry.
    pub fn add_provider(&mut self, entry: ProviderEntry) {
        match self
            .providers
            .iter_mut()
            .find(|p| p.node_id == entry.node_id)
        {
            Some(existing) => *existing = entry,
            None => self.providers.push(entry),
        }
        self.stats.active_providers = self.providers.len() as u32;
    }

    pub fn touch_provider(&mut self, node_id: &NodeId) {
        if let Some(entry) = self.providers.iter_mut().find(|p| p.node_id == *node_id) {
            entry.last_seen = now_ms();
        }
    }

    /// Drop providers not seen within the staleness horizon.
    pub fn prune_stale_providers(&mut self, stale_after_ms: u64) -> usize {
        let cutoff = now_ms().saturating_sub(stale_after_ms);
        let before = self.providers.len();
        self.providers.retain(|p| p.last_seen >= cutoff);
        self.stats.active_providers = self.providers.len() as u32;
        before - self.providers.len()
    }
}

/// Entry in a discovery index array.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub score: f64,
    pub ts: u64,
}

/// One recorded version of an artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub artifact_id: String,
    pub ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

pub struct ContentPublisher {
    dht: Dht,
    storage: Arc<StorageManager>,
    self_contact: Contact,
    events: EventBus,
    index_cap: usize,
    stale_after_ms: u64,
}

impl ContentPublisher {
    pub fn new(
        dht: Dht,
        storage: Arc<StorageManager>,
        events: EventBus,
        index_cap: usize,
        stale_after_ms: u64,
    ) -> Self {
        Self {
            self_contact: dht.contact(),
            dht,
            storage,
            events,
            index_cap: index_cap.max(1),
            stale_after_ms,
        }
    }

    fn content_key(id: &str) -> String {
        format!("content:{id}")
    }

    fn versions_key(id: &str) -> String {
        format!("versions:{id}")
    }

    /// Chunk, place, record, and index an artifact. Returns the published
    /// record; its `metadata.id` is the handle for retrieval.
    pub async fn publish(
        &self,
        bytes: &[u8],
        publish: PublishMeta,
        options: StoreOptions,
    ) -> Result<ContentRecord> {
        let metadata = self.storage.store(bytes, options).await?;
        let id = metadata.id.clone();

        let record = ContentRecord {
            stats: ContentStats {
                total_downloads: 0,
                active_providers: 1,
                total_size: metadata.size,
                reliability: 1.0,
            },
            providers: vec![ProviderEntry {
                node_id: self.self_contact.id,
                endpoint: self.self_contact.primary_addr().map(String::from),
                region: publish.region.clone(),
                last_seen: now_ms(),
            }],
            created: now_ms(),
            publish,
            metadata,
        };

        self.dht
            .put_named(&Self::content_key(&id), serde_json::to_value(&record)?)
            .await?;
        self.write_indexes(&record).await;

        self.events.emit(NodeEvent::ContentPublished {
            id: id.clone(),
            size: record.metadata.size,
            chunks: record.metadata.chunks.len(),
        });
        debug!(id = %id, size = record.metadata.size, "content published");
        Ok(record)
    }

    /// Fetch bytes and record for an artifact; bumps download stats and
    /// refreshes our provider entry best-effort.
    pub async fn retrieve(&self, id: &str) -> Result<(Vec<u8>, ContentRecord)> {
        let mut record = self.get_record(id).await?;
        let bytes = self.storage.retrieve(id).await?;

        record.stats.total_downloads += 1;
        record.touch_provider(&self.self_contact.id);
        record.prune_stale_providers(self.stale_after_ms);
        if let Ok(value) = serde_json::to_value(&record) {
            if let Err(err) = self.dht.put_named(&Self::content_key(id), value).await {
                warn!(id, error = %err, "stats update failed");
            }
        }
        Ok((bytes, record))
    }

    pub async fn get_record(&self, id: &str) -> Result<ContentRecord> {
        let value = self
            .dht
            .get_named(&Self::content_key(id))
            .await?
            .ok_or_else(|| LodestoreError::NotFound(format!("content record {id}")))?;
        serde_json::from_value(value)
            .map_err(|e| LodestoreError::InvalidMetadata(format!("content record {id}: {e}")))
    }

    /// Remove the artifact from storage and tombstone its record.
    pub async fn unpublish(&self, id: &str) -> Result<bool> {
        let removed = self.storage.delete(id).await?;
        self.dht.delete_named(&Self::content_key(id)).await?;
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Discovery indexes
    // ------------------------------------------------------------------

    async fn write_indexes(&self, record: &ContentRecord) {
        let id = &record.metadata.id;
        let entry = IndexEntry {
            id: id.clone(),
            score: record.publish.score,
            ts: now_ms(),
        };

        let mut keys: Vec<(String, String)> = Vec::new();
        if let Some(content_type) = &record.publish.content_type {
            keys.push((format!("index:type:{content_type}"), format!("index:type:{content_type}:{id}")));
        }
        if let Some(region) = &record.publish.region {
            keys.push((format!("index:region:{region}"), format!("index:region:{region}:{id}")));
        }
        for tag in &record.publish.tags {
            keys.push((format!("index:tag:{tag}"), format!("index:tag:{tag}:{id}")));
        }
        for (field, value) in &record.publish.fields {
            keys.push((
                format!("index:metadata:{field}:{value}"),
                format!("index:metadata:{field}:{value}:{id}"),
            ));
        }

        for (array_key, marker_key) in keys {
            if let Err(err) = self.append_index_entry(&array_key, entry.clone()).await {
                warn!(key = %array_key, error = %err, "index append failed");
            }
            // Direct marker so a known (facet, id) pair resolves without
            // scanning the array.
            if let Err(err) = self
                .dht
                .put_named(&marker_key, serde_json::Value::String(id.clone()))
                .await
            {
                warn!(key = %marker_key, error = %err, "index marker write failed");
            }
        }
    }

    /// Idempotent capped append: dedup by id, sort `(score desc, ts desc)`,
    /// truncate to the cap.
    pub async fn append_index_entry(&self, key_name: &str, entry: IndexEntry) -> Result<usize> {
        let mut entries: Vec<IndexEntry> = match self.dht.get_named(key_name).await? {
            Some(value) => serde_json::from_value(value).unwrap_or_default(),
            None => Vec::new(),
        };
        entries.retain(|e| e.id != entry.id);
        entries.push(entry);
        entries.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.ts.cmp(&a.ts))
        });
        entries.truncate(self.index_cap);
        let len = entries.len();
        self.dht
            .put_named(key_name, serde_json::to_value(&entries)?)
            .await?;
        Ok(len)
    }

    pub async fn read_index(&self, key_name: &str) -> Result<Vec<IndexEntry>> {
        match self.dht.get_named(key_name).await? {
            Some(value) => Ok(serde_json::from_value(value).unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    // ------------------------------------------------------------------
    // Versions
    // ------------------------------------------------------------------

    /// Append a version to `versions:<artifact_id>`. Duplicate version
    /// strings are `VersionExists`; empty or oversized ones are
    /// `InvalidVersion`.
    pub async fn record_version(
        &self,
        artifact_id: &str,
        version: &str,
        note: Option<String>,
    ) -> Result<VersionInfo> {
        let trimmed = version.trim();
        if trimmed.is_empty() || trimmed.len() > MAX_VERSION_LEN {
            return Err(LodestoreError::InvalidVersion(version.to_string()));
        }

        let key = Self::versions_key(artifact_id);
        let mut versions: Vec<VersionInfo> = match self.dht.get_named(&key).await? {
            Some(value) => serde_json::from_value(value).unwrap_or_default(),
            None => Vec::new(),
        };
        if versions.iter().any(|v| v.version == trimmed) {
            return Err(LodestoreError::VersionExists(trimmed.to_string()));
        }

        let info = VersionInfo {
            version: trimmed.to_string(),
            artifact_id: artifact_id.to_string(),
            ts: now_ms(),
            note,
        };
        versions.push(info.clone());
        self.dht
            .put_named(&key, serde_json::to_value(&versions)?)
            .await?;
        self.events.emit(NodeEvent::VersionCreated {
            id: artifact_id.to_string(),
            version: info.version.clone(),
        });
        Ok(info)
    }

    /// Ordered version history, oldest first.
    pub async fn list_versions(&self, artifact_id: &str) -> Result<Vec<VersionInfo>> {
        match self.dht.get_named(&Self::versions_key(artifact_id)).await? {
            Some(value) => Ok(serde_json::from_value(value).unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, Strategy};
    use crate::events::EventKind;
    use crate::identity::Key;
    use crate::messages::ValueEnvelope;
    use crate::provider::{LocalProvider, StorageProvider};
    use crate::transport::DhtRpc;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Single-node network: every RPC fails, so DHT writes stay local.
    struct LoopbackRpc;

    #[async_trait]
    impl DhtRpc for LoopbackRpc {
        async fn find_node(&self, to: &Contact, _target: Key) -> crate::error::Result<Vec<Contact>> {
            Err(LodestoreError::PeerUnreachable(to.id.to_string()))
        }
        async fn find_value(
            &self,
            to: &Contact,
            _key: Key,
        ) -> crate::error::Result<(Option<ValueEnvelope>, Vec<Contact>)> {
            Err(LodestoreError::PeerUnreachable(to.id.to_string()))
        }
        async fn store(
            &self,
            to: &Contact,
            _key: Key,
            _value: ValueEnvelope,
        ) -> crate::error::Result<bool> {
            Err(LodestoreError::PeerUnreachable(to.id.to_string()))
        }
        async fn ping(&self, to: &Contact) -> crate::error::Result<()> {
            Err(LodestoreError::PeerUnreachable(to.id.to_string()))
        }
    }

    fn temp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("lodestore-publisher-test")
            .join(format!("{tag}-{}", now_ms()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn single_node_publisher(root: &PathBuf, index_cap: usize) -> (ContentPublisher, EventBus) {
        let mut config = NodeConfig::for_tests(root.clone());
        config.refresh_interval = std::time::Duration::from_secs(3600);
        config.republish_interval = std::time::Duration::from_secs(3600);
        let events = EventBus::new();
        let contact = Contact::single(NodeId::random(), "127.0.0.1:4100");
        let dht = Dht::new(
            contact,
            Arc::new(LoopbackRpc),
            None,
            config,
            events.clone(),
        );
        let provider: Arc<dyn StorageProvider> =
            Arc::new(LocalProvider::new(root, dht.id()).unwrap());
        let storage = Arc::new(
            StorageManager::new(Strategy::LocalOnly, vec![provider], 256, 64, events.clone())
                .unwrap(),
        );
        let publisher = ContentPublisher::new(dht, storage, events.clone(), index_cap, 3_600_000);
        (publisher, events)
    }

    fn meta_with(content_type: &str, tags: &[&str]) -> PublishMeta {
        PublishMeta {
            name: Some("weights".into()),
            content_type: Some(content_type.into()),
            region: Some("eu-west".into()),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            fields: BTreeMap::new(),
            score: 1.0,
        }
    }

    #[tokio::test]
    async fn publish_retrieve_round_trip_with_record() {
        let root = temp_root("pub-rt");
        let (publisher, events) = single_node_publisher(&root, 1000);
        let published_events = Arc::new(AtomicUsize::new(0));
        let counter = published_events.clone();
        events.subscribe(EventKind::ContentPublished, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let data: Vec<u8> = (0..5000u32).map(|i| (i % 200) as u8).collect();
        let record = publisher
            .publish(&data, meta_with("dataset", &["vision"]), StoreOptions::default())
            .await
            .unwrap();
        assert_eq!(record.metadata.size, 5000);
        assert_eq!(record.providers.len(), 1);
        assert_eq!(record.stats.total_downloads, 0);
        assert_eq!(published_events.load(Ordering::SeqCst), 1);

        let (bytes, fetched) = publisher.retrieve(&record.metadata.id).await.unwrap();
        assert_eq!(bytes, data);
        assert_eq!(fetched.stats.total_downloads, 1);

        // Download counter accumulates across retrievals.
        let (_, fetched) = publisher.retrieve(&record.metadata.id).await.unwrap();
        assert_eq!(fetched.stats.total_downloads, 2);
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn retrieve_unknown_id_is_not_found() {
        let root = temp_root("pub-nf");
        let (publisher, _) = single_node_publisher(&root, 1000);
        assert!(matches!(
            publisher.retrieve("missing").await,
            Err(LodestoreError::NotFound(_))
        ));
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn index_arrays_are_deduped_sorted_and_capped() {
        let root = temp_root("pub-idx");
        let (publisher, _) = single_node_publisher(&root, 5);

        for i in 0..8u32 {
            let entry = IndexEntry {
                id: format!("artifact-{i}"),
                score: i as f64,
                ts: 1000 + i as u64,
            };
            publisher
                .append_index_entry("index:type:dataset", entry)
                .await
                .unwrap();
        }
        let entries = publisher.read_index("index:type:dataset").await.unwrap();
        assert_eq!(entries.len(), 5, "cap must hold");
        assert_eq!(entries[0].id, "artifact-7", "highest score first");
        for pair in entries.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }

        // Re-appending an existing id replaces rather than duplicates.
        publisher
            .append_index_entry(
                "index:type:dataset",
                IndexEntry {
                    id: "artifact-7".into(),
                    score: 100.0,
                    ts: 9999,
                },
            )
            .await
            .unwrap();
        let entries = publisher.read_index("index:type:dataset").await.unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries.iter().filter(|e| e.id == "artifact-7").count(), 1);
        assert_eq!(entries[0].score, 100.0);
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn publish_writes_type_tag_and_region_indexes() {
        let root = temp_root("pub-keys");
        let (publisher, _) = single_node_publisher(&root, 1000);
        let record = publisher
            .publish(
                &[1u8; 400],
                meta_with("model", &["nlp", "large"]),
                StoreOptions::default(),
            )
            .await
            .unwrap();
        let id = &record.metadata.id;

        for key in [
            "index:type:model".to_string(),
            "index:tag:nlp".to_string(),
            "index:tag:large".to_string(),
            "index:region:eu-west".to_string(),
        ] {
            let entries = publisher.read_index(&key).await.unwrap();
            assert!(
                entries.iter().any(|e| e.id == *id),
                "expected {id} under {key}"
            );
        }
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn versions_append_reject_duplicates_and_garbage() {
        let root = temp_root("pub-ver");
        let (publisher, events) = single_node_publisher(&root, 1000);
        let version_events = Arc::new(Mutex::new(Vec::new()));
        let sink = version_events.clone();
        events.subscribe(EventKind::VersionCreated, move |event| {
            if let NodeEvent::VersionCreated { version, .. } = event {
                sink.lock().unwrap().push(version.clone());
            }
        });

        publisher
            .record_version("art-1", "v1.0", None)
            .await
            .unwrap();
        publisher
            .record_version("art-1", "v1.1", Some("bugfix".into()))
            .await
            .unwrap();

        assert!(matches!(
            publisher.record_version("art-1", "v1.0", None).await,
            Err(LodestoreError::VersionExists(_))
        ));
        assert!(matches!(
            publisher.record_version("art-1", "  ", None).await,
            Err(LodestoreError::InvalidVersion(_))
        ));
        assert!(matches!(
            publisher
                .record_version("art-1", &"x".repeat(100), None)
                .await,
            Err(LodestoreError::InvalidVersion(_))
        ));

        let versions = publisher.list_versions("art-1").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version, "v1.0");
        assert_eq!(versions[1].version, "v1.1");
        assert_eq!(*version_events.lock().unwrap(), vec!["v1.0", "v1.1"]);
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn unpublish_removes_bytes_and_record() {
        let root = temp_root("pub-del");
        let (publisher, _) = single_node_publisher(&root, 1000);
        let record = publisher
            .publish(&[7u8; 300], PublishMeta::default(), StoreOptions::default())
            .await
            .unwrap();
        let id = record.metadata.id.clone();

        assert!(publisher.unpublish(&id).await.unwrap());
        assert!(matches!(
            publisher.retrieve(&id).await,
            Err(LodestoreError::NotFound(_))
        ));
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn provider_list_dedups_and_prunes() {
        let mut record = ContentRecord {
            metadata: crate::chunk::ArtifactMetadata {
                id: "a".into(),
                size: 0,
                chunks: vec![],
                created: 0,
                modified: 0,
                checksum: crate::chunk::sha256_hex(b""),
                storage_type: crate::chunk::StorageType::Local,
                replicas: 1,
                encryption_info: None,
                compression_info: None,
            },
            publish: PublishMeta::default(),
            providers: vec![],
            stats: ContentStats::default(),
            created: now_ms(),
        };

        let node = NodeId::from_bytes([1; 32]);
        record.add_provider(ProviderEntry {
            node_id: node,
            endpoint: None,
            region: None,
            last_seen: now_ms(),
        });
        record.add_provider(ProviderEntry {
            node_id: node,
            endpoint: Some("10.0.0.1:1".into()),
            region: None,
            last_seen: now_ms(),
        });
        assert_eq!(record.providers.len(), 1, "append-with-dedup");
        assert_eq!(record.stats.active_providers, 1);

        record.add_provider(ProviderEntry {
            node_id: NodeId::from_bytes([2; 32]),
            endpoint: None,
            region: None,
            last_seen: now_ms() - 10_000_000,
        });
        assert_eq!(record.prune_stale_providers(3_600_000), 1);
        assert_eq!(record.providers.len(), 1);
    }
}

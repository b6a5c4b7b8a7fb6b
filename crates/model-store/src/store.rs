//! Versioned global model store

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rulefed_core::{
    codec_by_name, Error, GlobalModel, ModelCodecHandle, ModelVersion, Result, RuleModel,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use storage::StorageHandle;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument};

use crate::record::ModelRecord;

const CURRENT_PATH: &str = "CURRENT";
const VERSIONS_PREFIX: &str = "versions/";

fn record_path(version: ModelVersion) -> String {
    format!("{}v{:010}.rgm", VERSIONS_PREFIX, version)
}

fn parse_record_path(path: &str) -> Option<ModelVersion> {
    path.strip_prefix(VERSIONS_PREFIX)?
        .strip_prefix('v')?
        .strip_suffix(".rgm")?
        .parse()
        .ok()
}

/// Contents of the `CURRENT` pointer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentPointer {
    pub version: ModelVersion,
    pub path: String,
    pub total_sample_size: u64,
    pub published_at: DateTime<Utc>,
    pub codec: String,
}

impl CurrentPointer {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec_pretty(self)?))
    }
}

/// One entry of the published version history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: ModelVersion,
    pub total_sample_size: u64,
    pub published_at: DateTime<Utc>,
    pub rule_count: usize,
    pub path: String,
}

/// Single-writer, multi-reader store of published global models
///
/// Readers get a fully formed `Arc<GlobalModel>` snapshot; `publish` swaps
/// it only after both the version record and the `CURRENT` pointer are
/// durably written.
pub struct GlobalModelStore {
    backend: StorageHandle,
    codec: ModelCodecHandle,
    current: RwLock<Arc<GlobalModel>>,
    writer: Mutex<()>,
    updates: watch::Sender<Arc<GlobalModel>>,
}

impl GlobalModelStore {
    /// Open the store, loading the authoritative version if one was published
    #[instrument(skip(backend, codec), fields(codec = codec.name()))]
    pub async fn open(backend: StorageHandle, codec: ModelCodecHandle) -> Result<Self> {
        let current = match backend.read(CURRENT_PATH).await {
            Ok(data) => {
                let pointer: CurrentPointer = serde_json::from_slice(&data).map_err(|e| {
                    Error::RecordCorrupted {
                        path: CURRENT_PATH.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                let model = Self::read_version(&backend, pointer.version, &pointer.path).await?;
                info!(
                    version = model.version,
                    total_sample_size = model.total_sample_size,
                    "Loaded published global model"
                );
                model
            }
            Err(Error::StoragePathNotFound { .. }) => {
                info!("No published global model yet, starting at version 0");
                GlobalModel::initial()
            }
            Err(e) => return Err(e),
        };

        let current = Arc::new(current);
        let (updates, _) = watch::channel(current.clone());

        Ok(Self {
            backend,
            codec,
            current: RwLock::new(current),
            writer: Mutex::new(()),
            updates,
        })
    }

    async fn read_version(
        backend: &StorageHandle,
        version: ModelVersion,
        path: &str,
    ) -> Result<GlobalModel> {
        let data = backend.read(path).await.map_err(|e| match e {
            Error::StoragePathNotFound { .. } => Error::VersionNotFound { version },
            other => other,
        })?;
        let record = ModelRecord::decode(path, data)?;
        if record.version != version {
            return Err(Error::RecordCorrupted {
                path: path.to_string(),
                reason: format!("holds version {}, expected {}", record.version, version),
            });
        }

        let codec = codec_by_name(&record.codec).ok_or_else(|| Error::RecordCorrupted {
            path: path.to_string(),
            reason: format!("unknown codec {}", record.codec),
        })?;
        let model = codec
            .decode(&record.payload)
            .map_err(|e| Error::RecordCorrupted {
                path: path.to_string(),
                reason: e.to_string(),
            })?;

        Ok(GlobalModel {
            version: record.version,
            model: Some(model),
            total_sample_size: record.total_sample_size,
            published_at: Some(record.published_at),
        })
    }

    /// Latest published snapshot (version 0 before the first publish)
    pub fn current(&self) -> Arc<GlobalModel> {
        self.current.read().clone()
    }

    /// Current version number
    pub fn version(&self) -> ModelVersion {
        self.current.read().version
    }

    /// The current model if it is newer than `known_version`
    pub fn since(&self, known_version: ModelVersion) -> Option<Arc<GlobalModel>> {
        let current = self.current();
        (current.version > known_version).then_some(current)
    }

    /// Receiver that observes every newly published snapshot
    pub fn subscribe(&self) -> watch::Receiver<Arc<GlobalModel>> {
        self.updates.subscribe()
    }

    /// Codec used for payloads
    pub fn codec(&self) -> &ModelCodecHandle {
        &self.codec
    }

    /// Persist `model` as the next version and make it current
    ///
    /// On error nothing changes: the previous version stays current and
    /// `CURRENT` still points at it.
    #[instrument(skip(self, model), fields(rules = model.rules.len()))]
    pub async fn publish(&self, model: RuleModel, total_sample_size: u64) -> Result<Arc<GlobalModel>> {
        let _guard = self.writer.lock().await;
        let version = self.version() + 1;
        let published_at = Utc::now();

        let persistence = |e: Error| Error::PersistenceFailure {
            version,
            message: e.to_string(),
        };

        let path = record_path(version);
        let pointer = CurrentPointer {
            version,
            path: path.clone(),
            total_sample_size,
            published_at,
            codec: self.codec.name().to_string(),
        };

        // record first, pointer last: a crash in between leaves an ignored orphan
        let result = async {
            let record = ModelRecord {
                version,
                total_sample_size,
                published_at,
                codec: pointer.codec.clone(),
                payload: self.codec.encode(&model)?,
            };
            let pointer_bytes = pointer.encode()?;
            self.backend.write(&path, record.encode()?).await?;
            self.backend.write(CURRENT_PATH, pointer_bytes).await?;
            Ok::<_, Error>(())
        }
        .await;

        if let Err(e) = result {
            error!(version, error = %e, "Failed to persist global model");
            return Err(persistence(e));
        }

        let published = Arc::new(GlobalModel {
            version,
            model: Some(model),
            total_sample_size,
            published_at: Some(published_at),
        });
        *self.current.write() = published.clone();
        self.updates.send_replace(published.clone());

        info!(version, total_sample_size, path = %path, "Published global model");
        Ok(published)
    }

    /// Read a historical version
    #[instrument(skip(self))]
    pub async fn load_version(&self, version: ModelVersion) -> Result<GlobalModel> {
        if version == 0 {
            return Ok(GlobalModel::initial());
        }
        if version > self.version() {
            return Err(Error::VersionNotFound { version });
        }
        Self::read_version(&self.backend, version, &record_path(version)).await
    }

    /// Published versions up to the current one, oldest first
    ///
    /// Records beyond the current pointer are orphans of an interrupted
    /// publish and are left out.
    #[instrument(skip(self))]
    pub async fn history(&self) -> Result<Vec<VersionInfo>> {
        let current = self.version();
        let mut versions: Vec<ModelVersion> = self
            .backend
            .list(VERSIONS_PREFIX)
            .await?
            .iter()
            .filter_map(|p| parse_record_path(p))
            .filter(|v| *v <= current)
            .collect();
        versions.sort_unstable();

        let mut history = Vec::with_capacity(versions.len());
        for version in versions {
            let path = record_path(version);
            let model = Self::read_version(&self.backend, version, &path).await?;
            debug!(version, "Read history entry");
            history.push(VersionInfo {
                version,
                total_sample_size: model.total_sample_size,
                published_at: model.published_at.unwrap_or_else(Utc::now),
                rule_count: model.model.as_ref().map(RuleModel::len).unwrap_or(0),
                path,
            });
        }
        Ok(history)
    }
}

/// Thread-safe handle to the store
pub type GlobalModelStoreHandle = Arc<GlobalModelStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use rulefed_core::{BincodeCodec, Item, JsonCodec, ModelCodec, Rule};
    use storage::{LocalStorage, MemoryStorage, StorageBackend};
    use tempfile::TempDir;

    fn model(support: f64, n: u64) -> RuleModel {
        RuleModel::new(
            "HeartDisease",
            vec![Rule::new([Item::new("x", "1")], "yes", support, 0.8)],
            n,
        )
    }

    async fn local_store(dir: &TempDir) -> GlobalModelStore {
        GlobalModelStore::open(Arc::new(LocalStorage::new(dir.path())), Arc::new(BincodeCodec))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_starts_at_version_zero() {
        let dir = TempDir::new().unwrap();
        let store = local_store(&dir).await;

        assert_eq!(store.version(), 0);
        assert!(!store.current().has_model());
        assert!(store.since(0).is_none());
        assert!(store.history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_increments_version() {
        let dir = TempDir::new().unwrap();
        let store = local_store(&dir).await;

        let v1 = store.publish(model(0.3, 150), 150).await.unwrap();
        let v2 = store.publish(model(0.25, 200), 200).await.unwrap();

        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        assert_eq!(store.current().total_sample_size, 200);

        assert_eq!(store.since(0).unwrap().version, 2);
        assert_eq!(store.since(1).unwrap().version, 2);
        assert!(store.since(2).is_none());
        assert!(store.since(9).is_none());
    }

    #[tokio::test]
    async fn test_reload_after_restart() {
        let dir = TempDir::new().unwrap();
        {
            let store = local_store(&dir).await;
            store.publish(model(0.3, 150), 150).await.unwrap();
            store.publish(model(0.2, 300), 300).await.unwrap();
        }

        let reopened = local_store(&dir).await;
        let current = reopened.current();
        assert_eq!(current.version, 2);
        assert_eq!(current.total_sample_size, 300);
        assert_eq!(current.model.as_ref().unwrap(), &model(0.2, 300));

        let history = reopened.history().await.unwrap();
        assert_eq!(
            history.iter().map(|h| h.version).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(
            reopened.load_version(1).await.unwrap().model.unwrap(),
            model(0.3, 150)
        );
    }

    #[tokio::test]
    async fn test_failed_publish_keeps_previous_version() {
        let backend = Arc::new(MemoryStorage::new());
        let store = GlobalModelStore::open(backend.clone(), Arc::new(BincodeCodec))
            .await
            .unwrap();
        store.publish(model(0.3, 150), 150).await.unwrap();

        backend.fail_writes(true);
        let err = store.publish(model(0.1, 400), 400).await.unwrap_err();
        assert!(matches!(err, Error::PersistenceFailure { version: 2, .. }));
        assert_eq!(store.version(), 1);

        let reopened = GlobalModelStore::open(backend.clone(), Arc::new(BincodeCodec))
            .await
            .unwrap();
        assert_eq!(reopened.version(), 1);

        backend.fail_writes(false);
        assert_eq!(store.publish(model(0.1, 400), 400).await.unwrap().version, 2);
    }

    struct BrokenCodec;

    impl ModelCodec for BrokenCodec {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn encode(&self, _model: &RuleModel) -> Result<Bytes> {
            Err(Error::Serialization("cannot encode".to_string()))
        }

        fn decode(&self, bytes: &[u8]) -> Result<RuleModel> {
            BincodeCodec.decode(bytes)
        }
    }

    #[tokio::test]
    async fn test_every_publish_failure_is_a_persistence_failure() {
        let backend = Arc::new(MemoryStorage::new());
        let store = GlobalModelStore::open(backend.clone(), Arc::new(BrokenCodec))
            .await
            .unwrap();

        let err = store.publish(model(0.3, 150), 150).await.unwrap_err();
        assert!(matches!(err, Error::PersistenceFailure { version: 1, .. }));
        assert_eq!(store.version(), 0);
        assert!(backend.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_record_is_ignored() {
        let backend = Arc::new(MemoryStorage::new());
        let store = GlobalModelStore::open(backend.clone(), Arc::new(BincodeCodec))
            .await
            .unwrap();
        store.publish(model(0.3, 150), 150).await.unwrap();

        // record written, pointer never updated
        backend.insert_raw(&record_path(2), Bytes::from_static(b"half"));

        let reopened = GlobalModelStore::open(backend.clone(), Arc::new(BincodeCodec))
            .await
            .unwrap();
        assert_eq!(reopened.version(), 1);
        assert_eq!(reopened.history().await.unwrap().len(), 1);
        assert_eq!(reopened.publish(model(0.2, 10), 10).await.unwrap().version, 2);
        assert_eq!(reopened.load_version(2).await.unwrap().total_sample_size, 10);
    }

    #[tokio::test]
    async fn test_corrupted_current_record() {
        let backend = Arc::new(MemoryStorage::new());
        let store = GlobalModelStore::open(backend.clone(), Arc::new(BincodeCodec))
            .await
            .unwrap();
        store.publish(model(0.3, 150), 150).await.unwrap();
        backend.insert_raw(&record_path(1), Bytes::from_static(b"RGLM garbage"));

        let result = GlobalModelStore::open(backend, Arc::new(BincodeCodec)).await;
        assert!(matches!(result, Err(Error::RecordCorrupted { .. })));
    }

    #[tokio::test]
    async fn test_records_carry_their_codec() {
        let backend: StorageHandle = Arc::new(MemoryStorage::new());
        let store = GlobalModelStore::open(backend.clone(), Arc::new(JsonCodec))
            .await
            .unwrap();
        store.publish(model(0.3, 150), 150).await.unwrap();

        // reopening with a different default codec still reads old records
        let reopened = GlobalModelStore::open(backend.clone(), Arc::new(BincodeCodec))
            .await
            .unwrap();
        assert_eq!(reopened.current().model.as_ref().unwrap(), &model(0.3, 150));

        let pointer: CurrentPointer =
            serde_json::from_slice(&backend.read(CURRENT_PATH).await.unwrap()).unwrap();
        assert_eq!(pointer.codec, "json-v1");
        assert_eq!(pointer.path, "versions/v0000000001.rgm");
    }

    #[tokio::test]
    async fn test_subscribers_see_publishes() {
        let backend = Arc::new(MemoryStorage::new());
        let store = GlobalModelStore::open(backend, Arc::new(BincodeCodec))
            .await
            .unwrap();
        let mut rx = store.subscribe();

        store.publish(model(0.3, 150), 150).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().version, 1);
    }

    #[tokio::test]
    async fn test_load_unknown_version() {
        let backend = Arc::new(MemoryStorage::new());
        let store = GlobalModelStore::open(backend, Arc::new(BincodeCodec))
            .await
            .unwrap();
        assert!(matches!(
            store.load_version(3).await,
            Err(Error::VersionNotFound { version: 3 })
        ));
        assert_eq!(store.load_version(0).await.unwrap().version, 0);
    }
}

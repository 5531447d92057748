use crate::error::StoreError;
use crate::pushkey::PushKeyGenerator;
use crate::store::{Listener, RemoteStore, SnapshotEntries, StoreEvent};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, warn};

type CollectionMap = BTreeMap<String, Value>;

struct Collection {
    entries: CollectionMap,
    updates: watch::Sender<Arc<SnapshotEntries>>,
}

impl Collection {
    fn new(entries: CollectionMap) -> Self {
        let snapshot = Arc::new(to_snapshot(&entries));
        let (updates, _) = watch::channel(snapshot);
        Self { entries, updates }
    }

    fn publish(&self) {
        self.updates.send_replace(Arc::new(to_snapshot(&self.entries)));
    }
}

fn to_snapshot(entries: &CollectionMap) -> SnapshotEntries {
    entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Scripted failures for exercising error paths.
#[derive(Debug, Default)]
pub struct FaultInjector {
    failing_writes: AtomicUsize,
}

impl FaultInjector {
    /// Reject the next `n` writes with [`StoreError::Unavailable`].
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn consume_write_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// In-process [`RemoteStore`] with optional JSON file persistence.
///
/// Every successful create republishes the full collection to all of its
/// listeners. Listeners that fall behind only see the latest snapshot.
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
    keys: PushKeyGenerator,
    cancel_tx: broadcast::Sender<String>,
    faults: FaultInjector,
    path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_collections(HashMap::new(), None)
    }

    /// Open a store backed by `path`, loading its contents if the file exists.
    ///
    /// Every create rewrites the whole file, embedded photos included, on the
    /// blocking pool while other writes wait. Cost grows with the collection.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let loaded: HashMap<String, CollectionMap> = if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            serde_json::from_reader(reader)?
        } else {
            HashMap::new()
        };

        let total: usize = loaded.values().map(|c| c.len()).sum();
        info!("Opened store at {:?} with {} entries", path, total);
        Ok(Self::with_collections(loaded, Some(path)))
    }

    fn with_collections(loaded: HashMap<String, CollectionMap>, path: Option<PathBuf>) -> Self {
        let collections = loaded
            .into_iter()
            .map(|(name, entries)| (name, Collection::new(entries)))
            .collect();
        let (cancel_tx, _) = broadcast::channel(16);
        Self {
            collections: RwLock::new(collections),
            keys: PushKeyGenerator::new(),
            cancel_tx,
            faults: FaultInjector::default(),
            path,
        }
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current contents of `collection` in key order.
    pub async fn snapshot(&self, collection: &str) -> SnapshotEntries {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .map(|c| to_snapshot(&c.entries))
            .unwrap_or_default()
    }

    pub async fn len(&self, collection: &str) -> usize {
        let collections = self.collections.read().await;
        collections.get(collection).map(|c| c.entries.len()).unwrap_or(0)
    }

    /// Cancel every open listener, as if permission had been revoked.
    pub fn cancel_listeners(&self, reason: &str) -> usize {
        self.cancel_tx.send(reason.to_string()).unwrap_or(0)
    }

    // Callers hold the collections write lock, so file writes never reorder.
    async fn persist(&self, collections: &HashMap<String, Collection>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let dump: HashMap<&String, &CollectionMap> =
            collections.iter().map(|(name, c)| (name, &c.entries)).collect();
        let bytes = serde_json::to_vec(&dump)?;

        let path = path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(|e| StoreError::Io(format!("persist task failed: {}", e)))?
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        writer.write_all(bytes)?;
        writer.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn allocate_key(&self, _collection: &str) -> Result<String, StoreError> {
        Ok(self.keys.next_key())
    }

    async fn create_at(&self, collection: &str, key: &str, value: Value) -> Result<(), StoreError> {
        if self.faults.consume_write_failure() {
            warn!("Injected write failure for {}/{}", collection, key);
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }

        let mut collections = self.collections.write().await;
        let target = collections
            .entry(collection.to_string())
            .or_insert_with(|| Collection::new(CollectionMap::new()));

        if target.entries.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        target.entries.insert(key.to_string(), value);

        if let Err(e) = self.persist(&collections).await {
            warn!("Failed to persist {}/{}: {}", collection, key, e);
            if let Some(target) = collections.get_mut(collection) {
                target.entries.remove(key);
            }
            return Err(e);
        }

        if let Some(target) = collections.get(collection) {
            target.publish();
            debug!("Created {}/{} ({} entries)", collection, key, target.entries.len());
        }
        Ok(())
    }

    async fn listen(&self, collection: &str) -> Result<Listener, StoreError> {
        let mut updates = {
            let mut collections = self.collections.write().await;
            collections
                .entry(collection.to_string())
                .or_insert_with(|| Collection::new(CollectionMap::new()))
                .updates
                .subscribe()
        };
        let mut cancel_rx = self.cancel_tx.subscribe();
        let (tx, listener) = Listener::channel();
        let collection = collection.to_string();

        tokio::spawn(async move {
            let initial = updates.borrow_and_update().clone();
            if tx.send(StoreEvent::Snapshot(initial.to_vec())).is_err() {
                return;
            }

            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!("Listener on {} released", collection);
                        break;
                    }
                    reason = cancel_rx.recv() => {
                        let reason = reason.unwrap_or_else(|_| "store closed".to_string());
                        let _ = tx.send(StoreEvent::Cancelled(reason));
                        break;
                    }
                    changed = updates.changed() => {
                        if changed.is_err() {
                            let _ = tx.send(StoreEvent::Cancelled("store closed".to_string()));
                            break;
                        }
                        let snapshot = updates.borrow_and_update().clone();
                        if tx.send(StoreEvent::Snapshot(snapshot.to_vec())).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const COLLECTION: &str = "incidentes";

    #[tokio::test]
    async fn test_create_and_snapshot() {
        let store = MemoryStore::new();
        let key = store.allocate_key(COLLECTION).await.unwrap();
        store.create_at(COLLECTION, &key, json!({"descripcion": "a"})).await.unwrap();

        let snapshot = store.snapshot(COLLECTION).await;
        assert_eq!(snapshot, vec![(key, json!({"descripcion": "a"}))]);
    }

    #[tokio::test]
    async fn test_create_if_absent() {
        let store = MemoryStore::new();
        store.create_at(COLLECTION, "k1", json!(1)).await.unwrap();
        let err = store.create_at(COLLECTION, "k1", json!(2)).await.unwrap_err();

        assert_eq!(err, StoreError::AlreadyExists("k1".to_string()));
        assert_eq!(store.snapshot(COLLECTION).await, vec![("k1".to_string(), json!(1))]);
    }

    #[tokio::test]
    async fn test_listener_gets_initial_and_updates() {
        let store = MemoryStore::new();
        store.create_at(COLLECTION, "a", json!(1)).await.unwrap();

        let mut listener = store.listen(COLLECTION).await.unwrap();
        assert_eq!(
            listener.next().await,
            Some(StoreEvent::Snapshot(vec![("a".to_string(), json!(1))]))
        );

        store.create_at(COLLECTION, "b", json!(2)).await.unwrap();
        assert_eq!(
            listener.next().await,
            Some(StoreEvent::Snapshot(vec![
                ("a".to_string(), json!(1)),
                ("b".to_string(), json!(2)),
            ]))
        );
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let store = MemoryStore::new();
        store.faults().fail_next_writes(1);

        let err = store.create_at(COLLECTION, "a", json!(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.len(COLLECTION).await, 0);

        store.create_at(COLLECTION, "a", json!(1)).await.unwrap();
        assert_eq!(store.len(COLLECTION).await, 1);
    }

    #[tokio::test]
    async fn test_cancel_listeners() {
        let store = MemoryStore::new();
        let mut listener = store.listen(COLLECTION).await.unwrap();
        assert!(matches!(listener.next().await, Some(StoreEvent::Snapshot(_))));

        store.cancel_listeners("permission denied");
        assert_eq!(
            listener.next().await,
            Some(StoreEvent::Cancelled("permission denied".to_string()))
        );
        assert_eq!(listener.next().await, None);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("store.json");

        {
            let store = MemoryStore::open(&path).unwrap();
            store.create_at(COLLECTION, "k1", json!({"descripcion": "x"})).await.unwrap();
            store.create_at(COLLECTION, "k2", json!({"descripcion": "y"})).await.unwrap();
        }

        let reopened = MemoryStore::open(&path).unwrap();
        let snapshot = reopened.snapshot(COLLECTION).await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].0, "k1");
        assert_eq!(snapshot[1].1, json!({"descripcion": "y"}));
    }

    #[tokio::test]
    async fn test_failed_persist_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let store = MemoryStore::open(data_dir.join("store.json")).unwrap();
        store.create_at(COLLECTION, "k1", json!(1)).await.unwrap();

        std::fs::remove_dir_all(&data_dir).unwrap();

        let err = store.create_at(COLLECTION, "k2", json!(2)).await.unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert_eq!(store.snapshot(COLLECTION).await, vec![("k1".to_string(), json!(1))]);
    }
}

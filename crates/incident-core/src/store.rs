use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Full contents of a collection, as `(key, value)` pairs in key order.
pub type SnapshotEntries = Vec<(String, Value)>;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// The whole collection after a change. Never a diff.
    Snapshot(SnapshotEntries),
    /// The listener is broken; no further events follow.
    Cancelled(String),
}

/// Receiving end of a collection listener.
///
/// Dropping it releases the listener on the store side.
#[derive(Debug)]
pub struct Listener {
    events: mpsc::UnboundedReceiver<StoreEvent>,
}

/// Store-side half of a [`Listener`].
pub type ListenerSender = mpsc::UnboundedSender<StoreEvent>;

impl Listener {
    pub fn channel() -> (ListenerSender, Listener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Listener { events: rx })
    }

    /// Next event, or `None` once the store side has gone away.
    pub async fn next(&mut self) -> Option<StoreEvent> {
        self.events.recv().await
    }
}

/// A remote collection store that can allocate keys, create entries and push
/// full snapshots to listeners.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// A collision-free key for a new entry in `collection`.
    async fn allocate_key(&self, collection: &str) -> Result<String, StoreError>;

    /// Create `value` at `key`, failing if the key is already taken.
    async fn create_at(&self, collection: &str, key: &str, value: Value) -> Result<(), StoreError>;

    /// Start listening to `collection`. The first event carries the current
    /// contents.
    async fn listen(&self, collection: &str) -> Result<Listener, StoreError>;
}

#[async_trait]
impl<T: RemoteStore + ?Sized> RemoteStore for Arc<T> {
    async fn allocate_key(&self, collection: &str) -> Result<String, StoreError> {
        (**self).allocate_key(collection).await
    }

    async fn create_at(&self, collection: &str, key: &str, value: Value) -> Result<(), StoreError> {
        (**self).create_at(collection, key, value).await
    }

    async fn listen(&self, collection: &str) -> Result<Listener, StoreError> {
        (**self).listen(collection).await
    }
}

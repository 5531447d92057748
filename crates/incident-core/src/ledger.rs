//! Append-only incident ledger with a live, newest-first view.
//!
//! Writes go straight to the [`RemoteStore`]; the ledger never patches its
//! own view. Readers subscribe and receive the whole collection, re-sorted,
//! every time the store reports a change.

use crate::error::{AppendError, SkippedEntry, StoreError, SubscriptionError};
use crate::health::SyncHealth;
use crate::store::{RemoteStore, SnapshotEntries, StoreEvent};
use crate::types::{now_millis, IncidentRecord, NewIncident, INCIDENTS_COLLECTION};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Source of record timestamps, in milliseconds since the epoch.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Turn one snapshot entry into a record.
///
/// Records persisted without an id take the key they are stored under.
pub fn parse_entry(key: &str, value: &Value) -> Result<IncidentRecord, SkippedEntry> {
    if !value.is_object() {
        return Err(SkippedEntry {
            key: key.to_string(),
            reason: "entry is not an object".to_string(),
        });
    }

    let mut record: IncidentRecord =
        serde_json::from_value(value.clone()).map_err(|e| SkippedEntry {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

    if record.id.is_empty() {
        record.id = key.to_string();
    }
    Ok(record)
}

/// Fold a full snapshot into a view sorted by timestamp, newest first.
///
/// Malformed entries are returned separately instead of failing the batch.
/// Entries with equal timestamps keep their snapshot order.
pub fn fold_snapshot(entries: &SnapshotEntries) -> (Vec<IncidentRecord>, Vec<SkippedEntry>) {
    let mut records = Vec::with_capacity(entries.len());
    let mut skipped = Vec::new();

    for (key, value) in entries {
        match parse_entry(key, value) {
            Ok(record) => records.push(record),
            Err(skip) => skipped.push(skip),
        }
    }

    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    (records, skipped)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionState {
    #[default]
    Unsubscribed,
    Subscribing,
    Active,
    /// Terminal, reached by store failure or explicit release.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// Authoritative current view; replaces anything published before.
    Snapshot(Vec<IncidentRecord>),
    /// The subscription is over. Sent at most once, always last.
    Failed(SubscriptionError),
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<SubscriptionState>,
    released: AtomicBool,
}

impl Shared {
    fn state(&self) -> SubscriptionState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Move to `next` unless already cancelled.
    fn advance(&self, next: SubscriptionState) -> bool {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *state == SubscriptionState::Cancelled {
            return false;
        }
        *state = next;
        true
    }

    fn release(&self) -> bool {
        self.advance(SubscriptionState::Cancelled);
        !self.released.swap(true, Ordering::SeqCst)
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// A live view of the collection.
///
/// Events arrive in the order the store emitted them. Dropping the
/// subscription releases the store listener.
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::UnboundedReceiver<SubscriptionEvent>,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn state(&self) -> SubscriptionState {
        self.shared.state()
    }

    /// Next event, or `None` once the subscription is over or released.
    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        if self.shared.is_released() {
            return None;
        }
        let event = self.events.recv().await?;
        if self.shared.is_released() {
            return None;
        }
        Some(event)
    }

    /// Release the subscription. Safe to call more than once; no event is
    /// returned after the first call.
    pub fn unsubscribe(&mut self) {
        // The callback handle may have released `shared` already; the task
        // still has to stop here.
        self.task.abort();
        self.events.close();
        if self.shared.release() {
            debug!("Subscription released");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Handle for a callback-driven subscription from
/// [`SyncedLedger::subscribe_with`].
#[derive(Debug)]
pub struct SubscriptionHandle {
    shared: Arc<Shared>,
    driver: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn state(&self) -> SubscriptionState {
        self.shared.state()
    }

    /// Stop delivery. Idempotent; no callback starts after this returns.
    pub fn unsubscribe(&self) {
        if self.shared.release() {
            self.driver.abort();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Append-only ledger over a [`RemoteStore`] collection.
pub struct SyncedLedger<S: RemoteStore + 'static> {
    store: Arc<S>,
    collection: String,
    clock: Clock,
    health: Arc<Mutex<SyncHealth>>,
}

impl<S: RemoteStore + 'static> Clone for SyncedLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            collection: self.collection.clone(),
            clock: self.clock.clone(),
            health: self.health.clone(),
        }
    }
}

impl<S: RemoteStore + 'static> SyncedLedger<S> {
    /// Ledger over the incidents collection.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_collection(store, INCIDENTS_COLLECTION)
    }

    pub fn with_collection(store: Arc<S>, collection: &str) -> Self {
        Self {
            store,
            collection: collection.to_string(),
            clock: Arc::new(now_millis),
            health: Arc::new(Mutex::new(SyncHealth::new(collection.to_string()))),
        }
    }

    /// Replace the timestamp source.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn health(&self) -> SyncHealth {
        with_health(&self.health, |h| h.clone())
    }

    /// Persist a new incident under a freshly allocated key.
    ///
    /// The ledger's view is not touched: the record shows up through the
    /// subscription once the store reports it. Failures are never retried.
    pub async fn append(&self, incident: NewIncident) -> Result<IncidentRecord, AppendError> {
        if incident.description.is_empty() {
            return Err(AppendError::InvalidRecord("description is empty"));
        }
        if incident.encoded_photo.is_empty() {
            return Err(AppendError::InvalidRecord("photo is missing"));
        }

        let result = self.write(incident).await;
        with_health(&self.health, |h| {
            h.record_append(result.as_ref().map(|_| ()).map_err(|e| e.to_string()))
        });

        match result {
            Ok(record) => {
                info!("Appended incident {} to {}", record.id, self.collection);
                Ok(record)
            }
            Err(e) => {
                warn!("Append to {} failed: {}", self.collection, e);
                Err(AppendError::Store(e))
            }
        }
    }

    async fn write(&self, incident: NewIncident) -> Result<IncidentRecord, StoreError> {
        let key = self.store.allocate_key(&self.collection).await?;
        let record = IncidentRecord::from_parts(key, (self.clock)(), incident);
        let value = serde_json::to_value(&record)?;
        self.store.create_at(&self.collection, &record.id, value).await?;
        Ok(record)
    }

    /// Start a live subscription to the whole collection.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());

        let task = tokio::spawn(run_subscription(
            self.store.clone(),
            self.collection.clone(),
            tx,
            shared.clone(),
            self.health.clone(),
        ));

        Subscription {
            events: rx,
            shared,
            task,
        }
    }

    /// Callback flavour of [`subscribe`](Self::subscribe). Callbacks run on a
    /// tokio task, never concurrently with each other.
    pub fn subscribe_with<F, E>(&self, mut on_snapshot: F, mut on_error: E) -> SubscriptionHandle
    where
        F: FnMut(Vec<IncidentRecord>) + Send + 'static,
        E: FnMut(SubscriptionError) + Send + 'static,
    {
        let mut subscription = self.subscribe();
        let shared = subscription.shared.clone();

        let driver = tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                // `next` may have returned just before a release from another thread.
                if subscription.shared.is_released() {
                    break;
                }
                match event {
                    SubscriptionEvent::Snapshot(view) => on_snapshot(view),
                    SubscriptionEvent::Failed(e) => on_error(e),
                }
            }
        });

        SubscriptionHandle { shared, driver }
    }
}

fn with_health<T>(health: &Mutex<SyncHealth>, f: impl FnOnce(&mut SyncHealth) -> T) -> T {
    match health.lock() {
        Ok(mut guard) => f(&mut guard),
        Err(poisoned) => f(&mut poisoned.into_inner()),
    }
}

// Decrements the active count however the task ends, abort included.
struct ActiveGuard(Arc<Mutex<SyncHealth>>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        with_health(&self.0, |h| {
            h.active_subscriptions = h.active_subscriptions.saturating_sub(1)
        });
    }
}

async fn run_subscription<S: RemoteStore + 'static>(
    store: Arc<S>,
    collection: String,
    tx: mpsc::UnboundedSender<SubscriptionEvent>,
    shared: Arc<Shared>,
    health: Arc<Mutex<SyncHealth>>,
) {
    let fail = |err: SubscriptionError| {
        error!("Subscription to {} failed: {}", collection, err);
        with_health(&health, |h| h.record_subscription_failure(err.to_string()));
        if shared.advance(SubscriptionState::Cancelled) {
            let _ = tx.send(SubscriptionEvent::Failed(err));
        }
    };

    if !shared.advance(SubscriptionState::Subscribing) {
        return;
    }

    let mut listener = match store.listen(&collection).await {
        Ok(listener) => listener,
        Err(e) => {
            fail(SubscriptionError::Listen(e));
            return;
        }
    };

    if !shared.advance(SubscriptionState::Active) {
        return;
    }
    with_health(&health, |h| h.active_subscriptions += 1);
    let _active = ActiveGuard(health.clone());
    info!("Subscribed to {}", collection);

    loop {
        match listener.next().await {
            Some(StoreEvent::Snapshot(entries)) => {
                let (view, skipped) = fold_snapshot(&entries);
                for skip in &skipped {
                    warn!("{}", skip);
                }
                with_health(&health, |h| h.record_snapshot(view.len(), skipped.len()));
                debug!(
                    "Snapshot of {}: {} records, {} skipped",
                    collection,
                    view.len(),
                    skipped.len()
                );

                if tx.send(SubscriptionEvent::Snapshot(view)).is_err() {
                    debug!("Observer of {} went away", collection);
                    shared.advance(SubscriptionState::Cancelled);
                    return;
                }
            }
            Some(StoreEvent::Cancelled(reason)) => {
                fail(SubscriptionError::Cancelled(reason));
                return;
            }
            None => {
                fail(SubscriptionError::Cancelled("listener closed".to_string()));
                return;
            }
        }
    }
}

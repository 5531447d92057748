use incident_core::health::{HealthStatus, SyncHealth};
use incident_core::ledger::{SubscriptionEvent, SyncedLedger};
use incident_core::memory::MemoryStore;
use incident_core::types::IncidentRecord;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MemoryStore>,
    pub ledger: SyncedLedger<MemoryStore>,
    /// Latest published view; written only by the view task.
    pub view: Arc<RwLock<Vec<IncidentRecord>>>,
    pub ws_sessions: Arc<AtomicU64>,
    pub start_time: Instant,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerHealth {
    pub status: HealthStatus,
    pub uptime_seconds: u64,
    pub incidents: usize,
    pub ws_sessions: u64,
    pub sync: SyncHealth,
}

impl AppState {
    pub fn new(store: Arc<MemoryStore>, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            ledger: SyncedLedger::new(store.clone()),
            store,
            view: Arc::new(RwLock::new(Vec::new())),
            ws_sessions: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
            metrics,
        }
    }

    /// Keep `view` in step with the collection through a ledger subscription.
    pub fn spawn_view_task(&self) -> JoinHandle<()> {
        let mut subscription = self.ledger.subscribe();
        let view = self.view.clone();
        tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                match event {
                    SubscriptionEvent::Snapshot(records) => {
                        crate::metrics::update_view_size(records.len());
                        *view.write().await = records;
                    }
                    SubscriptionEvent::Failed(e) => {
                        error!("Incident view subscription failed: {}", e);
                    }
                }
            }
            info!("Incident view task ended");
        })
    }

    pub async fn incidents(&self, limit: Option<usize>) -> Vec<IncidentRecord> {
        let view = self.view.read().await;
        let limit = limit.unwrap_or(view.len());
        view.iter().take(limit).cloned().collect()
    }

    pub fn session_opened(&self) -> u64 {
        let open = self.ws_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        crate::metrics::update_ws_sessions(open);
        open
    }

    pub fn session_closed(&self) -> u64 {
        let open = self.ws_sessions.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        crate::metrics::update_ws_sessions(open);
        open
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub async fn health(&self) -> ServerHealth {
        let sync = self.ledger.health();
        ServerHealth {
            status: sync.status(),
            uptime_seconds: self.uptime_seconds(),
            incidents: self.view.read().await.len(),
            ws_sessions: self.ws_sessions.load(Ordering::SeqCst),
            sync,
        }
    }
}

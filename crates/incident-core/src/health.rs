use chrono::{DateTime, Utc};
use serde::Serialize;

/// Running counters for one ledger's subscriptions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncHealth {
    pub collection: String,
    pub active_subscriptions: u64,
    pub last_snapshot_ts: Option<DateTime<Utc>>,
    pub snapshots_received: u64,
    pub entries_skipped: u64,
    pub last_snapshot_skipped: usize,
    pub last_skip_ts: Option<DateTime<Utc>>,
    pub view_size: usize,
    pub appends_ok: u64,
    pub appends_failed: u64,
    pub subscription_failures: u64,
    pub last_error: Option<String>,
}

impl SyncHealth {
    pub fn new(collection: String) -> Self {
        Self {
            collection,
            ..Default::default()
        }
    }

    pub fn append_ok_rate(&self) -> f64 {
        let total = self.appends_ok + self.appends_failed;
        if total == 0 {
            1.0
        } else {
            self.appends_ok as f64 / total as f64
        }
    }

    pub fn health_score(&self) -> u8 {
        let mut score = 100u8;

        let fail_rate = 1.0 - self.append_ok_rate();
        if fail_rate > 0.01 {
            score = score.saturating_sub((fail_rate * 100.0) as u8);
        }

        // Malformed rows are tolerated, a view that is mostly skips is not.
        let seen = self.view_size + self.last_snapshot_skipped;
        if seen > 0 && self.last_snapshot_skipped as f64 / seen as f64 > 0.1 {
            score = score.saturating_sub(20);
        }

        if self.active_subscriptions == 0 {
            score = score.saturating_sub(50);
        }

        if self.subscription_failures > 0 {
            score = score.saturating_sub((self.subscription_failures.min(10) * 5) as u8);
        }

        if self.last_snapshot_ts.is_none() {
            score = score.saturating_sub(30);
        }

        score
    }

    pub fn status(&self) -> HealthStatus {
        let score = self.health_score();
        if score >= 90 {
            HealthStatus::Ok
        } else if score >= 70 {
            HealthStatus::Warn
        } else {
            HealthStatus::Fail
        }
    }

    pub fn record_snapshot(&mut self, view_size: usize, skipped: usize) {
        let now = Utc::now();
        self.snapshots_received += 1;
        self.last_snapshot_ts = Some(now);
        self.view_size = view_size;
        self.last_snapshot_skipped = skipped;
        if skipped > 0 {
            self.entries_skipped += skipped as u64;
            self.last_skip_ts = Some(now);
        }
    }

    pub fn record_append(&mut self, result: Result<(), String>) {
        match result {
            Ok(()) => self.appends_ok += 1,
            Err(e) => {
                self.appends_failed += 1;
                self.last_error = Some(e);
            }
        }
    }

    pub fn record_subscription_failure(&mut self, reason: String) {
        self.subscription_failures += 1;
        self.last_error = Some(reason);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Ok,
    Warn,
    Fail,
}

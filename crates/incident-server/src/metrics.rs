use metrics::{counter, gauge};

pub fn record_create_ok(collection: &str) {
    counter!("incidents_created_total", "collection" => collection.to_string()).increment(1);
}

pub fn record_create_rejected(collection: &str) {
    counter!("incident_writes_rejected_total", "collection" => collection.to_string()).increment(1);
}

pub fn record_snapshot_sent(collection: &str) {
    counter!("snapshots_sent_total", "collection" => collection.to_string()).increment(1);
}

pub fn record_bad_frame() {
    counter!("bad_frames_total").increment(1);
}

pub fn update_ws_sessions(open: u64) {
    gauge!("ws_sessions").set(open as f64);
}

pub fn update_view_size(len: usize) {
    gauge!("incident_view_size").set(len as f64);
}

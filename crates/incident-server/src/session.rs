//! One websocket client of the incident store.
//!
//! Each session may hold one listener per collection. Outgoing frames go
//! through a single queue so acks and snapshots leave in the order they were
//! produced.

use crate::metrics;
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use incident_core::error::StoreError;
use incident_core::store::{RemoteStore, StoreEvent};
use incident_ws::protocol::{self, Ack, ClientFrame, ServerFrame};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub async fn run(socket: WebSocket, state: AppState) {
    let open = state.session_opened();
    info!("Websocket session opened ({} open)", open);

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match protocol::to_text(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to serialize frame: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut listeners: HashMap<String, JoinHandle<()>> = HashMap::new();

    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Websocket receive error: {}", e);
                break;
            }
        };

        let frame = match protocol::parse_client_frame(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("{}", e);
                metrics::record_bad_frame();
                continue;
            }
        };

        let reply = handle_frame(frame, &state, &out_tx, &mut listeners).await;
        if let Some(reply) = reply {
            if out_tx.send(reply).is_err() {
                break;
            }
        }
    }

    for (_, listener) in listeners.drain() {
        listener.abort();
    }
    drop(out_tx);
    let _ = writer.await;

    let open = state.session_closed();
    info!("Websocket session closed ({} open)", open);
}

async fn handle_frame(
    frame: ClientFrame,
    state: &AppState,
    out_tx: &mpsc::UnboundedSender<ServerFrame>,
    listeners: &mut HashMap<String, JoinHandle<()>>,
) -> Option<ServerFrame> {
    match frame {
        ClientFrame::Create {
            collection,
            key,
            value,
            req_id,
        } => {
            if let Err(e) = check_name(&collection).and_then(|_| check_name(&key)) {
                return Some(ServerFrame::Ack(Ack::failed(req_id, &e)));
            }
            match state.store.create_at(&collection, &key, value).await {
                Ok(()) => {
                    metrics::record_create_ok(&collection);
                    Some(ServerFrame::Ack(Ack::ok(req_id)))
                }
                Err(e) => {
                    warn!("Rejected create {}/{}: {}", collection, key, e);
                    metrics::record_create_rejected(&collection);
                    Some(ServerFrame::Ack(Ack::failed(req_id, &e)))
                }
            }
        }
        ClientFrame::Subscribe { collection, req_id } => {
            if let Err(e) = check_name(&collection) {
                return Some(ServerFrame::Ack(Ack::failed(req_id, &e)));
            }
            let mut listener = match state.store.listen(&collection).await {
                Ok(listener) => listener,
                Err(e) => return Some(ServerFrame::Ack(Ack::failed(req_id, &e))),
            };

            // Ack before the first snapshot can be queued.
            let _ = out_tx.send(ServerFrame::Ack(Ack::ok(req_id)));

            let out = out_tx.clone();
            let name = collection.clone();
            let forward = tokio::spawn(async move {
                while let Some(event) = listener.next().await {
                    let frame = match event {
                        StoreEvent::Snapshot(entries) => {
                            metrics::record_snapshot_sent(&name);
                            ServerFrame::Snapshot {
                                collection: name.clone(),
                                entries,
                            }
                        }
                        StoreEvent::Cancelled(reason) => {
                            let _ = out.send(ServerFrame::Cancelled {
                                collection: name.clone(),
                                reason,
                            });
                            break;
                        }
                    };
                    if out.send(frame).is_err() {
                        break;
                    }
                }
            });

            if let Some(previous) = listeners.insert(collection, forward) {
                previous.abort();
            }
            None
        }
        ClientFrame::Unsubscribe { collection, req_id } => {
            if let Some(listener) = listeners.remove(&collection) {
                listener.abort();
                debug!("Unsubscribed from {}", collection);
            }
            Some(ServerFrame::Ack(Ack::ok(req_id)))
        }
        ClientFrame::Ping { req_id } => Some(ServerFrame::Pong { req_id }),
    }
}

fn check_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.contains('/') {
        return Err(StoreError::Protocol(format!("invalid name {:?}", name)));
    }
    Ok(())
}

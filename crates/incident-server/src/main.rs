mod http;
mod metrics;
mod session;
mod state;
mod static_ui;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use http::router;
use incident_core::compose::{ComposeForm, Submitter};
use incident_core::display::IncidentView;
use incident_core::encoder::encode_async;
use incident_core::ledger::{SubscriptionEvent, SyncedLedger};
use incident_core::memory::MemoryStore;
use incident_core::types::{Coordinate, Identity};
use incident_ws::client::{WsRemoteStore, WsStoreConfig};
use state::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "incidents")]
#[command(about = "Photo-backed incident reports with a live, newest-first feed")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host the incident store over websocket and HTTP
    Serve {
        /// HTTP server address
        #[arg(long, default_value = "127.0.0.1:8080")]
        http: String,
        /// JSON file the store is persisted to (in-memory only if omitted)
        #[arg(long)]
        data: Option<PathBuf>,
    },
    /// Report an incident
    Submit {
        /// Websocket endpoint of the incident server
        #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
        server: String,
        /// Photo of the incident (any common image format)
        #[arg(long)]
        photo: PathBuf,
        /// What happened
        #[arg(long)]
        description: String,
        #[arg(long, allow_hyphen_values = true)]
        lat: Option<f64>,
        #[arg(long, allow_hyphen_values = true)]
        lon: Option<f64>,
        /// Reporter email
        #[arg(long)]
        email: String,
        /// Reporter user id
        #[arg(long)]
        user_id: String,
        /// Request timeout (e.g., "10s")
        #[arg(long, default_value = "10s")]
        timeout: String,
    },
    /// Follow the incident feed
    Watch {
        #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
        server: String,
        /// Print at most this many incidents per update
        #[arg(long, default_value = "20")]
        limit: usize,
        /// Ping interval (e.g., "30s")
        #[arg(long, default_value = "30s")]
        ping_interval: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::from_default_env();
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Serve { http, data } => {
            serve(http, data).await?;
        }
        Commands::Submit {
            server,
            photo,
            description,
            lat,
            lon,
            email,
            user_id,
            timeout,
        } => {
            let coordinate = match (lat, lon) {
                (Some(lat), Some(lon)) => Some(Coordinate::new(lat, lon)),
                (None, None) => None,
                _ => bail!("--lat and --lon must be given together"),
            };
            let timeout = parse_duration(&timeout)
                .context("Invalid timeout format (e.g., '10s', '1m')")?;
            let identity = Identity::new(email, user_id);
            submit(server, photo, description, coordinate, identity, timeout).await?;
        }
        Commands::Watch {
            server,
            limit,
            ping_interval,
        } => {
            let ping_interval = parse_duration(&ping_interval)
                .context("Invalid ping interval format (e.g., '30s', '1m')")?;
            watch(server, limit, ping_interval).await?;
        }
    }

    Ok(())
}

async fn serve(http_addr: String, data: Option<PathBuf>) -> anyhow::Result<()> {
    info!("Starting incident server on {}", http_addr);

    let store = match data {
        Some(path) => MemoryStore::open(&path)
            .with_context(|| format!("Failed to open store at {:?}", path))?,
        None => {
            warn!("No --data file given, incidents are kept in memory only");
            MemoryStore::new()
        }
    };
    let store = Arc::new(store);

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus metrics recorder")?;

    let state = AppState::new(store.clone(), Some(metrics_handle));
    let view_task = state.spawn_view_task();

    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("Failed to bind {}", http_addr))?;
    info!("HTTP server listening on http://{}", http_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("HTTP server failed")?;

    let cancelled = store.cancel_listeners("server shutting down");
    info!("Cancelled {} listeners", cancelled);
    view_task.abort();
    Ok(())
}

async fn submit(
    server: String,
    photo_path: PathBuf,
    description: String,
    coordinate: Option<Coordinate>,
    identity: Identity,
    timeout: Duration,
) -> anyhow::Result<()> {
    let raw = tokio::fs::read(&photo_path)
        .await
        .with_context(|| format!("Failed to read photo {:?}", photo_path))?;
    let photo = encode_async(raw).await;
    info!("Encoded photo: {} base64 chars", photo.as_str().len());

    let mut form = ComposeForm::new(description).with_photo(photo);
    if let Some(coordinate) = coordinate {
        form = form.with_coordinate(coordinate);
    }

    let mut config = WsStoreConfig::new(server);
    config.request_timeout = timeout;
    let ledger = SyncedLedger::new(Arc::new(WsRemoteStore::new(config)));
    let submitter = Submitter::new(ledger, identity);

    let record = submitter.submit(&form).await.context("Incident not saved")?;
    println!("{}", record.id);
    Ok(())
}

async fn watch(server: String, limit: usize, ping_interval: Duration) -> anyhow::Result<()> {
    let mut config = WsStoreConfig::new(server);
    config.ping_interval = ping_interval;
    let ledger = SyncedLedger::new(Arc::new(WsRemoteStore::new(config)));
    let mut subscription = ledger.subscribe();

    loop {
        tokio::select! {
            event = subscription.next() => match event {
                Some(SubscriptionEvent::Snapshot(records)) => {
                    println!("--- {} incidents ---", records.len());
                    for record in records.iter().take(limit) {
                        println!("{}", IncidentView::from_record(record));
                    }
                }
                Some(SubscriptionEvent::Failed(e)) => {
                    return Err(e).context("Incident feed lost");
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    subscription.unsubscribe();
    Ok(())
}

fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(ms.parse()?))
    } else if let Some(secs) = s.strip_suffix('s') {
        Ok(Duration::from_secs(secs.parse()?))
    } else if let Some(mins) = s.strip_suffix('m') {
        let mins: u64 = mins.parse()?;
        Ok(Duration::from_secs(mins * 60))
    } else {
        // Bare number is seconds
        Ok(Duration::from_secs(s.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration(" 15 ").unwrap(), Duration::from_secs(15));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_cli_parses_submit() {
        let cli = Cli::try_parse_from([
            "incidents",
            "submit",
            "--photo",
            "bache.jpg",
            "--description",
            "Bache en la via",
            "--lat",
            "-12.05",
            "--lon",
            "-77.04",
            "--email",
            "ana@example.com",
            "--user-id",
            "u1",
        ])
        .unwrap();
        match cli.command {
            Commands::Submit { lat, lon, timeout, .. } => {
                assert_eq!(lat, Some(-12.05));
                assert_eq!(lon, Some(-77.04));
                assert_eq!(timeout, "10s");
            }
            _ => panic!("expected submit"),
        }
    }
}

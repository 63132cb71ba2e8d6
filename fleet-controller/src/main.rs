use std::{env, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use fleet_controller::{FleetConfig, FleetState, JsonlStore, RecordingConfig, build_fleet_app};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if wants_version_flag() {
        println!("{}", version_text());
        return Ok(());
    }

    init_logging();
    info!("{}", version_text());

    let addr = parse_addr("FLEET_ADDR", "0.0.0.0:9300")?;
    let data_dir = parse_path("FLEET_DATA_DIR", ".fleet-controller/data");
    let purge_interval = Duration::from_secs(parse_u64("FLEET_PURGE_INTERVAL_SECS", 3_600)?);
    let config = FleetConfig {
        control_secret: env::var("FLEET_CONTROL_SECRET")
            .ok()
            .filter(|secret| !secret.trim().is_empty()),
        event_buffer: parse_usize("FLEET_EVENT_BUFFER", 256)?,
        recording: RecordingConfig {
            recordings_dir: parse_path("FLEET_RECORDINGS_DIR", ".fleet-controller/recordings"),
            capture_bin: env::var("FLEET_CAPTURE_BIN").unwrap_or_else(|_| "ffmpeg".to_string()),
            retention_days: parse_u64("FLEET_RETENTION_DAYS", 7)?,
            stop_grace: Duration::from_secs(parse_u64("FLEET_STOP_GRACE_SECS", 10)?),
            ..RecordingConfig::default()
        },
        ..FleetConfig::default()
    };

    let store = Arc::new(JsonlStore::open(&data_dir)?);
    let state = FleetState::new(config, store);

    let retired = state.recordings().purge_expired();
    if !retired.is_empty() {
        info!(count = retired.len(), "startup retention sweep retired recordings");
    }
    spawn_purge_sweep(state.clone(), purge_interval);

    let app = build_fleet_app(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("fleet controller listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.recordings().shutdown();
    Ok(())
}

fn spawn_purge_sweep(state: FleetState, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately and the startup sweep already ran.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let retired = state.recordings().purge_expired();
            if !retired.is_empty() {
                info!(count = retired.len(), "retention sweep retired recordings");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("shutdown signal listen failed: {err}");
    }
}

fn init_logging() {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn parse_addr(key: &str, default: &str) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    let value = env::var(key).unwrap_or_else(|_| default.to_string());
    Ok(value.parse()?)
}

fn parse_u64(key: &str, default: u64) -> Result<u64, Box<dyn std::error::Error>> {
    match env::var(key) {
        Ok(value) => Ok(value.parse()?),
        Err(_) => Ok(default),
    }
}

fn parse_usize(key: &str, default: usize) -> Result<usize, Box<dyn std::error::Error>> {
    match env::var(key) {
        Ok(value) => Ok(value.parse()?),
        Err(_) => Ok(default),
    }
}

fn parse_path(key: &str, default: &str) -> PathBuf {
    let value = env::var(key).unwrap_or_else(|_| default.to_string());
    let trimmed = value.trim();
    if trimmed.is_empty() {
        PathBuf::from(default)
    } else {
        PathBuf::from(trimmed)
    }
}

fn wants_version_flag() -> bool {
    env::args()
        .skip(1)
        .any(|arg| matches!(arg.as_str(), "-V" | "--version"))
}

fn version_text() -> String {
    format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

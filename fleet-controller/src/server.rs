use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use proto::{
    AckResponse, CommandRow, CommandSubmitResponse, ControlAction, DashboardEvent,
    DeviceServerMessage, ErrorResponse, EventRecord, IngestResponse, PurgeResponse,
    RecordingListResponse, StatusResponse,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    recording::{RecordingConfig, RecordingSupervisor},
    registry::{DeviceRegistry, DeviceSession},
    store::{DurableStore, StoreError},
};

mod handlers;
mod ws;

pub(crate) const CONTROL_SECRET_HEADER: &str = "x-control-secret";

#[derive(Clone, Debug)]
pub struct FleetConfig {
    // When unset, the privileged control/recording surface is disabled and
    // always fails closed.
    pub control_secret: Option<String>,
    pub command_page_size: usize,
    pub event_buffer: usize,
    pub recording: RecordingConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            control_secret: None,
            command_page_size: 50,
            event_buffer: 256,
            recording: RecordingConfig::default(),
        }
    }
}

struct FleetMetrics {
    started_at: Instant,
    events_ingested_total: AtomicU64,
    event_persist_failures_total: AtomicU64,
    commands_submitted_total: AtomicU64,
    commands_pushed_total: AtomicU64,
    commands_polled_total: AtomicU64,
    commands_acked_total: AtomicU64,
    recordings_started_total: AtomicU64,
    recordings_purged_total: AtomicU64,
}

impl Default for FleetMetrics {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            events_ingested_total: AtomicU64::new(0),
            event_persist_failures_total: AtomicU64::new(0),
            commands_submitted_total: AtomicU64::new(0),
            commands_pushed_total: AtomicU64::new(0),
            commands_polled_total: AtomicU64::new(0),
            commands_acked_total: AtomicU64::new(0),
            recordings_started_total: AtomicU64::new(0),
            recordings_purged_total: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("control credential missing or mismatched")]
    Forbidden,
    #[error("{0}")]
    NotFound(String),
    #[error("durable store failure: {0}")]
    Store(#[from] StoreError),
    #[error("capture process failure: {0}")]
    Process(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Store(_) | Self::Process(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Forbidden => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Store(_) => "store",
            Self::Process(_) => "process",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            error: self.to_string(),
            reason: self.reason().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Telemetry,
    Detection,
}

impl EventKind {
    fn wrap(self, event: EventRecord) -> DashboardEvent {
        match self {
            Self::Telemetry => DashboardEvent::Telemetry { event },
            Self::Detection => DashboardEvent::Detection { event },
        }
    }
}

#[derive(Clone)]
pub struct FleetState {
    registry: Arc<DeviceRegistry>,
    store: Arc<dyn DurableStore>,
    recordings: Arc<RecordingSupervisor>,
    events: broadcast::Sender<DashboardEvent>,
    metrics: Arc<FleetMetrics>,
    config: Arc<FleetConfig>,
}

impl FleetState {
    pub fn new(config: FleetConfig, store: Arc<dyn DurableStore>) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer);
        let recordings = Arc::new(RecordingSupervisor::new(config.recording.clone()));
        Self {
            registry: Arc::new(DeviceRegistry::new()),
            store,
            recordings,
            events,
            metrics: Arc::new(FleetMetrics::default()),
            config: Arc::new(config),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn recordings(&self) -> &RecordingSupervisor {
        &self.recordings
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DashboardEvent> {
        self.events.subscribe()
    }

    // Two-phase ingest shared by the live channel and one-shot requests.
    // The provisional broadcast happens before the store is consulted, and a
    // failed insert is never a request failure here.
    pub fn ingest(
        &self,
        kind: EventKind,
        device_id: Option<String>,
        payload: Option<Value>,
    ) -> Result<IngestResponse, ApiError> {
        let device_id = require_present(device_id, "device_id")?;
        let Some(payload) = payload else {
            return Err(ApiError::Validation("payload is required".to_string()));
        };

        let mut event = EventRecord {
            id: None,
            device_id,
            payload,
            event_key: Uuid::new_v4().to_string(),
            created_unix_ms: now_unix_ms(),
        };
        // Phase 1: provisional broadcast, before the store is touched.
        self.publish(kind.wrap(event.clone()));
        self.metrics.events_ingested_total.fetch_add(1, Ordering::Relaxed);

        let inserted = match kind {
            EventKind::Telemetry => {
                self.store
                    .insert_telemetry(&event.device_id, &event.payload, event.created_unix_ms)
            }
            EventKind::Detection => {
                self.store
                    .insert_detection(&event.device_id, &event.payload, event.created_unix_ms)
            }
        };
        match inserted {
            Ok(id) => {
                event.id = Some(id);
                // Phase 2: corrected broadcast, same event_key.
                self.publish(kind.wrap(event));
                Ok(IngestResponse {
                    accepted: true,
                    persisted: true,
                    id: Some(id),
                })
            }
            Err(err) => {
                self.metrics
                    .event_persist_failures_total
                    .fetch_add(1, Ordering::Relaxed);
                match kind {
                    EventKind::Telemetry => {
                        warn!(device_id = %event.device_id, "telemetry accepted but not persisted: {err}");
                    }
                    EventKind::Detection => {
                        debug!(device_id = %event.device_id, "detection not persisted: {err}");
                    }
                }
                Ok(IngestResponse {
                    accepted: true,
                    persisted: false,
                    id: None,
                })
            }
        }
    }

    // Unlike ingest, a store failure here is a hard failure: the whole point
    // of submission is the durable row the device will poll for.
    pub fn submit_command(
        &self,
        device_id: Option<String>,
        command: Option<Value>,
    ) -> Result<CommandSubmitResponse, ApiError> {
        let device_id = require_present(device_id, "device_id")?;
        let Some(command) = command else {
            return Err(ApiError::Validation("command is required".to_string()));
        };

        let created_unix_ms = now_unix_ms();
        let id = self.store.insert_command(&device_id, &command, created_unix_ms)?;
        self.metrics.commands_submitted_total.fetch_add(1, Ordering::Relaxed);

        let row = CommandRow {
            id,
            device_id: device_id.clone(),
            command,
            processed: false,
            created_unix_ms,
        };
        self.publish(DashboardEvent::Command { command: row.clone() });

        if let Some(session) = self.registry.lookup(&device_id) {
            // Push never marks the command processed; only an explicit ack
            // does. The device may be gone before it acts on this.
            if session.push(DeviceServerMessage::Command { command: row }) {
                self.metrics.commands_pushed_total.fetch_add(1, Ordering::Relaxed);
            } else {
                warn!(device_id = %device_id, "live session gone before push, command left for polling");
            }
        }

        Ok(CommandSubmitResponse { id })
    }

    pub fn poll_commands(
        &self,
        device_id: Option<String>,
        limit: Option<usize>,
    ) -> Result<Vec<CommandRow>, ApiError> {
        let device_id = require_present(device_id, "device_id")?;
        let page = self.config.command_page_size;
        let limit = limit.map_or(page, |value| value.min(page));
        let rows = self.store.unprocessed_commands(&device_id, limit)?;
        self.metrics.commands_polled_total.fetch_add(1, Ordering::Relaxed);
        Ok(rows)
    }

    // Idempotent; repeats and unknown ids are both acknowledged.
    pub fn acknowledge(&self, command_id: i64) -> Result<AckResponse, ApiError> {
        let existed = self.store.mark_processed(command_id)?;
        if !existed {
            debug!(command_id, "ack for unknown command id");
        }
        self.metrics.commands_acked_total.fetch_add(1, Ordering::Relaxed);
        Ok(AckResponse { ok: true })
    }

    pub fn push_control(
        &self,
        device_id: &str,
        action: ControlAction,
    ) -> Result<AckResponse, ApiError> {
        let Some(session) = self.registry.lookup(device_id) else {
            return Err(ApiError::NotFound(format!(
                "device {device_id} has no live session"
            )));
        };
        if !session.push(DeviceServerMessage::Control { action }) {
            return Err(ApiError::NotFound(format!(
                "device {device_id} session is gone"
            )));
        }
        info!(device_id = %device_id, action = action.as_str(), "control action pushed");
        Ok(AckResponse { ok: true })
    }

    pub(crate) fn register_device(&self, device_id: &str, session: &DeviceSession) {
        self.registry.register(device_id, session.clone());
        info!(device_id = %device_id, session_id = %session.session_id(), "device registered");
        session.push(DeviceServerMessage::RegisterAck {
            ok: true,
            device_id: Some(device_id.to_string()),
            error: None,
        });
    }

    pub(crate) fn require_control_secret(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let Some(expected) = self.config.control_secret.as_deref() else {
            return Err(ApiError::Forbidden);
        };
        let supplied = headers
            .get(CONTROL_SECRET_HEADER)
            .and_then(|value| value.to_str().ok());
        match supplied {
            Some(given) if given == expected => Ok(()),
            _ => Err(ApiError::Forbidden),
        }
    }

    fn publish(&self, event: DashboardEvent) {
        // Send fails only when no dashboard is subscribed; the broadcast
        // attempt is still considered made.
        let _ = self.events.send(event);
    }
}

pub fn build_fleet_app(state: FleetState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/telemetry", post(handlers::submit_telemetry_handler))
        .route("/detections", post(handlers::submit_detection_handler))
        .route(
            "/commands",
            post(handlers::submit_command_handler).get(handlers::poll_commands_handler),
        )
        .route("/commands/{command_id}/ack", post(handlers::ack_command_handler))
        .route(
            "/control/{device_id}/{action}",
            post(handlers::push_control_handler),
        )
        .route("/recordings", get(handlers::list_recordings_handler))
        .route("/recordings/start", post(handlers::start_recording_handler))
        .route("/recordings/stop", post(handlers::stop_recording_handler))
        .route("/recordings/purge", post(handlers::purge_recordings_handler))
        .route("/ws/device", get(ws::device_channel_handler))
        .route("/ws/dashboard", get(ws::dashboard_channel_handler))
        .layer(middleware::from_fn(handlers::access_log_middleware))
        .with_state(state)
}

fn require_present(value: Option<String>, field: &str) -> Result<String, ApiError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ApiError::Validation(format!("{field} is required"))),
    }
}

pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

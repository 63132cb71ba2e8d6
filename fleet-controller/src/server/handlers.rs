use serde::Deserialize;

use super::*;

pub(super) async fn access_log_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started.elapsed().as_millis();
    if path != "/healthz" && !path.starts_with("/ws/") {
        info!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            elapsed_ms = elapsed_ms,
            "http access"
        );
    }
    response
}

pub(super) async fn healthz_handler() -> Json<StatusResponse> {
    Json(StatusResponse { status: "ok" })
}

pub(super) async fn metrics_handler(State(state): State<FleetState>) -> impl IntoResponse {
    let metrics = format!(
        concat!(
            "fleet_controller_uptime_seconds {}\n",
            "fleet_controller_connected_devices {}\n",
            "fleet_controller_dashboard_subscribers {}\n",
            "fleet_controller_active_recordings {}\n",
            "fleet_controller_events_ingested_total {}\n",
            "fleet_controller_event_persist_failures_total {}\n",
            "fleet_controller_commands_submitted_total {}\n",
            "fleet_controller_commands_pushed_total {}\n",
            "fleet_controller_commands_polled_total {}\n",
            "fleet_controller_commands_acked_total {}\n",
            "fleet_controller_recordings_started_total {}\n",
            "fleet_controller_recordings_purged_total {}\n"
        ),
        state.metrics.started_at.elapsed().as_secs(),
        state.registry.connected(),
        state.events.receiver_count(),
        state.recordings.active(),
        state.metrics.events_ingested_total.load(Ordering::Relaxed),
        state
            .metrics
            .event_persist_failures_total
            .load(Ordering::Relaxed),
        state.metrics.commands_submitted_total.load(Ordering::Relaxed),
        state.metrics.commands_pushed_total.load(Ordering::Relaxed),
        state.metrics.commands_polled_total.load(Ordering::Relaxed),
        state.metrics.commands_acked_total.load(Ordering::Relaxed),
        state.metrics.recordings_started_total.load(Ordering::Relaxed),
        state.metrics.recordings_purged_total.load(Ordering::Relaxed),
    );
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics,
    )
}

pub(super) async fn submit_telemetry_handler(
    State(state): State<FleetState>,
    Json(request): Json<proto::IngestRequest>,
) -> Result<Json<IngestResponse>, ApiError> {
    state
        .ingest(EventKind::Telemetry, request.device_id, request.payload)
        .map(Json)
}

pub(super) async fn submit_detection_handler(
    State(state): State<FleetState>,
    Json(request): Json<proto::IngestRequest>,
) -> Result<Json<IngestResponse>, ApiError> {
    state
        .ingest(EventKind::Detection, request.device_id, request.payload)
        .map(Json)
}

pub(super) async fn submit_command_handler(
    State(state): State<FleetState>,
    Json(request): Json<proto::CommandSubmitRequest>,
) -> Result<Json<CommandSubmitResponse>, ApiError> {
    state.submit_command(request.device_id, request.command).map(Json)
}

#[derive(Deserialize)]
pub(super) struct CommandPollParams {
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

pub(super) async fn poll_commands_handler(
    State(state): State<FleetState>,
    Query(params): Query<CommandPollParams>,
) -> Result<Json<Vec<CommandRow>>, ApiError> {
    state.poll_commands(params.device_id, params.limit).map(Json)
}

pub(super) async fn ack_command_handler(
    State(state): State<FleetState>,
    Path(command_id): Path<i64>,
) -> Result<Json<AckResponse>, ApiError> {
    state.acknowledge(command_id).map(Json)
}

pub(super) async fn push_control_handler(
    State(state): State<FleetState>,
    Path((device_id, action)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<AckResponse>, ApiError> {
    state.require_control_secret(&headers)?;
    let Some(action) = ControlAction::parse(&action) else {
        return Err(ApiError::Validation(format!("unknown control action: {action}")));
    };
    state.push_control(&device_id, action).map(Json)
}

pub(super) async fn start_recording_handler(
    State(state): State<FleetState>,
    headers: HeaderMap,
    Json(request): Json<proto::RecordingStartRequest>,
) -> Result<Json<proto::RecordingStartResponse>, ApiError> {
    state.require_control_secret(&headers)?;
    let device_id = require_present(request.device_id, "device_id")?;
    let source = require_present(request.source, "source")?;
    let started = state
        .recordings
        .start(&device_id, &source)
        .map_err(|err| ApiError::Process(err.to_string()))?;
    state.metrics.recordings_started_total.fetch_add(1, Ordering::Relaxed);
    Ok(Json(started))
}

pub(super) async fn stop_recording_handler(
    State(state): State<FleetState>,
    headers: HeaderMap,
    Json(request): Json<proto::RecordingStopRequest>,
) -> Result<Json<proto::RecordingStopResponse>, ApiError> {
    state.require_control_secret(&headers)?;
    let device_id = require_present(request.device_id, "device_id")?;
    let session_id = require_present(request.session_id, "session_id")?;
    Ok(Json(state.recordings.stop(&device_id, &session_id)))
}

pub(super) async fn list_recordings_handler(
    State(state): State<FleetState>,
    headers: HeaderMap,
) -> Result<Json<RecordingListResponse>, ApiError> {
    state.require_control_secret(&headers)?;
    let recordings = state
        .recordings
        .list()
        .map_err(|err| ApiError::Process(format!("recordings scan failed: {err}")))?;
    Ok(Json(RecordingListResponse { recordings }))
}

pub(super) async fn purge_recordings_handler(
    State(state): State<FleetState>,
    headers: HeaderMap,
) -> Result<Json<PurgeResponse>, ApiError> {
    state.require_control_secret(&headers)?;
    let removed = state.recordings.purge_expired();
    state
        .metrics
        .recordings_purged_total
        .fetch_add(removed.len() as u64, Ordering::Relaxed);
    Ok(Json(PurgeResponse { removed }))
}

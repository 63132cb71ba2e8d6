use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use futures::{SinkExt, StreamExt};
use proto::DeviceMessage;
use serde::Deserialize;
use tokio::sync::{broadcast::error::RecvError, mpsc};

use super::*;

#[derive(Deserialize)]
pub(super) struct DeviceChannelParams {
    #[serde(default)]
    device_id: Option<String>,
}

pub(super) async fn device_channel_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<DeviceChannelParams>,
    State(state): State<FleetState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_device_channel(socket, state, params.device_id))
}

async fn run_device_channel(
    socket: WebSocket,
    state: FleetState,
    handshake_device_id: Option<String>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let session = DeviceSession::new(outbound_tx);
    let session_id = session.session_id();
    info!(session_id = %session_id, "device channel connected");

    let send_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Handshake-parameter registration: a device id carried on the upgrade
    // query binds before any message arrives.
    if let Some(device_id) = handshake_device_id.filter(|id| !id.trim().is_empty()) {
        state.register_device(&device_id, &session);
    }

    while let Some(frame) = ws_rx.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(session_id = %session_id, "device channel error: {err}");
                break;
            }
        };
        let message: DeviceMessage = match serde_json::from_str(text.as_str()) {
            Ok(message) => message,
            Err(err) => {
                warn!(session_id = %session_id, "unparseable device message: {err}");
                continue;
            }
        };
        dispatch_device_message(&state, &session, message);
    }

    // Teardown must clear every binding that points at this session, not
    // just the latest one.
    let removed = state.registry.unregister_session(session_id);
    info!(session_id = %session_id, devices = ?removed, "device channel closed");
    send_task.abort();
}

fn dispatch_device_message(state: &FleetState, session: &DeviceSession, message: DeviceMessage) {
    match message {
        DeviceMessage::Register { device_id } => {
            match device_id.filter(|id| !id.trim().is_empty()) {
                Some(device_id) => state.register_device(&device_id, session),
                None => {
                    session.push(DeviceServerMessage::RegisterAck {
                        ok: false,
                        device_id: None,
                        error: Some("device_id is required".to_string()),
                    });
                }
            }
        }
        DeviceMessage::Telemetry { device_id, payload } => {
            if let Err(err) = state.ingest(EventKind::Telemetry, Some(device_id), Some(payload)) {
                warn!("telemetry over device channel rejected: {err}");
            }
        }
        DeviceMessage::Detection { device_id, payload } => {
            if let Err(err) = state.ingest(EventKind::Detection, Some(device_id), Some(payload)) {
                warn!("detection over device channel rejected: {err}");
            }
        }
        DeviceMessage::Ack { command_id } => {
            if let Err(err) = state.acknowledge(command_id) {
                warn!(command_id, "ack over device channel failed: {err}");
            }
        }
    }
}

pub(super) async fn dashboard_channel_handler(
    ws: WebSocketUpgrade,
    State(state): State<FleetState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_dashboard_channel(socket, state))
}

async fn run_dashboard_channel(socket: WebSocket, state: FleetState) {
    let mut events = state.subscribe_events();
    let (mut ws_tx, mut ws_rx) = socket.split();
    info!("dashboard channel connected");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "dashboard subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!("dashboard channel error: {err}");
                    break;
                }
            },
        }
    }

    info!("dashboard channel closed");
}

use serde::{Deserialize, Serialize};
use serde_json::Value;

// Fan-out events are broadcast twice: a provisional copy with `id: None`
// before the durable store is consulted, then a confirmed copy carrying the
// assigned id. Both copies share the same `event_key`; consumers dedupe on it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub id: Option<i64>,
    pub device_id: String,
    pub payload: Value,
    pub event_key: String,
    pub created_unix_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CommandRow {
    pub id: i64,
    pub device_id: String,
    pub command: Value,
    pub processed: bool,
    pub created_unix_ms: u64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Start,
    Stop,
}

impl ControlAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    Register {
        #[serde(default)]
        device_id: Option<String>,
    },
    Telemetry {
        device_id: String,
        payload: Value,
    },
    Detection {
        device_id: String,
        payload: Value,
    },
    Ack {
        command_id: i64,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceServerMessage {
    RegisterAck {
        ok: bool,
        #[serde(default)]
        device_id: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    Command {
        command: CommandRow,
    },
    Control {
        action: ControlAction,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardEvent {
    Telemetry { event: EventRecord },
    Detection { event: EventRecord },
    Command { command: CommandRow },
}

// Request fields are optional so a missing one surfaces as a validation
// failure from the controller, not as a decode rejection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestRequest {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub accepted: bool,
    pub persisted: bool,
    pub id: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandSubmitRequest {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub command: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandSubmitResponse {
    pub id: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub ok: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordingStartRequest {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordingStartResponse {
    pub session_id: String,
    pub output_file: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordingStopRequest {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordingStopResponse {
    pub session_id: String,
    pub output_file: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordingEntry {
    pub file: String,
    pub size_bytes: u64,
    pub modified_unix_ms: u64,
    pub age_days: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordingListResponse {
    pub recordings: Vec<RecordingEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub removed: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

// `reason` is the categorical tag clients switch on; `error` is the detail.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn device_message_round_trips_tagged_form() {
        let raw = r#"{"type":"telemetry","device_id":"r1","payload":{"temp":21}}"#;
        let message: DeviceMessage = serde_json::from_str(raw).expect("telemetry should decode");
        match message {
            DeviceMessage::Telemetry { device_id, payload } => {
                assert_eq!(device_id, "r1");
                assert_eq!(payload, json!({"temp": 21}));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn register_without_device_id_decodes_as_none() {
        let message: DeviceMessage =
            serde_json::from_str(r#"{"type":"register"}"#).expect("register should decode");
        match message {
            DeviceMessage::Register { device_id } => assert!(device_id.is_none()),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn control_action_parses_known_verbs_only() {
        assert_eq!(ControlAction::parse("start"), Some(ControlAction::Start));
        assert_eq!(ControlAction::parse("stop"), Some(ControlAction::Stop));
        assert_eq!(ControlAction::parse("reboot"), None);
    }

    #[test]
    fn provisional_event_serializes_null_id() {
        let event = EventRecord {
            id: None,
            device_id: "r1".to_string(),
            payload: json!({"temp": 21}),
            event_key: "k-1".to_string(),
            created_unix_ms: 1_700_000_000_000,
        };
        let value = serde_json::to_value(&event).expect("event should encode");
        assert_eq!(value["id"], Value::Null);
        assert_eq!(value["event_key"], "k-1");
    }

    #[test]
    fn ingest_request_treats_null_payload_as_absent() {
        let request: IngestRequest =
            serde_json::from_str(r#"{"device_id":"r1","payload":null}"#)
                .expect("request should decode");
        assert_eq!(request.device_id.as_deref(), Some("r1"));
        assert!(request.payload.is_none());
    }
}

//! Gateway RPC protocol definitions.
//!
//! All communication uses JSON frames over a persistent duplex connection.
//!
//! Frame types:
//! - `RequestFrame`  — client → gateway RPC call
//! - `ResponseFrame` — gateway → client RPC result
//! - `EventFrame`    — gateway → client server-push
//! - `PresenceFrame` — client → gateway presence heartbeat

use serde::{Deserialize, Serialize};

// ── Constants ────────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_PAYLOAD_BYTES: usize = 524_288; // 512 KB
pub const TICK_INTERVAL_MS: u64 = 30_000; // 30s
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_APPROVAL_TIMEOUT_MS: u64 = 300_000; // 5 min
pub const DEFAULT_INVOKE_TIMEOUT_MS: u64 = 30_000;

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const HTTP_ERROR: &str = "HTTP_ERROR";
    pub const QUEUE_FULL: &str = "QUEUE_FULL";
    pub const NOT_PAIRED: &str = "NOT_PAIRED";
    pub const NOT_CONNECTED: &str = "NOT_CONNECTED";
}

// ── Roles and scopes ─────────────────────────────────────────────────────────

pub mod roles {
    pub const OPERATOR: &str = "operator";
    pub const NODE: &str = "node";
    pub const UNKNOWN: &str = "unknown";
}

pub mod scopes {
    pub const ADMIN: &str = "operator.admin";
    pub const READ: &str = "operator.read";
    pub const WRITE: &str = "operator.write";
    pub const APPROVALS: &str = "operator.approvals";
    pub const PAIRING: &str = "operator.pairing";

    /// Default scope set granted when a connect request names none.
    pub fn default_set() -> Vec<String> {
        vec![
            ADMIN.into(),
            READ.into(),
            WRITE.into(),
            APPROVALS.into(),
            PAIRING.into(),
        ]
    }
}

/// Event names the gateway can push. Returned in the connect snapshot so
/// clients can feature-detect.
pub fn event_names() -> Vec<String> {
    [
        "connect.challenge",
        "agent",
        "chat",
        "presence",
        "tick",
        "health",
        "cron",
        "lanes.enqueued",
        "lanes.dequeued",
        "lanes.completed",
        "lanes.depth.changed",
        "device.pair.requested",
        "device.pair.resolved",
        "exec.approval.requested",
        "exec.approval.resolved",
        "node.pair.requested",
        "node.pair.resolved",
        "node.event",
        "node.invoke.request",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// ── Error shape ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(
        code: impl Into<String>,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_REQUEST, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(error_codes::UNAVAILABLE, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(error_codes::NOT_FOUND, message)
    }
}

impl std::fmt::Display for ErrorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Client → gateway RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub r#type: String, // always "req"
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl RequestFrame {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            r#type: "req".into(),
            id: id.into(),
            method: method.into(),
            params: Some(params),
        }
    }
}

/// Gateway → client RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub r#type: String, // always "res"
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            r#type: "res".into(),
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            r#type: "res".into(),
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }
}

/// Gateway → client server-push event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub r#type: String, // always "event"
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(rename = "stateVersion", skip_serializing_if = "Option::is_none")]
    pub state_version: Option<StateVersion>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: serde_json::Value, seq: u64) -> Self {
        Self {
            r#type: "event".into(),
            event: event.into(),
            payload: Some(payload),
            seq: Some(seq),
            state_version: None,
        }
    }
}

/// Opaque per-connection ordering guard carried on every event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StateVersion {
    pub presence: u64,
    pub health: u64,
}

/// Discriminated union of all inbound frame types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    #[serde(rename = "req")]
    Request(RequestFrameInner),
    #[serde(rename = "res")]
    Response(ResponseFrameInner),
    #[serde(rename = "event")]
    Event(EventFrameInner),
    #[serde(rename = "presence")]
    Presence(PresenceFrame),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrameInner {
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrameInner {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrameInner {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Client → gateway presence heartbeat. Not answered; refreshes the roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceFrame {
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    pub mode: String,
    #[serde(rename = "lastInputSeconds", skip_serializing_if = "Option::is_none")]
    pub last_input_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

// ── Connect ──────────────────────────────────────────────────────────────────

/// Parameters of the `connect` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceIdentity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
}

/// Device identity presented on connect (edge nodes and paired devices).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caps: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Credentials carried by the `connect` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_round_trips() {
        let raw = r#"{"type":"req","id":"1","method":"health","params":{}}"#;
        let frame: GatewayFrame = serde_json::from_str(raw).unwrap();
        match frame {
            GatewayFrame::Request(req) => {
                assert_eq!(req.id, "1");
                assert_eq!(req.method, "health");
            },
            other => panic!("expected request frame, got {other:?}"),
        }
    }

    #[test]
    fn presence_frame_parses() {
        let raw = r#"{"type":"presence","instanceId":"mac-1","mode":"ui","lastInputSeconds":4}"#;
        let frame: GatewayFrame = serde_json::from_str(raw).unwrap();
        match frame {
            GatewayFrame::Presence(p) => {
                assert_eq!(p.instance_id, "mac-1");
                assert_eq!(p.last_input_seconds, Some(4));
            },
            other => panic!("expected presence frame, got {other:?}"),
        }
    }

    #[test]
    fn response_err_carries_code() {
        let res = ResponseFrame::err("9", ErrorShape::invalid("bad params"));
        let json = serde_json::to_value(&res).unwrap();
        assert_eq!(json["ok"], serde_json::json!(false));
        assert_eq!(json["error"]["code"], "INVALID_REQUEST");
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn event_frame_serializes_state_version() {
        let mut ev = EventFrame::new("tick", serde_json::json!({"ts": 1}), 7);
        ev.state_version = Some(StateVersion {
            presence: 3,
            health: 2,
        });
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["seq"], 7);
        assert_eq!(json["stateVersion"]["presence"], 3);
    }

    #[test]
    fn connect_params_accept_wire_names() {
        let raw = r#"{"role":"node","clientId":"n1","device":{"deviceId":"n1","platform":"macos","commands":["system.run"]},"auth":{"deviceToken":"tok_x"}}"#;
        let params: ConnectParams = serde_json::from_str(raw).unwrap();
        assert_eq!(params.role.as_deref(), Some("node"));
        let device = params.device.unwrap();
        assert_eq!(device.device_id, "n1");
        assert_eq!(device.commands, vec!["system.run"]);
        assert_eq!(params.auth.unwrap().device_token.as_deref(), Some("tok_x"));
    }

    #[test]
    fn default_scope_set_includes_admin() {
        assert!(scopes::default_set().iter().any(|s| s == scopes::ADMIN));
    }
}

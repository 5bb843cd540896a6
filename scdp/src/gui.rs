//! Request/response DTOs for the GUI-facing JSON-over-HTTP boundary (§6).
//!
//! This module implements the *data shapes* of the endpoint table only. No
//! HTTP routing, WebSocket server, or CLI command tree lives here or
//! anywhere in this crate — those collaborators are out of scope.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

#[cfg(feature = "config")]
use scdp_config::ConnectionDescriptor;
#[cfg(feature = "events")]
use scdp_events::SessionState;

/// The failure envelope wrapping every non-2xx response body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// The error payload.
    pub error: ErrorBody,
}

/// The `code`/`message` pair inside an [`ErrorEnvelope`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// A stable error code, e.g. `"session/already-active"`.
    pub code: String,
    /// A human-readable description.
    pub message: String,
}

/// `GET /api/connections` response.
#[cfg(feature = "config")]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionsListResponse {
    /// Connection descriptors with their secret fields redacted (see
    /// [`ConnectionDescriptor::redacted`]).
    pub connections: Vec<ConnectionDescriptor>,
}

/// `POST /api/connections` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionCreatedResponse {
    /// The id assigned to the new connection.
    pub id: String,
}

/// `{success:true}` response shared by the update, delete, session-stop, and
/// network start/stop/clear endpoints.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SuccessResponse {
    /// Always `true`; failures are reported via [`ErrorEnvelope`] instead.
    pub success: bool,
}

impl Default for SuccessResponse {
    fn default() -> Self {
        Self { success: true }
    }
}

/// `POST /api/connections/:id/test` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestConnectionResponse {
    /// Whether the connection attempt succeeded.
    pub success: bool,
    /// A human-readable result description.
    pub message: String,
}

/// `POST /api/session/start` request body.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartRequest {
    /// The id of the connection descriptor to use.
    pub connection_id: String,
    /// Overrides the configured `headless` default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headless: Option<bool>,
    /// Overrides the configured local forward port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    /// Overrides the configured remote debug port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
}

/// `POST /api/session/start` response.
#[cfg(feature = "events")]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionStartResponse {
    /// Whether the session reached the ready state.
    pub success: bool,
    /// The session's state immediately after starting.
    pub state: SessionState,
}

/// `GET /api/session/status` response.
#[cfg(feature = "events")]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionStatusResponse {
    /// Whether a session is currently active.
    pub active: bool,
    /// The session's current state, or `None` when no session is active.
    pub state: Option<SessionState>,
}

/// `POST /api/browser/navigate` request body.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigateRequest {
    /// The URL to navigate to.
    pub url: String,
    /// One of `"domcontentloaded"`, `"load"`, `"networkidle"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_until: Option<String>,
    /// Navigation timeout in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// `POST /api/browser/navigate` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NavigateResponse {
    /// The URL the page ended up at.
    pub url: String,
    /// The page title after navigation settled.
    pub title: String,
}

/// `POST /api/browser/{back,forward,reload}` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryNavResponse {
    /// The URL the page ended up at, if the navigation had anywhere to go.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// `POST /api/browser/screenshot` request body.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotRequest {
    /// One of `"png"`, `"jpeg"`, `"webp"`. Defaults to `"png"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// JPEG/WebP quality, 0-100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    /// Captures the full scrollable page rather than just the viewport.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_page: Option<bool>,
}

/// `POST /api/browser/screenshot` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScreenshotResponse {
    /// The base64-encoded image bytes.
    pub data: String,
    /// The image format the data is encoded in.
    pub format: String,
}

/// `POST /api/browser/evaluate` request body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvaluateRequest {
    /// The JavaScript expression to evaluate in the page's main frame.
    pub expression: String,
}

/// `POST /api/browser/evaluate` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvaluateResponse {
    /// The JSON-serialized result of the expression.
    pub result: Value,
}

/// `POST /api/network/{start,stop,clear}` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkActionResponse {
    /// Whether the action succeeded.
    pub success: bool,
    /// The number of entries affected, where applicable (e.g. cleared).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

/// `GET /api/network/entries` query parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEntriesQuery {
    /// Maximum number of entries to return.
    pub limit: usize,
    /// Number of entries to skip from the start.
    pub offset: usize,
    /// Filters entries to a resource type, e.g. `"xhr"`, `"document"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    /// Filters entries to an HTTP status code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

/// `GET /api/network/entries` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkEntriesResponse {
    /// The page of matching entries.
    pub entries: Vec<Value>,
    /// The total number of entries matching the filter, before paging.
    pub total: usize,
    /// Echoes the request's `limit`.
    pub limit: usize,
    /// Echoes the request's `offset`.
    pub offset: usize,
}

/// `GET /api/network/export` query parameters.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// HAR v1.2.
    Har,
    /// Raw JSON entries.
    Json,
}

/// An envelope frame on the `/api/events` WebSocket stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventFrame {
    /// The event's discriminant, e.g. `"state-changed"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// The event-specific payload.
    pub payload: Value,
    /// Milliseconds since the Unix epoch when the event was emitted.
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_round_trips_through_json() {
        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: "session/not-active".to_string(),
                message: "no active session".to_string(),
            },
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: ErrorEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.error.code, "session/not-active");
    }

    #[test]
    fn session_start_request_accepts_minimal_body() {
        let parsed: SessionStartRequest = serde_json::from_str(r#"{"connectionId":"dev"}"#).unwrap();
        assert_eq!(parsed.connection_id, "dev");
        assert!(parsed.headless.is_none());
    }

    #[test]
    fn network_entries_query_omits_absent_filters() {
        let query = NetworkEntriesQuery {
            limit: 50,
            offset: 0,
            r#type: None,
            status: None,
        };
        let json = serde_json::to_string(&query).unwrap();
        assert!(!json.contains("type"));
        assert!(!json.contains("status"));
    }
}

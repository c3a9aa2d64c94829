//! IPC protocol for worker subprocess communication.
//!
//! Messages are bincode-serialized and travel inside the length-prefixed
//! frames of [`crate::codec`]. The frame payload is not self-describing,
//! so dynamic user data (handler payloads, broadcast messages, maint
//! arguments) is carried as JSON text in a [`JsonPayload`]; binary bodies
//! stay raw byte vectors.

use crate::config::PoolConfig;
use crate::error::Result;
use crate::http::RequestArgs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A JSON document embedded in a binary frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonPayload(String);

impl JsonPayload {
    pub fn new(value: &serde_json::Value) -> Result<Self> {
        Ok(Self(serde_json::to_string(value)?))
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.0)?)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JsonPayload {
    fn default() -> Self {
        Self("null".to_string())
    }
}

/// Trimmed view of the host, sent with `Startup`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub hostname: String,
    pub ip: String,
    /// Whether the parent runs with the emergency-shutdown handler armed.
    pub uncaught_exception: bool,
}

/// A request as written to the child: the pool-assigned id plus the
/// collaborator-supplied arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    pub id: String,
    pub args: RequestArgs,
}

/// Parent → child commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// First frame after spawn: the pool config and a view of the host.
    Startup {
        config: PoolConfig,
        server: ServerInfo,
    },
    /// Dispatch an HTTP-shaped request to the handler.
    Request(WireRequest),
    /// Dispatch a programmatic work unit to the custom handler.
    Custom { id: String, params: JsonPayload },
    /// Perform maintenance once the active-request count drains.
    Maint { data: Option<JsonPayload> },
    /// Broadcast payload for the handler's message hook.
    Message { data: JsonPayload },
    /// Debug-inspector plumbing (`start_debug` / `stop_debug` / ...).
    Internal { data: JsonPayload },
    /// Drain and exit cleanly.
    Shutdown,
}

/// Body of a worker response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Body {
    Empty,
    Text(String),
    Bytes(Vec<u8>),
    /// A serialized JSON document still awaiting JSON/JSONP rendering.
    Json(String),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Text(s) => s.is_empty(),
            Body::Bytes(b) => b.is_empty(),
            Body::Json(s) => s.is_empty(),
        }
    }
}

/// Response body typing, applied by the worker before the frame is
/// written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyKind {
    /// Plain string body.
    String,
    /// Binary blob.
    Buffer,
    /// Body is a path; the parent stats and streams the file.
    File,
    /// Custom response, forwarded untouched.
    Passthrough,
    /// Server-sent events; the body is empty and chunks travelled
    /// out-of-band.
    Sse,
}

/// Child → parent response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireResponse {
    pub id: String,
    /// Full status line, e.g. "200 OK".
    pub status: String,
    pub kind: BodyKind,
    pub headers: HashMap<String, String>,
    pub body: Body,
    /// Timing metrics collected by the worker, in milliseconds.
    pub perf: Option<HashMap<String, f64>>,
    /// When set, the parent logs this alongside the response.
    pub log_error: Option<String>,
    /// For `File` responses: unlink the path once the stream is handed
    /// off.
    pub delete: bool,
}

impl WireResponse {
    /// Response shell with an OK status and empty string body.
    pub fn shell(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: crate::http::status::OK.to_string(),
            kind: BodyKind::String,
            headers: HashMap::new(),
            body: Body::Empty,
            perf: None,
            log_error: None,
            delete: false,
        }
    }

    pub fn error(id: impl Into<String>, status: &str, message: impl Into<String>) -> Self {
        let mut resp = Self::shell(id);
        resp.status = status.to_string();
        resp.body = Body::Text(message.into());
        resp
    }
}

/// Apply JSON/JSONP wrapping to a serialized document.
///
/// With a `callback` query param the body becomes padded JSON with a
/// `text/javascript` content type; otherwise it stays `application/json`.
/// The worker applies this before writing the response frame, and the
/// proxy mirrors it for workers that ship structured bodies unrendered.
pub fn render_json(json_text: String, callback: Option<&str>) -> (String, &'static str) {
    match callback {
        Some(cb) => (format!("{}({});", cb, json_text), "text/javascript"),
        None => (json_text, "application/json"),
    }
}

/// Child → parent replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    /// Config absorbed, user startup hook done.
    StartupComplete,
    Response(WireResponse),
    /// Out-of-band server-sent-events chunk.
    Sse { id: String, chunk: Vec<u8> },
    MaintComplete,
    /// Handler payload echoed to the pool's event stream.
    Message { data: JsonPayload },
    /// Debug-inspector handshake (`debug_started`, ...).
    Internal { data: JsonPayload },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_payload_roundtrip() {
        let value = json!({"test": 1234, "nested": {"k": [1, 2, 3]}});
        let payload = JsonPayload::new(&value).unwrap();
        assert_eq!(payload.to_value().unwrap(), value);
    }

    #[test]
    fn command_roundtrip_through_bincode() {
        let cmd = Command::Custom {
            id: "m3k1-a".into(),
            params: JsonPayload::new(&json!({"test": 1234})).unwrap(),
        };
        let bytes = bincode::serialize(&cmd).unwrap();
        let decoded: Command = bincode::deserialize(&bytes).unwrap();
        match decoded {
            Command::Custom { id, params } => {
                assert_eq!(id, "m3k1-a");
                assert_eq!(params.to_value().unwrap()["test"], 1234);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn response_with_binary_body_roundtrips() {
        let mut resp = WireResponse::shell("r1");
        resp.kind = BodyKind::Buffer;
        resp.body = Body::Bytes(vec![0, 1, 2, 254, 255]);
        let bytes = bincode::serialize(&Reply::Response(resp.clone())).unwrap();
        let decoded: Reply = bincode::deserialize(&bytes).unwrap();
        match decoded {
            Reply::Response(r) => assert_eq!(r, resp),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn error_response_shape() {
        let resp = WireResponse::error("r2", crate::http::status::INTERNAL_SERVER_ERROR, "boom");
        assert_eq!(resp.status, "500 Internal Server Error");
        assert_eq!(resp.body, Body::Text("boom".into()));
        assert_eq!(resp.kind, BodyKind::String);
    }
}

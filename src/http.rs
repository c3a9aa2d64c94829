//! Request and response surface types shared by the pool side and the
//! worker side.
//!
//! The external HTTP server is a collaborator, not part of this crate: it
//! hands a [`RequestArgs`] in and consumes a [`Completed`] out. Statuses
//! travel as full status-line strings ("200 OK") because that is the shape
//! the collaborator callback expects.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Status-line strings for the error surface returned to external clients.
pub mod status {
    pub const OK: &str = "200 OK";
    pub const FORBIDDEN: &str = "403 Forbidden";
    pub const TOO_MANY_REQUESTS: &str = "429 Too Many Requests";
    pub const INTERNAL_SERVER_ERROR: &str = "500 Internal Server Error";
    pub const SERVICE_UNAVAILABLE: &str = "503 Service Unavailable";
    pub const GATEWAY_TIMEOUT: &str = "504 Gateway Timeout";
}

/// Compile a URI pattern as an anchored regex. A pattern that already
/// starts with `^` is taken as-is.
pub fn anchored_regex(pattern: &str) -> std::result::Result<regex::Regex, regex::Error> {
    if pattern.starts_with('^') {
        regex::Regex::new(pattern)
    } else {
        regex::Regex::new(&format!("^{}", pattern))
    }
}

/// Metadata of an uploaded file. Only the descriptor crosses the IPC
/// boundary, never the file contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub name: String,
    pub size: u64,
    pub content_type: String,
    pub path: String,
}

/// Request parameters: decoded form/JSON fields plus an optional raw
/// binary body, which rides the frame codec as a native blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Params {
    /// Decoded fields, JSON-encoded (the frame payload is not
    /// self-describing, so dynamic values travel as JSON text).
    pub fields: HashMap<String, String>,
    /// Raw request body, if the collaborator captured one.
    pub raw: Option<Vec<u8>>,
}

/// A work unit as supplied by the HTTP collaborator (or a programmatic
/// caller). This is what `Pool::dispatch` accepts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestArgs {
    /// Client address the connection arrived from.
    pub ip: String,
    /// Full client IP chain (X-Forwarded-For plus the socket peer).
    pub ips: Vec<String>,
    pub method: String,
    pub http_version: String,
    /// Path component of the request.
    pub uri: String,
    /// Full URL as received.
    pub url: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub files: Vec<UploadedFile>,
    pub params: Params,
}

impl RequestArgs {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// One-line summary for log correlation.
    pub fn summary(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

/// Body handed back to the dispatch caller.
pub enum CompletedBody {
    Empty,
    Text(String),
    Bytes(Vec<u8>),
    /// An open read stream for a `file` response. `len` was injected into
    /// the `Content-Length` header from the stat.
    Stream { file: tokio::fs::File, len: u64 },
}

impl std::fmt::Debug for CompletedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Text(s) => write!(f, "Text({} bytes)", s.len()),
            Self::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Self::Stream { len, .. } => write!(f, "Stream({} bytes)", len),
        }
    }
}

impl CompletedBody {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            Self::Empty => 0,
            Self::Text(s) => s.len() as u64,
            Self::Bytes(b) => b.len() as u64,
            Self::Stream { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Final outcome of a dispatched request, passed to the caller callback as
/// `(status, headers, body)`.
#[derive(Debug)]
pub struct Completed {
    pub status: String,
    pub headers: HashMap<String, String>,
    pub body: CompletedBody,
    /// Perf metrics imported from the worker response, if present.
    pub perf: HashMap<String, f64>,
}

impl Completed {
    /// Build an error response with a plain-text body.
    pub fn error(status: &str, message: impl Into<String>) -> Self {
        Self {
            status: status.to_string(),
            headers: HashMap::new(),
            body: CompletedBody::Text(message.into()),
            perf: HashMap::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == status::OK
    }
}

/// Outcome of a custom dispatch: the decoded body plus parent- and
/// worker-side perf metrics.
#[derive(Debug)]
pub struct CustomReply {
    pub body: serde_json::Value,
    pub perf: HashMap<String, f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut args = RequestArgs::default();
        args.headers
            .insert("Accept-Encoding".into(), "gzip, br".into());
        assert_eq!(args.header("accept-encoding"), Some("gzip, br"));
        assert_eq!(args.header("ACCEPT-ENCODING"), Some("gzip, br"));
        assert_eq!(args.header("content-type"), None);
    }

    #[test]
    fn error_body_carries_message() {
        let resp = Completed::error(status::TOO_MANY_REQUESTS, "pool at capacity");
        assert_eq!(resp.status, status::TOO_MANY_REQUESTS);
        assert_eq!(resp.body.as_text(), Some("pool at capacity"));
        assert!(!resp.is_ok());
    }
}

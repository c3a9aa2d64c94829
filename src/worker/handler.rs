//! User handler trait and the response plumbing handed to it.
//!
//! Handlers complete a request through an explicit tagged value rather
//! than positional callback overloading: an error, a full
//! status/headers/body triple, or a bare JSON document.

use super::WorkerState;
use super::compress::{self, CompressConfig};
use crate::http::{RequestArgs, status};
use crate::protocol::{Body, BodyKind, Reply, ServerInfo, WireResponse, render_json};
use crate::config::PoolConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;

/// Context handed to the `startup` hook: the absorbed pool config and the
/// parent's view of the host.
pub struct WorkerContext {
    pub config: PoolConfig,
    pub server: ServerInfo,
    pub pid: u32,
}

/// A request as seen by a handler.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: String,
    pub args: RequestArgs,
}

impl Request {
    pub fn query(&self, key: &str) -> Option<&str> {
        self.args.query.get(key).map(String::as_str)
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.args.params.fields.get(key).map(String::as_str)
    }
}

/// Body of a handler-built response.
#[derive(Debug, Clone)]
pub enum ResponseBody {
    Empty,
    Text(String),
    Bytes(Vec<u8>),
    /// Body is a file on disk; the parent stats and streams it.
    File { path: String, delete: bool },
    /// Structured document, rendered as JSON/JSONP before the frame is
    /// written.
    Json(serde_json::Value),
}

/// How a handler completes a request.
#[derive(Debug)]
pub enum HandlerResponse {
    /// Handler failure; surfaces as a 500 and is logged parent-side.
    Error(String),
    /// Explicit status line, headers and body.
    Full {
        status: String,
        headers: HashMap<String, String>,
        body: ResponseBody,
    },
    /// Bare structured document; becomes a 200 with JSON typing rules
    /// applied (pretty / JSONP per query params).
    Json(serde_json::Value),
}

/// The user module a worker process embeds.
///
/// Only `request` is mandatory. URI-routed handlers registered on the
/// runtime receive requests whose URI matches their pattern, first match
/// in registration order; everything else lands on the generic handler.
pub trait Handler: Send + Sync + 'static {
    /// Called once after the startup command, before `StartupComplete`
    /// is sent. An error aborts the worker.
    fn startup(&self, _ctx: &WorkerContext) -> Result<(), String> {
        Ok(())
    }

    /// Handle an HTTP-shaped request. Must eventually call
    /// `responder.complete` (or drive SSE through `send`/`end`).
    fn request(&self, req: Request, responder: Responder);

    /// Handle a programmatic work unit.
    fn custom(&self, _params: serde_json::Value, responder: CustomResponder) {
        responder.complete(Err("no custom handler registered".to_string()));
    }

    /// Broadcast payload from the pool. A returned value is echoed back
    /// to the pool's event stream.
    fn message(&self, _data: serde_json::Value) -> Option<serde_json::Value> {
        None
    }

    /// Housekeeping hook, invoked once the active-request count drains.
    fn maint(&self, _data: Option<serde_json::Value>) {}

    /// Clean shutdown hook, invoked after the drain.
    fn shutdown(&self) {}

    /// Best-effort hook when the parent died or the worker is tearing
    /// down after a panic.
    fn emergency_shutdown(&self) {
        self.shutdown();
    }
}

const SLOT_PENDING: u8 = 0;
const SLOT_DONE: u8 = 1;
const SLOT_ABORTED: u8 = 2;

/// Per-request completion slot. The deadline timer and the handler race
/// for it; whichever transitions it first wins.
pub(crate) struct RequestSlot {
    id: String,
    state: AtomicU8,
    sse_started: AtomicBool,
    reply_tx: mpsc::UnboundedSender<Reply>,
    worker: Arc<WorkerState>,
    started: Instant,
}

impl RequestSlot {
    pub(crate) fn new(
        id: String,
        reply_tx: mpsc::UnboundedSender<Reply>,
        worker: Arc<WorkerState>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: AtomicU8::new(SLOT_PENDING),
            sse_started: AtomicBool::new(false),
            reply_tx,
            worker,
            started: Instant::now(),
        })
    }

    fn take(&self, next: u8) -> bool {
        self.state
            .compare_exchange(SLOT_PENDING, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Mark the request aborted by the worker-side deadline. No response
    /// is sent; the parent enforces the same timeout and answers 504.
    pub(crate) fn abort(&self) -> bool {
        if self.take(SLOT_ABORTED) {
            self.worker.finish();
            true
        } else {
            false
        }
    }

    fn finish_with(&self, resp: WireResponse) {
        self.worker.finish();
        let _ = self.reply_tx.send(Reply::Response(resp));
    }
}

/// Completion handle for `request` handlers. Cheap to clone into spawned
/// tasks; completion is idempotent.
#[derive(Clone)]
pub struct Responder {
    slot: Arc<RequestSlot>,
    compress: Arc<CompressConfig>,
    /// `pretty` query param present.
    pretty: bool,
    /// `callback` query param, for JSONP wrapping.
    callback: Option<String>,
    accept_encoding: String,
}

impl Responder {
    pub(crate) fn new(slot: Arc<RequestSlot>, compress: Arc<CompressConfig>, args: &RequestArgs) -> Self {
        Self {
            slot,
            compress,
            pretty: args.query.contains_key("pretty"),
            callback: args.query.get("callback").cloned(),
            accept_encoding: args
                .header("accept-encoding")
                .unwrap_or_default()
                .to_string(),
        }
    }

    pub fn id(&self) -> &str {
        &self.slot.id
    }

    /// Complete the request. After SSE has started this behaves like
    /// [`Responder::end`].
    pub fn complete(self, response: HandlerResponse) {
        if self.slot.sse_started.load(Ordering::SeqCst) {
            self.end();
            return;
        }
        if !self.slot.take(SLOT_DONE) {
            tracing::debug!(id = %self.slot.id, "response after abort/completion dropped");
            return;
        }

        let elapsed_ms = self.slot.started.elapsed().as_secs_f64() * 1000.0;
        let mut resp = self.build_response(response);
        resp.perf
            .get_or_insert_with(HashMap::new)
            .insert("handler_ms".to_string(), elapsed_ms);

        if let Some(encoding) = compress::eligible(&resp, &self.accept_encoding, &self.compress) {
            if let Err(e) = compress::apply(&mut resp, encoding) {
                tracing::warn!(id = %self.slot.id, error = %e, "response compression failed");
                resp = WireResponse::error(
                    self.slot.id.clone(),
                    status::INTERNAL_SERVER_ERROR,
                    format!("response compression failed: {}", e),
                );
            }
        }

        self.slot.finish_with(resp);
    }

    /// Emit an out-of-band server-sent-events chunk.
    pub fn send(&self, chunk: impl Into<Vec<u8>>) {
        if self.slot.state.load(Ordering::SeqCst) != SLOT_PENDING {
            return;
        }
        self.slot.sse_started.store(true, Ordering::SeqCst);
        let _ = self.slot.reply_tx.send(Reply::Sse {
            id: self.slot.id.clone(),
            chunk: chunk.into(),
        });
    }

    /// Finalise an SSE response.
    pub fn end(self) {
        if !self.slot.take(SLOT_DONE) {
            return;
        }
        let mut resp = WireResponse::shell(self.slot.id.clone());
        resp.kind = BodyKind::Sse;
        self.slot.finish_with(resp);
    }

    fn build_response(&self, response: HandlerResponse) -> WireResponse {
        let id = self.slot.id.clone();
        match response {
            HandlerResponse::Error(message) => {
                let mut resp = WireResponse::error(
                    id,
                    status::INTERNAL_SERVER_ERROR,
                    message.clone(),
                );
                resp.log_error = Some(message);
                resp
            }
            HandlerResponse::Json(value) => {
                let mut resp = WireResponse::shell(id);
                self.set_json_body(&mut resp, &value);
                resp
            }
            HandlerResponse::Full {
                status,
                headers,
                body,
            } => {
                let mut resp = WireResponse::shell(id);
                resp.status = status;
                resp.headers = headers;
                match body {
                    ResponseBody::Empty => {
                        resp.kind = BodyKind::String;
                        resp.body = Body::Empty;
                    }
                    ResponseBody::Text(text) => {
                        resp.kind = BodyKind::String;
                        resp.body = Body::Text(text);
                    }
                    ResponseBody::Bytes(bytes) => {
                        resp.kind = BodyKind::Buffer;
                        resp.body = Body::Bytes(bytes);
                    }
                    ResponseBody::File { path, delete } => {
                        resp.kind = BodyKind::File;
                        resp.body = Body::Text(path);
                        resp.delete = delete;
                    }
                    ResponseBody::Json(value) => self.set_json_body(&mut resp, &value),
                }
                resp
            }
        }
    }

    fn set_json_body(&self, resp: &mut WireResponse, value: &serde_json::Value) {
        let text = if self.pretty {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string())
        } else {
            serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
        };
        let (body, content_type) = render_json(text, self.callback.as_deref());
        resp.kind = BodyKind::String;
        resp.body = Body::Text(body);
        if !resp.headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
            resp.headers
                .insert("Content-Type".to_string(), content_type.to_string());
        }
    }
}

/// Completion handle for `custom` handlers. The body is passed through
/// untouched; non-200 statuses become errors on the dispatching side.
pub struct CustomResponder {
    slot: Arc<RequestSlot>,
}

impl CustomResponder {
    pub(crate) fn new(slot: Arc<RequestSlot>) -> Self {
        Self { slot }
    }

    pub fn id(&self) -> &str {
        &self.slot.id
    }

    pub fn complete(self, result: Result<serde_json::Value, String>) {
        if !self.slot.take(SLOT_DONE) {
            tracing::debug!(id = %self.slot.id, "custom response after abort dropped");
            return;
        }
        let elapsed_ms = self.slot.started.elapsed().as_secs_f64() * 1000.0;
        let mut resp = match result {
            Ok(value) => {
                let mut resp = WireResponse::shell(self.slot.id.clone());
                resp.kind = BodyKind::Passthrough;
                resp.body = Body::Json(
                    serde_json::to_string(&value).unwrap_or_else(|_| "null".to_string()),
                );
                resp
            }
            Err(message) => {
                let mut resp = WireResponse::error(
                    self.slot.id.clone(),
                    status::INTERNAL_SERVER_ERROR,
                    message.clone(),
                );
                resp.log_error = Some(message);
                resp
            }
        };
        resp.perf
            .get_or_insert_with(HashMap::new)
            .insert("handler_ms".to_string(), elapsed_ms);
        self.slot.finish_with(resp);
    }
}

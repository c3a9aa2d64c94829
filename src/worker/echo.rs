//! Built-in echo handler.
//!
//! Backs the `prefork worker` subcommand: a small handler that echoes
//! request metadata back to the caller. The integration tests drive pools
//! of these workers; `sleep_ms` makes a request take long enough to
//! observe concurrency caps and auto-scaling.

use super::handler::{
    CustomResponder, Handler, HandlerResponse, Request, Responder, ResponseBody, WorkerContext,
};
use crate::http::status;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

/// Echoes requests and custom work units, with an optional artificial
/// delay driven by the `sleep_ms` query or body parameter.
#[derive(Debug, Default)]
pub struct EchoHandler;

impl EchoHandler {
    fn sleep_duration(req: &Request) -> Option<Duration> {
        let ms = req
            .query("sleep_ms")
            .or_else(|| req.param("sleep_ms"))?
            .parse::<u64>()
            .ok()?;
        (ms > 0).then(|| Duration::from_millis(ms))
    }
}

impl Handler for EchoHandler {
    fn startup(&self, ctx: &WorkerContext) -> Result<(), String> {
        tracing::debug!(pid = ctx.pid, hostname = %ctx.server.hostname, "echo worker online");
        Ok(())
    }

    fn request(&self, req: Request, responder: Responder) {
        if req.query("panic").is_some() {
            panic!("echo worker asked to panic");
        }

        if let Some(path) = req.query("file") {
            let mut headers = HashMap::new();
            headers.insert("Content-Type".to_string(), "text/plain".to_string());
            responder.complete(HandlerResponse::Full {
                status: status::OK.to_string(),
                headers,
                body: ResponseBody::File {
                    path: path.to_string(),
                    delete: req.query("delete").is_some(),
                },
            });
            return;
        }

        if req.query("mode") == Some("buffer") {
            let mut headers = HashMap::new();
            headers.insert(
                "Content-Type".to_string(),
                "application/octet-stream".to_string(),
            );
            responder.complete(HandlerResponse::Full {
                status: status::OK.to_string(),
                headers,
                body: ResponseBody::Bytes(vec![0x00, 0x01, 0x02, 0xfe, 0xff]),
            });
            return;
        }

        let delay = Self::sleep_duration(&req);
        let body = json!({
            "msg": "ok",
            "pid": std::process::id(),
            "method": req.args.method,
            "uri": req.args.uri,
        });

        if req.query("sse").is_some() {
            tokio::spawn(async move {
                for n in 0..3u8 {
                    responder.send(format!("event: tick\ndata: {}\n\n", n).into_bytes());
                }
                responder.end();
            });
            return;
        }

        match delay {
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    responder.complete(HandlerResponse::Json(body));
                });
            }
            None => responder.complete(HandlerResponse::Json(body)),
        }
    }

    fn custom(&self, params: serde_json::Value, responder: CustomResponder) {
        let sleep_ms = params.get("sleep_ms").and_then(|v| v.as_u64()).unwrap_or(0);
        let reply = json!({
            "code": 0,
            "params": params,
            "pid": std::process::id(),
        });
        if sleep_ms > 0 {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                responder.complete(Ok(reply));
            });
        } else {
            responder.complete(Ok(reply));
        }
    }

    fn message(&self, data: serde_json::Value) -> Option<serde_json::Value> {
        // Echo broadcasts back so pool event subscribers can observe
        // delivery.
        Some(json!({"echo": data, "pid": std::process::id()}))
    }

    fn maint(&self, data: Option<serde_json::Value>) {
        tracing::info!(payload = ?data, "echo worker maintenance");
    }

    fn shutdown(&self) {
        tracing::debug!(pid = std::process::id(), "echo worker shutting down");
    }
}

//! Worker subprocess main loop.
//!
//! Reads commands from stdin as binary frames, hands requests to the
//! embedded handler, and writes replies to stdout. The parent owns the
//! interrupt signal (ignored here); a terminate signal means the parent
//! died and triggers emergency shutdown.

use super::compress::CompressConfig;
use super::handler::{CustomResponder, Handler, Request, RequestSlot, Responder, WorkerContext};
use super::WorkerState;
use crate::codec::{AsyncFrameReader, AsyncFrameWriter};
use crate::error::{PreforkError, Result};
use crate::http::anchored_regex;
use crate::protocol::{Command, JsonPayload, Reply};
use regex::Regex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

/// The embeddable worker runtime: a generic handler plus optional
/// URI-routed handlers checked first, in registration order.
pub struct WorkerRuntime {
    routes: Vec<(Regex, Arc<dyn Handler>)>,
    handler: Arc<dyn Handler>,
}

impl WorkerRuntime {
    pub fn new(handler: impl Handler) -> Self {
        Self {
            routes: Vec::new(),
            handler: Arc::new(handler),
        }
    }

    /// Register a URI-routed handler. Requests whose URI matches the
    /// anchored pattern are dispatched here instead of the generic
    /// handler; first registered match wins.
    pub fn route(mut self, pattern: &str, handler: impl Handler) -> Result<Self> {
        let regex = anchored_regex(pattern).map_err(|source| PreforkError::UriPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        self.routes.push((regex, Arc::new(handler)));
        Ok(self)
    }

    fn handler_for(&self, uri: &str) -> Arc<dyn Handler> {
        for (regex, handler) in &self.routes {
            if regex.is_match(uri) {
                return handler.clone();
            }
        }
        self.handler.clone()
    }

    /// Run the worker until the parent shuts it down. Never returns:
    /// exits 0 on clean shutdown, 1 on error or emergency shutdown.
    pub fn run(self) -> ! {
        // A panic anywhere must still give the user module its
        // emergency hook before the process dies.
        let panic_handler = self.handler.clone();
        std::panic::set_hook(Box::new(move |info| {
            tracing::error!("worker panicked: {}", info);
            panic_handler.emergency_shutdown();
            std::process::exit(1);
        }));

        let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                eprintln!("worker failed to start runtime: {}", e);
                std::process::exit(1);
            }
        };

        match runtime.block_on(self.run_loop()) {
            Ok(()) => std::process::exit(0),
            Err(e) => {
                eprintln!("worker error: {}", e);
                std::process::exit(1);
            }
        }
    }

    async fn run_loop(self) -> Result<()> {
        // The parent owns SIGINT; installing a listener replaces the
        // default termination behaviour.
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::spawn(async move {
            loop {
                sigint.recv().await;
            }
        });

        // SIGTERM means the parent crashed: run the emergency hook and go.
        let mut sigterm = signal(SignalKind::terminate())?;
        let emergency_handler = self.handler.clone();
        tokio::spawn(async move {
            sigterm.recv().await;
            tracing::warn!("terminate signal received, running emergency shutdown");
            emergency_handler.emergency_shutdown();
            std::process::exit(1);
        });

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Reply>();
        let writer_task = tokio::spawn(async move {
            let mut writer = AsyncFrameWriter::new(tokio::io::stdout());
            while let Some(reply) = reply_rx.recv().await {
                if let Err(e) = writer.write(&reply).await {
                    tracing::error!(error = %e, "failed to write reply frame");
                    return Err(e);
                }
            }
            writer.close().await
        });

        let state = WorkerState::new();
        let mut reader = AsyncFrameReader::new(tokio::io::stdin());
        let mut compress: Arc<CompressConfig> = Arc::new(CompressConfig::disabled());
        let mut request_timeout: Option<Duration> = None;

        loop {
            let command = match reader.read::<Command>().await {
                Ok(Some(command)) => command,
                // Parent closed the pipe: drain and exit cleanly.
                Ok(None) => break,
                Err(PreforkError::Decode(e)) => {
                    tracing::warn!(error = %e, "discarding undecodable command frame");
                    continue;
                }
                Err(e) => return Err(e),
            };

            match command {
                Command::Startup { config, server } => {
                    compress = Arc::new(
                        CompressConfig::new(config.compress_response, &config.compress_types)
                            .map_err(|e| PreforkError::Config(e.to_string()))?,
                    );
                    request_timeout = config.request_timeout();
                    let ctx = WorkerContext {
                        config,
                        server,
                        pid: std::process::id(),
                    };
                    self.handler
                        .startup(&ctx)
                        .map_err(PreforkError::Worker)?;
                    let _ = reply_tx.send(Reply::StartupComplete);
                    tracing::debug!(pid = ctx.pid, "worker startup complete");
                }

                Command::Request(wire) => {
                    state.begin();
                    let slot = RequestSlot::new(wire.id.clone(), reply_tx.clone(), state.clone());
                    let responder = Responder::new(slot.clone(), compress.clone(), &wire.args);
                    arm_deadline(request_timeout, &slot);

                    let handler = self.handler_for(&wire.args.uri);
                    let request = Request {
                        id: wire.id,
                        args: wire.args,
                    };
                    tokio::spawn(async move {
                        handler.request(request, responder);
                    });
                }

                Command::Custom { id, params } => {
                    state.begin();
                    let slot = RequestSlot::new(id, reply_tx.clone(), state.clone());
                    let responder = CustomResponder::new(slot.clone());
                    arm_deadline(request_timeout, &slot);

                    match params.to_value() {
                        Ok(value) => {
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                handler.custom(value, responder);
                            });
                        }
                        Err(e) => responder.complete(Err(format!("invalid custom params: {}", e))),
                    }
                }

                Command::Maint { data } => {
                    let payload = data.as_ref().and_then(|d| d.to_value().ok());
                    let handler = self.handler.clone();
                    let state = state.clone();
                    let reply_tx = reply_tx.clone();
                    tokio::spawn(async move {
                        state.wait_idle().await;
                        handler.maint(payload);
                        let _ = reply_tx.send(Reply::MaintComplete);
                    });
                }

                Command::Message { data } => match data.to_value() {
                    Ok(value) => {
                        if let Some(echo) = self.handler.message(value) {
                            if let Ok(payload) = JsonPayload::new(&echo) {
                                let _ = reply_tx.send(Reply::Message { data: payload });
                            }
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "invalid message payload"),
                },

                Command::Internal { data } => {
                    let reply = handle_internal(data.to_value().unwrap_or(serde_json::Value::Null));
                    if let Ok(payload) = JsonPayload::new(&reply) {
                        let _ = reply_tx.send(Reply::Internal { data: payload });
                    }
                }

                Command::Shutdown => break,
            }
        }

        // Drain in-flight requests, run the user hook, then flush the
        // outbound stream before exiting.
        state.wait_idle().await;
        self.handler.shutdown();
        drop(reply_tx);
        match writer_task.await {
            Ok(result) => result?,
            Err(e) => return Err(PreforkError::Worker(format!("writer task failed: {}", e))),
        }
        tracing::debug!(served = state.served(), "worker shutdown complete");
        Ok(())
    }
}

/// Arm the worker-side request deadline, co-enforced with the parent.
/// On expiry the request is marked aborted and the active counter drops
/// without a response frame; whichever side fires first wins.
///
/// The timer holds only a weak reference: a completed request drops its
/// slot (and its reply-channel sender) immediately, so a draining worker
/// is not pinned open by timers that have not fired yet.
fn arm_deadline(timeout: Option<Duration>, slot: &Arc<RequestSlot>) {
    if let Some(timeout) = timeout {
        let slot = Arc::downgrade(slot);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(slot) = slot.upgrade() {
                if slot.abort() {
                    tracing::warn!("request aborted by worker-side deadline");
                }
            }
        });
    }
}

/// Debug-inspector plumbing for `internal` commands.
fn handle_internal(data: serde_json::Value) -> serde_json::Value {
    let pid = std::process::id();
    match data.get("action").and_then(|a| a.as_str()) {
        Some("start_debug") | Some("update_debug") => json!({
            "action": "debug_started",
            "pid": pid,
            "url": serde_json::Value::Null,
        }),
        Some("stop_debug") => json!({
            "action": "debug_stopped",
            "pid": pid,
        }),
        _ => data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RequestArgs;
    use crate::worker::{HandlerResponse, ResponseBody};
    use std::collections::HashMap;

    struct Tagged(&'static str);

    impl Handler for Tagged {
        fn request(&self, _req: Request, responder: Responder) {
            responder.complete(HandlerResponse::Full {
                status: crate::http::status::OK.to_string(),
                headers: HashMap::new(),
                body: ResponseBody::Text(self.0.to_string()),
            });
        }
    }

    fn complete_sync(handler: Arc<dyn Handler>) -> String {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let state = WorkerState::new();
        state.begin();
        let slot = RequestSlot::new("r".into(), tx, state);
        let responder = Responder::new(
            slot,
            Arc::new(CompressConfig::disabled()),
            &RequestArgs::default(),
        );
        handler.request(
            Request {
                id: "r".into(),
                args: RequestArgs::default(),
            },
            responder,
        );
        match rx.try_recv().unwrap() {
            Reply::Response(resp) => match resp.body {
                crate::protocol::Body::Text(text) => text,
                other => panic!("unexpected body: {:?}", other),
            },
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn routes_match_in_registration_order() {
        let runtime = WorkerRuntime::new(Tagged("generic"))
            .route("/api/img", Tagged("img"))
            .unwrap()
            .route("/api", Tagged("api"))
            .unwrap();

        assert_eq!(complete_sync(runtime.handler_for("/api/img/42")), "img");
        assert_eq!(complete_sync(runtime.handler_for("/api/users")), "api");
        assert_eq!(complete_sync(runtime.handler_for("/other")), "generic");
    }

    #[test]
    fn route_patterns_are_anchored() {
        let runtime = WorkerRuntime::new(Tagged("generic"))
            .route("/api", Tagged("api"))
            .unwrap();
        // Matches only at the start of the URI.
        assert_eq!(complete_sync(runtime.handler_for("/prefix/api")), "generic");
    }

    #[test]
    fn internal_debug_actions() {
        let reply = handle_internal(json!({"action": "start_debug"}));
        assert_eq!(reply["action"], "debug_started");
        assert_eq!(reply["pid"], std::process::id());

        let reply = handle_internal(json!({"action": "stop_debug"}));
        assert_eq!(reply["action"], "debug_stopped");

        let passthrough = handle_internal(json!({"action": "unknown", "k": 7}));
        assert_eq!(passthrough["k"], 7);
    }
}

//! Parent-side representative of one worker subprocess.
//!
//! The proxy owns the child process handle, the framed streams on its
//! stdio, the pending-request table, and the per-child lifecycle timers.
//! It is driven entirely by its pool's actor task; its background tasks
//! (frame reader, stderr reader, exit waiter, timers) only ever report
//! back through the pool's event channel.

use super::manager::KillList;
use crate::codec::{AsyncFrameReader, AsyncFrameWriter};
use crate::config::PoolConfig;
use crate::error::{PreforkError, Result};
use crate::http::{Completed, CustomReply, RequestArgs, status};
use crate::protocol::{Command, JsonPayload, Reply, ServerInfo, WireRequest};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as ProcessCommand;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Proxy lifecycle. Transitions are monotonic within one child life:
/// `Startup → Active → (Active ↔ Maint)* → Shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Startup,
    Active,
    Maint,
    Shutdown,
}

/// Timer and stream notifications a proxy's background tasks send to the
/// owning pool.
#[derive(Debug)]
pub(crate) enum ProxyEvent {
    Frame { pid: u32, reply: Reply },
    /// Child stdout reached EOF.
    StreamClosed { pid: u32 },
    /// Fatal error on the child's stdout stream.
    StreamError { pid: u32, error: String },
    /// OS reported the child gone.
    Exited { pid: u32, code: Option<i32> },
    StartupTimeout { pid: u32 },
    MaintTimeout { pid: u32 },
    KillTimeout { pid: u32 },
    RequestTimeout { pid: u32, request_id: String },
}

/// Where a finished request reports back to.
pub(crate) enum Completion {
    Request(oneshot::Sender<Completed>),
    Custom(oneshot::Sender<Result<CustomReply>>),
}

impl Completion {
    /// Resolve with an error surface status.
    pub(crate) fn fail(self, status_line: &str, message: String) {
        match self {
            Completion::Request(tx) => {
                let _ = tx.send(Completed::error(status_line, message));
            }
            Completion::Custom(tx) => {
                let _ = tx.send(Err(PreforkError::RequestFailed(format!(
                    "{}: {}",
                    status_line, message
                ))));
            }
        }
    }
}

/// A dispatched request awaiting its response frame.
pub(crate) struct PendingRequest {
    /// Origin summary ("GET /img/4") for log correlation.
    pub(crate) summary: String,
    /// `pretty` query param, for mirrored JSON rendering.
    pub(crate) pretty: bool,
    /// `callback` query param, for mirrored JSONP rendering.
    pub(crate) callback: Option<String>,
    pub(crate) completion: Completion,
    pub(crate) timeout: Option<JoinHandle<()>>,
    pub(crate) started: Instant,
}

impl PendingRequest {
    pub(crate) fn cancel_timeout(&mut self) {
        if let Some(timer) = self.timeout.take() {
            timer.abort();
        }
    }
}

pub(crate) struct WorkerProxy {
    pid: u32,
    state: ProxyState,
    pending: HashMap<String, PendingRequest>,
    num_requests_served: u64,
    /// Resolved per-child request budget; 0 when recycling is disabled.
    pub(crate) request_budget: u64,
    /// Requests served as of the last maintenance pass.
    pub(crate) last_maint_requests: u64,
    pub(crate) last_maint_time: Instant,
    /// Pending operator maintenance request with its payload.
    pub(crate) request_maint: Option<Option<serde_json::Value>>,
    pub(crate) request_restart: bool,
    /// Part of the pool's initial `min_children` launch.
    pub(crate) initial_launch: bool,
    child_exited: bool,
    writer_tx: Option<mpsc::UnboundedSender<Command>>,
    startup_timer: Option<JoinHandle<()>>,
    maint_timer: Option<JoinHandle<()>>,
    kill_timer: Option<JoinHandle<()>>,
    kill_list: Arc<KillList>,
}

impl WorkerProxy {
    /// Spawn the child process and wire up its streams. The first frame
    /// out is `Startup`; the startup timer is armed immediately.
    pub(crate) fn spawn(
        pool_id: &str,
        config: &PoolConfig,
        server: &ServerInfo,
        initial_launch: bool,
        event_tx: mpsc::UnboundedSender<ProxyEvent>,
        kill_list: Arc<KillList>,
    ) -> Result<Self> {
        let mut command = ProcessCommand::new(&config.exec_cmd);
        command
            .args(&config.exec_args)
            .envs(&config.exec_env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = config.exec_cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| PreforkError::Spawn(format!("{}: {}", config.exec_cmd.display(), e)))?;
        let pid = child
            .id()
            .ok_or_else(|| PreforkError::Spawn("child exited before pid was read".into()))?;
        kill_list.register(pid);

        tracing::info!(pool = %pool_id, pid, "spawned worker");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PreforkError::Spawn("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PreforkError::Spawn("child stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PreforkError::Spawn("child stderr not captured".into()))?;

        // Outbound frames: all writes to one child funnel through this
        // task, which serialises them. Closing the channel closes the
        // child's stdin.
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Command>();
        tokio::spawn(async move {
            let mut writer = AsyncFrameWriter::new(stdin);
            while let Some(command) = writer_rx.recv().await {
                if let Err(e) = writer.write(&command).await {
                    tracing::debug!(pid, error = %e, "write to worker failed");
                    break;
                }
            }
            let _ = writer.close().await;
        });

        // Inbound frames: a dedicated reader task, because read_exact is
        // not cancel-safe inside select loops.
        let frame_tx = event_tx.clone();
        tokio::spawn(async move {
            let mut reader = AsyncFrameReader::new(stdout);
            loop {
                match reader.read::<Reply>().await {
                    Ok(Some(reply)) => {
                        if frame_tx.send(ProxyEvent::Frame { pid, reply }).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = frame_tx.send(ProxyEvent::StreamClosed { pid });
                        break;
                    }
                    Err(PreforkError::Decode(e)) => {
                        tracing::warn!(pid, error = %e, "discarding undecodable frame from worker");
                    }
                    Err(e) => {
                        let _ = frame_tx.send(ProxyEvent::StreamError {
                            pid,
                            error: e.to_string(),
                        });
                        break;
                    }
                }
            }
        });

        // stderr stays a text channel; re-log it with severity guessed
        // from conventional prefixes.
        tokio::spawn(log_worker_stderr(pid, stderr));

        // Exit waiter: removal from the pool happens only after the OS
        // reports the child gone.
        let exit_tx = event_tx.clone();
        let exit_kill_list = kill_list.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(exit_status) => exit_status.code(),
                Err(e) => {
                    tracing::warn!(pid, error = %e, "wait on worker failed");
                    None
                }
            };
            exit_kill_list.unregister(pid);
            let _ = exit_tx.send(ProxyEvent::Exited { pid, code });
        });

        let startup_timer = {
            let timeout = config.startup_timeout();
            let timer_tx = event_tx;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = timer_tx.send(ProxyEvent::StartupTimeout { pid });
            })
        };

        let mut rng = rand::thread_rng();
        let proxy = Self {
            pid,
            state: ProxyState::Startup,
            pending: HashMap::new(),
            num_requests_served: 0,
            request_budget: config.max_requests_per_child.resolve(&mut rng),
            last_maint_requests: 0,
            last_maint_time: Instant::now(),
            request_maint: None,
            request_restart: false,
            initial_launch,
            child_exited: false,
            writer_tx: Some(writer_tx),
            startup_timer: Some(startup_timer),
            maint_timer: None,
            kill_timer: None,
            kill_list,
        };

        proxy.send(Command::Startup {
            config: config.clone(),
            server: server.clone(),
        });
        Ok(proxy)
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn state(&self) -> ProxyState {
        self.state
    }

    /// Invariant: the active-request count is the pending table size.
    pub(crate) fn active_requests(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn requests_served(&self) -> u64 {
        self.num_requests_served
    }

    pub(crate) fn accepts_requests(&self) -> bool {
        self.state == ProxyState::Active
    }

    fn send(&self, command: Command) {
        if let Some(ref tx) = self.writer_tx {
            let _ = tx.send(command);
        }
    }

    /// Write a request frame and register the pending entry.
    pub(crate) fn dispatch(
        &mut self,
        request_id: String,
        args: RequestArgs,
        completion: Completion,
        timeout: Option<Duration>,
        event_tx: &mpsc::UnboundedSender<ProxyEvent>,
    ) {
        let timeout_task = timeout.map(|timeout| {
            let timer_tx = event_tx.clone();
            let pid = self.pid;
            let id = request_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = timer_tx.send(ProxyEvent::RequestTimeout {
                    pid,
                    request_id: id,
                });
            })
        });

        self.pending.insert(
            request_id.clone(),
            PendingRequest {
                summary: args.summary(),
                pretty: args.query.contains_key("pretty"),
                callback: args.query.get("callback").cloned(),
                completion,
                timeout: timeout_task,
                started: Instant::now(),
            },
        );

        self.send(Command::Request(WireRequest {
            id: request_id,
            args,
        }));
    }

    /// Dispatch a custom work unit.
    pub(crate) fn dispatch_custom(
        &mut self,
        request_id: String,
        params: JsonPayload,
        completion: Completion,
        timeout: Option<Duration>,
        event_tx: &mpsc::UnboundedSender<ProxyEvent>,
    ) {
        let timeout_task = timeout.map(|timeout| {
            let timer_tx = event_tx.clone();
            let pid = self.pid;
            let id = request_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = timer_tx.send(ProxyEvent::RequestTimeout {
                    pid,
                    request_id: id,
                });
            })
        });

        self.pending.insert(
            request_id.clone(),
            PendingRequest {
                summary: "custom".to_string(),
                pretty: false,
                callback: None,
                completion,
                timeout: timeout_task,
                started: Instant::now(),
            },
        );

        self.send(Command::Custom {
            id: request_id,
            params,
        });
    }

    /// Remove and return a pending entry; `None` means the request is
    /// unknown (already completed, timed out, or a duplicate response).
    pub(crate) fn take_pending(&mut self, request_id: &str) -> Option<PendingRequest> {
        let mut pending = self.pending.remove(request_id)?;
        pending.cancel_timeout();
        Some(pending)
    }

    /// Count a served request toward maintenance and recycle budgets.
    pub(crate) fn mark_served(&mut self) {
        self.num_requests_served += 1;
    }

    /// The worker finished startup.
    pub(crate) fn complete_startup(&mut self) -> bool {
        if self.state != ProxyState::Startup {
            tracing::debug!(pid = self.pid, state = ?self.state, "unexpected startup_complete");
            return false;
        }
        if let Some(timer) = self.startup_timer.take() {
            timer.abort();
        }
        self.state = ProxyState::Active;
        self.last_maint_time = Instant::now();
        true
    }

    /// Ask the worker to run maintenance and arm the maint timer.
    pub(crate) fn maint(
        &mut self,
        data: Option<serde_json::Value>,
        timeout: Duration,
        event_tx: &mpsc::UnboundedSender<ProxyEvent>,
    ) {
        if self.state != ProxyState::Active {
            return;
        }
        let payload = data.as_ref().and_then(|v| JsonPayload::new(v).ok());
        self.send(Command::Maint { data: payload });
        self.state = ProxyState::Maint;

        let timer_tx = event_tx.clone();
        let pid = self.pid;
        self.maint_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timer_tx.send(ProxyEvent::MaintTimeout { pid });
        }));
    }

    /// The worker finished maintenance.
    pub(crate) fn complete_maint(&mut self) {
        if self.state != ProxyState::Maint {
            tracing::debug!(pid = self.pid, state = ?self.state, "unexpected maint_complete");
            return;
        }
        if let Some(timer) = self.maint_timer.take() {
            timer.abort();
        }
        self.state = ProxyState::Active;
    }

    /// Forward a broadcast payload.
    pub(crate) fn send_message(&self, data: &serde_json::Value) {
        if self.state == ProxyState::Shutdown {
            return;
        }
        if let Ok(payload) = JsonPayload::new(data) {
            self.send(Command::Message { data: payload });
        }
    }

    /// Forward a debug-inspector command.
    pub(crate) fn send_internal(&self, data: &serde_json::Value) {
        if let Ok(payload) = JsonPayload::new(data) {
            self.send(Command::Internal { data: payload });
        }
    }

    /// Begin graceful shutdown: write the shutdown frame, end the
    /// outbound stream, and arm the SIGKILL timer. Pending requests are
    /// left to complete or fail on exit.
    pub(crate) fn shutdown(
        &mut self,
        timeout: Duration,
        event_tx: &mpsc::UnboundedSender<ProxyEvent>,
    ) {
        if self.state == ProxyState::Shutdown {
            return;
        }
        self.state = ProxyState::Shutdown;
        self.send(Command::Shutdown);
        // Dropping the sender closes the child's stdin after the
        // shutdown frame drains.
        self.writer_tx = None;
        if let Some(timer) = self.startup_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.maint_timer.take() {
            timer.abort();
        }

        let timer_tx = event_tx.clone();
        let pid = self.pid;
        self.kill_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timer_tx.send(ProxyEvent::KillTimeout { pid });
        }));
    }

    /// SIGKILL the child immediately.
    pub(crate) fn kill(&mut self) {
        self.state = ProxyState::Shutdown;
        self.writer_tx = None;
        if !self.child_exited {
            tracing::warn!(pid = self.pid, "sending SIGKILL to worker");
            let _ = kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL);
        }
    }

    /// Fail every pending request with a 500 naming the cause.
    pub(crate) fn fail_all_pending(&mut self, cause: &str) {
        for (request_id, mut pending) in self.pending.drain() {
            pending.cancel_timeout();
            tracing::warn!(
                pid = self.pid,
                request_id = %request_id,
                request = %pending.summary,
                cause,
                "failing in-flight request"
            );
            pending.completion.fail(
                status::INTERNAL_SERVER_ERROR,
                format!("worker {}: {}", self.pid, cause),
            );
        }
    }

    /// The child's stdout went away before the exit was observed.
    pub(crate) fn stream_lost(&mut self, cause: &str) {
        if self.state != ProxyState::Shutdown {
            tracing::warn!(pid = self.pid, cause, "worker stream lost");
        }
        self.fail_all_pending(cause);
        self.state = ProxyState::Shutdown;
        self.writer_tx = None;
    }

    /// The OS reported the child exited. Returns true if the exit
    /// happened before startup completed.
    pub(crate) fn child_exited(&mut self, code: Option<i32>) -> bool {
        let during_startup = self.state == ProxyState::Startup;
        self.child_exited = true;
        for timer in [
            self.startup_timer.take(),
            self.maint_timer.take(),
            self.kill_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.abort();
        }
        let cause = match code {
            Some(0) => "worker exited".to_string(),
            Some(code) => format!("worker exited with code {}", code),
            None => "worker killed by signal".to_string(),
        };
        self.fail_all_pending(&cause);
        self.state = ProxyState::Shutdown;
        self.writer_tx = None;
        during_startup
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.child_exited
    }
}

/// Re-log a worker's stderr through tracing, categorised by
/// conventional severity prefixes.
async fn log_worker_stderr(pid: u32, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let lower = line.to_lowercase();
        if lower.starts_with("trace") {
            tracing::trace!(worker_pid = pid, "{}", line);
        } else if lower.contains("error") || lower.contains("panic") {
            tracing::warn!(worker_pid = pid, "{}", line);
        } else if lower.contains("warn") {
            tracing::debug!(worker_pid = pid, "{}", line);
        } else {
            tracing::debug!(worker_pid = pid, "{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_fail_shapes() {
        let (tx, mut rx) = oneshot::channel();
        Completion::Request(tx).fail(status::INTERNAL_SERVER_ERROR, "worker 42: crashed".into());
        let completed = rx.try_recv().unwrap();
        assert_eq!(completed.status, status::INTERNAL_SERVER_ERROR);
        assert_eq!(completed.body.as_text(), Some("worker 42: crashed"));

        let (tx, mut rx) = oneshot::channel();
        Completion::Custom(tx).fail(status::GATEWAY_TIMEOUT, "request timed out".into());
        match rx.try_recv().unwrap() {
            Err(PreforkError::RequestFailed(msg)) => {
                assert!(msg.starts_with("504 Gateway Timeout"));
            }
            other => panic!("unexpected custom completion: {:?}", other.map(|_| ())),
        }
    }
}

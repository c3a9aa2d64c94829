//! Worker pool: dispatch policy, concurrency accounting, and the per-tick
//! control decisions (auto-scale, rolling maintenance, rolling restart,
//! end-of-life recycle).
//!
//! A pool is one actor task. Callers talk to it through a [`PoolHandle`];
//! worker proxies report back through an internal event channel. Both
//! funnel into the same loop, so every mutation of pool state is
//! serialised.

use super::manager::{local_server_info, IdGen, KillList};
use super::proxy::{Completion, ProxyEvent, WorkerProxy};
use super::{PoolEvent, ProxyState, ScaleAction};
use crate::config::PoolConfig;
use crate::error::{PreforkError, Result};
use crate::http::{status, Completed, CompletedBody, CustomReply, RequestArgs};
use crate::protocol::{render_json, Body, BodyKind, JsonPayload, Reply, ServerInfo, WireResponse};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};

/// How long a `delete`-flagged file response stays on disk after the
/// stream is handed to the collaborator.
const FILE_DELETE_DELAY: Duration = Duration::from_secs(10);

/// Pool statistics snapshot.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub worker_count: usize,
    pub active_requests: usize,
    pub total_requests_served: u64,
    pub total_restarts: u64,
}

/// Commands accepted by the pool actor.
pub(crate) enum PoolMsg {
    Dispatch {
        args: RequestArgs,
        reply: oneshot::Sender<Completed>,
    },
    DispatchCustom {
        params: serde_json::Value,
        reply: oneshot::Sender<Result<CustomReply>>,
    },
    SendMessage {
        data: serde_json::Value,
    },
    SendInternal {
        data: serde_json::Value,
    },
    RequestMaint {
        data: Option<serde_json::Value>,
    },
    RequestRestart,
    Tick,
    Workers {
        reply: oneshot::Sender<Vec<u32>>,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    AddWorker {
        reply: oneshot::Sender<Result<u32>>,
    },
    UpdateConfig {
        apply: Box<dyn FnOnce(&mut PoolConfig) + Send>,
    },
    SetRequestBudget {
        pid: u32,
        budget: u64,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap clonable handle to a running pool.
#[derive(Clone)]
pub struct PoolHandle {
    id: String,
    tx: mpsc::UnboundedSender<PoolMsg>,
    events: broadcast::Sender<PoolEvent>,
}

impl PoolHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, msg: PoolMsg) -> Result<()> {
        self.tx.send(msg).map_err(|_| PreforkError::ShuttingDown)
    }

    /// Dispatch a request. Rejections surface as responses: 429 at the
    /// concurrency cap, 503 with no eligible worker, 504 on timeout, 500
    /// on worker failure.
    pub async fn dispatch(&self, args: RequestArgs) -> Result<Completed> {
        let (tx, rx) = oneshot::channel();
        self.send(PoolMsg::Dispatch { args, reply: tx })?;
        rx.await
            .map_err(|_| PreforkError::Pool("pool dropped the request".into()))
    }

    /// Dispatch a custom work unit. A non-200 completion becomes an
    /// error carrying the status string.
    pub async fn dispatch_custom(&self, params: serde_json::Value) -> Result<CustomReply> {
        let (tx, rx) = oneshot::channel();
        self.send(PoolMsg::DispatchCustom { params, reply: tx })?;
        rx.await
            .map_err(|_| PreforkError::Pool("pool dropped the request".into()))?
    }

    /// Write a message frame to every live worker.
    pub fn send_message(&self, data: serde_json::Value) -> Result<()> {
        self.send(PoolMsg::SendMessage { data })
    }

    /// Write a debug-inspector command to every live worker.
    pub fn send_internal(&self, data: serde_json::Value) -> Result<()> {
        self.send(PoolMsg::SendInternal { data })
    }

    /// Flag every worker for maintenance; the tick realises it under the
    /// pool's concurrency limits.
    pub fn request_maint(&self, data: Option<serde_json::Value>) -> Result<()> {
        self.send(PoolMsg::RequestMaint { data })
    }

    /// Flag every worker for a rolling restart.
    pub fn request_restart(&self) -> Result<()> {
        self.send(PoolMsg::RequestRestart)
    }

    /// Drive one control-loop tick. The manager calls this at 1 Hz;
    /// tests call it directly for determinism.
    pub fn tick(&self) {
        let _ = self.send(PoolMsg::Tick);
    }

    /// Pids of all live workers.
    pub async fn workers(&self) -> Result<Vec<u32>> {
        let (tx, rx) = oneshot::channel();
        self.send(PoolMsg::Workers { reply: tx })?;
        rx.await
            .map_err(|_| PreforkError::Pool("pool went away".into()))
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        let (tx, rx) = oneshot::channel();
        self.send(PoolMsg::Stats { reply: tx })?;
        rx.await
            .map_err(|_| PreforkError::Pool("pool went away".into()))
    }

    /// Spawn one extra worker (subject to nothing: the caller decides).
    pub async fn add_worker(&self) -> Result<u32> {
        let (tx, rx) = oneshot::channel();
        self.send(PoolMsg::AddWorker { reply: tx })?;
        rx.await
            .map_err(|_| PreforkError::Pool("pool went away".into()))?
    }

    /// Apply a config edit inside the actor, so tick observations stay
    /// consistent.
    pub fn update_config<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut PoolConfig) + Send + 'static,
    {
        self.send(PoolMsg::UpdateConfig {
            apply: Box::new(apply),
        })
    }

    /// Overwrite one worker's resolved request budget. Range budgets are
    /// resolved once at spawn; this is the explicit override for callers
    /// that need a specific value on a live worker.
    pub fn set_request_budget(&self, pid: u32, budget: u64) -> Result<()> {
        self.send(PoolMsg::SetRequestBudget { pid, budget })
    }

    /// Shut down every worker and wait for the pid map to drain.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(PoolMsg::Shutdown { reply: tx })?;
        rx.await
            .map_err(|_| PreforkError::Pool("pool went away".into()))
    }

    /// Subscribe to pool events (maint, restart, autoscale, messages,
    /// SSE chunks).
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }
}

/// Worker pool constructor.
pub struct WorkerPool;

impl WorkerPool {
    /// Start a pool: spawn `min_children` workers under the launch
    /// concurrency limit and wait for them all to complete startup.
    pub async fn start(
        id: impl Into<String>,
        config: PoolConfig,
        ids: Arc<IdGen>,
        kill_list: Arc<KillList>,
        server: ServerInfo,
    ) -> Result<PoolHandle> {
        config.validate()?;
        let id = id.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let (ready_tx, ready_rx) = oneshot::channel();

        let actor = PoolActor {
            id: id.clone(),
            config,
            server,
            proxies: HashMap::new(),
            cursor: 0,
            ids,
            kill_list,
            cmd_rx,
            event_rx,
            event_tx,
            events: events.clone(),
            shutting_down: false,
            shutdown_waiters: Vec::new(),
            startup: None,
            total_served: 0,
            total_restarts: 0,
        };
        tokio::spawn(actor.run(ready_tx));

        ready_rx
            .await
            .map_err(|_| PreforkError::Pool("pool task died during startup".into()))??;

        Ok(PoolHandle {
            id,
            tx: cmd_tx,
            events,
        })
    }

    /// Start a pool with its own id generator and kill list (no manager).
    pub async fn start_standalone(
        id: impl Into<String>,
        config: PoolConfig,
    ) -> Result<PoolHandle> {
        Self::start(
            id,
            config,
            Arc::new(IdGen::new()),
            Arc::new(KillList::default()),
            local_server_info(false),
        )
        .await
    }
}

/// Per-tick snapshot of proxy states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct StateCounts {
    startup: usize,
    active: usize,
    maint: usize,
    shutdown: usize,
}

impl StateCounts {
    fn total(&self) -> usize {
        self.startup + self.active + self.maint + self.shutdown
    }
}

/// Inputs to the auto-scale decision, separated out so the arithmetic is
/// testable without processes.
#[derive(Debug, Clone, Copy)]
struct ScaleInputs {
    counts: StateCounts,
    num_busy: usize,
    headroom_pct: u32,
    min_children: usize,
    max_children: usize,
    max_concurrent_launches: usize,
}

/// Busy count inflated by headroom, clamped to keep at least
/// `min_children` workers alive. The implicit `+1` in the
/// busy-plus-headroom comparison keeps one idle worker in reserve in the
/// steady state.
fn busy_adjusted(num_busy: usize, headroom_pct: u32, min_children: usize) -> usize {
    let adjusted = num_busy * (100 + headroom_pct as usize) / 100;
    adjusted.max(min_children.saturating_sub(1))
}

fn scale_decision(inputs: ScaleInputs) -> Option<ScaleAction> {
    let counts = inputs.counts;
    let busy_adj = busy_adjusted(inputs.num_busy, inputs.headroom_pct, inputs.min_children);
    let num_children = counts.startup + counts.active;
    let total_sans_shutdown = counts.total() - counts.shutdown;

    if busy_adj >= num_children
        && counts.startup < inputs.max_concurrent_launches
        && total_sans_shutdown < inputs.max_children
    {
        Some(ScaleAction::Add)
    } else if busy_adj < counts.active.saturating_sub(1)
        && counts.active > 1
        && counts.total() > inputs.min_children
    {
        Some(ScaleAction::Remove)
    } else {
        None
    }
}

struct StartupTracker {
    remaining: usize,
    waiter: Option<oneshot::Sender<Result<()>>>,
}

struct PoolActor {
    id: String,
    config: PoolConfig,
    server: ServerInfo,
    proxies: HashMap<u32, WorkerProxy>,
    /// Round-robin cursor picking the focus worker each tick.
    cursor: usize,
    ids: Arc<IdGen>,
    kill_list: Arc<KillList>,
    cmd_rx: mpsc::UnboundedReceiver<PoolMsg>,
    event_rx: mpsc::UnboundedReceiver<ProxyEvent>,
    event_tx: mpsc::UnboundedSender<ProxyEvent>,
    events: broadcast::Sender<PoolEvent>,
    shutting_down: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    startup: Option<StartupTracker>,
    total_served: u64,
    total_restarts: u64,
}

enum Input {
    Msg(PoolMsg),
    Event(ProxyEvent),
    CmdClosed,
}

impl PoolActor {
    async fn run(mut self, ready: oneshot::Sender<Result<()>>) {
        self.startup = Some(StartupTracker {
            remaining: self.config.min_children,
            waiter: Some(ready),
        });
        self.maybe_launch();

        let mut cmd_open = true;
        loop {
            if self.shutting_down && self.proxies.is_empty() {
                for waiter in self.shutdown_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                break;
            }

            let input = if cmd_open {
                tokio::select! {
                    biased;
                    Some(event) = self.event_rx.recv() => Input::Event(event),
                    msg = self.cmd_rx.recv() => match msg {
                        Some(msg) => Input::Msg(msg),
                        None => Input::CmdClosed,
                    },
                }
            } else {
                match self.event_rx.recv().await {
                    Some(event) => Input::Event(event),
                    None => break,
                }
            };

            match input {
                Input::Msg(msg) => self.on_msg(msg),
                Input::Event(event) => self.on_event(event),
                Input::CmdClosed => {
                    // Every handle is gone; don't leave children behind.
                    cmd_open = false;
                    self.begin_shutdown();
                }
            }
        }
        tracing::info!(pool = %self.id, "pool stopped");
    }

    // ---------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------

    fn on_msg(&mut self, msg: PoolMsg) {
        match msg {
            PoolMsg::Dispatch { args, reply } => self.dispatch(args, reply),
            PoolMsg::DispatchCustom { params, reply } => self.dispatch_custom(params, reply),
            PoolMsg::SendMessage { data } => {
                for proxy in self.proxies.values() {
                    proxy.send_message(&data);
                }
            }
            PoolMsg::SendInternal { data } => {
                for proxy in self.proxies.values() {
                    proxy.send_internal(&data);
                }
            }
            PoolMsg::RequestMaint { data } => {
                for proxy in self.proxies.values_mut() {
                    proxy.request_maint = Some(data.clone());
                }
            }
            PoolMsg::RequestRestart => {
                for proxy in self.proxies.values_mut() {
                    proxy.request_restart = true;
                }
            }
            PoolMsg::Tick => self.tick(),
            PoolMsg::Workers { reply } => {
                let _ = reply.send(self.proxies.keys().copied().collect());
            }
            PoolMsg::Stats { reply } => {
                let _ = reply.send(PoolStats {
                    worker_count: self.proxies.len(),
                    active_requests: self.active_requests(),
                    total_requests_served: self.total_served,
                    total_restarts: self.total_restarts,
                });
            }
            PoolMsg::AddWorker { reply } => {
                let _ = reply.send(self.spawn_proxy(false));
            }
            PoolMsg::UpdateConfig { apply } => {
                apply(&mut self.config);
            }
            PoolMsg::SetRequestBudget { pid, budget } => {
                if let Some(proxy) = self.proxies.get_mut(&pid) {
                    proxy.request_budget = budget;
                }
            }
            PoolMsg::Shutdown { reply } => {
                self.shutdown_waiters.push(reply);
                self.begin_shutdown();
            }
        }
    }

    /// Sum of in-flight requests over active and maint workers.
    fn active_requests(&self) -> usize {
        self.proxies
            .values()
            .filter(|p| matches!(p.state(), ProxyState::Active | ProxyState::Maint))
            .map(|p| p.active_requests())
            .sum()
    }

    /// Least-loaded worker selection, ties broken uniformly at random.
    fn select_worker(&self) -> Option<u32> {
        let min_concurrent = self
            .proxies
            .values()
            .filter(|p| p.accepts_requests())
            .map(|p| p.active_requests())
            .min()?;
        let candidates: Vec<u32> = self
            .proxies
            .values()
            .filter(|p| p.accepts_requests() && p.active_requests() == min_concurrent)
            .map(|p| p.pid())
            .collect();
        candidates.choose(&mut rand::thread_rng()).copied()
    }

    fn dispatch(&mut self, args: RequestArgs, reply: oneshot::Sender<Completed>) {
        if self.shutting_down {
            let _ = reply.send(Completed::error(
                status::SERVICE_UNAVAILABLE,
                "pool is shutting down",
            ));
            return;
        }
        if self.config.max_concurrent_requests > 0
            && self.active_requests() >= self.config.max_concurrent_requests
        {
            let _ = reply.send(Completed::error(
                status::TOO_MANY_REQUESTS,
                "pool concurrency limit reached",
            ));
            return;
        }
        let Some(pid) = self.select_worker() else {
            let _ = reply.send(Completed::error(
                status::SERVICE_UNAVAILABLE,
                "no worker available",
            ));
            return;
        };

        let request_id = self.ids.next("req");
        let timeout = self.config.request_timeout();
        let event_tx = self.event_tx.clone();
        let proxy = self.proxies.get_mut(&pid).expect("selected worker exists");
        proxy.dispatch(request_id, args, Completion::Request(reply), timeout, &event_tx);
    }

    fn dispatch_custom(
        &mut self,
        params: serde_json::Value,
        reply: oneshot::Sender<Result<CustomReply>>,
    ) {
        if self.shutting_down {
            let _ = reply.send(Err(PreforkError::ShuttingDown));
            return;
        }
        if self.config.max_concurrent_requests > 0
            && self.active_requests() >= self.config.max_concurrent_requests
        {
            let _ = reply.send(Err(PreforkError::RequestFailed(
                status::TOO_MANY_REQUESTS.to_string(),
            )));
            return;
        }
        let Some(pid) = self.select_worker() else {
            let _ = reply.send(Err(PreforkError::RequestFailed(
                status::SERVICE_UNAVAILABLE.to_string(),
            )));
            return;
        };
        let payload = match JsonPayload::new(&params) {
            Ok(payload) => payload,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let request_id = self.ids.next("cst");
        let timeout = self.config.request_timeout();
        let event_tx = self.event_tx.clone();
        let proxy = self.proxies.get_mut(&pid).expect("selected worker exists");
        proxy.dispatch_custom(
            request_id,
            payload,
            Completion::Custom(reply),
            timeout,
            &event_tx,
        );
    }

    // ---------------------------------------------------------------
    // Proxy events
    // ---------------------------------------------------------------

    fn on_event(&mut self, event: ProxyEvent) {
        match event {
            ProxyEvent::Frame { pid, reply } => self.on_frame(pid, reply),
            ProxyEvent::StreamClosed { pid } => {
                if let Some(proxy) = self.proxies.get_mut(&pid) {
                    proxy.stream_lost("worker closed its output stream");
                }
            }
            ProxyEvent::StreamError { pid, error } => {
                if let Some(proxy) = self.proxies.get_mut(&pid) {
                    proxy.stream_lost(&format!("worker stream error: {}", error));
                }
            }
            ProxyEvent::Exited { pid, code } => self.on_exited(pid, code),
            ProxyEvent::StartupTimeout { pid } => self.on_startup_timeout(pid),
            ProxyEvent::MaintTimeout { pid } => {
                let timeout = self.config.shutdown_timeout();
                let event_tx = self.event_tx.clone();
                if let Some(proxy) = self.proxies.get_mut(&pid) {
                    if proxy.state() == ProxyState::Maint {
                        tracing::warn!(pool = %self.id, pid, "maintenance timed out, shutting worker down");
                        proxy.shutdown(timeout, &event_tx);
                    }
                }
            }
            ProxyEvent::KillTimeout { pid } => {
                if let Some(proxy) = self.proxies.get_mut(&pid) {
                    if !proxy.has_exited() {
                        proxy.kill();
                    }
                }
            }
            ProxyEvent::RequestTimeout { pid, request_id } => {
                if let Some(proxy) = self.proxies.get_mut(&pid) {
                    if let Some(pending) = proxy.take_pending(&request_id) {
                        tracing::warn!(
                            pool = %self.id,
                            pid,
                            request_id = %request_id,
                            request = %pending.summary,
                            "request timed out"
                        );
                        pending
                            .completion
                            .fail(status::GATEWAY_TIMEOUT, "request timed out".into());
                    }
                }
            }
        }
    }

    fn on_frame(&mut self, pid: u32, reply: Reply) {
        match reply {
            Reply::StartupComplete => {
                let became_active = match self.proxies.get_mut(&pid) {
                    Some(proxy) => proxy.complete_startup(),
                    None => false,
                };
                if became_active {
                    tracing::info!(pool = %self.id, pid, "worker active");
                    self.check_startup_progress();
                }
            }
            Reply::MaintComplete => {
                if let Some(proxy) = self.proxies.get_mut(&pid) {
                    proxy.complete_maint();
                }
            }
            Reply::Message { data } => match data.to_value() {
                Ok(data) => {
                    let _ = self.events.send(PoolEvent::Message { pid, data });
                }
                Err(e) => tracing::warn!(pool = %self.id, pid, error = %e, "bad message payload"),
            },
            Reply::Internal { data } => match data.to_value() {
                Ok(data) => {
                    let _ = self.events.send(PoolEvent::Internal { pid, data });
                }
                Err(e) => tracing::warn!(pool = %self.id, pid, error = %e, "bad internal payload"),
            },
            Reply::Sse { id, chunk } => {
                let _ = self.events.send(PoolEvent::Sse {
                    pid,
                    request_id: id,
                    chunk,
                });
            }
            Reply::Response(wire) => self.on_response(pid, wire),
        }
    }

    fn on_response(&mut self, pid: u32, wire: WireResponse) {
        let Some(proxy) = self.proxies.get_mut(&pid) else {
            tracing::debug!(pool = %self.id, pid, "response from unknown worker dropped");
            return;
        };
        let Some(pending) = proxy.take_pending(&wire.id) else {
            // Duplicate, or the entry was purged by a timeout.
            tracing::debug!(pool = %self.id, pid, request_id = %wire.id, "unmatched response dropped");
            return;
        };
        proxy.mark_served();
        self.total_served += 1;

        if let Some(ref message) = wire.log_error {
            tracing::warn!(pool = %self.id, pid, request = %pending.summary, "{}", message);
        }

        match pending.completion {
            Completion::Custom(tx) => {
                let _ = tx.send(finish_custom(wire, pending.started));
            }
            Completion::Request(tx) => {
                if wire.kind == BodyKind::File {
                    tokio::spawn(finish_file(wire, pending.started, tx));
                } else {
                    let _ = tx.send(finish_request(
                        wire,
                        pending.pretty,
                        pending.callback.as_deref(),
                        pending.started,
                    ));
                }
            }
        }
    }

    fn on_startup_timeout(&mut self, pid: u32) {
        let Some(proxy) = self.proxies.get_mut(&pid) else {
            return;
        };
        if proxy.state() != ProxyState::Startup {
            return;
        }
        let timeout_sec = self.config.startup_timeout_sec;
        tracing::warn!(pool = %self.id, pid, timeout_sec, "worker startup timed out, killing");
        let initial = proxy.initial_launch;
        proxy.kill();
        if initial {
            self.fail_startup(PreforkError::StartupTimeout { pid, timeout_sec });
        }
    }

    fn on_exited(&mut self, pid: u32, code: Option<i32>) {
        let Some(mut proxy) = self.proxies.remove(&pid) else {
            return;
        };
        let during_startup = proxy.child_exited(code);
        tracing::info!(pool = %self.id, pid, code = ?code, "worker exited");
        let _ = self.events.send(PoolEvent::WorkerExited { pid });

        if during_startup && proxy.initial_launch {
            self.fail_startup(PreforkError::Worker(format!(
                "worker {} exited during startup (code {:?})",
                pid, code
            )));
        }
        // Initial launches still pending get their slot back.
        self.maybe_launch();
    }

    // ---------------------------------------------------------------
    // Launch plumbing
    // ---------------------------------------------------------------

    fn spawn_proxy(&mut self, initial: bool) -> Result<u32> {
        if self.shutting_down {
            return Err(PreforkError::ShuttingDown);
        }
        let proxy = WorkerProxy::spawn(
            &self.id,
            &self.config,
            &self.server,
            initial,
            self.event_tx.clone(),
            self.kill_list.clone(),
        )?;
        let pid = proxy.pid();
        self.proxies.insert(pid, proxy);
        Ok(pid)
    }

    fn count_state(&self, state: ProxyState) -> usize {
        self.proxies.values().filter(|p| p.state() == state).count()
    }

    /// Keep initial launches flowing, bounded by
    /// `max_concurrent_launches` workers in startup at once.
    fn maybe_launch(&mut self) {
        loop {
            let Some(tracker) = self.startup.as_ref() else {
                return;
            };
            if tracker.remaining == 0 || self.shutting_down {
                return;
            }
            if self.count_state(ProxyState::Startup) >= self.config.max_concurrent_launches {
                return;
            }
            match self.spawn_proxy(true) {
                Ok(_) => {
                    if let Some(tracker) = self.startup.as_mut() {
                        tracker.remaining -= 1;
                    }
                }
                Err(e) => {
                    self.fail_startup(e);
                    return;
                }
            }
        }
    }

    fn check_startup_progress(&mut self) {
        if self.startup.is_none() {
            return;
        }
        let active = self.count_state(ProxyState::Active);
        if active >= self.config.min_children {
            if let Some(tracker) = self.startup.as_mut() {
                if let Some(waiter) = tracker.waiter.take() {
                    let _ = waiter.send(Ok(()));
                }
            }
            self.startup = None;
        } else {
            self.maybe_launch();
        }
    }

    fn fail_startup(&mut self, error: PreforkError) {
        if let Some(tracker) = self.startup.as_mut() {
            if let Some(waiter) = tracker.waiter.take() {
                let _ = waiter.send(Err(error));
            }
            self.startup = None;
        } else {
            tracing::warn!(pool = %self.id, error = %error, "worker launch failed");
        }
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        tracing::info!(pool = %self.id, workers = self.proxies.len(), "pool shutting down");
        self.shutting_down = true;
        if self.startup.is_some() {
            self.fail_startup(PreforkError::ShuttingDown);
        }
        let timeout = self.config.shutdown_timeout();
        let event_tx = self.event_tx.clone();
        for proxy in self.proxies.values_mut() {
            proxy.shutdown(timeout, &event_tx);
        }
    }

    // ---------------------------------------------------------------
    // Tick
    // ---------------------------------------------------------------

    fn state_counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for proxy in self.proxies.values() {
            match proxy.state() {
                ProxyState::Startup => counts.startup += 1,
                ProxyState::Active => counts.active += 1,
                ProxyState::Maint => counts.maint += 1,
                ProxyState::Shutdown => counts.shutdown += 1,
            }
        }
        counts
    }

    /// One control-loop pass: focus-worker decisions (maint, recycle,
    /// rolling restart) then pool-wide auto-scaling.
    fn tick(&mut self) {
        if self.shutting_down {
            return;
        }
        let counts = self.state_counts();

        // Focus worker: round-robin over the sorted pid list.
        let mut pids: Vec<u32> = self.proxies.keys().copied().collect();
        pids.sort_unstable();
        if !pids.is_empty() {
            let focus = pids[self.cursor % pids.len()];
            self.cursor = self.cursor.wrapping_add(1);
            self.focus_actions(focus, counts);
        }

        self.autoscale();
    }

    fn focus_actions(&mut self, pid: u32, counts: StateCounts) {
        let config = self.config.clone();
        let event_tx = self.event_tx.clone();

        // Maintenance decision.
        if counts.maint < config.max_concurrent_maint && counts.active > 1 {
            let maint_payload = {
                let Some(proxy) = self.proxies.get_mut(&pid) else {
                    return;
                };
                let mut need_maint = false;
                let mut payload: Option<serde_json::Value> = None;
                if proxy.state() == ProxyState::Active && config.auto_maint {
                    let due = match config.maint_method {
                        crate::config::MaintMethod::Requests => {
                            proxy.requests_served() - proxy.last_maint_requests
                                >= config.maint_requests
                        }
                        crate::config::MaintMethod::Time => {
                            proxy.last_maint_time.elapsed()
                                >= Duration::from_secs(config.maint_time_sec)
                        }
                    };
                    if due {
                        need_maint = true;
                        proxy.last_maint_requests = proxy.requests_served();
                        proxy.last_maint_time = Instant::now();
                    }
                }
                if proxy.state() == ProxyState::Active {
                    if let Some(requested) = proxy.request_maint.take() {
                        need_maint = true;
                        payload = requested;
                    }
                }
                need_maint.then_some(payload)
            };
            if let Some(payload) = maint_payload {
                if let Some(proxy) = self.proxies.get_mut(&pid) {
                    proxy.maint(payload, config.maint_timeout(), &event_tx);
                    tracing::debug!(pool = %self.id, pid, "maintenance started");
                    let _ = self.events.send(PoolEvent::Maint { pid });
                }
            }
        }

        // End-of-life recycle and rolling restart share the launch
        // concurrency guard: never take down more workers than the pool
        // can replace at once.
        let can_cycle =
            counts.startup + counts.shutdown < config.max_concurrent_launches && counts.active > 1;
        if !can_cycle {
            return;
        }

        let shutdown_timeout = config.shutdown_timeout();
        let mut restarted = false;
        if let Some(proxy) = self.proxies.get_mut(&pid) {
            if proxy.state() == ProxyState::Active
                && proxy.request_budget > 0
                && proxy.requests_served() >= proxy.request_budget
            {
                tracing::info!(
                    pool = %self.id,
                    pid,
                    served = proxy.requests_served(),
                    budget = proxy.request_budget,
                    "recycling worker at end of life"
                );
                proxy.shutdown(shutdown_timeout, &event_tx);
                restarted = true;
            } else if proxy.state() == ProxyState::Active && proxy.request_restart {
                proxy.request_restart = false;
                tracing::info!(pool = %self.id, pid, "rolling restart");
                proxy.shutdown(shutdown_timeout, &event_tx);
                restarted = true;
            }
        }
        if restarted {
            self.total_restarts += 1;
            let _ = self.events.send(PoolEvent::Restart { pid });
        }
    }

    /// At most one scale action per tick, counted on the post-focus
    /// state.
    fn autoscale(&mut self) {
        let counts = self.state_counts();
        let num_busy = self
            .proxies
            .values()
            .filter(|p| {
                p.state() == ProxyState::Active && p.active_requests() >= self.config.child_busy_factor
            })
            .count();

        let decision = scale_decision(ScaleInputs {
            counts,
            num_busy,
            headroom_pct: self.config.child_headroom_pct,
            min_children: self.config.min_children,
            max_children: self.config.max_children,
            max_concurrent_launches: self.config.max_concurrent_launches,
        });

        match decision {
            Some(ScaleAction::Add) => match self.spawn_proxy(false) {
                Ok(pid) => {
                    tracing::info!(pool = %self.id, pid, "autoscale: adding worker");
                    let _ = self.events.send(PoolEvent::Autoscale {
                        action: ScaleAction::Add,
                        pid,
                    });
                }
                Err(e) => tracing::warn!(pool = %self.id, error = %e, "autoscale spawn failed"),
            },
            Some(ScaleAction::Remove) => {
                let idle = self
                    .proxies
                    .values()
                    .find(|p| p.state() == ProxyState::Active && p.active_requests() == 0)
                    .map(|p| p.pid());
                if let Some(pid) = idle {
                    let timeout = self.config.shutdown_timeout();
                    let event_tx = self.event_tx.clone();
                    if let Some(proxy) = self.proxies.get_mut(&pid) {
                        tracing::info!(pool = %self.id, pid, "autoscale: removing idle worker");
                        proxy.shutdown(timeout, &event_tx);
                        let _ = self.events.send(PoolEvent::Autoscale {
                            action: ScaleAction::Remove,
                            pid,
                        });
                    }
                }
            }
            None => {}
        }
    }
}

// -------------------------------------------------------------------
// Response finishing
// -------------------------------------------------------------------

/// Turn a worker response into the caller-facing completion, mirroring
/// the worker's JSON/JSONP rendering for structured bodies it did not
/// render itself.
fn finish_request(
    wire: WireResponse,
    pretty: bool,
    callback: Option<&str>,
    started: Instant,
) -> Completed {
    let mut headers = wire.headers;
    let body = match wire.body {
        Body::Empty => CompletedBody::Empty,
        Body::Text(text) => CompletedBody::Text(text),
        Body::Bytes(bytes) => CompletedBody::Bytes(bytes),
        Body::Json(doc) => {
            let doc = if pretty {
                serde_json::from_str::<serde_json::Value>(&doc)
                    .and_then(|v| serde_json::to_string_pretty(&v))
                    .unwrap_or(doc)
            } else {
                doc
            };
            let (rendered, content_type) = render_json(doc, callback);
            if !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
                headers.insert("Content-Type".to_string(), content_type.to_string());
            }
            CompletedBody::Text(rendered)
        }
    };

    let mut perf = wire.perf.unwrap_or_default();
    perf.insert(
        "total_ms".to_string(),
        started.elapsed().as_secs_f64() * 1000.0,
    );

    Completed {
        status: wire.status,
        headers,
        body,
        perf,
    }
}

/// Custom responses pass through; non-200 statuses become errors whose
/// code is the status string.
fn finish_custom(wire: WireResponse, started: Instant) -> Result<CustomReply> {
    if wire.status != status::OK {
        let message = match &wire.body {
            Body::Text(text) => text.clone(),
            _ => String::new(),
        };
        return Err(PreforkError::RequestFailed(if message.is_empty() {
            wire.status
        } else {
            format!("{}: {}", wire.status, message)
        }));
    }

    let body = match wire.body {
        Body::Json(doc) => serde_json::from_str(&doc)?,
        Body::Text(text) => {
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
        }
        Body::Empty => serde_json::Value::Null,
        Body::Bytes(_) => {
            return Err(PreforkError::Worker(
                "custom response carried a binary body".into(),
            ));
        }
    };

    let mut perf = wire.perf.unwrap_or_default();
    perf.insert(
        "total_ms".to_string(),
        started.elapsed().as_secs_f64() * 1000.0,
    );

    Ok(CustomReply { body, perf })
}

/// Stat and open a `file` response, handing the caller an open stream.
/// The unlink for `delete` responses happens after a grace delay and
/// never blocks the response.
async fn finish_file(wire: WireResponse, started: Instant, tx: oneshot::Sender<Completed>) {
    let path = match &wire.body {
        Body::Text(path) => path.clone(),
        _ => {
            let _ = tx.send(Completed::error(
                status::INTERNAL_SERVER_ERROR,
                "file response without a path body",
            ));
            return;
        }
    };

    let metadata = match tokio::fs::metadata(&path).await {
        Ok(metadata) => metadata,
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "file response stat failed");
            let _ = tx.send(Completed::error(
                status::INTERNAL_SERVER_ERROR,
                format!("file response stat failed: {}", e),
            ));
            return;
        }
    };
    let len = metadata.len();

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "file response open failed");
            let _ = tx.send(Completed::error(
                status::INTERNAL_SERVER_ERROR,
                format!("file response open failed: {}", e),
            ));
            return;
        }
    };

    let mut headers = wire.headers;
    headers.insert("Content-Length".to_string(), len.to_string());

    let mut perf = wire.perf.unwrap_or_default();
    perf.insert(
        "total_ms".to_string(),
        started.elapsed().as_secs_f64() * 1000.0,
    );

    let _ = tx.send(Completed {
        status: wire.status,
        headers,
        body: CompletedBody::Stream { file, len },
        perf,
    });

    if wire.delete {
        tokio::spawn(async move {
            tokio::time::sleep(FILE_DELETE_DELAY).await;
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::debug!(path = %path, error = %e, "deferred unlink failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counts(startup: usize, active: usize, maint: usize, shutdown: usize) -> StateCounts {
        StateCounts {
            startup,
            active,
            maint,
            shutdown,
        }
    }

    fn inputs(counts: StateCounts, num_busy: usize) -> ScaleInputs {
        ScaleInputs {
            counts,
            num_busy,
            headroom_pct: 20,
            min_children: 1,
            max_children: 4,
            max_concurrent_launches: 1,
        }
    }

    #[test]
    fn busy_adjustment_floors_and_clamps() {
        assert_eq!(busy_adjusted(1, 20, 1), 1); // floor(1.2)
        assert_eq!(busy_adjusted(5, 20, 1), 6); // floor(6.0)
        assert_eq!(busy_adjusted(5, 50, 1), 7); // floor(7.5)
        assert_eq!(busy_adjusted(0, 20, 5), 4); // clamp to min_children - 1
        assert_eq!(busy_adjusted(0, 20, 1), 0);
    }

    #[test]
    fn scales_up_when_all_workers_busy() {
        // One worker, one busy: adj 1 >= children 1 and room to grow.
        assert_eq!(
            scale_decision(inputs(counts(0, 1, 0, 0), 1)),
            Some(ScaleAction::Add)
        );
    }

    #[test]
    fn scale_up_respects_launch_and_size_caps() {
        // Already launching one.
        assert_eq!(scale_decision(inputs(counts(1, 1, 0, 0), 1)), None);
        // At max_children.
        let mut i = inputs(counts(0, 4, 0, 0), 4);
        i.max_children = 4;
        assert_eq!(scale_decision(i), None);
        // Workers in shutdown do not count against max_children.
        let mut i = inputs(counts(0, 3, 0, 2), 3);
        i.max_children = 4;
        assert_eq!(scale_decision(i), Some(ScaleAction::Add));
    }

    #[test]
    fn scales_down_when_idle() {
        // Two idle workers above min_children: adj 0 < active - 1.
        assert_eq!(
            scale_decision(inputs(counts(0, 2, 0, 0), 0)),
            Some(ScaleAction::Remove)
        );
    }

    #[test]
    fn scale_down_keeps_min_children() {
        let mut i = inputs(counts(0, 2, 0, 0), 0);
        i.min_children = 2;
        assert_eq!(scale_decision(i), None);
    }

    #[test]
    fn steady_state_keeps_one_idle_reserve() {
        // Two workers, one busy: adj 1 is neither >= 2 nor < 1.
        assert_eq!(scale_decision(inputs(counts(0, 2, 0, 0), 1)), None);
    }

    #[test]
    fn finish_request_mirrors_json_rendering() {
        let mut wire = WireResponse::shell("r1");
        wire.body = Body::Json("{\"a\":1}".to_string());
        let done = finish_request(wire, false, Some("cb"), Instant::now());
        assert_eq!(done.status, status::OK);
        assert_eq!(done.body.as_text(), Some("cb({\"a\":1});"));
        assert_eq!(done.headers.get("Content-Type").unwrap(), "text/javascript");
        assert!(done.perf.contains_key("total_ms"));
    }

    #[test]
    fn finish_request_pretty_rendering() {
        let mut wire = WireResponse::shell("r1");
        wire.body = Body::Json("{\"a\":1}".to_string());
        let done = finish_request(wire, true, None, Instant::now());
        let text = done.body.as_text().unwrap();
        assert!(text.contains("\n"), "pretty output should be multi-line");
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(text).unwrap(),
            json!({"a": 1})
        );
    }

    #[test]
    fn finish_custom_passthrough_and_error() {
        let mut wire = WireResponse::shell("c1");
        wire.kind = BodyKind::Passthrough;
        wire.body = Body::Json("{\"code\":0,\"pid\":7}".to_string());
        let reply = finish_custom(wire, Instant::now()).unwrap();
        assert_eq!(reply.body["code"], 0);
        assert_eq!(reply.body["pid"], 7);

        let wire = WireResponse::error("c2", status::TOO_MANY_REQUESTS, "over cap");
        match finish_custom(wire, Instant::now()) {
            Err(PreforkError::RequestFailed(msg)) => {
                assert!(msg.starts_with(status::TOO_MANY_REQUESTS));
                assert!(msg.contains("over cap"));
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn finish_file_stat_failure_is_500() {
        let mut wire = WireResponse::shell("f1");
        wire.kind = BodyKind::File;
        wire.body = Body::Text("/nonexistent/prefork-test-file".to_string());
        let (tx, rx) = oneshot::channel();
        finish_file(wire, Instant::now(), tx).await;
        let done = rx.await.unwrap();
        assert_eq!(done.status, status::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn finish_file_streams_and_injects_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        let mut wire = WireResponse::shell("f2");
        wire.kind = BodyKind::File;
        wire.body = Body::Text(path.to_string_lossy().into_owned());
        let (tx, rx) = oneshot::channel();
        finish_file(wire, Instant::now(), tx).await;
        let done = rx.await.unwrap();
        assert_eq!(done.status, status::OK);
        assert_eq!(done.headers.get("Content-Length").unwrap(), "10");
        match done.body {
            CompletedBody::Stream { len, .. } => assert_eq!(len, 10),
            other => panic!("expected stream body, got {:?}", other),
        }
    }
}

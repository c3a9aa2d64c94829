//! Parent-side pool supervision.
//!
//! Each pool runs as one actor task owning its worker proxies, so all
//! pool state mutation is serialised through the actor inbox. Worker
//! proxies feed frames, exits and timer expiries back into the same task
//! through an event channel.

mod manager;
mod pool;
mod proxy;
mod router;

pub use manager::{IdGen, KillList, PoolManager};
pub use pool::{PoolHandle, PoolStats, WorkerPool};
pub use proxy::ProxyState;
pub use router::{RouteDecision, Router};

/// Direction of an auto-scale action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    Add,
    Remove,
}

/// Events a pool publishes to subscribers (operators, tests, the HTTP
/// collaborator for SSE streaming).
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A worker sent a message payload up.
    Message { pid: u32, data: serde_json::Value },
    /// Debug-inspector handshake from a worker.
    Internal { pid: u32, data: serde_json::Value },
    /// Maintenance started on a worker.
    Maint { pid: u32 },
    /// A worker was shut down for recycle or rolling restart.
    Restart { pid: u32 },
    /// The auto-scaler added or removed a worker.
    Autoscale { action: ScaleAction, pid: u32 },
    /// Out-of-band server-sent-events chunk for an in-flight request.
    Sse {
        pid: u32,
        request_id: String,
        chunk: Vec<u8>,
    },
    /// A worker process exited and was removed from the pool.
    WorkerExited { pid: u32 },
}

//! prefork - multi-process worker pool supervisor.
//!
//! A parent process owns a set of named pools; each pool spawns child
//! worker processes that run user-supplied request handlers. Work units
//! (HTTP requests routed by URI, or programmatic submissions) are
//! dispatched to the least-loaded worker; responses flow back over a
//! length-prefixed binary channel on the child's stdio.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────┐
//!                  │   Pool Manager   │  1 Hz tick, routes, ids
//!                  └────────┬─────────┘
//!              ┌────────────┼────────────┐
//!        ┌─────▼─────┐ ┌────▼──────┐ ┌───▼───────┐
//!        │  Pool "a" │ │ Pool "b"  │ │ Pool "c"  │   actor tasks
//!        └─────┬─────┘ └───────────┘ └───────────┘
//!        ┌─────┼──────────┐
//!  ┌─────▼───┐ ┌──▼──────┐ ┌─▼───────┐
//!  │ Worker  │ │ Worker  │ │ Worker  │   child processes
//!  │ (proxy) │ │ (proxy) │ │ (proxy) │   framed stdio IPC
//!  └─────────┘ └─────────┘ └─────────┘
//! ```
//!
//! Pools keep themselves healthy through the tick loop: auto-scaling
//! with an idle-reserve headroom, rolling maintenance, rolling restart,
//! and per-child request-count recycling.
//!
//! The child side lives in [`worker`]: embed a [`worker::Handler`] in
//! your own binary and hand it to [`worker::WorkerRuntime::run`].

pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod pool;
pub mod protocol;
pub mod worker;

pub use config::{ManagerConfig, MaintMethod, PoolConfig, RequestBudget};
pub use error::{PreforkError, Result};
pub use http::{Completed, CompletedBody, CustomReply, RequestArgs};
pub use pool::{
    PoolEvent, PoolHandle, PoolManager, PoolStats, ProxyState, ScaleAction, WorkerPool,
};
pub use worker::{EchoHandler, Handler, HandlerResponse, WorkerRuntime};

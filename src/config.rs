//! Pool and manager configuration.

use crate::error::{PreforkError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// What drives automatic maintenance for a pool's workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintMethod {
    /// Run maintenance after `maint_requests` served requests.
    #[default]
    Requests,
    /// Run maintenance every `maint_time_sec` seconds.
    Time,
}

/// Per-child request budget before the worker is recycled.
///
/// `Range` is resolved to a scalar once per worker at spawn, so a pool's
/// workers do not all hit end-of-life on the same tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestBudget {
    #[default]
    Disabled,
    Fixed(u64),
    Range(u64, u64),
}

impl RequestBudget {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, RequestBudget::Disabled)
    }

    /// Resolve to the scalar budget for one worker.
    pub fn resolve<R: Rng>(&self, rng: &mut R) -> u64 {
        match *self {
            RequestBudget::Disabled => 0,
            RequestBudget::Fixed(n) => n,
            RequestBudget::Range(lo, hi) => rng.gen_range(lo..=hi),
        }
    }
}

/// Configuration for one worker pool.
///
/// Immutable after creation except through the pool's config-update
/// message, which keeps tick observations consistent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Whether the manager instantiates this pool at startup.
    pub enabled: bool,

    /// Path handed to the worker runtime (a user module for script-driven
    /// workers; unused by compiled handlers).
    pub script: Option<PathBuf>,

    /// Worker executable. Defaults to the current binary re-invoked in
    /// worker mode.
    pub exec_cmd: PathBuf,
    pub exec_args: Vec<String>,
    /// Extra environment merged over the inherited parent environment.
    pub exec_env: HashMap<String, String>,
    pub exec_cwd: Option<PathBuf>,

    pub min_children: usize,
    pub max_children: usize,
    /// Pool-wide in-flight cap; 0 disables the cap.
    pub max_concurrent_requests: usize,
    pub max_requests_per_child: RequestBudget,
    pub max_concurrent_launches: usize,
    pub max_concurrent_maint: usize,
    /// Auto-scaler over-provisioning percentage.
    pub child_headroom_pct: u32,
    /// A worker counts as busy at this many in-flight requests.
    pub child_busy_factor: usize,

    pub startup_timeout_sec: u64,
    pub shutdown_timeout_sec: u64,
    /// Per-request deadline; 0 disables both parent and worker timers.
    pub request_timeout_sec: u64,
    pub maint_timeout_sec: u64,

    pub auto_maint: bool,
    pub maint_method: MaintMethod,
    pub maint_requests: u64,
    pub maint_time_sec: u64,

    /// URI pattern registered with the HTTP collaborator (anchored regex).
    pub uri_match: Option<String>,
    /// Client-IP prefix allowlist; requests from other addresses get 403.
    pub acl: Option<Vec<String>>,

    /// Compress eligible string responses inside the worker.
    pub compress_response: bool,
    /// Content types eligible for compression.
    pub compress_types: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            script: None,
            exec_cmd: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("prefork")),
            exec_args: vec!["worker".to_string()],
            exec_env: HashMap::new(),
            exec_cwd: None,
            min_children: 1,
            max_children: 1,
            max_concurrent_requests: 0,
            max_requests_per_child: RequestBudget::Disabled,
            max_concurrent_launches: 1,
            max_concurrent_maint: 1,
            child_headroom_pct: 20,
            child_busy_factor: 1,
            startup_timeout_sec: 10,
            shutdown_timeout_sec: 10,
            request_timeout_sec: 0,
            maint_timeout_sec: 60,
            auto_maint: false,
            maint_method: MaintMethod::Requests,
            maint_requests: 1000,
            maint_time_sec: 3600,
            uri_match: None,
            acl: None,
            compress_response: false,
            compress_types: "^text/|^application/(json|javascript|xml)".to_string(),
        }
    }
}

impl PoolConfig {
    /// Config for a pool driving the given worker binary.
    pub fn for_worker(exec_cmd: impl Into<PathBuf>) -> Self {
        Self {
            exec_cmd: exec_cmd.into(),
            exec_args: Vec::new(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_children == 0 {
            return Err(PreforkError::Config("min_children must be at least 1".into()));
        }
        if self.max_children < self.min_children {
            return Err(PreforkError::Config(format!(
                "max_children ({}) must be >= min_children ({})",
                self.max_children, self.min_children
            )));
        }
        if self.max_concurrent_launches == 0 {
            return Err(PreforkError::Config(
                "max_concurrent_launches must be at least 1".into(),
            ));
        }
        if self.max_concurrent_maint == 0 {
            return Err(PreforkError::Config(
                "max_concurrent_maint must be at least 1".into(),
            ));
        }
        if let RequestBudget::Range(lo, hi) = self.max_requests_per_child {
            if lo > hi || lo == 0 {
                return Err(PreforkError::Config(format!(
                    "max_requests_per_child range [{}, {}] is invalid",
                    lo, hi
                )));
            }
        }
        if let Some(ref pattern) = self.uri_match {
            regex::Regex::new(pattern).map_err(|source| PreforkError::UriPattern {
                pattern: pattern.clone(),
                source,
            })?;
        }
        regex::Regex::new(&self.compress_types).map_err(|source| PreforkError::UriPattern {
            pattern: self.compress_types.clone(),
            source,
        })?;
        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_sec)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_sec)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_sec > 0).then(|| Duration::from_secs(self.request_timeout_sec))
    }

    pub fn maint_timeout(&self) -> Duration {
        Duration::from_secs(self.maint_timeout_sec)
    }
}

/// Process-wide settings for the pool manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Named pool configs instantiated at startup.
    pub pools: HashMap<String, PoolConfig>,
    /// How many pools start concurrently.
    pub startup_threads: usize,
    /// Kill every child immediately on an uncaught parent panic.
    pub emergency_shutdown: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            pools: HashMap::new(),
            startup_threads: 2,
            emergency_shutdown: false,
        }
    }
}

impl ManagerConfig {
    /// Load from a JSON file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        for (id, pool) in &config.pools {
            pool.validate()
                .map_err(|e| PreforkError::Config(format!("pool '{}': {}", id, e)))?;
        }
        Ok(config)
    }
}

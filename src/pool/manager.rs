//! Pool registry, the 1 Hz tick driver, request-id generation, and the
//! emergency kill switch.

use super::pool::{PoolHandle, WorkerPool};
use super::router::{RouteDecision, Router};
use crate::config::{ManagerConfig, PoolConfig};
use crate::error::{PreforkError, Result};
use crate::http::{status, Completed, RequestArgs};
use crate::protocol::ServerInfo;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

/// The counter component of request ids wraps at 36².
const ID_COUNTER_WRAP: u32 = 36 * 36;

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}

/// Short, ordered, process-unique id generator: a base-36 millisecond
/// timestamp plus a wrapping base-36 counter. Suitable for log
/// correlation.
pub struct IdGen {
    counter: AtomicU32,
}

impl IdGen {
    pub fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
        }
    }

    pub fn next(&self, prefix: &str) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let count = self.counter.fetch_add(1, Ordering::Relaxed) % ID_COUNTER_WRAP;
        format!("{}-{}{:0>2}", prefix, to_base36(millis), to_base36(count as u64))
    }
}

impl Default for IdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared registry of live child pids, for the emergency kill path.
#[derive(Default)]
pub struct KillList {
    pids: Mutex<HashSet<u32>>,
}

impl KillList {
    pub fn register(&self, pid: u32) {
        self.pids.lock().expect("kill list poisoned").insert(pid);
    }

    pub fn unregister(&self, pid: u32) {
        self.pids.lock().expect("kill list poisoned").remove(&pid);
    }

    pub fn len(&self) -> usize {
        self.pids.lock().expect("kill list poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// SIGKILL every registered child immediately.
    pub fn kill_all(&self) {
        let pids: Vec<u32> = self
            .pids
            .lock()
            .expect("kill list poisoned")
            .iter()
            .copied()
            .collect();
        for pid in pids {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
}

/// Build the trimmed host view sent to workers at startup.
pub(crate) fn local_server_info(uncaught_exception: bool) -> ServerInfo {
    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    ServerInfo {
        hostname,
        ip: "127.0.0.1".to_string(),
        uncaught_exception,
    }
}

/// Owns the `pool_id → pool` mapping, fans process-wide operations out to
/// every pool, and drives the 1-second tick.
pub struct PoolManager {
    config: ManagerConfig,
    pools: Mutex<HashMap<String, PoolHandle>>,
    router: Router,
    ids: Arc<IdGen>,
    kill_list: Arc<KillList>,
    server: ServerInfo,
}

impl PoolManager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            server: local_server_info(config.emergency_shutdown),
            config,
            pools: Mutex::new(HashMap::new()),
            router: Router::new(),
            ids: Arc::new(IdGen::new()),
            kill_list: Arc::new(KillList::default()),
        });
        if manager.config.emergency_shutdown {
            manager.install_emergency_handler();
        }
        manager
    }

    /// Instantiate every enabled pool from the config, with at most
    /// `startup_threads` pools starting concurrently.
    pub async fn startup(self: &Arc<Self>) -> Result<()> {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.startup_threads.max(1)));
        let mut tasks = tokio::task::JoinSet::new();

        for (id, pool_config) in self.config.pools.clone() {
            if !pool_config.enabled {
                tracing::info!(pool = %id, "pool disabled, skipping");
                continue;
            }
            let manager = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                manager.create_pool(&id, pool_config).await.map(|_| id)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(id)) => tracing::info!(pool = %id, "pool started"),
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(PreforkError::Pool(format!("startup task failed: {}", e))),
            }
        }
        Ok(())
    }

    /// Create and register a pool; binds its URI route when configured.
    pub async fn create_pool(&self, id: &str, config: PoolConfig) -> Result<PoolHandle> {
        if self.pools.lock().expect("pools lock poisoned").contains_key(id) {
            return Err(PreforkError::PoolExists(id.to_string()));
        }

        let uri_match = config.uri_match.clone();
        let acl = config.acl.clone();
        let handle = WorkerPool::start(
            id,
            config,
            self.ids.clone(),
            self.kill_list.clone(),
            self.server.clone(),
        )
        .await?;

        if let Some(pattern) = uri_match {
            self.router.register(id, &pattern, acl, handle.clone())?;
        }

        let mut pools = self.pools.lock().expect("pools lock poisoned");
        if pools.insert(id.to_string(), handle.clone()).is_some() {
            // Lost a create race; the newer pool wins and the older one
            // was just replaced, which create_pool guards against above.
            tracing::warn!(pool = %id, "pool replaced concurrently");
        }
        Ok(handle)
    }

    /// Deregister the pool's route and shut down all its workers. After
    /// this returns, no child process from the pool remains alive.
    pub async fn remove_pool(&self, id: &str) -> Result<()> {
        let handle = self
            .pools
            .lock()
            .expect("pools lock poisoned")
            .remove(id)
            .ok_or_else(|| PreforkError::PoolNotFound(id.to_string()))?;
        self.router.deregister(id);
        handle.shutdown().await
    }

    pub fn pool(&self, id: &str) -> Option<PoolHandle> {
        self.pools.lock().expect("pools lock poisoned").get(id).cloned()
    }

    pub fn pools(&self) -> Vec<PoolHandle> {
        self.pools
            .lock()
            .expect("pools lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Short ordered unique id (see [`IdGen`]).
    pub fn unique_id(&self, prefix: &str) -> String {
        self.ids.next(prefix)
    }

    /// Route an incoming request by URI. `None` means no binding
    /// matched and the collaborator should handle the request itself.
    pub async fn dispatch_uri(&self, args: RequestArgs) -> Option<Result<Completed>> {
        match self.router.route(&args.uri, &args.ip) {
            RouteDecision::NoMatch => None,
            RouteDecision::Forbidden => Some(Ok(Completed::error(
                status::FORBIDDEN,
                "client address rejected by pool ACL",
            ))),
            RouteDecision::Pool(handle) => Some(handle.dispatch(args).await),
        }
    }

    /// Fan a tick out to every pool.
    pub fn tick(&self) {
        for handle in self.pools() {
            handle.tick();
        }
    }

    /// Drive `tick()` at 1 Hz until the returned handle is aborted.
    pub fn start_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                manager.tick();
            }
        })
    }

    /// Shut every pool down and wait for their children to drain.
    pub async fn shutdown(&self) {
        let handles: Vec<PoolHandle> = {
            let mut pools = self.pools.lock().expect("pools lock poisoned");
            pools.drain().map(|(_, handle)| handle).collect()
        };
        let mut tasks = tokio::task::JoinSet::new();
        for handle in handles {
            self.router.deregister(handle.id());
            tasks.spawn(async move { handle.shutdown().await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Ok(Err(e)) = joined {
                tracing::warn!(error = %e, "pool shutdown reported an error");
            }
        }
    }

    /// SIGKILL every known child pid immediately.
    pub fn emergency_shutdown(&self) {
        tracing::error!(children = self.kill_list.len(), "emergency shutdown: killing all children");
        self.kill_list.kill_all();
    }

    /// Arm a panic hook that kills all children before the process dies.
    fn install_emergency_handler(self: &Arc<Self>) {
        let kill_list = self.kill_list.clone();
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            previous(info);
            eprintln!("uncaught panic: killing all worker children");
            kill_list.kill_all();
            std::process::exit(1);
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base36_encoding() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1295), "zz");
    }

    #[test]
    fn ids_are_unique_and_prefixed() {
        let ids = IdGen::new();
        let mut seen = HashSet::new();
        for _ in 0..(ID_COUNTER_WRAP as usize) {
            let id = ids.next("req");
            assert!(id.starts_with("req-"));
            assert!(seen.insert(id), "id repeated within the wrap period");
        }
    }

    #[test]
    fn id_counter_wraps() {
        fn counter_suffix(id: &str) -> String {
            id.chars().rev().take(2).collect()
        }
        let ids = IdGen::new();
        let first = ids.next("x");
        for _ in 0..(ID_COUNTER_WRAP - 1) {
            ids.next("x");
        }
        let wrapped = ids.next("x");
        // The counter component repeats after the wrap period; the
        // timestamp keeps ids ordered.
        assert_eq!(counter_suffix(&first), counter_suffix(&wrapped));
    }

    #[test]
    fn kill_list_tracks_registration() {
        let list = KillList::default();
        assert!(list.is_empty());
        list.register(1111);
        list.register(2222);
        assert_eq!(list.len(), 2);
        list.unregister(1111);
        assert_eq!(list.len(), 1);
        list.unregister(2222);
        assert!(list.is_empty());
    }

    #[test]
    fn server_info_has_hostname() {
        let info = local_server_info(true);
        assert!(!info.hostname.is_empty());
        assert!(info.uncaught_exception);
    }

    #[tokio::test]
    async fn create_pool_with_bad_executable_fails() {
        let manager = PoolManager::new(ManagerConfig::default());
        let config = PoolConfig::for_worker("/nonexistent/prefork-worker-binary");
        let result = manager.create_pool("broken", config).await;
        assert!(matches!(result, Err(PreforkError::Spawn(_))));
        assert!(manager.pool("broken").is_none());
    }

    #[tokio::test]
    async fn remove_missing_pool_errors() {
        let manager = PoolManager::new(ManagerConfig::default());
        assert!(matches!(
            manager.remove_pool("ghost").await,
            Err(PreforkError::PoolNotFound(_))
        ));
    }
}

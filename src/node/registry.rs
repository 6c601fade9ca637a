use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinSet;

use crate::node::asyncutil::{StopSignal, TaskTracker};
use crate::node::catalog::Catalog;
use crate::node::config::NodeConfig;
use crate::node::error::NodeError;
use crate::node::installer::GuardInbox;
use crate::node::launcher::{launcher_for, Launcher};
use crate::node::lifecycle::{LifecycleEnv, ServerHandle};
use crate::node::log::{EventLog, LogType};
use crate::node::scheduler::Scheduler;
use crate::node::server::Server;

/// In-memory server table. IDs are handed out once and never reused.
#[derive(Debug, Default)]
pub struct Registry {
    servers: RwLock<BTreeMap<u32, Arc<ServerHandle>>>,
    next_id: AtomicU32,
}

impl Registry {
    pub fn new(first_id: u32) -> Self {
        Self {
            servers: RwLock::new(BTreeMap::new()),
            next_id: AtomicU32::new(first_id),
        }
    }

    pub fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn insert(&self, handle: Arc<ServerHandle>) {
        let mut g = self.servers.write().unwrap_or_else(|p| p.into_inner());
        g.insert(handle.id(), handle);
    }

    pub fn get(&self, id: u32) -> Option<Arc<ServerHandle>> {
        let g = self.servers.read().unwrap_or_else(|p| p.into_inner());
        g.get(&id).cloned()
    }

    pub fn contains(&self, id: u32) -> bool {
        let g = self.servers.read().unwrap_or_else(|p| p.into_inner());
        g.contains_key(&id)
    }

    pub fn remove(&self, id: u32) -> Option<Arc<ServerHandle>> {
        let mut g = self.servers.write().unwrap_or_else(|p| p.into_inner());
        g.remove(&id)
    }

    /// Ordered by id.
    pub fn list(&self) -> Vec<Arc<ServerHandle>> {
        let g = self.servers.read().unwrap_or_else(|p| p.into_inner());
        g.values().cloned().collect()
    }
}

/// Everything the node shares between the console, the socket, schedules and server
/// actors. Lives from boot to shutdown.
#[derive(Debug)]
pub struct NodeContext {
    pub cfg: Arc<NodeConfig>,
    pub catalog: Catalog,
    pub registry: Registry,
    pub scheduler: Scheduler,
    pub log: EventLog,
    pub tasks: TaskTracker,
    pub launcher: Arc<dyn Launcher>,
    pub guard: GuardInbox,
    /// Fired by `quit`/`exit` and by signals.
    pub shutdown: StopSignal,
}

impl NodeContext {
    pub fn new(cfg: NodeConfig, log: EventLog, tasks: TaskTracker) -> Arc<Self> {
        let launcher = launcher_for(&cfg.launch);
        Self::with_launcher(cfg, log, tasks, launcher)
    }

    pub fn with_launcher(cfg: NodeConfig, log: EventLog, tasks: TaskTracker, launcher: Arc<dyn Launcher>) -> Arc<Self> {
        // Numbered directories left over from an earlier run keep their ids reserved.
        let first_id = highest_numbered_dir(&cfg.servers_directory()).map_or(0, |n| n.saturating_add(1));
        Arc::new(Self {
            catalog: Catalog::new(&cfg.apps),
            cfg: Arc::new(cfg),
            registry: Registry::new(first_id),
            scheduler: Scheduler::new(),
            log,
            tasks,
            launcher,
            guard: GuardInbox::new(),
            shutdown: StopSignal::new(),
        })
    }

    pub fn env(&self) -> LifecycleEnv {
        LifecycleEnv {
            cfg: Arc::clone(&self.cfg),
            log: self.log.clone(),
            tasks: self.tasks.clone(),
            launcher: Arc::clone(&self.launcher),
            guard: self.guard.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Registers a new server for the app; nothing is written to disk yet.
    pub fn create_server(&self, short_name: &str) -> Result<Arc<ServerHandle>, NodeError> {
        let app = self
            .catalog
            .find(short_name)
            .ok_or_else(|| NodeError::UnknownApp(short_name.to_string()))?;
        let id = self.registry.allocate_id();
        let server = Arc::new(Server::new(id, app, self.cfg.server_directory(id)));
        let handle = ServerHandle::spawn(server, self.env());
        self.registry.insert(Arc::clone(&handle));
        self.log.event(
            LogType::Server,
            Some(id),
            format!("created app={} dir={}", handle.server.app.short_name, handle.server.dir.display()),
        );
        Ok(handle)
    }

    pub fn server(&self, id: &str) -> Result<Arc<ServerHandle>, NodeError> {
        id.trim()
            .parse::<u32>()
            .ok()
            .and_then(|n| self.registry.get(n))
            .ok_or_else(|| NodeError::UnknownServer(id.to_string()))
    }

    /// Deletes numerically named server directories that no registered server owns.
    pub fn cleanup(&self) -> anyhow::Result<Vec<PathBuf>> {
        let root = self.cfg.servers_directory();
        let mut removed = vec![];
        let entries = match std::fs::read_dir(&root) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
            Err(e) => return Err(anyhow::Error::new(e).context(format!("read_dir {}", root.display()))),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            if self.registry.contains(id) {
                continue;
            }
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    self.log.event(LogType::Server, Some(id), format!("cleanup removed={}", path.display()));
                    removed.push(path);
                }
                Err(e) => self.log.event(
                    LogType::Server,
                    Some(id),
                    format!("cleanup_error path={} err={e}", path.display()),
                ),
            }
        }
        removed.sort();
        Ok(removed)
    }

    /// Stops every server at once and ends its actor. Returns how many were still
    /// shutting down when `timeout` ran out.
    pub async fn stop_all(&self, timeout: Duration) -> usize {
        let mut set = JoinSet::new();
        for handle in self.registry.list() {
            set.spawn(async move { handle.shutdown().await });
        }
        let drained = tokio::time::timeout(timeout, async {
            while set.join_next().await.is_some() {}
        })
        .await;
        if drained.is_ok() {
            return 0;
        }
        let left = set.len();
        self.log.event(
            LogType::Node,
            None,
            format!("stop_all outcome=timeout remaining={left} timeout_ms={}", timeout.as_millis()),
        );
        set.abort_all();
        left
    }
}

fn highest_numbered_dir(root: &Path) -> Option<u32> {
    std::fs::read_dir(root)
        .ok()?
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse::<u32>().ok()))
        .max()
}

use anyhow::Context as _;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc as tokio_mpsc, oneshot};

use crate::node::asyncutil::{StopSignal, TaskTracker};
use crate::node::config::NodeConfig;
use crate::node::error::NodeError;
use crate::node::installer::{GuardInbox, InstallerSession, ProgressSnapshot};
use crate::node::launcher::Launcher;
use crate::node::log::{EventLog, LogType};
use crate::node::server::{InstallPhase, RunPhase, Server};
use crate::node::watchdog::run_watchdog;

/// What a server actor needs from the node.
#[derive(Debug, Clone)]
pub struct LifecycleEnv {
    pub cfg: Arc<NodeConfig>,
    pub log: EventLog,
    pub tasks: TaskTracker,
    pub launcher: Arc<dyn Launcher>,
    pub guard: GuardInbox,
    /// The node-wide shutdown signal; long installer runs give up when it fires.
    pub shutdown: StopSignal,
}

pub(crate) enum LifecycleCmd {
    Install {
        updating: bool,
        resp: oneshot::Sender<anyhow::Result<bool>>,
    },
    Uninstall {
        resp: oneshot::Sender<anyhow::Result<bool>>,
    },
    Reinstall {
        resp: oneshot::Sender<anyhow::Result<bool>>,
    },
    Start {
        resp: oneshot::Sender<anyhow::Result<i32>>,
    },
    Stop {
        resp: oneshot::Sender<anyhow::Result<()>>,
    },
    Restart {
        resp: oneshot::Sender<anyhow::Result<i32>>,
    },
    Kill {
        resp: oneshot::Sender<anyhow::Result<()>>,
    },
    Delete {
        resp: oneshot::Sender<anyhow::Result<()>>,
    },
    /// Sent by the watchdog of launch `epoch` after the process exited.
    Relaunch {
        epoch: u64,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// A queued lifecycle request. Dropping it does not cancel the operation.
#[must_use]
pub struct Pending<T>(oneshot::Receiver<anyhow::Result<T>>);

impl<T> Pending<T> {
    pub async fn wait(self) -> anyhow::Result<T> {
        self.0
            .await
            .map_err(|_| anyhow::anyhow!("server actor is gone"))?
    }
}

/// Registry entry: the server plus the queue of its lifecycle actor. Every lifecycle
/// operation on one server runs through that queue, one at a time.
#[derive(Debug)]
pub struct ServerHandle {
    pub server: Arc<Server>,
    tx: tokio_mpsc::UnboundedSender<LifecycleCmd>,
}

impl std::fmt::Debug for LifecycleCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleCmd::Install { updating: false, .. } => "install",
            LifecycleCmd::Install { updating: true, .. } => "update",
            LifecycleCmd::Uninstall { .. } => "uninstall",
            LifecycleCmd::Reinstall { .. } => "reinstall",
            LifecycleCmd::Start { .. } => "start",
            LifecycleCmd::Stop { .. } => "stop",
            LifecycleCmd::Restart { .. } => "restart",
            LifecycleCmd::Kill { .. } => "kill",
            LifecycleCmd::Delete { .. } => "delete",
            LifecycleCmd::Relaunch { .. } => "relaunch",
            LifecycleCmd::Shutdown { .. } => "shutdown",
        };
        f.write_str(name)
    }
}

impl ServerHandle {
    pub fn spawn(server: Arc<Server>, env: LifecycleEnv) -> Arc<Self> {
        let (tx, rx) = tokio_mpsc::unbounded_channel::<LifecycleCmd>();
        let weak = tx.downgrade();
        env.tasks
            .clone()
            .spawn(actor_loop(Arc::clone(&server), env, rx, weak));
        Arc::new(Self { server, tx })
    }

    pub fn id(&self) -> u32 {
        self.server.id
    }

    fn request<T>(&self, make: impl FnOnce(oneshot::Sender<anyhow::Result<T>>) -> LifecycleCmd) -> Pending<T> {
        let (resp, rx) = oneshot::channel();
        // A closed queue drops `resp`, which surfaces as "actor is gone" in `wait`.
        let _ = self.tx.send(make(resp));
        Pending(rx)
    }

    pub fn install(&self) -> Pending<bool> {
        self.request(|resp| LifecycleCmd::Install { updating: false, resp })
    }

    pub fn update(&self) -> Pending<bool> {
        self.request(|resp| LifecycleCmd::Install { updating: true, resp })
    }

    pub fn uninstall(&self) -> Pending<bool> {
        self.request(|resp| LifecycleCmd::Uninstall { resp })
    }

    pub fn reinstall(&self) -> Pending<bool> {
        self.request(|resp| LifecycleCmd::Reinstall { resp })
    }

    pub fn start(&self) -> Pending<i32> {
        self.request(|resp| LifecycleCmd::Start { resp })
    }

    /// Intent is recorded and the watchdog released right away, ahead of whatever the
    /// actor is still busy with.
    pub fn stop(&self) -> Pending<()> {
        release_watchdog(&self.server);
        self.request(|resp| LifecycleCmd::Stop { resp })
    }

    pub fn restart(&self) -> Pending<i32> {
        release_watchdog(&self.server);
        self.request(|resp| LifecycleCmd::Restart { resp })
    }

    /// Forceful; leaves `should_run` alone, so keep-alive may bring the server back.
    pub fn kill(&self) -> Pending<()> {
        self.request(|resp| LifecycleCmd::Kill { resp })
    }

    pub fn delete(&self) -> Pending<()> {
        self.request(|resp| LifecycleCmd::Delete { resp })
    }

    /// Stops the process and ends the actor.
    pub async fn shutdown(&self) {
        release_watchdog(&self.server);
        let (resp, rx) = oneshot::channel();
        if self.tx.send(LifecycleCmd::Shutdown { resp }).is_ok() {
            let _ = rx.await;
        }
    }
}

fn release_watchdog(server: &Server) {
    let mut st = server.state();
    st.should_run = false;
    st.watchdog_stop.fire();
}

async fn actor_loop(
    server: Arc<Server>,
    env: LifecycleEnv,
    mut rx: tokio_mpsc::UnboundedReceiver<LifecycleCmd>,
    weak_tx: tokio_mpsc::WeakUnboundedSender<LifecycleCmd>,
) {
    let id = server.id;
    let actor = Actor {
        server,
        env,
        weak_tx,
    };
    while let Some(cmd) = rx.recv().await {
        actor.log(format!("op={cmd:?} phase=begin"));
        match cmd {
            LifecycleCmd::Install { updating, resp } => {
                let _ = resp.send(actor.install(updating).await);
            }
            LifecycleCmd::Uninstall { resp } => {
                let _ = resp.send(actor.uninstall().await);
            }
            LifecycleCmd::Reinstall { resp } => {
                let r = match actor.uninstall().await {
                    Ok(true) => actor.install(false).await,
                    other => other,
                };
                let _ = resp.send(r);
            }
            LifecycleCmd::Start { resp } => {
                let _ = resp.send(actor.start().await);
            }
            LifecycleCmd::Stop { resp } => {
                let _ = resp.send(actor.stop().await);
            }
            LifecycleCmd::Restart { resp } => {
                let r = match actor.stop().await {
                    Ok(()) => actor.start().await,
                    Err(e) => Err(e),
                };
                let _ = resp.send(r);
            }
            LifecycleCmd::Kill { resp } => {
                let _ = resp.send(actor.kill().await);
            }
            LifecycleCmd::Delete { resp } => {
                let r = actor.delete().await;
                let deleted = r.is_ok();
                let _ = resp.send(r);
                if deleted {
                    break;
                }
            }
            LifecycleCmd::Relaunch { epoch } => actor.relaunch(epoch).await,
            LifecycleCmd::Shutdown { resp } => {
                if let Err(e) = actor.stop().await {
                    actor.log(format!("op=shutdown outcome=error err={e:#}"));
                }
                let _ = resp.send(());
                break;
            }
        }
    }
    actor.env.log.event(LogType::Server, Some(id), "actor=exit");
}

struct Actor {
    server: Arc<Server>,
    env: LifecycleEnv,
    weak_tx: tokio_mpsc::WeakUnboundedSender<LifecycleCmd>,
}

impl Actor {
    fn log(&self, msg: impl AsRef<str>) {
        self.env.log.event(LogType::Server, Some(self.server.id), msg);
    }

    fn id(&self) -> u32 {
        self.server.id
    }

    async fn install(&self, updating: bool) -> anyhow::Result<bool> {
        let op = if updating { "update" } else { "install" };
        if self.server.is_running() {
            return Err(NodeError::AlreadyRunning(self.id()).into());
        }
        self.server.state().busy = Some(if updating {
            InstallPhase::Updating
        } else {
            InstallPhase::Installing
        });
        let r = self.install_inner(op).await;
        self.server.state().busy = None;
        match &r {
            Ok(true) => self.log(format!("op={op} outcome=success")),
            Ok(false) => self.log(format!("op={op} outcome=failed")),
            Err(e) => self.log(format!("op={op} outcome=error err={e:#}")),
        }
        r
    }

    async fn install_inner(&self, op: &str) -> anyhow::Result<bool> {
        let dir = self.server.dir.clone();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create {}", dir.display()))?;
        let progress = self.server.progress_sender();
        progress.send_replace(ProgressSnapshot::default());

        let session = self.unless_shutdown(self.open_installer()).await?;
        let steps = async {
            if !self.login(&session).await? {
                return Ok(None);
            }
            session.force_install_dir(&dir).await?;
            let ok = session
                .app_update(self.server.app.catalog_id, true)
                .await?;
            Ok::<_, anyhow::Error>(Some(ok))
        };
        let outcome = self.unless_shutdown(steps).await;
        self.close_installer(&session).await;
        let tracker = session.tracker();
        drop(session);

        let Some(ok) = outcome? else {
            return Ok(false);
        };

        if !ok {
            self.log(format!(
                "op={op} warning=installer_failed state={:?} reason={}",
                tracker.state,
                tracker.failure_reason.as_deref().unwrap_or("unknown")
            ));
            return Ok(false);
        }
        let steamapps = dir.join("steamapps");
        match tokio::fs::remove_dir_all(&steamapps).await {
            Ok(()) => self.log(format!("op={op} pruned={}", steamapps.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => self.log(format!("op={op} warning=prune_failed err={e}")),
        }
        Ok(true)
    }

    async fn open_installer(&self) -> anyhow::Result<InstallerSession> {
        InstallerSession::open(
            &self.env.cfg,
            self.env.log.clone(),
            Some(self.id()),
            Some(self.server.progress_sender()),
            self.env.guard.clone(),
            &self.env.tasks,
        )
        .await
    }

    /// Runs `fut` unless the node starts shutting down first.
    async fn unless_shutdown<T>(&self, fut: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
        tokio::select! {
            r = fut => r,
            _ = self.env.shutdown.wait() => {
                self.log("op=installer outcome=interrupted reason=node_shutdown");
                Err(anyhow::anyhow!("server {} installer interrupted by node shutdown", self.id()))
            }
        }
    }

    async fn close_installer(&self, session: &InstallerSession) {
        if self.env.shutdown.is_fired() {
            session.cancel("node shutdown");
        }
        session.shutdown().await;
    }

    async fn login(&self, session: &InstallerSession) -> anyhow::Result<bool> {
        let cfg = &self.env.cfg;
        let ok = match (&cfg.installer_username, &cfg.installer_password) {
            (Some(user), Some(pass)) => session.login_with_credentials(user, pass, None).await?,
            _ => session.login_anonymous().await?,
        };
        if !ok {
            self.log(format!("warning=login_failed state={:?}", session.tracker().state));
        }
        Ok(ok)
    }

    async fn uninstall(&self) -> anyhow::Result<bool> {
        if self.server.is_running() {
            return Err(NodeError::AlreadyRunning(self.id()).into());
        }
        let dir = self.server.dir.clone();
        if !dir.exists() {
            self.log("op=uninstall warning=not_installed");
            return Ok(false);
        }
        self.server.state().busy = Some(InstallPhase::Uninstalling);
        let r = self.uninstall_inner().await;
        self.server.state().busy = None;
        match &r {
            Ok(true) => self.log("op=uninstall outcome=success"),
            Ok(false) => self.log("op=uninstall outcome=failed"),
            Err(e) => self.log(format!("op=uninstall outcome=error err={e:#}")),
        }
        r
    }

    async fn uninstall_inner(&self) -> anyhow::Result<bool> {
        let dir = self.server.dir.clone();
        let session = self.unless_shutdown(self.open_installer()).await?;
        let steps = async {
            if self.login(&session).await? {
                session.force_install_dir(&dir).await?;
                session
                    .app_uninstall(self.server.app.catalog_id, true)
                    .await?;
            }
            Ok::<_, anyhow::Error>(())
        };
        let outcome = self.unless_shutdown(steps).await;
        self.close_installer(&session).await;
        drop(session);
        outcome?;

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(anyhow::Error::new(e).context(format!("remove {}", dir.display())));
            }
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::fs::metadata(&dir).await.is_ok() {
            if tokio::time::Instant::now() >= deadline {
                self.log(format!("op=uninstall warning=directory_still_present dir={}", dir.display()));
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(true)
    }

    async fn start(&self) -> anyhow::Result<i32> {
        if self.env.shutdown.is_fired() {
            self.log("op=start outcome=refused reason=node_shutdown");
            anyhow::bail!("server {}: node is shutting down", self.id());
        }
        if self.server.is_running() {
            self.log("op=start outcome=refused reason=already_running");
            return Err(NodeError::AlreadyRunning(self.id()).into());
        }
        if !self.server.is_installed() {
            self.log("op=start outcome=refused reason=not_installed");
            return Err(NodeError::NotInstalled(self.id()).into());
        }
        self.server.state().run_phase = RunPhase::Starting;
        let exe = self.server.executable_path();
        let args = self.server.rendered_args();
        let launched = self
            .env
            .launcher
            .launch_and_capture(self.id(), &self.server.dir, &exe, &args)
            .await;
        let handle = match launched {
            Ok(h) => h,
            Err(e) => {
                self.server.state().run_phase = RunPhase::Stopped;
                self.log(format!("op=start outcome=error err={e}"));
                return Err(e.into());
            }
        };

        let (epoch, stop) = {
            let mut st = self.server.state();
            st.process = Some(handle.clone());
            st.should_run = true;
            st.launch_epoch = st.launch_epoch.wrapping_add(1);
            st.watchdog_stop = StopSignal::new();
            st.run_phase = RunPhase::Running;
            (st.launch_epoch, st.watchdog_stop.clone())
        };
        self.log(format!(
            "op=start outcome=started pid={} launcher={} epoch={epoch}",
            handle.pid,
            self.env.launcher.name()
        ));
        self.env.tasks.spawn(run_watchdog(
            Arc::clone(&self.server),
            self.env.clone(),
            handle.clone(),
            epoch,
            stop,
            self.weak_tx.clone(),
        ));
        Ok(handle.pid)
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let handle = {
            let mut st = self.server.state();
            st.should_run = false;
            st.watchdog_stop.fire();
            st.process.clone()
        };
        let Some(handle) = handle.filter(|h| h.is_alive()) else {
            let mut st = self.server.state();
            st.process = None;
            st.run_phase = RunPhase::Stopped;
            self.log("op=stop outcome=already_stopped");
            return Ok(());
        };
        self.server.state().run_phase = RunPhase::Stopping;
        let timeout = Duration::from_millis(self.env.cfg.watchdog.stop_timeout_ms);
        let gone = self.env.launcher.terminate(&handle, timeout).await;
        {
            let mut st = self.server.state();
            st.process = None;
            st.run_phase = RunPhase::Stopped;
        }
        if !gone {
            anyhow::bail!("server {} pid {} did not exit after SIGKILL", self.id(), handle.pid);
        }
        self.log(format!("op=stop outcome=stopped pid={}", handle.pid));
        Ok(())
    }

    async fn kill(&self) -> anyhow::Result<()> {
        let handle = self.server.state().process.clone();
        match handle.filter(|h| h.is_alive()) {
            Some(h) => {
                let gone = self.env.launcher.terminate(&h, Duration::ZERO).await;
                anyhow::ensure!(gone, "server {} pid {} survived SIGKILL", self.id(), h.pid);
                self.log(format!("op=kill outcome=killed pid={}", h.pid));
            }
            None => self.log("op=kill outcome=not_running"),
        }
        Ok(())
    }

    async fn delete(&self) -> anyhow::Result<()> {
        if self.server.is_running() {
            return Err(NodeError::AlreadyRunning(self.id()).into());
        }
        release_watchdog(&self.server);
        match tokio::fs::remove_dir_all(&self.server.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(anyhow::Error::new(e).context(format!("remove {}", self.server.dir.display()))),
        }
        self.log(format!("op=delete outcome=deleted dir={}", self.server.dir.display()));
        Ok(())
    }

    async fn relaunch(&self, epoch: u64) {
        let (current, keep_alive, should_run) = {
            let st = self.server.state();
            (st.launch_epoch, st.keep_alive, st.should_run)
        };
        if epoch != current {
            self.log(format!("op=relaunch outcome=ignored reason=stale_epoch got={epoch} want={current}"));
            return;
        }
        if !(keep_alive && should_run) {
            self.log("op=relaunch outcome=ignored reason=policy");
            return;
        }
        self.server.state().process = None;
        if let Err(e) = self.start().await {
            self.log(format!("op=relaunch outcome=error err={e:#}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::registry::NodeContext;

    #[tokio::test]
    async fn relaunch_from_an_old_launch_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = NodeContext::new(NodeConfig::with_root(dir.path()), EventLog::capturing(), TaskTracker::new());
        let h = ctx.create_server("css").unwrap();
        {
            let mut st = h.server.state();
            st.launch_epoch = 5;
            st.keep_alive = true;
            st.should_run = true;
        }

        h.tx.send(LifecycleCmd::Relaunch { epoch: 4 }).unwrap();
        // Kill leaves should_run alone, so it only serves as a queue barrier here.
        h.kill().wait().await.unwrap();
        let log = ctx.log.captured();
        assert!(log.iter().any(|l| l.contains("reason=stale_epoch got=4 want=5")), "{log:?}");
        assert!(!log.iter().any(|l| l.contains("op=start")), "{log:?}");

        h.tx.send(LifecycleCmd::Relaunch { epoch: 5 }).unwrap();
        h.kill().wait().await.unwrap();
        let log = ctx.log.captured();
        assert!(log.iter().any(|l| l.contains("op=start outcome=refused reason=not_installed")), "{log:?}");
    }

    #[tokio::test]
    async fn relaunch_respects_keepalive_off() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = NodeContext::new(NodeConfig::with_root(dir.path()), EventLog::capturing(), TaskTracker::new());
        let h = ctx.create_server("css").unwrap();
        h.server.state().should_run = true;

        h.tx.send(LifecycleCmd::Relaunch { epoch: 0 }).unwrap();
        h.kill().wait().await.unwrap();
        let log = ctx.log.captured();
        assert!(log.iter().any(|l| l.contains("op=relaunch outcome=ignored reason=policy")), "{log:?}");
    }

    #[tokio::test]
    async fn start_is_refused_once_the_node_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = NodeContext::new(NodeConfig::with_root(dir.path()), EventLog::capturing(), TaskTracker::new());
        let h = ctx.create_server("css").unwrap();
        ctx.shutdown.fire();
        assert!(h.start().wait().await.is_err());
        assert!(ctx.log.captured().iter().any(|l| l.contains("reason=node_shutdown")));
    }
}

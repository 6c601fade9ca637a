use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use crate::node::asyncutil::StopSignal;
use crate::node::catalog::{substitute, AppDefinition, Variable};
use crate::node::installer::ProgressSnapshot;
use crate::node::launcher::ProcessHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstallPhase {
    Uninstalled,
    Installing,
    Installed,
    Updating,
    Uninstalling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Mutable per-server state. Only the server's lifecycle actor changes `process`;
/// the flags may be flipped from anywhere.
#[derive(Debug)]
pub struct ServerState {
    pub args: Vec<String>,
    pub variables: Vec<Variable>,
    /// Operator intent.
    pub should_run: bool,
    /// Relaunch on unexpected exit.
    pub keep_alive: bool,
    pub process: Option<ProcessHandle>,
    /// Set while an install/update/uninstall is in flight.
    pub busy: Option<InstallPhase>,
    pub run_phase: RunPhase,
    /// Bumped on every launch so a stale watchdog cannot relaunch a newer process.
    pub launch_epoch: u64,
    /// Releases the current watchdog's grace wait.
    pub watchdog_stop: StopSignal,
}

/// One managed dedicated-server instance.
#[derive(Debug)]
pub struct Server {
    pub id: u32,
    pub app: Arc<AppDefinition>,
    pub dir: PathBuf,
    state: Mutex<ServerState>,
    progress: watch::Sender<ProgressSnapshot>,
}

impl Server {
    pub fn new(id: u32, app: Arc<AppDefinition>, dir: PathBuf) -> Self {
        let (progress, _) = watch::channel(ProgressSnapshot::default());
        let state = ServerState {
            args: app.default_arg_list(),
            variables: app.variables.clone(),
            should_run: false,
            keep_alive: false,
            process: None,
            busy: None,
            run_phase: RunPhase::Stopped,
            launch_epoch: 0,
            watchdog_stop: StopSignal::new(),
        };
        Self {
            id,
            app,
            dir,
            state: Mutex::new(state),
            progress,
        }
    }

    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn executable_path(&self) -> PathBuf {
        self.dir.join(&self.app.executable_linux)
    }

    pub fn is_installed(&self) -> bool {
        self.executable_path().is_file()
    }

    pub fn is_running(&self) -> bool {
        self.state().process.as_ref().is_some_and(|p| p.is_alive())
    }

    pub fn pid(&self) -> Option<i32> {
        self.state().process.as_ref().map(|p| p.pid)
    }

    pub fn install_phase(&self) -> InstallPhase {
        if let Some(busy) = self.state().busy {
            return busy;
        }
        if self.is_installed() {
            InstallPhase::Installed
        } else {
            InstallPhase::Uninstalled
        }
    }

    pub fn keep_alive(&self) -> bool {
        self.state().keep_alive
    }

    pub fn set_keep_alive(&self, on: bool) {
        self.state().keep_alive = on;
    }

    pub fn should_run(&self) -> bool {
        self.state().should_run
    }

    pub fn set_args(&self, args: Vec<String>) {
        self.state().args = args;
    }

    /// Updates an existing variable in place or appends a new command-line one.
    pub fn set_variable(&self, name: &str, value: &str) {
        let mut st = self.state();
        match st.variables.iter_mut().find(|v| v.name == name) {
            Some(v) => v.value = value.to_string(),
            None => st.variables.push(Variable::new(name, value)),
        }
    }

    /// Arguments with every `!{name}` placeholder filled in.
    pub fn rendered_args(&self) -> Vec<String> {
        let st = self.state();
        st.args.iter().map(|a| substitute(a, &st.variables)).collect()
    }

    pub fn progress(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress.subscribe()
    }

    pub fn progress_sender(&self) -> watch::Sender<ProgressSnapshot> {
        self.progress.clone()
    }

    /// One line for `server list`.
    pub fn summary(&self) -> String {
        format!(
            "{:>4}  {:<10} {:<12} {:<9} keepalive={} pid={}",
            self.id,
            self.app.short_name,
            format!("{:?}", self.install_phase()),
            if self.is_running() { "running" } else { "stopped" },
            if self.keep_alive() { "on" } else { "off" },
            self.pid().map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
        )
    }

    /// Multi-line detail for `server view`.
    pub fn view(&self) -> String {
        let (args, vars, should_run, keep_alive, run_phase, process) = {
            let st = self.state();
            (
                st.args.clone(),
                st.variables.clone(),
                st.should_run,
                st.keep_alive,
                st.run_phase,
                st.process.clone(),
            )
        };
        let snap = self.progress.borrow().clone();
        let mut out = vec![
            format!("server {} ({})", self.id, self.app.name),
            format!("  app: {} catalog_id={}", self.app.short_name, self.app.catalog_id),
            format!("  directory: {}", self.dir.display()),
            format!("  executable: {}", self.executable_path().display()),
            format!("  install: {:?}", self.install_phase()),
            format!("  run: {run_phase:?} running={} should_run={should_run} keepalive={keep_alive}", self.is_running()),
            format!("  args: {}", args.join(" ")),
            format!("  command line: {}", self.rendered_args().join(" ")),
        ];
        for v in &vars {
            out.push(format!(
                "  var {}={}{}",
                v.name,
                v.value,
                if v.for_commandline { "" } else { " (not on command line)" }
            ));
        }
        out.push(format!(
            "  installer: state={:?} progress={:.2} eta_s={}",
            snap.state,
            snap.progress,
            snap.eta_secs.map(|s| format!("{s:.0}")).unwrap_or_else(|| "-".into())
        ));
        match process {
            Some(p) => out.push(format!(
                "  process: pid={} alive={} memory_bytes={} cpu_percent={:.1}{}",
                p.pid,
                p.is_alive(),
                p.memory_bytes().map(|m| m.to_string()).unwrap_or_else(|| "-".into()),
                p.cpu_percent(),
                p.session.as_deref().map(|s| format!(" session={s}")).unwrap_or_default()
            )),
            None => out.push("  process: -".to_string()),
        }
        out.join("\n")
    }
}

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

use crate::node::config::{LaunchConfig, LaunchStrategy};
use crate::node::error::NodeError;

/// A launched server process, found again by PID (and tmux session name when used).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: i32,
    pub session: Option<String>,
}

impl ProcessHandle {
    pub fn is_alive(&self) -> bool {
        pid_alive(self.pid)
    }

    /// Resident set size in bytes, from `/proc/<pid>/statm`.
    pub fn memory_bytes(&self) -> Option<u64> {
        let statm = std::fs::read_to_string(format!("/proc/{}/statm", self.pid)).ok()?;
        let resident: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident.saturating_mul(page_size()))
    }

    /// Not sampled; always 0.
    pub fn cpu_percent(&self) -> f64 {
        0.0
    }
}

fn page_size() -> u64 {
    let v = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if v <= 0 {
        4096
    } else {
        v as u64
    }
}

fn read_pid_state(pid: i32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let rparen = stat.rfind(')')?;
    stat.get(rparen + 2..)?.chars().next()
}

/// True while the PID exists and is not a zombie. The launched processes are not our
/// children, so a zombie just means nobody has reaped it yet.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) | Err(Errno::EPERM) => !matches!(read_pid_state(pid), Some('Z') | Some('X')),
        Err(_) => false,
    }
}

/// Starts a server detached from the node and reports its PID.
#[async_trait]
pub trait Launcher: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    async fn launch_and_capture(
        &self,
        id: u32,
        dir: &Path,
        exe: &Path,
        args: &[String],
    ) -> Result<ProcessHandle, NodeError>;

    /// SIGTERM, then SIGKILL once `timeout` has passed. Returns true when the process is gone.
    async fn terminate(&self, handle: &ProcessHandle, timeout: Duration) -> bool {
        signal_and_wait(handle.pid, timeout).await
    }
}

pub fn launcher_for(cfg: &LaunchConfig) -> std::sync::Arc<dyn Launcher> {
    let capture_timeout = Duration::from_millis(cfg.capture_timeout_ms);
    match cfg.strategy {
        LaunchStrategy::Detached => std::sync::Arc::new(DetachedLauncher { capture_timeout }),
        LaunchStrategy::Tmux => std::sync::Arc::new(TmuxLauncher { capture_timeout }),
    }
}

async fn signal_and_wait(pid: i32, timeout: Duration) -> bool {
    if !pid_alive(pid) {
        return true;
    }
    let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    if wait_gone(pid, timeout).await {
        return true;
    }
    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
    wait_gone(pid, Duration::from_secs(2)).await
}

async fn wait_gone(pid: i32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !pid_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Gives a freshly reported PID a moment to show up in /proc.
async fn wait_valid(pid: i32) {
    for _ in 0..10 {
        if pid_alive(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn capture_pid(id: u32, mut cmd: Command, timeout: Duration) -> Result<i32, NodeError> {
    let capture_err = |reason: String| NodeError::LaunchCapture { id, reason };
    cmd.stdin(std::process::Stdio::null());
    cmd.kill_on_drop(true);
    let out = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| capture_err(format!("no pid within {}ms", timeout.as_millis())))?
        .map_err(|e| capture_err(format!("spawn failed: {e}")))?;
    let stdout = String::from_utf8_lossy(&out.stdout);
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(capture_err(format!("launch script failed status={} stderr={:?}", out.status, stderr.trim())));
    }
    parse_pid(&stdout).ok_or_else(|| capture_err(format!("unparseable output {:?}", stdout.trim())))
}

/// The last non-empty line, as a positive PID.
pub fn parse_pid(output: &str) -> Option<i32> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()?
        .parse::<i32>()
        .ok()
        .filter(|p| *p > 0)
}

/// `sh -c '... & echo $!'`, output appended to `console.log` in the server directory.
#[derive(Debug)]
pub struct DetachedLauncher {
    capture_timeout: Duration,
}

const DETACHED_SCRIPT: &str = r#"cd "$1" || exit 1; shift; nohup "$@" >>console.log 2>&1 </dev/null & echo $!"#;

#[async_trait]
impl Launcher for DetachedLauncher {
    fn name(&self) -> &'static str {
        "detached"
    }

    async fn launch_and_capture(
        &self,
        id: u32,
        dir: &Path,
        exe: &Path,
        args: &[String],
    ) -> Result<ProcessHandle, NodeError> {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(DETACHED_SCRIPT).arg("sh").arg(dir).arg(exe).args(args);
        let pid = capture_pid(id, cmd, self.capture_timeout).await?;
        wait_valid(pid).await;
        Ok(ProcessHandle { pid, session: None })
    }
}

/// One tmux session per server, named `servernode-<id>`.
#[derive(Debug)]
pub struct TmuxLauncher {
    capture_timeout: Duration,
}

pub fn tmux_session_name(id: u32) -> String {
    format!("servernode-{id}")
}

#[async_trait]
impl Launcher for TmuxLauncher {
    fn name(&self) -> &'static str {
        "tmux"
    }

    async fn launch_and_capture(
        &self,
        id: u32,
        dir: &Path,
        exe: &Path,
        args: &[String],
    ) -> Result<ProcessHandle, NodeError> {
        let session = tmux_session_name(id);
        // A stale session with the same name would make new-session fail.
        let _ = Command::new("tmux")
            .args(["kill-session", "-t", &session])
            .output()
            .await;
        let mut cmd = Command::new("tmux");
        cmd.args(["new-session", "-d", "-s", &session, "-P", "-F", "#{pane_pid}", "-c"])
            .arg(dir)
            .arg("--")
            .arg(exe)
            .args(args);
        let pid = capture_pid(id, cmd, self.capture_timeout).await?;
        wait_valid(pid).await;
        Ok(ProcessHandle {
            pid,
            session: Some(session),
        })
    }

    async fn terminate(&self, handle: &ProcessHandle, timeout: Duration) -> bool {
        let gone = signal_and_wait(handle.pid, timeout).await;
        if let Some(session) = &handle.session {
            let _ = Command::new("tmux")
                .args(["kill-session", "-t", session])
                .output()
                .await;
        }
        gone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pid_takes_last_line() {
        assert_eq!(parse_pid("noise\n 4242 \n\n"), Some(4242));
        assert_eq!(parse_pid("abc"), None);
        assert_eq!(parse_pid("0"), None);
        assert_eq!(parse_pid(""), None);
    }

    #[test]
    fn own_process_is_alive_and_has_memory() {
        let me = ProcessHandle {
            pid: std::process::id() as i32,
            session: None,
        };
        assert!(me.is_alive());
        assert!(me.memory_bytes().unwrap() > 0);
        assert!(!pid_alive(-1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn detached_launch_reports_pid_and_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = DetachedLauncher {
            capture_timeout: Duration::from_secs(5),
        };
        let handle = launcher
            .launch_and_capture(1, dir.path(), Path::new("/bin/sleep"), &["30".to_string()])
            .await
            .unwrap();
        assert!(handle.is_alive());
        assert!(launcher.terminate(&handle, Duration::from_secs(2)).await);
        assert!(!handle.is_alive());
        assert!(dir.path().join("console.log").exists());
    }

    #[tokio::test]
    async fn failing_script_is_a_capture_error() {
        let launcher = DetachedLauncher {
            capture_timeout: Duration::from_secs(5),
        };
        let err = launcher
            .launch_and_capture(7, Path::new("/definitely/missing"), Path::new("/bin/true"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::LaunchCapture { id: 7, .. }));
    }
}

use anyhow::Context as _;
use chrono::Local;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::io::AsyncWriteExt as _;
use tokio::sync::mpsc as tokio_mpsc;

use crate::node::asyncutil::TaskTracker;

const EARLY_LOG_MAX_LINES: usize = 5000;

/// Event categories. Each can be switched off at runtime with `log disable <type>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogType {
    Node,
    Command,
    Server,
    Installer,
    Progress,
    Terminal,
    Watchdog,
    Socket,
    Schedule,
}

impl LogType {
    pub const ALL: [LogType; 9] = [
        LogType::Node,
        LogType::Command,
        LogType::Server,
        LogType::Installer,
        LogType::Progress,
        LogType::Terminal,
        LogType::Watchdog,
        LogType::Socket,
        LogType::Schedule,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Node => "node",
            LogType::Command => "command",
            LogType::Server => "server",
            LogType::Installer => "installer",
            LogType::Progress => "progress",
            LogType::Terminal => "terminal",
            LogType::Watchdog => "watchdog",
            LogType::Socket => "socket",
            LogType::Schedule => "schedule",
        }
    }

    fn bit(&self) -> u32 {
        1 << (*self as u32)
    }
}

impl FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        LogType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown log type {s:?}"))
    }
}

/// Rendered the same way everywhere: `<ts> [<type>] server=<id> <msg>`.
pub fn format_event(kind: LogType, server: Option<u32>, msg: &str) -> String {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    match server {
        Some(id) => format!("{ts} [{}] server={id} {msg}", kind.as_str()),
        None => format!("{ts} [{}] {msg}", kind.as_str()),
    }
}

/// Cloneable handle to the node's event log.
///
/// Lines are echoed to stderr immediately and pushed to a single consumer task that owns
/// the log file. Anything logged before that consumer exists is held in a bounded buffer
/// and written first once it starts.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<LogInner>,
}

#[derive(Debug)]
struct LogInner {
    enabled: AtomicU32,
    echo_stderr: bool,
    tx: OnceLock<tokio_mpsc::UnboundedSender<String>>,
    early: Mutex<VecDeque<String>>,
    no_file: AtomicBool,
    captured: Option<Mutex<Vec<String>>>,
}

impl EventLog {
    /// `disabled` names log types that start switched off; unknown names are reported
    /// back so the caller can warn about them.
    pub fn new(disabled: &[String]) -> (Self, Vec<String>) {
        Self::build(disabled, true, false)
    }

    /// No stderr echo, no file; every enabled line is kept in memory for inspection.
    pub fn capturing() -> Self {
        Self::build(&[], false, true).0
    }

    fn build(disabled: &[String], echo_stderr: bool, capture: bool) -> (Self, Vec<String>) {
        let mut mask: u32 = LogType::ALL.iter().map(|t| t.bit()).fold(0, |a, b| a | b);
        let mut unknown = vec![];
        for name in disabled {
            match name.parse::<LogType>() {
                Ok(t) => mask &= !t.bit(),
                Err(_) => unknown.push(name.clone()),
            }
        }
        let log = Self {
            inner: Arc::new(LogInner {
                enabled: AtomicU32::new(mask),
                echo_stderr,
                tx: OnceLock::new(),
                early: Mutex::new(VecDeque::new()),
                no_file: AtomicBool::new(capture),
                captured: capture.then(|| Mutex::new(vec![])),
            }),
        };
        (log, unknown)
    }

    pub fn is_enabled(&self, kind: LogType) -> bool {
        self.inner.enabled.load(Ordering::SeqCst) & kind.bit() != 0
    }

    pub fn set_enabled(&self, kind: LogType, on: bool) {
        if on {
            self.inner.enabled.fetch_or(kind.bit(), Ordering::SeqCst);
        } else {
            self.inner.enabled.fetch_and(!kind.bit(), Ordering::SeqCst);
        }
    }

    pub fn enabled_types(&self) -> Vec<LogType> {
        LogType::ALL.iter().copied().filter(|t| self.is_enabled(*t)).collect()
    }

    pub fn event(&self, kind: LogType, server: Option<u32>, msg: impl AsRef<str>) {
        if !self.is_enabled(kind) {
            return;
        }
        let line = format_event(kind, server, msg.as_ref());
        if self.inner.echo_stderr {
            eprintln!("{line}");
        }
        if let Some(c) = &self.inner.captured {
            c.lock().unwrap_or_else(|p| p.into_inner()).push(line);
            return;
        }
        if let Some(tx) = self.inner.tx.get() {
            let _ = tx.send(line);
        } else if !self.inner.no_file.load(Ordering::SeqCst) {
            let mut g = self.inner.early.lock().unwrap_or_else(|p| p.into_inner());
            g.push_back(line);
            while g.len() > EARLY_LOG_MAX_LINES {
                g.pop_front();
            }
        }
    }

    /// Lines recorded by a `capturing()` log.
    pub fn captured(&self) -> Vec<String> {
        match &self.inner.captured {
            Some(c) => c.lock().unwrap_or_else(|p| p.into_inner()).clone(),
            None => vec![],
        }
    }

    /// Starts the file consumer. `None` means stderr only; the early buffer is dropped.
    pub fn start_file_sink(&self, path: Option<PathBuf>, max_bytes: u64, backups: usize, tasks: &TaskTracker) {
        let Some(base_path) = path else {
            self.inner.no_file.store(true, Ordering::SeqCst);
            self.inner.early.lock().unwrap_or_else(|p| p.into_inner()).clear();
            return;
        };
        if self.inner.captured.is_some() {
            return;
        }
        let (tx, mut rx) = tokio_mpsc::unbounded_channel::<String>();
        if self.inner.tx.set(tx).is_err() {
            return;
        }
        self.event(
            LogType::Node,
            None,
            format!(
                "log_file path={} rotate=size max_bytes={max_bytes} backups={backups}",
                base_path.display()
            ),
        );

        let inner = Arc::clone(&self.inner);
        tasks.spawn(async move {
            let mut f = match open_append_log_async(&base_path).await {
                Ok(f) => f,
                Err(e) => {
                    eprintln!(
                        "{}",
                        format_event(LogType::Node, None, &format!("failed to open log file err={e:#}"))
                    );
                    return;
                }
            };

            // Do not hold the mutex guard across `.await`.
            let drained: Vec<String> = {
                let mut g = inner.early.lock().unwrap_or_else(|p| p.into_inner());
                g.drain(..).collect()
            };
            for line in drained {
                let _ = f.write_all(format!("{line}\n").as_bytes()).await;
            }
            let _ = f.flush().await;

            let mut bytes_written: u64 = tokio::fs::metadata(&base_path).await.map(|m| m.len()).unwrap_or(0);

            while let Some(line) = rx.recv().await {
                let s = format!("{line}\n");
                if f.write_all(s.as_bytes()).await.is_ok() {
                    bytes_written = bytes_written.saturating_add(s.len() as u64);
                }
                let _ = f.flush().await;
                if max_bytes > 0 && bytes_written >= max_bytes {
                    if let Ok(nf) = rotate_numbered_reopen_async(&base_path, backups).await {
                        f = nf;
                        bytes_written = 0;
                    }
                }
            }
        });
    }
}

async fn open_append_log_async(path: &Path) -> anyhow::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create_dir_all {}", parent.display()))?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("open log {}", path.display()))
}

/// base -> base.1 -> base.2 ... ; the oldest backup falls off the end.
async fn rotate_numbered_reopen_async(base_path: &Path, backups: usize) -> anyhow::Result<tokio::fs::File> {
    let numbered = |i: usize| PathBuf::from(format!("{}.{i}", base_path.display()));
    if backups == 0 {
        let _ = tokio::fs::remove_file(base_path).await;
        return open_append_log_async(base_path).await;
    }
    let _ = tokio::fs::remove_file(numbered(backups)).await;
    for i in (1..backups).rev() {
        let from = numbered(i);
        if tokio::fs::metadata(&from).await.is_ok() {
            let _ = tokio::fs::rename(&from, numbered(i + 1)).await;
        }
    }
    if tokio::fs::metadata(base_path).await.is_ok() {
        let _ = tokio::fs::rename(base_path, numbered(1)).await;
    }
    open_append_log_async(base_path).await
}

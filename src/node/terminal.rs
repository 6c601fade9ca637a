use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use regex::Regex;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc as tokio_mpsc, watch};
use tokio::time::Instant;

use crate::node::asyncutil::{StopSignal, TaskTracker};
use crate::node::error::NodeError;
use crate::node::log::{EventLog, LogType};

/// CSI / OSC / two-byte escapes, then any remaining C0 control except `\t \n \r`.
static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(
        r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[()][0-9A-Za-z]|\x1b[@-Z\\-_]|[\x00-\x08\x0b\x0c\x0e-\x1f\x7f]",
    )
    .expect("valid regex")
});

pub fn strip_ansi(s: &str) -> String {
    ANSI_RE.replace_all(s, "").into_owned()
}

/// Strips control sequences and keeps what a terminal would finally show for a line
/// that was redrawn with `\r` (the last non-empty segment).
pub fn clean_line(raw: &str) -> String {
    let stripped = strip_ansi(raw);
    stripped
        .split('\r')
        .filter(|seg| !seg.trim().is_empty())
        .last()
        .unwrap_or("")
        .trim_end()
        .to_string()
}

/// Hook called for every completed output line.
pub trait OutputParser: Send + 'static {
    fn parse_output(&mut self, line: &str);
}

/// Discards output; used for plain shells.
#[derive(Debug, Default)]
pub struct NoParser;

impl OutputParser for NoParser {
    fn parse_output(&mut self, _line: &str) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyMarker {
    Suffix(String),
    Contains(String),
}

impl ReadyMarker {
    pub fn matches(&self, line: &str) -> bool {
        match self {
            ReadyMarker::Suffix(s) => line.trim_end().ends_with(s.as_str()),
            ReadyMarker::Contains(s) => line.contains(s.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TerminalConfig {
    pub shell: String,
    pub shell_args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub ready_markers: Vec<ReadyMarker>,
    /// After a ready marker, the session is considered hung if no new prompt shows
    /// up within this window.
    pub input_timeout: Duration,
    pub startup_timeout: Duration,
    pub quit_command: String,
}

/// Byte-level line splitter; lines are decoded lossily once complete.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = vec![];
        while let Some(idx) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=idx).collect();
            lines.push(clean_line(&String::from_utf8_lossy(&raw[..idx])));
        }
        lines
    }

    /// The unterminated tail, cleaned.
    pub fn pending(&self) -> String {
        clean_line(&String::from_utf8_lossy(&self.buf))
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

struct Shared<P> {
    name: String,
    server: Option<u32>,
    parser: Mutex<P>,
    markers: Vec<ReadyMarker>,
    ready: watch::Sender<bool>,
    output_seen: watch::Sender<bool>,
    /// While true the input timeout is suspended (someone is waiting on an operator).
    hold: watch::Sender<bool>,
    cancel: StopSignal,
    cancel_reason: Mutex<Option<String>>,
    log: EventLog,
}

impl<P> Shared<P> {
    fn cancel_with(&self, reason: &str) {
        {
            let mut g = self.cancel_reason.lock().unwrap_or_else(|p| p.into_inner());
            if g.is_none() {
                *g = Some(reason.to_string());
            }
        }
        if !self.cancel.is_fired() {
            self.log.event(
                LogType::Terminal,
                self.server,
                format!("session={} cancelled reason={reason:?}", self.name),
            );
        }
        self.cancel.fire();
    }

    fn cancelled_error(&self) -> NodeError {
        let reason = self
            .cancel_reason
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .unwrap_or_else(|| "cancelled".to_string());
        NodeError::TerminalCancelled {
            name: self.name.clone(),
            reason,
        }
    }
}

/// A shell running inside a pseudo-terminal, driven line by line.
///
/// Output is split into lines, stripped of control sequences and fed to `P`. A line
/// matching one of the ready markers signals "ready for input". Dropping the session
/// kills the child and releases the pty.
pub struct TerminalSession<P: OutputParser> {
    shared: Arc<Shared<P>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exit_rx: watch::Receiver<Option<u32>>,
    _master: Mutex<Box<dyn MasterPty + Send>>,
    quit_command: String,
}

impl<P: OutputParser> TerminalSession<P> {
    /// Spawns the shell and returns once it has produced some output.
    pub async fn connect(
        name: &str,
        cfg: TerminalConfig,
        parser: P,
        log: EventLog,
        server: Option<u32>,
        tasks: &TaskTracker,
    ) -> Result<Self, NodeError> {
        let start_err = |reason: String| NodeError::TerminalStart {
            name: name.to_string(),
            reason,
        };
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 40,
                cols: 200,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| start_err(format!("openpty: {e}")))?;

        let mut cmd = CommandBuilder::new(&cfg.shell);
        cmd.args(&cfg.shell_args);
        if let Some(cwd) = &cfg.cwd {
            cmd.cwd(cwd);
        }
        cmd.env("TERM", "dumb");
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| start_err(format!("spawn {}: {e}", cfg.shell)))?;
        // Only the child keeps the slave open, so its exit shows up as EOF on the reader.
        drop(pair.slave);

        let killer = child.clone_killer();
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| start_err(format!("clone reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| start_err(format!("take writer: {e}")))?;

        let (exit_tx, exit_rx) = watch::channel::<Option<u32>>(None);
        tasks.spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code(),
                Err(_) => u32::MAX,
            };
            exit_tx.send_replace(Some(code));
        });

        let (chunk_tx, chunk_rx) = tokio_mpsc::unbounded_channel::<Vec<u8>>();
        tasks.spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if chunk_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        });

        let (ready, _) = watch::channel(false);
        let (output_seen, _) = watch::channel(false);
        let (hold, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            name: name.to_string(),
            server,
            parser: Mutex::new(parser),
            markers: cfg.ready_markers.clone(),
            ready,
            output_seen,
            hold,
            cancel: StopSignal::new(),
            cancel_reason: Mutex::new(None),
            log,
        });
        tasks.spawn(line_loop(
            Arc::clone(&shared),
            chunk_rx,
            exit_rx.clone(),
            cfg.input_timeout,
        ));

        let session = Self {
            shared,
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            exit_rx,
            _master: Mutex::new(pair.master),
            quit_command: cfg.quit_command.clone(),
        };
        session.wait_first_output(cfg.startup_timeout).await?;
        session.shared.log.event(
            LogType::Terminal,
            server,
            format!("session={name} connected shell={}", cfg.shell),
        );
        Ok(session)
    }

    async fn wait_first_output(&self, timeout: Duration) -> Result<(), NodeError> {
        let silent = |cause: &'static str| NodeError::TerminalSilent {
            name: self.shared.name.clone(),
            cause,
        };
        let mut seen = self.shared.output_seen.subscribe();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            if *seen.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                r = seen.changed() => {
                    if r.is_err() {
                        return Err(silent("session ended"));
                    }
                }
                _ = exited(self.exit_rx.clone()) => {
                    // Output written right before exit may still be in flight.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    if *self.shared.output_seen.borrow() {
                        return Ok(());
                    }
                    return Err(silent("process exit"));
                }
                _ = &mut deadline => return Err(silent("startup timeout")),
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_fired()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    pub fn cancel(&self, reason: &str) {
        self.shared.cancel_with(reason);
    }

    /// Suspends the input timeout while `hold` is true. Releasing it restarts the window
    /// from now if a prompt is still waiting.
    pub fn hold_input_timeout(&self, hold: bool) {
        self.shared.hold.send_replace(hold);
    }

    pub fn with_parser<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        let mut g = self.shared.parser.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut g)
    }

    /// Writes `text` followed by `\r`. Ignored once the session is cancelled.
    pub fn send_command(&self, text: &str) -> Result<(), NodeError> {
        if self.is_cancelled() {
            return Ok(());
        }
        self.shared.ready.send_replace(false);
        let mut w = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let res = w
            .write_all(format!("{text}\r").as_bytes())
            .and_then(|_| w.flush());
        if let Err(e) = res {
            self.shared.cancel_with(&format!("write failed: {e}"));
            return Err(self.shared.cancelled_error());
        }
        Ok(())
    }

    /// Resolves on the next ready marker, or fails once the session is cancelled.
    pub async fn wait_ready(&self) -> Result<(), NodeError> {
        let mut rx = self.shared.ready.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            if self.is_cancelled() {
                return Err(self.shared.cancelled_error());
            }
            tokio::select! {
                r = rx.changed() => {
                    if r.is_err() {
                        return Err(self.shared.cancelled_error());
                    }
                }
                _ = self.shared.cancel.wait() => {}
            }
        }
    }

    /// `send_command` followed by `wait_ready`.
    pub async fn command(&self, text: &str) -> Result<(), NodeError> {
        self.send_command(text)?;
        self.wait_ready().await
    }

    /// Asks the program to quit, then force-kills it after `timeout`. Returns the exit
    /// code when the process ended on its own.
    pub async fn shutdown(&self, timeout: Duration) -> Option<u32> {
        if self.is_cancelled() {
            // Nobody is listening to a quit command any more.
            self.kill();
        } else if !self.has_exited() {
            let _ = self.send_command(&self.quit_command);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        let code = match tokio::time::timeout(timeout, exited(self.exit_rx.clone())).await {
            Ok(()) => *self.exit_rx.borrow(),
            Err(_) => {
                self.shared.log.event(
                    LogType::Terminal,
                    self.shared.server,
                    format!("session={} shutdown_timeout action=kill", self.shared.name),
                );
                self.kill();
                None
            }
        };
        self.shared.cancel_with("shutdown");
        code
    }

    fn kill(&self) {
        if self.has_exited() {
            return;
        }
        let mut k = self.killer.lock().unwrap_or_else(|p| p.into_inner());
        let _ = k.kill();
    }
}

impl<P: OutputParser> Drop for TerminalSession<P> {
    fn drop(&mut self) {
        self.kill();
        self.shared.cancel.fire();
    }
}

async fn line_loop<P: OutputParser>(
    shared: Arc<Shared<P>>,
    mut chunks: tokio_mpsc::UnboundedReceiver<Vec<u8>>,
    mut exit: watch::Receiver<Option<u32>>,
    input_timeout: Duration,
) {
    let mut splitter = LineSplitter::default();
    let mut deadline: Option<Instant> = None;
    let mut exit_linger: Option<Instant> = None;
    let mut hold = shared.hold.subscribe();
    loop {
        let holding = *hold.borrow_and_update();
        let timeout = async move {
            match deadline {
                Some(d) if !holding => tokio::time::sleep_until(d).await,
                _ => std::future::pending::<()>().await,
            }
        };
        let linger = async {
            match exit_linger {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = shared.cancel.wait() => break,
            _ = timeout => {
                shared.cancel_with("input timeout");
                break;
            }
            _ = linger => {
                shared.cancel_with("process exited");
                break;
            }
            r = hold.changed() => {
                if r.is_ok() && !*hold.borrow() && deadline.is_some() {
                    deadline = Some(Instant::now() + input_timeout);
                }
            }
            r = exit.changed(), if exit_linger.is_none() => {
                if r.is_err() || exit.borrow().is_some() {
                    // Give the reader a moment to deliver the last output.
                    exit_linger = Some(Instant::now() + Duration::from_millis(250));
                }
            }
            chunk = chunks.recv() => match chunk {
                Some(bytes) => {
                    let lines = splitter.push(&bytes);
                    let tail = splitter.pending();
                    // Bare control bytes do not count as output.
                    if !tail.is_empty() || lines.iter().any(|l| !l.is_empty()) {
                        shared.output_seen.send_replace(true);
                    }
                    for line in lines {
                        handle_line(&shared, &line, &mut deadline, input_timeout);
                    }
                    if !tail.is_empty() && shared.markers.iter().any(|m| m.matches(&tail)) {
                        // Interactive prompts never end with a newline.
                        splitter.clear();
                        handle_line(&shared, &tail, &mut deadline, input_timeout);
                    }
                }
                None => {
                    let tail = splitter.pending();
                    if !tail.is_empty() {
                        shared.output_seen.send_replace(true);
                        handle_line(&shared, &tail, &mut deadline, input_timeout);
                    }
                    shared.cancel_with("process exited");
                    break;
                }
            }
        }
    }
}

async fn exited(mut rx: watch::Receiver<Option<u32>>) {
    loop {
        if rx.borrow_and_update().is_some() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn handle_line<P: OutputParser>(shared: &Shared<P>, line: &str, deadline: &mut Option<Instant>, input_timeout: Duration) {
    if line.is_empty() {
        return;
    }
    shared
        .log
        .event(LogType::Terminal, shared.server, format!("session={} out={line:?}", shared.name));
    {
        let mut p = shared.parser.lock().unwrap_or_else(|p| p.into_inner());
        p.parse_output(line);
    }
    if shared.markers.iter().any(|m| m.matches(line)) {
        *deadline = Some(Instant::now() + input_timeout);
        shared.ready.send_replace(true);
    } else {
        *deadline = None;
    }
}

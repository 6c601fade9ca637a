use regex::Regex;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};

use crate::node::asyncutil::TaskTracker;
use crate::node::config::NodeConfig;
use crate::node::error::NodeError;
use crate::node::log::{EventLog, LogType};
use crate::node::terminal::{OutputParser, ReadyMarker, TerminalConfig, TerminalSession};

#[allow(clippy::expect_used)]
static DECIMAL_PCT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3}\.\d{2})").expect("valid regex"));
#[allow(clippy::expect_used)]
static BRACKET_PCT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\s*(\d{1,3})%\]").expect("valid regex"));
#[allow(clippy::expect_used)]
static BYTES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((\d+)\s*/\s*(\d+)\)").expect("valid regex"));

const STEAM_PROMPT: &str = "Steam>";
const GUARD_PROMPTS: [&str; 2] = ["Steam Guard code:", "Two-factor code:"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstallerState {
    Starting,
    CheckingUpdates,
    DownloadingSelfUpdate,
    Extracting,
    InstallingSelfUpdate,
    Verifying,
    SelfUpdateLoaded,
    LoginFailedBadPassword,
    LoginFailedRateLimit,
    LoginFailedGeneric,
    LoggedIn,
    SteamGuardRequired,
    PostDownloadValidating,
    Validating,
    Preallocating,
    AppDownloading,
    AppVerifying,
    AppInstalled,
    AppInstallError,
}

impl InstallerState {
    /// States whose lines carry a progress figure that should not flicker back to 0.
    fn is_tracked(&self) -> bool {
        matches!(
            self,
            InstallerState::DownloadingSelfUpdate
                | InstallerState::PostDownloadValidating
                | InstallerState::Validating
                | InstallerState::Preallocating
                | InstallerState::AppDownloading
                | InstallerState::AppVerifying
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgressEffect {
    Untouched,
    Reset,
    Tracked,
    Complete,
}

/// What the node reports about an installer run, published through a `watch` channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub state: InstallerState,
    pub progress: f64,
    pub bytes_done: Option<u64>,
    pub bytes_total: Option<u64>,
    pub speed_bytes_per_sec: Option<f64>,
    pub eta_secs: Option<f64>,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            state: InstallerState::Starting,
            progress: 0.0,
            bytes_done: None,
            bytes_total: None,
            speed_bytes_per_sec: None,
            eta_secs: None,
        }
    }
}

/// Classifies installer output lines. Pure; the clock is passed in.
#[derive(Debug, Clone)]
pub struct InstallerTracker {
    pub state: InstallerState,
    pub progress: f64,
    pub logged_in: bool,
    /// `Some(true)` after "fully installed", `Some(false)` after an app error.
    pub success: Option<bool>,
    pub failure_reason: Option<String>,
    download_started: Option<Instant>,
    start_bytes: Option<u64>,
    bytes: Option<(u64, u64)>,
    speed: Option<f64>,
    eta: Option<f64>,
}

impl Default for InstallerTracker {
    fn default() -> Self {
        Self {
            state: InstallerState::Starting,
            progress: 0.0,
            logged_in: false,
            success: None,
            failure_reason: None,
            download_started: None,
            start_bytes: None,
            bytes: None,
            speed: None,
            eta: None,
        }
    }
}

impl InstallerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed_line(&mut self, line: &str) -> Option<InstallerState> {
        self.feed_line_at(line, Instant::now())
    }

    /// Applies one line. Returns the new state when the line caused a transition.
    pub fn feed_line_at(&mut self, line: &str, now: Instant) -> Option<InstallerState> {
        let (next, effect) = self.classify(line)?;
        let prev = self.state;
        self.state = next;

        match next {
            InstallerState::LoggedIn => self.logged_in = true,
            InstallerState::AppDownloading if self.download_started.is_none() => {
                self.download_started = Some(now);
            }
            InstallerState::AppInstalled => {
                self.success = Some(true);
                self.failure_reason = None;
            }
            InstallerState::AppInstallError => {
                self.success = Some(false);
                self.failure_reason = Some(error_reason(line));
            }
            _ => {}
        }

        match effect {
            ProgressEffect::Untouched => {}
            ProgressEffect::Reset => self.progress = 0.0,
            ProgressEffect::Complete => self.progress = 100.0,
            ProgressEffect::Tracked => {
                match extract_percent(line) {
                    Some(p) => self.progress = p,
                    None if !next.is_tracked() => self.progress = 0.0,
                    None => {}
                }
                if next == InstallerState::AppDownloading {
                    self.sample_bytes(line, now);
                }
            }
        }

        (prev != next).then_some(next)
    }

    fn classify(&self, line: &str) -> Option<(InstallerState, ProgressEffect)> {
        use InstallerState::*;
        use ProgressEffect::*;
        let has = |s: &str| line.contains(s);
        let hit = if has("Checking for available update") {
            (CheckingUpdates, Reset)
        } else if has("Downloading update") {
            (DownloadingSelfUpdate, Tracked)
        } else if has("Extracting package") {
            (Extracting, Reset)
        } else if has("Installing update") {
            (InstallingSelfUpdate, Reset)
        } else if has("Verifying installation") {
            (Verifying, Reset)
        } else if has("Loading Steam API...") {
            (SelfUpdateLoaded, Reset)
        } else if has("FAILED login") && has("Invalid Password") {
            (LoginFailedBadPassword, Untouched)
        } else if has("FAILED login") && has("Rate Limit") {
            (LoginFailedRateLimit, Untouched)
        } else if has("FAILED login") {
            (LoginFailedGeneric, Untouched)
        } else if has("Logged in OK") || has("Waiting for user info...OK") {
            (LoggedIn, Reset)
        } else if GUARD_PROMPTS.iter().any(|p| has(p)) {
            (SteamGuardRequired, Untouched)
        } else if has("validating") && self.state == AppDownloading {
            (PostDownloadValidating, Tracked)
        } else if has("(0x5) validating") {
            (Validating, Tracked)
        } else if has("(0x11) preallocating") {
            (Preallocating, Tracked)
        } else if has("(0x61) downloading") {
            (AppDownloading, Tracked)
        } else if has("verifying") {
            (AppVerifying, Tracked)
        } else if has("Success! App") && has("fully installed") {
            (AppInstalled, Complete)
        } else if has("Error! App") {
            (AppInstallError, Reset)
        } else {
            return None;
        };
        Some(hit)
    }

    fn sample_bytes(&mut self, line: &str, now: Instant) {
        let Some(caps) = BYTES_RE.captures(line) else {
            return;
        };
        let (Ok(done), Ok(total)) = (caps[1].parse::<u64>(), caps[2].parse::<u64>()) else {
            return;
        };
        self.bytes = Some((done, total));
        let start = *self.start_bytes.get_or_insert(done);
        let Some(started) = self.download_started else {
            return;
        };
        let elapsed = now.saturating_duration_since(started).as_secs_f64();
        if elapsed <= 0.0 || done <= start {
            return;
        }
        let speed = (done - start) as f64 / elapsed;
        self.speed = Some(speed);
        self.eta = Some(total.saturating_sub(done) as f64 / speed);
    }

    /// Average download rate since the download state began, bytes per second.
    pub fn speed(&self) -> Option<f64> {
        self.speed
    }

    /// Estimated seconds left for the current download.
    pub fn eta_secs(&self) -> Option<f64> {
        self.eta
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            state: self.state,
            progress: self.progress,
            bytes_done: self.bytes.map(|b| b.0),
            bytes_total: self.bytes.map(|b| b.1),
            speed_bytes_per_sec: self.speed,
            eta_secs: self.eta,
        }
    }
}

fn extract_percent(line: &str) -> Option<f64> {
    if let Some(c) = DECIMAL_PCT_RE.captures(line) {
        if let Ok(v) = c[1].parse::<f64>() {
            return Some(v);
        }
    }
    BRACKET_PCT_RE
        .captures(line)
        .and_then(|c| c[1].parse::<f64>().ok())
}

fn error_reason(line: &str) -> String {
    if line.contains("state is 0x202") {
        return "insufficient disk space".to_string();
    }
    let rest = line
        .split_once("Error! App")
        .map(|(_, r)| r.trim())
        .unwrap_or(line.trim());
    // Drop the quoted app id.
    let rest = match rest.strip_prefix('\'').and_then(|r| r.split_once('\'')) {
        Some((_, after)) => after.trim(),
        None => rest,
    };
    rest.trim_end_matches('.').to_string()
}

/// Steam Guard codes handed in by the operator with `guard <code>`.
#[derive(Debug, Clone, Default)]
pub struct GuardInbox {
    inner: Arc<GuardInner>,
}

#[derive(Debug, Default)]
struct GuardInner {
    code: Mutex<Option<String>>,
    notify: Notify,
}

impl GuardInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self, code: &str) {
        *self.inner.code.lock().unwrap_or_else(|p| p.into_inner()) = Some(code.trim().to_string());
        self.inner.notify.notify_waiters();
    }

    fn take(&self) -> Option<String> {
        self.inner.code.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    /// Takes a code that is already waiting, or the next one submitted within `timeout`.
    pub async fn wait(&self, timeout: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(c) = self.take() {
                return Some(c);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.take();
            }
        }
    }
}

/// Bridges terminal lines into the tracker, the event log and the progress channel.
pub struct InstallerParser {
    tracker: InstallerTracker,
    log: EventLog,
    server: Option<u32>,
    progress: Option<watch::Sender<ProgressSnapshot>>,
}

impl OutputParser for InstallerParser {
    fn parse_output(&mut self, line: &str) {
        let before = self.tracker.progress;
        if let Some(state) = self.tracker.feed_line(line) {
            self.log
                .event(LogType::Installer, self.server, format!("state={state:?} line={line:?}"));
        }
        if (self.tracker.progress - before).abs() > f64::EPSILON {
            let snap = self.tracker.snapshot();
            self.log.event(
                LogType::Progress,
                self.server,
                format!(
                    "state={:?} progress={:.2} speed_bps={} eta_s={}",
                    snap.state,
                    snap.progress,
                    snap.speed_bytes_per_sec.map(|s| format!("{s:.0}")).unwrap_or_else(|| "-".into()),
                    snap.eta_secs.map(|s| format!("{s:.0}")).unwrap_or_else(|| "-".into()),
                ),
            );
        }
        if let Some(tx) = &self.progress {
            tx.send_replace(self.tracker.snapshot());
        }
    }
}

/// One run of the installer tool inside a pty. Torn down when dropped.
pub struct InstallerSession {
    term: TerminalSession<InstallerParser>,
    guard: GuardInbox,
    guard_timeout: Duration,
    shutdown_timeout: Duration,
}

impl InstallerSession {
    /// Starts a shell in the installer directory, execs the installer and waits for its
    /// first prompt.
    pub async fn open(
        cfg: &NodeConfig,
        log: EventLog,
        server: Option<u32>,
        progress: Option<watch::Sender<ProgressSnapshot>>,
        guard: GuardInbox,
        tasks: &TaskTracker,
    ) -> anyhow::Result<Self> {
        let exe = cfg.installer_path();
        anyhow::ensure!(exe.is_file(), "installer not found at {}", exe.display());

        let mut markers = vec![ReadyMarker::Suffix(STEAM_PROMPT.to_string())];
        markers.extend(GUARD_PROMPTS.iter().map(|p| ReadyMarker::Contains(p.to_string())));
        let tcfg = TerminalConfig {
            shell: cfg.terminal.shell.clone(),
            shell_args: cfg.terminal.shell_args.clone(),
            cwd: Some(cfg.installer_directory.clone()),
            ready_markers: markers,
            input_timeout: cfg.input_timeout(),
            startup_timeout: Duration::from_millis(cfg.terminal.startup_timeout_ms),
            quit_command: "quit".to_string(),
        };
        let parser = InstallerParser {
            tracker: InstallerTracker::new(),
            log: log.clone(),
            server,
            progress,
        };
        let name = match server {
            Some(id) => format!("installer-{id}"),
            None => "installer".to_string(),
        };
        let term = TerminalSession::connect(&name, tcfg, parser, log, server, tasks).await?;
        // No echo, so typed credentials never come back as output.
        term.command(&format!("stty -echo 2>/dev/null; exec {}", shell_quote(&exe)))
            .await?;
        Ok(Self {
            term,
            guard,
            guard_timeout: Duration::from_millis(cfg.terminal.guard_timeout_ms),
            shutdown_timeout: Duration::from_millis(cfg.terminal.shutdown_timeout_ms),
        })
    }

    pub fn tracker(&self) -> InstallerTracker {
        self.term.with_parser(|p| p.tracker.clone())
    }

    fn state(&self) -> InstallerState {
        self.term.with_parser(|p| p.tracker.state)
    }

    pub async fn login_anonymous(&self) -> Result<bool, NodeError> {
        self.term.command("login anonymous").await?;
        Ok(self.term.with_parser(|p| p.tracker.logged_in))
    }

    /// With no `guard_code`, a Steam Guard prompt is answered with the next code sent
    /// through `guard <code>`.
    pub async fn login_with_credentials(
        &self,
        user: &str,
        pass: &str,
        guard_code: Option<String>,
    ) -> Result<bool, NodeError> {
        self.term.command(&format!("login {user} {pass}")).await?;
        let mut supplied = guard_code;
        for _ in 0..3 {
            if self.state() != InstallerState::SteamGuardRequired {
                break;
            }
            let code = match supplied.take() {
                Some(c) => Some(c),
                None => {
                    // The operator may take longer than the hung-prompt window.
                    self.term.hold_input_timeout(true);
                    let code = self.guard.wait(self.guard_timeout).await;
                    self.term.hold_input_timeout(false);
                    code
                }
            };
            let Some(code) = code else {
                break;
            };
            self.term.command(&code).await?;
        }
        Ok(self.term.with_parser(|p| p.tracker.logged_in))
    }

    pub async fn force_install_dir(&self, dir: &Path) -> Result<(), NodeError> {
        self.term
            .command(&format!("force_install_dir \"{}\"", dir.display()))
            .await
    }

    /// Returns the installer's success flag for this update.
    pub async fn app_update(&self, catalog_id: u32, validate: bool) -> Result<bool, NodeError> {
        self.term.with_parser(|p| {
            p.tracker.success = None;
            p.tracker.failure_reason = None;
        });
        let cmd = if validate {
            format!("app_update {catalog_id} validate")
        } else {
            format!("app_update {catalog_id}")
        };
        self.term.command(&cmd).await?;
        Ok(self.term.with_parser(|p| p.tracker.success == Some(true)))
    }

    pub async fn app_uninstall(&self, catalog_id: u32, validate: bool) -> Result<(), NodeError> {
        let cmd = if validate {
            format!("app_uninstall {catalog_id} -complete")
        } else {
            format!("app_uninstall {catalog_id}")
        };
        self.term.command(&cmd).await
    }

    /// Aborts whatever the session is waiting on.
    pub fn cancel(&self, reason: &str) {
        self.term.cancel(reason);
    }

    pub async fn shutdown(&self) -> Option<u32> {
        self.term.shutdown(self.shutdown_timeout).await
    }
}

fn shell_quote(p: &Path) -> String {
    format!("'{}'", p.display().to_string().replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn success_line_completes_install() {
        let mut t = InstallerTracker::new();
        t.feed_line("Success! App '258550' fully installed.");
        assert_eq!(t.state, InstallerState::AppInstalled);
        assert_approx_eq!(t.progress, 100.0);
        assert_eq!(t.success, Some(true));
    }

    #[test]
    fn disk_full_line_sets_reason() {
        let mut t = InstallerTracker::new();
        t.feed_line("Error! App '232330' state is 0x202 after update job.");
        assert_eq!(t.state, InstallerState::AppInstallError);
        assert_eq!(t.success, Some(false));
        assert_eq!(t.failure_reason.as_deref(), Some("insufficient disk space"));
    }

    #[test]
    fn other_app_errors_keep_their_text() {
        let mut t = InstallerTracker::new();
        t.feed_line("Error! App '740' state is 0x602 after update job.");
        assert_eq!(t.failure_reason.as_deref(), Some("state is 0x602 after update job"));
    }

    #[test]
    fn download_progress_yields_eta() {
        let mut t = InstallerTracker::new();
        let t0 = Instant::now();
        t.feed_line_at(" Update state (0x61) downloading, progress: 12.34 (100 / 1000)", t0);
        assert_eq!(t.state, InstallerState::AppDownloading);
        assert_approx_eq!(t.progress, 12.34);
        assert!(t.eta_secs().is_none());

        t.feed_line_at(
            " Update state (0x61) downloading, progress: 50.00 (500 / 1000)",
            t0 + Duration::from_secs(2),
        );
        assert_approx_eq!(t.progress, 50.0);
        assert_approx_eq!(t.speed().unwrap(), 200.0);
        let eta = t.eta_secs().unwrap();
        assert!(eta > 0.0);
        assert_approx_eq!(eta, 2.5);
    }

    #[test]
    fn validating_after_download_is_post_download() {
        let mut t = InstallerTracker::new();
        t.feed_line(" Update state (0x61) downloading, progress: 99.00 (990 / 1000)");
        t.feed_line(" Update state (0x5) validating, progress: 3.00 (30 / 1000)");
        assert_eq!(t.state, InstallerState::PostDownloadValidating);
        t.feed_line(" Update state (0x5) validating, progress: 4.00 (40 / 1000)");
        assert_eq!(t.state, InstallerState::Validating);
    }

    #[test]
    fn bracket_percent_and_reset_rules() {
        let mut t = InstallerTracker::new();
        t.feed_line("[  42%] Downloading update (1,024 of 40,000 KB)...");
        assert_eq!(t.state, InstallerState::DownloadingSelfUpdate);
        assert_approx_eq!(t.progress, 42.0);
        // tracked state with no figure keeps the last value
        t.feed_line("Downloading update...");
        assert_approx_eq!(t.progress, 42.0);
        t.feed_line("Extracting package...");
        assert_approx_eq!(t.progress, 0.0);
    }

    #[test]
    fn login_lines_classify_in_order() {
        let mut t = InstallerTracker::new();
        t.feed_line("FAILED login with result code Invalid Password");
        assert_eq!(t.state, InstallerState::LoginFailedBadPassword);
        t.feed_line("FAILED login with result code Rate Limit Exceeded");
        assert_eq!(t.state, InstallerState::LoginFailedRateLimit);
        t.feed_line("FAILED login with result code No Connection");
        assert_eq!(t.state, InstallerState::LoginFailedGeneric);
        assert!(!t.logged_in);
        t.feed_line("Steam Guard code:");
        assert_eq!(t.state, InstallerState::SteamGuardRequired);
        t.feed_line("Waiting for user info...OK");
        assert!(t.logged_in);
    }

    #[test]
    fn unrelated_lines_change_nothing() {
        let mut t = InstallerTracker::new();
        assert_eq!(t.feed_line("Redirecting stderr to '/tmp/stderr.txt'"), None);
        assert_eq!(t.state, InstallerState::Starting);
    }

    #[tokio::test]
    async fn guard_inbox_hands_over_a_code() {
        let inbox = GuardInbox::new();
        let waiter = {
            let inbox = inbox.clone();
            tokio::spawn(async move { inbox.wait(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        inbox.submit(" ABC12 ");
        assert_eq!(waiter.await.unwrap().as_deref(), Some("ABC12"));
        assert_eq!(inbox.wait(Duration::from_millis(10)).await, None);
    }
}

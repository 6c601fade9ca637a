use crate::node::catalog::AppDefinition;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resolved node configuration. All paths are absolute or relative to the process cwd
/// once `load_node_config` returns.
#[derive(Debug, Clone, Serialize)]
pub struct NodeConfig {
    /// Holds `gameservers/<id>/` and the installer tool directory.
    pub root_directory: PathBuf,
    pub installer_directory: PathBuf,
    /// File name of the installer entry point inside `installer_directory`.
    pub installer_executable: String,
    pub installer_username: Option<String>,
    #[serde(skip_serializing)]
    pub installer_password: Option<String>,
    pub socket: SocketConfig,
    pub terminal: TerminalSettings,
    pub watchdog: WatchdogConfig,
    pub launch: LaunchConfig,
    pub log: LogConfig,
    /// Extra catalog entries on top of the built-in catalog.
    pub apps: Vec<AppDefinition>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SocketConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    /// When set, only this peer address may connect.
    pub allow_ip: Option<IpAddr>,
    pub max_packet_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TerminalSettings {
    pub shell: String,
    pub shell_args: Vec<String>,
    pub input_timeout_ms: u64,
    pub startup_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// How long a Steam Guard prompt waits for `guard <code>`.
    pub guard_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchdogConfig {
    /// First-chance window after a launch before the process is re-checked.
    pub grace_period_ms: u64,
    pub poll_interval_ms: u64,
    /// How long `stop` waits after SIGTERM before escalating to SIGKILL.
    pub stop_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchStrategy {
    /// `sh -c '... & echo $!'`
    Detached,
    /// A tmux session named `servernode-<id>`.
    Tmux,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchConfig {
    pub strategy: LaunchStrategy,
    pub capture_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogConfig {
    pub file: Option<PathBuf>,
    pub max_bytes: u64,
    pub backups: usize,
    /// Log types that start disabled.
    pub disabled: Vec<String>,
}

impl NodeConfig {
    pub fn servers_directory(&self) -> PathBuf {
        self.root_directory.join("gameservers")
    }

    pub fn server_directory(&self, id: u32) -> PathBuf {
        self.servers_directory().join(id.to_string())
    }

    pub fn installer_path(&self) -> PathBuf {
        self.installer_directory.join(&self.installer_executable)
    }

    pub fn input_timeout(&self) -> Duration {
        Duration::from_millis(self.terminal.input_timeout_ms)
    }

    /// Defaults rooted at `root`, as if loaded from an empty config file there.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            installer_directory: root.join(default_installer_directory()),
            root_directory: root,
            installer_executable: default_installer_executable(),
            installer_username: None,
            installer_password: None,
            socket: SocketConfig {
                enabled: true,
                bind: default_bind(),
                port: default_port(),
                allow_ip: None,
                max_packet_bytes: default_max_packet_bytes(),
            },
            terminal: TerminalSettings {
                shell: default_shell(),
                shell_args: vec![],
                input_timeout_ms: default_input_timeout_ms(),
                startup_timeout_ms: default_startup_timeout_ms(),
                shutdown_timeout_ms: default_shutdown_timeout_ms(),
                guard_timeout_ms: default_guard_timeout_ms(),
            },
            watchdog: WatchdogConfig {
                grace_period_ms: default_grace_period_ms(),
                poll_interval_ms: default_poll_interval_ms(),
                stop_timeout_ms: default_stop_timeout_ms(),
            },
            launch: LaunchConfig {
                strategy: LaunchStrategy::Detached,
                capture_timeout_ms: default_capture_timeout_ms(),
            },
            log: LogConfig {
                file: Some(PathBuf::from("logs").join("servernode.log")),
                max_bytes: default_log_max_bytes(),
                backups: default_log_backups(),
                disabled: vec!["terminal".to_string()],
            },
            apps: vec![],
        }
    }
}

// -------- YAML file schema (grouped; strict) --------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeConfigFile {
    #[serde(default)]
    global: Option<GlobalConfigFile>,
    #[serde(default)]
    socket: Option<SocketConfigFile>,
    #[serde(default)]
    terminal: Option<TerminalConfigFile>,
    #[serde(default)]
    watchdog: Option<WatchdogConfigFile>,
    #[serde(default)]
    launch: Option<LaunchConfigFile>,
    #[serde(default)]
    log: Option<LogConfigFile>,
    #[serde(default)]
    apps: Vec<AppDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct GlobalConfigFile {
    #[serde(default)]
    root_directory: Option<PathBuf>,
    #[serde(default)]
    installer_directory: Option<PathBuf>,
    #[serde(default)]
    installer_executable: Option<String>,
    #[serde(default)]
    installer_username: Option<String>,
    #[serde(default)]
    installer_password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SocketConfigFile {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_bind")]
    bind: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    allow_ip: Option<String>,
    #[serde(default = "default_max_packet_bytes")]
    max_packet_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TerminalConfigFile {
    #[serde(default = "default_shell")]
    shell: String,
    #[serde(default)]
    shell_args: Vec<String>,
    #[serde(default = "default_input_timeout_ms", deserialize_with = "deserialize_duration_ms")]
    input_timeout: u64,
    #[serde(default = "default_startup_timeout_ms", deserialize_with = "deserialize_duration_ms")]
    startup_timeout: u64,
    #[serde(default = "default_shutdown_timeout_ms", deserialize_with = "deserialize_duration_ms")]
    shutdown_timeout: u64,
    #[serde(default = "default_guard_timeout_ms", deserialize_with = "deserialize_duration_ms")]
    guard_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct WatchdogConfigFile {
    #[serde(default = "default_grace_period_ms", deserialize_with = "deserialize_duration_ms")]
    grace_period: u64,
    #[serde(default = "default_poll_interval_ms", deserialize_with = "deserialize_duration_ms")]
    poll_interval: u64,
    #[serde(default = "default_stop_timeout_ms", deserialize_with = "deserialize_duration_ms")]
    stop_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LaunchConfigFile {
    #[serde(default = "default_strategy")]
    strategy: LaunchStrategy,
    #[serde(default = "default_capture_timeout_ms", deserialize_with = "deserialize_duration_ms")]
    capture_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LogConfigFile {
    /// `null` disables the log file (stderr only).
    #[serde(default = "default_log_file")]
    file: Option<PathBuf>,
    #[serde(default = "default_log_max_bytes")]
    max_bytes: u64,
    #[serde(default = "default_log_backups")]
    backups: usize,
    #[serde(default)]
    disabled: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}
fn default_installer_directory() -> PathBuf {
    "steamcmd".into()
}
fn default_installer_executable() -> String {
    "steamcmd.sh".to_string()
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    11000
}
fn default_max_packet_bytes() -> usize {
    64 * 1024
}
fn default_shell() -> String {
    "/bin/sh".to_string()
}
fn default_input_timeout_ms() -> u64 {
    120_000
}
fn default_startup_timeout_ms() -> u64 {
    15_000
}
fn default_shutdown_timeout_ms() -> u64 {
    10_000
}
fn default_guard_timeout_ms() -> u64 {
    300_000
}
fn default_grace_period_ms() -> u64 {
    10_000
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_stop_timeout_ms() -> u64 {
    10_000
}
fn default_strategy() -> LaunchStrategy {
    LaunchStrategy::Detached
}
fn default_capture_timeout_ms() -> u64 {
    10_000
}
fn default_log_file() -> Option<PathBuf> {
    Some(PathBuf::from("logs").join("servernode.log"))
}
fn default_log_max_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_log_backups() -> usize {
    5
}

fn deserialize_duration_ms<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    match v {
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| D::Error::custom("duration must be a positive integer (ms)")),
        serde_yaml::Value::String(s) => parse_duration_str(&s).map_err(D::Error::custom),
        _ => Err(D::Error::custom(
            "duration must be integer milliseconds or a string like \"10s\"",
        )),
    }
}

/// `1500ms`, `10s`, `2m`, `1h`, or a bare millisecond count.
pub fn parse_duration_str(s: &str) -> Result<u64, String> {
    let t = s.trim();
    if t.is_empty() {
        return Err("empty duration".to_string());
    }
    let idx = t
        .char_indices()
        .find(|(_, ch)| !(ch.is_ascii_digit() || *ch == '.'))
        .map(|(i, _)| i)
        .unwrap_or(t.len());
    if idx == 0 {
        return Err(format!("invalid duration: {s}"));
    }
    let (num_s, unit_s) = t.split_at(idx);
    let num: f64 = num_s
        .parse()
        .map_err(|e| format!("invalid duration number {num_s:?}: {e}"))?;
    let mult: f64 = match unit_s.trim().to_ascii_lowercase().as_str() {
        "" | "ms" => 1.0,
        "s" => 1000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        other => return Err(format!("unknown duration unit {other:?} (use ms/s/m/h)")),
    };
    Ok((num * mult).round() as u64)
}

/// Loads the YAML config. A missing file at the default location yields defaults rooted
/// at the current directory; an explicitly named file must exist.
pub fn load_node_config(config_path: &Path, must_exist: bool) -> anyhow::Result<NodeConfig> {
    let file_cfg: NodeConfigFile = match std::fs::read_to_string(config_path) {
        Ok(raw) => serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", config_path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !must_exist => NodeConfigFile::default(),
        Err(e) => anyhow::bail!("failed to read config {}: {e}", config_path.display()),
    };
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    resolve_config(file_cfg, base)
}

/// Parses YAML text as if it were a config file located in `base`.
pub fn parse_node_config(raw: &str, base: &Path) -> anyhow::Result<NodeConfig> {
    let file_cfg: NodeConfigFile =
        serde_yaml::from_str(raw).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;
    resolve_config(file_cfg, base)
}

fn resolve_config(file_cfg: NodeConfigFile, base: &Path) -> anyhow::Result<NodeConfig> {
    let base = if base.as_os_str().is_empty() { Path::new(".") } else { base };
    let mut cfg = NodeConfig::with_root(base.join("data"));
    let mut installer_dir = default_installer_directory();

    if let Some(gl) = file_cfg.global {
        if let Some(root) = gl.root_directory {
            cfg.root_directory = if root.is_relative() { base.join(root) } else { root };
        }
        if let Some(dir) = gl.installer_directory {
            installer_dir = dir;
        }
        if let Some(exe) = gl.installer_executable {
            anyhow::ensure!(!exe.trim().is_empty(), "global.installer_executable must not be empty");
            cfg.installer_executable = exe.trim().to_string();
        }
        cfg.installer_username = gl.installer_username.filter(|s| !s.trim().is_empty());
        cfg.installer_password = gl.installer_password;
        anyhow::ensure!(
            cfg.installer_username.is_none() || cfg.installer_password.is_some(),
            "global.installer_username is set but global.installer_password is missing"
        );
    }
    // The installer directory lives under the root unless given absolutely.
    cfg.installer_directory = if installer_dir.is_relative() {
        cfg.root_directory.join(installer_dir)
    } else {
        installer_dir
    };

    if let Some(s) = file_cfg.socket {
        cfg.socket.enabled = s.enabled;
        cfg.socket.bind = s.bind;
        cfg.socket.port = s.port;
        cfg.socket.max_packet_bytes = s.max_packet_bytes;
        cfg.socket.allow_ip = match s.allow_ip.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(ip) => Some(
                ip.parse()
                    .map_err(|e| anyhow::anyhow!("socket.allow_ip {ip:?} is not an ip address: {e}"))?,
            ),
        };
        anyhow::ensure!(cfg.socket.max_packet_bytes >= 64, "socket.max_packet_bytes must be >= 64");
    }
    let _addr: std::net::SocketAddr = format!("{}:{}", cfg.socket.bind, cfg.socket.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("socket bind/port invalid: {e}"))?;

    if let Some(t) = file_cfg.terminal {
        anyhow::ensure!(!t.shell.trim().is_empty(), "terminal.shell must not be empty");
        cfg.terminal = TerminalSettings {
            shell: t.shell,
            shell_args: t.shell_args,
            input_timeout_ms: t.input_timeout,
            startup_timeout_ms: t.startup_timeout,
            shutdown_timeout_ms: t.shutdown_timeout,
            guard_timeout_ms: t.guard_timeout,
        };
    }
    if let Some(w) = file_cfg.watchdog {
        anyhow::ensure!(w.poll_interval > 0, "watchdog.poll_interval must be > 0");
        cfg.watchdog = WatchdogConfig {
            grace_period_ms: w.grace_period,
            poll_interval_ms: w.poll_interval,
            stop_timeout_ms: w.stop_timeout,
        };
    }
    if let Some(l) = file_cfg.launch {
        cfg.launch = LaunchConfig {
            strategy: l.strategy,
            capture_timeout_ms: l.capture_timeout,
        };
    }
    if let Some(l) = file_cfg.log {
        cfg.log.file = l.file;
        cfg.log.max_bytes = l.max_bytes;
        cfg.log.backups = l.backups;
        if let Some(disabled) = l.disabled {
            cfg.log.disabled = disabled;
        }
    }
    if let Some(p) = cfg.log.file.clone() {
        if p.is_relative() {
            cfg.log.file = Some(base.join(p));
        }
    }

    // Shortnames are the catalog key; reject duplicates in a canonical form.
    let mut seen = HashSet::new();
    for app in &file_cfg.apps {
        app.validate()?;
        let canon = app.short_name.trim().to_ascii_lowercase();
        anyhow::ensure!(seen.insert(canon.clone()), "duplicate app short_name {canon:?} in config");
    }
    cfg.apps = file_cfg.apps;

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_accept_units() {
        assert_eq!(parse_duration_str("1500").unwrap(), 1500);
        assert_eq!(parse_duration_str("250ms").unwrap(), 250);
        assert_eq!(parse_duration_str("10s").unwrap(), 10_000);
        assert_eq!(parse_duration_str("2m").unwrap(), 120_000);
        assert_eq!(parse_duration_str("0.5s").unwrap(), 500);
        assert!(parse_duration_str("5 fortnights").is_err());
        assert!(parse_duration_str("s").is_err());
    }

    #[test]
    fn empty_config_yields_defaults_under_base() {
        let cfg = parse_node_config("{}", Path::new("/srv/node")).unwrap();
        assert_eq!(cfg.root_directory, PathBuf::from("/srv/node/data"));
        assert_eq!(cfg.installer_path(), PathBuf::from("/srv/node/data/steamcmd/steamcmd.sh"));
        assert_eq!(cfg.server_directory(3), PathBuf::from("/srv/node/data/gameservers/3"));
        assert_eq!(cfg.socket.port, 11000);
        assert_eq!(cfg.watchdog.grace_period_ms, 10_000);
        assert_eq!(cfg.terminal.guard_timeout_ms, 300_000);
        assert_eq!(cfg.log.disabled, vec!["terminal".to_string()]);
    }

    #[test]
    fn grouped_sections_override_defaults() {
        let raw = r#"
global:
  root_directory: /games
  installer_directory: /opt/steamcmd
socket:
  port: 12000
  allow_ip: 10.0.0.5
terminal:
  guard_timeout: 2m
watchdog:
  grace_period: 2s
  poll_interval: 250ms
launch:
  strategy: tmux
log:
  file: null
  disabled: []
"#;
        let cfg = parse_node_config(raw, Path::new("/etc/servernode")).unwrap();
        assert_eq!(cfg.root_directory, PathBuf::from("/games"));
        assert_eq!(cfg.installer_directory, PathBuf::from("/opt/steamcmd"));
        assert_eq!(cfg.socket.port, 12000);
        assert_eq!(cfg.socket.allow_ip, Some("10.0.0.5".parse().unwrap()));
        assert_eq!(cfg.terminal.guard_timeout_ms, 120_000);
        assert_eq!(cfg.terminal.input_timeout_ms, default_input_timeout_ms());
        assert_eq!(cfg.watchdog.grace_period_ms, 2000);
        assert_eq!(cfg.watchdog.poll_interval_ms, 250);
        assert_eq!(cfg.launch.strategy, LaunchStrategy::Tmux);
        assert!(cfg.log.file.is_none());
        assert!(cfg.log.disabled.is_empty());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(parse_node_config("socket:\n  prot: 1\n", Path::new(".")).is_err());
    }

    #[test]
    fn bad_allow_ip_is_rejected() {
        assert!(parse_node_config("socket:\n  allow_ip: not-an-ip\n", Path::new(".")).is_err());
    }

    #[test]
    fn username_without_password_is_rejected() {
        let raw = "global:\n  installer_username: bob\n";
        assert!(parse_node_config(raw, Path::new(".")).is_err());
    }
}

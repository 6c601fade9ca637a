/// Failures the node distinguishes by kind. Everything else travels as `anyhow::Error`.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The pseudo-terminal or its shell could not be created.
    #[error("terminal {name}: failed to start: {reason}")]
    TerminalStart { name: String, reason: String },

    /// The shell started but never produced any output.
    #[error("terminal {name}: no output before {cause}")]
    TerminalSilent { name: String, cause: &'static str },

    /// The session was cancelled (input timeout, process exit or shutdown) while a caller
    /// was waiting on it.
    #[error("terminal {name}: cancelled ({reason})")]
    TerminalCancelled { name: String, reason: String },

    /// The launch script did not report a usable PID.
    #[error("server {id}: could not capture launched pid: {reason}")]
    LaunchCapture { id: u32, reason: String },

    #[error("server {0} is already running")]
    AlreadyRunning(u32),

    #[error("server {0} is not installed")]
    NotInstalled(u32),

    #[error("unknown server id: {0}")]
    UnknownServer(String),

    #[error("unknown app: {0}")]
    UnknownApp(String),
}

impl NodeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, NodeError::TerminalCancelled { .. })
    }
}

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as TokioBufReader};
use tokio::signal::unix::{SignalKind, signal as unix_signal};

use crate::node::asyncutil::TaskTracker;
use crate::node::build_info;
use crate::node::config::NodeConfig;
use crate::node::dispatch::dispatch;
use crate::node::listener;
use crate::node::log::{EventLog, LogType};
use crate::node::registry::NodeContext;

#[derive(Debug, Clone, Copy, Default)]
pub struct DaemonOptions {
    pub console: bool,
}

/// Boots the node and blocks until `quit`/`exit`, SIGINT or SIGTERM.
pub async fn run_daemon_async(cfg: NodeConfig, opts: DaemonOptions) -> anyhow::Result<()> {
    let tasks = TaskTracker::new();
    let (log, unknown) = EventLog::new(&cfg.log.disabled);
    log.start_file_sink(cfg.log.file.clone(), cfg.log.max_bytes, cfg.log.backups, &tasks);
    if !unknown.is_empty() {
        log.event(
            LogType::Node,
            None,
            format!("config_warning log.disabled has unknown types: {}", unknown.join(",")),
        );
    }
    log.event(
        LogType::Node,
        None,
        format!(
            "boot {} root={} installer={}",
            build_info::banner(),
            cfg.root_directory.display(),
            cfg.installer_path().display()
        ),
    );

    let servers = cfg.servers_directory();
    tokio::fs::create_dir_all(&servers)
        .await
        .map_err(|e| anyhow::anyhow!("failed to create {}: {e}", servers.display()))?;
    if !cfg.installer_path().exists() {
        log.event(
            LogType::Node,
            None,
            format!("config_warning installer not found path={}", cfg.installer_path().display()),
        );
    }

    let socket_cfg = cfg.socket.clone();
    let ctx = NodeContext::new(cfg, log.clone(), tasks.clone());

    if socket_cfg.enabled {
        let l = listener::bind(&socket_cfg).await?;
        tasks.spawn(listener::run_listener(Arc::clone(&ctx), l));
    } else {
        log.event(LogType::Socket, None, "disabled");
    }
    if opts.console {
        tasks.spawn(console_loop(Arc::clone(&ctx)));
    }
    start_signal_listener_async(&ctx)?;

    ctx.shutdown.wait().await;
    log.event(LogType::Node, None, "shutdown begin");
    let cancelled = ctx.scheduler.cancel_all();
    if cancelled > 0 {
        log.event(LogType::Schedule, None, format!("cancelled={cancelled} reason=shutting_down"));
    }
    let stop_budget = Duration::from_millis(
        ctx.cfg.watchdog.stop_timeout_ms + ctx.cfg.terminal.shutdown_timeout_ms + 2_000,
    );
    let stuck = ctx.stop_all(stop_budget).await;
    log.event(
        LogType::Node,
        None,
        format!("shutdown done stuck={stuck} tasks_active={}", tasks.active_count()),
    );
    // Let the file sink drain its queue.
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

/// The first SIGINT/SIGTERM starts a graceful shutdown; a second one exits at once.
fn start_signal_listener_async(ctx: &Arc<NodeContext>) -> anyhow::Result<()> {
    let mut term = unix_signal(SignalKind::terminate())?;
    let mut int = unix_signal(SignalKind::interrupt())?;
    let ctx = Arc::clone(ctx);
    ctx.tasks.clone().spawn(async move {
        loop {
            let name = tokio::select! {
                _ = term.recv() => "SIGTERM",
                _ = int.recv() => "SIGINT",
            };
            if ctx.shutdown.is_fired() {
                ctx.log.event(LogType::Node, None, format!("signal={name} received action=force_exit"));
                // Give the file sink a moment with the line above.
                tokio::time::sleep(Duration::from_millis(50)).await;
                std::process::exit(130);
            }
            ctx.log.event(LogType::Node, None, format!("signal={name} received action=shutdown"));
            ctx.shutdown.fire();
        }
    });
    Ok(())
}

/// Reads operator commands from stdin, one per line, and prints the replies.
async fn console_loop(ctx: Arc<NodeContext>) {
    let mut lines = TokioBufReader::new(tokio::io::stdin()).lines();
    let mut out = tokio::io::stdout();
    loop {
        let line = tokio::select! {
            _ = ctx.shutdown.wait() => return,
            l = lines.next_line() => l,
        };
        match line {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let reply = dispatch(Arc::clone(&ctx), line).await;
                if !reply.is_empty() {
                    let _ = out.write_all(format!("{reply}\n").as_bytes()).await;
                    let _ = out.flush().await;
                }
            }
            Ok(None) => {
                ctx.log.event(LogType::Node, None, "console closed (stdin eof)");
                return;
            }
            Err(e) => {
                ctx.log.event(LogType::Node, None, format!("console_error err={e}"));
                return;
            }
        }
    }
}

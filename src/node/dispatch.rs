use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::node::build_info;
use crate::node::catalog::split_args;
use crate::node::lifecycle::{Pending, ServerHandle};
use crate::node::log::{LogType, format_event};
use crate::node::registry::NodeContext;
use crate::node::scheduler::schedule;

pub type Reply = Pin<Box<dyn Future<Output = String> + Send + 'static>>;

const HELP: &str = "\
commands:
  server list [app] | server create <app...> | server cleanup
  server start|stop|kill|restart|install|update|uninstall|reinstall|delete|view <id...|all>
  server keepalive <id> on|off | server set <id> <name> <value...> | server args <id> <args...>
  app list | app view <app...> | app install <app...>
  log enable|disable <type...|all> | log status
  schedule <seconds> [loop] <command>[;<command>][;;<command>] | schedule list | schedule cancel <id>
  guard <code> | version | help [topic] | quit | exit
separators: `a; b` runs a then b; after a schedule, `;` parts run now and `;;` parts run after the delay";

const HELP_SERVER: &str = "\
server list [app]             registered servers, optionally only those of one app
server create <app...>        register a new server (no files are written yet)
server install|update <id...> fetch or update the server files through the installer
server uninstall <id...>      remove the app through the installer, then the directory
server reinstall <id...>      uninstall followed by install
server start|stop <id...>     launch detached / stop and wait for exit
server restart <id...>        stop then start
server kill <id...>           SIGKILL; keep-alive may relaunch it
server delete <id...>         remove a stopped server and its directory
server view <id...>           details, rendered command line, process stats
server keepalive <id> on|off  relaunch after an unexpected exit
server set <id> <name> <val>  set a !{name} variable
server args <id> <args...>    replace the argument template
server cleanup                delete numbered directories no server owns";

const HELP_SCHEDULE: &str = "\
schedule <seconds> [loop] <command>[;<command>][;;<command>]
  the first command and every `;;` part run after the delay, `;` parts run now
  `schedule 30 server stop 0;;server start 0` stops then starts after 30s
  `schedule 30 server stop 0; server list;;server start 0` lists now, stops and starts after 30s
schedule list | schedule cancel <id>";

const HELP_LOG: &str = "log enable|disable <type...|all> | log status
types: node command server installer progress terminal watchdog socket schedule";

/// Runs one console or socket line and returns the text to show the operator.
pub fn dispatch(ctx: Arc<NodeContext>, line: String) -> Reply {
    Box::pin(async move {
        let mut replies = vec![];
        for stmt in split_statements(&line) {
            replies.push(run_command(&ctx, &stmt).await);
        }
        replies.join("\n")
    })
}

/// Splits a line into statements on `;` and `;;`.
///
/// After `schedule <seconds> [loop] A`, the `;` parts that follow are statements of their
/// own and run now, while every part from the first `;;` on joins the schedule body:
/// `schedule 5 A;B;;C` yields `schedule 5 A;;C` and `B`. Anywhere else `;;` separates like `;`.
pub fn split_statements(line: &str) -> Vec<String> {
    let mut segments: Vec<(bool, String)> = vec![];
    let mut cur = String::new();
    let mut after_double = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c != ';' {
            cur.push(c);
            continue;
        }
        segments.push((after_double, std::mem::take(&mut cur)));
        after_double = chars.next_if_eq(&';').is_some();
    }
    segments.push((after_double, cur));

    let mut out: Vec<String> = vec![];
    let mut open: Option<usize> = None;
    let mut delayed = false;
    for (after_double, seg) in segments {
        let seg = seg.trim();
        if seg.is_empty() {
            continue;
        }
        if let Some(i) = open {
            if after_double || delayed {
                delayed = true;
                out[i].push_str(";;");
                out[i].push_str(seg);
                continue;
            }
        }
        if is_schedule_head(seg) {
            open = Some(out.len());
            delayed = false;
        }
        out.push(seg.to_string());
    }
    out
}

/// `schedule <seconds> ...`, as opposed to `schedule list|cancel`.
fn is_schedule_head(stmt: &str) -> bool {
    let mut words = stmt.split_whitespace();
    words.next().is_some_and(|w| w.eq_ignore_ascii_case("schedule"))
        && words.next().is_some_and(|w| w.parse::<f64>().is_ok())
}

/// The text after the first `n` whitespace separated words.
fn rest_after(stmt: &str, n: usize) -> &str {
    let mut s = stmt.trim_start();
    for _ in 0..n {
        match s.find(char::is_whitespace) {
            Some(i) => s = s[i..].trim_start(),
            None => return "",
        }
    }
    s.trim()
}

fn operator_error(ctx: &NodeContext, msg: String) -> String {
    ctx.log.event(LogType::Command, None, format!("rejected reason={msg:?}"));
    format!("error: {msg}")
}

async fn run_command(ctx: &Arc<NodeContext>, stmt: &str) -> String {
    let words: Vec<&str> = stmt.split_whitespace().collect();
    let Some(subject) = words.first().map(|w| w.to_ascii_lowercase()) else {
        return String::new();
    };
    ctx.log.event(LogType::Command, None, format!("line={stmt:?}"));
    let args = &words[1..];
    match subject.as_str() {
        "quit" | "exit" => {
            ctx.log.event(LogType::Node, None, "shutdown requested by command");
            ctx.shutdown.fire();
            "shutting down".to_string()
        }
        "help" => help(args.first().copied()),
        "version" => format!(
            "{}\ntasks active={} blocking={} spawned={}",
            build_info::banner(),
            ctx.tasks.active_count(),
            ctx.tasks.active_blocking_count(),
            ctx.tasks.total_spawned()
        ),
        "guard" => match args.first() {
            Some(code) => {
                ctx.guard.submit(code);
                ctx.log.event(LogType::Installer, None, "guard_code=received");
                "guard code accepted".to_string()
            }
            None => operator_error(ctx, "usage: guard <code>".to_string()),
        },
        "cleanup" => server_cleanup(ctx),
        "server" => server_command(ctx, stmt, args),
        "app" => app_command(ctx, args),
        "log" => log_command(ctx, args),
        "schedule" => schedule_command(ctx, stmt, args),
        other => operator_error(ctx, format!("unknown command {other:?}; try `help`")),
    }
}

fn help(topic: Option<&str>) -> String {
    match topic.map(|t| t.to_ascii_lowercase()).as_deref() {
        Some("server") => HELP_SERVER.to_string(),
        Some("schedule") => HELP_SCHEDULE.to_string(),
        Some("log") => HELP_LOG.to_string(),
        _ => HELP.to_string(),
    }
}

fn server_command(ctx: &Arc<NodeContext>, stmt: &str, args: &[&str]) -> String {
    let Some(action) = args.first().map(|a| a.to_ascii_lowercase()) else {
        return help(Some("server"));
    };
    let targets = &args[1..];
    match action.as_str() {
        "list" => server_list(ctx, targets.first().copied()),
        "create" => {
            if targets.is_empty() {
                return operator_error(ctx, "usage: server create <app...>".to_string());
            }
            targets
                .iter()
                .map(|short| match ctx.create_server(short) {
                    Ok(h) => format!("created server {} ({})", h.id(), h.server.app.short_name),
                    Err(e) => operator_error(ctx, e.to_string()),
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
        "cleanup" => server_cleanup(ctx),
        "keepalive" => {
            let (Some(id), flag) = (targets.first(), targets.get(1)) else {
                return operator_error(ctx, "usage: server keepalive <id> on|off".to_string());
            };
            let h = match ctx.server(id) {
                Ok(h) => h,
                Err(e) => return operator_error(ctx, e.to_string()),
            };
            let on = match flag.map(|f| f.to_ascii_lowercase()).as_deref() {
                Some("on" | "true" | "1") => true,
                Some("off" | "false" | "0") => false,
                None => {
                    return format!("server {}: keepalive={}", h.id(), if h.server.keep_alive() { "on" } else { "off" })
                }
                Some(other) => return operator_error(ctx, format!("keepalive expects on|off, got {other:?}")),
            };
            h.server.set_keep_alive(on);
            ctx.log.event(LogType::Server, Some(h.id()), format!("keepalive={on}"));
            format!("server {}: keepalive {}", h.id(), if on { "on" } else { "off" })
        }
        "set" => {
            let (Some(id), Some(name)) = (targets.first(), targets.get(1)) else {
                return operator_error(ctx, "usage: server set <id> <name> <value...>".to_string());
            };
            let h = match ctx.server(id) {
                Ok(h) => h,
                Err(e) => return operator_error(ctx, e.to_string()),
            };
            let value = rest_after(stmt, 4);
            h.server.set_variable(name, value);
            ctx.log.event(LogType::Server, Some(h.id()), format!("variable={name} value={value:?}"));
            format!("server {}: {name}={value}", h.id())
        }
        "args" => {
            let Some(id) = targets.first() else {
                return operator_error(ctx, "usage: server args <id> <args...>".to_string());
            };
            let h = match ctx.server(id) {
                Ok(h) => h,
                Err(e) => return operator_error(ctx, e.to_string()),
            };
            let raw = rest_after(stmt, 3);
            if raw.is_empty() {
                return format!("server {}: args {}", h.id(), h.server.state().args.join(" "));
            }
            h.server.set_args(split_args(raw));
            ctx.log.event(LogType::Server, Some(h.id()), format!("args={raw:?}"));
            format!("server {}: args set", h.id())
        }
        "view" => resolve_targets(ctx, targets)
            .map(|handles| {
                handles
                    .iter()
                    .map(|h| h.server.view())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_else(|e| operator_error(ctx, e)),
        "start" | "stop" | "kill" | "restart" | "install" | "update" | "uninstall" | "reinstall" | "delete" => {
            match resolve_targets(ctx, targets) {
                Ok(handles) => handles
                    .iter()
                    .map(|h| queue_lifecycle(ctx, h, &action))
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(e) => operator_error(ctx, e),
            }
        }
        other => operator_error(ctx, format!("unknown server action {other:?}; try `help server`")),
    }
}

fn resolve_targets(ctx: &NodeContext, targets: &[&str]) -> Result<Vec<Arc<ServerHandle>>, String> {
    if targets.is_empty() {
        return Err("missing server id".to_string());
    }
    if targets.len() == 1 && targets[0].eq_ignore_ascii_case("all") {
        return Ok(ctx.registry.list());
    }
    targets
        .iter()
        .map(|t| ctx.server(t).map_err(|e| e.to_string()))
        .collect()
}

/// Enqueues on the server's actor now, so chained commands keep their order, and logs
/// the outcome when it arrives.
fn queue_lifecycle(ctx: &Arc<NodeContext>, h: &Arc<ServerHandle>, action: &str) -> String {
    let id = h.id();
    match action {
        "start" => follow(ctx, id, "start", h.start()),
        "stop" => follow(ctx, id, "stop", h.stop()),
        "kill" => follow(ctx, id, "kill", h.kill()),
        "restart" => follow(ctx, id, "restart", h.restart()),
        "install" => follow(ctx, id, "install", h.install()),
        "update" => follow(ctx, id, "update", h.update()),
        "uninstall" => follow(ctx, id, "uninstall", h.uninstall()),
        "reinstall" => follow(ctx, id, "reinstall", h.reinstall()),
        _ => {
            let pending = h.delete();
            let ctx2 = Arc::clone(ctx);
            ctx.tasks.spawn(async move {
                match pending.wait().await {
                    Ok(()) => {
                        ctx2.registry.remove(id);
                        ctx2.log.event(LogType::Command, Some(id), "op=delete outcome=ok");
                    }
                    Err(e) => ctx2
                        .log
                        .event(LogType::Command, Some(id), format!("op=delete outcome=error err={e:#}")),
                }
            });
        }
    }
    format!("server {id}: {action} queued")
}

fn follow<T: std::fmt::Debug + Send + 'static>(ctx: &NodeContext, id: u32, op: &'static str, pending: Pending<T>) {
    let log = ctx.log.clone();
    ctx.tasks.spawn(async move {
        match pending.wait().await {
            Ok(v) => log.event(LogType::Command, Some(id), format!("op={op} outcome=ok result={v:?}")),
            Err(e) => log.event(LogType::Command, Some(id), format!("op={op} outcome=error err={e:#}")),
        }
    });
}

fn server_list(ctx: &NodeContext, app: Option<&str>) -> String {
    let servers: Vec<_> = ctx
        .registry
        .list()
        .into_iter()
        .filter(|h| app.map_or(true, |a| h.server.app.short_name.eq_ignore_ascii_case(a)))
        .collect();
    if servers.is_empty() {
        return "no servers".to_string();
    }
    servers
        .iter()
        .map(|h| h.server.summary())
        .collect::<Vec<_>>()
        .join("\n")
}

fn server_cleanup(ctx: &NodeContext) -> String {
    match ctx.cleanup() {
        Ok(removed) if removed.is_empty() => "cleanup: nothing to remove".to_string(),
        Ok(removed) => format!(
            "cleanup: removed {}",
            removed
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Err(e) => operator_error(ctx, format!("cleanup failed: {e:#}")),
    }
}

fn app_command(ctx: &Arc<NodeContext>, args: &[&str]) -> String {
    let action = args.first().map(|a| a.to_ascii_lowercase());
    let names = args.get(1..).unwrap_or(&[]);
    match action.as_deref() {
        Some("list") | None => ctx
            .catalog
            .list()
            .iter()
            .map(|a| format!("{:<10} {:>8}  {}", a.short_name, a.catalog_id, a.name))
            .collect::<Vec<_>>()
            .join("\n"),
        Some("view") => names
            .iter()
            .map(|n| match ctx.catalog.find(n) {
                Some(a) => {
                    let mut out = vec![
                        format!("{} ({})", a.name, a.short_name),
                        format!("  catalog_id: {}", a.catalog_id),
                        format!("  executable: {}", a.executable_linux),
                        format!("  default args: {}", a.default_args),
                    ];
                    out.extend(a.variables.iter().map(|v| format!("  var {}={}", v.name, v.value)));
                    out.join("\n")
                }
                None => operator_error(ctx, format!("unknown app: {n}")),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Some("install") => names
            .iter()
            .map(|n| match ctx.create_server(n) {
                Ok(h) => {
                    let queued = queue_lifecycle(ctx, &h, "install");
                    format!("created server {} ({})\n{queued}", h.id(), h.server.app.short_name)
                }
                Err(e) => operator_error(ctx, e.to_string()),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => operator_error(ctx, format!("unknown app action {other:?}")),
    }
}

fn log_command(ctx: &NodeContext, args: &[&str]) -> String {
    let action = args.first().map(|a| a.to_ascii_lowercase());
    let on = match action.as_deref() {
        Some("enable") => true,
        Some("disable") => false,
        Some("status") | None => {
            return LogType::ALL
                .iter()
                .map(|t| format!("{:<10} {}", t.as_str(), if ctx.log.is_enabled(*t) { "on" } else { "off" }))
                .collect::<Vec<_>>()
                .join("\n");
        }
        Some(other) => return operator_error(ctx, format!("unknown log action {other:?}")),
    };
    let names = &args[1..];
    if names.is_empty() {
        return operator_error(ctx, "usage: log enable|disable <type...>".to_string());
    }
    let mut changed = vec![];
    for name in names {
        if name.eq_ignore_ascii_case("all") {
            for t in LogType::ALL {
                ctx.log.set_enabled(t, on);
            }
            changed.push("all".to_string());
            continue;
        }
        match name.parse::<LogType>() {
            Ok(t) => {
                ctx.log.set_enabled(t, on);
                changed.push(t.as_str().to_string());
            }
            Err(e) => return operator_error(ctx, e),
        }
    }
    // Always visible, even when the node type was just disabled.
    let line = format_event(
        LogType::Node,
        None,
        &format!("log {} {}", if on { "enabled" } else { "disabled" }, changed.join(",")),
    );
    eprintln!("{line}");
    format!("log {}: {}", if on { "enabled" } else { "disabled" }, changed.join(" "))
}

fn schedule_command(ctx: &Arc<NodeContext>, stmt: &str, args: &[&str]) -> String {
    match args.first().map(|a| a.to_ascii_lowercase()).as_deref() {
        None => help(Some("schedule")),
        Some("list") => {
            let entries = ctx.scheduler.list();
            if entries.is_empty() {
                return "no schedules".to_string();
            }
            entries
                .iter()
                .map(|e| {
                    format!(
                        "{:>4}  every={:.1}s loop={} runs={} created={} command={}",
                        e.id,
                        e.delay.as_secs_f64(),
                        e.looping,
                        e.runs,
                        e.created.format("%Y-%m-%d_%H:%M:%S"),
                        e.command
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
        Some("cancel") => match args.get(1).and_then(|s| s.parse::<u64>().ok()) {
            Some(id) if ctx.scheduler.cancel(id) => {
                ctx.log.event(LogType::Schedule, None, format!("id={id} cancelled"));
                format!("schedule {id} cancelled")
            }
            Some(id) => operator_error(ctx, format!("no schedule with id {id}")),
            None => operator_error(ctx, "usage: schedule cancel <id>".to_string()),
        },
        Some(secs) => {
            let delay = match secs.parse::<f64>() {
                Ok(s) if s.is_finite() && s >= 0.0 => Duration::from_secs_f64(s),
                _ => return operator_error(ctx, format!("schedule: invalid delay {secs:?}")),
            };
            let looping = args.get(1).is_some_and(|a| a.eq_ignore_ascii_case("loop"));
            let body = rest_after(stmt, if looping { 3 } else { 2 });
            if body.is_empty() {
                return operator_error(ctx, "usage: schedule <seconds> [loop] <command>".to_string());
            }
            if looping && delay.is_zero() {
                return operator_error(ctx, "schedule: a looping schedule needs a delay above 0".to_string());
            }
            // After the delay the chained parts run one after the other.
            let command = body.replace(";;", ";");
            let id = schedule(ctx, delay, looping, command.clone());
            format!(
                "schedule {id}: in {}s{} run {command}",
                delay.as_secs_f64(),
                if looping { " (loop)" } else { "" }
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::asyncutil::TaskTracker;
    use crate::node::config::NodeConfig;
    use crate::node::log::EventLog;

    fn ctx() -> (tempfile::TempDir, Arc<NodeContext>) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = NodeContext::new(NodeConfig::with_root(dir.path()), EventLog::capturing(), TaskTracker::new());
        (dir, ctx)
    }

    #[test]
    fn schedule_keeps_its_head_and_double_parts() {
        assert_eq!(
            split_statements("schedule 1 A;B;;C"),
            vec!["schedule 1 A;;C", "B"]
        );
        assert_eq!(
            split_statements("server list; schedule 5 loop server stop 0; help;;server start 0"),
            vec!["server list", "schedule 5 loop server stop 0;;server start 0", "help"]
        );
        // Everything after the first `;;` belongs to the delayed body.
        assert_eq!(
            split_statements("schedule 1 A;;B;C"),
            vec!["schedule 1 A;;B;;C"]
        );
        assert_eq!(split_statements(" ; ;"), Vec::<String>::new());
    }

    #[test]
    fn double_semicolons_outside_schedule_just_separate() {
        assert_eq!(split_statements("help;;version; server list"), vec!["help", "version", "server list"]);
        assert_eq!(split_statements("schedule list;;help"), vec!["schedule list", "help"]);
    }

    #[test]
    fn rest_after_skips_words() {
        assert_eq!(rest_after("server set 0 hostname My  Server ", 4), "My  Server");
        assert_eq!(rest_after("server args 1", 3), "");
    }

    #[tokio::test]
    async fn create_list_and_view() {
        let (_dir, ctx) = ctx();
        let reply = dispatch(Arc::clone(&ctx), "server create rust css".into()).await;
        assert_eq!(reply, "created server 0 (rust)\ncreated server 1 (css)");
        let list = dispatch(Arc::clone(&ctx), "server list css".into()).await;
        assert_eq!(list.lines().count(), 1);
        assert!(list.contains("css"));
        let view = dispatch(Arc::clone(&ctx), "server view 0".into()).await;
        assert!(view.contains("+server.port 28015"));
    }

    #[tokio::test]
    async fn set_and_args_change_the_command_line() {
        let (_dir, ctx) = ctx();
        dispatch(Arc::clone(&ctx), "server create rust".into()).await;
        dispatch(Arc::clone(&ctx), "server set 0 hostname My Fine Server".into()).await;
        dispatch(Arc::clone(&ctx), r#"server args 0 +name "!{hostname}" -x"#.into()).await;
        let h = ctx.server("0").unwrap();
        assert_eq!(h.server.rendered_args(), vec!["+name", "My Fine Server", "-x"]);
    }

    #[tokio::test]
    async fn operator_errors_are_replies_not_failures() {
        let (_dir, ctx) = ctx();
        assert!(dispatch(Arc::clone(&ctx), "frobnicate".into()).await.starts_with("error:"));
        assert!(dispatch(Arc::clone(&ctx), "server start 9".into()).await.starts_with("error:"));
        assert!(dispatch(Arc::clone(&ctx), "server create nope".into()).await.starts_with("error:"));
        assert!(dispatch(Arc::clone(&ctx), "schedule soon help".into()).await.starts_with("error:"));
        assert!(ctx.log.captured().iter().any(|l| l.contains("rejected")));
    }

    #[tokio::test]
    async fn log_toggles_types() {
        let (_dir, ctx) = ctx();
        dispatch(Arc::clone(&ctx), "log disable installer progress".into()).await;
        assert!(!ctx.log.is_enabled(LogType::Installer));
        assert!(!ctx.log.is_enabled(LogType::Progress));
        dispatch(Arc::clone(&ctx), "log enable all".into()).await;
        assert!(LogType::ALL.iter().all(|t| ctx.log.is_enabled(*t)));
        assert!(dispatch(Arc::clone(&ctx), "log enable bogus".into()).await.starts_with("error:"));
    }

    #[tokio::test]
    async fn start_of_uninstalled_server_is_refused() {
        let (_dir, ctx) = ctx();
        dispatch(Arc::clone(&ctx), "server create css".into()).await;
        let h = ctx.server("0").unwrap();
        let err = h.start().wait().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::node::error::NodeError>(),
            Some(crate::node::error::NodeError::NotInstalled(0))
        ));
    }

    #[tokio::test]
    async fn schedule_chains_delayed_and_immediate_parts() {
        let (_dir, ctx) = ctx();
        let reply = dispatch(
            Arc::clone(&ctx),
            "schedule 0.2 server create css;server create rust;;server create tf2".into(),
        )
        .await;
        assert!(reply.contains("schedule 0: in 0.2s run server create css;server create tf2"), "{reply}");
        // the part after the single `;` ran right away
        assert_eq!(ctx.registry.list().len(), 1);
        assert_eq!(ctx.registry.get(0).unwrap().server.app.short_name, "rust");

        tokio::time::sleep(Duration::from_millis(600)).await;
        let apps: Vec<String> = ctx
            .registry
            .list()
            .iter()
            .map(|h| h.server.app.short_name.clone())
            .collect();
        assert_eq!(apps, vec!["rust", "css", "tf2"]);
    }

    #[tokio::test]
    async fn quit_fires_shutdown() {
        let (_dir, ctx) = ctx();
        assert_eq!(dispatch(Arc::clone(&ctx), "exit".into()).await, "shutting down");
        assert!(ctx.shutdown.is_fired());
    }
}

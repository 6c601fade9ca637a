use assert_approx_eq::assert_approx_eq;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use servernode::node::asyncutil::TaskTracker;
use servernode::node::config::parse_node_config;
use servernode::node::dispatch::dispatch;
use servernode::node::error::NodeError;
use servernode::node::lifecycle::ServerHandle;
use servernode::node::listener;
use servernode::node::log::EventLog;
use servernode::node::protocol::Client;
use servernode::node::registry::NodeContext;
use servernode::node::server::InstallPhase;

const FAKE_INSTALLER: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/fake_steamcmd.sh");

fn node(root: &Path) -> Arc<NodeContext> {
    node_with(root, "")
}

/// `global_extra` lands in the `global:` section.
fn node_with(root: &Path, global_extra: &str) -> Arc<NodeContext> {
    let installer_dir = root.join("steamcmd");
    std::fs::create_dir_all(&installer_dir).unwrap();
    let exe = installer_dir.join("steamcmd.sh");
    std::fs::copy(FAKE_INSTALLER, &exe).unwrap();
    std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

    let raw = r#"
global:
  root_directory: "."
  installer_directory: steamcmd
  installer_executable: steamcmd.sh
# extra
socket:
  bind: 127.0.0.1
  port: 0
terminal:
  input_timeout: 10s
  startup_timeout: 10s
  shutdown_timeout: 3s
watchdog:
  grace_period: 300ms
  poll_interval: 50ms
  stop_timeout: 2s
log:
  file: null
apps:
  - name: Fake Dedicated Server
    short_name: fake
    catalog_id: 4242
    executable_linux: run.sh
    default_args: "!{seconds}"
    variables:
      - name: seconds
        value: "30"
"#;
    let raw = raw.replace("# extra\n", global_extra);
    let cfg = parse_node_config(&raw, root).unwrap();
    NodeContext::new(cfg, EventLog::capturing(), TaskTracker::new())
}

/// Drops a marker file next to the fake installer to switch its behaviour.
fn installer_mode(root: &Path, name: &str, contents: &str) {
    std::fs::write(root.join("steamcmd").join(name), contents).unwrap();
}

fn logged(ctx: &NodeContext, needle: &str) -> bool {
    ctx.log.captured().iter().any(|l| l.contains(needle))
}

async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

async fn installed(ctx: &NodeContext) -> Arc<ServerHandle> {
    let h = ctx.create_server("fake").unwrap();
    assert!(h.install().wait().await.unwrap());
    h
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn install_drives_the_installer_to_success() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = node(dir.path());
    let h = installed(&ctx).await;

    assert!(h.server.is_installed());
    assert!(!h.server.dir.join("steamapps").exists());
    let snap = h.server.progress().borrow().clone();
    assert_approx_eq!(snap.progress, 100.0);
    let log = ctx.log.captured();
    assert!(log.iter().any(|l| l.contains("op=install outcome=success")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_twice_is_refused_and_stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = node(dir.path());
    let h = installed(&ctx).await;

    let pid = h.start().wait().await.unwrap();
    assert!(pid > 0);
    assert!(h.server.is_running());

    let err = h.start().wait().await.unwrap_err();
    assert!(matches!(err.downcast_ref::<NodeError>(), Some(NodeError::AlreadyRunning(0))));
    let err = h.install().wait().await.unwrap_err();
    assert!(matches!(err.downcast_ref::<NodeError>(), Some(NodeError::AlreadyRunning(0))));

    h.stop().wait().await.unwrap();
    assert!(!h.server.is_running());
    h.stop().wait().await.unwrap();
    assert!(!h.server.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keepalive_relaunches_with_a_new_pid() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = node(dir.path());
    let h = installed(&ctx).await;
    h.server.set_variable("seconds", "1");
    h.server.set_keep_alive(true);

    let first = h.start().wait().await.unwrap();
    let relaunched = eventually(Duration::from_secs(8), || {
        h.server.is_running() && h.server.pid().is_some_and(|p| p != first)
    })
    .await;
    assert!(relaunched, "no relaunch observed; log:\n{}", ctx.log.captured().join("\n"));

    h.server.set_variable("seconds", "30");
    h.stop().wait().await.unwrap();
    assert!(!h.server.should_run());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exit_without_keepalive_stays_down() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = node(dir.path());
    let h = installed(&ctx).await;
    h.server.set_variable("seconds", "1");

    let pid = h.start().wait().await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(!h.server.is_running());
    assert_eq!(h.server.pid(), Some(pid));
    assert!(ctx.log.captured().iter().any(|l| l.contains("event=exit_observed action=none")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduled_stop_fires_after_the_delay() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = node(dir.path());
    let h = installed(&ctx).await;
    h.start().wait().await.unwrap();

    let reply = dispatch(Arc::clone(&ctx), "schedule 1 server stop 0".to_string()).await;
    assert!(reply.starts_with("schedule 0:"), "{reply}");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(h.server.is_running());

    assert!(eventually(Duration::from_secs(5), || !h.server.is_running()).await);
    assert!(ctx.scheduler.list().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn uninstall_then_delete_and_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = node(dir.path());
    let h = installed(&ctx).await;

    assert!(h.uninstall().wait().await.unwrap());
    assert!(!h.server.dir.exists());
    // Nothing left to remove the second time.
    assert!(!h.uninstall().wait().await.unwrap());

    let orphan = ctx.cfg.servers_directory().join("17");
    std::fs::create_dir_all(&orphan).unwrap();
    let reply = dispatch(Arc::clone(&ctx), "server delete 0; server cleanup".to_string()).await;
    assert!(reply.contains("server 0: delete queued"), "{reply}");
    assert!(eventually(Duration::from_secs(3), || ctx.registry.get(0).is_none()).await);
    assert!(!orphan.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_app_install_over_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = node(dir.path());
    let l = listener::bind(&ctx.cfg.socket).await.unwrap();
    let addr = l.local_addr().unwrap();
    tokio::spawn(listener::run_listener(Arc::clone(&ctx), l));

    let mut client = Client::connect(addr).await.unwrap();
    let reply = client.call("app install fake").await.unwrap();
    assert!(reply.contains("created server 0 (fake)"), "{reply}");
    assert!(reply.contains("install queued"), "{reply}");

    let h = ctx.registry.get(0).unwrap();
    assert!(eventually(Duration::from_secs(15), || h.server.install_phase() == InstallPhase::Installed).await);
    let view = client.call("server view 0").await.unwrap();
    assert!(view.contains("command line: 30"), "{view}");
    ctx.shutdown.fire();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_interrupts_a_running_install() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = node(dir.path());
    installer_mode(dir.path(), "slow_update", "");
    let h = ctx.create_server("fake").unwrap();
    let pending = h.install();
    let downloading = eventually(Duration::from_secs(10), || h.server.progress().borrow().progress >= 25.0).await;
    assert!(downloading, "install never started; log:\n{}", ctx.log.captured().join("\n"));

    ctx.shutdown.fire();
    let left = tokio::time::timeout(Duration::from_secs(8), ctx.stop_all(Duration::from_secs(6)))
        .await
        .expect("stop_all did not return");
    assert_eq!(left, 0);
    assert!(pending.wait().await.is_err());
    assert!(!h.server.is_installed());
    assert!(logged(&ctx, "op=installer outcome=interrupted reason=node_shutdown"));
    assert!(logged(&ctx, "actor=exit"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_login_leaves_the_server_uninstalled() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = node(dir.path());
    installer_mode(dir.path(), "login_fails", "");
    let h = ctx.create_server("fake").unwrap();

    assert!(!h.install().wait().await.unwrap());
    assert!(!h.server.is_installed());
    assert_eq!(h.server.install_phase(), InstallPhase::Uninstalled);
    assert!(logged(&ctx, "warning=login_failed state=LoginFailedBadPassword"));
    assert!(logged(&ctx, "op=install outcome=failed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn steam_guard_code_arrives_through_the_guard_command() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = node_with(dir.path(), "  installer_username: alice\n  installer_password: hunter2\n");
    installer_mode(dir.path(), "guard_code", "BX7QK");
    let h = ctx.create_server("fake").unwrap();

    let operator = {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            dispatch(ctx, "guard BX7QK".to_string()).await
        })
    };
    assert!(h.install().wait().await.unwrap(), "log:\n{}", ctx.log.captured().join("\n"));
    assert_eq!(operator.await.unwrap(), "guard code accepted");
    assert!(h.server.is_installed());
    assert!(logged(&ctx, "state=SteamGuardRequired"));
    assert!(logged(&ctx, "state=LoggedIn"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_during_grace_exits_quietly() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = node(dir.path());
    let h = installed(&ctx).await;
    h.server.set_keep_alive(true);

    h.start().wait().await.unwrap();
    h.stop().wait().await.unwrap();
    assert!(eventually(Duration::from_secs(2), || logged(&ctx, "exit reason=stop_requested")).await);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!h.server.is_running());
    assert!(!h.server.should_run());
    assert!(!logged(&ctx, "phase=supervising"));
    assert!(!logged(&ctx, "op=relaunch"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn process_gone_after_grace_is_a_failed_launch() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = node(dir.path());
    let h = installed(&ctx).await;
    h.server.set_variable("seconds", "0");
    h.server.set_keep_alive(true);

    let pid = h.start().wait().await.unwrap();
    assert!(eventually(Duration::from_secs(3), || logged(&ctx, "exit reason=launch_failed action=none")).await);
    assert!(!h.server.should_run());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!h.server.is_running());
    assert_eq!(h.server.pid(), Some(pid));
    assert!(!logged(&ctx, "op=relaunch"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_with_keepalive_comes_back() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = node(dir.path());
    let h = installed(&ctx).await;
    h.server.set_keep_alive(true);

    let first = h.start().wait().await.unwrap();
    // Past the grace window, so the exit is seen by supervision.
    tokio::time::sleep(Duration::from_millis(500)).await;
    h.kill().wait().await.unwrap();
    assert!(h.server.should_run());
    let back = eventually(Duration::from_secs(5), || {
        h.server.is_running() && h.server.pid().is_some_and(|p| p != first)
    })
    .await;
    assert!(back, "no relaunch after kill; log:\n{}", ctx.log.captured().join("\n"));
    h.stop().wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_gives_a_new_pid() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = node(dir.path());
    let h = installed(&ctx).await;

    let first = h.start().wait().await.unwrap();
    let second = h.restart().wait().await.unwrap();
    assert_ne!(first, second);
    assert!(h.server.is_running());
    assert!(h.server.should_run());
    h.stop().wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reinstall_runs_uninstall_then_install() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = node(dir.path());
    let h = installed(&ctx).await;

    assert!(h.reinstall().wait().await.unwrap());
    assert!(h.server.is_installed());
    assert!(logged(&ctx, "op=uninstall outcome=success"));
    let installs = ctx
        .log
        .captured()
        .iter()
        .filter(|l| l.contains("op=install outcome=success"))
        .count();
    assert_eq!(installs, 2);
}

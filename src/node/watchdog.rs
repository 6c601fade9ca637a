use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc as tokio_mpsc;

use crate::node::asyncutil::StopSignal;
use crate::node::launcher::ProcessHandle;
use crate::node::lifecycle::{LifecycleCmd, LifecycleEnv};
use crate::node::log::LogType;
use crate::node::server::{RunPhase, Server};

/// Supervises one launch of a server.
///
/// The grace window separates "did the launch work at all" from long-term supervision:
/// a process that is already gone when the window closes is a failed launch and is not
/// restarted. After that the PID is polled; on exit the actor is asked to relaunch, and
/// it applies the keep-alive policy as it stands at that moment.
pub(crate) async fn run_watchdog(
    server: Arc<Server>,
    env: LifecycleEnv,
    handle: ProcessHandle,
    epoch: u64,
    stop: StopSignal,
    actor: tokio_mpsc::WeakUnboundedSender<LifecycleCmd>,
) {
    let id = server.id;
    let log = |msg: String| env.log.event(LogType::Watchdog, Some(id), msg);
    let grace = Duration::from_millis(env.cfg.watchdog.grace_period_ms);
    let poll = Duration::from_millis(env.cfg.watchdog.poll_interval_ms.max(1));
    let current = |server: &Server| server.state().launch_epoch == epoch;

    log(format!("pid={} epoch={epoch} phase=grace grace_ms={}", handle.pid, grace.as_millis()));
    if stop.sleep_or_fired(grace).await {
        log(format!("pid={} exit reason=stop_requested", handle.pid));
        return;
    }
    if !handle.is_alive() {
        log(format!("pid={} exit reason=launch_failed action=none", handle.pid));
        if current(&server) {
            let mut st = server.state();
            st.should_run = false;
            st.run_phase = RunPhase::Stopped;
        }
        return;
    }

    log(format!("pid={} phase=supervising poll_ms={}", handle.pid, poll.as_millis()));
    loop {
        if stop.sleep_or_fired(poll).await {
            log(format!("pid={} exit reason=stop_requested", handle.pid));
            return;
        }
        if !current(&server) {
            log(format!("pid={} exit reason=superseded", handle.pid));
            return;
        }
        if !handle.is_alive() {
            break;
        }
    }

    let (keep_alive, should_run) = {
        let st = server.state();
        (st.keep_alive, st.should_run)
    };
    if !(keep_alive && should_run) {
        log(format!(
            "pid={} event=exit_observed action=none keepalive={keep_alive} should_run={should_run}",
            handle.pid
        ));
        if current(&server) {
            server.state().run_phase = RunPhase::Stopped;
        }
        return;
    }
    log(format!("pid={} event=exit_observed action=relaunch", handle.pid));
    match actor.upgrade() {
        Some(tx) => {
            if tx.send(LifecycleCmd::Relaunch { epoch }).is_err() {
                log("relaunch_error reason=actor_closed".to_string());
            }
        }
        None => log("relaunch_error reason=actor_dropped".to_string()),
    }
}

use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;

use crate::node::dispatch::dispatch;
use crate::node::log::LogType;
use crate::node::registry::NodeContext;

#[derive(Debug, Clone)]
pub struct ScheduleInfo {
    pub id: u64,
    pub delay: Duration,
    pub looping: bool,
    pub command: String,
    pub created: DateTime<Local>,
    pub runs: u64,
}

#[derive(Debug)]
struct Entry {
    info: ScheduleInfo,
    abort: Option<AbortHandle>,
}

/// Pending delayed commands. Nothing here survives a restart.
#[derive(Debug, Default)]
pub struct Scheduler {
    entries: Mutex<BTreeMap<u64, Entry>>,
    next_id: AtomicU64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> Vec<ScheduleInfo> {
        let g = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        g.values().map(|e| e.info.clone()).collect()
    }

    pub fn cancel(&self, id: u64) -> bool {
        let entry = {
            let mut g = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            g.remove(&id)
        };
        match entry {
            Some(e) => {
                if let Some(a) = e.abort {
                    a.abort();
                }
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Entry> = {
            let mut g = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *g).into_values().collect()
        };
        for e in &drained {
            if let Some(a) = &e.abort {
                a.abort();
            }
        }
        drained.len()
    }

    fn finished(&self, id: u64) {
        let mut g = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        g.remove(&id);
    }

    fn bump_runs(&self, id: u64) {
        let mut g = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(e) = g.get_mut(&id) {
            e.info.runs += 1;
        }
    }
}

/// Runs `command` through the dispatcher after `delay`, once or forever.
pub fn schedule(ctx: &Arc<NodeContext>, delay: Duration, looping: bool, command: String) -> u64 {
    let id = ctx.scheduler.next_id.fetch_add(1, Ordering::SeqCst);
    let logged = command.clone();
    let info = ScheduleInfo {
        id,
        delay,
        looping,
        command: command.clone(),
        created: Local::now(),
        runs: 0,
    };
    // Registered before the task can finish and unregister itself.
    let mut g = ctx.scheduler.entries.lock().unwrap_or_else(|p| p.into_inner());
    let task_ctx = Arc::clone(ctx);
    let handle = ctx.tasks.spawn(async move {
        let ctx = task_ctx;
        loop {
            if ctx.shutdown.sleep_or_fired(delay).await {
                ctx.log.event(LogType::Schedule, None, format!("id={id} exit reason=shutting_down"));
                break;
            }
            ctx.log.event(LogType::Schedule, None, format!("id={id} due command={command:?}"));
            let reply = dispatch(Arc::clone(&ctx), command.clone()).await;
            ctx.scheduler.bump_runs(id);
            ctx.log.event(
                LogType::Schedule,
                None,
                format!("id={id} ran reply={:?}", reply.lines().next().unwrap_or("")),
            );
            if !looping {
                break;
            }
        }
        ctx.scheduler.finished(id);
    });
    g.insert(
        id,
        Entry {
            info,
            abort: Some(handle.abort_handle()),
        },
    );
    drop(g);
    ctx.log.event(
        LogType::Schedule,
        None,
        format!("id={id} scheduled delay_ms={} loop={looping} command={logged:?}", delay.as_millis()),
    );
    id
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

    #[tokio::test]
    async fn one_shot_runs_once_and_unregisters() {
        let (_dir, ctx) = ctx();
        schedule(&ctx, Duration::from_millis(50), false, "server create css".to_string());
        assert_eq!(ctx.scheduler.list().len(), 1);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(ctx.scheduler.list().is_empty());
        assert_eq!(ctx.registry.list().len(), 1);
    }

    #[tokio::test]
    async fn looping_entry_repeats_until_cancelled() {
        let (_dir, ctx) = ctx();
        let id = schedule(&ctx, Duration::from_millis(40), true, "server create css".to_string());
        tokio::time::sleep(Duration::from_millis(300)).await;
        let runs = ctx.scheduler.list()[0].runs;
        assert!(runs >= 3, "runs={runs}");
        assert!(ctx.scheduler.cancel(id));
        assert!(!ctx.scheduler.cancel(id));
        let created = ctx.registry.list().len();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ctx.registry.list().len(), created);
    }
}

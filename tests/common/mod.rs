//! Shared test utilities.

#![allow(dead_code, unused_imports)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use taskmux::store::MemoryTaskStore;
use taskmux::supervisor::RestartPolicy;
use taskmux::{
    Subscription, Supervisor, SupervisorEvent, SupervisorSettings, TaskDraft, TaskId, TaskState,
    TaskView,
};

pub const WAIT: Duration = Duration::from_secs(10);

/// Settings with short timeouts and a fast, small restart budget.
pub fn test_settings() -> SupervisorSettings {
    SupervisorSettings {
        stop_grace: Duration::from_millis(500),
        drain_timeout: Duration::from_millis(200),
        restart: RestartPolicy {
            min_interval: Duration::from_millis(50),
            max_backoff: Duration::from_millis(200),
            window: Duration::from_secs(10),
            max_restarts: 3,
            stable_after: Duration::from_secs(10),
        },
        ..SupervisorSettings::default()
    }
}

pub fn supervisor() -> Supervisor {
    Supervisor::open(test_settings(), Arc::new(MemoryTaskStore::default()))
        .expect("open supervisor")
}

pub fn create(supervisor: &Supervisor, name: &str, command: &str) -> TaskId {
    supervisor
        .create(TaskDraft::new(name, command))
        .expect("create task")
        .config
        .id
}

/// Poll until `predicate` holds for the task's view.
pub async fn wait_for(
    supervisor: &Supervisor,
    id: &TaskId,
    predicate: impl Fn(&TaskView) -> bool,
) -> TaskView {
    let deadline = Instant::now() + WAIT;
    loop {
        let view = supervisor.get(id).expect("task exists");
        if predicate(&view) {
            return view;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for task {}; last view: {:?}",
            id,
            view
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_for_state(supervisor: &Supervisor, id: &TaskId, state: TaskState) -> TaskView {
    wait_for(supervisor, id, |view| view.status.state() == state).await
}

/// Poll until the scrollback contains `needle`.
pub async fn wait_for_output(supervisor: &Supervisor, id: &TaskId, needle: &str) -> String {
    let deadline = Instant::now() + WAIT;
    loop {
        let history = supervisor.log_history(id).expect("task exists");
        if history.contains(needle) {
            return history;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {:?}; history so far: {:?}",
            needle,
            history
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Receive events until one matches, failing after [`WAIT`].
pub async fn next_matching(
    subscription: &mut Subscription,
    predicate: impl Fn(&SupervisorEvent) -> bool,
) -> SupervisorEvent {
    let result = tokio::time::timeout(WAIT, async {
        loop {
            match subscription.recv().await {
                Some(event) if predicate(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await;
    result.expect("timed out waiting for event")
}

/// Whether a process with `pid` still runs. A zombie counts as gone: an
/// orphan is reaped by init, not by the supervisor, and some containers
/// never reap.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only performs the existence check.
    if unsafe { libc::kill(pid as libc::pid_t, 0) } != 0 {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .map_or(true, |(_, rest)| !rest.trim_start().starts_with('Z')),
        // Without procfs, signal 0 is all there is to go on.
        Err(_) => !std::path::Path::new("/proc/self").exists(),
    }
}

/// Poll until `pid` is gone, failing after [`WAIT`].
#[cfg(unix)]
pub async fn wait_for_exit(pid: u32) {
    let deadline = Instant::now() + WAIT;
    while pid_alive(pid) {
        assert!(Instant::now() < deadline, "process {} is still alive", pid);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

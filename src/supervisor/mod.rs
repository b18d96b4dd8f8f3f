//! Task lifecycle engine.
//!
//! Every task owns an async mutex over its runtime half (the live
//! instance, its crash history and any pending auto-restart). All
//! transitions of one task run under that mutex, so concurrent start, stop
//! and exit handling are applied one after another; different tasks never
//! contend beyond short map lookups.
//!
//! Process exits arrive out of band: each instance's watcher thread sends
//! an [`ExitNotice`] to the reaper loop, which applies it through the same
//! per-task mutex. Notices carry the instance generation, so one that
//! arrives after the instance was already stopped or replaced is ignored.

mod error;
mod instance;
mod restart;
mod settings;

pub use error::SupervisorError;
pub use restart::{CrashTracker, RestartDecision, RestartPolicy};
pub use settings::SupervisorSettings;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::events::{EventFilter, EventHub, Subscription, SupervisorEvent};
use crate::pty::{ExitOutcome, PtyChannel, PtyError, SpawnSpec, TerminalSize};
use crate::scrollback::{LogMirror, ScrollbackBuffer};
use crate::shutdown::{ShutdownCoordinator, ShutdownHandle, ShutdownPhase};
use crate::store::TaskStore;
use crate::task::{InvalidTask, TaskConfig, TaskDraft, TaskId, TaskStatus, TaskView};

use instance::{ExitNotice, Instance, LaunchContext};

/// Result of [`Supervisor::resize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resize {
    /// The live terminal was resized.
    Applied,
    /// The task is not running; the size applies to its next start.
    Deferred,
}

/// Scrollback plus a live event stream, split at one exact point: every
/// output chunk is in `history` or arrives on `events`, never both.
pub struct Attachment {
    pub history: Vec<u8>,
    pub events: Subscription,
}

/// Handle to the supervisor. Cheap to clone; the last clone dropped kills
/// any process still running.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    settings: SupervisorSettings,
    tasks: RwLock<HashMap<TaskId, Arc<TaskEntry>>>,
    store: Arc<dyn TaskStore>,
    persist_lock: Mutex<()>,
    hub: Arc<EventHub>,
    notices: mpsc::UnboundedSender<ExitNotice>,
    /// Source of instance generations and restart tokens.
    generations: AtomicU64,
    shutdown: ShutdownCoordinator,
}

struct TaskEntry {
    id: TaskId,
    config: RwLock<TaskConfig>,
    status: RwLock<TaskStatus>,
    size: Mutex<TerminalSize>,
    /// Input side of the running instance, readable without the runtime lock.
    live: RwLock<Option<Arc<PtyChannel>>>,
    scrollback: Arc<ScrollbackBuffer>,
    runtime: tokio::sync::Mutex<Runtime>,
    deleted: AtomicBool,
}

#[derive(Default)]
struct Runtime {
    instance: Option<Instance>,
    crashes: CrashTracker,
    /// Token of the scheduled auto-restart, if one is pending.
    pending_restart: Option<u64>,
}

impl TaskEntry {
    fn new(config: TaskConfig, settings: &SupervisorSettings) -> Self {
        let id = config.id.clone();
        let scrollback = match &settings.log_dir {
            Some(dir) => match LogMirror::open(dir, &id) {
                Ok(mirror) => ScrollbackBuffer::with_mirror(settings.scrollback_capacity, mirror),
                Err(err) => {
                    tracing::warn!(task_id = %id, dir = %dir.display(), error = %err, "scrollback log unavailable");
                    ScrollbackBuffer::new(settings.scrollback_capacity)
                }
            },
            None => ScrollbackBuffer::new(settings.scrollback_capacity),
        };
        Self {
            status: RwLock::new(TaskStatus::stopped(id.clone())),
            id,
            config: RwLock::new(config),
            size: Mutex::new(settings.default_size),
            live: RwLock::new(None),
            scrollback: Arc::new(scrollback),
            runtime: tokio::sync::Mutex::new(Runtime::default()),
            deleted: AtomicBool::new(false),
        }
    }

    // Lock order: status, then config.
    fn view(&self) -> TaskView {
        self.view_with(&self.status.read())
    }

    fn view_with(&self, status: &TaskStatus) -> TaskView {
        TaskView {
            config: self.config.read().clone(),
            status: status.clone(),
        }
    }

    fn live_channel(&self) -> Option<Arc<PtyChannel>> {
        self.live.read().clone()
    }
}

impl Supervisor {
    /// Load tasks from `store` and start the reaper loop.
    ///
    /// Must be called from within a Tokio runtime. Every task starts out
    /// stopped; nothing is launched until asked.
    pub fn open(settings: SupervisorSettings, store: Arc<dyn TaskStore>) -> Result<Self, SupervisorError> {
        let configs = store.load()?;
        let mut tasks = HashMap::with_capacity(configs.len());
        for config in configs {
            let entry = TaskEntry::new(config, &settings);
            if tasks.contains_key(&entry.id) {
                tracing::warn!(task_id = %entry.id, "duplicate task id in store; keeping the last one");
            }
            tasks.insert(entry.id.clone(), Arc::new(entry));
        }
        tracing::info!(tasks = tasks.len(), "supervisor ready");

        let (notices, notice_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            hub: Arc::new(EventHub::new(settings.event_queue_capacity)),
            settings,
            tasks: RwLock::new(tasks),
            store,
            persist_lock: Mutex::new(()),
            notices,
            generations: AtomicU64::new(0),
            shutdown: ShutdownCoordinator::new(),
        });
        tokio::spawn(reap_loop(Arc::downgrade(&inner), notice_rx));
        Ok(Self { inner })
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    /// All tasks, sorted by name and then id.
    pub fn list(&self) -> Vec<TaskView> {
        let entries: Vec<_> = self.inner.tasks.read().values().cloned().collect();
        let mut views: Vec<_> = entries.iter().map(|entry| entry.view()).collect();
        views.sort_by(|a, b| {
            a.config
                .name
                .cmp(&b.config.name)
                .then_with(|| a.config.id.cmp(&b.config.id))
        });
        views
    }

    pub fn get(&self, id: &TaskId) -> Result<TaskView, SupervisorError> {
        Ok(self.entry(id)?.view())
    }

    pub fn create(&self, draft: TaskDraft) -> Result<TaskView, SupervisorError> {
        draft.validate()?;
        let config = draft.into_config(TaskId::generate());
        let entry = Arc::new(TaskEntry::new(config, &self.inner.settings));
        self.inner
            .tasks
            .write()
            .insert(entry.id.clone(), Arc::clone(&entry));
        let view = self.publish_current(&entry);
        tracing::info!(task_id = %entry.id, name = %view.config.name, "task created");
        self.persist()?;
        Ok(view)
    }

    /// Replace a task's configuration. A running instance keeps the
    /// configuration it was started with.
    pub fn update(&self, id: &TaskId, draft: TaskDraft) -> Result<TaskView, SupervisorError> {
        draft.validate()?;
        let entry = self.entry(id)?;
        let view = {
            let status = entry.status.read();
            *entry.config.write() = draft.into_config(id.clone());
            let view = entry.view_with(&status);
            self.publish_status(&view);
            view
        };
        tracing::info!(task_id = %id, "task updated");
        self.persist()?;
        Ok(view)
    }

    pub async fn start(&self, id: &TaskId) -> Result<TaskView, SupervisorError> {
        let entry = self.entry(id)?;
        let mut runtime = entry.runtime.lock().await;
        runtime.crashes.reset();
        runtime.pending_restart = None;
        self.start_locked(&entry, &mut runtime).await
    }

    pub async fn stop(&self, id: &TaskId) -> Result<TaskView, SupervisorError> {
        let entry = self.entry(id)?;
        let mut runtime = entry.runtime.lock().await;
        Ok(self.stop_locked(&entry, &mut runtime).await)
    }

    pub async fn restart(&self, id: &TaskId) -> Result<TaskView, SupervisorError> {
        let entry = self.entry(id)?;
        let mut runtime = entry.runtime.lock().await;
        runtime.crashes.reset();
        self.stop_locked(&entry, &mut runtime).await;
        self.start_locked(&entry, &mut runtime).await
    }

    /// Stop the task if running, then forget it along with its history.
    pub async fn delete(&self, id: &TaskId) -> Result<(), SupervisorError> {
        let entry = self.entry(id)?;
        {
            let mut runtime = entry.runtime.lock().await;
            if entry.deleted.swap(true, Ordering::SeqCst) {
                return Err(SupervisorError::not_found(id));
            }
            self.stop_locked(&entry, &mut runtime).await;
            self.inner.tasks.write().remove(id);
        }
        entry.scrollback.discard();
        tracing::info!(task_id = %id, "task deleted");
        self.persist()
    }

    /// Scrollback as text; invalid UTF-8 is replaced.
    pub fn log_history(&self, id: &TaskId) -> Result<String, SupervisorError> {
        let bytes = self.scrollback(id)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn scrollback(&self, id: &TaskId) -> Result<Vec<u8>, SupervisorError> {
        Ok(self.entry(id)?.scrollback.snapshot())
    }

    pub fn clear_log_history(&self, id: &TaskId) -> Result<(), SupervisorError> {
        self.entry(id)?.scrollback.clear();
        tracing::debug!(task_id = %id, "scrollback cleared");
        Ok(())
    }

    /// Send input to the task's terminal.
    pub fn write(&self, id: &TaskId, bytes: &[u8]) -> Result<(), SupervisorError> {
        let entry = self.entry(id)?;
        let channel = entry
            .live_channel()
            .ok_or_else(|| SupervisorError::NotRunning { id: id.clone() })?;
        channel.write(bytes).map_err(|err| match err {
            PtyError::Closed => SupervisorError::NotRunning { id: id.clone() },
            other => SupervisorError::Io {
                id: id.clone(),
                source: other,
            },
        })
    }

    /// Record `size` as the task's terminal size and apply it if running.
    pub fn resize(&self, id: &TaskId, size: TerminalSize) -> Result<Resize, SupervisorError> {
        if !size.is_valid() {
            return Err(InvalidTask::new(
                "terminal size",
                format!("{}x{} has a zero dimension", size.rows, size.cols),
            )
            .into());
        }
        let entry = self.entry(id)?;
        *entry.size.lock() = size;
        let Some(channel) = entry.live_channel() else {
            return Ok(Resize::Deferred);
        };
        match channel.resize(size) {
            Ok(()) => Ok(Resize::Applied),
            Err(PtyError::Closed) => Ok(Resize::Deferred),
            Err(err) => Err(SupervisorError::Io {
                id: id.clone(),
                source: err,
            }),
        }
    }

    /// Size reported by the live terminal, or the size the next start uses.
    pub fn terminal_size(&self, id: &TaskId) -> Result<TerminalSize, SupervisorError> {
        let entry = self.entry(id)?;
        if let Some(Ok(size)) = entry.live_channel().map(|channel| channel.size()) {
            return Ok(size);
        }
        let size = *entry.size.lock();
        Ok(size)
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.inner.hub.subscribe(filter)
    }

    /// Snapshot scrollback and subscribe to the task in one step.
    pub fn attach(&self, id: &TaskId) -> Result<Attachment, SupervisorError> {
        let entry = self.entry(id)?;
        let hub = &self.inner.hub;
        let (history, events) = entry
            .scrollback
            .snapshot_then(|| hub.subscribe(EventFilter::Task(id.clone())));
        Ok(Attachment { history, events })
    }

    /// Stop every task in parallel. Later starts fail with `ShuttingDown`.
    pub async fn shutdown(&self) {
        let shutdown = &self.inner.shutdown;
        if !shutdown.signal() && shutdown.phase() == ShutdownPhase::Complete {
            return;
        }
        shutdown.advance(ShutdownPhase::StoppingTasks);

        let entries: Vec<_> = self.inner.tasks.read().values().cloned().collect();
        let mut stopping = JoinSet::new();
        for entry in entries {
            let supervisor = self.clone();
            stopping.spawn(async move {
                let mut runtime = entry.runtime.lock().await;
                supervisor.stop_locked(&entry, &mut runtime).await;
            });
        }
        while let Some(joined) = stopping.join_next().await {
            if let Err(err) = joined {
                tracing::warn!(error = %err, "task stop panicked during shutdown");
            }
        }

        shutdown.advance(ShutdownPhase::Complete);
        self.inner.hub.close();
        tracing::info!("supervisor shut down");
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.inner.shutdown.handle()
    }

    fn entry(&self, id: &TaskId) -> Result<Arc<TaskEntry>, SupervisorError> {
        self.lookup(id).ok_or_else(|| SupervisorError::not_found(id))
    }

    fn lookup(&self, id: &TaskId) -> Option<Arc<TaskEntry>> {
        self.inner.tasks.read().get(id).cloned()
    }

    async fn start_locked(&self, entry: &TaskEntry, runtime: &mut Runtime) -> Result<TaskView, SupervisorError> {
        if entry.deleted.load(Ordering::SeqCst) {
            return Err(SupervisorError::not_found(&entry.id));
        }
        if self.inner.shutdown.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }
        if runtime.instance.is_some() {
            return Ok(entry.view());
        }

        let config = entry.config.read().clone();
        let settings = &self.inner.settings;
        let generation = self.next_generation();
        let ctx = LaunchContext {
            id: entry.id.clone(),
            generation,
            spec: SpawnSpec {
                command: config.command,
                env_vars: config.env_vars,
                shell: settings.shell.clone(),
                working_dir: settings.working_dir.clone(),
            },
            size: *entry.size.lock(),
            scrollback: Arc::clone(&entry.scrollback),
            hub: Arc::clone(&self.inner.hub),
            notices: self.inner.notices.clone(),
        };

        match Instance::launch(ctx).await {
            Ok(instance) => {
                let pid = instance.pid().unwrap_or(0);
                *entry.live.write() = Some(Arc::clone(instance.channel()));
                runtime.instance = Some(instance);
                tracing::info!(task_id = %entry.id, pid, generation, "task started");
                Ok(self.set_status(entry, TaskStatus::running(entry.id.clone(), pid, unix_now())))
            }
            Err(err) => {
                let err = SupervisorError::launch(&entry.id, err);
                tracing::warn!(task_id = %entry.id, error = %err, "task failed to start");
                self.set_status(entry, TaskStatus::error(entry.id.clone(), err.to_string()));
                Err(err)
            }
        }
    }

    /// Terminate the running instance, if any, and cancel a pending
    /// auto-restart. Taking the instance first makes its exit notice stale.
    async fn stop_locked(&self, entry: &TaskEntry, runtime: &mut Runtime) -> TaskView {
        let cancelled = runtime.pending_restart.take().is_some();
        let Some(mut instance) = runtime.instance.take() else {
            if cancelled {
                tracing::info!(task_id = %entry.id, "pending auto-restart cancelled");
                let status = TaskStatus::stopped(entry.id.clone()).with_detail("auto-restart cancelled");
                return self.set_status(entry, status);
            }
            return entry.view();
        };
        entry.live.write().take();

        let settings = &self.inner.settings;
        let pid = instance.pid();
        tracing::info!(task_id = %entry.id, pid = ?pid, "stopping task");
        let outcome = instance.stop(settings.stop_grace).await;
        instance.teardown(settings.drain_timeout).await;

        let status = match outcome {
            ExitOutcome::Unknown(_) => {
                tracing::warn!(task_id = %entry.id, pid = ?pid, %outcome, "stopped task was not reaped");
                TaskStatus::error(entry.id.clone(), outcome.to_string())
            }
            _ => {
                tracing::info!(task_id = %entry.id, pid = ?pid, %outcome, "task stopped");
                TaskStatus::stopped(entry.id.clone()).with_detail("stopped")
            }
        };
        self.set_status(entry, status)
    }

    async fn handle_exit(&self, notice: ExitNotice) {
        let Some(entry) = self.lookup(&notice.id) else {
            return;
        };
        let mut runtime = entry.runtime.lock().await;
        let current = runtime.instance.as_ref().map(Instance::generation);
        if current != Some(notice.generation) {
            tracing::debug!(task_id = %notice.id, generation = notice.generation, "ignoring stale exit notice");
            return;
        }
        let Some(instance) = runtime.instance.take() else {
            return;
        };
        entry.live.write().take();

        let outcome = instance
            .exit_outcome()
            .unwrap_or_else(|| ExitOutcome::Unknown("exit status missing".to_string()));
        let ran_for = instance.uptime();
        let pid = instance.pid();
        instance.teardown(self.inner.settings.drain_timeout).await;

        if outcome.success() {
            tracing::info!(task_id = %entry.id, pid = ?pid, "task exited");
            self.set_status(&entry, TaskStatus::stopped(entry.id.clone()).with_detail(outcome.to_string()));
            return;
        }

        tracing::warn!(task_id = %entry.id, pid = ?pid, %outcome, "task exited unexpectedly");
        let auto_retry = entry.config.read().auto_retry;
        if !auto_retry || self.inner.shutdown.is_shutting_down() {
            self.set_status(&entry, TaskStatus::error(entry.id.clone(), outcome.to_string()));
            return;
        }

        match runtime
            .crashes
            .record(Instant::now(), ran_for, &self.inner.settings.restart)
        {
            RestartDecision::RestartAfter(delay) => {
                let token = self.next_generation();
                runtime.pending_restart = Some(token);
                tracing::info!(task_id = %entry.id, delay_ms = delay.as_millis() as u64, "scheduling auto-restart");
                let detail = format!("{}; restarting in {} ms", outcome, delay.as_millis());
                self.set_status(&entry, TaskStatus::error(entry.id.clone(), detail));
                self.schedule_restart(entry.id.clone(), token, delay);
            }
            RestartDecision::GiveUp { restarts, window } => {
                tracing::warn!(
                    task_id = %entry.id,
                    restarts,
                    window_secs = window.as_secs(),
                    "restart limit reached; giving up"
                );
                let detail = format!("{}; restart limit reached", outcome);
                self.set_status(&entry, TaskStatus::error(entry.id.clone(), detail));
            }
        }
    }

    fn schedule_restart(&self, id: TaskId, token: u64, delay: Duration) {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                Supervisor { inner }.auto_restart(&id, token).await;
            }
        });
    }

    async fn auto_restart(&self, id: &TaskId, token: u64) {
        let Some(entry) = self.lookup(id) else {
            return;
        };
        let mut runtime = entry.runtime.lock().await;
        if runtime.pending_restart != Some(token) {
            return;
        }
        runtime.pending_restart = None;
        tracing::info!(task_id = %id, "auto-restarting task");
        if let Err(err) = self.start_locked(&entry, &mut runtime).await {
            tracing::warn!(task_id = %id, error = %err, "auto-restart failed");
        }
    }

    /// Status changes are published under the status lock, so every
    /// subscriber sees one task's transitions in the order they happened.
    fn set_status(&self, entry: &TaskEntry, status: TaskStatus) -> TaskView {
        let mut current = entry.status.write();
        *current = status;
        let view = entry.view_with(&current);
        self.publish_status(&view);
        view
    }

    fn publish_current(&self, entry: &TaskEntry) -> TaskView {
        let status = entry.status.read();
        let view = entry.view_with(&status);
        self.publish_status(&view);
        view
    }

    fn publish_status(&self, view: &TaskView) {
        self.inner.hub.publish(SupervisorEvent::Status {
            id: view.config.id.clone(),
            view: view.clone(),
        });
    }

    fn next_generation(&self) -> u64 {
        self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Write the current task set to the store. The in-memory change stands
    /// even when this fails.
    fn persist(&self) -> Result<(), SupervisorError> {
        let _guard = self.inner.persist_lock.lock();
        let mut configs: Vec<TaskConfig> = self
            .inner
            .tasks
            .read()
            .values()
            .map(|entry| entry.config.read().clone())
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        self.inner.store.save(&configs).map_err(|err| {
            tracing::warn!(error = %err, "failed to persist tasks");
            SupervisorError::from(err)
        })
    }
}

async fn reap_loop(inner: Weak<Inner>, mut notices: mpsc::UnboundedReceiver<ExitNotice>) {
    while let Some(notice) = notices.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let supervisor = Supervisor { inner };
        tokio::spawn(async move { supervisor.handle_exit(notice).await });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for entry in self.tasks.get_mut().values() {
            if let Ok(runtime) = entry.runtime.try_lock() {
                if let Some(instance) = runtime.instance.as_ref() {
                    tracing::debug!(task_id = %entry.id, "killing task on supervisor drop");
                    instance.kill();
                }
            }
        }
        self.hub.close();
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

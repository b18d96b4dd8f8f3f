//! One running incarnation of a task: its PTY, its process and the two
//! OS threads that service them.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};

use crate::events::{EventHub, SupervisorEvent};
use crate::pty::{self, ExitOutcome, PtyChannel, PtyError, PtyReader, ProcessHandle, SpawnSpec, TerminalSize};
use crate::scrollback::ScrollbackBuffer;
use crate::task::TaskId;

const READ_CHUNK: usize = 8192;
/// How long to wait for the reap after SIGKILL before reporting unknown.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sent by an instance's exit watcher once its process has been reaped.
#[derive(Debug)]
pub(crate) struct ExitNotice {
    pub id: TaskId,
    pub generation: u64,
}

pub(crate) struct LaunchContext {
    pub id: TaskId,
    pub generation: u64,
    pub spec: SpawnSpec,
    pub size: TerminalSize,
    pub scrollback: Arc<ScrollbackBuffer>,
    pub hub: Arc<EventHub>,
    pub notices: mpsc::UnboundedSender<ExitNotice>,
}

pub(crate) struct Instance {
    generation: u64,
    channel: Arc<PtyChannel>,
    process: ProcessHandle,
    exit: watch::Receiver<Option<ExitOutcome>>,
    reader_done: Option<oneshot::Receiver<()>>,
    started: Instant,
}

impl Instance {
    /// Open a PTY, spawn the command on it and start the reader and exit
    /// watcher threads.
    pub(crate) async fn launch(ctx: LaunchContext) -> Result<Self, PtyError> {
        let LaunchContext {
            id,
            generation,
            spec,
            size,
            scrollback,
            hub,
            notices,
        } = ctx;

        let (channel, reader, process, waiter) = tokio::task::spawn_blocking(move || {
            let (channel, slave) = PtyChannel::open(size)?;
            let reader = channel.take_reader()?;
            let (process, waiter) = pty::spawn(&spec, slave)?;
            Ok::<_, PtyError>((channel, reader, process, waiter))
        })
        .await
        .map_err(|err| PtyError::Setup { source: err.into() })??;

        let (exit_tx, exit_rx) = watch::channel(None);
        let watcher_id = id.clone();
        let watcher = thread::Builder::new()
            .name(format!("pty-exit-{}", id.short()))
            .spawn(move || {
                let outcome = waiter.wait();
                tracing::debug!(task_id = %watcher_id, generation, %outcome, "process reaped");
                let _ = exit_tx.send(Some(outcome));
                let _ = notices.send(ExitNotice {
                    id: watcher_id,
                    generation,
                });
            });
        if let Err(err) = watcher {
            let _ = process.kill();
            return Err(PtyError::Io(err));
        }

        let (done_tx, done_rx) = oneshot::channel();
        let reader_id = id.clone();
        let pump = thread::Builder::new()
            .name(format!("pty-reader-{}", id.short()))
            .spawn(move || {
                pump_output(reader, &reader_id, &scrollback, &hub);
                let _ = done_tx.send(());
            });
        if let Err(err) = pump {
            // The watcher reaps the child; its notice matches no instance.
            let _ = process.kill();
            return Err(PtyError::Io(err));
        }

        Ok(Self {
            generation,
            channel: Arc::new(channel),
            process,
            exit: exit_rx,
            reader_done: Some(done_rx),
            started: Instant::now(),
        })
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub(crate) fn channel(&self) -> &Arc<PtyChannel> {
        &self.channel
    }

    pub(crate) fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn exit_outcome(&self) -> Option<ExitOutcome> {
        self.exit.borrow().clone()
    }

    async fn wait_exit(&mut self, timeout: Duration) -> Option<ExitOutcome> {
        let waited = tokio::time::timeout(timeout, self.exit.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(outcome)) => outcome.clone(),
            _ => None,
        }
    }

    /// SIGTERM, then SIGKILL once `grace` elapses. Resolves after the reap.
    pub(crate) async fn stop(&mut self, grace: Duration) -> ExitOutcome {
        if let Some(outcome) = self.exit_outcome() {
            return outcome;
        }
        if let Err(err) = self.process.terminate() {
            tracing::warn!(pid = ?self.pid(), error = %err, "failed to send SIGTERM");
        }
        if let Some(outcome) = self.wait_exit(grace).await {
            return outcome;
        }

        tracing::warn!(pid = ?self.pid(), grace_ms = grace.as_millis() as u64, "grace period elapsed; killing process group");
        if let Err(err) = self.process.kill() {
            tracing::warn!(pid = ?self.pid(), error = %err, "failed to send SIGKILL");
        }
        match self.wait_exit(KILL_TIMEOUT).await {
            Some(outcome) => outcome,
            None => ExitOutcome::Unknown("process did not exit after SIGKILL".to_string()),
        }
    }

    /// Immediate SIGKILL, for when the supervisor itself goes away.
    pub(crate) fn kill(&self) {
        if let Err(err) = self.process.kill() {
            tracing::debug!(pid = ?self.pid(), error = %err, "kill on drop failed");
        }
    }

    /// Kill any leftover members of the process group, drain trailing
    /// output for at most `drain`, then close the PTY.
    pub(crate) async fn teardown(mut self, drain: Duration) {
        if let Err(err) = self.process.kill_group() {
            tracing::debug!(pid = ?self.pid(), error = %err, "failed to kill leftover process group");
        }
        if let Some(done) = self.reader_done.take() {
            if tokio::time::timeout(drain, done).await.is_err() {
                tracing::debug!(generation = self.generation, "output drain timed out");
            }
        }
        self.channel.close();
    }
}

fn pump_output(mut reader: PtyReader, id: &TaskId, scrollback: &ScrollbackBuffer, hub: &EventHub) {
    let mut buffer = [0u8; READ_CHUNK];
    loop {
        match reader.read_chunk(&mut buffer) {
            Ok(0) => break,
            Ok(count) => {
                let data: Arc<[u8]> = Arc::from(&buffer[..count]);
                scrollback.append_then(&data, || {
                    hub.publish(SupervisorEvent::Output {
                        id: id.clone(),
                        data: Arc::clone(&data),
                    })
                });
            }
            Err(err) => {
                tracing::debug!(task_id = %id, error = %err, "pty read failed");
                break;
            }
        }
    }
    tracing::debug!(task_id = %id, "output stream closed");
}

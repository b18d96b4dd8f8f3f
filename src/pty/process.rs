use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use portable_pty::{Child, ChildKiller};

use crate::pty::channel::PtySlave;
use crate::pty::command::{build_command, SpawnSpec};
use crate::pty::error::PtyError;

/// How many times a failed reap is retried before giving up.
pub const REAP_ATTEMPTS: u32 = 5;
const REAP_RETRY_DELAY: Duration = Duration::from_millis(50);

/// How a child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(u32),
    Signaled(String),
    /// The exit status could not be collected.
    Unknown(String),
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        matches!(self, ExitOutcome::Exited(0))
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Exited(code) => write!(f, "exited with code {}", code),
            ExitOutcome::Signaled(signal) => write!(f, "terminated by signal {}", signal),
            ExitOutcome::Unknown(reason) => write!(f, "exit status unknown: {}", reason),
        }
    }
}

/// Control handle of a spawned child: pid plus signalling.
pub struct ProcessHandle {
    pid: Option<u32>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exited: Arc<AtomicBool>,
}

/// Sole owner of the wait on a child's exit status.
pub struct ExitWaiter {
    child: Box<dyn Child + Send + Sync>,
    exited: Arc<AtomicBool>,
}

/// Launch `spec` with `slave` as its controlling terminal.
///
/// The slave is dropped once the child holds it, so the master sees end
/// of stream as soon as the child's side goes away.
pub fn spawn(spec: &SpawnSpec, slave: PtySlave) -> Result<(ProcessHandle, ExitWaiter), PtyError> {
    let spawn_error = |source: Box<dyn std::error::Error + Send + Sync>| PtyError::Spawn {
        command: spec.command.clone(),
        source,
    };

    let cmd = build_command(spec).map_err(|err| spawn_error(err.into()))?;
    let child = slave
        .spawn_command(cmd)
        .map_err(|err| spawn_error(err.into()))?;
    drop(slave);

    let exited = Arc::new(AtomicBool::new(false));
    let handle = ProcessHandle {
        pid: child.process_id(),
        killer: Mutex::new(child.clone_killer()),
        exited: Arc::clone(&exited),
    };
    Ok((handle, ExitWaiter { child, exited }))
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Ask the process group to exit (SIGTERM). No-op once reaped.
    pub fn terminate(&self) -> io::Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            return signal_group(pid, libc::SIGTERM);
        }
        self.killer.lock().kill()
    }

    /// Force the process group down (SIGKILL). No-op once reaped.
    pub fn kill(&self) -> io::Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            return signal_group(pid, libc::SIGKILL);
        }
        self.killer.lock().kill()
    }

    /// SIGKILL whatever is left of the process group, even after the
    /// leader has been reaped. Background jobs the shell left behind would
    /// otherwise keep the terminal open with nobody to collect them.
    pub fn kill_group(&self) -> io::Result<()> {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // SAFETY: kill(2) has no memory-safety preconditions.
            let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
            let err = io::Error::last_os_error();
            return if rc == 0 || err.raw_os_error() == Some(libc::ESRCH) {
                Ok(())
            } else {
                Err(err)
            };
        }
        self.kill()
    }
}

/// The child runs as a session leader, so its pid is also its process
/// group id; signalling the group reaches anything the shell started.
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pid = pid as libc::pid_t;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => {
            // No such group; fall back to the process itself.
            // SAFETY: as above.
            let rc = unsafe { libc::kill(pid, signal) };
            let err = io::Error::last_os_error();
            if rc == 0 || err.raw_os_error() == Some(libc::ESRCH) {
                Ok(())
            } else {
                Err(err)
            }
        }
        _ => Err(err),
    }
}

impl ExitWaiter {
    /// Block until the child exits and collect its status.
    pub fn wait(mut self) -> ExitOutcome {
        let mut last_error = String::new();
        for attempt in 0..REAP_ATTEMPTS {
            if attempt > 0 {
                thread::sleep(REAP_RETRY_DELAY);
            }
            match self.child.wait() {
                Ok(status) => {
                    self.exited.store(true, Ordering::SeqCst);
                    return match status.signal() {
                        Some(signal) => ExitOutcome::Signaled(signal.to_string()),
                        None => ExitOutcome::Exited(status.exit_code()),
                    };
                }
                Err(err) => {
                    tracing::debug!(attempt, error = %err, "failed to reap child");
                    last_error = err.to_string();
                }
            }
        }
        self.exited.store(true, Ordering::SeqCst);
        ExitOutcome::Unknown(last_error)
    }
}

use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::pty::TerminalSize;
use crate::supervisor::restart::RestartPolicy;

/// Runtime tunables of a [`Supervisor`](crate::Supervisor).
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Size of a task's first PTY, before any resize.
    pub default_size: TerminalSize,
    pub shell: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub scrollback_capacity: usize,
    /// Mirror scrollback to `<log_dir>/<id>.log` when set.
    pub log_dir: Option<PathBuf>,
    pub stop_grace: Duration,
    pub drain_timeout: Duration,
    pub event_queue_capacity: usize,
    pub restart: RestartPolicy,
}

/// Config defaults, except that history stays in memory. Embedders opt in
/// to a log directory explicitly.
impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            log_dir: None,
            ..Self::from(&Config::default())
        }
    }
}

impl From<&Config> for SupervisorSettings {
    fn from(config: &Config) -> Self {
        Self {
            default_size: TerminalSize::new(config.terminal.rows, config.terminal.cols),
            shell: config.terminal.shell.clone(),
            working_dir: config.terminal.working_dir.clone(),
            scrollback_capacity: config.scrollback.capacity_bytes,
            log_dir: config.log_dir(),
            stop_grace: Duration::from_millis(config.supervisor.stop_grace_ms),
            drain_timeout: Duration::from_millis(config.supervisor.drain_timeout_ms),
            event_queue_capacity: config.supervisor.event_queue_capacity,
            restart: RestartPolicy::from(&config.restart),
        }
    }
}

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub terminal: TerminalSection,
    #[serde(default)]
    pub scrollback: ScrollbackSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub restart: RestartSection,
    #[serde(default)]
    pub store: StoreSection,
}

/// Terminal defaults applied to every task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalSection {
    /// Initial PTY height (default: 24).
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Initial PTY width (default: 80).
    #[serde(default = "default_cols")]
    pub cols: u16,
    /// Shell used to run task commands (default: `sh`, or `cmd` on Windows).
    #[serde(default)]
    pub shell: Option<String>,
    /// Working directory of every task (default: the supervisor's own).
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrollbackSection {
    /// Bytes of history kept per task (default: 50000).
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: usize,
    /// Mirror history to `<log_dir>/<task id>.log` (default: true).
    #[serde(default = "default_persist")]
    pub persist: bool,
    /// Directory for mirrored history (default: `<data dir>/taskmux/logs`).
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSection {
    /// Time between SIGTERM and SIGKILL on stop (default: 3000).
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Upper bound on draining output after exit (default: 500).
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Events buffered per subscriber before output is dropped (default: 1024).
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

/// Auto-retry backoff and crash-loop limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartSection {
    /// First restart delay, doubled per consecutive crash (default: 500).
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// Cap on the restart delay (default: 30000).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Sliding window for counting restarts (default: 60).
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Restarts allowed inside the window before giving up (default: 5).
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Uptime after which the backoff resets (default: 10).
    #[serde(default = "default_stable_after_secs")]
    pub stable_after_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSection {
    /// Task list location (default: `<data dir>/taskmux/tasks.json`).
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_rows() -> u16 {
    24
}

fn default_cols() -> u16 {
    80
}

fn default_capacity_bytes() -> usize {
    50_000
}

fn default_persist() -> bool {
    true
}

fn default_stop_grace_ms() -> u64 {
    3000
}

fn default_drain_timeout_ms() -> u64 {
    500
}

fn default_event_queue_capacity() -> usize {
    1024
}

fn default_min_interval_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_restarts() -> u32 {
    5
}

fn default_stable_after_secs() -> u64 {
    10
}

impl Default for TerminalSection {
    fn default() -> Self {
        Self {
            rows: default_rows(),
            cols: default_cols(),
            shell: None,
            working_dir: None,
        }
    }
}

impl Default for ScrollbackSection {
    fn default() -> Self {
        Self {
            capacity_bytes: default_capacity_bytes(),
            persist: default_persist(),
            log_dir: None,
        }
    }
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            stop_grace_ms: default_stop_grace_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

impl Default for RestartSection {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            window_secs: default_window_secs(),
            max_restarts: default_max_restarts(),
            stable_after_secs: default_stable_after_secs(),
        }
    }
}

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Stable, caller-opaque task identifier.
///
/// Generated as a random UUID so an id is never handed out twice, even
/// after the task that owned it has been deleted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, used for thread names and compact listings.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identity and desired behavior of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: TaskId,
    /// Display label, not unique.
    pub name: String,
    /// Shell command line to execute.
    pub command: String,
    /// Free-form grouping label.
    #[serde(default)]
    pub tag: String,
    /// Restart automatically after an unexpected exit.
    #[serde(default)]
    pub auto_retry: bool,
    /// Overlay on top of the supervisor's own environment.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub env_vars: BTreeMap<String, String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Stopped,
    Running,
    Error,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Stopped => f.write_str("stopped"),
            TaskState::Running => f.write_str("running"),
            TaskState::Error => f.write_str("error"),
        }
    }
}

/// Runtime status of a task.
///
/// Only the supervisor constructs these. `pid` and `start_time` are set
/// exactly when the state is [`TaskState::Running`]; the constructors are
/// the only way to build a status, so the pairing cannot drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatus {
    id: TaskId,
    status: TaskState,
    pid: Option<u32>,
    /// Unix seconds.
    start_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl TaskStatus {
    pub(crate) fn stopped(id: TaskId) -> Self {
        Self {
            id,
            status: TaskState::Stopped,
            pid: None,
            start_time: None,
            detail: None,
        }
    }

    pub(crate) fn running(id: TaskId, pid: u32, start_time: u64) -> Self {
        Self {
            id,
            status: TaskState::Running,
            pid: Some(pid),
            start_time: Some(start_time),
            detail: None,
        }
    }

    pub(crate) fn error(id: TaskId, detail: impl Into<String>) -> Self {
        Self {
            id,
            status: TaskState::Error,
            pid: None,
            start_time: None,
            detail: Some(detail.into()),
        }
    }

    pub(crate) fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn state(&self) -> TaskState {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == TaskState::Running
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn start_time(&self) -> Option<u64> {
        self.start_time
    }

    /// Reason for the last transition, when there is one worth showing.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

/// Read-only projection handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskView {
    pub config: TaskConfig,
    pub status: TaskStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_status_carries_pid_and_start_time() {
        let status = TaskStatus::running(TaskId::from("a"), 42, 1_700_000_000);
        assert!(status.is_running());
        assert_eq!(status.pid(), Some(42));
        assert_eq!(status.start_time(), Some(1_700_000_000));
    }

    #[test]
    fn non_running_status_has_no_pid() {
        let stopped = TaskStatus::stopped(TaskId::from("a"));
        let error = TaskStatus::error(TaskId::from("a"), "exited with code 1");
        for status in [stopped, error] {
            assert!(status.pid().is_none());
            assert!(status.start_time().is_none());
        }
    }

    #[test]
    fn status_serializes_in_flat_shape() {
        let status = TaskStatus::running(TaskId::from("abc"), 7, 100);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["id"], "abc");
        assert_eq!(json["status"], "running");
        assert_eq!(json["pid"], 7);
        assert_eq!(json["start_time"], 100);
        assert!(json.get("detail").is_none());
    }

    #[test]
    fn config_accepts_null_env_vars() {
        let raw = r#"{"id":"x","name":"web","command":"npm run dev","tag":"fe","auto_retry":true,"env_vars":null}"#;
        let config: TaskConfig = serde_json::from_str(raw).unwrap();
        assert!(config.env_vars.is_empty());
        assert!(config.auto_retry);
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = TaskId::generate();
        let b = TaskId::generate();
        assert_ne!(a, b);
        assert_eq!(a.short().len(), 8);
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{TaskConfig, TaskId};

/// A task configuration field failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct InvalidTask {
    pub field: &'static str,
    pub reason: String,
}

impl InvalidTask {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Caller-supplied fields for creating or replacing a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDraft {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub auto_retry: bool,
    #[serde(default)]
    pub env_vars: Option<BTreeMap<String, String>>,
}

impl TaskDraft {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            tag: String::new(),
            auto_retry: false,
            env_vars: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_auto_retry(mut self, auto_retry: bool) -> Self {
        self.auto_retry = auto_retry;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Starting point for an edit of an existing task.
    pub fn from_config(config: &TaskConfig) -> Self {
        Self {
            name: config.name.clone(),
            command: config.command.clone(),
            tag: config.tag.clone(),
            auto_retry: config.auto_retry,
            env_vars: Some(config.env_vars.clone()),
        }
    }

    pub fn validate(&self) -> Result<(), InvalidTask> {
        if self.name.trim().is_empty() {
            return Err(InvalidTask::new("name", "must not be empty"));
        }
        if self.command.trim().is_empty() {
            return Err(InvalidTask::new("command", "must not be empty"));
        }
        if self.command.contains('\0') {
            return Err(InvalidTask::new("command", "must not contain NUL bytes"));
        }
        for (key, value) in self.env_vars.iter().flatten() {
            if key.is_empty() {
                return Err(InvalidTask::new("env_vars", "variable name must not be empty"));
            }
            if key.contains('=') || key.contains('\0') {
                return Err(InvalidTask::new(
                    "env_vars",
                    format!("variable name '{}' contains '=' or NUL", key),
                ));
            }
            if value.contains('\0') {
                return Err(InvalidTask::new(
                    "env_vars",
                    format!("value of '{}' contains NUL", key),
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn into_config(self, id: TaskId) -> TaskConfig {
        TaskConfig {
            id,
            name: self.name.trim().to_string(),
            command: self.command.trim().to_string(),
            tag: self.tag.trim().to_string(),
            auto_retry: self.auto_retry,
            env_vars: self.env_vars.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_draft_passes() {
        let draft = TaskDraft::new("web", "npm run dev")
            .with_tag("frontend")
            .with_env("PORT", "3000");
        assert!(draft.validate().is_ok());
    }

    #[test]
    fn blank_name_is_rejected() {
        let err = TaskDraft::new("   ", "ls").validate().unwrap_err();
        assert_eq!(err.field, "name");
    }

    #[test]
    fn blank_command_is_rejected() {
        let err = TaskDraft::new("web", "").validate().unwrap_err();
        assert_eq!(err.field, "command");
    }

    #[test]
    fn env_key_with_equals_is_rejected() {
        let err = TaskDraft::new("web", "ls")
            .with_env("A=B", "1")
            .validate()
            .unwrap_err();
        assert_eq!(err.field, "env_vars");
    }

    #[test]
    fn into_config_trims_and_defaults_env() {
        let config = TaskDraft::new("  web ", " npm start ").into_config(TaskId::from("id"));
        assert_eq!(config.name, "web");
        assert_eq!(config.command, "npm start");
        assert!(config.env_vars.is_empty());
    }
}

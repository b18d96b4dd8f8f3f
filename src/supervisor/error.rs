use thiserror::Error;

use crate::pty::PtyError;
use crate::store::StoreError;
use crate::task::{InvalidTask, TaskId};

/// Errors returned by [`Supervisor`](crate::Supervisor) operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("task {id} not found")]
    NotFound { id: TaskId },

    #[error(transparent)]
    Validation(#[from] InvalidTask),

    #[error("task {id}: {source}")]
    Allocation {
        id: TaskId,
        #[source]
        source: PtyError,
    },

    /// `source` is the [`PtyError::Spawn`] that already names the command.
    #[error("task {id}: {source}")]
    Spawn {
        id: TaskId,
        command: String,
        #[source]
        source: PtyError,
    },

    #[error("task {id} is not running")]
    NotRunning { id: TaskId },

    #[error("task {id}: {source}")]
    Io {
        id: TaskId,
        #[source]
        source: PtyError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("supervisor is shutting down")]
    ShuttingDown,
}

impl SupervisorError {
    pub(crate) fn not_found(id: &TaskId) -> Self {
        SupervisorError::NotFound { id: id.clone() }
    }

    /// Classify a launch failure by the layer it came from.
    pub(crate) fn launch(id: &TaskId, err: PtyError) -> Self {
        let id = id.clone();
        if let PtyError::Spawn { command, .. } = &err {
            let command = command.clone();
            return SupervisorError::Spawn {
                id,
                command,
                source: err,
            };
        }
        match err {
            err @ PtyError::Allocation { .. } => SupervisorError::Allocation { id, source: err },
            err => SupervisorError::Io { id, source: err },
        }
    }
}

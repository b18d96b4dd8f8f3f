use std::io;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by the pseudo-terminal and process layer.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to allocate pseudo-terminal: {source}")]
    Allocation {
        #[source]
        source: BoxError,
    },

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: BoxError,
    },

    #[error("pseudo-terminal is closed")]
    Closed,

    #[error("failed to resize pseudo-terminal to {rows}x{cols}: {source}")]
    Resize {
        rows: u16,
        cols: u16,
        #[source]
        source: BoxError,
    },

    #[error("pseudo-terminal I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("pseudo-terminal setup failed: {source}")]
    Setup {
        #[source]
        source: BoxError,
    },
}

impl PtyError {
    pub(crate) fn setup(err: anyhow::Error) -> Self {
        PtyError::Setup { source: err.into() }
    }
}

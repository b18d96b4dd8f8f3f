//! Pseudo-terminal pairs and the child processes bound to them.

mod channel;
mod command;
mod error;
mod process;
mod resize;

pub use channel::{PtyChannel, PtyReader, PtySlave, TerminalSize};
pub use command::{shell_invocation, SpawnSpec};
pub use error::{BoxError, PtyError};
pub use process::{spawn, ExitOutcome, ExitWaiter, ProcessHandle, REAP_ATTEMPTS};
pub use resize::ResizeWatcher;

//! Local task supervisor with attached interactive terminals.
//!
//! A [`Supervisor`] owns a set of user-defined commands, runs each one inside
//! its own pseudo-terminal, keeps a bounded scrollback per task, and fans
//! status and output events out to any number of observers.

pub mod cli;
pub mod config;
pub mod events;
pub mod logging;
pub mod pty;
pub mod scrollback;
pub mod shutdown;
pub mod store;
pub mod supervisor;
pub mod task;

pub use events::{EventFilter, EventHub, Subscription, SupervisorEvent};
pub use supervisor::{Attachment, Resize, Supervisor, SupervisorError, SupervisorSettings};
pub use task::{TaskConfig, TaskDraft, TaskId, TaskState, TaskStatus, TaskView};

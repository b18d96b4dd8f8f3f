//! Task records: durable configuration plus derived runtime status.

mod draft;
mod types;

pub use draft::{InvalidTask, TaskDraft};
pub use types::{TaskConfig, TaskId, TaskState, TaskStatus, TaskView};

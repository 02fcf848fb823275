//! Upload task lifecycle: the task record and the registry that owns it.

pub mod registry;
pub mod types;

pub use registry::{Subscription, TaskListener, TaskRegistry};
pub use types::{NewTask, TaskEvent, TaskEventKind, TaskPatch, TaskStats, TaskStatus, UploadTask};

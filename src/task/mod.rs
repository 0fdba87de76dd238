//! Task module - delegating work to child sessions and collecting results.
//!
//! - `oracle`: decides when a task session has finished
//! - `harvest`: turns the newest turn of a task into an injectable bundle
//! - `launcher`: creates and runs task sessions
//! - `cancel`: aborts running tasks
//! - `registry`: last known status per task, terminal states sticky
//!
//! Pure functions (`latest_turn`, `build_bundle`, `branch_context`,
//! `sibling_table`) are kept apart from the IO-bound components.

pub mod cancel;
pub mod error;
pub mod harvest;
pub mod launcher;
pub mod oracle;
pub mod registry;
mod types;

pub use cancel::CancellationController;
pub use error::{ErrorCode, SessionContext, TaskError, TaskOutcome};
pub use harvest::{build_bundle, latest_turn, BundleInfo, OutputBundle, ResultHarvester};
pub use launcher::{branch_context, sibling_table, TaskLauncher, COMPLETED_POINTER};
pub use oracle::CompletionOracle;
pub use registry::TaskRegistry;
pub use types::{CreateTaskRequest, TaskMode, TaskResult, TaskStatus};

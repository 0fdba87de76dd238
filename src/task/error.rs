//! Task error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::TaskResult;

/// Machine-readable failure code carried by `failed` results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AgentNotFound,
    SessionError,
    Timeout,
    Cancelled,
    ConcurrencyLimit,
    TaskNotFound,
    AlreadyCompleted,
    InvalidArgument,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentNotFound => "AGENT_NOT_FOUND",
            Self::SessionError => "SESSION_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::ConcurrencyLimit => "CONCURRENCY_LIMIT",
            Self::TaskNotFound => "TASK_NOT_FOUND",
            Self::AlreadyCompleted => "ALREADY_COMPLETED",
            Self::InvalidArgument => "INVALID_ARGUMENT",
        }
    }

    /// Local precondition violations, as opposed to host or timing failures.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::TaskNotFound | Self::AlreadyCompleted | Self::InvalidArgument
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// A Session Service call failed. `step` names what was being attempted.
    #[error("Failed to {step} (session {session_id}): {source:#}")]
    Session {
        step: &'static str,
        session_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Task {task_id} timed out after {timeout_ms}ms; abort requested")]
    Timeout { task_id: String, timeout_ms: u64 },

    #[error("Task {0} was cancelled")]
    Cancelled(String),

    #[error("Concurrency limit reached: {active} active tasks (max {max})")]
    ConcurrencyLimit { active: usize, max: usize },

    #[error("Task {0} not found among this session's children or siblings")]
    TaskNotFound(String),

    #[error("Task {task_id} {reason}")]
    AlreadyCompleted {
        task_id: String,
        reason: &'static str,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type TaskOutcome<T> = Result<T, TaskError>;

impl TaskError {
    pub fn session(step: &'static str, session_id: &str, err: anyhow::Error) -> Self {
        Self::Session {
            step,
            session_id: session_id.to_string(),
            source: err,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AgentNotFound(_) => ErrorCode::AgentNotFound,
            Self::Session { .. } => ErrorCode::SessionError,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Cancelled(_) => ErrorCode::Cancelled,
            Self::ConcurrencyLimit { .. } => ErrorCode::ConcurrencyLimit,
            Self::TaskNotFound(_) => ErrorCode::TaskNotFound,
            Self::AlreadyCompleted { .. } => ErrorCode::AlreadyCompleted,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
        }
    }

    /// Convert into the `failed` result handed back to the calling agent.
    pub fn into_result(self, task_id: Option<String>) -> TaskResult {
        let task_id = task_id.or_else(|| match &self {
            Self::Timeout { task_id, .. } | Self::AlreadyCompleted { task_id, .. } => {
                Some(task_id.clone())
            }
            Self::Cancelled(id) | Self::TaskNotFound(id) => Some(id.clone()),
            _ => None,
        });
        TaskResult::Failed {
            task_id,
            error: self.to_string(),
            code: self.code(),
        }
    }
}

/// Anything that can be attributed to a step on a session.
pub trait SessionContext<T> {
    fn session_step(self, step: &'static str, session_id: &str) -> TaskOutcome<T>;
}

impl<T> SessionContext<T> for anyhow::Result<T> {
    fn session_step(self, step: &'static str, session_id: &str) -> TaskOutcome<T> {
        self.map_err(|e| TaskError::session(step, session_id, e))
    }
}

//! Task status and the results handed back to calling agents.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::ErrorCode;

/// Status of a delegated task.
///
/// `Completed` and `Cancelled` are terminal; a task never leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return *self == next;
        }
        true
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result returned by every task operation, discriminated by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskResult {
    Completed {
        task_id: String,
        title: String,
        agent: String,
        result: String,
    },
    Failed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        error: String,
        code: ErrorCode,
    },
    Running {
        task_id: String,
        title: String,
    },
    Cancelled {
        task_id: String,
    },
    /// A follow-up message reached the task.
    Delivered {
        task_id: String,
        no_reply: bool,
    },
}

impl TaskResult {
    /// Task lifecycle status this result reports, if any.
    pub fn status(&self) -> Option<TaskStatus> {
        match self {
            Self::Completed { .. } => Some(TaskStatus::Completed),
            Self::Failed { .. } => Some(TaskStatus::Failed),
            Self::Running { .. } => Some(TaskStatus::Running),
            Self::Cancelled { .. } => Some(TaskStatus::Cancelled),
            Self::Delivered { .. } => None,
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::Completed { task_id, .. }
            | Self::Running { task_id, .. }
            | Self::Cancelled { task_id }
            | Self::Delivered { task_id, .. } => Some(task_id),
            Self::Failed { task_id, .. } => task_id.as_deref(),
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Failed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Whether `create` waits for the task's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    Sync,
    Async,
}

/// Parameters for launching a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTaskRequest {
    pub title: String,
    pub agent: String,
    pub prompt: String,
    pub mode: TaskMode,
    pub timeout: Option<Duration>,
    pub work_dir: Option<String>,
}

impl CreateTaskRequest {
    pub fn new(
        title: impl Into<String>,
        agent: impl Into<String>,
        prompt: impl Into<String>,
        mode: TaskMode,
    ) -> Self {
        Self {
            title: title.into(),
            agent: agent.into(),
            prompt: prompt.into(),
            mode,
            timeout: None,
            work_dir: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn work_dir(mut self, work_dir: impl Into<String>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }
}

//! Cancelling running tasks.

use std::sync::Arc;

use super::error::{TaskError, TaskOutcome};
use super::oracle::CompletionOracle;
use super::types::TaskResult;
use crate::opencode::{SessionRef, SessionService};

#[derive(Clone)]
pub struct CancellationController {
    service: Arc<dyn SessionService>,
    oracle: CompletionOracle,
}

impl CancellationController {
    pub fn new(service: Arc<dyn SessionService>, oracle: CompletionOracle) -> Self {
        Self { service, oracle }
    }

    /// Abort `task`. A task that has already finished, or that finishes
    /// while the abort is in flight, yields `AlreadyCompleted` rather than a
    /// transport error.
    pub async fn cancel(&self, task: &SessionRef) -> TaskOutcome<TaskResult> {
        if self.oracle.is_complete(&task.id).await? {
            return Err(TaskError::AlreadyCompleted {
                task_id: task.id.clone(),
                reason: "already completed",
            });
        }

        if let Err(abort_err) = self.service.abort(&task.id).await {
            if let Ok(true) = self.oracle.is_complete(&task.id).await {
                return Err(TaskError::AlreadyCompleted {
                    task_id: task.id.clone(),
                    reason: "completed before cancellation",
                });
            }
            return Err(TaskError::session("abort task", &task.id, abort_err));
        }

        tracing::info!(task_id = %task.id, "Cancelled task");
        Ok(TaskResult::Cancelled {
            task_id: task.id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollConfig;
    use crate::task::error::ErrorCode;
    use crate::testing::FakeSessionService;

    fn controller(fake: &Arc<FakeSessionService>) -> CancellationController {
        let service: Arc<dyn SessionService> = fake.clone();
        CancellationController::new(
            service.clone(),
            CompletionOracle::new(service, PollConfig::default()),
        )
    }

    fn running_task(fake: &FakeSessionService) -> SessionRef {
        let task = fake.add_session("ses_t", Some("ses_p"), "/w", "scan");
        fake.user_text("ses_t", "go");
        fake.assistant_text("ses_t", "working");
        fake.set_status("ses_t", "busy");
        task
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let fake = FakeSessionService::new();
        let task = running_task(&fake);

        let result = controller(&fake).cancel(&task).await.unwrap();

        assert_eq!(result, TaskResult::Cancelled { task_id: "ses_t".into() });
        assert_eq!(fake.state().aborts, vec!["ses_t".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_idle_task_is_precondition_failure() {
        let fake = FakeSessionService::new();
        let task = running_task(&fake);
        fake.set_status("ses_t", "idle");

        let err = controller(&fake).cancel(&task).await.unwrap_err();

        assert_eq!(err.code(), ErrorCode::AlreadyCompleted);
        assert!(err.to_string().contains("already completed"));
        assert!(fake.state().aborts.is_empty());
    }

    #[tokio::test]
    async fn test_abort_failure_is_session_error() {
        let fake = FakeSessionService::new();
        let task = running_task(&fake);
        fake.fail("abort", "ses_t");

        let err = controller(&fake).cancel(&task).await.unwrap_err();

        assert_eq!(err.code(), ErrorCode::SessionError);
    }

    #[tokio::test]
    async fn test_abort_failure_racing_completion() {
        let fake = FakeSessionService::new();
        let task = running_task(&fake);
        fake.fail("abort", "ses_t");
        fake.state().idle_on_failed_abort = true;

        let err = controller(&fake).cancel(&task).await.unwrap_err();

        assert_eq!(err.code(), ErrorCode::AlreadyCompleted);
        assert!(err.to_string().contains("completed before cancellation"));
    }
}

//! One-shot notices to a parent session when one of its async tasks goes
//! idle or fails.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::cache::DeliveryCache;
use crate::delivery;
use crate::opencode::{PartInput, SessionEvent, SessionService};
use crate::task::{TaskRegistry, TaskStatus};

/// An async task whose parent should hear about its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedTask {
    pub task_id: String,
    pub parent_id: String,
    pub title: String,
    pub agent: String,
}

pub struct CompletionNotifier {
    service: Arc<dyn SessionService>,
    cache: Arc<DeliveryCache>,
    registry: Arc<TaskRegistry>,
    watched: Mutex<HashMap<String, WatchedTask>>,
    capacity: usize,
}

impl CompletionNotifier {
    pub fn new(
        service: Arc<dyn SessionService>,
        cache: Arc<DeliveryCache>,
        registry: Arc<TaskRegistry>,
        capacity: usize,
    ) -> Self {
        Self {
            service,
            cache,
            registry,
            watched: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn notice_key(task_id: &str) -> String {
        format!("notice:{}", task_id)
    }

    pub fn watch(&self, task: WatchedTask) {
        let mut watched = match self.watched.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if watched.len() >= self.capacity && !watched.contains_key(&task.task_id) {
            tracing::warn!(
                task_id = %task.task_id,
                "Too many watched tasks, completion notice disabled for this task"
            );
            return;
        }
        // A new turn deserves a new notice
        self.cache.remove(&Self::notice_key(&task.task_id));
        watched.insert(task.task_id.clone(), task);
    }

    pub fn is_watching(&self, task_id: &str) -> bool {
        match self.watched.lock() {
            Ok(guard) => guard.contains_key(task_id),
            Err(poisoned) => poisoned.into_inner().contains_key(task_id),
        }
    }

    fn lookup(&self, task_id: &str) -> Option<WatchedTask> {
        match self.watched.lock() {
            Ok(guard) => guard.get(task_id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(task_id).cloned(),
        }
    }

    /// Stop reporting on `task_id`, e.g. once it has been cancelled.
    pub fn unwatch(&self, task_id: &str) {
        match self.watched.lock() {
            Ok(mut guard) => {
                guard.remove(task_id);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(task_id);
            }
        }
    }

    /// Handle one host event. Returns true when a notice was injected.
    pub async fn handle(&self, event: &SessionEvent) -> bool {
        let Some(task) = self.lookup(event.session_id()) else {
            return false;
        };
        let next = match event {
            SessionEvent::Idle { .. } => TaskStatus::Completed,
            SessionEvent::Error { .. } => TaskStatus::Failed,
        };
        if !self.registry.transition(&task.task_id, next) {
            tracing::debug!(task_id = %task.task_id, "Task already settled, no notice");
            self.unwatch(&task.task_id);
            return false;
        }

        let key = Self::notice_key(&task.task_id);
        if !self.cache.insert(&key) {
            return false;
        }

        let notice = match event {
            SessionEvent::Idle { .. } => format!(
                "[Background task completed] \"{}\" ({}, agent {}). \
                 Call get_task_output with task_id \"{}\" to retrieve its result.",
                task.title, task.task_id, task.agent, task.task_id
            ),
            SessionEvent::Error { message, .. } => format!(
                "[Background task failed] \"{}\" ({}, agent {}): {}",
                task.title, task.task_id, task.agent, message
            ),
        };

        match delivery::inject(
            self.service.as_ref(),
            &task.parent_id,
            vec![PartInput::synthetic(notice)],
        )
        .await
        {
            Ok(()) => {
                tracing::info!(task_id = %task.task_id, parent_id = %task.parent_id, "Notified parent of task outcome");
                self.unwatch(&task.task_id);
                true
            }
            Err(e) => {
                tracing::warn!(task_id = %task.task_id, "Failed to notify parent: {:#}", e);
                self.cache.remove(&key);
                false
            }
        }
    }

    /// Consume host events until the channel closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(&event).await;
        }
        tracing::debug!("Session event stream closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSessionService;
    use std::time::Duration;

    fn setup() -> (Arc<FakeSessionService>, CompletionNotifier) {
        let fake = FakeSessionService::new();
        fake.add_session("ses_p", None, "/w", "root");
        fake.user_text("ses_p", "delegate please");
        let cache = Arc::new(DeliveryCache::new(16, Duration::from_secs(60)));
        let registry = Arc::new(TaskRegistry::new(16));
        let notifier = CompletionNotifier::new(fake.clone(), cache, registry, 16);
        notifier.watch(WatchedTask {
            task_id: "ses_t".into(),
            parent_id: "ses_p".into(),
            title: "scan".into(),
            agent: "explorer".into(),
        });
        (fake, notifier)
    }

    #[tokio::test]
    async fn test_idle_notifies_once() {
        let (fake, notifier) = setup();
        let idle = SessionEvent::Idle {
            session_id: "ses_t".into(),
        };

        assert!(notifier.handle(&idle).await);
        assert!(!notifier.handle(&idle).await);

        let messages = fake.messages_of("ses_p");
        assert_eq!(messages.len(), 2);
        assert!(messages[1].is_synthetic());
        assert!(messages[1].text().contains("get_task_output"));
        assert!(!notifier.is_watching("ses_t"));
    }

    #[tokio::test]
    async fn test_unwatched_sessions_ignored() {
        let (fake, notifier) = setup();
        let idle = SessionEvent::Idle {
            session_id: "ses_other".into(),
        };
        assert!(!notifier.handle(&idle).await);
        assert_eq!(fake.messages_of("ses_p").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_can_retry() {
        let (fake, notifier) = setup();
        fake.fail("prompt", "ses_p");
        let error = SessionEvent::Error {
            session_id: "ses_t".into(),
            message: "provider down".into(),
        };

        assert!(!notifier.handle(&error).await);
        fake.state().failures.clear();
        assert!(notifier.handle(&error).await);
        assert!(fake.messages_of("ses_p")[1].text().contains("provider down"));
    }

    #[tokio::test]
    async fn test_cancelled_task_gets_no_completion_notice() {
        let (fake, notifier) = setup();
        notifier.registry.transition("ses_t", TaskStatus::Cancelled);

        let idle = SessionEvent::Idle {
            session_id: "ses_t".into(),
        };
        assert!(!notifier.handle(&idle).await);
        assert_eq!(fake.messages_of("ses_p").len(), 1);
        assert!(!notifier.is_watching("ses_t"));
    }

    #[tokio::test]
    async fn test_unwatch_stops_notices() {
        let (fake, notifier) = setup();
        notifier.unwatch("ses_t");

        let idle = SessionEvent::Idle {
            session_id: "ses_t".into(),
        };
        assert!(!notifier.handle(&idle).await);
        assert_eq!(fake.messages_of("ses_p").len(), 1);
    }
}

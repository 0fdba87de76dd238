//! Completion detection for task sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::error::{SessionContext, TaskOutcome};
use crate::config::PollConfig;
use crate::opencode::{Role, SessionService};

/// Decides whether a session has finished producing output.
#[derive(Clone)]
pub struct CompletionOracle {
    service: Arc<dyn SessionService>,
    poll: PollConfig,
}

impl CompletionOracle {
    pub fn new(service: Arc<dyn SessionService>, poll: PollConfig) -> Self {
        Self { service, poll }
    }

    /// A session is complete when it holds more than the kickoff message,
    /// its newest message is an assistant reply or synthetic, and the host
    /// reports it idle or no longer tracks it.
    pub async fn is_complete(&self, session_id: &str) -> TaskOutcome<bool> {
        let messages = self
            .service
            .messages(session_id, None)
            .await
            .session_step("load task messages", session_id)?;

        // A freshly created session may not have its reply yet
        if messages.len() <= 1 {
            return Ok(false);
        }

        let Some(latest) = messages
            .iter()
            .enumerate()
            .max_by_key(|(idx, m)| (m.created(), *idx))
            .map(|(_, m)| m)
        else {
            return Ok(false);
        };
        if latest.role() != Role::Assistant && !latest.is_synthetic() {
            return Ok(false);
        }

        let status = self
            .service
            .status()
            .await
            .session_step("read session status", session_id)?;
        Ok(status.get(session_id).map_or(true, |s| s.is_idle()))
    }

    /// Poll until complete or until `max(timeout, floor)` elapses.
    ///
    /// Never errors: host failures while polling count as "not yet".
    pub async fn wait(&self, session_id: &str, timeout: Duration) -> bool {
        let budget = self.poll.budget(timeout);
        let deadline = Instant::now() + budget;
        tokio::time::timeout(budget, self.poll_until_complete(session_id, deadline))
            .await
            .unwrap_or(false)
    }

    async fn poll_until_complete(&self, session_id: &str, deadline: Instant) -> bool {
        let mut interval = self.poll.initial_interval();
        loop {
            match self.is_complete(session_id).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => tracing::debug!(session_id, error = %e, "Completion check failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
            interval = self.poll.next_interval(interval);
        }
    }
}

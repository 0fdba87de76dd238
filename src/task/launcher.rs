//! Launching task sessions.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::error::{SessionContext, TaskError, TaskOutcome};
use super::harvest::ResultHarvester;
use super::oracle::CompletionOracle;
use super::registry::TaskRegistry;
use super::types::{CreateTaskRequest, TaskMode, TaskResult, TaskStatus};
use crate::cache::DeliveryCache;
use crate::config::Config;
use crate::delivery;
use crate::notifier::{CompletionNotifier, WatchedTask};
use crate::opencode::{PartInput, PromptRequest, SessionRef, SessionService};

/// Pointer returned instead of the output itself, which arrives as the
/// caller's next message.
pub const COMPLETED_POINTER: &str = "Task completed. See the next message for its output.";

#[derive(Clone)]
pub struct TaskLauncher {
    service: Arc<dyn SessionService>,
    oracle: CompletionOracle,
    harvester: ResultHarvester,
    cache: Arc<DeliveryCache>,
    registry: Arc<TaskRegistry>,
    notifier: Option<Arc<CompletionNotifier>>,
    config: Arc<Config>,
}

impl TaskLauncher {
    pub fn new(
        service: Arc<dyn SessionService>,
        oracle: CompletionOracle,
        harvester: ResultHarvester,
        cache: Arc<DeliveryCache>,
        registry: Arc<TaskRegistry>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            service,
            oracle,
            harvester,
            cache,
            registry,
            notifier: None,
            config,
        }
    }

    /// Report async task outcomes to their caller through `notifier`.
    pub fn with_notifier(mut self, notifier: Arc<CompletionNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Create a task session as a child of `caller` and run it.
    pub async fn create(&self, caller: &SessionRef, request: CreateTaskRequest) -> TaskResult {
        let (task, prompt) = match self.prepare(caller, &request).await {
            Ok(prepared) => prepared,
            Err(e) => return e.into_result(None),
        };
        tracing::info!(
            task_id = %task.id,
            caller_id = %caller.id,
            agent = %request.agent,
            mode = ?request.mode,
            "Created task session"
        );

        let outcome = match request.mode {
            TaskMode::Async => Ok(self.dispatch_async(caller, &task, &request, prompt)),
            TaskMode::Sync => self.run_sync(caller, &task, &request, prompt).await,
        };
        outcome.unwrap_or_else(|e| e.into_result(Some(task.id.clone())))
    }

    /// Validate, admit, create the session and build the enriched prompt.
    async fn prepare(
        &self,
        caller: &SessionRef,
        request: &CreateTaskRequest,
    ) -> TaskOutcome<(SessionRef, PromptRequest)> {
        if request.title.trim().is_empty() {
            return Err(TaskError::InvalidArgument("title must not be empty".into()));
        }
        if request.prompt.trim().is_empty() {
            return Err(TaskError::InvalidArgument("prompt must not be empty".into()));
        }

        let agents = self
            .service
            .agents()
            .await
            .session_step("list agents", &caller.id)?;
        if !agents.iter().any(|a| a.name == request.agent) {
            return Err(TaskError::AgentNotFound(request.agent.clone()));
        }

        let active = self.active_children(caller).await?;
        if let Some(max) = self.config.max_active_tasks {
            if active.len() >= max {
                return Err(TaskError::ConcurrencyLimit {
                    active: active.len(),
                    max,
                });
            }
        }

        let directory = request
            .work_dir
            .clone()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| caller.directory.clone());
        let task = self
            .service
            .create_session(Some(&caller.id), &request.title, &directory)
            .await
            .session_step("create task session", &caller.id)?;

        let mut parts = Vec::new();
        if let Some(block) = branch_context(&task.directory, &caller.directory) {
            parts.push(PartInput::synthetic(block));
        }
        if let Some(block) = sibling_table(&active, &self.agents_of(&active).await) {
            parts.push(PartInput::synthetic(block));
        }
        parts.push(PartInput::text(request.prompt.clone()));

        let prompt = PromptRequest::new(parts).agent(Some(request.agent.clone()));
        Ok((task, prompt))
    }

    /// Children of `caller` the host reports as busy.
    async fn active_children(&self, caller: &SessionRef) -> TaskOutcome<Vec<SessionRef>> {
        let children = self
            .service
            .children(&caller.id)
            .await
            .session_step("list child sessions", &caller.id)?;
        if children.is_empty() {
            return Ok(children);
        }
        let status = self
            .service
            .status()
            .await
            .session_step("read session status", &caller.id)?;
        Ok(children
            .into_iter()
            .filter(|c| status.get(&c.id).map_or(false, |s| !s.is_idle()))
            .collect())
    }

    /// Agent names for the sibling table. Unknown agents render as `?`.
    async fn agents_of(&self, sessions: &[SessionRef]) -> Vec<String> {
        let mut agents = Vec::with_capacity(sessions.len());
        for session in sessions {
            let agent = delivery::resolve_identity(self.service.as_ref(), &session.id)
                .await
                .ok()
                .and_then(|identity| identity.agent)
                .unwrap_or_else(|| "?".to_string());
            agents.push(agent);
        }
        agents
    }

    fn dispatch_async(
        &self,
        caller: &SessionRef,
        task: &SessionRef,
        request: &CreateTaskRequest,
        prompt: PromptRequest,
    ) -> TaskResult {
        if let Some(notifier) = &self.notifier {
            notifier.watch(WatchedTask {
                task_id: task.id.clone(),
                parent_id: caller.id.clone(),
                title: task.title.clone(),
                agent: request.agent.clone(),
            });
        }

        let service = self.service.clone();
        let registry = self.registry.clone();
        let notifier = self.notifier.clone();
        let notify = self.config.notify_start_failures;
        let task_id = task.id.clone();
        let title = task.title.clone();
        let caller_id = caller.id.clone();
        tokio::spawn(async move {
            let Err(e) = service.prompt_async(&task_id, prompt).await else {
                return;
            };
            tracing::warn!(task_id = %task_id, "Failed to start async task: {:#}", e);
            registry.transition(&task_id, TaskStatus::Failed);
            if let Some(notifier) = &notifier {
                notifier.unwatch(&task_id);
            }
            if !notify {
                return;
            }
            let notice = format!(
                "[Background task failed to start] \"{}\" ({}): {:#}",
                title, task_id, e
            );
            if let Err(e) =
                delivery::inject(service.as_ref(), &caller_id, vec![PartInput::synthetic(notice)])
                    .await
            {
                tracing::warn!(task_id = %task_id, "Failed to report start failure: {:#}", e);
            }
        });

        TaskResult::Running {
            task_id: task.id.clone(),
            title: task.title.clone(),
        }
    }

    async fn run_sync(
        &self,
        caller: &SessionRef,
        task: &SessionRef,
        request: &CreateTaskRequest,
        prompt: PromptRequest,
    ) -> TaskOutcome<TaskResult> {
        let started = Instant::now();
        let round_trip = self.service.prompt(&task.id, prompt);

        match request.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, round_trip).await {
                Ok(result) => result.session_step("prompt task", &task.id)?,
                Err(_) => return Err(self.abort_after_timeout(&task.id, timeout).await),
            },
            None => round_trip.await.session_step("prompt task", &task.id)?,
        }

        let remaining = match request.timeout {
            Some(timeout) => timeout.saturating_sub(started.elapsed()),
            None => self.config.default_timeout(),
        };
        if !self.oracle.wait(&task.id, remaining).await {
            let timeout = request.timeout.unwrap_or_else(|| self.config.default_timeout());
            return Err(self.abort_after_timeout(&task.id, timeout).await);
        }
        if !self.registry.transition(&task.id, TaskStatus::Completed) {
            return Err(TaskError::Cancelled(task.id.clone()));
        }

        let bundle = self.harvester.fetch(task).await?;
        let key = bundle.delivery_key();
        self.cache.insert(&key);
        if let Err(e) = delivery::inject(self.service.as_ref(), &caller.id, bundle.parts).await {
            self.cache.remove(&key);
            return Err(TaskError::session("deliver task output", &caller.id, e));
        }

        Ok(TaskResult::Completed {
            task_id: task.id.clone(),
            title: task.title.clone(),
            agent: request.agent.clone(),
            result: COMPLETED_POINTER.to_string(),
        })
    }

    /// Best-effort abort; the task may still produce output afterwards.
    async fn abort_after_timeout(&self, task_id: &str, timeout: Duration) -> TaskError {
        tracing::warn!(task_id, timeout_ms = timeout.as_millis() as u64, "Task timed out, aborting");
        if let Some(notifier) = &self.notifier {
            notifier.unwatch(task_id);
        }
        self.registry.transition(task_id, TaskStatus::Failed);
        if let Err(e) = self.service.abort(task_id).await {
            tracing::warn!(task_id, "Failed to abort timed-out task: {:#}", e);
        }
        TaskError::Timeout {
            task_id: task_id.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

/// Context block for a task running outside its caller's directory.
pub fn branch_context(task_dir: &str, parent_dir: &str) -> Option<String> {
    if task_dir.is_empty() || task_dir.trim_end_matches('/') == parent_dir.trim_end_matches('/') {
        return None;
    }
    let branch = Path::new(task_dir.trim_end_matches('/'))
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| task_dir.to_string());

    Some(format!(
        "<branch-context>\n\
         Active branch: {branch}\n\
         Working directory: {task_dir}\n\
         Parent directory: {parent_dir}\n\
         \n\
         You are working in an isolated worktree.\n\
         - Only read and modify files inside {task_dir}.\n\
         - Do not merge, rebase or push into the parent branch.\n\
         - When finished, report what you completed and leave integration to the caller.\n\
         </branch-context>"
    ))
}

/// Table of the caller's other active tasks so the new one can coordinate.
pub fn sibling_table(siblings: &[SessionRef], agents: &[String]) -> Option<String> {
    if siblings.is_empty() {
        return None;
    }
    let mut out = String::from(
        "<sibling-tasks>\n\
         Other tasks are running alongside you. Use broadcast to share findings with them.\n\
         \n\
         | task_id | agent | title | directory |\n\
         |---|---|---|---|\n",
    );
    for (i, sibling) in siblings.iter().enumerate() {
        let agent = agents.get(i).map(|a| a.as_str()).unwrap_or("?");
        out.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            sibling.id,
            agent,
            sibling.title.replace('|', "\\|"),
            sibling.directory
        ));
    }
    out.push_str("</sibling-tasks>");
    Some(out)
}

//! Tool-facing operations.
//!
//! Each operation takes a [`ToolContext`] naming the calling session and
//! returns a serializable result. Failures come back as values
//! (`TaskResult::Failed`, a failed `BroadcastOutcome` or
//! `ReadBroadcastsResult`), never as errors or panics, so a tool host can hand
//! them straight to the model.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broadcast::{
    BroadcastBus, BroadcastOutcome, BroadcastTarget, Category, ReadResult, ReadSource,
};
use crate::cache::DeliveryCache;
use crate::config::Config;
use crate::delivery;
use crate::notifier::{CompletionNotifier, WatchedTask};
use crate::opencode::{PartInput, PromptRequest, SessionRef, SessionService};
use crate::task::{
    CancellationController, CompletionOracle, CreateTaskRequest, ResultHarvester, SessionContext,
    TaskError, TaskLauncher, TaskMode, TaskOutcome, TaskRegistry, TaskResult, TaskStatus,
    COMPLETED_POINTER,
};

/// Identifies the session a tool call comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolContext {
    pub session_id: String,
    /// Directory the caller is working in, when it differs from the host default.
    pub work_dir: Option<String>,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            work_dir: None,
        }
    }

    pub fn with_work_dir(mut self, work_dir: Option<String>) -> Self {
        self.work_dir = work_dir.filter(|d| !d.trim().is_empty());
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskArgs {
    pub title: String,
    pub agent: String,
    pub prompt: String,
    #[serde(rename = "async", default)]
    pub run_async: bool,
    pub timeout_ms: Option<u64>,
    pub work_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetTaskOutputArgs {
    pub task_id: String,
    #[serde(default)]
    pub wait: bool,
    pub timeout_ms: Option<u64>,
    pub work_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendTaskMessageArgs {
    pub task_id: String,
    pub message: String,
    #[serde(default)]
    pub no_reply: bool,
    pub work_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelTaskArgs {
    pub task_id: String,
    pub work_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastArgs {
    pub message: String,
    pub category: Category,
    #[serde(default = "default_target")]
    pub target: BroadcastTarget,
    pub work_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadBroadcastsArgs {
    pub category: Option<Category>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_source")]
    pub source: ReadSource,
    pub work_dir: Option<String>,
}

/// What `read_broadcasts` hands back: the read itself, or a `failed` task
/// result when the caller's history could not be read.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReadBroadcastsResult {
    Read(ReadResult),
    Failed(TaskResult),
}

impl ReadBroadcastsResult {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

fn default_target() -> BroadcastTarget {
    BroadcastTarget::Siblings
}

fn default_limit() -> usize {
    10
}

fn default_source() -> ReadSource {
    ReadSource::SelfSession
}

/// Components bound to one directory scope.
struct Scope {
    service: Arc<dyn SessionService>,
    oracle: CompletionOracle,
    harvester: ResultHarvester,
}

#[derive(Clone)]
pub struct TaskTools {
    service: Arc<dyn SessionService>,
    config: Arc<Config>,
    cache: Arc<DeliveryCache>,
    registry: Arc<TaskRegistry>,
    notifier: Option<Arc<CompletionNotifier>>,
}

impl TaskTools {
    pub fn new(
        service: Arc<dyn SessionService>,
        config: Arc<Config>,
        cache: Arc<DeliveryCache>,
    ) -> Self {
        let registry = Arc::new(TaskRegistry::new(config.cache.capacity));
        Self {
            service,
            config,
            cache,
            registry,
            notifier: None,
        }
    }

    /// Status registry shared with a [`CompletionNotifier`].
    pub fn registry(&self) -> Arc<TaskRegistry> {
        self.registry.clone()
    }

    pub fn with_notifier(mut self, notifier: Arc<CompletionNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    fn scope(&self, ctx: &ToolContext, work_dir: Option<&str>) -> Scope {
        let directory = work_dir
            .filter(|d| !d.trim().is_empty())
            .or(ctx.work_dir.as_deref());
        let service = directory
            .and_then(|d| self.service.scoped(d))
            .unwrap_or_else(|| self.service.clone());
        Scope {
            oracle: CompletionOracle::new(service.clone(), self.config.poll.clone()),
            harvester: ResultHarvester::new(service.clone()),
            service,
        }
    }

    async fn caller(&self, scope: &Scope, ctx: &ToolContext) -> TaskOutcome<SessionRef> {
        scope
            .service
            .get_session(&ctx.session_id)
            .await
            .session_step("load caller session", &ctx.session_id)
    }

    /// Resolve `task_id` to a child or sibling of `caller`.
    async fn owned_task(
        &self,
        scope: &Scope,
        caller: &SessionRef,
        task_id: &str,
    ) -> TaskOutcome<SessionRef> {
        let task = match scope.service.get_session(task_id).await {
            Ok(task) => task,
            Err(e) => {
                tracing::debug!(task_id, "Task lookup failed: {:#}", e);
                return Err(TaskError::TaskNotFound(task_id.to_string()));
            }
        };

        let is_child = task.parent_id.as_deref() == Some(caller.id.as_str());
        let is_sibling = task.id != caller.id
            && task.parent_id.is_some()
            && task.parent_id == caller.parent_id;
        if is_child || is_sibling {
            Ok(task)
        } else {
            Err(TaskError::TaskNotFound(task_id.to_string()))
        }
    }

    pub async fn create_task(&self, ctx: &ToolContext, args: CreateTaskArgs) -> TaskResult {
        let scope = self.scope(ctx, args.work_dir.as_deref());
        let caller = match self.caller(&scope, ctx).await {
            Ok(caller) => caller,
            Err(e) => return e.into_result(None),
        };

        let mode = if args.run_async {
            TaskMode::Async
        } else {
            TaskMode::Sync
        };
        let mut request = CreateTaskRequest::new(args.title, args.agent, args.prompt, mode);
        if let Some(ms) = args.timeout_ms {
            request = request.timeout(Duration::from_millis(ms));
        }
        if let Some(dir) = args.work_dir.or_else(|| ctx.work_dir.clone()) {
            request = request.work_dir(dir);
        }

        let mut launcher = TaskLauncher::new(
            scope.service.clone(),
            scope.oracle.clone(),
            scope.harvester.clone(),
            self.cache.clone(),
            self.registry.clone(),
            self.config.clone(),
        );
        if let Some(notifier) = &self.notifier {
            launcher = launcher.with_notifier(notifier.clone());
        }
        launcher.create(&caller, request).await
    }

    pub async fn get_task_output(&self, ctx: &ToolContext, args: GetTaskOutputArgs) -> TaskResult {
        let scope = self.scope(ctx, args.work_dir.as_deref());
        let task_id = args.task_id.clone();
        self.task_output(&scope, ctx, args)
            .await
            .unwrap_or_else(|e| e.into_result(Some(task_id)))
    }

    async fn task_output(
        &self,
        scope: &Scope,
        ctx: &ToolContext,
        args: GetTaskOutputArgs,
    ) -> TaskOutcome<TaskResult> {
        let caller = self.caller(scope, ctx).await?;
        let task = self.owned_task(scope, &caller, &args.task_id).await?;
        if self.registry.status(&task.id) == TaskStatus::Cancelled {
            return Err(TaskError::Cancelled(task.id));
        }

        if !scope.oracle.is_complete(&task.id).await? {
            if !args.wait {
                return Ok(TaskResult::Running {
                    task_id: task.id,
                    title: task.title,
                });
            }
            let timeout = args
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| self.config.default_timeout());
            if !scope.oracle.wait(&task.id, timeout).await {
                return Err(TaskError::Timeout {
                    task_id: task.id,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
        if !self.registry.transition(&task.id, TaskStatus::Completed) {
            return Err(TaskError::Cancelled(task.id));
        }

        let bundle = scope.harvester.fetch(&task).await?;
        let key = bundle.delivery_key();
        let agent = bundle.info.agent.clone().unwrap_or_default();
        if self.cache.insert(&key) {
            if let Err(e) = delivery::inject(scope.service.as_ref(), &caller.id, bundle.parts).await {
                self.cache.remove(&key);
                return Err(TaskError::session("deliver task output", &caller.id, e));
            }
            tracing::info!(task_id = %task.id, caller_id = %caller.id, "Delivered task output");
        } else {
            tracing::debug!(task_id = %task.id, "Task output already delivered");
        }

        Ok(TaskResult::Completed {
            task_id: task.id,
            title: task.title,
            agent,
            result: COMPLETED_POINTER.to_string(),
        })
    }

    pub async fn send_task_message(
        &self,
        ctx: &ToolContext,
        args: SendTaskMessageArgs,
    ) -> TaskResult {
        let scope = self.scope(ctx, args.work_dir.as_deref());
        let task_id = args.task_id.clone();
        self.task_message(&scope, ctx, args)
            .await
            .unwrap_or_else(|e| e.into_result(Some(task_id)))
    }

    async fn task_message(
        &self,
        scope: &Scope,
        ctx: &ToolContext,
        args: SendTaskMessageArgs,
    ) -> TaskOutcome<TaskResult> {
        if args.message.trim().is_empty() {
            return Err(TaskError::InvalidArgument("message must not be empty".into()));
        }
        let caller = self.caller(scope, ctx).await?;
        let task = self.owned_task(scope, &caller, &args.task_id).await?;

        let identity = delivery::resolve_identity(scope.service.as_ref(), &task.id)
            .await
            .session_step("resolve task agent", &task.id)?;
        let agent = identity.agent.clone();
        let request = PromptRequest::new(vec![PartInput::text(args.message)])
            .agent(identity.agent)
            .model(identity.model)
            .no_reply(args.no_reply);

        if args.no_reply {
            scope
                .service
                .prompt(&task.id, request)
                .await
                .session_step("append task message", &task.id)?;
        } else {
            if !self.registry.reopen(&task.id) {
                return Err(TaskError::Cancelled(task.id));
            }
            if let Some(notifier) = &self.notifier {
                notifier.watch(WatchedTask {
                    task_id: task.id.clone(),
                    parent_id: caller.id.clone(),
                    title: task.title.clone(),
                    agent: agent.unwrap_or_default(),
                });
            }
            scope
                .service
                .prompt_async(&task.id, request)
                .await
                .session_step("message task", &task.id)?;
        }

        tracing::info!(task_id = %task.id, no_reply = args.no_reply, "Sent message to task");
        Ok(TaskResult::Delivered {
            task_id: task.id,
            no_reply: args.no_reply,
        })
    }

    pub async fn cancel_task(&self, ctx: &ToolContext, args: CancelTaskArgs) -> TaskResult {
        let scope = self.scope(ctx, args.work_dir.as_deref());
        let outcome: TaskOutcome<TaskResult> = async {
            let caller = self.caller(&scope, ctx).await?;
            let task = self.owned_task(&scope, &caller, &args.task_id).await?;
            let result = CancellationController::new(scope.service.clone(), scope.oracle.clone())
                .cancel(&task)
                .await?;
            if matches!(result, TaskResult::Cancelled { .. }) {
                self.registry.transition(&task.id, TaskStatus::Cancelled);
                if let Some(notifier) = &self.notifier {
                    notifier.unwatch(&task.id);
                }
            }
            Ok(result)
        }
        .await;
        outcome.unwrap_or_else(|e| e.into_result(Some(args.task_id.clone())))
    }

    pub async fn broadcast(&self, ctx: &ToolContext, args: BroadcastArgs) -> BroadcastOutcome {
        let scope = self.scope(ctx, args.work_dir.as_deref());
        let sender = match self.caller(&scope, ctx).await {
            Ok(sender) => sender,
            Err(e) => return BroadcastOutcome::failed(e.to_string()),
        };
        self.bus(&scope)
            .send(&sender, &args.message, args.category, args.target)
            .await
    }

    pub async fn read_broadcasts(
        &self,
        ctx: &ToolContext,
        args: ReadBroadcastsArgs,
    ) -> ReadBroadcastsResult {
        let scope = self.scope(ctx, args.work_dir.as_deref());
        let outcome = async {
            let caller = self.caller(&scope, ctx).await?;
            self.bus(&scope)
                .read(&caller, args.category, args.limit, args.source)
                .await
        }
        .await;
        match outcome {
            Ok(read) => ReadBroadcastsResult::Read(read),
            Err(e) => ReadBroadcastsResult::Failed(e.into_result(None)),
        }
    }

    fn bus(&self, scope: &Scope) -> BroadcastBus {
        BroadcastBus::new(scope.service.clone(), self.config.broadcast_max_chars)
    }
}

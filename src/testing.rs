//! In-memory [`SessionService`] for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::opencode::{
    AgentInfo, Message, MessageInfo, MessageTime, ModelRef, Part, PartInput, PromptRequest, Role,
    SessionRef, SessionService, SessionStatus,
};

#[derive(Default)]
pub struct FakeState {
    pub sessions: HashMap<String, SessionRef>,
    pub messages: HashMap<String, Vec<Message>>,
    pub status: HashMap<String, SessionStatus>,
    pub agents: Vec<AgentInfo>,
    pub prompts: Vec<(String, PromptRequest)>,
    pub async_prompts: Vec<(String, PromptRequest)>,
    pub aborts: Vec<String>,
    pub created: Vec<String>,
    /// `(operation, session id)` pairs that fail. Use `*` for any session.
    pub failures: HashSet<(&'static str, String)>,
    /// Assistant reply appended after every replying prompt.
    pub reply: Option<String>,
    pub prompt_delay: Option<Duration>,
    /// A rejected abort still lets the session finish on its own.
    pub idle_on_failed_abort: bool,
    next_id: u64,
    clock: i64,
}

#[derive(Default)]
pub struct FakeSessionService {
    state: Mutex<FakeState>,
}

impl FakeSessionService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_agent(&self, name: &str) {
        self.state().agents.push(AgentInfo {
            name: name.to_string(),
            mode: Some("subagent".to_string()),
        });
    }

    pub fn add_session(&self, id: &str, parent: Option<&str>, directory: &str, title: &str) -> SessionRef {
        let session = SessionRef {
            id: id.to_string(),
            parent_id: parent.map(|p| p.to_string()),
            directory: directory.to_string(),
            title: title.to_string(),
        };
        self.state().sessions.insert(id.to_string(), session.clone());
        session
    }

    pub fn set_status(&self, id: &str, kind: &str) {
        self.state().status.insert(
            id.to_string(),
            SessionStatus {
                kind: kind.to_string(),
            },
        );
    }

    pub fn fail(&self, op: &'static str, id: &str) {
        self.state().failures.insert((op, id.to_string()));
    }

    pub fn push(&self, session: &str, role: Role, agent: Option<&str>, parts: Vec<Part>) -> String {
        let mut state = self.state();
        push_locked(&mut state, session, role, agent, None, parts)
    }

    pub fn user_text(&self, session: &str, text: &str) -> String {
        self.push(
            session,
            Role::User,
            Some("build"),
            vec![Part::Text {
                text: text.to_string(),
                synthetic: false,
            }],
        )
    }

    pub fn synthetic_user(&self, session: &str, text: &str) -> String {
        self.push(
            session,
            Role::User,
            Some("build"),
            vec![Part::Text {
                text: text.to_string(),
                synthetic: true,
            }],
        )
    }

    pub fn assistant_text(&self, session: &str, text: &str) -> String {
        self.push(
            session,
            Role::Assistant,
            Some("explorer"),
            vec![Part::Text {
                text: text.to_string(),
                synthetic: false,
            }],
        )
    }

    pub fn messages_of(&self, session: &str) -> Vec<Message> {
        self.state().messages.get(session).cloned().unwrap_or_default()
    }

    fn check(&self, op: &'static str, id: &str) -> anyhow::Result<()> {
        let state = self.state();
        if state.failures.contains(&(op, id.to_string()))
            || state.failures.contains(&(op, "*".to_string()))
        {
            anyhow::bail!("fake {} failed for {}", op, id);
        }
        Ok(())
    }

    fn record_prompt(&self, id: &str, request: &PromptRequest) {
        let mut state = self.state();
        let parts = request
            .parts
            .iter()
            .map(|p| match p {
                PartInput::Text { text, synthetic } => Part::Text {
                    text: text.clone(),
                    synthetic: *synthetic,
                },
            })
            .collect();
        push_locked(
            &mut state,
            id,
            Role::User,
            request.agent.as_deref(),
            request.model.clone(),
            parts,
        );
        if !request.no_reply {
            if let Some(reply) = state.reply.clone() {
                push_locked(
                    &mut state,
                    id,
                    Role::Assistant,
                    request.agent.as_deref(),
                    request.model.clone(),
                    vec![Part::Text {
                        text: reply,
                        synthetic: false,
                    }],
                );
                state.status.insert(id.to_string(), SessionStatus::idle());
            }
        }
    }
}

fn push_locked(
    state: &mut FakeState,
    session: &str,
    role: Role,
    agent: Option<&str>,
    model: Option<ModelRef>,
    parts: Vec<Part>,
) -> String {
    state.clock += 1;
    let id = format!("msg_{}", state.clock);
    let info = MessageInfo {
        id: id.clone(),
        session_id: session.to_string(),
        role,
        time: MessageTime {
            created: state.clock,
            completed: None,
        },
        agent: agent.map(|a| a.to_string()),
        mode: None,
        model,
        provider_id: None,
        model_id: None,
    };
    state
        .messages
        .entry(session.to_string())
        .or_default()
        .push(Message { info, parts });
    id
}

#[async_trait]
impl SessionService for FakeSessionService {
    async fn create_session(
        &self,
        parent_id: Option<&str>,
        title: &str,
        directory: &str,
    ) -> anyhow::Result<SessionRef> {
        self.check("create", parent_id.unwrap_or(""))?;
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("ses_task_{}", state.next_id);
        let session = SessionRef {
            id: id.clone(),
            parent_id: parent_id.map(|p| p.to_string()),
            directory: directory.to_string(),
            title: title.to_string(),
        };
        state.sessions.insert(id.clone(), session.clone());
        state.status.insert(id.clone(), SessionStatus::idle());
        state.created.push(id);
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> anyhow::Result<SessionRef> {
        self.check("get", id)?;
        self.state()
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("session {} not found", id))
    }

    async fn children(&self, id: &str) -> anyhow::Result<Vec<SessionRef>> {
        self.check("children", id)?;
        let mut children: Vec<SessionRef> = self
            .state()
            .sessions
            .values()
            .filter(|s| s.parent_id.as_deref() == Some(id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(children)
    }

    async fn status(&self) -> anyhow::Result<HashMap<String, SessionStatus>> {
        self.check("status", "*")?;
        Ok(self.state().status.clone())
    }

    async fn messages(&self, id: &str, limit: Option<usize>) -> anyhow::Result<Vec<Message>> {
        self.check("messages", id)?;
        let mut messages = self.messages_of(id);
        if let Some(limit) = limit {
            let skip = messages.len().saturating_sub(limit);
            messages.drain(..skip);
        }
        Ok(messages)
    }

    async fn prompt(&self, id: &str, request: PromptRequest) -> anyhow::Result<()> {
        self.check("prompt", id)?;
        let delay = self.state().prompt_delay;
        if !request.no_reply {
            self.state().status.insert(id.to_string(), SessionStatus::busy());
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state().prompts.push((id.to_string(), request.clone()));
        self.record_prompt(id, &request);
        Ok(())
    }

    async fn prompt_async(&self, id: &str, request: PromptRequest) -> anyhow::Result<()> {
        self.check("prompt_async", id)?;
        self.state().async_prompts.push((id.to_string(), request.clone()));
        self.state().status.insert(id.to_string(), SessionStatus::busy());
        Ok(())
    }

    async fn abort(&self, id: &str) -> anyhow::Result<()> {
        if let Err(e) = self.check("abort", id) {
            let mut state = self.state();
            if state.idle_on_failed_abort {
                state.status.insert(id.to_string(), SessionStatus::idle());
            }
            return Err(e);
        }
        let mut state = self.state();
        state.aborts.push(id.to_string());
        state.status.insert(id.to_string(), SessionStatus::idle());
        Ok(())
    }

    async fn agents(&self) -> anyhow::Result<Vec<AgentInfo>> {
        self.check("agents", "*")?;
        Ok(self.state().agents.clone())
    }
}

//! Appending non-reply messages to a session on behalf of its current agent.

use crate::opencode::{ModelRef, PartInput, PromptRequest, SessionService};

/// Agent and model a session is currently running with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub agent: Option<String>,
    pub model: Option<ModelRef>,
}

/// Resolve a session's agent/model from the newest messages that carry them.
pub async fn resolve_identity(
    service: &dyn SessionService,
    session_id: &str,
) -> anyhow::Result<Identity> {
    let mut messages = service.messages(session_id, None).await?;
    messages.sort_by_key(|m| m.created());

    let mut identity = Identity::default();
    for message in messages.iter().rev() {
        if identity.agent.is_none() {
            identity.agent = message.info.agent_name().map(|a| a.to_string());
        }
        if identity.model.is_none() {
            identity.model = message.info.model_ref();
        }
        if identity.agent.is_some() && identity.model.is_some() {
            break;
        }
    }
    Ok(identity)
}

/// Append `parts` to `session_id` without starting a new agent turn.
pub async fn inject(
    service: &dyn SessionService,
    session_id: &str,
    parts: Vec<PartInput>,
) -> anyhow::Result<()> {
    let identity = resolve_identity(service, session_id).await?;
    let request = PromptRequest::new(parts)
        .agent(identity.agent)
        .model(identity.model)
        .no_reply(true);
    service.prompt(session_id, request).await
}

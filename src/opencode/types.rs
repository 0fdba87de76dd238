//! Wire types for the OpenCode session API.
//!
//! Only the fields this crate reads are modelled; everything else in the
//! server's payloads is ignored on deserialization.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of a host-owned session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
    pub id: String,
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub title: String,
}

/// Live status of a session as reported by `GET /session/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    #[serde(rename = "type")]
    pub kind: String,
}

impl SessionStatus {
    pub fn idle() -> Self {
        Self { kind: "idle".to_string() }
    }

    pub fn busy() -> Self {
        Self { kind: "busy".to_string() }
    }

    pub fn is_idle(&self) -> bool {
        self.kind == "idle"
    }
}

/// Provider/model pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

impl ModelRef {
    /// Parse `provider/model`.
    pub fn parse(model: &str) -> Option<Self> {
        let mut parts = model.trim().splitn(2, '/');
        let provider = parts.next()?.trim();
        let model_id = parts.next()?.trim();
        if provider.is_empty() || model_id.is_empty() {
            None
        } else {
            Some(Self {
                provider_id: provider.to_string(),
                model_id: model_id.to_string(),
            })
        }
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.model_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    #[serde(other)]
    Other,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTime {
    #[serde(default)]
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
}

/// Message metadata. User messages carry `agent` and a nested `model`;
/// assistant messages carry `mode` (or `agent`) and flat provider/model ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    pub role: Role,
    #[serde(default)]
    pub time: MessageTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(rename = "modelID", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

impl MessageInfo {
    pub fn agent_name(&self) -> Option<&str> {
        self.agent.as_deref().or(self.mode.as_deref())
    }

    pub fn model_ref(&self) -> Option<ModelRef> {
        if let Some(model) = &self.model {
            return Some(model.clone());
        }
        match (&self.provider_id, &self.model_id) {
            (Some(provider_id), Some(model_id)) => Some(ModelRef {
                provider_id: provider_id.clone(),
                model_id: model_id.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    #[serde(default)]
    pub input: Value,
}

/// A stored message part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Part {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        synthetic: bool,
    },
    Reasoning {
        #[serde(default)]
        text: String,
    },
    Tool {
        tool: String,
        #[serde(default)]
        state: ToolState,
    },
    #[serde(other)]
    Other,
}

/// A message together with its ordered parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub info: MessageInfo,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Message {
    pub fn created(&self) -> i64 {
        self.info.time.created
    }

    pub fn role(&self) -> Role {
        self.info.role
    }

    /// A message is synthetic when it has text and every text part is
    /// flagged synthetic (injected context, notices, harvested output).
    pub fn is_synthetic(&self) -> bool {
        let mut texts = self.parts.iter().filter_map(|p| match p {
            Part::Text { synthetic, .. } => Some(*synthetic),
            _ => None,
        });
        match texts.next() {
            Some(first) => first && texts.all(|s| s),
            None => false,
        }
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// An outgoing part for `prompt` / `prompt_async`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PartInput {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        synthetic: bool,
    },
}

impl PartInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            synthetic: false,
        }
    }

    pub fn synthetic(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            synthetic: true,
        }
    }

    pub fn as_text(&self) -> &str {
        match self {
            Self::Text { text, .. } => text,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        match self {
            Self::Text { synthetic, .. } => *synthetic,
        }
    }
}

/// Body of a prompt call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    pub parts: Vec<PartInput>,
    #[serde(rename = "noReply", default, skip_serializing_if = "std::ops::Not::not")]
    pub no_reply: bool,
}

impl PromptRequest {
    pub fn new(parts: Vec<PartInput>) -> Self {
        Self {
            parts,
            ..Default::default()
        }
    }

    pub fn agent(mut self, agent: Option<String>) -> Self {
        self.agent = agent;
        self
    }

    pub fn model(mut self, model: Option<ModelRef>) -> Self {
        self.model = model;
        self
    }

    pub fn no_reply(mut self, no_reply: bool) -> Self {
        self.no_reply = no_reply;
        self
    }
}

/// Agent entry from `GET /agent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_assistant_message() {
        let message: Message = serde_json::from_value(json!({
            "info": {
                "id": "msg_2",
                "sessionID": "ses_1",
                "role": "assistant",
                "time": { "created": 20, "completed": 25 },
                "mode": "explorer",
                "providerID": "anthropic",
                "modelID": "claude-sonnet",
                "cost": 0.01
            },
            "parts": [
                { "id": "p1", "type": "step-start" },
                { "id": "p2", "type": "reasoning", "text": "hmm" },
                { "id": "p3", "type": "tool", "tool": "grep", "state": { "status": "completed", "input": { "pattern": "X" } } },
                { "id": "p4", "type": "text", "text": "found it" }
            ]
        }))
        .unwrap();

        assert_eq!(message.role(), Role::Assistant);
        assert_eq!(message.info.agent_name(), Some("explorer"));
        assert_eq!(
            message.info.model_ref().map(|m| m.to_string()).as_deref(),
            Some("anthropic/claude-sonnet")
        );
        assert_eq!(message.parts[0], Part::Other);
        assert!(!message.is_synthetic());
        assert_eq!(message.text(), "found it");
    }

    #[test]
    fn test_synthetic_requires_all_text_parts() {
        let info = MessageInfo {
            id: "m".into(),
            session_id: "s".into(),
            role: Role::User,
            time: MessageTime::default(),
            agent: None,
            mode: None,
            model: None,
            provider_id: None,
            model_id: None,
        };
        let mixed = Message {
            info: info.clone(),
            parts: vec![
                Part::Text { text: "a".into(), synthetic: true },
                Part::Text { text: "b".into(), synthetic: false },
            ],
        };
        assert!(!mixed.is_synthetic());

        let injected = Message {
            info: info.clone(),
            parts: vec![Part::Text { text: "a".into(), synthetic: true }],
        };
        assert!(injected.is_synthetic());

        let empty = Message { info, parts: vec![] };
        assert!(!empty.is_synthetic());
    }

    #[test]
    fn test_prompt_request_wire_shape() {
        let body = PromptRequest::new(vec![PartInput::synthetic("hi")])
            .agent(Some("build".into()))
            .model(ModelRef::parse("openai/gpt-5"))
            .no_reply(true);
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "agent": "build",
                "model": { "providerID": "openai", "modelID": "gpt-5" },
                "parts": [{ "type": "text", "text": "hi", "synthetic": true }],
                "noReply": true
            })
        );
    }

    #[test]
    fn test_model_ref_parse_rejects_partial() {
        assert!(ModelRef::parse("anthropic/").is_none());
        assert!(ModelRef::parse("no-slash").is_none());
    }
}

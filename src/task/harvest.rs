//! Harvesting a task's newest turn into a bundle that can be injected
//! elsewhere.

use std::sync::Arc;

use serde::Serialize;

use super::error::{SessionContext, TaskOutcome};
use crate::broadcast::defuse;
use crate::opencode::{Message, ModelRef, Part, PartInput, Role, SessionRef, SessionService};

/// Metadata merged across the harvested messages. Later messages win.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BundleInfo {
    pub task_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    pub message_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<String>,
}

/// Renderable output of one task turn. Every part is synthetic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputBundle {
    pub info: BundleInfo,
    pub parts: Vec<PartInput>,
}

impl OutputBundle {
    /// True when the slice held no messages.
    pub fn is_empty(&self) -> bool {
        self.info.message_count == 0
    }

    pub fn text(&self) -> String {
        self.parts
            .iter()
            .map(|p| p.as_text())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Key identifying this exact output for de-duplicated delivery.
    pub fn delivery_key(&self) -> String {
        format!(
            "output:{}:{}",
            self.info.task_id,
            self.info.last_message_id.as_deref().unwrap_or("-")
        )
    }
}

/// Messages from the newest non-synthetic user message onward, oldest first.
/// With no such message the whole history is returned.
pub fn latest_turn(mut messages: Vec<Message>) -> Vec<Message> {
    messages.sort_by_key(|m| m.created());
    let start = messages
        .iter()
        .rposition(|m| m.role() == Role::User && !m.is_synthetic())
        .unwrap_or(0);
    messages.split_off(start)
}

fn speaker_label(message: &Message) -> String {
    match (message.role(), message.info.agent_name()) {
        (Role::Assistant, Some(agent)) => format!("**assistant ({})**:", agent),
        (role, _) => format!("**{}**:", role.as_str()),
    }
}

/// Broadcast envelopes in the task's history are defused, so the harvested
/// copy does not read as broadcasts addressed to the receiving session.
fn render_part(part: &Part) -> Option<String> {
    match part {
        Part::Text { text, .. } if !text.trim().is_empty() => Some(defuse(text)),
        Part::Reasoning { text } if !text.trim().is_empty() => {
            Some(format!("<thinking>\n{}\n</thinking>", defuse(text.trim())))
        }
        Part::Tool { tool, state } => {
            let input = if state.input.is_null() {
                "{}".to_string()
            } else {
                state.input.to_string()
            };
            Some(defuse(&format!("[tool: {}] {}", tool, input)))
        }
        _ => None,
    }
}

/// Build the bundle for `task` from its full message history.
pub fn build_bundle(task: &SessionRef, messages: Vec<Message>) -> OutputBundle {
    let turn = latest_turn(messages);

    let mut info = BundleInfo {
        task_id: task.id.clone(),
        title: task.title.clone(),
        message_count: turn.len(),
        ..Default::default()
    };
    let mut parts = vec![PartInput::synthetic(format!(
        "# Task output: {} ({})",
        task.title, task.id
    ))];

    for message in &turn {
        if let Some(agent) = message.info.agent_name() {
            info.agent = Some(agent.to_string());
        }
        if let Some(model) = message.info.model_ref() {
            info.model = Some(model);
        }
        info.last_message_id = Some(message.info.id.clone());

        let rendered: Vec<String> = message.parts.iter().filter_map(render_part).collect();
        if rendered.is_empty() {
            continue;
        }
        parts.push(PartInput::synthetic(speaker_label(message)));
        parts.extend(rendered.into_iter().map(PartInput::synthetic));
    }

    OutputBundle { info, parts }
}

/// Extracts the newest conversational turn from a task session.
#[derive(Clone)]
pub struct ResultHarvester {
    service: Arc<dyn SessionService>,
}

impl ResultHarvester {
    pub fn new(service: Arc<dyn SessionService>) -> Self {
        Self { service }
    }

    pub async fn fetch(&self, task: &SessionRef) -> TaskOutcome<OutputBundle> {
        let messages = self
            .service
            .messages(&task.id, None)
            .await
            .session_step("load task messages", &task.id)?;
        Ok(build_bundle(task, messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{parse_envelopes, Category, Envelope};
    use crate::opencode::ToolState;
    use chrono::Utc;
    use crate::testing::FakeSessionService;
    use serde_json::json;

    fn task() -> SessionRef {
        SessionRef {
            id: "ses_t".into(),
            parent_id: Some("ses_p".into()),
            directory: "/w".into(),
            title: "scan".into(),
        }
    }

    #[tokio::test]
    async fn test_slices_from_latest_real_user_turn() {
        let fake = FakeSessionService::new();
        fake.user_text("ses_t", "first ask");
        fake.assistant_text("ses_t", "first answer");
        fake.user_text("ses_t", "follow-up");
        fake.assistant_text("ses_t", "second answer");
        fake.synthetic_user("ses_t", "broadcast notice");

        let bundle = ResultHarvester::new(fake.clone()).fetch(&task()).await.unwrap();
        let text = bundle.text();

        assert!(text.starts_with("# Task output: scan (ses_t)"));
        assert!(!text.contains("first answer"));
        assert!(text.contains("follow-up"));
        assert!(text.contains("second answer"));
        assert!(text.contains("broadcast notice"));
        assert_eq!(bundle.info.message_count, 3);
        assert!(bundle.parts.iter().all(|p| p.is_synthetic()));
    }

    #[tokio::test]
    async fn test_repeat_harvest_is_unchanged() {
        let fake = FakeSessionService::new();
        fake.user_text("ses_t", "go");
        fake.assistant_text("ses_t", "done");

        let harvester = ResultHarvester::new(fake.clone());
        let first = harvester.fetch(&task()).await.unwrap();
        let second = harvester.fetch(&task()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.delivery_key(), second.delivery_key());
    }

    #[test]
    fn test_part_transforms_and_metadata_merge() {
        let fake = FakeSessionService::new();
        fake.user_text("ses_t", "go");
        fake.push(
            "ses_t",
            Role::Assistant,
            Some("explorer"),
            vec![
                Part::Reasoning { text: "look in src".into() },
                Part::Tool {
                    tool: "grep".into(),
                    state: ToolState { input: json!({ "pattern": "X" }) },
                },
                Part::Other,
                Part::Text { text: "found X".into(), synthetic: false },
            ],
        );
        fake.push("ses_t", Role::Assistant, Some("reviewer"), vec![Part::Other]);

        let bundle = build_bundle(&task(), fake.messages_of("ses_t"));
        let texts: Vec<&str> = bundle.parts.iter().map(|p| p.as_text()).collect();

        assert_eq!(
            texts,
            vec![
                "# Task output: scan (ses_t)",
                "**user**:",
                "go",
                "**assistant (explorer)**:",
                "<thinking>\nlook in src\n</thinking>",
                r#"[tool: grep] {"pattern":"X"}"#,
                "found X",
            ]
        );
        assert_eq!(bundle.info.agent.as_deref(), Some("reviewer"));
        assert_eq!(bundle.info.message_count, 3);
    }

    #[test]
    fn test_received_broadcasts_are_not_copied_as_envelopes() {
        let fake = FakeSessionService::new();
        let notice = Envelope {
            from: "builder".into(),
            task_id: "ses_s".into(),
            category: Category::Warning,
            timestamp: Utc::now(),
            message: "lockfile changed".into(),
        }
        .encode();
        fake.user_text("ses_t", "go");
        fake.synthetic_user("ses_t", &notice);
        fake.assistant_text("ses_t", &format!("quoting it: {}", notice));

        let bundle = build_bundle(&task(), fake.messages_of("ses_t"));

        assert!(parse_envelopes(&bundle.text()).is_empty());
        assert!(bundle.text().contains("lockfile changed"));
    }

    #[test]
    fn test_empty_history() {
        let bundle = build_bundle(&task(), Vec::new());
        assert!(bundle.is_empty());
        assert_eq!(bundle.parts.len(), 1);
    }
}

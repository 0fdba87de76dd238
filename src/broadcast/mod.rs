//! Lateral notices between sibling and child task sessions.
//!
//! A broadcast is appended to each recipient's history as a synthetic,
//! non-reply message, so it never starts a turn on its own. Reads scan
//! history back for envelopes.

mod envelope;

pub use envelope::{
    cap_message, defuse, parse_envelopes, Broadcast, BroadcastSource, Category, Envelope,
};

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::delivery;
use crate::opencode::{Part, PartInput, SessionRef, SessionService};
use crate::task::{SessionContext, TaskOutcome};

/// Who receives a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastTarget {
    Siblings,
    Children,
    All,
}

/// Whose history a read scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadSource {
    #[serde(rename = "self")]
    SelfSession,
    #[serde(rename = "children")]
    Children,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastOutcome {
    pub status: DeliveryStatus,
    pub delivered_to: usize,
    /// Ids of the sessions that received the broadcast.
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl BroadcastOutcome {
    pub(crate) fn failed(error: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Failed,
            delivered_to: 0,
            recipients: Vec::new(),
            errors: vec![error.into()],
        }
    }

    fn from_parts(recipients: Vec<String>, errors: Vec<String>) -> Self {
        let status = if recipients.is_empty() {
            DeliveryStatus::Failed
        } else if errors.is_empty() {
            DeliveryStatus::Success
        } else {
            DeliveryStatus::Partial
        };
        Self {
            status,
            delivered_to: recipients.len(),
            recipients,
            errors,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResult {
    pub broadcasts: Vec<Broadcast>,
    /// Matching broadcasts before `limit` was applied.
    pub total: usize,
}

#[derive(Clone)]
pub struct BroadcastBus {
    service: Arc<dyn SessionService>,
    max_chars: usize,
}

impl BroadcastBus {
    pub fn new(service: Arc<dyn SessionService>, max_chars: usize) -> Self {
        Self {
            service,
            max_chars: max_chars.max(1),
        }
    }

    /// Deliver `message` from `sender` to every session in `target`.
    pub async fn send(
        &self,
        sender: &SessionRef,
        message: &str,
        category: Category,
        target: BroadcastTarget,
    ) -> BroadcastOutcome {
        if message.trim().is_empty() {
            return BroadcastOutcome::failed("message must not be empty");
        }

        let mut errors = Vec::new();
        let recipients = match self.resolve_recipients(sender, target, &mut errors).await {
            Ok(recipients) => recipients,
            Err(e) => return BroadcastOutcome::failed(e),
        };
        if recipients.is_empty() {
            errors.push(format!("no {} to broadcast to", target_label(target)));
            return BroadcastOutcome::from_parts(Vec::new(), errors);
        }

        let from = match delivery::resolve_identity(self.service.as_ref(), &sender.id).await {
            Ok(identity) => identity.agent.unwrap_or_else(|| sender.title.clone()),
            Err(e) => {
                tracing::debug!(session_id = %sender.id, "Could not resolve sender agent: {:#}", e);
                sender.title.clone()
            }
        };
        let envelope = Envelope {
            from,
            task_id: sender.id.clone(),
            category,
            timestamp: Utc::now(),
            message: cap_message(message, self.max_chars),
        }
        .encode();

        let mut delivered = Vec::new();
        for recipient in &recipients {
            match delivery::inject(
                self.service.as_ref(),
                &recipient.id,
                vec![PartInput::synthetic(envelope.clone())],
            )
            .await
            {
                Ok(()) => delivered.push(recipient.id.clone()),
                Err(e) => {
                    tracing::warn!(recipient = %recipient.id, "Broadcast delivery failed: {:#}", e);
                    errors.push(format!("{}: {:#}", recipient.id, e));
                }
            }
        }

        tracing::info!(
            sender = %sender.id,
            category = category.as_str(),
            delivered = delivered.len(),
            failed = recipients.len() - delivered.len(),
            "Broadcast sent"
        );
        BroadcastOutcome::from_parts(delivered, errors)
    }

    /// Unique recipients for `target`, never including the sender. Soft
    /// failures are pushed onto `errors`; a hard failure blocks the send.
    async fn resolve_recipients(
        &self,
        sender: &SessionRef,
        target: BroadcastTarget,
        errors: &mut Vec<String>,
    ) -> Result<Vec<SessionRef>, String> {
        let mut candidates = Vec::new();

        if matches!(target, BroadcastTarget::Siblings | BroadcastTarget::All) {
            match &sender.parent_id {
                Some(parent_id) => match self.service.children(parent_id).await {
                    Ok(siblings) => candidates.extend(siblings),
                    Err(e) => {
                        let msg = format!("failed to list siblings via {}: {:#}", parent_id, e);
                        if target == BroadcastTarget::Siblings {
                            return Err(msg);
                        }
                        errors.push(msg);
                    }
                },
                None if target == BroadcastTarget::Siblings => {
                    return Err(format!("session {} has no parent, so it has no siblings", sender.id));
                }
                None => errors.push(format!(
                    "session {} has no parent; broadcasting to children only",
                    sender.id
                )),
            }
        }

        if matches!(target, BroadcastTarget::Children | BroadcastTarget::All) {
            match self.service.children(&sender.id).await {
                Ok(children) => candidates.extend(children),
                Err(e) => {
                    let msg = format!("failed to list children of {}: {:#}", sender.id, e);
                    if target == BroadcastTarget::Children {
                        return Err(msg);
                    }
                    errors.push(msg);
                }
            }
        }

        let mut seen = HashSet::new();
        Ok(candidates
            .into_iter()
            .filter(|s| s.id != sender.id && seen.insert(s.id.clone()))
            .collect())
    }

    /// Broadcasts found in `session`'s history or its children's, newest
    /// first.
    pub async fn read(
        &self,
        session: &SessionRef,
        category: Option<Category>,
        limit: usize,
        source: ReadSource,
    ) -> TaskOutcome<ReadResult> {
        let mut broadcasts = Vec::new();

        match source {
            ReadSource::SelfSession => {
                broadcasts.extend(
                    self.scan(&session.id, BroadcastSource::SelfSession)
                        .await
                        .session_step("read broadcasts", &session.id)?,
                );
            }
            ReadSource::Children => {
                let children = self
                    .service
                    .children(&session.id)
                    .await
                    .session_step("list child sessions", &session.id)?;
                for child in &children {
                    match self.scan(&child.id, BroadcastSource::Child).await {
                        Ok(found) => broadcasts.extend(found),
                        Err(e) => {
                            tracing::warn!(child = %child.id, "Skipping child history: {:#}", e)
                        }
                    }
                }
            }
        }

        if let Some(category) = category {
            broadcasts.retain(|b| b.category == category);
        }
        broadcasts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let total = broadcasts.len();
        broadcasts.truncate(limit);

        Ok(ReadResult { broadcasts, total })
    }

    async fn scan(&self, session_id: &str, source: BroadcastSource) -> anyhow::Result<Vec<Broadcast>> {
        let messages = self.service.messages(session_id, None).await?;
        Ok(messages
            .iter()
            .flat_map(|m| m.parts.iter())
            .filter_map(|p| match p {
                Part::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .flat_map(parse_envelopes)
            .map(|e| e.into_broadcast(source))
            .collect())
    }
}

fn target_label(target: BroadcastTarget) -> &'static str {
    match target {
        BroadcastTarget::Siblings => "siblings",
        BroadcastTarget::Children => "children",
        BroadcastTarget::All => "siblings or children",
    }
}

//! OpenCode API client.
//!
//! [`SessionService`] is the seam between the task core and the host that
//! owns sessions; [`OpenCodeClient`] implements it over the OpenCode HTTP API.

mod events;
pub mod types;

pub use events::{parse_sse_event, SessionEvent, SseFrames};
pub use types::{
    AgentInfo, Message, MessageInfo, MessageTime, ModelRef, Part, PartInput, PromptRequest,
    Role, SessionRef, SessionStatus, ToolState,
};

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::mpsc;

/// Host operations the task core depends on.
///
/// Every call is fallible; callers wrap failures with the step and session
/// they belong to.
#[async_trait]
pub trait SessionService: Send + Sync {
    async fn create_session(
        &self,
        parent_id: Option<&str>,
        title: &str,
        directory: &str,
    ) -> anyhow::Result<SessionRef>;

    async fn get_session(&self, id: &str) -> anyhow::Result<SessionRef>;

    async fn children(&self, id: &str) -> anyhow::Result<Vec<SessionRef>>;

    /// Live status for every session the host is tracking. Sessions missing
    /// from the map have been cleaned up.
    async fn status(&self) -> anyhow::Result<HashMap<String, SessionStatus>>;

    async fn messages(&self, id: &str, limit: Option<usize>) -> anyhow::Result<Vec<Message>>;

    /// Send a prompt and wait for the reply round-trip.
    async fn prompt(&self, id: &str, request: PromptRequest) -> anyhow::Result<()>;

    /// Queue a prompt without waiting for the reply.
    async fn prompt_async(&self, id: &str, request: PromptRequest) -> anyhow::Result<()>;

    async fn abort(&self, id: &str) -> anyhow::Result<()>;

    /// Agents currently registered with the host.
    async fn agents(&self) -> anyhow::Result<Vec<AgentInfo>>;

    /// A handle bound to another project directory, when the host scopes
    /// sessions by directory. `None` means this handle already serves every
    /// directory.
    fn scoped(&self, _directory: &str) -> Option<Arc<dyn SessionService>> {
        None
    }
}

#[derive(Clone)]
pub struct OpenCodeClient {
    base_url: String,
    directory: Option<String>,
    client: reqwest::Client,
}

impl OpenCodeClient {
    pub fn new(base_url: impl Into<String>, directory: Option<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            directory: directory.filter(|d| !d.is_empty()),
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Same server, scoped to another project directory.
    pub fn with_directory(&self, directory: Option<String>) -> Self {
        Self {
            base_url: self.base_url.clone(),
            directory: directory.filter(|d| !d.is_empty()),
            client: self.client.clone(),
        }
    }

    fn url(&self, path: &str, directory: Option<&str>) -> String {
        let mut url = format!("{}{}", self.base_url, path);
        let directory = directory
            .filter(|d| !d.is_empty())
            .or(self.directory.as_deref());
        if let Some(dir) = directory {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str("directory=");
            url.push_str(&urlencoding::encode(dir));
        }
        url
    }

    async fn read_json<T: DeserializeOwned>(
        resp: reqwest::Response,
        what: &str,
    ) -> anyhow::Result<T> {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("OpenCode {} failed: {} - {}", what, status, text);
        }
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse OpenCode {} response: {}", what, text))
    }

    async fn expect_success(resp: reqwest::Response, what: &str) -> anyhow::Result<()> {
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("OpenCode {} failed: {} - {}", what, status, text);
        }
        Ok(())
    }

    /// Subscribe to the server's event stream and forward session events.
    ///
    /// The returned handle finishes when the stream ends or the receiver is
    /// dropped.
    pub async fn subscribe_events(
        &self,
    ) -> anyhow::Result<(mpsc::Receiver<SessionEvent>, tokio::task::JoinHandle<()>)> {
        let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(256);

        let event_url = self.url("/event", None);
        let sse_response = self
            .client
            .get(&event_url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .context("Failed to connect to OpenCode /event SSE")?;

        if !sse_response.status().is_success() {
            anyhow::bail!("OpenCode /event failed: {}", sse_response.status());
        }

        let handle = tokio::spawn(async move {
            let mut stream = sse_response.bytes_stream();
            let mut frames = SseFrames::new();

            while let Some(chunk_result) = stream.next().await {
                match chunk_result {
                    Ok(chunk) => {
                        for frame in frames.push(&chunk) {
                            if let Some(event) = parse_sse_event(&frame) {
                                if event_tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("SSE stream error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok((event_rx, handle))
    }
}

#[async_trait]
impl SessionService for OpenCodeClient {
    async fn create_session(
        &self,
        parent_id: Option<&str>,
        title: &str,
        directory: &str,
    ) -> anyhow::Result<SessionRef> {
        let url = self.url("/session", Some(directory));

        let mut body = serde_json::Map::new();
        body.insert("title".to_string(), json!(title));
        if let Some(parent) = parent_id {
            body.insert("parentID".to_string(), json!(parent));
        }

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Failed to call OpenCode /session")?;

        let mut session: SessionRef = Self::read_json(resp, "/session").await?;
        if session.directory.is_empty() {
            session.directory = directory.to_string();
        }
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> anyhow::Result<SessionRef> {
        let url = self.url(&format!("/session/{}", id), None);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to call OpenCode /session/{id}")?;
        Self::read_json(resp, "/session/{id}").await
    }

    async fn children(&self, id: &str) -> anyhow::Result<Vec<SessionRef>> {
        let url = self.url(&format!("/session/{}/children", id), None);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to call OpenCode /session/{id}/children")?;
        Self::read_json(resp, "/session/{id}/children").await
    }

    async fn status(&self) -> anyhow::Result<HashMap<String, SessionStatus>> {
        let url = self.url("/session/status", None);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to call OpenCode /session/status")?;
        Self::read_json(resp, "/session/status").await
    }

    async fn messages(&self, id: &str, limit: Option<usize>) -> anyhow::Result<Vec<Message>> {
        let mut path = format!("/session/{}/message", id);
        if let Some(limit) = limit {
            path.push_str(&format!("?limit={}", limit));
        }
        let url = self.url(&path, None);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to call OpenCode /session/{id}/message")?;
        Self::read_json(resp, "/session/{id}/message").await
    }

    async fn prompt(&self, id: &str, request: PromptRequest) -> anyhow::Result<()> {
        let url = self.url(&format!("/session/{}/message", id), None);
        let resp = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to call OpenCode /session/{id}/message")?;
        Self::expect_success(resp, "message").await
    }

    async fn prompt_async(&self, id: &str, request: PromptRequest) -> anyhow::Result<()> {
        let url = self.url(&format!("/session/{}/prompt_async", id), None);
        let resp = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to call OpenCode /session/{id}/prompt_async")?;
        Self::expect_success(resp, "prompt_async").await
    }

    async fn abort(&self, id: &str) -> anyhow::Result<()> {
        let url = self.url(&format!("/session/{}/abort", id), None);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("Failed to call OpenCode /session/{id}/abort")?;
        Self::expect_success(resp, "abort").await
    }

    async fn agents(&self) -> anyhow::Result<Vec<AgentInfo>> {
        let url = self.url("/agent", None);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to call OpenCode /agent")?;
        Self::read_json(resp, "/agent").await
    }

    fn scoped(&self, directory: &str) -> Option<Arc<dyn SessionService>> {
        Some(Arc::new(self.with_directory(Some(directory.to_string()))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_create_session_sends_parent_and_directory() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/session"))
            .and(query_param("directory", "/work/repo"))
            .and(body_partial_json(json!({ "parentID": "ses_parent", "title": "scan" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "ses_child",
                "parentID": "ses_parent",
                "title": "scan",
                "version": "1"
            })))
            .mount(&server)
            .await;

        let client = OpenCodeClient::new(format!("{}/", server.uri()), None);
        let session = client
            .create_session(Some("ses_parent"), "scan", "/work/repo")
            .await
            .unwrap();

        assert_eq!(session.id, "ses_child");
        assert_eq!(session.parent_id.as_deref(), Some("ses_parent"));
        assert_eq!(session.directory, "/work/repo");
    }

    #[tokio::test]
    async fn test_status_map() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/session/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ses_a": { "type": "busy" },
                "ses_b": { "type": "idle" }
            })))
            .mount(&server)
            .await;

        let client = OpenCodeClient::new(server.uri(), None);
        let status = client.status().await.unwrap();

        assert!(!status["ses_a"].is_idle());
        assert!(status["ses_b"].is_idle());
    }

    #[tokio::test]
    async fn test_messages_with_limit() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/session/ses_1/message"))
            .and(query_param("limit", "5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "info": { "id": "m1", "sessionID": "ses_1", "role": "user", "time": { "created": 1 }, "agent": "build" },
                    "parts": [{ "type": "text", "text": "hello" }]
                }
            ])))
            .mount(&server)
            .await;

        let client = OpenCodeClient::new(server.uri(), None);
        let messages = client.messages("ses_1", Some(5)).await.unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text(), "hello");
    }

    #[tokio::test]
    async fn test_abort_error_is_surfaced() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/session/ses_1/abort"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = OpenCodeClient::new(server.uri(), Some("/work".into()));
        let err = client.abort("ses_1").await.unwrap_err();

        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_prompt_async_accepts_no_content() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/session/ses_1/prompt_async"))
            .and(body_partial_json(json!({ "agent": "explorer" })))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = OpenCodeClient::new(server.uri(), None);
        let request =
            PromptRequest::new(vec![PartInput::text("go")]).agent(Some("explorer".into()));
        client.prompt_async("ses_1", request).await.unwrap();
    }
}

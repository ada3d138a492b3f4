use crate::chat::ChatRequest;
use crate::users::Usage;
use async_trait::async_trait;
use axum::http::StatusCode;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
    Decode,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }
}

/// A full, non-streamed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatCompletion {
    pub created: i64,
    pub content: String,
    pub usage: Usage,
}

/// Successive content chunks; the stream ending is the end-of-stream signal.
pub type ChunkStream = BoxStream<'static, Result<String, UpstreamCallError>>;

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(
        &self,
        api_key: &str,
        request: &ChatRequest,
    ) -> Result<ChatCompletion, UpstreamCallError>;

    async fn complete_stream(
        &self,
        api_key: &str,
        request: &ChatRequest,
    ) -> Result<ChunkStream, UpstreamCallError>;
}

/// OpenAI-compatible `/v1/chat/completions` client.
#[derive(Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }

    fn request(&self, api_key: &str, request: &ChatRequest) -> reqwest::RequestBuilder {
        self.client
            .post(join_url(&self.base_url, "/v1/chat/completions"))
            .bearer_auth(api_key)
            .json(request)
    }
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    #[serde(default)]
    created: i64,
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<ChoiceText>,
    #[serde(default)]
    delta: Option<ChoiceText>,
}

#[derive(Debug, Default, Deserialize)]
struct ChoiceText {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    async fn complete(
        &self,
        api_key: &str,
        request: &ChatRequest,
    ) -> Result<ChatCompletion, UpstreamCallError> {
        let resp = send_checked(self.request(api_key, request).timeout(self.timeout)).await?;
        let status = resp.status();
        let text = resp.text().await.map_err(|err| {
            UpstreamCallError::new(UpstreamErrorKind::Network, Some(status), err.to_string())
        })?;
        let body: CompletionBody = serde_json::from_str(&text).map_err(|err| {
            UpstreamCallError::new(UpstreamErrorKind::Decode, Some(status), err.to_string())
        })?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .ok_or_else(|| {
                UpstreamCallError::new(
                    UpstreamErrorKind::Decode,
                    Some(status),
                    "completion has no choices".to_string(),
                )
            })?;
        Ok(ChatCompletion {
            created: body.created,
            content,
            usage: body.usage,
        })
    }

    async fn complete_stream(
        &self,
        api_key: &str,
        request: &ChatRequest,
    ) -> Result<ChunkStream, UpstreamCallError> {
        // the body of a stream may legitimately outlive any fixed deadline, so only
        // getting the response head is bounded
        let resp = tokio::time::timeout(self.timeout, send_checked(self.request(api_key, request)))
            .await
            .map_err(|_| {
                UpstreamCallError::new(
                    UpstreamErrorKind::Network,
                    Some(StatusCode::GATEWAY_TIMEOUT),
                    "upstream stream open timed out".to_string(),
                )
            })??;

        let events = resp.bytes_stream().eventsource();
        let chunks = events
            .take_while(|event| {
                let done = matches!(event, Ok(ev) if ev.data.trim() == "[DONE]");
                futures_util::future::ready(!done)
            })
            .filter_map(|event| {
                futures_util::future::ready(match event {
                    Ok(ev) => parse_stream_delta(&ev.data).map(Ok),
                    Err(err) => Some(Err(UpstreamCallError::new(
                        UpstreamErrorKind::Network,
                        None,
                        err.to_string(),
                    ))),
                })
            });
        Ok(chunks.boxed())
    }
}

async fn send_checked(req: reqwest::RequestBuilder) -> Result<reqwest::Response, UpstreamCallError> {
    let resp = req
        .send()
        .await
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let code = extract_error_code(&text);
        return Err(UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(status),
            format!("upstream status {}: {}", status, text),
        )
        .with_code(code));
    }
    Ok(resp)
}

/// Content of the first choice's delta; `None` for role-only or empty chunks.
fn parse_stream_delta(data: &str) -> Option<String> {
    let body: CompletionBody = serde_json::from_str(data).ok()?;
    body.choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content)
        .filter(|content| !content.is_empty())
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if path == "v1" {
            path = "";
        } else if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("error")
        .and_then(|v| v.get("code"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

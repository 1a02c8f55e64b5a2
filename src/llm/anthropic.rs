//! Anthropic (Claude) streaming adapter.
//!
//! Key differences from the chat-completions protocol:
//! - the system prompt is a top-level `system` field, never a message
//! - only `user`/`assistant` turns are sent
//! - the stream is a sequence of typed events; text arrives only in
//!   `content_block_delta` events, usage in `message_start`/`message_delta`

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{api_error, error_message, read_event_stream, send, CompletionRequest, LlmProvider};
use crate::error::{ChatError, Result};
use crate::stream::{ChunkSink, SseEvent};
use crate::types::{Role, Usage};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic API client.
pub struct AnthropicProvider {
    api_base: String,
    max_tokens: u32,
    client: reqwest::Client,
}

// --- API Request Types ---

#[derive(Serialize)]
struct ApiRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
    stream: bool,
}

#[derive(Serialize, Debug, PartialEq)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

// --- Stream Event Types ---

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart { message: StartMessage },
    ContentBlockDelta { delta: BlockDelta },
    MessageDelta { usage: Option<ApiUsage> },
    MessageStop,
    Error { error: ApiErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
struct StartMessage {
    usage: Option<ApiUsage>,
}

#[derive(Deserialize, Debug)]
struct BlockDelta {
    text: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone, Copy)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize, Debug)]
struct ApiErrorBody {
    message: String,
}

/// Classify a failed response.
///
/// An auth-class status whose body carries no readable error is reported
/// as a probable cross-origin policy failure. This is a heuristic, not a
/// guarantee.
fn classify_failure(status: StatusCode, body: &str) -> ChatError {
    let auth_class = matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN);
    if auth_class && error_message(body).is_none() {
        return ChatError::CrossOriginPolicy {
            status: status.as_u16(),
        };
    }
    api_error(status, body)
}

impl AnthropicProvider {
    pub fn new(api_base: Option<String>, max_tokens: u32) -> Self {
        Self {
            api_base: api_base.unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            max_tokens,
            client: reqwest::Client::new(),
        }
    }

    fn build_api_request(&self, request: &CompletionRequest) -> ApiRequest {
        let messages = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System && !m.content.trim().is_empty())
            .map(|m| ApiMessage {
                role: m.role.as_str(),
                content: m.content.clone(),
            })
            .collect();

        ApiRequest {
            model: request.model.clone(),
            max_tokens: self.max_tokens,
            system: request.system_prompt.clone(),
            messages,
            stream: true,
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        sink: ChunkSink,
        cancel: CancellationToken,
    ) -> Result<()> {
        let url = format!("{}/v1/messages", self.api_base.trim_end_matches('/'));
        let builder = self
            .client
            .post(&url)
            .header("x-api-key", &request.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&self.build_api_request(request));
        debug!(model = %request.model, "opening Anthropic stream");

        let Some(response) = send(builder, &cancel).await? else {
            return Ok(());
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &body));
        }

        let mut input_tokens = 0;
        let mut stream_error = None;
        read_event_stream(response, &cancel, |event| {
            let SseEvent::Data(payload) = event else {
                return true;
            };
            let Ok(event) = serde_json::from_str::<StreamEvent>(&payload) else {
                return true;
            };
            match event {
                StreamEvent::MessageStart { message } => {
                    input_tokens = message.usage.unwrap_or_default().input_tokens;
                    true
                }
                StreamEvent::ContentBlockDelta { delta } => match delta.text {
                    Some(text) => sink.text(&text),
                    None => true,
                },
                StreamEvent::MessageDelta { usage: Some(usage) } => sink.usage(Usage::new(
                    input_tokens,
                    usage.output_tokens,
                    input_tokens + usage.output_tokens,
                )),
                StreamEvent::MessageStop => false,
                StreamEvent::Error { error } => {
                    warn!(message = %error.message, "Anthropic stream error event");
                    stream_error = Some(ChatError::Api(error.message));
                    false
                }
                StreamEvent::MessageDelta { usage: None } | StreamEvent::Other => true,
            }
        })
        .await?;

        match stream_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn name(&self) -> &str {
        "Anthropic"
    }
}

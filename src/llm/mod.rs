//! LLM provider adapters.
//!
//! This module defines the `LlmProvider` trait that every provider adapter
//! implements, plus the transport helpers they share.
//!
//! Key concepts:
//! - **One contract**: every adapter receives the full message history, a
//!   model id, a credential and an optional system prompt, and writes its
//!   results into a `ChunkSink`. Adapters keep no state between calls.
//! - **Cancellation**: every transport await is raced against a
//!   `CancellationToken`. A cancelled call returns `Ok(())` and writes
//!   nothing more.
//! - **Errors**: non-2xx responses become `ChatError::Api` carrying the
//!   provider's own message when it can be parsed.

pub mod anthropic;
pub mod gemini;
pub mod local;
pub mod openai;
pub mod perplexity;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{RequestBuilder, Response, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::error::{ChatError, Result};
use crate::stream::{ChunkSink, SseDecoder, SseEvent};
use crate::types::Message;

/// Normalized input for one streaming completion.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub api_key: String,
    /// History sent before the current turn started, oldest first.
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
}

/// Trait that all provider adapters implement.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Perform one streaming completion, writing chunks into `sink`.
    ///
    /// Returns normally when the stream ends or `cancel` fires.
    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        sink: ChunkSink,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Return the provider's display name (for logging).
    fn name(&self) -> &str;
}

/// How a transport read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamEnd {
    Completed,
    Cancelled,
}

/// Send a request unless the token fires first.
pub(crate) async fn send(
    builder: RequestBuilder,
    cancel: &CancellationToken,
) -> Result<Option<Response>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(None),
        response = builder.send() => Ok(Some(response?)),
    }
}

/// Pass successful responses through; turn anything else into an error.
pub(crate) async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(api_error(status, &body))
}

/// Build the error for a non-2xx response.
pub(crate) fn api_error(status: StatusCode, body: &str) -> ChatError {
    match error_message(body) {
        Some(message) => ChatError::Api(message),
        None => ChatError::Api(format!("API Error: {}", status_text(status))),
    }
}

pub(crate) fn status_text(status: StatusCode) -> String {
    status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| status.as_u16().to_string())
}

/// Extract a provider error message from `{error:{message}}`,
/// `{error:"..."}` or `{message}` bodies.
pub(crate) fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body.trim()).ok()?;
    let message = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .or_else(|| value.get("error").and_then(|v| v.as_str()))
        .or_else(|| value.get("message").and_then(|v| v.as_str()))?;
    let message = message.trim();
    if message.is_empty() {
        None
    } else {
        Some(message.to_string())
    }
}

/// Drive an event-stream body, handing each decoded event to `on_event`.
///
/// `on_event` returns false to stop reading (e.g. on `[DONE]`). The token
/// is checked before every read, so no event is delivered after it fires.
pub(crate) async fn read_event_stream<F>(
    response: Response,
    cancel: &CancellationToken,
    mut on_event: F,
) -> Result<StreamEnd>
where
    F: FnMut(SseEvent) -> bool,
{
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            next = body.next() => next,
        };
        let Some(chunk) = next else {
            break;
        };
        let bytes = chunk?;
        for event in decoder.push(&bytes) {
            if cancel.is_cancelled() {
                return Ok(StreamEnd::Cancelled);
            }
            if !on_event(event) {
                return Ok(StreamEnd::Completed);
            }
        }
    }

    if let Some(event) = decoder.finish() {
        on_event(event);
    }
    Ok(StreamEnd::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_shapes() {
        assert_eq!(
            error_message(r#"{"error":{"message":"Invalid API key","type":"auth"}}"#),
            Some("Invalid API key".to_string())
        );
        assert_eq!(
            error_message(r#"{"error":"quota exceeded"}"#),
            Some("quota exceeded".to_string())
        );
        assert_eq!(
            error_message(r#"{"message":"bad model"}"#),
            Some("bad model".to_string())
        );
        assert_eq!(error_message("<html>502</html>"), None);
        assert_eq!(error_message(""), None);
    }

    #[test]
    fn test_api_error_uses_body_message() {
        let err = api_error(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"message":"model not found"}}"#,
        );
        assert_eq!(err.to_string(), "model not found");
    }

    #[test]
    fn test_api_error_falls_back_to_status_text() {
        let err = api_error(StatusCode::SERVICE_UNAVAILABLE, "upstream died");
        assert_eq!(err.to_string(), "API Error: Service Unavailable");
    }
}

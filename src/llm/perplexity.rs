//! Perplexity streaming adapter.
//!
//! Perplexity speaks the chat-completions event-stream protocol and adds
//! top-level `citations` (and `search_results`) to the chunks once its
//! search step has finished. Those are forwarded verbatim.

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::openai::{build_messages, ApiRequest, ApiUsage};
use super::{check_status, read_event_stream, send, CompletionRequest, LlmProvider};
use crate::error::Result;
use crate::stream::{ChunkSink, SseEvent, StreamChunk};
use crate::types::Usage;

pub struct PerplexityProvider {
    api_base: String,
    client: reqwest::Client,
}

#[derive(Deserialize, Debug)]
struct StreamResponseChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    citations: Option<Vec<String>>,
    search_results: Option<serde_json::Value>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Debug, Default)]
struct StreamDelta {
    content: Option<String>,
}

fn decode_chunk(payload: &str) -> Option<StreamChunk> {
    let chunk: StreamResponseChunk = serde_json::from_str(payload).ok()?;
    let text = chunk
        .choices
        .first()
        .and_then(|c| c.delta.content.clone())
        .unwrap_or_default();
    Some(StreamChunk {
        text,
        citations: chunk.citations,
        usage: chunk.usage.map(Usage::from),
        extra: chunk.search_results,
    })
}

impl PerplexityProvider {
    pub fn new(api_base: Option<String>) -> Self {
        Self {
            api_base: api_base.unwrap_or_else(|| "https://api.perplexity.ai".to_string()),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LlmProvider for PerplexityProvider {
    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        sink: ChunkSink,
        cancel: CancellationToken,
    ) -> Result<()> {
        let url = format!("{}/chat/completions", self.api_base.trim_end_matches('/'));
        let body = ApiRequest {
            model: request.model.clone(),
            messages: build_messages(request),
            stream: true,
            stream_options: None,
        };
        debug!(model = %request.model, "opening Perplexity stream");

        let builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", request.api_key))
            .header("Content-Type", "application/json")
            .json(&body);

        let Some(response) = send(builder, &cancel).await? else {
            return Ok(());
        };
        let response = check_status(response).await?;

        read_event_stream(response, &cancel, |event| match event {
            SseEvent::Done => false,
            SseEvent::Data(payload) => match decode_chunk(&payload) {
                Some(chunk) => sink.send(chunk),
                None => true,
            },
        })
        .await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "Perplexity"
    }
}

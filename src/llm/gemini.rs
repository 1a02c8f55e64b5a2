//! Google Gemini adapter.
//!
//! One entry point, three behaviors selected by the model catalog:
//! - **Text** models stream `streamGenerateContent` events, with optional
//!   search/maps grounding or a thinking budget. Grounding sources are
//!   deduplicated and re-sent as a growing citation list.
//! - **Image** models make one `generateContent` call and emit images as
//!   Markdown data-URI images.
//! - **Video** models start a long-running operation and poll it until it
//!   is done. Failures become a Markdown notice instead of an error.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{check_status, read_event_stream, send, CompletionRequest, LlmProvider};
use crate::error::{ChatError, Result};
use crate::models::{GeminiTools, ModelCatalog, ModelKind};
use crate::stream::{ChunkSink, SseEvent};
use crate::types::{Message, Role, Usage};

/// Alt text marking a Markdown image reference that is really a video.
pub const VIDEO_ALT_SENTINEL: &str = "VIDEO_PLAYER";

/// How many trailing messages an image request sees.
pub const IMAGE_CONTEXT_TURNS: usize = 4;

const NO_IMAGE_NOTICE: &str = "_No image was generated for this request._";

pub struct GeminiProvider {
    api_base: String,
    client: reqwest::Client,
    catalog: ModelCatalog,
    poll_interval: Duration,
}

// --- API Types ---

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize, Debug, PartialEq)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_modalities: Option<Vec<&'static str>>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    thinking_budget: i32,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Deserialize, Debug)]
struct GroundingChunk {
    web: Option<GroundingSource>,
    maps: Option<GroundingSource>,
}

#[derive(Deserialize, Debug)]
struct GroundingSource {
    uri: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
}

impl From<UsageMetadata> for Usage {
    fn from(u: UsageMetadata) -> Self {
        Usage::new(u.prompt_token_count, u.candidates_token_count, u.total_token_count)
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Operation {
    name: Option<String>,
    #[serde(default)]
    done: bool,
    error: Option<OperationError>,
    response: Option<OperationResponse>,
}

#[derive(Deserialize, Debug)]
struct OperationError {
    message: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct OperationResponse {
    generate_video_response: Option<VideoResponse>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct VideoResponse {
    #[serde(default)]
    generated_samples: Vec<VideoSample>,
}

#[derive(Deserialize, Debug)]
struct VideoSample {
    video: Option<VideoRef>,
}

#[derive(Deserialize, Debug)]
struct VideoRef {
    uri: Option<String>,
}

// --- Request building ---

fn text_part(text: impl Into<String>) -> Part {
    Part {
        text: Some(text.into()),
        inline_data: None,
    }
}

fn data_part(mime_type: &str, data: &str) -> Part {
    Part {
        text: None,
        inline_data: Some(InlineData {
            mime_type: mime_type.to_string(),
            data: data.to_string(),
        }),
    }
}

fn gemini_role(role: Role) -> Option<&'static str> {
    match role {
        Role::User => Some("user"),
        Role::Assistant => Some("model"),
        Role::System => None,
    }
}

/// Split Markdown data-URI images out of `content` so earlier generated
/// images can be sent back for editing.
fn split_inline_images(content: &str) -> (String, Vec<InlineData>) {
    let mut text = String::new();
    let mut images = Vec::new();
    let mut rest = content;

    while let Some(start) = rest.find("![") {
        let after = &rest[start..];
        let parsed = after.find(']').and_then(|open| {
            let uri_start = open + "](".len();
            if !after[open..].starts_with("](data:") {
                return None;
            }
            let close = after[uri_start..].find(')')?;
            let uri = &after[uri_start..uri_start + close];
            let (meta, data) = uri.strip_prefix("data:")?.split_once(";base64,")?;
            Some((uri_start + close + 1, meta.to_string(), data.to_string()))
        });
        match parsed {
            Some((consumed, mime_type, data)) => {
                text.push_str(&rest[..start]);
                images.push(InlineData { mime_type, data });
                rest = &after[consumed..];
            }
            None => {
                text.push_str(&rest[..start + 2]);
                rest = &rest[start + 2..];
            }
        }
    }
    text.push_str(rest);
    (text.trim().to_string(), images)
}

fn message_parts(msg: &Message, inline_history_images: bool) -> Vec<Part> {
    let mut parts = Vec::new();
    let (text, images) = if inline_history_images {
        split_inline_images(&msg.content)
    } else {
        (msg.content.clone(), Vec::new())
    };
    if !text.trim().is_empty() {
        parts.push(text_part(text));
    }
    for image in images {
        parts.push(data_part(&image.mime_type, &image.data));
    }
    for attachment in &msg.attachments {
        parts.push(data_part(&attachment.mime_type, &attachment.data));
    }
    parts
}

fn build_contents(messages: &[Message], inline_history_images: bool) -> Vec<Content> {
    messages
        .iter()
        .filter_map(|msg| {
            let role = gemini_role(msg.role)?;
            let parts = message_parts(msg, inline_history_images);
            if parts.is_empty() {
                None
            } else {
                Some(Content {
                    role: Some(role),
                    parts,
                })
            }
        })
        .collect()
}

fn system_instruction(request: &CompletionRequest) -> Option<Content> {
    request.system_prompt.as_ref().map(|prompt| Content {
        role: None,
        parts: vec![text_part(prompt.clone())],
    })
}

fn build_text_request(request: &CompletionRequest, tools: GeminiTools) -> GenerateRequest {
    let mut body = GenerateRequest {
        contents: build_contents(&request.messages, false),
        system_instruction: system_instruction(request),
        tools: Vec::new(),
        generation_config: None,
    };
    match tools {
        GeminiTools::Plain => {}
        GeminiTools::SearchGrounding => body.tools.push(serde_json::json!({ "google_search": {} })),
        GeminiTools::MapsGrounding => body.tools.push(serde_json::json!({ "googleMaps": {} })),
        GeminiTools::Thinking { budget } => {
            body.generation_config = Some(GenerationConfig {
                thinking_config: Some(ThinkingConfig {
                    thinking_budget: budget,
                }),
                ..GenerationConfig::default()
            })
        }
    }
    body
}

fn build_image_request(request: &CompletionRequest) -> GenerateRequest {
    let start = request.messages.len().saturating_sub(IMAGE_CONTEXT_TURNS);
    GenerateRequest {
        contents: build_contents(&request.messages[start..], true),
        system_instruction: None,
        tools: Vec::new(),
        generation_config: Some(GenerationConfig {
            response_modalities: Some(vec!["TEXT", "IMAGE"]),
            ..GenerationConfig::default()
        }),
    }
}

/// Deduplicating, order-preserving citation accumulator.
#[derive(Debug, Default)]
struct Citations {
    seen: HashSet<String>,
    urls: Vec<String>,
}

impl Citations {
    fn absorb(&mut self, metadata: &GroundingMetadata) {
        for chunk in &metadata.grounding_chunks {
            for source in [&chunk.web, &chunk.maps].into_iter().flatten() {
                if let Some(uri) = &source.uri {
                    if self.seen.insert(uri.clone()) {
                        self.urls.push(uri.clone());
                    }
                }
            }
        }
    }
}

/// Append the credential to a video asset URL.
fn video_url_with_key(uri: &str, api_key: &str) -> String {
    let separator = if uri.contains('?') { '&' } else { '?' };
    format!("{}{}key={}", uri, separator, api_key)
}

fn video_markdown(uri: &str, api_key: &str) -> String {
    format!("![{}]({})", VIDEO_ALT_SENTINEL, video_url_with_key(uri, api_key))
}

impl GeminiProvider {
    pub fn new(api_base: Option<String>, catalog: ModelCatalog, poll_interval: Duration) -> Self {
        Self {
            api_base: api_base
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string()),
            client: reqwest::Client::new(),
            catalog,
            poll_interval,
        }
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!(
            "{}/v1beta/models/{}:{}",
            self.api_base.trim_end_matches('/'),
            model,
            method
        )
    }

    async fn stream_text(
        &self,
        request: &CompletionRequest,
        tools: GeminiTools,
        sink: &ChunkSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let url = self.model_url(&request.model, "streamGenerateContent");
        let builder = self
            .client
            .post(&url)
            .query(&[("alt", "sse")])
            .header("x-goog-api-key", &request.api_key)
            .json(&build_text_request(request, tools));

        let Some(response) = send(builder, cancel).await? else {
            return Ok(());
        };
        let response = check_status(response).await?;

        let mut citations = Citations::default();
        read_event_stream(response, cancel, |event| {
            let SseEvent::Data(payload) = event else {
                return true;
            };
            let Ok(chunk) = serde_json::from_str::<GenerateResponse>(&payload) else {
                debug!("skipping malformed Gemini chunk");
                return true;
            };
            let mut alive = true;
            if let Some(candidate) = chunk.candidates.first() {
                if let Some(content) = &candidate.content {
                    for part in &content.parts {
                        if let Some(text) = &part.text {
                            alive &= sink.text(text);
                        }
                    }
                }
                if let Some(metadata) = &candidate.grounding_metadata {
                    citations.absorb(metadata);
                    alive &= sink.citations(citations.urls.clone());
                }
            }
            if let Some(usage) = chunk.usage_metadata {
                alive &= sink.usage(usage.into());
            }
            alive
        })
        .await?;
        Ok(())
    }

    async fn generate_image(
        &self,
        request: &CompletionRequest,
        sink: &ChunkSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let url = self.model_url(&request.model, "generateContent");
        let builder = self
            .client
            .post(&url)
            .header("x-goog-api-key", &request.api_key)
            .json(&build_image_request(request));

        let Some(response) = send(builder, cancel).await? else {
            return Ok(());
        };
        let response = check_status(response).await?;
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            body = response.text() => body?,
        };
        let parsed: GenerateResponse = serde_json::from_str(&body)?;

        let mut produced_image = false;
        let parts = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts)
            .unwrap_or_default();
        for part in parts {
            if let Some(image) = part.inline_data {
                produced_image = true;
                sink.text(&format!(
                    "![Generated image](data:{};base64,{})\n\n",
                    image.mime_type, image.data
                ));
            } else if let Some(text) = part.text {
                sink.text(&text);
            }
        }
        if !produced_image {
            sink.text(&format!("\n\n{}", NO_IMAGE_NOTICE));
        }
        if let Some(usage) = parsed.usage_metadata {
            sink.usage(usage.into());
        }
        Ok(())
    }

    /// Start a video operation and poll it. `Ok(None)` means cancelled.
    async fn run_video_operation(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let prompt_msg = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .ok_or_else(|| ChatError::Api("No prompt to generate a video from".to_string()))?;

        let mut instance = serde_json::json!({ "prompt": prompt_msg.content });
        if let Some(image) = prompt_msg.attachments.iter().find(|a| a.is_image()) {
            instance["image"] = serde_json::json!({
                "bytesBase64Encoded": image.data,
                "mimeType": image.mime_type,
            });
        }

        let url = self.model_url(&request.model, "predictLongRunning");
        let builder = self
            .client
            .post(&url)
            .header("x-goog-api-key", &request.api_key)
            .json(&serde_json::json!({ "instances": [instance] }));
        let Some(response) = send(builder, cancel).await? else {
            return Ok(None);
        };
        let mut operation: Operation = check_status(response).await?.json().await?;
        let name = operation
            .name
            .clone()
            .ok_or_else(|| ChatError::Api("Video operation has no name".to_string()))?;
        info!(operation = %name, "video generation started");

        let poll_url = format!("{}/v1beta/{}", self.api_base.trim_end_matches('/'), name);
        while !operation.done {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            let builder = self
                .client
                .get(&poll_url)
                .header("x-goog-api-key", &request.api_key);
            let Some(response) = send(builder, cancel).await? else {
                return Ok(None);
            };
            operation = check_status(response).await?.json().await?;
            debug!(operation = %name, done = operation.done, "polled video operation");
        }

        if let Some(error) = operation.error {
            return Err(ChatError::Api(error.message));
        }
        operation
            .response
            .and_then(|r| r.generate_video_response)
            .and_then(|r| r.generated_samples.into_iter().next())
            .and_then(|s| s.video)
            .and_then(|v| v.uri)
            .map(Some)
            .ok_or_else(|| ChatError::Api("The operation finished without a video".to_string()))
    }

    async fn generate_video(
        &self,
        request: &CompletionRequest,
        sink: &ChunkSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self.run_video_operation(request, cancel).await {
            Ok(Some(uri)) => {
                sink.text(&video_markdown(&uri, &request.api_key));
            }
            Ok(None) => {}
            Err(err) => {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                warn!(error = %err, "video generation failed");
                sink.text(&format!("**Video generation failed:** {}", err));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        sink: ChunkSink,
        cancel: CancellationToken,
    ) -> Result<()> {
        let spec = self.catalog.resolve(&request.model)?;
        debug!(model = %request.model, kind = ?spec.kind, "opening Gemini request");
        match spec.kind {
            ModelKind::GeminiVideo => self.generate_video(request, &sink, &cancel).await,
            ModelKind::GeminiImage => self.generate_image(request, &sink, &cancel).await,
            ModelKind::Gemini(tools) => self.stream_text(request, tools, &sink, &cancel).await,
            ModelKind::Chat => self.stream_text(request, GeminiTools::Plain, &sink, &cancel).await,
        }
    }

    fn name(&self) -> &str {
        "Google"
    }
}

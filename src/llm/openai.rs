//! OpenAI chat-completions streaming adapter.
//!
//! Also used, without authentication, for OpenAI-compatible local runtimes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{check_status, read_event_stream, send, CompletionRequest, LlmProvider, StreamEnd};
use crate::error::Result;
use crate::stream::{ChunkSink, SseEvent, StreamChunk};
use crate::types::{Role, Usage};

pub struct OpenAiProvider {
    api_base: String,
    client: reqwest::Client,
    authenticate: bool,
    name: String,
}

// --- API Request Types (OpenAI format) ---

#[derive(Serialize)]
pub(crate) struct ApiRequest {
    pub model: String,
    pub messages: Vec<ApiMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
pub(crate) struct StreamOptions {
    pub include_usage: bool,
}

#[derive(Serialize, Debug, PartialEq)]
pub(crate) struct ApiMessage {
    pub role: &'static str,
    pub content: String,
}

// --- Streaming Response Types ---

#[derive(Deserialize, Debug)]
struct StreamResponseChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Copy)]
pub(crate) struct ApiUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage::new(u.prompt_tokens, u.completion_tokens, u.total_tokens)
    }
}

/// Map history to chat-completions messages, system prompt first.
pub(crate) fn build_messages(request: &CompletionRequest) -> Vec<ApiMessage> {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = &request.system_prompt {
        messages.push(ApiMessage {
            role: Role::System.as_str(),
            content: system.clone(),
        });
    }
    for msg in &request.messages {
        messages.push(ApiMessage {
            role: msg.role.as_str(),
            content: msg.content.clone(),
        });
    }
    messages
}

/// Decode one `data:` payload. Malformed JSON yields `None`.
fn decode_chunk(payload: &str) -> Option<StreamChunk> {
    let chunk: StreamResponseChunk = serde_json::from_str(payload).ok()?;
    let text = chunk
        .choices
        .first()
        .and_then(|c| c.delta.content.clone())
        .unwrap_or_default();
    Some(StreamChunk {
        text,
        usage: chunk.usage.map(Usage::from),
        ..StreamChunk::default()
    })
}

impl OpenAiProvider {
    pub fn new(api_base: Option<String>) -> Self {
        Self {
            api_base: api_base.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            client: reqwest::Client::new(),
            authenticate: true,
            name: "OpenAI".to_string(),
        }
    }

    /// An unauthenticated client for an OpenAI-compatible server.
    pub(crate) fn compatible(api_base: String, name: &str) -> Self {
        Self {
            api_base,
            client: reqwest::Client::new(),
            authenticate: false,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
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
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        };
        debug!(provider = %self.name, model = %request.model, "opening stream");

        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body);
        if self.authenticate {
            builder = builder.header("Authorization", format!("Bearer {}", request.api_key));
        }

        let Some(response) = send(builder, &cancel).await? else {
            return Ok(());
        };
        let response = check_status(response).await?;

        let end = read_event_stream(response, &cancel, |event| match event {
            SseEvent::Done => false,
            SseEvent::Data(payload) => match decode_chunk(&payload) {
                Some(chunk) => sink.send(chunk),
                None => {
                    debug!(provider = %self.name, "skipping malformed chunk");
                    true
                }
            },
        })
        .await?;

        if end == StreamEnd::Cancelled {
            debug!(provider = %self.name, "stream cancelled");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use crate::types::Message;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(system: Option<&str>) -> CompletionRequest {
        CompletionRequest {
            model: "gpt-4o".into(),
            api_key: "sk-test".into(),
            messages: vec![Message::user("Why is the sky blue?", 1)],
            system_prompt: system.map(str::to_string),
        }
    }

    async fn collect(
        provider: &OpenAiProvider,
        request: &CompletionRequest,
    ) -> (Result<()>, Vec<StreamChunk>) {
        let (sink, mut rx) = ChunkSink::channel();
        let result = provider
            .stream_completion(request, sink, CancellationToken::new())
            .await;
        let mut chunks = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            chunks.push(chunk);
        }
        (result, chunks)
    }

    #[test]
    fn test_system_prompt_leads_messages() {
        let messages = build_messages(&request(Some("be brief")));
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[0].content, "be brief");
        assert_eq!(messages[1].role, "user");
        assert_eq!(build_messages(&request(None)).len(), 1);
    }

    #[test]
    fn test_decode_chunk_with_usage_only() {
        let chunk = decode_chunk(
            r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":7,"total_tokens":12}}"#,
        )
        .unwrap();
        assert_eq!(chunk.text, "");
        assert_eq!(chunk.usage, Some(Usage::new(5, 7, 12)));
        assert!(decode_chunk("{not json").is_none());
    }

    #[tokio::test]
    async fn test_streams_text_and_usage() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Ray\"}}]}\n\n",
            "data: {broken\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"leigh\"}}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({"stream": true, "model": "gpt-4o"})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(Some(server.uri()));
        let (result, chunks) = collect(&provider, &request(None)).await;
        result.unwrap();

        let text: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(text, "Rayleigh");
        let usage = chunks.iter().filter_map(|c| c.usage).last();
        assert_eq!(usage, Some(Usage::new(3, 2, 5)));
    }

    #[tokio::test]
    async fn test_error_body_message_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(
                serde_json::json!({"error": {"message": "Incorrect API key provided"}}),
            ))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(Some(server.uri()));
        let (result, chunks) = collect(&provider, &request(None)).await;
        let err = result.unwrap_err();
        assert!(matches!(&err, ChatError::Api(m) if m == "Incorrect API key provided"));
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_error_uses_status_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("<html>bad gateway</html>"))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(Some(server.uri()));
        let (result, _) = collect(&provider, &request(None)).await;
        assert_eq!(result.unwrap_err().to_string(), "API Error: Bad Gateway");
    }

    #[tokio::test]
    async fn test_cancelled_before_send_is_silent() {
        let server = MockServer::start().await;
        let provider = OpenAiProvider::new(Some(server.uri()));
        let (sink, mut rx) = ChunkSink::channel();
        let cancel = CancellationToken::new();
        cancel.cancel();
        provider
            .stream_completion(&request(None), sink, cancel)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_mid_body_is_silent() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let event = "data: {\"choices\":[{\"delta\":{\"content\":\"first\"}}]}\n\n";
            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n";
            let chunk = format!("{:x}\r\n{}\r\n", event.len(), event);
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(chunk.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
            // stall with the body still open
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            drop(socket);
        });

        let provider = OpenAiProvider::new(Some(format!("http://{}", addr)));
        let (sink, mut rx) = ChunkSink::channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { provider.stream_completion(&request(None), sink, cancel).await }
        });

        let first = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.text, "first");

        cancel.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(rx.recv().await.is_none());
    }
}

//! Local model adapter.
//!
//! Talks to an OpenAI-compatible runtime on the user's machine (Ollama,
//! llama.cpp server, LM Studio). No credential is sent.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::openai::OpenAiProvider;
use super::{CompletionRequest, LlmProvider};
use crate::error::Result;
use crate::stream::ChunkSink;

pub struct LocalProvider {
    inner: OpenAiProvider,
}

impl LocalProvider {
    pub fn new(api_base: String) -> Self {
        Self {
            inner: OpenAiProvider::compatible(api_base, "Local"),
        }
    }
}

#[async_trait]
impl LlmProvider for LocalProvider {
    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        sink: ChunkSink,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.inner.stream_completion(request, sink, cancel).await
    }

    fn name(&self) -> &str {
        "Local"
    }
}

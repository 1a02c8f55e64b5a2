//! Completion dispatcher.
//!
//! The only place that knows which adapter serves which model. It resolves
//! the model id through the catalog, picks the matching credential and
//! refuses to start a request without one, before any network activity.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{AppConfig, ProviderKeys, Settings};
use crate::error::{ChatError, Result};
use crate::llm::anthropic::AnthropicProvider;
use crate::llm::gemini::GeminiProvider;
use crate::llm::local::LocalProvider;
use crate::llm::openai::OpenAiProvider;
use crate::llm::perplexity::PerplexityProvider;
use crate::llm::{CompletionRequest, LlmProvider};
use crate::models::{ModelCatalog, Provider};
use crate::stream::ChunkSink;
use crate::types::Message;

/// A resolved model: which provider, which credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub provider: Provider,
    pub model: String,
    pub api_key: String,
}

pub struct Dispatcher {
    catalog: ModelCatalog,
    adapters: HashMap<Provider, Arc<dyn LlmProvider>>,
}

impl Dispatcher {
    /// A dispatcher with no adapters registered.
    pub fn new(catalog: ModelCatalog) -> Self {
        Self {
            catalog,
            adapters: HashMap::new(),
        }
    }

    /// Register every built-in adapter using the configured endpoints.
    pub fn from_config(config: &AppConfig) -> Self {
        let endpoints = &config.endpoints;
        let catalog = config.catalog();
        let poll = Duration::from_secs(config.request.video_poll_secs);

        Self::new(catalog.clone())
            .with_adapter(
                Provider::Perplexity,
                Arc::new(PerplexityProvider::new(endpoints.perplexity.clone())),
            )
            .with_adapter(
                Provider::OpenAi,
                Arc::new(OpenAiProvider::new(endpoints.openai.clone())),
            )
            .with_adapter(
                Provider::Anthropic,
                Arc::new(AnthropicProvider::new(
                    endpoints.anthropic.clone(),
                    config.request.max_tokens,
                )),
            )
            .with_adapter(
                Provider::Google,
                Arc::new(GeminiProvider::new(endpoints.google.clone(), catalog, poll)),
            )
            .with_adapter(
                Provider::Local,
                Arc::new(LocalProvider::new(config.local.api_base.clone())),
            )
    }

    pub fn with_adapter(mut self, provider: Provider, adapter: Arc<dyn LlmProvider>) -> Self {
        self.adapters.insert(provider, adapter);
        self
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Resolve the active model in `settings`.
    pub fn resolve(&self, settings: &Settings) -> Result<Route> {
        self.route_for(&settings.model, &settings.keys)
    }

    pub fn route_for(&self, model: &str, keys: &ProviderKeys) -> Result<Route> {
        let spec = self.catalog.resolve(model)?;
        let api_key = match spec.provider.key_field(keys) {
            Some(key) if key.trim().is_empty() => {
                return Err(ChatError::MissingCredential {
                    provider: spec.provider,
                    model: spec.label.clone(),
                })
            }
            Some(key) => key.trim().to_string(),
            None => String::new(),
        };
        Ok(Route {
            provider: spec.provider,
            model: spec.id.clone(),
            api_key,
        })
    }

    /// Run one streaming completion on the adapter for `route`.
    pub async fn run(
        &self,
        route: &Route,
        messages: Vec<Message>,
        system_prompt: Option<String>,
        sink: ChunkSink,
        cancel: CancellationToken,
    ) -> Result<()> {
        let adapter = self
            .adapters
            .get(&route.provider)
            .ok_or_else(|| ChatError::Api(format!("{} is not available", route.provider)))?;
        debug!(
            adapter = adapter.name(),
            model = %route.model,
            history = messages.len(),
            "dispatching completion"
        );
        let request = CompletionRequest {
            model: route.model.clone(),
            api_key: route.api_key.clone(),
            messages,
            system_prompt,
        };
        adapter.stream_completion(&request, sink, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAdapter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for CountingAdapter {
        async fn stream_completion(
            &self,
            request: &CompletionRequest,
            sink: ChunkSink,
            _cancel: CancellationToken,
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            sink.text(&format!("{} via {}", request.model, request.api_key));
            Ok(())
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn keys() -> ProviderKeys {
        ProviderKeys {
            perplexity: "pplx".into(),
            openai: String::new(),
            anthropic: "  ".into(),
            google: "goog".into(),
        }
    }

    #[test]
    fn test_route_resolves_provider_and_key() {
        let dispatcher = Dispatcher::new(ModelCatalog::default());
        let route = dispatcher.route_for("sonar-pro", &keys()).unwrap();
        assert_eq!(route.provider, Provider::Perplexity);
        assert_eq!(route.api_key, "pplx");

        let route = dispatcher.route_for("gemini-2.5-pro", &keys()).unwrap();
        assert_eq!(route.provider, Provider::Google);
        assert_eq!(route.api_key, "goog");
    }

    #[test]
    fn test_missing_and_blank_credentials_fail() {
        let dispatcher = Dispatcher::new(ModelCatalog::default());
        let err = dispatcher.route_for("gpt-4o", &keys()).unwrap_err();
        assert!(matches!(err, ChatError::MissingCredential { provider: Provider::OpenAi, .. }));
        assert!(err.to_string().contains("OpenAI API key"));

        let err = dispatcher
            .route_for("claude-haiku-4-5-20251001", &keys())
            .unwrap_err();
        assert!(matches!(err, ChatError::MissingCredential { provider: Provider::Anthropic, .. }));
    }

    #[test]
    fn test_local_models_need_no_key() {
        let dispatcher = Dispatcher::new(ModelCatalog::new(&["qwen2.5".to_string()]));
        let route = dispatcher.route_for("qwen2.5", &ProviderKeys::default()).unwrap();
        assert_eq!(route.provider, Provider::Local);
        assert!(route.api_key.is_empty());
    }

    #[tokio::test]
    async fn test_run_calls_exactly_the_matching_adapter() {
        let perplexity = Arc::new(CountingAdapter { calls: AtomicUsize::new(0) });
        let google = Arc::new(CountingAdapter { calls: AtomicUsize::new(0) });
        let dispatcher = Dispatcher::new(ModelCatalog::default())
            .with_adapter(Provider::Perplexity, perplexity.clone())
            .with_adapter(Provider::Google, google.clone());

        let route = dispatcher.route_for("sonar", &keys()).unwrap();
        let (sink, mut rx) = ChunkSink::channel();
        dispatcher
            .run(&route, vec![], None, sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(perplexity.calls.load(Ordering::SeqCst), 1);
        assert_eq!(google.calls.load(Ordering::SeqCst), 0);
        assert_eq!(rx.try_recv().unwrap().text, "sonar via pplx");
    }
}

//! Model catalog.
//!
//! Every model id the client can talk to maps to exactly one provider and
//! one behavior. The table is closed: lookups of unknown ids fail with a
//! configuration error instead of silently falling back to a default.

use std::fmt;

use crate::config::ProviderKeys;
use crate::error::{ChatError, Result};

/// The provider that serves a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Perplexity,
    OpenAi,
    Anthropic,
    Google,
    Local,
}

impl Provider {
    pub const ALL: [Provider; 5] = [
        Provider::Perplexity,
        Provider::OpenAi,
        Provider::Anthropic,
        Provider::Google,
        Provider::Local,
    ];

    /// The single credential field for this provider.
    ///
    /// Returns `None` for providers that do not authenticate.
    pub fn key_field<'a>(&self, keys: &'a ProviderKeys) -> Option<&'a str> {
        match self {
            Provider::Perplexity => Some(&keys.perplexity),
            Provider::OpenAi => Some(&keys.openai),
            Provider::Anthropic => Some(&keys.anthropic),
            Provider::Google => Some(&keys.google),
            Provider::Local => None,
        }
    }

    pub fn parse(name: &str) -> Option<Provider> {
        match name.to_ascii_lowercase().as_str() {
            "perplexity" => Some(Provider::Perplexity),
            "openai" => Some(Provider::OpenAi),
            "anthropic" | "claude" => Some(Provider::Anthropic),
            "google" | "gemini" => Some(Provider::Google),
            "local" => Some(Provider::Local),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Provider::Perplexity => "Perplexity",
            Provider::OpenAi => "OpenAI",
            Provider::Anthropic => "Anthropic",
            Provider::Google => "Google",
            Provider::Local => "Local",
        };
        f.write_str(name)
    }
}

/// Optional tool configuration attached to Gemini text models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeminiTools {
    Plain,
    SearchGrounding,
    Thinking { budget: i32 },
    MapsGrounding,
}

/// How the adapter has to talk to a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Streaming chat completion.
    Chat,
    /// Gemini streaming text/multimodal generation.
    Gemini(GeminiTools),
    /// Gemini one-shot image generation or editing.
    GeminiImage,
    /// Gemini long-running video generation.
    GeminiVideo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub id: String,
    pub label: String,
    pub provider: Provider,
    pub kind: ModelKind,
}

impl ModelSpec {
    fn builtin(id: &str, label: &str, provider: Provider, kind: ModelKind) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            provider,
            kind,
        }
    }
}

/// Model used for fire-and-forget conversation titles.
pub const TITLE_MODEL: &str = "sonar";

/// Provider able to produce auto-titles.
pub const TITLE_PROVIDER: Provider = Provider::Perplexity;

fn builtin_models() -> Vec<ModelSpec> {
    use GeminiTools::*;
    use ModelKind::*;
    use Provider::*;

    vec![
        ModelSpec::builtin("sonar", "Sonar", Perplexity, Chat),
        ModelSpec::builtin("sonar-pro", "Sonar Pro", Perplexity, Chat),
        ModelSpec::builtin("sonar-reasoning-pro", "Sonar Reasoning Pro", Perplexity, Chat),
        ModelSpec::builtin("sonar-deep-research", "Sonar Deep Research", Perplexity, Chat),
        ModelSpec::builtin("gpt-4o", "GPT-4o", OpenAi, Chat),
        ModelSpec::builtin("gpt-4o-mini", "GPT-4o mini", OpenAi, Chat),
        ModelSpec::builtin("gpt-4.1", "GPT-4.1", OpenAi, Chat),
        ModelSpec::builtin("claude-sonnet-4-5-20250929", "Claude Sonnet 4.5", Anthropic, Chat),
        ModelSpec::builtin("claude-haiku-4-5-20251001", "Claude Haiku 4.5", Anthropic, Chat),
        ModelSpec::builtin("claude-opus-4-1-20250805", "Claude Opus 4.1", Anthropic, Chat),
        ModelSpec::builtin("gemini-2.5-flash", "Gemini 2.5 Flash (Search)", Google, Gemini(SearchGrounding)),
        ModelSpec::builtin(
            "gemini-2.5-pro",
            "Gemini 2.5 Pro (Thinking)",
            Google,
            Gemini(Thinking { budget: 8192 }),
        ),
        ModelSpec::builtin("gemini-2.5-flash-lite", "Gemini 2.5 Flash Lite (Maps)", Google, Gemini(MapsGrounding)),
        ModelSpec::builtin("gemini-2.0-flash", "Gemini 2.0 Flash", Google, Gemini(Plain)),
        ModelSpec::builtin("gemini-2.5-flash-image", "Gemini 2.5 Flash Image", Google, GeminiImage),
        ModelSpec::builtin("veo-3.0-generate-001", "Veo 3", Google, GeminiVideo),
    ]
}

/// Lookup table from model id to provider and behavior.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: Vec<ModelSpec>,
}

impl ModelCatalog {
    /// Built-in models plus the ids served by a local runtime.
    pub fn new(local_models: &[String]) -> Self {
        let mut models = builtin_models();
        for id in local_models {
            if models.iter().any(|m| &m.id == id) {
                continue;
            }
            models.push(ModelSpec {
                id: id.clone(),
                label: format!("{} (local)", id),
                provider: Provider::Local,
                kind: ModelKind::Chat,
            });
        }
        Self { models }
    }

    pub fn resolve(&self, id: &str) -> Result<&ModelSpec> {
        self.models
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| ChatError::UnknownModel(id.to_string()))
    }

    pub fn models(&self) -> &[ModelSpec] {
        &self.models
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new(&[])
    }
}

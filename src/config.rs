//! Configuration management for parley.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::{ModelCatalog, Provider};
use crate::prompt::FocusMode;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub endpoints: EndpointsConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub request: RequestConfig,
    /// Set when the model came from `--model` or `PARLEY_MODEL`; stored
    /// settings then do not replace it.
    #[serde(skip)]
    pub model_pinned: bool,
}

// --- Settings ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

/// One credential per provider. Empty string means "not configured".
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ProviderKeys {
    #[serde(default)]
    pub perplexity: String,
    #[serde(default)]
    pub openai: String,
    #[serde(default)]
    pub anthropic: String,
    #[serde(default)]
    pub google: String,
}

impl ProviderKeys {
    pub fn set(&mut self, provider: Provider, key: String) {
        match provider {
            Provider::Perplexity => self.perplexity = key,
            Provider::OpenAi => self.openai = key,
            Provider::Anthropic => self.anthropic = key,
            Provider::Google => self.google = key,
            Provider::Local => {}
        }
    }

    /// Fill empty fields from `other`; non-empty fields here always win.
    fn fill_missing(&mut self, other: &ProviderKeys) {
        for provider in Provider::ALL {
            let mine = provider.key_field(self).unwrap_or_default();
            let theirs = provider.key_field(other).unwrap_or_default();
            if mine.is_empty() && !theirs.is_empty() {
                self.set(provider, theirs.to_string());
            }
        }
    }
}

/// Process-wide user settings. Persisted with the user's data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub theme: Theme,
    #[serde(default)]
    pub focus: FocusMode,
    #[serde(default)]
    pub system_instruction: String,
    #[serde(default)]
    pub project_context: String,
    #[serde(default)]
    pub keys: ProviderKeys,
}

fn default_model() -> String {
    "sonar".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: default_model(),
            theme: Theme::default(),
            focus: FocusMode::default(),
            system_instruction: String::new(),
            project_context: String::new(),
            keys: ProviderKeys::default(),
        }
    }
}

impl Settings {
    /// Apply settings loaded from the remote store on top of local ones.
    ///
    /// Remote values replace local preferences when they are set, but a
    /// locally configured credential is never overwritten by a remote one.
    pub fn overlay_remote(&mut self, remote: &Settings) {
        if !remote.model.is_empty() {
            self.model = remote.model.clone();
        }
        self.theme = remote.theme;
        self.focus = remote.focus;
        if !remote.system_instruction.is_empty() {
            self.system_instruction = remote.system_instruction.clone();
        }
        if !remote.project_context.is_empty() {
            self.project_context = remote.project_context.clone();
        }
        self.keys.fill_missing(&remote.keys);
    }
}

// --- Endpoints / local runtime / storage / request ---

/// Base URL overrides, e.g. to route a provider through a proxy.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EndpointsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perplexity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anthropic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    #[serde(default = "default_local_base")]
    pub api_base: String,
    #[serde(default = "default_local_models")]
    pub models: Vec<String>,
}

fn default_local_base() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_local_models() -> Vec<String> {
    vec!["llama3.2".to_string()]
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            api_base: default_local_base(),
            models: default_local_models(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_user_id")]
    pub user_id: String,
    /// Defaults to `~/.parley/data` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_user_id() -> String {
    "local".to_string()
}

fn default_debounce_ms() -> u64 {
    1500
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            user_id: default_user_id(),
            data_dir: None,
            debounce_ms: default_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_video_poll_secs")]
    pub video_poll_secs: u64,
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_video_poll_secs() -> u64 {
    5
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            video_poll_secs: default_video_poll_secs(),
        }
    }
}

const KEY_ENV_VARS: [(Provider, &str); 4] = [
    (Provider::Perplexity, "PERPLEXITY_API_KEY"),
    (Provider::OpenAi, "OPENAI_API_KEY"),
    (Provider::Anthropic, "ANTHROPIC_API_KEY"),
    (Provider::Google, "GEMINI_API_KEY"),
];

impl AppConfig {
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".parley"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load from `path`, apply environment overrides and validate the
    /// active model against the catalog.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config: AppConfig = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(model) = std::env::var("PARLEY_MODEL") {
            config.pin_model(model);
        }
        if let Ok(user) = std::env::var("PARLEY_USER") {
            config.storage.user_id = user;
        }
        for (provider, var) in KEY_ENV_VARS {
            let missing = provider
                .key_field(&config.settings.keys)
                .map_or(false, str::is_empty);
            if missing {
                if let Ok(key) = std::env::var(var) {
                    config.settings.keys.set(provider, key);
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Select `model` for this run, ahead of any stored preference.
    pub fn pin_model(&mut self, model: String) {
        self.settings.model = model;
        self.model_pinned = true;
    }

    pub fn validate(&self) -> Result<()> {
        self.catalog()
            .resolve(&self.settings.model)
            .with_context(|| "Invalid settings.model in config")?;
        Ok(())
    }

    pub fn catalog(&self) -> ModelCatalog {
        ModelCatalog::new(&self.local.models)
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.storage.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::config_dir()?.join("data")),
        }
    }

    pub fn save_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content =
            toml::to_string_pretty(&Self::default()).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

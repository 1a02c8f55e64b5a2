//! Error taxonomy for the completion core.

use thiserror::Error;

use crate::models::Provider;

#[derive(Debug, Error)]
pub enum ChatError {
    /// The selected provider has no credential configured.
    #[error("Please add your {provider} API key in settings to use {model}.")]
    MissingCredential { provider: Provider, model: String },

    #[error("Unknown model '{0}'. Run /models to list the available models.")]
    UnknownModel(String),

    #[error("Message is empty")]
    EmptyInput,

    #[error("A response is still streaming in conversation {0}")]
    Busy(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    /// Provider rejected the request; carries the provider's own message
    /// or a generic "API Error: <status text>".
    #[error("{0}")]
    Api(String),

    /// Best-effort classification: an auth-class status with no readable
    /// error body usually means a cross-origin policy blocked the call.
    #[error(
        "Anthropic rejected the request (HTTP {status}) without a readable error. \
         This is most likely a cross-origin policy failure: route Anthropic traffic \
         through a proxy by setting endpoints.anthropic in the config file."
    )]
    CrossOriginPolicy { status: u16 },

    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid response payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Persistence failed: {0}")]
    Persistence(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;

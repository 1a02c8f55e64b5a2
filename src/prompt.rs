//! System prompt assembly.
//!
//! Every request carries one combined system prompt built from, in order:
//! the focus-mode instruction, the user's custom instruction, the persistent
//! research context and the follow-up suggestions instruction.

use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::postprocess::SUGGESTIONS_MARKER;

/// What kind of answer the user is after.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FocusMode {
    #[default]
    All,
    Academic,
    Writing,
    Coding,
}

impl FocusMode {
    pub fn instruction(&self) -> &'static str {
        match self {
            FocusMode::All => {
                "You are a helpful research assistant. Answer accurately and concisely, \
                 and cite sources when you rely on them."
            }
            FocusMode::Academic => {
                "You are an academic research assistant. Prefer peer-reviewed and scholarly \
                 sources, state uncertainty explicitly, and cite every claim."
            }
            FocusMode::Writing => {
                "You are a writing assistant. Focus on clarity, structure and tone. \
                 Do not search the web unless the user asks for facts."
            }
            FocusMode::Coding => {
                "You are a senior software engineer. Give working code in fenced blocks, \
                 explain trade-offs briefly, and point out edge cases."
            }
        }
    }

    pub fn parse(name: &str) -> Option<FocusMode> {
        match name.to_ascii_lowercase().as_str() {
            "all" => Some(FocusMode::All),
            "academic" => Some(FocusMode::Academic),
            "writing" => Some(FocusMode::Writing),
            "coding" => Some(FocusMode::Coding),
            _ => None,
        }
    }
}

pub const RESEARCH_CONTEXT_PREFIX: &str = "RESEARCH CONTEXT:";

/// Appended to every request so the answer ends with a parseable footer.
pub fn follow_up_instruction() -> String {
    format!(
        "IMPORTANT: After your complete answer, you MUST add a line containing only `---`, \
         then a line containing only `{marker}`, followed by exactly three short follow-up \
         questions the user might ask next, one per line, numbered like this:\n\
         {marker}\n\
         1. <question 1>\n\
         2. <question 2>\n\
         3. <question 3>\n\
         Do not add anything after the three questions.",
        marker = SUGGESTIONS_MARKER
    )
}

pub fn build_system_prompt(settings: &Settings) -> String {
    let mut parts: Vec<String> = vec![settings.focus.instruction().to_string()];

    let custom = settings.system_instruction.trim();
    if !custom.is_empty() {
        parts.push(custom.to_string());
    }

    let context = settings.project_context.trim();
    if !context.is_empty() {
        parts.push(format!("{} {}", RESEARCH_CONTEXT_PREFIX, context));
    }

    parts.push(follow_up_instruction());
    parts.join("\n\n")
}

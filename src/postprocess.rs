//! Post-processing of finished responses: follow-up suggestion extraction
//! and best-effort conversation titles.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProviderKeys;
use crate::dispatch::Dispatcher;
use crate::models::TITLE_MODEL;
use crate::stream::ChunkSink;
use crate::types::{now_millis, Message};

pub const SUGGESTIONS_MARKER: &str = "[[SUGGESTIONS]]";

const MAX_SUGGESTIONS: usize = 3;
const DEFAULT_TITLE_CHARS: usize = 50;

/// Split the suggestions footer off a finished response.
///
/// Returns the content unchanged with no suggestions when the marker is
/// absent. Otherwise the text before the marker (trimmed, without the
/// trailing `---` separator) is the clean content, and the first three
/// footer lines of a sensible length become suggestions.
pub fn extract_suggestions(content: &str) -> (String, Vec<String>) {
    let Some(pos) = content.find(SUGGESTIONS_MARKER) else {
        return (content.to_string(), Vec::new());
    };

    let mut clean = content[..pos].trim();
    if let Some(stripped) = clean.strip_suffix("---") {
        clean = stripped.trim_end();
    }

    let suggestions = content[pos + SUGGESTIONS_MARKER.len()..]
        .lines()
        .map(strip_enumerator)
        .filter(|line| {
            let len = line.chars().count();
            len > 3 && len < 150
        })
        .take(MAX_SUGGESTIONS)
        .map(str::to_string)
        .collect();

    (clean.to_string(), suggestions)
}

/// Remove a leading `1. `, `1) `, `- ` or `* ` and surrounding whitespace.
fn strip_enumerator(line: &str) -> &str {
    let line = line.trim();
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return rest.trim();
        }
    }
    for bullet in ["- ", "* "] {
        if let Some(rest) = line.strip_prefix(bullet) {
            return rest.trim();
        }
    }
    line
}

/// Title used until (or instead of) a generated one.
pub fn default_title(query: &str) -> String {
    let query = query.trim();
    if query.chars().count() <= DEFAULT_TITLE_CHARS {
        return query.to_string();
    }
    let truncated: String = query.chars().take(DEFAULT_TITLE_CHARS).collect();
    format!("{}…", truncated.trim_end())
}

fn title_prompt(query: &str) -> String {
    format!(
        "Generate a concise 3-5 word title for a conversation that starts with the \
         question below. Reply with the title only.\n\nQuestion: {}",
        query
    )
}

/// Trim a model-generated title and strip surrounding quotes.
pub fn clean_title(raw: &str) -> Option<String> {
    let (raw, _) = extract_suggestions(raw);
    let title = raw
        .trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '“' | '”' | '‘' | '’' | '`'))
        .trim();
    if title.is_empty() {
        None
    } else {
        Some(title.to_string())
    }
}

/// Ask the titling model for a short title. Any failure yields `None`.
pub async fn generate_title(
    dispatcher: &Dispatcher,
    keys: &ProviderKeys,
    query: &str,
) -> Option<String> {
    let route = match dispatcher.route_for(TITLE_MODEL, keys) {
        Ok(route) => route,
        Err(err) => {
            debug!(error = %err, "skipping auto-title");
            return None;
        }
    };

    let (sink, mut rx) = ChunkSink::channel();
    let messages = vec![Message::user(title_prompt(query), now_millis())];
    if let Err(err) = dispatcher
        .run(&route, messages, None, sink, CancellationToken::new())
        .await
    {
        warn!(error = %err, "auto-title request failed");
        return None;
    }

    let mut raw = String::new();
    while let Ok(chunk) = rx.try_recv() {
        raw.push_str(&chunk.text);
    }
    clean_title(&raw)
}

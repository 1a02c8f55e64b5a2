//! Line-oriented REPL on top of the orchestrator.
//!
//! Key concepts:
//! - **One loop**: stdin lines, orchestrator updates and Ctrl-C are raced in
//!   a single `select!`, so a response keeps streaming while the prompt is
//!   free for the next command.
//! - **Presentation only**: everything here reads the orchestrator's state
//!   and calls its operations; no conversation state lives in the REPL.

use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::attachments::read_attachments;
use crate::config::Theme;
use crate::llm::gemini::VIDEO_ALT_SENTINEL;
use crate::models::Provider;
use crate::orchestrator::{Orchestrator, Update};
use crate::prompt::FocusMode;
use crate::types::{Attachment, Message, Role};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ask(String),
    New,
    List,
    Open(String),
    Models,
    Model(String),
    Focus(String),
    Theme(String),
    Key { provider: String, key: String },
    Context(String),
    Instruction(String),
    Folders,
    FolderNew(String),
    FolderRm(String),
    Move { conversation: String, folder: Option<String> },
    Rename { conversation: String, title: String },
    Delete(String),
    Attach(Vec<PathBuf>),
    Stop,
    Help,
    Quit,
    Unknown(String),
}

/// Split `"a rest of line"` into `("a", "rest of line")`.
fn split_first(rest: &str) -> (String, String) {
    let rest = rest.trim();
    match rest.split_once(char::is_whitespace) {
        Some((first, tail)) => (first.to_string(), tail.trim().to_string()),
        None => (rest.to_string(), String::new()),
    }
}

pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if !line.starts_with('/') {
        return Some(Command::Ask(line.to_string()));
    }

    let (name, rest) = split_first(&line[1..]);
    let command = match name.to_ascii_lowercase().as_str() {
        "new" => Command::New,
        "list" | "ls" => Command::List,
        "open" => Command::Open(rest),
        "models" => Command::Models,
        "model" => Command::Model(rest),
        "focus" => Command::Focus(rest),
        "theme" => Command::Theme(rest),
        "key" => {
            let (provider, key) = split_first(&rest);
            Command::Key { provider, key }
        }
        "context" => Command::Context(rest),
        "instruction" => Command::Instruction(rest),
        "folders" => Command::Folders,
        "folder" => {
            let (action, arg) = split_first(&rest);
            match action.as_str() {
                "new" => Command::FolderNew(arg),
                "rm" | "delete" => Command::FolderRm(arg),
                _ => Command::Unknown(line.to_string()),
            }
        }
        "move" => {
            let (conversation, folder) = split_first(&rest);
            let folder = match folder.as_str() {
                "" | "none" | "-" => None,
                _ => Some(folder),
            };
            Command::Move { conversation, folder }
        }
        "rename" => {
            let (conversation, title) = split_first(&rest);
            Command::Rename { conversation, title }
        }
        "delete" | "rm" => Command::Delete(rest),
        "attach" => Command::Attach(rest.split_whitespace().map(PathBuf::from).collect()),
        "stop" => Command::Stop,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        _ => Command::Unknown(line.to_string()),
    };
    Some(command)
}

/// Make streamed markdown readable in a terminal.
///
/// Inline base64 images are collapsed to a placeholder and the video
/// sentinel becomes a plain link.
pub fn render_text(text: &str) -> String {
    let video = format!("![{}](", VIDEO_ALT_SENTINEL);
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("![") {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let Some(open) = tail.find(']').filter(|&open| tail[open..].starts_with("](")) else {
            out.push_str("![");
            rest = &tail[2..];
            continue;
        };
        let Some(close) = tail[open..].find(')') else {
            out.push_str(tail);
            return out;
        };
        let url = &tail[open + 2..open + close];
        if tail.starts_with(&video) {
            out.push_str(&format!("[video] {}", url));
        } else if let Some(data) = url.strip_prefix("data:") {
            let mime = data.split(';').next().unwrap_or("image");
            out.push_str(&format!("[image: {}]", mime));
        } else {
            out.push_str(&tail[..open + close + 1]);
        }
        rest = &tail[open + close + 1..];
    }
    out.push_str(rest);
    out
}

const HELP: &str = "\
Type a question to ask it in the current conversation.
  /new                      start a new conversation
  /list                     list conversations
  /open <n|id>              switch to a conversation
  /models, /model <id>      list or select models
  /focus <all|academic|writing|coding>
  /theme <light|dark|system>
  /key <provider> <key>     set an API key
  /context <text>           set research context
  /instruction <text>       set a custom system instruction
  /folders, /folder new <name>, /folder rm <id>
  /move <n|id> <folder|none>
  /rename <n|id> <title>
  /delete <n|id>
  /attach <path>...         attach files to the next question
  /stop                     stop the streaming response
  /quit";

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

/// Accept either a 1-based position from `/list` or a conversation id.
fn resolve_conversation(orch: &Orchestrator, arg: &str) -> Option<String> {
    if let Ok(n) = arg.parse::<usize>() {
        return orch
            .conversations()
            .get(n.checked_sub(1)?)
            .map(|c| c.id.clone());
    }
    orch.conversation(arg).map(|c| c.id.clone())
}

fn print_message(msg: &Message) {
    match msg.role {
        Role::User => {
            println!("You > {}", msg.content);
            for a in &msg.attachments {
                println!("      [attached {}]", a.name);
            }
        }
        _ => {
            println!("{} > {}", msg.model.as_deref().unwrap_or("assistant"), render_text(&msg.content));
            print_footer(msg);
        }
    }
}

fn print_footer(msg: &Message) {
    if let Some(citations) = &msg.citations {
        if !citations.is_empty() {
            println!("\nSources:");
            for (i, url) in citations.iter().enumerate() {
                println!("  [{}] {}", i + 1, url);
            }
        }
    }
    if !msg.suggestions.is_empty() {
        println!("\nRelated:");
        for s in &msg.suggestions {
            println!("  - {}", s);
        }
    }
    let mut stats = Vec::new();
    if let Some(ms) = msg.response_time_ms {
        stats.push(format!("{:.1}s", ms as f64 / 1000.0));
    }
    if let Some(usage) = msg.usage {
        stats.push(format!("{} tokens", usage.total_tokens));
    }
    if !stats.is_empty() {
        println!("({})", stats.join(", "));
    }
}

fn last_assistant(orch: &Orchestrator, conversation_id: &str) -> Option<Message> {
    orch.conversation(conversation_id)?
        .messages
        .last()
        .filter(|m| m.role == Role::Assistant)
        .cloned()
}

fn render_update(orch: &Orchestrator, update: Update) {
    let current = orch.current_id();
    match update {
        Update::Delta { conversation_id, text } if current == Some(conversation_id.as_str()) => {
            print!("{}", render_text(&text));
            let _ = std::io::stdout().flush();
        }
        Update::Completed { conversation_id } | Update::Failed { conversation_id, .. }
            if current != Some(conversation_id.as_str()) =>
        {
            println!("\n[response finished in conversation {}]", conversation_id);
            prompt();
        }
        Update::Completed { conversation_id } => {
            println!();
            if let Some(msg) = last_assistant(orch, &conversation_id) {
                print_footer(&msg);
            }
            prompt();
        }
        Update::Failed { error, .. } => {
            println!("\n\n**Error:** {}", error);
            prompt();
        }
        Update::Titled { conversation_id, title } => {
            tracing::debug!(conversation = %conversation_id, %title, "conversation titled");
        }
        _ => {}
    }
}

/// Read stdin on a dedicated thread so a pending read never holds up
/// runtime shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Run the REPL until `/quit`, end of input, or Ctrl-C while idle.
pub async fn run(orch: &mut Orchestrator) -> Result<()> {
    let mut lines = spawn_stdin_reader();
    let mut pending: Vec<Attachment> = Vec::new();

    println!("Model: {}. Type /help for commands.", orch.settings().model);
    prompt();
    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                let Some(command) = parse_command(&line) else {
                    prompt();
                    continue;
                };
                if command == Command::Quit {
                    break;
                }
                handle_command(orch, command, &mut pending).await;
            }
            update = orch.next_update() => render_update(orch, update),
            _ = tokio::signal::ctrl_c() => {
                match orch.streaming_conversation().map(str::to_string) {
                    Some(id) => {
                        orch.stop(&id);
                        println!("\n[stopped]");
                        prompt();
                    }
                    None => break,
                }
            }
        }
    }
    println!("Goodbye!");
    Ok(())
}

async fn handle_command(orch: &mut Orchestrator, command: Command, pending: &mut Vec<Attachment>) {
    let streaming = matches!(command, Command::Ask(_));
    match execute(orch, command, pending).await {
        Ok(()) if streaming => {}
        Ok(()) => prompt(),
        Err(err) => {
            println!("[Error: {:#}]", err);
            prompt();
        }
    }
}

async fn execute(orch: &mut Orchestrator, command: Command, pending: &mut Vec<Attachment>) -> Result<()> {
    match command {
        Command::Ask(query) => {
            if let Some(busy) = orch.streaming_conversation() {
                anyhow::bail!("A response is still streaming in {}; /stop it first", busy);
            }
            let current = orch.current_id().map(str::to_string);
            let attachments = std::mem::take(pending);
            match orch.submit(current.as_deref(), &query, attachments.clone()) {
                Ok(_) => println!(),
                Err(err) => {
                    *pending = attachments;
                    return Err(err.into());
                }
            }
        }
        Command::New => {
            orch.new_conversation();
            println!("[New conversation]");
        }
        Command::List => {
            if orch.conversations().is_empty() {
                println!("No conversations yet.");
            }
            for (i, conv) in orch.conversations().iter().enumerate() {
                let marker = if orch.current_id() == Some(conv.id.as_str()) { "*" } else { " " };
                let folder = conv
                    .folder_id
                    .as_deref()
                    .and_then(|id| orch.folders().iter().find(|f| f.id == id))
                    .map(|f| format!(" [{}]", f.name))
                    .unwrap_or_default();
                println!("{}{:>3}. {} ({}){}", marker, i + 1, conv.title, conv.id, folder);
            }
        }
        Command::Open(arg) => {
            let id = resolve_conversation(orch, &arg)
                .ok_or_else(|| anyhow::anyhow!("No conversation '{}'", arg))?;
            let conv = orch.select(&id)?;
            println!("== {} ==", conv.title);
            for msg in &conv.messages {
                print_message(msg);
            }
        }
        Command::Models => {
            let active = orch.settings().model.clone();
            for spec in orch.dispatcher().catalog().models() {
                let marker = if spec.id == active { "*" } else { " " };
                println!("{} {:<32} {} ({})", marker, spec.id, spec.label, spec.provider);
            }
        }
        Command::Model(id) => {
            orch.set_model(&id)?;
            println!("[Model: {}]", orch.settings().model);
        }
        Command::Focus(name) => {
            let focus = FocusMode::parse(&name)
                .ok_or_else(|| anyhow::anyhow!("Unknown focus mode '{}'", name))?;
            orch.set_focus(focus);
            println!("[Focus: {}]", name);
        }
        Command::Theme(name) => {
            let theme = match name.to_ascii_lowercase().as_str() {
                "light" => Theme::Light,
                "dark" => Theme::Dark,
                "system" => Theme::System,
                _ => anyhow::bail!("Unknown theme '{}'", name),
            };
            orch.set_theme(theme);
            println!("[Theme: {}]", name);
        }
        Command::Key { provider, key } => {
            let provider = Provider::parse(&provider)
                .filter(|p| *p != Provider::Local)
                .ok_or_else(|| anyhow::anyhow!("Unknown provider '{}'", provider))?;
            orch.set_key(provider, &key);
            println!("[{} key {}]", provider, if key.is_empty() { "cleared" } else { "saved" });
        }
        Command::Context(text) => {
            orch.set_project_context(&text);
            println!("[Research context updated]");
        }
        Command::Instruction(text) => {
            orch.set_system_instruction(&text);
            println!("[System instruction updated]");
        }
        Command::Folders => {
            for folder in orch.folders() {
                let count = orch
                    .conversations()
                    .iter()
                    .filter(|c| c.folder_id.as_deref() == Some(folder.id.as_str()))
                    .count();
                println!("  {} ({}) - {} conversations", folder.name, folder.id, count);
            }
        }
        Command::FolderNew(name) => {
            if name.is_empty() {
                anyhow::bail!("Usage: /folder new <name>");
            }
            let id = orch.create_folder(&name);
            println!("[Folder {} created: {}]", name, id);
        }
        Command::FolderRm(id) => {
            let unfiled = orch.delete_folder(&id)?;
            println!("[Folder deleted, {} conversations unfiled]", unfiled);
        }
        Command::Move { conversation, folder } => {
            let id = resolve_conversation(orch, &conversation)
                .ok_or_else(|| anyhow::anyhow!("No conversation '{}'", conversation))?;
            orch.move_to_folder(&id, folder.as_deref())?;
            println!("[Moved]");
        }
        Command::Rename { conversation, title } => {
            let id = resolve_conversation(orch, &conversation)
                .ok_or_else(|| anyhow::anyhow!("No conversation '{}'", conversation))?;
            orch.rename_conversation(&id, &title)?;
            println!("[Renamed]");
        }
        Command::Delete(arg) => {
            let id = resolve_conversation(orch, &arg)
                .ok_or_else(|| anyhow::anyhow!("No conversation '{}'", arg))?;
            orch.delete_conversation(&id)?;
            println!("[Deleted]");
        }
        Command::Attach(paths) => {
            let attachments = read_attachments(&paths).await?;
            for a in &attachments {
                println!("[Attached {} ({})]", a.name, a.mime_type);
            }
            pending.extend(attachments);
        }
        Command::Stop => {
            let stopped = orch
                .streaming_conversation()
                .map(str::to_string)
                .map_or(false, |id| orch.stop(&id));
            println!("{}", if stopped { "[stopped]" } else { "[nothing to stop]" });
        }
        Command::Help => println!("{}", HELP),
        Command::Quit => {}
        Command::Unknown(line) => anyhow::bail!("Unknown command: {}", line),
    }
    Ok(())
}

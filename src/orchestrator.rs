//! Conversation orchestrator.
//!
//! The orchestrator exclusively owns the conversation collection and drives
//! one state machine per in-flight request:
//!
//! ```text
//! Idle -> Submitting -> Streaming -> Finalizing -> Idle
//!                           |
//!                           +--(stop)--> Idle   (partial content kept)
//! ```
//!
//! Adapters run in spawned tasks and report back through a single event
//! channel. Every event is tagged with the conversation id and the stream
//! id it belongs to; events for a stream that is no longer active (stopped,
//! deleted, replaced) are dropped, so a late chunk can never write into a
//! finished turn.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, Settings, Theme};
use crate::dispatch::Dispatcher;
use crate::error::{ChatError, Result};
use crate::models::{Provider, TITLE_PROVIDER};
use crate::persist::{Debouncer, UserData, UserDataStore};
use crate::postprocess::{default_title, extract_suggestions, generate_title};
use crate::prompt::{build_system_prompt, FocusMode};
use crate::stream::{ChunkSink, StreamChunk};
use crate::types::{now_millis, Attachment, Conversation, Folder, Message};

/// Where a conversation is in its request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Submitting,
    Streaming,
    Finalizing,
}

/// Messages from background tasks to the orchestrator.
#[derive(Debug)]
pub enum ChatEvent {
    Chunk {
        conversation_id: String,
        stream_id: u64,
        chunk: StreamChunk,
    },
    Finished {
        conversation_id: String,
        stream_id: u64,
        result: Result<()>,
    },
    Title {
        conversation_id: String,
        title: String,
        /// Applied only while the conversation still carries this title.
        replaces: String,
    },
}

/// What changed after one event was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    Delta { conversation_id: String, text: String },
    Sources { conversation_id: String },
    Completed { conversation_id: String },
    Failed { conversation_id: String, error: String },
    Titled { conversation_id: String, title: String },
    Persisted,
    Stale,
}

struct ActiveStream {
    stream_id: u64,
    placeholder_at: i64,
    cancel: CancellationToken,
    started: Instant,
    phase: Phase,
}

pub struct Orchestrator {
    /// Most recently active first.
    conversations: Vec<Conversation>,
    folders: Vec<Folder>,
    settings: Settings,
    current: Option<String>,
    dispatcher: Arc<Dispatcher>,
    /// Active streams keyed by conversation id.
    streams: HashMap<String, ActiveStream>,
    next_stream_id: u64,
    events_tx: mpsc::UnboundedSender<ChatEvent>,
    events_rx: mpsc::UnboundedReceiver<ChatEvent>,
    store: Arc<dyn UserDataStore>,
    user_id: String,
    persist: Debouncer,
    /// Most recent background write; later writes wait for it.
    pending_write: Option<JoinHandle<()>>,
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn UserDataStore>,
        user_id: impl Into<String>,
        debounce: Duration,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            conversations: Vec::new(),
            folders: Vec::new(),
            settings,
            current: None,
            dispatcher,
            streams: HashMap::new(),
            next_stream_id: 1,
            events_tx,
            events_rx,
            store,
            user_id: user_id.into(),
            persist: Debouncer::new(debounce),
            pending_write: None,
        }
    }

    /// Build from config and overlay whatever the store has for the user.
    ///
    /// A pinned model (see `AppConfig::pin_model`) survives the overlay. A
    /// store failure is logged and the session starts empty.
    pub async fn load(
        config: &AppConfig,
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn UserDataStore>,
    ) -> Self {
        let mut orchestrator = Self::new(
            config.settings.clone(),
            dispatcher,
            store,
            config.storage.user_id.clone(),
            Duration::from_millis(config.storage.debounce_ms),
        );

        match orchestrator.store.get(&orchestrator.user_id).await {
            Ok(Some(data)) => orchestrator.restore(data),
            Ok(None) => debug!(user = %orchestrator.user_id, "no stored user data"),
            Err(err) => warn!(error = %format!("{:#}", err), "failed to load user data"),
        }
        if config.model_pinned {
            orchestrator.settings.model = config.settings.model.clone();
        }
        orchestrator
    }

    fn restore(&mut self, data: UserData) {
        info!(
            conversations = data.conversations.len(),
            folders = data.folders.len(),
            "restored user data"
        );
        self.conversations = data.conversations;
        self.folders = data.folders;
        if let Some(remote) = data.settings {
            let local_model = self.settings.model.clone();
            self.settings.overlay_remote(&remote);
            if self.dispatcher.catalog().resolve(&self.settings.model).is_err() {
                warn!(model = %self.settings.model, "stored model is unknown, keeping configured one");
                self.settings.model = local_model;
            }
        }
    }

    // --- Accessors ---

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn folders(&self) -> &[Folder] {
        &self.folders
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn phase(&self, conversation_id: &str) -> Phase {
        self.streams
            .get(conversation_id)
            .map_or(Phase::Idle, |s| s.phase)
    }

    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.streams.contains_key(conversation_id)
    }

    /// Id of some conversation that is currently streaming.
    pub fn streaming_conversation(&self) -> Option<&str> {
        self.streams.keys().next().map(String::as_str)
    }

    pub fn snapshot(&self) -> UserData {
        UserData {
            conversations: self.conversations.clone(),
            folders: self.folders.clone(),
            settings: Some(self.settings.clone()),
        }
    }

    fn index_of(&self, id: &str) -> Result<usize> {
        self.conversations
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| ChatError::ConversationNotFound(id.to_string()))
    }

    fn conversation_mut(&mut self, id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    fn move_to_front(&mut self, index: usize) {
        if index > 0 {
            let conv = self.conversations.remove(index);
            self.conversations.insert(0, conv);
        }
    }

    // --- Submit ---

    /// Submit a query to `conversation_id`, or to a new conversation.
    ///
    /// Returns the id of the conversation that is now streaming. Fails
    /// before touching any state when the input is empty, the conversation
    /// is busy or the selected provider has no credential.
    pub fn submit(
        &mut self,
        conversation_id: Option<&str>,
        query: &str,
        attachments: Vec<Attachment>,
    ) -> Result<String> {
        let query = query.trim();
        if query.is_empty() && attachments.is_empty() {
            return Err(ChatError::EmptyInput);
        }
        let existing = match conversation_id {
            Some(id) => {
                if self.is_streaming(id) {
                    return Err(ChatError::Busy(id.to_string()));
                }
                Some(self.index_of(id)?)
            }
            None => None,
        };
        let route = self.dispatcher.resolve(&self.settings)?;

        let index = match existing {
            Some(index) => index,
            None => {
                self.conversations.insert(0, Conversation::new(default_title(query)));
                0
            }
        };
        self.move_to_front(index);
        let submitted_at = Instant::now();

        let conv = &mut self.conversations[0];
        let conversation_id = conv.id.clone();
        let user_at = conv.next_timestamp();
        conv.messages
            .push(Message::user(query, user_at).with_attachments(attachments));
        let first_turn = conv.user_turns() == 1;

        let placeholder_at = conv.next_timestamp();
        conv.messages.push(Message::placeholder(&route.model, placeholder_at));
        conv.updated_at = placeholder_at;
        let history = conv.history_before(placeholder_at);

        let stream_id = self.next_stream_id;
        self.next_stream_id += 1;
        let cancel = CancellationToken::new();
        self.streams.insert(
            conversation_id.clone(),
            ActiveStream {
                stream_id,
                placeholder_at,
                cancel: cancel.clone(),
                started: submitted_at,
                phase: Phase::Submitting,
            },
        );
        self.current = Some(conversation_id.clone());

        if first_turn && route.provider == TITLE_PROVIDER {
            self.spawn_title(&conversation_id, query);
        }

        let system_prompt = build_system_prompt(&self.settings);
        info!(
            conversation = %conversation_id,
            stream_id,
            model = %route.model,
            provider = %route.provider,
            "starting stream"
        );
        let dispatcher = self.dispatcher.clone();
        let events = self.events_tx.clone();
        let conv_id = conversation_id.clone();
        tokio::spawn(async move {
            let (sink, mut chunks) = ChunkSink::channel();
            let producer = dispatcher.run(&route, history, Some(system_prompt), sink, cancel);
            let forward = async {
                while let Some(chunk) = chunks.recv().await {
                    let event = ChatEvent::Chunk {
                        conversation_id: conv_id.clone(),
                        stream_id,
                        chunk,
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
            };
            let (result, ()) = tokio::join!(producer, forward);
            let _ = events.send(ChatEvent::Finished {
                conversation_id: conv_id,
                stream_id,
                result,
            });
        });

        if let Some(stream) = self.streams.get_mut(&conversation_id) {
            stream.phase = Phase::Streaming;
        }
        self.persist.touch();
        Ok(conversation_id)
    }

    fn spawn_title(&self, conversation_id: &str, query: &str) {
        let dispatcher = self.dispatcher.clone();
        let keys = self.settings.keys.clone();
        let events = self.events_tx.clone();
        let conversation_id = conversation_id.to_string();
        let query = query.to_string();
        tokio::spawn(async move {
            if let Some(title) = generate_title(&dispatcher, &keys, &query).await {
                let _ = events.send(ChatEvent::Title {
                    conversation_id,
                    title,
                    replaces: default_title(&query),
                });
            }
        });
    }

    /// Stop the stream in `conversation_id`. Content streamed so far stays.
    pub fn stop(&mut self, conversation_id: &str) -> bool {
        match self.streams.remove(conversation_id) {
            Some(stream) => {
                stream.cancel.cancel();
                info!(conversation = %conversation_id, stream_id = stream.stream_id, "stream stopped");
                self.persist.touch();
                true
            }
            None => false,
        }
    }

    // --- Event loop ---

    /// Wait for the next background event, apply it and report the change.
    ///
    /// Also flushes pending persistence once its debounce deadline passes.
    pub async fn next_update(&mut self) -> Update {
        let deadline = self.persist.deadline();
        tokio::select! {
            event = self.events_rx.recv() => match event {
                Some(event) => self.apply(event),
                None => Update::Stale,
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)),
                if deadline.is_some() =>
            {
                self.persist.take();
                self.flush_in_background();
                Update::Persisted
            }
        }
    }

    /// Drive events until `conversation_id` is no longer streaming.
    pub async fn run_until_idle(&mut self, conversation_id: &str) -> Vec<Update> {
        let mut updates = Vec::new();
        while self.is_streaming(conversation_id) {
            updates.push(self.next_update().await);
        }
        updates
    }

    pub fn apply(&mut self, event: ChatEvent) -> Update {
        match event {
            ChatEvent::Chunk {
                conversation_id,
                stream_id,
                chunk,
            } => self.apply_chunk(conversation_id, stream_id, chunk),
            ChatEvent::Finished {
                conversation_id,
                stream_id,
                result,
            } => self.finish(conversation_id, stream_id, result),
            ChatEvent::Title {
                conversation_id,
                title,
                replaces,
            } => match self.conversation_mut(&conversation_id) {
                Some(conv) if conv.title == replaces => {
                    conv.title = title.clone();
                    self.persist.touch();
                    Update::Titled {
                        conversation_id,
                        title,
                    }
                }
                Some(_) => {
                    debug!(conversation = %conversation_id, "keeping renamed title");
                    Update::Stale
                }
                None => Update::Stale,
            },
        }
    }

    fn active_placeholder(&self, conversation_id: &str, stream_id: u64) -> Option<i64> {
        self.streams
            .get(conversation_id)
            .filter(|s| s.stream_id == stream_id)
            .map(|s| s.placeholder_at)
    }

    fn apply_chunk(&mut self, conversation_id: String, stream_id: u64, chunk: StreamChunk) -> Update {
        let Some(placeholder_at) = self.active_placeholder(&conversation_id, stream_id) else {
            debug!(conversation = %conversation_id, stream_id, "dropping stale chunk");
            return Update::Stale;
        };
        let Some(msg) = self
            .conversation_mut(&conversation_id)
            .and_then(|c| c.message_at_mut(placeholder_at))
        else {
            return Update::Stale;
        };

        msg.content.push_str(&chunk.text);
        let has_sources = chunk.citations.is_some();
        if let Some(citations) = chunk.citations {
            msg.citations = Some(citations);
        }
        if let Some(usage) = chunk.usage {
            msg.usage = Some(usage);
        }
        self.persist.touch();

        if chunk.text.is_empty() && has_sources {
            Update::Sources { conversation_id }
        } else {
            Update::Delta {
                conversation_id,
                text: chunk.text,
            }
        }
    }

    fn finish(&mut self, conversation_id: String, stream_id: u64, result: Result<()>) -> Update {
        let (placeholder_at, started) = match self.streams.get_mut(&conversation_id) {
            Some(stream) if stream.stream_id == stream_id => {
                stream.phase = Phase::Finalizing;
                (stream.placeholder_at, stream.started)
            }
            _ => {
                debug!(conversation = %conversation_id, stream_id, "ignoring finish of stale stream");
                return Update::Stale;
            }
        };
        let update = self.finalize(conversation_id.clone(), stream_id, placeholder_at, started, result);
        self.streams.remove(&conversation_id);
        self.persist.touch();
        update
    }

    fn finalize(
        &mut self,
        conversation_id: String,
        stream_id: u64,
        placeholder_at: i64,
        started: Instant,
        result: Result<()>,
    ) -> Update {
        let elapsed = started.elapsed().as_millis() as u64;
        let Some(conv) = self.conversation_mut(&conversation_id) else {
            return Update::Stale;
        };
        conv.updated_at = now_millis();
        let Some(msg) = conv.message_at_mut(placeholder_at) else {
            return Update::Stale;
        };

        match result {
            Ok(()) => {
                let (clean, suggestions) = extract_suggestions(&msg.content);
                msg.content = clean;
                msg.suggestions = suggestions;
                msg.response_time_ms = Some(elapsed);
                info!(conversation = %conversation_id, stream_id, elapsed_ms = elapsed, "stream finished");
                Update::Completed { conversation_id }
            }
            Err(err) => {
                warn!(conversation = %conversation_id, stream_id, error = %err, "stream failed");
                msg.content.push_str(&format!("\n\n**Error:** {}", err));
                Update::Failed {
                    conversation_id,
                    error: err.to_string(),
                }
            }
        }
    }

    // --- Persistence ---

    fn flush_in_background(&mut self) {
        let store = self.store.clone();
        let user_id = self.user_id.clone();
        let snapshot = self.snapshot();
        let previous = self.pending_write.take();
        self.pending_write = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            match store.put(&user_id, &snapshot).await {
                Ok(()) => debug!(user = %user_id, "user data saved"),
                Err(err) => warn!(user = %user_id, error = %format!("{:#}", err), "failed to save user data"),
            }
        }));
    }

    /// Write the current state now, after any background write in flight.
    pub async fn flush(&mut self) -> Result<()> {
        self.persist.take();
        if let Some(previous) = self.pending_write.take() {
            let _ = previous.await;
        }
        self.store
            .put(&self.user_id, &self.snapshot())
            .await
            .map_err(|err| ChatError::Persistence(format!("{:#}", err)))
    }

    // --- Conversations & folders ---

    /// Leave the current conversation; the next submit starts a new one.
    pub fn new_conversation(&mut self) {
        self.current = None;
    }

    pub fn select(&mut self, id: &str) -> Result<&Conversation> {
        let index = self.index_of(id)?;
        self.current = Some(id.to_string());
        Ok(&self.conversations[index])
    }

    pub fn rename_conversation(&mut self, id: &str, title: &str) -> Result<()> {
        let index = self.index_of(id)?;
        self.conversations[index].title = title.trim().to_string();
        self.persist.touch();
        Ok(())
    }

    pub fn delete_conversation(&mut self, id: &str) -> Result<()> {
        let index = self.index_of(id)?;
        self.stop(id);
        self.conversations.remove(index);
        if self.current.as_deref() == Some(id) {
            self.current = None;
        }
        self.persist.touch();
        Ok(())
    }

    pub fn create_folder(&mut self, name: &str) -> String {
        let folder = Folder::new(name.trim());
        let id = folder.id.clone();
        self.folders.push(folder);
        self.persist.touch();
        id
    }

    /// Delete a folder. Member conversations are kept and unfiled.
    pub fn delete_folder(&mut self, id: &str) -> Result<usize> {
        let index = self
            .folders
            .iter()
            .position(|f| f.id == id)
            .ok_or_else(|| ChatError::FolderNotFound(id.to_string()))?;
        self.folders.remove(index);
        let mut unfiled = 0;
        for conv in self
            .conversations
            .iter_mut()
            .filter(|c| c.folder_id.as_deref() == Some(id))
        {
            conv.folder_id = None;
            unfiled += 1;
        }
        self.persist.touch();
        Ok(unfiled)
    }

    pub fn move_to_folder(&mut self, conversation_id: &str, folder_id: Option<&str>) -> Result<()> {
        if let Some(folder_id) = folder_id {
            if !self.folders.iter().any(|f| f.id == folder_id) {
                return Err(ChatError::FolderNotFound(folder_id.to_string()));
            }
        }
        let index = self.index_of(conversation_id)?;
        self.conversations[index].folder_id = folder_id.map(str::to_string);
        self.persist.touch();
        Ok(())
    }

    // --- Settings ---

    pub fn set_model(&mut self, model: &str) -> Result<()> {
        let spec = self.dispatcher.catalog().resolve(model)?;
        self.settings.model = spec.id.clone();
        self.persist.touch();
        Ok(())
    }

    pub fn set_focus(&mut self, focus: FocusMode) {
        self.settings.focus = focus;
        self.persist.touch();
    }

    pub fn set_theme(&mut self, theme: Theme) {
        self.settings.theme = theme;
        self.persist.touch();
    }

    pub fn set_system_instruction(&mut self, instruction: &str) {
        self.settings.system_instruction = instruction.trim().to_string();
        self.persist.touch();
    }

    pub fn set_project_context(&mut self, context: &str) {
        self.settings.project_context = context.trim().to_string();
        self.persist.touch();
    }

    pub fn set_key(&mut self, provider: Provider, key: &str) {
        self.settings.keys.set(provider, key.trim().to_string());
        self.persist.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKeys;
    use crate::llm::{CompletionRequest, LlmProvider};
    use crate::models::ModelCatalog;
    use crate::persist::MemoryStore;
    use crate::types::{Role, Usage};
    use async_trait::async_trait;
    use std::sync::Mutex;

    enum Ending {
        Finish,
        Fail(&'static str),
        /// Wait for cancellation, then misbehave by writing once more.
        HangThenWriteLate,
    }

    struct ScriptedAdapter {
        chunks: Vec<StreamChunk>,
        ending: Ending,
        title: Option<&'static str>,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedAdapter {
        fn new(chunks: Vec<StreamChunk>, ending: Ending) -> Arc<Self> {
            Arc::new(Self {
                chunks,
                ending,
                title: None,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn with_title(chunks: Vec<StreamChunk>, title: &'static str) -> Arc<Self> {
            Arc::new(Self {
                chunks,
                ending: Ending::Finish,
                title: Some(title),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<CompletionRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedAdapter {
        async fn stream_completion(
            &self,
            request: &CompletionRequest,
            sink: ChunkSink,
            cancel: CancellationToken,
        ) -> Result<()> {
            self.seen.lock().unwrap().push(request.clone());
            if request.system_prompt.is_none() {
                sink.text(self.title.unwrap_or(""));
                return Ok(());
            }
            for chunk in &self.chunks {
                sink.send(chunk.clone());
            }
            match self.ending {
                Ending::Finish => Ok(()),
                Ending::Fail(message) => Err(ChatError::Api(message.to_string())),
                Ending::HangThenWriteLate => {
                    cancel.cancelled().await;
                    sink.text(" late");
                    Ok(())
                }
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn settings(model: &str) -> Settings {
        Settings {
            model: model.to_string(),
            keys: ProviderKeys {
                perplexity: "pplx".into(),
                openai: "sk".into(),
                anthropic: String::new(),
                google: String::new(),
            },
            ..Settings::default()
        }
    }

    fn orchestrator(
        model: &str,
        provider: Provider,
        adapter: Arc<ScriptedAdapter>,
        store: Arc<MemoryStore>,
    ) -> Orchestrator {
        let dispatcher = Dispatcher::new(ModelCatalog::default()).with_adapter(provider, adapter);
        Orchestrator::new(
            settings(model),
            Arc::new(dispatcher),
            store,
            "tester",
            Duration::from_secs(3600),
        )
    }

    fn openai(adapter: Arc<ScriptedAdapter>) -> Orchestrator {
        orchestrator("gpt-4o", Provider::OpenAi, adapter, Arc::new(MemoryStore::new()))
    }

    fn chunk(text: &str) -> StreamChunk {
        StreamChunk::text(text)
    }

    #[tokio::test]
    async fn test_stream_accumulates_and_finalizes() {
        let adapter = ScriptedAdapter::new(
            vec![
                chunk("Tides come "),
                StreamChunk::citations(vec!["https://old".into()]),
                chunk("from the moon."),
                StreamChunk::citations(vec!["https://noaa.gov".into()]),
                StreamChunk::usage(Usage::new(1, 1, 2)),
                chunk("\n---\n[[SUGGESTIONS]]\n1. What are spring tides?\n2. Do lakes have tides?\n3. Why two tides a day?"),
                StreamChunk::usage(Usage::new(10, 20, 30)),
            ],
            Ending::Finish,
        );
        let mut orch = openai(adapter.clone());
        let id = orch.submit(None, "Why do tides happen?", vec![]).unwrap();
        assert_eq!(orch.phase(&id), Phase::Streaming);

        let updates = orch.run_until_idle(&id).await;
        assert!(updates.contains(&Update::Completed { conversation_id: id.clone() }));
        assert_eq!(orch.phase(&id), Phase::Idle);

        let conv = orch.conversation(&id).unwrap();
        assert_eq!(conv.title, "Why do tides happen?");
        assert_eq!(conv.messages.len(), 2);
        let answer = &conv.messages[1];
        assert_eq!(answer.role, Role::Assistant);
        assert_eq!(answer.content, "Tides come from the moon.");
        assert_eq!(answer.citations, Some(vec!["https://noaa.gov".to_string()]));
        assert_eq!(answer.usage, Some(Usage::new(10, 20, 30)));
        assert_eq!(answer.model.as_deref(), Some("gpt-4o"));
        assert_eq!(answer.suggestions.len(), 3);
        assert!(answer.response_time_ms.is_some());
    }

    #[tokio::test]
    async fn test_history_excludes_placeholder() {
        let adapter = ScriptedAdapter::new(vec![chunk("ok")], Ending::Finish);
        let mut orch = openai(adapter.clone());
        let id = orch.submit(None, "first", vec![]).unwrap();
        orch.run_until_idle(&id).await;
        orch.submit(Some(&id), "second", vec![]).unwrap();
        orch.run_until_idle(&id).await;

        let requests = adapter.requests();
        assert_eq!(requests.len(), 2);
        let roles: Vec<Role> = requests[0].messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User]);
        let contents: Vec<&str> = requests[1].messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "ok", "second"]);
        let prompt = requests[0].system_prompt.as_deref().unwrap();
        assert!(prompt.contains("[[SUGGESTIONS]]"));
    }

    #[tokio::test]
    async fn test_missing_credential_blocks_without_state() {
        let adapter = ScriptedAdapter::new(vec![chunk("never")], Ending::Finish);
        let mut orch = orchestrator(
            "claude-sonnet-4-5-20250929",
            Provider::Anthropic,
            adapter.clone(),
            Arc::new(MemoryStore::new()),
        );
        let err = orch.submit(None, "hello", vec![]).unwrap_err();
        assert!(matches!(err, ChatError::MissingCredential { provider: Provider::Anthropic, .. }));
        assert!(orch.conversations().is_empty());
        tokio::task::yield_now().await;
        assert!(adapter.requests().is_empty());
    }

    #[tokio::test]
    async fn test_empty_and_busy_submissions_rejected() {
        let adapter = ScriptedAdapter::new(vec![chunk("partial")], Ending::HangThenWriteLate);
        let mut orch = openai(adapter);
        assert!(matches!(orch.submit(None, "   ", vec![]), Err(ChatError::EmptyInput)));

        let id = orch.submit(None, "hello", vec![]).unwrap();
        let err = orch.submit(Some(&id), "again", vec![]).unwrap_err();
        assert!(matches!(err, ChatError::Busy(_)));
        assert_eq!(orch.streaming_conversation(), Some(id.as_str()));
        let conv = orch.conversation(&id).unwrap();
        assert_eq!(conv.messages.iter().filter(|m| m.role == Role::Assistant).count(), 1);
        orch.stop(&id);
    }

    #[tokio::test]
    async fn test_stop_keeps_partial_content_and_drops_late_writes() {
        let adapter = ScriptedAdapter::new(vec![chunk("partial")], Ending::HangThenWriteLate);
        let mut orch = openai(adapter);
        let id = orch.submit(None, "tell me everything", vec![]).unwrap();

        let update = orch.next_update().await;
        assert_eq!(
            update,
            Update::Delta { conversation_id: id.clone(), text: "partial".into() }
        );
        assert!(orch.stop(&id));
        assert_eq!(orch.phase(&id), Phase::Idle);

        // the late chunk and the finish event both arrive and are ignored
        for _ in 0..2 {
            let update = tokio::time::timeout(Duration::from_secs(5), orch.next_update())
                .await
                .unwrap();
            assert_eq!(update, Update::Stale);
        }
        let conv = orch.conversation(&id).unwrap();
        assert_eq!(conv.messages[1].content, "partial");
        assert!(conv.messages[1].suggestions.is_empty());
    }

    #[tokio::test]
    async fn test_error_is_appended_inline() {
        let adapter = ScriptedAdapter::new(vec![chunk("Half an answer")], Ending::Fail("model overloaded"));
        let mut orch = openai(adapter);
        let id = orch.submit(None, "q", vec![]).unwrap();
        let updates = orch.run_until_idle(&id).await;
        assert!(updates.contains(&Update::Failed {
            conversation_id: id.clone(),
            error: "model overloaded".into()
        }));
        let conv = orch.conversation(&id).unwrap();
        assert_eq!(
            conv.messages[1].content,
            "Half an answer\n\n**Error:** model overloaded"
        );
    }

    #[tokio::test]
    async fn test_submit_moves_conversation_to_front_once() {
        let adapter = ScriptedAdapter::new(vec![chunk("ok")], Ending::Finish);
        let mut orch = openai(adapter);
        let first = orch.submit(None, "one", vec![]).unwrap();
        orch.run_until_idle(&first).await;
        let second = orch.submit(None, "two", vec![]).unwrap();
        orch.run_until_idle(&second).await;
        assert_eq!(orch.conversations()[0].id, second);

        orch.submit(Some(&first), "one again", vec![]).unwrap();
        orch.run_until_idle(&first).await;
        let ids: Vec<&str> = orch.conversations().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec![first.as_str(), second.as_str()]);
    }

    #[tokio::test]
    async fn test_delete_folder_unfiles_conversations() {
        let adapter = ScriptedAdapter::new(vec![chunk("ok")], Ending::Finish);
        let mut orch = openai(adapter);
        let a = orch.submit(None, "a", vec![]).unwrap();
        orch.run_until_idle(&a).await;
        let b = orch.submit(None, "b", vec![]).unwrap();
        orch.run_until_idle(&b).await;

        let folder = orch.create_folder("Oceans");
        orch.move_to_folder(&a, Some(&folder)).unwrap();
        orch.move_to_folder(&b, Some(&folder)).unwrap();
        assert!(orch.move_to_folder(&a, Some("nope")).is_err());

        assert_eq!(orch.delete_folder(&folder).unwrap(), 2);
        assert!(orch.folders().is_empty());
        assert_eq!(orch.conversations().len(), 2);
        assert!(orch.conversations().iter().all(|c| c.folder_id.is_none()));
    }

    #[tokio::test]
    async fn test_auto_title_for_titling_provider() {
        let adapter = ScriptedAdapter::with_title(vec![chunk("Answer")], "\"Lunar Tidal Forces\"");
        let mut orch = orchestrator("sonar", Provider::Perplexity, adapter, Arc::new(MemoryStore::new()));
        let id = orch.submit(None, "Why do tides happen twice a day?", vec![]).unwrap();

        let mut titled = false;
        for _ in 0..10 {
            let update = tokio::time::timeout(Duration::from_secs(5), orch.next_update())
                .await
                .unwrap();
            if let Update::Titled { title, .. } = update {
                assert_eq!(title, "Lunar Tidal Forces");
                titled = true;
            }
            if titled && !orch.is_streaming(&id) {
                break;
            }
        }
        assert!(titled);
        assert_eq!(orch.conversation(&id).unwrap().title, "Lunar Tidal Forces");
    }

    #[tokio::test]
    async fn test_rename_beats_late_generated_title() {
        let adapter = ScriptedAdapter::with_title(vec![chunk("Answer")], "Lunar Tidal Forces");
        let mut orch = orchestrator("sonar", Provider::Perplexity, adapter, Arc::new(MemoryStore::new()));
        let id = orch.submit(None, "Why do tides happen twice a day?", vec![]).unwrap();
        orch.rename_conversation(&id, "My tide notes").unwrap();

        let mut title_ignored = false;
        for _ in 0..10 {
            let update = tokio::time::timeout(Duration::from_secs(5), orch.next_update())
                .await
                .unwrap();
            assert!(!matches!(update, Update::Titled { .. }));
            if update == Update::Stale {
                title_ignored = true;
            }
            if title_ignored && !orch.is_streaming(&id) {
                break;
            }
        }
        assert!(title_ignored);
        assert_eq!(orch.conversation(&id).unwrap().title, "My tide notes");
    }

    #[tokio::test]
    async fn test_no_title_request_for_other_providers() {
        let adapter = ScriptedAdapter::new(vec![chunk("ok")], Ending::Finish);
        let mut orch = openai(adapter.clone());
        let id = orch.submit(None, "a question", vec![]).unwrap();
        orch.run_until_idle(&id).await;
        assert_eq!(adapter.requests().len(), 1);
        assert_eq!(orch.conversation(&id).unwrap().title, "a question");
    }

    #[tokio::test]
    async fn test_flush_and_reload() {
        let store = Arc::new(MemoryStore::new());
        let adapter = ScriptedAdapter::new(vec![chunk("stored answer")], Ending::Finish);
        let mut orch = orchestrator("gpt-4o", Provider::OpenAi, adapter, store.clone());
        let id = orch.submit(None, "remember me", vec![]).unwrap();
        orch.run_until_idle(&id).await;
        orch.set_project_context("marine biology");
        orch.flush().await.unwrap();

        let mut config = AppConfig::default();
        config.storage.user_id = "tester".into();
        let dispatcher = Arc::new(Dispatcher::new(ModelCatalog::default()));
        let reloaded = Orchestrator::load(&config, dispatcher, store).await;
        assert_eq!(reloaded.conversations().len(), 1);
        assert_eq!(reloaded.conversations()[0].messages[1].content, "stored answer");
        assert_eq!(reloaded.settings().project_context, "marine biology");
        assert_eq!(reloaded.settings().model, "gpt-4o");
    }

    #[tokio::test]
    async fn test_pinned_model_survives_stored_settings() {
        let store = Arc::new(MemoryStore::new());
        let stored = UserData {
            settings: Some(settings("sonar")),
            ..UserData::default()
        };
        store.put("tester", &stored).await.unwrap();

        let mut config = AppConfig::default();
        config.storage.user_id = "tester".into();
        config.settings.model = "gpt-4o".into();
        let dispatcher = Arc::new(Dispatcher::new(ModelCatalog::default()));
        let reloaded = Orchestrator::load(&config, dispatcher.clone(), store.clone()).await;
        assert_eq!(reloaded.settings().model, "sonar");

        config.pin_model("gpt-4o".into());
        let reloaded = Orchestrator::load(&config, dispatcher, store).await;
        assert_eq!(reloaded.settings().model, "gpt-4o");
        assert_eq!(reloaded.settings().keys.perplexity, "pplx");
    }

    #[tokio::test]
    async fn test_flush_lands_after_background_write() {
        let store = Arc::new(MemoryStore::new());
        let mut orch = Orchestrator::new(
            settings("gpt-4o"),
            Arc::new(Dispatcher::new(ModelCatalog::default())),
            store.clone(),
            "tester",
            Duration::from_millis(10),
        );
        orch.create_folder("First");
        let update = tokio::time::timeout(Duration::from_secs(5), orch.next_update())
            .await
            .unwrap();
        assert_eq!(update, Update::Persisted);

        orch.create_folder("Second");
        orch.flush().await.unwrap();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        let saved = store.get("tester").await.unwrap().unwrap();
        assert_eq!(saved.folders.len(), 2);
    }

    #[tokio::test]
    async fn test_debounced_flush_writes_after_idle() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new(ModelCatalog::default());
        let mut orch = Orchestrator::new(
            settings("gpt-4o"),
            Arc::new(dispatcher),
            store.clone(),
            "tester",
            Duration::from_millis(10),
        );
        orch.create_folder("Later");
        let update = tokio::time::timeout(Duration::from_secs(5), orch.next_update())
            .await
            .unwrap();
        assert_eq!(update, Update::Persisted);

        for _ in 0..50 {
            if store.get("tester").await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let saved = store.get("tester").await.unwrap().unwrap();
        assert_eq!(saved.folders.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_model_rejected() {
        let adapter = ScriptedAdapter::new(vec![], Ending::Finish);
        let mut orch = openai(adapter);
        assert!(matches!(orch.set_model("gpt-99"), Err(ChatError::UnknownModel(_))));
        orch.set_model("sonar-pro").unwrap();
        assert_eq!(orch.settings().model, "sonar-pro");
    }
}

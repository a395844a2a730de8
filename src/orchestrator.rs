use crate::backend::ChatBackend;
use crate::cache::{apply_event, MessageCache, QueryKey};
use crate::constants::{EVENT_PERMISSION_REQUEST, EVENT_SYSTEM};
use crate::protocol::{OpenMode, StreamAdapter, SuppressionSet};
use crate::registry::*;
use crate::store::Store;
use crate::types::*;
use crate::view::ChatViewStore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// UI-side reactions. Every method defaults to doing nothing.
pub trait UiHooks: Send + Sync {
    fn on_chunk(&self, _chunk: &StreamChunk) {}
    fn on_complete(&self, _done: &StreamCompletion) {}
    fn on_error(&self, _failure: &StreamFailure) {}
    fn on_queue_process(&self, _chat_id: &ChatId, _injection: &QueueInjection) {}
    /// Completion sound/notification. Only called when the bindings ask for it.
    fn notify_complete(&self, _chat_id: &ChatId, _message_id: &MessageId) {}
}

/// What the UI hands over on each render.
#[derive(Clone)]
pub struct UiBindings {
    pub chat_id: ChatId,
    pub hooks: Arc<dyn UiHooks>,
    pub notify: bool,
}

/// Latest UI bindings, replaced on every render and read at call or dispatch time.
#[derive(Default)]
pub struct CallbackCell {
    current: Store<Option<UiBindings>>,
}

impl CallbackCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refresh(&self, bindings: UiBindings) {
        self.current.replace(Some(bindings));
    }

    pub fn current(&self) -> Option<UiBindings> {
        self.current.snapshot()
    }

    pub fn clear(&self) {
        self.current.replace(None);
    }

    fn hooks_for(&self, chat_id: &ChatId) -> Option<UiBindings> {
        self.current().filter(|b| &b.chat_id == chat_id)
    }
}

/// Input of [`StreamOrchestrator::start`]. The chat comes from the bound UI.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub prompt: String,
    pub model_id: String,
    pub permission_mode: PermissionMode,
    pub thinking_mode: Option<String>,
    pub attached_files: Vec<AttachedFile>,
}

impl StartRequest {
    pub fn text(prompt: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model_id: model_id.into(),
            permission_mode: PermissionMode::default(),
            thinking_mode: None,
            attached_files: Vec::new(),
        }
    }
}

/// Delayed cache invalidations. Teardown cancels everything scheduled so far.
pub struct InvalidationScheduler {
    cache: Arc<MessageCache>,
    token: Store<CancellationToken>,
}

impl InvalidationScheduler {
    pub fn new(cache: Arc<MessageCache>) -> Self {
        Self {
            cache,
            token: Store::new(CancellationToken::new()),
        }
    }

    pub fn schedule(&self, key: QueryKey, delay: Duration) {
        let token = self.token.snapshot();
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("Dropped scheduled invalidation of {:?}", key);
                }
                _ = tokio::time::sleep(delay) => cache.invalidate(key),
            }
        });
    }

    pub fn cancel_all(&self) {
        let previous = self.token.replace(CancellationToken::new());
        previous.cancel();
    }
}

/// Effects of stream callbacks on view state and cache.
struct StreamEffects {
    cache: Arc<MessageCache>,
    view: Arc<ChatViewStore>,
    cell: Arc<CallbackCell>,
    suppressed: Arc<SuppressionSet>,
    scheduler: Arc<InvalidationScheduler>,
    usage_refresh_delay: Duration,
    context_refresh_delay: Duration,
}

fn event_type(event: &serde_json::Value) -> Option<&str> {
    event.get("type").and_then(|t| t.as_str())
}

impl StreamCallbacks for StreamEffects {
    fn on_chunk(&self, chunk: &StreamChunk) {
        if self.suppressed.contains(&chunk.message_id) {
            return;
        }
        let chat_id = &chunk.chat_id;

        if event_type(&chunk.event) == Some(EVENT_PERMISSION_REQUEST) {
            self.view.update(chat_id, |v| {
                v.permission_request = Some(chunk.event.clone());
            });
        } else if let Some(usage) = context_usage(&chunk.event) {
            self.view.update(chat_id, |v| {
                v.context_usage = Some(usage.clone());
            });
        } else {
            self.view.update(chat_id, |v| {
                if let Some(msg) = v.message_mut(&chunk.message_id) {
                    apply_event(msg, chunk.ordinal, &chunk.event);
                }
            });
            self.cache
                .append_event(chat_id, &chunk.message_id, chunk.ordinal, &chunk.event);
        }

        if let Some(bindings) = self.cell.hooks_for(chat_id) {
            bindings.hooks.on_chunk(chunk);
        }
    }

    fn on_complete(&self, done: &StreamCompletion) {
        let status = match done.status.as_deref() {
            Some("cancelled") => MessageStreamStatus::Interrupted,
            _ => MessageStreamStatus::Completed,
        };
        self.view.update(&done.chat_id, |v| {
            v.clear_stream_flags();
            v.pending_user_message_id = None;
            if let Some(msg) = v.message_mut(&done.message_id) {
                msg.stream_status = status;
            }
        });
        self.cache.patch_message(&done.chat_id, &done.message_id, |m| {
            m.stream_status = status;
        });

        self.scheduler
            .schedule(QueryKey::UsageStats, self.usage_refresh_delay);
        self.scheduler.schedule(
            QueryKey::ContextUsage(done.chat_id.clone()),
            self.context_refresh_delay,
        );

        tracing::info!(
            "Generation {} finished ({:?})",
            done.message_id.short(),
            status
        );
        if let Some(bindings) = self.cell.hooks_for(&done.chat_id) {
            if bindings.notify {
                bindings.hooks.notify_complete(&done.chat_id, &done.message_id);
            }
            bindings.hooks.on_complete(done);
        }
    }

    fn on_error(&self, failure: &StreamFailure) {
        let pending_user = self.view.update(&failure.chat_id, |v| {
            v.clear_stream_flags();
            let pending = v.pending_user_message_id.take();
            match &pending {
                Some(user_id) => v.remove_messages(&[user_id, &failure.message_id]),
                None => v.remove_messages(&[&failure.message_id]),
            }
            pending
        });

        let mut doomed: HashSet<MessageId> = HashSet::new();
        doomed.insert(failure.message_id.clone());
        if let Some(user_id) = pending_user {
            doomed.insert(user_id);
        }
        self.cache.remove_messages(&failure.chat_id, &doomed);

        if let Some(bindings) = self.cell.hooks_for(&failure.chat_id) {
            bindings.hooks.on_error(failure);
        }
    }

    fn on_queue_process(&self, chat_id: &ChatId, injection: &QueueInjection) {
        let mut user = ChatMessage::user(
            chat_id.clone(),
            injection.user_message_id.clone(),
            injection.content.clone(),
        );
        user.attachments = injection.attachments.clone();
        let assistant = ChatMessage::assistant_placeholder(
            chat_id.clone(),
            injection.assistant_message_id.clone(),
            injection.model_id.clone(),
        );

        let previous = self.view.update(chat_id, |v| {
            let previous = v.streaming_message_id.take();
            if let Some(prev_id) = &previous {
                if let Some(prev) = v.message_mut(prev_id) {
                    if prev.stream_status == MessageStreamStatus::InProgress {
                        prev.stream_status = MessageStreamStatus::Completed;
                    }
                }
            }
            v.push_message(user.clone());
            v.push_message(assistant.clone());
            v.streaming_message_id = Some(injection.assistant_message_id.clone());
            v.pending_user_message_id = Some(injection.user_message_id.clone());
            v.is_streaming = true;
            previous
        });
        if let Some(prev_id) = previous {
            self.cache.patch_message(chat_id, &prev_id, |m| {
                if m.stream_status == MessageStreamStatus::InProgress {
                    m.stream_status = MessageStreamStatus::Completed;
                }
            });
        }
        self.cache.insert_at_head(chat_id, vec![user, assistant]);

        if let Some(bindings) = self.cell.hooks_for(chat_id) {
            bindings.hooks.on_queue_process(chat_id, injection);
        }
    }
}

/// `{"type":"system","data":{"context_usage":...}}`
fn context_usage(event: &serde_json::Value) -> Option<&serde_json::Value> {
    if event_type(event) != Some(EVENT_SYSTEM) {
        return None;
    }
    event.get("data").and_then(|d| d.get("context_usage"))
}

/// Connects UI bindings to stream sessions without tying sessions to any one render.
pub struct StreamOrchestrator {
    backend: Arc<dyn ChatBackend>,
    adapter: Arc<StreamAdapter>,
    cache: Arc<MessageCache>,
    view: Arc<ChatViewStore>,
    cell: Arc<CallbackCell>,
    scheduler: Arc<InvalidationScheduler>,
    callbacks: SharedCallbacks,
}

impl StreamOrchestrator {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        adapter: Arc<StreamAdapter>,
        cache: Arc<MessageCache>,
        view: Arc<ChatViewStore>,
        usage_refresh_delay: Duration,
        context_refresh_delay: Duration,
    ) -> Self {
        let cell = Arc::new(CallbackCell::new());
        let scheduler = Arc::new(InvalidationScheduler::new(Arc::clone(&cache)));
        let callbacks: SharedCallbacks = Arc::new(StreamEffects {
            cache: Arc::clone(&cache),
            view: Arc::clone(&view),
            cell: Arc::clone(&cell),
            suppressed: Arc::clone(adapter.suppressed()),
            scheduler: Arc::clone(&scheduler),
            usage_refresh_delay,
            context_refresh_delay,
        });
        Self {
            backend,
            adapter,
            cache,
            view,
            cell,
            scheduler,
            callbacks,
        }
    }

    pub fn cell(&self) -> &Arc<CallbackCell> {
        &self.cell
    }

    /// Callback set every session opened by this orchestrator dispatches to.
    pub fn callbacks(&self) -> SharedCallbacks {
        Arc::clone(&self.callbacks)
    }

    fn bound_chat(&self) -> Result<ChatId> {
        match self.cell.current() {
            Some(bindings) => Ok(bindings.chat_id),
            None => Err(ParleyError::Validation("no chat is bound to the UI".to_string()).into()),
        }
    }

    /// Sends a prompt and streams the reply into a fresh session.
    pub async fn start(&self, request: StartRequest) -> Result<MessageId> {
        let chat_id = self.bound_chat()?;
        let user_id = MessageId::optimistic();
        let mut user = ChatMessage::user(chat_id.clone(), user_id.clone(), request.prompt.clone());
        user.model_id = Some(request.model_id.clone());

        self.view.update(&chat_id, |v| {
            v.push_message(user.clone());
            v.pending_user_message_id = Some(user_id.clone());
            v.is_loading = true;
        });
        self.cache.insert_at_head(&chat_id, vec![user]);

        let started = self
            .backend
            .start_chat(ChatRequest {
                chat_id: chat_id.clone(),
                prompt: request.prompt,
                model_id: request.model_id.clone(),
                permission_mode: request.permission_mode,
                thinking_mode: request.thinking_mode,
                attached_files: request.attached_files,
            })
            .await;
        let response = match started {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("Start failed for chat {}: {}", chat_id.short(), e);
                self.view.update(&chat_id, |v| {
                    v.remove_messages(&[&user_id]);
                    v.pending_user_message_id = None;
                    v.clear_stream_flags();
                });
                self.cache
                    .remove_messages(&chat_id, &HashSet::from([user_id]));
                return Err(e);
            }
        };

        let message_id = response.message_id;
        let assistant =
            ChatMessage::assistant_placeholder(chat_id.clone(), message_id.clone(), Some(request.model_id));
        self.view.update(&chat_id, |v| {
            v.push_message(assistant.clone());
            v.streaming_message_id = Some(message_id.clone());
            v.is_streaming = true;
        });
        self.cache.insert_at_head(&chat_id, vec![assistant]);

        self.adapter
            .open(&chat_id, &message_id, self.callbacks(), OpenMode::Fresh)
            .await;
        Ok(message_id)
    }

    /// Re-streams a message from the beginning. Already applied events are skipped.
    pub async fn replay(&self, message_id: &MessageId) -> Result<MessageId> {
        let chat_id = self.bound_chat()?;
        self.ensure_placeholder(&chat_id, message_id);
        self.adapter
            .open(&chat_id, message_id, self.callbacks(), OpenMode::Replay)
            .await;
        Ok(message_id.clone())
    }

    /// Stops a generation. The message is kept and marked interrupted.
    pub async fn stop(&self, message_id: &MessageId) -> Result<()> {
        let chat_id = self.bound_chat()?;
        self.view.update(&chat_id, |v| {
            v.clear_stream_flags();
            v.pending_user_message_id = None;
            if let Some(msg) = v.message_mut(message_id) {
                msg.stream_status = MessageStreamStatus::Interrupted;
            }
        });
        self.cache.patch_message(&chat_id, message_id, |m| {
            m.stream_status = MessageStreamStatus::Interrupted;
        });
        self.adapter.stop(&chat_id, message_id).await
    }

    /// Picks up the bound chat's running generation, if the server has one.
    pub async fn attach(&self) -> Result<Option<MessageId>> {
        let chat_id = self.bound_chat()?;
        let attached = self
            .adapter
            .attach_active(&chat_id, self.callbacks())
            .await?;
        if let Some(message_id) = &attached {
            self.ensure_placeholder(&chat_id, message_id);
        }
        Ok(attached)
    }

    fn ensure_placeholder(&self, chat_id: &ChatId, message_id: &MessageId) {
        let cached = self.cache.find(chat_id, message_id);
        let placeholder = match &cached {
            Some(msg) => msg.clone(),
            None => ChatMessage::assistant_placeholder(chat_id.clone(), message_id.clone(), None),
        };
        self.view.update(chat_id, |v| {
            v.push_message(placeholder.clone());
            if let Some(msg) = v.message_mut(message_id) {
                msg.stream_status = MessageStreamStatus::InProgress;
            }
            v.streaming_message_id = Some(message_id.clone());
            v.is_streaming = true;
        });
        if cached.is_none() {
            self.cache.insert_at_head(chat_id, vec![placeholder]);
        } else {
            self.cache.patch_message(chat_id, message_id, |m| {
                m.stream_status = MessageStreamStatus::InProgress;
            });
        }
    }

    /// Cancels scheduled invalidations. Live sessions are left alone.
    pub fn teardown(&self) {
        self.scheduler.cancel_all();
    }
}

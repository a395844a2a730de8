use crate::backend::ChatBackend;
use crate::cursor::CursorStore;
use crate::logging::StreamMetric;
use crate::queue::QueueCoordinator;
use crate::registry::*;
use crate::sse::{parse_signal, SseFrame, StreamSignal};
use crate::store::Store;
use crate::types::*;
use futures_util::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How a session positions itself in the chat's event history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// A new generation. Any stored cursor belongs to an older one and is dropped.
    Fresh,
    /// Continue after the stored cursor.
    Resume,
    /// Discard the cursor and receive the whole history again.
    Replay,
}

/// Message ids the user asked to stop. Content for these is never dispatched.
#[derive(Default)]
pub struct SuppressionSet {
    ids: Store<HashSet<MessageId>>,
}

impl SuppressionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: &MessageId) {
        self.ids.update(|s| {
            s.insert(id.clone());
        });
    }

    pub fn release(&self, id: &MessageId) -> bool {
        self.ids.update(|s| s.remove(id))
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.read(|s| s.contains(id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Finished,
}

/// Turns the chat server's event stream into session callbacks.
pub struct StreamAdapter {
    backend: Arc<dyn ChatBackend>,
    registry: Arc<SessionRegistry>,
    cursors: Arc<dyn CursorStore>,
    queue: Arc<QueueCoordinator>,
    suppressed: Arc<SuppressionSet>,
}

impl StreamAdapter {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        registry: Arc<SessionRegistry>,
        cursors: Arc<dyn CursorStore>,
        queue: Arc<QueueCoordinator>,
        suppressed: Arc<SuppressionSet>,
    ) -> Self {
        Self {
            backend,
            registry,
            cursors,
            queue,
            suppressed,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn suppressed(&self) -> &Arc<SuppressionSet> {
        &self.suppressed
    }

    /// Registers a session for (chat, message) and starts its reader. Connection failures
    /// arrive through `on_error` like any other transport error.
    pub async fn open(
        self: &Arc<Self>,
        chat_id: &ChatId,
        message_id: &MessageId,
        callbacks: SharedCallbacks,
        mode: OpenMode,
    ) -> SessionId {
        let cursor = match mode {
            OpenMode::Fresh => {
                self.forget_cursor(chat_id).await;
                None
            }
            OpenMode::Replay => {
                self.forget_cursor(chat_id).await;
                if self.suppressed.release(message_id) {
                    tracing::debug!("[STREAM] Released stop suppression for {}", message_id.short());
                }
                None
            }
            OpenMode::Resume => match self.cursors.load(chat_id.clone()).await {
                Ok(cursor) => cursor,
                Err(e) => {
                    tracing::warn!("[STREAM] Could not load cursor for {}: {}", chat_id.short(), e);
                    None
                }
            },
        };

        let session = StreamSession::new(chat_id.clone(), message_id.clone(), callbacks);
        let cancel = session.cancel_token();
        let session_id = self.registry.add(session);
        self.registry.set_state(session_id, ConnectionState::Connecting);

        tracing::info!(
            "[STREAM] Opening {:?} session {} for {} / {} (cursor: {:?})",
            mode,
            session_id,
            chat_id.short(),
            message_id.short(),
            cursor
        );

        let this = Arc::clone(self);
        let chat = chat_id.clone();
        let task = tokio::spawn(async move {
            this.run_session(session_id, chat, cursor, cancel).await;
        });
        self.registry.attach_transport(session_id, task);
        session_id
    }

    pub async fn reconnect(
        self: &Arc<Self>,
        chat_id: &ChatId,
        message_id: &MessageId,
        callbacks: SharedCallbacks,
    ) -> SessionId {
        self.open(chat_id, message_id, callbacks, OpenMode::Resume).await
    }

    pub async fn replay(
        self: &Arc<Self>,
        chat_id: &ChatId,
        message_id: &MessageId,
        callbacks: SharedCallbacks,
    ) -> SessionId {
        self.open(chat_id, message_id, callbacks, OpenMode::Replay).await
    }

    /// Suppresses the message, asks the server to halt, and retires the session. The session
    /// is retired even if the server call fails.
    pub async fn stop(&self, chat_id: &ChatId, message_id: &MessageId) -> Result<()> {
        self.suppressed.insert(message_id);
        let halted = self.backend.stop_stream(chat_id.clone()).await;

        let live = self.registry.get_by_chat_and_message(chat_id, message_id);
        if let Some(info) = live {
            self.registry.remove(info.id);
        }
        match &halted {
            Ok(()) => tracing::info!("[STREAM] Stopped {} / {}", chat_id.short(), message_id.short()),
            Err(e) => tracing::warn!(
                "[STREAM] Server stop failed for {} (session retired locally): {}",
                chat_id.short(),
                e
            ),
        }
        halted
    }

    /// Reattaches to the chat's running generation, if any. An existing session just gets the
    /// new callbacks; otherwise a resumed session is opened.
    pub async fn attach_active(
        self: &Arc<Self>,
        chat_id: &ChatId,
        callbacks: SharedCallbacks,
    ) -> Result<Option<MessageId>> {
        let status = self.backend.stream_status(chat_id.clone()).await?;
        let message_id = match (status.has_active_task, status.message_id) {
            (true, Some(id)) => id,
            _ => {
                tracing::debug!("[STREAM] No active generation for chat {}", chat_id.short());
                return Ok(None);
            }
        };

        if self
            .registry
            .rebind_callbacks(chat_id, &message_id, callbacks.clone())
        {
            tracing::debug!("[STREAM] Rebound callbacks for {}", message_id.short());
        } else {
            self.open(chat_id, &message_id, callbacks, OpenMode::Resume).await;
        }
        Ok(Some(message_id))
    }

    async fn forget_cursor(&self, chat_id: &ChatId) {
        if let Err(e) = self.cursors.clear(chat_id.clone()).await {
            tracing::warn!("[STREAM] Could not clear cursor for {}: {}", chat_id.short(), e);
        }
    }

    async fn run_session(
        self: Arc<Self>,
        session_id: SessionId,
        chat_id: ChatId,
        cursor: Option<String>,
        cancel: CancellationToken,
    ) {
        let mut metric = StreamMetric::new(session_id, chat_id.clone());

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                metric.log_summary("cancelled before connect");
                return;
            }
            opened = self.backend.open_stream(chat_id.clone(), cursor.clone()) => opened,
        };
        let mut frames = match opened {
            Ok(frames) => frames,
            Err(e) => {
                self.fail(session_id, FailureKind::Transport, e.to_string());
                metric.log_summary("connect failed");
                return;
            }
        };
        self.registry
            .set_state(session_id, ConnectionState::Streaming { cursor });

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break "closed",
                next = frames.next() => next,
            };
            match next {
                Some(Ok(frame)) => {
                    if self.dispatch(session_id, &chat_id, frame, &mut metric).await == Flow::Finished {
                        break "finished";
                    }
                }
                Some(Err(e)) => {
                    self.fail(session_id, FailureKind::Transport, e.to_string());
                    break "transport error";
                }
                None => {
                    self.fail(
                        session_id,
                        FailureKind::Transport,
                        "event stream ended before completion".to_string(),
                    );
                    break "disconnected";
                }
            }
        };
        metric.log_summary(outcome);
    }

    async fn dispatch(
        &self,
        session_id: SessionId,
        chat_id: &ChatId,
        frame: SseFrame,
        metric: &mut StreamMetric,
    ) -> Flow {
        metric.record_frame(frame.id.as_deref());
        let route = match self.registry.route(session_id) {
            Some(route) => route,
            None => return Flow::Finished,
        };
        let signal = parse_signal(&frame);
        tracing::debug!(
            "[STREAM] {} frame {:?} for {}",
            frame.event,
            frame.id,
            route.message_id.short()
        );

        let flow = match signal {
            StreamSignal::Content { event } => {
                if self.suppressed.contains(&route.message_id) {
                    metric.suppressed += 1;
                } else {
                    metric.chunks += 1;
                    route.callbacks.on_chunk(&StreamChunk {
                        chat_id: chat_id.clone(),
                        message_id: route.message_id.clone(),
                        ordinal: frame.ordinal(),
                        event,
                    });
                }
                Flow::Continue
            }
            StreamSignal::Error { message } => {
                self.fail(session_id, FailureKind::Processing, message);
                Flow::Finished
            }
            StreamSignal::Complete { status } => {
                if let Some(retired) = self.registry.remove(session_id) {
                    retired.callbacks.on_complete(&StreamCompletion {
                        chat_id: retired.chat_id,
                        message_id: retired.message_id,
                        status,
                    });
                }
                Flow::Finished
            }
            StreamSignal::QueueInjected(injection) => {
                metric.injections += 1;
                self.queue
                    .acknowledge_injection(chat_id, &injection.queued_message_id);
                self.registry.update_message_id(
                    chat_id,
                    &route.message_id,
                    &injection.assistant_message_id,
                );
                route.callbacks.on_queue_process(chat_id, &injection);
                Flow::Continue
            }
            StreamSignal::Unknown(name) => {
                metric.unknown += 1;
                tracing::debug!("[STREAM] Ignoring unknown frame '{}'", name);
                Flow::Continue
            }
        };

        if let Some(id) = frame.id {
            if let Err(e) = self.cursors.record(chat_id.clone(), id.clone()).await {
                tracing::warn!("[STREAM] Could not persist cursor for {}: {}", chat_id.short(), e);
            }
            if flow == Flow::Continue {
                self.registry.set_state(
                    session_id,
                    ConnectionState::Streaming { cursor: Some(id) },
                );
            }
        }
        flow
    }

    /// Retires the session and reports the failure. No-op if it already retired.
    fn fail(&self, session_id: SessionId, kind: FailureKind, message: String) {
        let retired = match self.registry.remove(session_id) {
            Some(r) => r,
            None => return,
        };
        tracing::error!(
            "[STREAM] {:?} failure on {} / {}: {}",
            kind,
            retired.chat_id.short(),
            retired.message_id.short(),
            message
        );
        retired.callbacks.on_error(&StreamFailure {
            chat_id: retired.chat_id,
            message_id: retired.message_id,
            kind,
            message,
        });
    }
}

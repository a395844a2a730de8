use crate::store::Store;
use crate::types::{ChatId, EventOrdinal, MessageId, QueueInjection, SessionId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub ordinal: Option<EventOrdinal>,
    pub event: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCompletion {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    /// Server-reported status, e.g. `cancelled`.
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection failed, dropped, or ended without a terminal frame.
    Transport,
    /// The server sent a structured `error` frame.
    Processing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFailure {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub kind: FailureKind,
    pub message: String,
}

/// Effects a live session dispatches. Rebindable without touching the transport.
pub trait StreamCallbacks: Send + Sync {
    fn on_chunk(&self, chunk: &StreamChunk);
    fn on_complete(&self, done: &StreamCompletion);
    fn on_error(&self, failure: &StreamFailure);
    fn on_queue_process(&self, chat_id: &ChatId, injection: &QueueInjection);
}

pub type SharedCallbacks = Arc<dyn StreamCallbacks>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Streaming { cursor: Option<String> },
    Retiring,
}

/// Owned transport of a session. Closing cancels the reader task cooperatively.
pub struct TransportHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TransportHandle {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn close(self) {
        self.cancel.cancel();
        // The reader observes the token and exits; the handle is detached here.
        drop(self.task);
    }
}

pub struct StreamSession {
    pub id: SessionId,
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub started_at: DateTime<Utc>,
    pub is_active: bool,
    state: watch::Sender<ConnectionState>,
    transport: Option<TransportHandle>,
    callbacks: SharedCallbacks,
}

impl StreamSession {
    pub fn new(chat_id: ChatId, message_id: MessageId, callbacks: SharedCallbacks) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            id: SessionId::new(),
            chat_id,
            message_id,
            started_at: Utc::now(),
            is_active: true,
            state,
            transport: Some(TransportHandle::new()),
            callbacks,
        }
    }

    /// Token the transport reader must watch; cancelled when the session retires.
    pub fn cancel_token(&self) -> CancellationToken {
        match &self.transport {
            Some(t) => t.cancel.clone(),
            None => {
                let token = CancellationToken::new();
                token.cancel();
                token
            }
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            chat_id: self.chat_id.clone(),
            message_id: self.message_id.clone(),
            started_at: self.started_at,
            is_active: self.is_active,
            state: self.state.borrow().clone(),
        }
    }

    fn retire(mut self) -> RetiredSession {
        self.is_active = false;
        self.state.send_replace(ConnectionState::Retiring);
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        tracing::debug!(
            "[REGISTRY] Retired session {} ({} / {})",
            self.id,
            self.chat_id.short(),
            self.message_id.short()
        );
        RetiredSession {
            id: self.id,
            chat_id: self.chat_id,
            message_id: self.message_id,
            callbacks: self.callbacks,
        }
    }
}

/// Read-only view of a session for rendering and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub started_at: DateTime<Utc>,
    pub is_active: bool,
    pub state: ConnectionState,
}

/// What the caller gets back from a retirement, to dispatch terminal effects.
pub struct RetiredSession {
    pub id: SessionId,
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub callbacks: SharedCallbacks,
}

/// Dispatch target resolved at frame time.
pub struct Route {
    pub message_id: MessageId,
    pub callbacks: SharedCallbacks,
}

#[derive(Debug, Clone)]
struct ChatStreamMeta {
    active: SessionId,
    last_started: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, StreamSession>,
    by_key: HashMap<(ChatId, MessageId), SessionId>,
    chat_meta: HashMap<ChatId, ChatStreamMeta>,
}

impl RegistryState {
    /// Detaches a session from every index. Caller retires the returned value.
    fn detach(&mut self, id: &SessionId) -> Option<StreamSession> {
        let session = self.sessions.remove(id)?;
        let key = (session.chat_id.clone(), session.message_id.clone());
        if self.by_key.get(&key) == Some(id) {
            self.by_key.remove(&key);
        }

        let points_here = self
            .chat_meta
            .get(&session.chat_id)
            .map(|m| &m.active == id)
            .unwrap_or(false);
        if points_here {
            let successor = self
                .sessions
                .values()
                .filter(|s| s.chat_id == session.chat_id)
                .max_by_key(|s| s.started_at)
                .map(|s| (s.id, s.started_at));
            match successor {
                Some((active, last_started)) => {
                    self.chat_meta
                        .insert(session.chat_id.clone(), ChatStreamMeta { active, last_started });
                }
                None => {
                    self.chat_meta.remove(&session.chat_id);
                }
            }
        }
        Some(session)
    }
}

/// Table of live stream sessions, keyed by id and by (chat, message).
#[derive(Default)]
pub struct SessionRegistry {
    state: Store<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session. An existing session for the same (chat, message) is retired
    /// in the same update.
    pub fn add(&self, session: StreamSession) -> SessionId {
        let id = session.id;
        let chat_id = session.chat_id.clone();
        let message_id = session.message_id.clone();
        let replaced = self.state.update(|s| {
            let key = (session.chat_id.clone(), session.message_id.clone());
            let replaced = match s.by_key.get(&key).copied() {
                Some(prior) => s.detach(&prior).map(StreamSession::retire),
                None => None,
            };
            s.by_key.insert(key, id);
            s.chat_meta.insert(
                session.chat_id.clone(),
                ChatStreamMeta {
                    active: id,
                    last_started: session.started_at,
                },
            );
            s.sessions.insert(id, session);
            replaced
        });

        if let Some(prior) = replaced {
            tracing::info!(
                "[REGISTRY] Session {} replaced {} for {} / {}",
                id,
                prior.id,
                chat_id.short(),
                message_id.short()
            );
        } else {
            tracing::debug!(
                "[REGISTRY] Registered session {} for {} / {}",
                id,
                chat_id.short(),
                message_id.short()
            );
        }
        id
    }

    /// Retires a session. Idempotent: a second call returns `None`.
    pub fn remove(&self, id: SessionId) -> Option<RetiredSession> {
        self.state
            .update(|s| s.detach(&id))
            .map(StreamSession::retire)
    }

    pub fn get(&self, id: SessionId) -> Option<SessionInfo> {
        self.state.read(|s| s.sessions.get(&id).map(StreamSession::info))
    }

    pub fn get_by_chat_and_message(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
    ) -> Option<SessionInfo> {
        self.state.read(|s| {
            let id = s.by_key.get(&(chat_id.clone(), message_id.clone()))?;
            s.sessions.get(id).map(StreamSession::info)
        })
    }

    /// Most recently started live session of the chat.
    pub fn get_active_by_chat(&self, chat_id: &ChatId) -> Option<SessionInfo> {
        self.state.read(|s| {
            let meta = s.chat_meta.get(chat_id)?;
            s.sessions.get(&meta.active).map(StreamSession::info)
        })
    }

    pub fn last_started(&self, chat_id: &ChatId) -> Option<DateTime<Utc>> {
        self.state
            .read(|s| s.chat_meta.get(chat_id).map(|m| m.last_started))
    }

    pub fn rebind_callbacks(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        callbacks: SharedCallbacks,
    ) -> bool {
        self.state.update(|s| {
            let id = match s.by_key.get(&(chat_id.clone(), message_id.clone())) {
                Some(id) => *id,
                None => return false,
            };
            match s.sessions.get_mut(&id) {
                Some(session) => {
                    session.callbacks = callbacks;
                    true
                }
                None => false,
            }
        })
    }

    /// Re-keys the session for (chat, old) to (chat, new) in one update. A session already
    /// holding the new key is retired.
    pub fn update_message_id(&self, chat_id: &ChatId, old: &MessageId, new: &MessageId) -> bool {
        if old == new {
            return self.get_by_chat_and_message(chat_id, old).is_some();
        }
        let (moved, evicted) = self.state.update(|s| {
            let id = match s.by_key.get(&(chat_id.clone(), old.clone())) {
                Some(id) => *id,
                None => return (false, None),
            };
            let evicted = match s.by_key.get(&(chat_id.clone(), new.clone())).copied() {
                Some(occupant) if occupant != id => s.detach(&occupant).map(StreamSession::retire),
                _ => None,
            };
            s.by_key.remove(&(chat_id.clone(), old.clone()));
            s.by_key.insert((chat_id.clone(), new.clone()), id);
            if let Some(session) = s.sessions.get_mut(&id) {
                session.message_id = new.clone();
            }
            (true, evicted)
        });

        if let Some(evicted) = evicted {
            tracing::warn!(
                "[REGISTRY] Re-key onto {} evicted session {}",
                new.short(),
                evicted.id
            );
        }
        if moved {
            tracing::info!(
                "[REGISTRY] Session for chat {} re-keyed {} -> {}",
                chat_id.short(),
                old.short(),
                new.short()
            );
        }
        moved
    }

    /// Retires every session. Bookkeeping is cleared first, then transports close.
    pub fn abort_all(&self) -> Vec<RetiredSession> {
        let drained: Vec<StreamSession> = self.state.update(|s| {
            s.by_key.clear();
            s.chat_meta.clear();
            s.sessions.drain().map(|(_, session)| session).collect()
        });
        if !drained.is_empty() {
            tracing::info!("[REGISTRY] Aborting {} live sessions", drained.len());
        }
        drained.into_iter().map(StreamSession::retire).collect()
    }

    pub fn callbacks_for(&self, id: SessionId) -> Option<SharedCallbacks> {
        self.state
            .read(|s| s.sessions.get(&id).map(|session| session.callbacks.clone()))
    }

    /// Current message id and callbacks for a session, or `None` once retired.
    pub fn route(&self, id: SessionId) -> Option<Route> {
        self.state.read(|s| {
            s.sessions.get(&id).map(|session| Route {
                message_id: session.message_id.clone(),
                callbacks: session.callbacks.clone(),
            })
        })
    }

    /// Hands the reader task to its session. If the session already retired, the task is
    /// cancelled immediately.
    pub fn attach_transport(&self, id: SessionId, task: JoinHandle<()>) -> bool {
        let orphan = self.state.update(|s| match s.sessions.get_mut(&id) {
            Some(session) => match session.transport.as_mut() {
                Some(transport) => {
                    transport.task = Some(task);
                    None
                }
                None => Some(task),
            },
            None => Some(task),
        });
        match orphan {
            Some(task) => {
                task.abort();
                false
            }
            None => true,
        }
    }

    pub fn set_state(&self, id: SessionId, state: ConnectionState) -> bool {
        self.state.read(|s| match s.sessions.get(&id) {
            Some(session) => {
                session.state.send_replace(state);
                true
            }
            None => false,
        })
    }

    pub fn watch_state(&self, id: SessionId) -> Option<watch::Receiver<ConnectionState>> {
        self.state
            .read(|s| s.sessions.get(&id).map(|session| session.state.subscribe()))
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.state
            .read(|s| s.sessions.values().map(StreamSession::info).collect())
    }

    pub fn len(&self) -> usize {
        self.state.read(|s| s.sessions.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

use crate::backend::ChatBackend;
use crate::constants::{EVENT_CHANNEL_CAPACITY, MAX_MODEL_ID_CHARS, MAX_QUEUE_CONTENT_CHARS};
use crate::store::Store;
use crate::str_utils::appended_suffix;
use crate::types::*;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub content: String,
    pub model_id: String,
    pub permission_mode: PermissionMode,
    pub thinking_mode: Option<String>,
    pub files: Vec<AttachedFile>,
}

impl EnqueueRequest {
    pub fn text(content: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model_id: model_id.into(),
            permission_mode: PermissionMode::default(),
            thinking_mode: None,
            files: Vec::new(),
        }
    }
}

/// The chat's pending message as the client sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub id: QueueEntryId,
    pub content: String,
    pub model_id: String,
    pub permission_mode: PermissionMode,
    pub thinking_mode: Option<String>,
    pub attached_files: Vec<AttachedFile>,
    pub server_attachments: Option<Vec<Attachment>>,
    pub queued_at: DateTime<Utc>,
    pub synced: bool,
    mirror: ServerMirror,
}

/// What the server holds for a synced entry, as far as pushes sent so far go.
#[derive(Debug, Clone, Default, PartialEq)]
struct ServerMirror {
    content: String,
    files: Vec<String>,
    /// Set while a pusher owns this entry's upserts.
    pushing: bool,
}

impl QueuedMessage {
    fn from_request(request: EnqueueRequest) -> Self {
        Self {
            id: QueueEntryId::temporary(),
            content: request.content,
            model_id: request.model_id,
            permission_mode: request.permission_mode,
            thinking_mode: request.thinking_mode,
            attached_files: request.files,
            server_attachments: None,
            queued_at: Utc::now(),
            synced: false,
            mirror: ServerMirror::default(),
        }
    }

    fn from_server(record: ServerQueuedMessage) -> Self {
        let mirror = ServerMirror {
            content: record.content.clone(),
            ..ServerMirror::default()
        };
        Self {
            id: record.id,
            content: record.content,
            model_id: record.model_id,
            permission_mode: record.permission_mode,
            thinking_mode: record.thinking_mode,
            attached_files: Vec::new(),
            server_attachments: record.attachments,
            queued_at: record.queued_at,
            synced: true,
            mirror,
        }
    }

    /// Starts a push of whatever the server has not seen. `None` when there is nothing new
    /// or another pusher already owns the entry.
    fn claim_delta(&mut self) -> Option<QueueUpload> {
        if self.mirror.pushing {
            return None;
        }
        self.next_delta()
    }

    /// Takes the unsent suffix and files for the current pusher, releasing the entry when
    /// there are none left.
    fn next_delta(&mut self) -> Option<QueueUpload> {
        let content = appended_suffix(&self.mirror.content, &self.content)
            .map(str::to_string)
            .unwrap_or_default();
        let files: Vec<AttachedFile> = self
            .attached_files
            .iter()
            .filter(|f| !self.mirror.files.contains(&f.filename))
            .cloned()
            .collect();
        if content.is_empty() && files.is_empty() {
            self.mirror.pushing = false;
            return None;
        }

        self.mirror.content = self.content.clone();
        self.mirror
            .files
            .extend(files.iter().map(|f| f.filename.clone()));
        self.mirror.pushing = true;
        Some(QueueUpload {
            content,
            model_id: self.model_id.clone(),
            permission_mode: self.permission_mode,
            thinking_mode: self.thinking_mode.clone(),
            files,
        })
    }

    fn upload(&self, model_override: Option<&str>) -> QueueUpload {
        QueueUpload {
            content: self.content.clone(),
            model_id: model_override.unwrap_or(&self.model_id).to_string(),
            permission_mode: self.permission_mode,
            thinking_mode: self.thinking_mode.clone(),
            files: self.attached_files.clone(),
        }
    }
}

/// Observable queue transitions, including failures that are otherwise swallowed.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Enqueued { chat_id: ChatId, id: QueueEntryId },
    Synced { chat_id: ChatId, id: QueueEntryId },
    /// First sync failed transiently; the entry stays for the next pass.
    SyncDeferred { chat_id: ChatId, reason: String },
    /// First sync was refused; the entry was dropped.
    Rejected { chat_id: ChatId, reason: String },
    /// A follow-up push failed after the entry was already synced. Local state kept.
    SyncFailed { chat_id: ChatId, reason: String },
    Cleared { chat_id: ChatId },
    Consumed { chat_id: ChatId, id: QueueEntryId },
}

enum Merge {
    Created(QueueEntryId),
    AppendedLocal(QueueEntryId),
    AppendedSynced(QueueEntryId, Option<QueueUpload>),
}

/// Work left over after a first sync lands, decided from the entry as it is now.
enum FollowUp {
    None,
    Push(QueueUpload),
    Overwrite(String),
    /// The entry was cancelled or replaced while the upsert was in flight.
    Orphaned,
}

struct InFlightGuard<'a> {
    set: &'a Store<HashSet<ChatId>>,
    chat_id: ChatId,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Store<HashSet<ChatId>>, chat_id: &ChatId) -> Option<Self> {
        let acquired = set.update(|s| s.insert(chat_id.clone()));
        acquired.then(|| Self {
            set,
            chat_id: chat_id.clone(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.update(|s| {
            s.remove(&self.chat_id);
        });
    }
}

pub fn validate(content: &str, model_id: &str) -> Result<()> {
    let content_chars = content.chars().count();
    if content.trim().is_empty() {
        return Err(ParleyError::Validation("content must not be empty".to_string()).into());
    }
    if content_chars > MAX_QUEUE_CONTENT_CHARS {
        return Err(ParleyError::Validation(format!(
            "content is {} characters, limit is {}",
            content_chars, MAX_QUEUE_CONTENT_CHARS
        ))
        .into());
    }
    let model_chars = model_id.chars().count();
    if model_chars == 0 || model_chars > MAX_MODEL_ID_CHARS {
        return Err(ParleyError::Validation(format!(
            "model id must be 1..={} characters",
            MAX_MODEL_ID_CHARS
        ))
        .into());
    }
    Ok(())
}

fn join_content(existing: &str, addition: &str) -> String {
    if existing.is_empty() {
        addition.to_string()
    } else {
        format!("{}\n{}", existing, addition)
    }
}

/// Adds files whose name is not already attached. Returns how many were added.
fn merge_files(into: &mut Vec<AttachedFile>, incoming: Vec<AttachedFile>) -> usize {
    let mut added = 0;
    for file in incoming {
        if into.iter().any(|f| f.filename == file.filename) {
            continue;
        }
        into.push(file);
        added += 1;
    }
    added
}

/// Single-slot, offline-first pending message per chat.
pub struct QueueCoordinator {
    backend: Arc<dyn ChatBackend>,
    entries: Store<HashMap<ChatId, QueuedMessage>>,
    in_flight: Store<HashSet<ChatId>>,
    events: broadcast::Sender<QueueEvent>,
    auto_sync: bool,
}

impl QueueCoordinator {
    pub fn new(backend: Arc<dyn ChatBackend>, auto_sync: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            backend,
            entries: Store::new(HashMap::new()),
            in_flight: Store::new(HashSet::new()),
            events,
            auto_sync,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    pub fn get(&self, chat_id: &ChatId) -> Option<QueuedMessage> {
        self.entries.read(|m| m.get(chat_id).cloned())
    }

    pub fn is_syncing(&self, chat_id: &ChatId) -> bool {
        self.in_flight.read(|s| s.contains(chat_id))
    }

    /// Adds to the chat's pending message, creating it if absent. Returns without waiting on
    /// the network; background work is spawned on the current runtime.
    pub fn enqueue(self: &Arc<Self>, chat_id: &ChatId, request: EnqueueRequest) -> Result<QueueEntryId> {
        validate(&request.content, &request.model_id)?;

        let merge = self.entries.update(|m| match m.get_mut(chat_id) {
            Some(entry) => {
                let merged = join_content(&entry.content, &request.content);
                let merged_chars = merged.chars().count();
                if merged_chars > MAX_QUEUE_CONTENT_CHARS {
                    return Err(ParleyError::Validation(format!(
                        "merged content would be {} characters, limit is {}",
                        merged_chars, MAX_QUEUE_CONTENT_CHARS
                    )));
                }
                entry.content = merged;
                let added = merge_files(&mut entry.attached_files, request.files);
                if added > 0 {
                    tracing::debug!("[QUEUE] Attached {} new file(s) for chat {}", added, chat_id.short());
                }
                Ok(if entry.synced {
                    Merge::AppendedSynced(entry.id.clone(), entry.claim_delta())
                } else {
                    Merge::AppendedLocal(entry.id.clone())
                })
            }
            None => {
                let entry = QueuedMessage::from_request(request);
                let id = entry.id.clone();
                m.insert(chat_id.clone(), entry);
                Ok(Merge::Created(id))
            }
        })?;

        let id = match merge {
            Merge::Created(id) => {
                tracing::info!("[QUEUE] New pending message {} for chat {}", id, chat_id.short());
                self.emit(QueueEvent::Enqueued {
                    chat_id: chat_id.clone(),
                    id: id.clone(),
                });
                self.spawn_drain(chat_id);
                id
            }
            Merge::AppendedLocal(id) => {
                tracing::debug!("[QUEUE] Appended to unsynced message for chat {}", chat_id.short());
                self.spawn_drain(chat_id);
                id
            }
            Merge::AppendedSynced(id, claimed) => {
                tracing::debug!("[QUEUE] Appended to synced message {} for chat {}", id, chat_id.short());
                // Without a claim the running pusher sends this append after its current one
                if let Some(upload) = claimed {
                    let this = Arc::clone(self);
                    let chat = chat_id.clone();
                    let entry_id = id.clone();
                    tokio::spawn(async move {
                        this.push_appends(&chat, &entry_id, upload).await;
                    });
                }
                id
            }
        };
        Ok(id)
    }

    fn spawn_drain(self: &Arc<Self>, chat_id: &ChatId) {
        if !self.auto_sync {
            return;
        }
        let this = Arc::clone(self);
        let chat = chat_id.clone();
        tokio::spawn(async move {
            if let Err(e) = this.sync_pending_messages(&chat, None).await {
                tracing::debug!("[QUEUE] Background sync for {} stopped: {}", chat.short(), e);
            }
        });
    }

    /// Sends appended text to the server one upsert at a time, until the entry has nothing
    /// unsent. The server merges each upsert in arrival order, so only the claiming pusher
    /// may send. Failures are logged and the local entry is left as is.
    async fn push_appends(&self, chat_id: &ChatId, entry_id: &QueueEntryId, first: QueueUpload) {
        let mut upload = first;
        loop {
            let attachments = match self.backend.enqueue(chat_id.clone(), upload).await {
                Ok(resp) => Some(resp.attachments),
                Err(e) => {
                    tracing::warn!("[QUEUE] Incremental sync failed for chat {}: {}", chat_id.short(), e);
                    self.emit(QueueEvent::SyncFailed {
                        chat_id: chat_id.clone(),
                        reason: e.to_string(),
                    });
                    None
                }
            };

            let next = self.entries.update(|m| match m.get_mut(chat_id) {
                Some(entry) if &entry.id == entry_id => {
                    if let Some(attachments) = attachments {
                        entry.server_attachments = attachments;
                    }
                    entry.next_delta()
                }
                _ => None,
            });
            match next {
                Some(more) => upload = more,
                None => return,
            }
        }
    }

    /// Overwrites the pending message. Empty content cancels it.
    pub async fn update(&self, chat_id: &ChatId, content: &str) -> Result<()> {
        if content.trim().is_empty() {
            self.clear_and_sync(chat_id).await;
            return Ok(());
        }
        let model_id = match self.get(chat_id) {
            Some(entry) => entry.model_id,
            None => {
                return Err(ParleyError::Validation(format!(
                    "no pending message for chat {}",
                    chat_id
                ))
                .into())
            }
        };
        validate(content, &model_id)?;

        let synced = self.entries.update(|m| {
            m.get_mut(chat_id).map(|entry| {
                entry.content = content.to_string();
                if entry.synced {
                    entry.mirror.content = entry.content.clone();
                }
                entry.synced
            })
        });
        if synced != Some(true) {
            return Ok(());
        }

        match self.backend.update_queue(chat_id.clone(), content.to_string()).await {
            Ok(record) => {
                self.entries.update(|m| {
                    if let Some(entry) = m.get_mut(chat_id) {
                        if entry.id == record.id {
                            entry.server_attachments = record.attachments;
                        }
                    }
                });
            }
            Err(e) => {
                tracing::warn!("[QUEUE] Update sync failed for chat {}: {}", chat_id.short(), e);
                self.emit(QueueEvent::SyncFailed {
                    chat_id: chat_id.clone(),
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Drops the local entry right away; deletes the server copy only if it was synced.
    pub async fn clear_and_sync(&self, chat_id: &ChatId) -> Option<QueuedMessage> {
        let removed = self.entries.update(|m| m.remove(chat_id))?;
        self.emit(QueueEvent::Cleared {
            chat_id: chat_id.clone(),
        });
        if removed.synced {
            if let Err(e) = self.backend.clear_queue(chat_id.clone()).await {
                tracing::warn!("[QUEUE] Server clear failed for chat {}: {}", chat_id.short(), e);
                self.emit(QueueEvent::SyncFailed {
                    chat_id: chat_id.clone(),
                    reason: e.to_string(),
                });
            }
        }
        Some(removed)
    }

    /// Reconciles with the server's entry. Unsynced local entries survive unless the server
    /// entry carries the same id.
    pub async fn fetch_queue(&self, chat_id: &ChatId) -> Result<Option<QueuedMessage>> {
        let server = self.backend.fetch_queue(chat_id.clone()).await?;
        let current = self.entries.update(|m| {
            let local_unsynced = m.get(chat_id).filter(|e| !e.synced).map(|e| e.id.clone());
            match (local_unsynced, server) {
                (Some(local_id), Some(record)) if record.id == local_id => {
                    m.insert(chat_id.clone(), QueuedMessage::from_server(record));
                }
                (Some(_), _) => {}
                (None, Some(record)) => {
                    let previous = m
                        .get(chat_id)
                        .filter(|e| e.id == record.id)
                        .map(|e| (e.attached_files.clone(), e.mirror.pushing));
                    let mut entry = QueuedMessage::from_server(record);
                    if let Some((files, pushing)) = previous {
                        entry.mirror.files = files.iter().map(|f| f.filename.clone()).collect();
                        entry.mirror.pushing = pushing;
                        entry.attached_files = files;
                    }
                    m.insert(chat_id.clone(), entry);
                }
                (None, None) => {
                    m.remove(chat_id);
                }
            }
            m.get(chat_id).cloned()
        });
        Ok(current)
    }

    /// Pushes the chat's unsynced entry to the server, one at a time, stopping at the first
    /// failure. Returns `false` if another drain for the chat is already running.
    pub async fn sync_pending_messages(&self, chat_id: &ChatId, model_id: Option<&str>) -> Result<bool> {
        let _guard = match InFlightGuard::acquire(&self.in_flight, chat_id) {
            Some(g) => g,
            None => {
                tracing::debug!("[QUEUE] Drain already running for chat {}", chat_id.short());
                return Ok(false);
            }
        };

        loop {
            let snapshot = match self.entries.read(|m| m.get(chat_id).filter(|e| !e.synced).cloned()) {
                Some(entry) => entry,
                None => return Ok(true),
            };

            let response = match self
                .backend
                .enqueue(chat_id.clone(), snapshot.upload(model_id))
                .await
            {
                Ok(r) => r,
                Err(e) => return Err(self.first_sync_failed(chat_id, &snapshot.id, e)),
            };

            let server_id = response.id.clone();
            let follow_up = self.entries.update(|m| match m.get_mut(chat_id) {
                Some(entry) if entry.id == snapshot.id => {
                    entry.id = response.id;
                    entry.synced = true;
                    entry.server_attachments = response.attachments;
                    entry.mirror = ServerMirror {
                        content: snapshot.content.clone(),
                        files: snapshot.attached_files.iter().map(|f| f.filename.clone()).collect(),
                        pushing: false,
                    };
                    let extended = entry.content == snapshot.content
                        || appended_suffix(&snapshot.content, &entry.content).is_some();
                    if extended {
                        match entry.claim_delta() {
                            Some(upload) => FollowUp::Push(upload),
                            None => FollowUp::None,
                        }
                    } else {
                        entry.mirror.content = entry.content.clone();
                        FollowUp::Overwrite(entry.content.clone())
                    }
                }
                _ => FollowUp::Orphaned,
            });

            tracing::info!(
                "[QUEUE] Synced {} -> {} for chat {}",
                snapshot.id,
                server_id,
                chat_id.short()
            );
            self.emit(QueueEvent::Synced {
                chat_id: chat_id.clone(),
                id: server_id.clone(),
            });

            match follow_up {
                FollowUp::None => {}
                FollowUp::Push(upload) => self.push_appends(chat_id, &server_id, upload).await,
                FollowUp::Overwrite(content) => {
                    if let Err(e) = self.backend.update_queue(chat_id.clone(), content).await {
                        tracing::warn!("[QUEUE] Follow-up update failed for chat {}: {}", chat_id.short(), e);
                        self.emit(QueueEvent::SyncFailed {
                            chat_id: chat_id.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
                FollowUp::Orphaned => {
                    tracing::info!(
                        "[QUEUE] Entry for chat {} was cancelled mid-sync, clearing server copy",
                        chat_id.short()
                    );
                    if let Err(e) = self.backend.clear_queue(chat_id.clone()).await {
                        tracing::warn!("[QUEUE] Orphan clear failed for chat {}: {}", chat_id.short(), e);
                        self.emit(QueueEvent::SyncFailed {
                            chat_id: chat_id.clone(),
                            reason: e.to_string(),
                        });
                        return Err(ParleyError::SyncFailure(e.to_string()).into());
                    }
                }
            }
        }
    }

    fn first_sync_failed(&self, chat_id: &ChatId, entry_id: &QueueEntryId, err: ObservedError) -> ObservedError {
        if err.is_transient() {
            tracing::warn!(
                "[QUEUE] Sync deferred for chat {} (entry kept): {}",
                chat_id.short(),
                err
            );
            self.emit(QueueEvent::SyncDeferred {
                chat_id: chat_id.clone(),
                reason: err.to_string(),
            });
        } else {
            tracing::error!("[QUEUE] Server rejected pending message for chat {}: {}", chat_id.short(), err);
            self.entries.update(|m| {
                if m.get(chat_id).map(|e| &e.id == entry_id).unwrap_or(false) {
                    m.remove(chat_id);
                }
            });
            self.emit(QueueEvent::Rejected {
                chat_id: chat_id.clone(),
                reason: err.to_string(),
            });
        }
        ParleyError::SyncFailure(err.to_string()).into()
    }

    /// Drains every chat with an unsynced entry, stopping at the first failure.
    pub async fn sync_all_pending(&self) -> Result<usize> {
        let mut chats: Vec<ChatId> = self.entries.read(|m| {
            m.iter()
                .filter(|(_, e)| !e.synced)
                .map(|(chat, _)| chat.clone())
                .collect()
        });
        chats.sort();

        let mut drained = 0;
        for chat_id in chats {
            if self.sync_pending_messages(&chat_id, None).await? {
                drained += 1;
            }
        }
        Ok(drained)
    }

    /// Removes the entry a queue injection consumed. A synced entry under another id may have
    /// been created after the server popped its slot, so it stays and is reconciled instead.
    pub fn acknowledge_injection(
        self: &Arc<Self>,
        chat_id: &ChatId,
        queued_id: &QueueEntryId,
    ) -> Option<QueuedMessage> {
        let (removed, mismatched_synced) = self.entries.update(|m| {
            match m.get(chat_id).map(|e| (&e.id == queued_id, e.synced)) {
                Some((true, _)) => (m.remove(chat_id), false),
                Some((false, synced)) => (None, synced),
                None => (None, false),
            }
        });
        if mismatched_synced {
            tracing::info!(
                "[QUEUE] Injection of {} does not match the synced entry for chat {}, reconciling",
                queued_id,
                chat_id.short()
            );
            let this = Arc::clone(self);
            let chat = chat_id.clone();
            tokio::spawn(async move {
                if let Err(e) = this.fetch_queue(&chat).await {
                    tracing::warn!("[QUEUE] Reconcile after injection failed for chat {}: {}", chat.short(), e);
                }
            });
        }
        match &removed {
            Some(entry) => {
                tracing::info!("[QUEUE] Entry {} for chat {} was injected", entry.id, chat_id.short());
                self.emit(QueueEvent::Consumed {
                    chat_id: chat_id.clone(),
                    id: entry.id.clone(),
                });
            }
            None => tracing::debug!(
                "[QUEUE] Injection of {} for chat {} matched no local entry",
                queued_id,
                chat_id.short()
            ),
        }
        removed
    }

    /// Takes the entry out for conversion into chat messages.
    pub fn flush(&self, chat_id: &ChatId) -> Option<QueuedMessage> {
        let removed = self.entries.update(|m| m.remove(chat_id));
        if let Some(entry) = &removed {
            self.emit(QueueEvent::Consumed {
                chat_id: chat_id.clone(),
                id: entry.id.clone(),
            });
        }
        removed
    }
}

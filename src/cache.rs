use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::store::Store;
use crate::types::{ChatId, ChatMessage, EventOrdinal, MessageId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;

/// One page of a chat's history. Messages are newest-first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePage {
    pub messages: Vec<ChatMessage>,
    pub next_cursor: Option<String>,
}

/// Cached queries that can be invalidated for refetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Messages(ChatId),
    UsageStats,
    ContextUsage(ChatId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Applied,
    Duplicate,
    Missing,
}

#[derive(Default)]
struct CacheState {
    pages: HashMap<ChatId, Arc<Vec<MessagePage>>>,
    generations: HashMap<QueryKey, u64>,
}

/// Paginated, reverse-chronological message cache (page 0 is newest).
///
/// Every mutation builds a new page list and swaps it in whole, so a reader holding an
/// `Arc` from [`MessageCache::pages`] never sees a half-applied edit.
pub struct MessageCache {
    state: Store<CacheState>,
    tx_invalidate: broadcast::Sender<QueryKey>,
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCache {
    pub fn new() -> Self {
        let (tx_invalidate, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Store::new(CacheState::default()),
            tx_invalidate,
        }
    }

    pub fn seed(&self, chat_id: &ChatId, pages: Vec<MessagePage>) {
        self.state.update(|s| {
            s.pages.insert(chat_id.clone(), Arc::new(pages));
        });
    }

    pub fn pages(&self, chat_id: &ChatId) -> Option<Arc<Vec<MessagePage>>> {
        self.state.read(|s| s.pages.get(chat_id).cloned())
    }

    pub fn find(&self, chat_id: &ChatId, message_id: &MessageId) -> Option<ChatMessage> {
        let pages = self.pages(chat_id)?;
        pages
            .iter()
            .flat_map(|p| p.messages.iter())
            .find(|m| &m.id == message_id)
            .cloned()
    }

    /// Applies `patch` to the message with `message_id`, wherever it sits.
    ///
    /// Returns `None` if the message is not cached, otherwise the patch's result.
    pub fn patch_message<R>(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        patch: impl FnOnce(&mut ChatMessage) -> R,
    ) -> Option<R> {
        self.state.update(|s| {
            let current = s.pages.get(chat_id)?;
            let (page_idx, msg_idx) = current.iter().enumerate().find_map(|(pi, page)| {
                page.messages
                    .iter()
                    .position(|m| &m.id == message_id)
                    .map(|mi| (pi, mi))
            })?;

            let mut next: Vec<MessagePage> = current.as_ref().clone();
            let result = patch(&mut next[page_idx].messages[msg_idx]);
            s.pages.insert(chat_id.clone(), Arc::new(next));
            Some(result)
        })
    }

    /// Appends a stream event to a message, keyed by ordinal.
    ///
    /// An event whose ordinal is not beyond the message's applied ordinal was already
    /// folded in and is skipped, so replaying the same frames is harmless.
    pub fn append_event(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        ordinal: Option<EventOrdinal>,
        event: &serde_json::Value,
    ) -> AppendOutcome {
        let outcome = self.patch_message(chat_id, message_id, |msg| {
            apply_event(msg, ordinal, event)
        });
        match outcome {
            Some(true) => AppendOutcome::Applied,
            Some(false) => AppendOutcome::Duplicate,
            None => AppendOutcome::Missing,
        }
    }

    /// Inserts messages at the head of page 0, skipping ids already cached.
    ///
    /// `messages` is given oldest-first (e.g. user then assistant) and lands newest-first.
    pub fn insert_at_head(&self, chat_id: &ChatId, messages: Vec<ChatMessage>) -> usize {
        self.state.update(|s| {
            let mut next: Vec<MessagePage> = match s.pages.get(chat_id) {
                Some(p) => p.as_ref().clone(),
                None => Vec::new(),
            };
            let existing: HashSet<MessageId> = next
                .iter()
                .flat_map(|p| p.messages.iter().map(|m| m.id.clone()))
                .collect();

            let mut fresh: Vec<ChatMessage> = Vec::new();
            for msg in messages {
                if existing.contains(&msg.id) || fresh.iter().any(|m| m.id == msg.id) {
                    continue;
                }
                fresh.push(msg);
            }
            let inserted = fresh.len();
            if inserted == 0 {
                return 0;
            }

            if next.is_empty() {
                next.push(MessagePage::default());
            }
            let head = &mut next[0].messages;
            for msg in fresh {
                head.insert(0, msg);
            }
            s.pages.insert(chat_id.clone(), Arc::new(next));
            inserted
        })
    }

    /// Removes every message whose id is in `ids`, across all pages.
    pub fn remove_messages(&self, chat_id: &ChatId, ids: &HashSet<MessageId>) -> usize {
        if ids.is_empty() {
            return 0;
        }
        self.state.update(|s| {
            let current = match s.pages.get(chat_id) {
                Some(p) => p,
                None => return 0,
            };
            let mut removed = 0;
            let next: Vec<MessagePage> = current
                .iter()
                .map(|page| {
                    let before = page.messages.len();
                    let messages: Vec<ChatMessage> = page
                        .messages
                        .iter()
                        .filter(|m| !ids.contains(&m.id))
                        .cloned()
                        .collect();
                    removed += before - messages.len();
                    MessagePage {
                        messages,
                        next_cursor: page.next_cursor.clone(),
                    }
                })
                .collect();
            if removed > 0 {
                s.pages.insert(chat_id.clone(), Arc::new(next));
            }
            removed
        })
    }

    /// Marks a query stale. Message pages are dropped so the next read refetches.
    pub fn invalidate(&self, key: QueryKey) {
        let generation = self.state.update(|s| {
            if let QueryKey::Messages(chat_id) = &key {
                s.pages.remove(chat_id);
            }
            let counter = s.generations.entry(key.clone()).or_insert(0);
            *counter += 1;
            *counter
        });
        tracing::debug!("Invalidated {:?} (generation {})", key, generation);
        let _ = self.tx_invalidate.send(key);
    }

    pub fn generation(&self, key: &QueryKey) -> u64 {
        self.state.read(|s| s.generations.get(key).copied().unwrap_or(0))
    }

    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<QueryKey> {
        self.tx_invalidate.subscribe()
    }
}

/// Folds one ordinal-keyed event into a message. Returns false for duplicates.
pub fn apply_event(
    msg: &mut ChatMessage,
    ordinal: Option<EventOrdinal>,
    event: &serde_json::Value,
) -> bool {
    if let (Some(incoming), Some(applied)) = (ordinal, msg.applied_through) {
        if incoming <= applied {
            return false;
        }
    }
    msg.events.push(event.clone());
    if ordinal.is_some() {
        msg.applied_through = ordinal;
    }
    true
}

use crate::store::Store;
use crate::types::{ChatId, ChatMessage, MessageId};
use std::collections::HashMap;

/// Live UI state of one chat. Messages are oldest-first, as rendered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatViewState {
    pub messages: Vec<ChatMessage>,
    pub is_streaming: bool,
    pub is_loading: bool,
    pub streaming_message_id: Option<MessageId>,
    pub pending_user_message_id: Option<MessageId>,
    pub permission_request: Option<serde_json::Value>,
    pub context_usage: Option<serde_json::Value>,
}

impl ChatViewState {
    pub fn message(&self, id: &MessageId) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn message_mut(&mut self, id: &MessageId) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|m| &m.id == id)
    }

    /// Appends unless a message with the same id is already shown.
    pub fn push_message(&mut self, message: ChatMessage) -> bool {
        if self.message(&message.id).is_some() {
            return false;
        }
        self.messages.push(message);
        true
    }

    pub fn remove_messages(&mut self, ids: &[&MessageId]) {
        self.messages.retain(|m| !ids.contains(&&m.id));
    }

    pub fn clear_stream_flags(&mut self) {
        self.is_streaming = false;
        self.is_loading = false;
        self.streaming_message_id = None;
    }
}

#[derive(Default)]
pub struct ChatViewStore {
    chats: Store<HashMap<ChatId, ChatViewState>>,
}

impl ChatViewStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, chat_id: &ChatId) -> ChatViewState {
        self.chats
            .read(|c| c.get(chat_id).cloned().unwrap_or_default())
    }

    pub fn update<R>(&self, chat_id: &ChatId, f: impl FnOnce(&mut ChatViewState) -> R) -> R {
        self.chats
            .update(|c| f(c.entry(chat_id.clone()).or_default()))
    }
}

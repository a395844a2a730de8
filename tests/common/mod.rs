#![allow(dead_code)]

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use parley::backend::{ChatBackend, FrameStream};
use parley::sse::SseFrame;
use parley::store::Store;
use parley::*;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Start(ChatId),
    Open { chat_id: ChatId, last_event_id: Option<String> },
    Status(ChatId),
    Stop(ChatId),
    Enqueue { chat_id: ChatId, content: String, files: Vec<String> },
    FetchQueue(ChatId),
    UpdateQueue { chat_id: ChatId, content: String },
    ClearQueue(ChatId),
}

/// What the next `open_stream` call yields.
pub enum Script {
    /// These frames, then the stream ends.
    Frames(Vec<SseFrame>),
    /// Frames pushed by the test through the paired sender.
    Live(mpsc::Receiver<Result<SseFrame>>),
    /// The connection attempt itself fails.
    Refuse(String),
}

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Transient,
    Rejected,
}

impl Failure {
    fn into_error(self) -> ObservedError {
        match self {
            Failure::Transient => ParleyError::Transport("connection refused".to_string()).into(),
            Failure::Rejected => ParleyError::Upstream(
                reqwest::StatusCode::UNPROCESSABLE_ENTITY,
                "invalid queue payload".to_string(),
            )
            .into(),
        }
    }
}

/// Holds the next enqueue call until the test releases it.
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

#[derive(Default)]
pub struct MockBackend {
    pub calls: Store<Vec<Call>>,
    scripts: Store<VecDeque<Script>>,
    start_ids: Store<VecDeque<MessageId>>,
    fail_start: Store<bool>,
    status: Store<StreamStatus>,
    server_queue: Store<HashMap<ChatId, ServerQueuedMessage>>,
    enqueue_failures: Store<VecDeque<Failure>>,
    gate: Store<Option<Arc<Gate>>>,
    next_queue_id: Store<u32>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, script: Script) {
        self.scripts.update(|s| s.push_back(script));
    }

    pub fn script_frames(&self, frames: Vec<SseFrame>) {
        self.script(Script::Frames(frames));
    }

    /// Scripts a live stream and returns the sender that feeds it.
    pub fn script_live(&self) -> mpsc::Sender<Result<SseFrame>> {
        let (tx, rx) = mpsc::channel(64);
        self.script(Script::Live(rx));
        tx
    }

    pub fn next_start_id(&self, id: &str) {
        self.start_ids.update(|q| q.push_back(MessageId::from(id)));
    }

    pub fn fail_start(&self) {
        self.fail_start.replace(true);
    }

    pub fn set_status(&self, status: StreamStatus) {
        self.status.replace(status);
    }

    pub fn fail_next_enqueue(&self, failure: Failure) {
        self.enqueue_failures.update(|q| q.push_back(failure));
    }

    pub fn hold_next_enqueue(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate {
            entered: Notify::new(),
            release: Notify::new(),
        });
        self.gate.replace(Some(Arc::clone(&gate)));
        gate
    }

    pub fn seed_server_queue(&self, chat_id: &ChatId, id: &str, content: &str) {
        self.server_queue.update(|q| {
            q.insert(chat_id.clone(), server_record(id, content));
        });
    }

    pub fn server_entry(&self, chat_id: &ChatId) -> Option<ServerQueuedMessage> {
        self.server_queue.read(|q| q.get(chat_id).cloned())
    }

    pub fn drop_server_entry(&self, chat_id: &ChatId) {
        self.server_queue.update(|q| {
            q.remove(chat_id);
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.snapshot()
    }

    pub fn opened_with(&self) -> Vec<Option<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Open { last_event_id, .. } => Some(last_event_id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.update(|c| c.push(call));
    }
}

fn server_record(id: &str, content: &str) -> ServerQueuedMessage {
    ServerQueuedMessage {
        id: QueueEntryId::from(id),
        content: content.to_string(),
        model_id: "model-a".to_string(),
        permission_mode: PermissionMode::Auto,
        thinking_mode: None,
        queued_at: Utc::now(),
        attachments: None,
    }
}

impl ChatBackend for MockBackend {
    fn start_chat(&self, request: ChatRequest) -> BoxFuture<'_, Result<StartResponse>> {
        Box::pin(async move {
            self.record(Call::Start(request.chat_id.clone()));
            if self.fail_start.snapshot() {
                return Err(ParleyError::Upstream(
                    reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                    "generation unavailable".to_string(),
                )
                .into());
            }
            let message_id = self
                .start_ids
                .update(|q| q.pop_front())
                .unwrap_or_else(|| MessageId::from("a1"));
            Ok(StartResponse {
                chat_id: request.chat_id,
                message_id,
            })
        })
    }

    fn open_stream(
        &self,
        chat_id: ChatId,
        last_event_id: Option<String>,
    ) -> BoxFuture<'_, Result<FrameStream>> {
        Box::pin(async move {
            self.record(Call::Open {
                chat_id,
                last_event_id,
            });
            match self.scripts.update(|s| s.pop_front()) {
                Some(Script::Frames(frames)) => {
                    Ok(futures_util::stream::iter(frames.into_iter().map(Ok)).boxed())
                }
                Some(Script::Live(rx)) => Ok(ReceiverStream::new(rx).boxed()),
                Some(Script::Refuse(reason)) => Err(ParleyError::Transport(reason).into()),
                None => Ok(futures_util::stream::empty().boxed()),
            }
        })
    }

    fn stream_status(&self, chat_id: ChatId) -> BoxFuture<'_, Result<StreamStatus>> {
        Box::pin(async move {
            self.record(Call::Status(chat_id));
            Ok(self.status.snapshot())
        })
    }

    fn stop_stream(&self, chat_id: ChatId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.record(Call::Stop(chat_id));
            Ok(())
        })
    }

    fn enqueue(
        &self,
        chat_id: ChatId,
        upload: QueueUpload,
    ) -> BoxFuture<'_, Result<QueueUpsertResponse>> {
        Box::pin(async move {
            self.record(Call::Enqueue {
                chat_id: chat_id.clone(),
                content: upload.content.clone(),
                files: upload.files.iter().map(|f| f.filename.clone()).collect(),
            });
            if let Some(gate) = self.gate.replace(None) {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
            if let Some(failure) = self.enqueue_failures.update(|q| q.pop_front()) {
                return Err(failure.into_error());
            }

            let fresh_id = self.next_queue_id.update(|n| {
                *n += 1;
                format!("q{}", n)
            });
            let response = self.server_queue.update(|q| match q.get_mut(&chat_id) {
                Some(existing) => {
                    existing.content = format!("{}\n{}", existing.content, upload.content);
                    QueueUpsertResponse {
                        id: existing.id.clone(),
                        created: false,
                        content: existing.content.clone(),
                        attachments: None,
                    }
                }
                None => {
                    let record = server_record(&fresh_id, &upload.content);
                    q.insert(chat_id.clone(), record);
                    QueueUpsertResponse {
                        id: QueueEntryId::from(fresh_id.as_str()),
                        created: true,
                        content: upload.content.clone(),
                        attachments: None,
                    }
                }
            });
            Ok(response)
        })
    }

    fn fetch_queue(&self, chat_id: ChatId) -> BoxFuture<'_, Result<Option<ServerQueuedMessage>>> {
        Box::pin(async move {
            self.record(Call::FetchQueue(chat_id.clone()));
            Ok(self.server_entry(&chat_id))
        })
    }

    fn update_queue(
        &self,
        chat_id: ChatId,
        content: String,
    ) -> BoxFuture<'_, Result<ServerQueuedMessage>> {
        Box::pin(async move {
            self.record(Call::UpdateQueue {
                chat_id: chat_id.clone(),
                content: content.clone(),
            });
            self.server_queue.update(|q| match q.get_mut(&chat_id) {
                Some(existing) => {
                    existing.content = content;
                    Ok(existing.clone())
                }
                None => Err(ParleyError::Upstream(
                    reqwest::StatusCode::NOT_FOUND,
                    "no queued message".to_string(),
                )
                .into()),
            })
        })
    }

    fn clear_queue(&self, chat_id: ChatId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.record(Call::ClearQueue(chat_id.clone()));
            self.drop_server_entry(&chat_id);
            Ok(())
        })
    }
}

pub fn content_frame(id: u64, text: &str) -> SseFrame {
    let data = serde_json::json!({ "event": { "type": "assistant_text", "text": text } });
    SseFrame::new("content", data.to_string()).with_id(id.to_string())
}

pub fn complete_frame(id: u64) -> SseFrame {
    SseFrame::new("complete", "{}").with_id(id.to_string())
}

pub fn error_frame(id: u64, message: &str) -> SseFrame {
    let data = serde_json::json!({ "error": message });
    SseFrame::new("error", data.to_string()).with_id(id.to_string())
}

pub fn injected_frame(id: u64, queued: &str, user: &str, assistant: &str, content: &str) -> SseFrame {
    let data = serde_json::json!({
        "queued_message_id": queued,
        "user_message_id": user,
        "assistant_message_id": assistant,
        "content": content,
        "model_id": "model-a",
        "attachments": null,
    });
    SseFrame::new("queue_injected", data.to_string()).with_id(id.to_string())
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

/// Waits for a notification with a two-second ceiling.
pub async fn notified(notify: &Notify, what: &str) {
    if tokio::time::timeout(Duration::from_secs(2), notify.notified())
        .await
        .is_err()
    {
        panic!("timed out waiting for: {}", what);
    }
}

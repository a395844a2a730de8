mod common;

use common::*;
use parley::cache::QueryKey;
use parley::cursor::MemoryCursorStore;
use parley::orchestrator::{StartRequest, UiBindings, UiHooks};
use parley::registry::{StreamChunk, StreamCompletion, StreamFailure};
use parley::store::Store;
use parley::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct Hooks {
    chunks: Store<Vec<StreamChunk>>,
    completions: Store<Vec<StreamCompletion>>,
    failures: Store<Vec<StreamFailure>>,
    injections: Store<Vec<QueueInjection>>,
    notifications: Store<usize>,
    finished: Notify,
}

impl UiHooks for Hooks {
    fn on_chunk(&self, chunk: &StreamChunk) {
        self.chunks.update(|c| c.push(chunk.clone()));
    }

    fn on_complete(&self, done: &StreamCompletion) {
        self.completions.update(|c| c.push(done.clone()));
        self.finished.notify_one();
    }

    fn on_error(&self, failure: &StreamFailure) {
        self.failures.update(|f| f.push(failure.clone()));
        self.finished.notify_one();
    }

    fn on_queue_process(&self, _chat_id: &ChatId, injection: &QueueInjection) {
        self.injections.update(|i| i.push(injection.clone()));
    }

    fn notify_complete(&self, _chat_id: &ChatId, _message_id: &MessageId) {
        self.notifications.update(|n| *n += 1);
    }
}

fn chat() -> ChatId {
    ChatId::from("c1")
}

fn client_with(backend: &Arc<MockBackend>, usage_ms: u64, context_ms: u64) -> ChatClient {
    let settings = ClientSettings {
        usage_refresh_delay: Duration::from_millis(usage_ms),
        context_refresh_delay: Duration::from_millis(context_ms),
        queue_auto_sync: false,
        ..ClientSettings::default()
    };
    ChatClient::with_backend(backend.clone(), Arc::new(MemoryCursorStore::new()), settings)
}

fn bind(client: &ChatClient, notify: bool) -> Arc<Hooks> {
    let hooks = Arc::new(Hooks::default());
    client.orchestrator.cell().refresh(UiBindings {
        chat_id: chat(),
        hooks: hooks.clone(),
        notify,
    });
    hooks
}

async fn start(client: &ChatClient, prompt: &str) -> MessageId {
    match client
        .orchestrator
        .start(StartRequest::text(prompt, "model-a"))
        .await
    {
        Ok(id) => id,
        Err(e) => panic!("start failed: {:?}", e),
    }
}

#[tokio::test]
async fn test_start_streams_into_view_and_cache() {
    let backend = MockBackend::new();
    backend.script_frames(vec![
        content_frame(1, "Hel"),
        content_frame(2, "lo"),
        complete_frame(3),
    ]);
    let client = client_with(&backend, 10, 20);
    let hooks = bind(&client, true);

    let message_id = start(&client, "Say hello").await;
    assert_eq!(message_id, MessageId::from("a1"));
    notified(&hooks.finished, "completion").await;

    let view = client.view.snapshot(&chat());
    assert_eq!(view.messages.len(), 2);
    assert_eq!(view.messages[0].role, Role::User);
    assert_eq!(view.messages[0].content, "Say hello");
    let assistant = match view.message(&message_id) {
        Some(m) => m,
        None => panic!("assistant message missing from view"),
    };
    assert_eq!(assistant.streamed_text(), "Hello");
    assert_eq!(assistant.stream_status, MessageStreamStatus::Completed);
    assert!(!view.is_streaming);
    assert!(!view.is_loading);
    assert!(view.pending_user_message_id.is_none());

    match client.cache.find(&chat(), &message_id) {
        Some(m) => {
            assert_eq!(m.streamed_text(), "Hello");
            assert_eq!(m.stream_status, MessageStreamStatus::Completed);
        }
        None => panic!("assistant message missing from cache"),
    }
    assert_eq!(hooks.chunks.snapshot().len(), 2);
    assert_eq!(hooks.notifications.snapshot(), 1);
}

#[tokio::test]
async fn test_completion_schedules_invalidations() {
    let backend = MockBackend::new();
    backend.script_frames(vec![complete_frame(1)]);
    let client = client_with(&backend, 10, 30);
    let mut invalidations = client.cache.subscribe_invalidations();
    let hooks = bind(&client, false);

    start(&client, "Hi").await;
    notified(&hooks.finished, "completion").await;

    let mut seen = Vec::new();
    while seen.len() < 2 {
        match tokio::time::timeout(Duration::from_secs(2), invalidations.recv()).await {
            Ok(Ok(key)) => seen.push(key),
            other => panic!("missing invalidation: {:?}", other.map(|r| r.is_ok())),
        }
    }
    assert_eq!(seen, vec![QueryKey::UsageStats, QueryKey::ContextUsage(chat())]);
    assert_eq!(hooks.notifications.snapshot(), 0);
}

#[tokio::test]
async fn test_teardown_cancels_scheduled_invalidations() {
    let backend = MockBackend::new();
    backend.script_frames(vec![complete_frame(1)]);
    let client = client_with(&backend, 150, 200);
    let hooks = bind(&client, false);

    start(&client, "Hi").await;
    notified(&hooks.finished, "completion").await;
    client.orchestrator.teardown();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.cache.generation(&QueryKey::UsageStats), 0);
    assert_eq!(client.cache.generation(&QueryKey::ContextUsage(chat())), 0);
}

#[tokio::test]
async fn test_stream_error_rolls_back_turn() {
    let backend = MockBackend::new();
    backend.script_frames(vec![content_frame(1, "half"), error_frame(2, "boom")]);
    let client = client_with(&backend, 10, 20);
    let hooks = bind(&client, false);

    let message_id = start(&client, "Hi").await;
    notified(&hooks.finished, "failure").await;

    let view = client.view.snapshot(&chat());
    assert!(view.messages.is_empty());
    assert!(!view.is_streaming);
    assert!(view.pending_user_message_id.is_none());
    assert!(client.cache.find(&chat(), &message_id).is_none());
    let cached = client.cache.pages(&chat()).map(|p| p[0].messages.len());
    assert_eq!(cached, Some(0));
    assert_eq!(hooks.failures.snapshot()[0].message, "boom");
}

#[tokio::test]
async fn test_start_failure_removes_optimistic_message() {
    let backend = MockBackend::new();
    backend.fail_start();
    let client = client_with(&backend, 10, 20);
    bind(&client, false);

    let result = client
        .orchestrator
        .start(StartRequest::text("Hi", "model-a"))
        .await;
    assert!(result.is_err());

    let view = client.view.snapshot(&chat());
    assert!(view.messages.is_empty());
    assert!(!view.is_loading);
    assert!(view.pending_user_message_id.is_none());
    assert!(client.registry.is_empty());
    assert!(backend.opened_with().is_empty());
}

#[tokio::test]
async fn test_start_without_bound_chat_is_rejected() {
    let backend = MockBackend::new();
    let client = client_with(&backend, 10, 20);

    match client
        .orchestrator
        .start(StartRequest::text("Hi", "model-a"))
        .await
    {
        Err(e) => assert!(matches!(e.inner, ParleyError::Validation(_))),
        Ok(id) => panic!("unexpected start {}", id),
    }
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_permission_and_context_events_skip_message_content() {
    let backend = MockBackend::new();
    let permission = serde_json::json!({
        "event": { "type": "permission_request", "tool": "bash", "request_id": "p1" }
    });
    let usage = serde_json::json!({
        "event": { "type": "system", "data": { "context_usage": { "used": 1200, "limit": 200000 }, "chat_id": "c1" } }
    });
    backend.script_frames(vec![
        parley::sse::SseFrame::new("content", permission.to_string()).with_id("1"),
        parley::sse::SseFrame::new("content", usage.to_string()).with_id("2"),
        complete_frame(3),
    ]);
    let client = client_with(&backend, 10, 20);
    let hooks = bind(&client, false);

    let message_id = start(&client, "Hi").await;
    notified(&hooks.finished, "completion").await;

    let view = client.view.snapshot(&chat());
    assert_eq!(
        view.permission_request
            .as_ref()
            .and_then(|p| p.get("tool"))
            .and_then(|t| t.as_str()),
        Some("bash")
    );
    assert_eq!(
        view.context_usage
            .as_ref()
            .and_then(|c| c.get("used"))
            .and_then(|u| u.as_u64()),
        Some(1200)
    );
    assert_eq!(view.message(&message_id).map(|m| m.events.len()), Some(0));
    assert_eq!(
        client.cache.find(&chat(), &message_id).map(|m| m.events.len()),
        Some(0)
    );
}

#[tokio::test]
async fn test_queue_injection_materializes_message_pair() {
    let backend = MockBackend::new();
    let tx = backend.script_live();
    let client = client_with(&backend, 10, 20);
    let hooks = bind(&client, false);

    let first = start(&client, "Hello").await;
    if tx
        .send(Ok(injected_frame(5, "q1", "u1", "a2", "World")))
        .await
        .is_err()
    {
        panic!("stream closed early");
    }
    eventually("injection", || hooks.injections.snapshot().len() == 1).await;

    let view = client.view.snapshot(&chat());
    let ids: Vec<&str> = view.messages.iter().map(|m| m.id.0.as_str()).collect();
    assert_eq!(ids.len(), 4);
    assert_eq!(&ids[2..], &["u1", "a2"]);
    assert_eq!(view.streaming_message_id, Some(MessageId::from("a2")));
    assert!(view.is_streaming);
    assert_eq!(
        view.message(&first).map(|m| m.stream_status),
        Some(MessageStreamStatus::Completed)
    );
    assert!(client.cache.find(&chat(), &MessageId::from("u1")).is_some());
    assert!(client.cache.find(&chat(), &MessageId::from("a2")).is_some());
    assert!(client
        .registry
        .get_by_chat_and_message(&chat(), &MessageId::from("a2"))
        .is_some());

    if tx.send(Ok(content_frame(6, "second turn"))).await.is_err() {
        panic!("stream closed early");
    }
    eventually("chunk on a2", || {
        client
            .view
            .snapshot(&chat())
            .message(&MessageId::from("a2"))
            .map(|m| m.streamed_text())
            == Some("second turn".to_string())
    })
    .await;
}

#[tokio::test]
async fn test_stop_marks_message_interrupted() {
    let backend = MockBackend::new();
    let tx = backend.script_live();
    let client = client_with(&backend, 10, 20);
    let hooks = bind(&client, false);

    let message_id = start(&client, "Write a novel").await;
    if tx.send(Ok(content_frame(1, "Once"))).await.is_err() {
        panic!("stream closed early");
    }
    eventually("first chunk", || hooks.chunks.snapshot().len() == 1).await;

    if let Err(e) = client.orchestrator.stop(&message_id).await {
        panic!("stop failed: {:?}", e);
    }
    let _ = tx.send(Ok(content_frame(2, " upon"))).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let view = client.view.snapshot(&chat());
    let msg = match view.message(&message_id) {
        Some(m) => m,
        None => panic!("stopped message should stay visible"),
    };
    assert_eq!(msg.stream_status, MessageStreamStatus::Interrupted);
    assert_eq!(msg.streamed_text(), "Once");
    assert!(!view.is_streaming);
    assert!(backend.calls().contains(&Call::Stop(chat())));
    assert!(client.registry.is_empty());
    assert_eq!(hooks.chunks.snapshot().len(), 1);
}

#[tokio::test]
async fn test_callbacks_follow_latest_bindings() {
    let backend = MockBackend::new();
    let tx = backend.script_live();
    let client = client_with(&backend, 10, 20);
    let old_hooks = bind(&client, false);

    start(&client, "Hi").await;
    if tx.send(Ok(content_frame(1, "a"))).await.is_err() {
        panic!("stream closed early");
    }
    eventually("chunk to old hooks", || old_hooks.chunks.snapshot().len() == 1).await;

    // A re-render hands over new hooks; the connection is untouched
    let new_hooks = bind(&client, false);
    if tx.send(Ok(content_frame(2, "b"))).await.is_err() {
        panic!("stream closed early");
    }
    eventually("chunk to new hooks", || new_hooks.chunks.snapshot().len() == 1).await;

    assert_eq!(old_hooks.chunks.snapshot().len(), 1);
    assert_eq!(backend.opened_with().len(), 1);
    assert_eq!(client.registry.len(), 1);
}

#[tokio::test]
async fn test_replay_does_not_duplicate_applied_events() {
    let backend = MockBackend::new();
    let script = || vec![content_frame(1, "x"), content_frame(2, "y"), complete_frame(3)];
    backend.script_frames(script());
    backend.script_frames(script());
    let client = client_with(&backend, 10, 20);
    let hooks = bind(&client, false);

    let message_id = start(&client, "Hi").await;
    notified(&hooks.finished, "first completion").await;

    match client.orchestrator.replay(&message_id).await {
        Ok(id) => assert_eq!(id, message_id),
        Err(e) => panic!("replay failed: {:?}", e),
    }
    notified(&hooks.finished, "replay completion").await;

    let view = client.view.snapshot(&chat());
    assert_eq!(view.message(&message_id).map(|m| m.streamed_text()), Some("xy".to_string()));
    assert_eq!(
        client.cache.find(&chat(), &message_id).map(|m| m.streamed_text()),
        Some("xy".to_string())
    );
}

#[tokio::test]
async fn test_attach_picks_up_running_generation() {
    let backend = MockBackend::new();
    backend.set_status(StreamStatus {
        has_active_task: true,
        message_id: Some(MessageId::from("a9")),
        last_event_id: None,
    });
    backend.script_frames(vec![content_frame(1, "resumed"), complete_frame(2)]);
    let client = client_with(&backend, 10, 20);
    let hooks = bind(&client, false);

    match client.orchestrator.attach().await {
        Ok(Some(id)) => assert_eq!(id, MessageId::from("a9")),
        other => panic!("expected attachment, got {:?}", other.map_err(|e| e.to_string())),
    }
    notified(&hooks.finished, "completion").await;

    let view = client.view.snapshot(&chat());
    assert_eq!(
        view.message(&MessageId::from("a9")).map(|m| m.streamed_text()),
        Some("resumed".to_string())
    );
}

#[tokio::test]
async fn test_shutdown_closes_live_sessions() {
    let backend = MockBackend::new();
    let _tx = backend.script_live();
    let client = client_with(&backend, 10, 20);
    bind(&client, false);

    start(&client, "Hi").await;
    assert_eq!(client.registry.len(), 1);
    client.shutdown();
    assert!(client.registry.is_empty());
}

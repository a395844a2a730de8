use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use parley::backend::{ChatBackend, HttpBackend};
use parley::store::Store;
use parley::*;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Captured {
    cursors: Store<Vec<Option<String>>>,
    enqueue_bodies: Store<Vec<String>>,
    status_hits: Store<u32>,
    authorization: Store<Option<String>>,
}

type Shared = Arc<Captured>;

async fn stream(State(cap): State<Shared>, headers: HeaderMap) -> impl IntoResponse {
    let cursor = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    cap.cursors.update(|c| c.push(cursor));
    cap.authorization.replace(
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );
    let body = concat!(
        ": keep-alive\n\n",
        "id: 7\n",
        "event: content\n",
        "data: {\"event\":{\"type\":\"assistant_text\",\"text\":\"hi\"}}\n\n",
        "id: 8\r\n",
        "event: complete\r\n",
        "data: {\"status\":\"done\"}\r\n\r\n",
    );
    ([("content-type", "text/event-stream")], body)
}

async fn status(State(cap): State<Shared>, Path(chat): Path<String>) -> impl IntoResponse {
    cap.status_hits.update(|n| *n += 1);
    if chat == "flaky" {
        return (StatusCode::INTERNAL_SERVER_ERROR, "overloaded").into_response();
    }
    Json(serde_json::json!({
        "has_active_task": true,
        "message_id": "a7",
        "last_event_id": "12"
    }))
    .into_response()
}

async fn enqueue(State(cap): State<Shared>, body: Bytes) -> impl IntoResponse {
    cap.enqueue_bodies
        .update(|b| b.push(String::from_utf8_lossy(&body).into_owned()));
    Json(serde_json::json!({
        "id": "q9",
        "created": true,
        "content": "look at this",
        "attachments": [{ "file_url": "/files/notes.txt", "file_type": "text/plain", "filename": "notes.txt" }]
    }))
}

async fn fetch_queue(Path(chat): Path<String>) -> impl IntoResponse {
    if chat == "busy" {
        return Json(serde_json::json!({
            "id": "q3",
            "content": "later",
            "model_id": "model-a",
            "permission_mode": "plan",
            "queued_at": "2026-01-02T03:04:05Z"
        }))
        .into_response();
    }
    Json(serde_json::Value::Null).into_response()
}

async fn missing() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn start(body: Bytes) -> impl IntoResponse {
    let text = String::from_utf8_lossy(&body);
    if !text.contains("name=\"prompt\"") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    Json(serde_json::json!({ "chat_id": "c1", "message_id": "a1" })).into_response()
}

async fn serve() -> (String, Shared) {
    let cap: Shared = Arc::new(Captured::default());
    let app = Router::new()
        .route("/api/v1/chat", post(start))
        .route("/api/v1/chats/:id/stream", get(stream).delete(missing))
        .route("/api/v1/chats/:id/status", get(status))
        .route(
            "/api/v1/chats/:id/queue",
            get(fetch_queue).post(enqueue).delete(missing),
        )
        .with_state(cap.clone());

    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(l) => l,
        Err(e) => panic!("bind failed: {}", e),
    };
    let addr = match listener.local_addr() {
        Ok(a) => a,
        Err(e) => panic!("no local addr: {}", e),
    };
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{}/api/v1", addr), cap)
}

fn backend(base_url: String) -> HttpBackend {
    let settings = ClientSettings {
        base_url,
        token: Some("secret".to_string()),
        max_retries: 3,
        retry_base_delay_ms: 1,
        request_timeout: Duration::from_secs(5),
        ..ClientSettings::default()
    };
    match HttpBackend::new(&settings) {
        Ok(b) => b,
        Err(e) => panic!("client build failed: {}", e),
    }
}

#[tokio::test]
async fn test_stream_sends_cursor_and_decodes_frames() {
    let (url, cap) = serve().await;
    let backend = backend(url);

    let stream = match backend
        .open_stream(ChatId::from("c1"), Some("6".to_string()))
        .await
    {
        Ok(s) => s,
        Err(e) => panic!("open failed: {}", e),
    };
    let frames: Vec<_> = stream.collect().await;
    let frames: Vec<_> = frames
        .into_iter()
        .map(|f| match f {
            Ok(frame) => frame,
            Err(e) => panic!("frame error: {}", e),
        })
        .collect();

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].id.as_deref(), Some("7"));
    assert_eq!(frames[0].event, "content");
    assert!(frames[0].data.contains("assistant_text"));
    assert_eq!(frames[1].event, "complete");
    assert_eq!(frames[1].data, "{\"status\":\"done\"}");

    assert_eq!(cap.cursors.snapshot(), vec![Some("6".to_string())]);
    assert_eq!(cap.authorization.snapshot().as_deref(), Some("Bearer secret"));
}

#[tokio::test]
async fn test_fresh_stream_omits_cursor_header() {
    let (url, cap) = serve().await;
    let backend = backend(url);

    if let Err(e) = backend.open_stream(ChatId::from("c1"), None).await {
        panic!("open failed: {}", e);
    }
    assert_eq!(cap.cursors.snapshot(), vec![None]);
}

#[tokio::test]
async fn test_status_decodes_json() {
    let (url, _cap) = serve().await;
    let backend = backend(url);

    match backend.stream_status(ChatId::from("c1")).await {
        Ok(status) => {
            assert!(status.has_active_task);
            assert_eq!(status.message_id, Some(MessageId::from("a7")));
            assert_eq!(status.last_event_id.as_deref(), Some("12"));
        }
        Err(e) => panic!("status failed: {}", e),
    }
}

#[tokio::test]
async fn test_server_errors_are_retried_then_surfaced() {
    let (url, cap) = serve().await;
    let backend = backend(url);

    match backend.stream_status(ChatId::from("flaky")).await {
        Err(e) => match &e.inner {
            ParleyError::Upstream(status, body) => {
                assert_eq!(*status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "overloaded");
                assert!(e.is_transient());
            }
            other => panic!("unexpected error: {:?}", other),
        },
        Ok(s) => panic!("unexpected status: {:?}", s),
    }
    assert_eq!(cap.status_hits.snapshot(), 3);
}

#[tokio::test]
async fn test_enqueue_uploads_multipart_form() {
    let (url, cap) = serve().await;
    let backend = backend(url);

    let upload = QueueUpload {
        content: "look at this".to_string(),
        model_id: "model-a".to_string(),
        permission_mode: PermissionMode::Plan,
        thinking_mode: Some("deep".to_string()),
        files: vec![AttachedFile {
            filename: "notes.txt".to_string(),
            mime_type: "text/plain".to_string(),
            data: bytes::Bytes::from_static(b"remember the milk"),
        }],
    };
    let response = match backend.enqueue(ChatId::from("c1"), upload).await {
        Ok(r) => r,
        Err(e) => panic!("enqueue failed: {}", e),
    };
    assert_eq!(response.id, QueueEntryId::from("q9"));
    assert!(response.created);
    assert_eq!(response.attachments.map(|a| a.len()), Some(1));

    let bodies = cap.enqueue_bodies.snapshot();
    assert_eq!(bodies.len(), 1);
    let body = &bodies[0];
    assert!(body.contains("name=\"content\""));
    assert!(body.contains("look at this"));
    assert!(body.contains("name=\"permission_mode\""));
    assert!(body.contains("plan"));
    assert!(body.contains("name=\"thinking_mode\""));
    assert!(body.contains("filename=\"notes.txt\""));
    assert!(body.contains("remember the milk"));
}

#[tokio::test]
async fn test_fetch_queue_handles_empty_and_present() {
    let (url, _cap) = serve().await;
    let backend = backend(url);

    match backend.fetch_queue(ChatId::from("c1")).await {
        Ok(entry) => assert!(entry.is_none()),
        Err(e) => panic!("fetch failed: {}", e),
    }
    match backend.fetch_queue(ChatId::from("busy")).await {
        Ok(Some(entry)) => {
            assert_eq!(entry.id, QueueEntryId::from("q3"));
            assert_eq!(entry.permission_mode, PermissionMode::Plan);
            assert!(entry.attachments.is_none());
        }
        other => panic!("expected an entry, got {:?}", other.map_err(|e| e.to_string())),
    }
}

#[tokio::test]
async fn test_deletes_treat_missing_as_done() {
    let (url, _cap) = serve().await;
    let backend = backend(url);

    if let Err(e) = backend.clear_queue(ChatId::from("c1")).await {
        panic!("clear failed: {}", e);
    }
    if let Err(e) = backend.stop_stream(ChatId::from("c1")).await {
        panic!("stop failed: {}", e);
    }
}

#[tokio::test]
async fn test_start_chat_posts_prompt() {
    let (url, _cap) = serve().await;
    let backend = backend(url);

    let request = ChatRequest {
        chat_id: ChatId::from("c1"),
        prompt: "hello".to_string(),
        model_id: "model-a".to_string(),
        permission_mode: PermissionMode::Auto,
        thinking_mode: None,
        attached_files: Vec::new(),
    };
    match backend.start_chat(request).await {
        Ok(r) => assert_eq!(r.message_id, MessageId::from("a1")),
        Err(e) => panic!("start failed: {}", e),
    }
}

#[tokio::test]
async fn test_unreachable_server_is_a_transport_failure() {
    let listener = match std::net::TcpListener::bind("127.0.0.1:0") {
        Ok(l) => l,
        Err(e) => panic!("bind failed: {}", e),
    };
    let addr = match listener.local_addr() {
        Ok(a) => a,
        Err(e) => panic!("no local addr: {}", e),
    };
    drop(listener);
    let backend = backend(format!("http://{}/api/v1", addr));

    match backend.open_stream(ChatId::from("c1"), None).await {
        Err(e) => {
            assert!(matches!(e.inner, ParleyError::Transport(_)));
            assert!(e.is_transient());
        }
        Ok(_) => panic!("stream opened against a closed port"),
    }
}

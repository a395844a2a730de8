use crate::config::ClientSettings;
use crate::constants::{LAST_EVENT_ID_HEADER, MAX_SSE_LINE_BYTES};
use crate::hardening::RetryPolicy;
use crate::sse::{SseDecoder, SseFrame};
use crate::types::*;
use bytes::Bytes;
use futures_util::future::{self, BoxFuture};
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

pub type FrameStream = BoxStream<'static, Result<SseFrame>>;

/// Everything the coordination core needs from the chat server.
pub trait ChatBackend: Send + Sync {
    /// Starts a generation; returns the assistant message id it will stream into.
    fn start_chat(&self, request: ChatRequest) -> BoxFuture<'_, Result<StartResponse>>;

    /// Opens the chat's event stream, resuming after `last_event_id` when given.
    fn open_stream(
        &self,
        chat_id: ChatId,
        last_event_id: Option<String>,
    ) -> BoxFuture<'_, Result<FrameStream>>;

    fn stream_status(&self, chat_id: ChatId) -> BoxFuture<'_, Result<StreamStatus>>;

    fn stop_stream(&self, chat_id: ChatId) -> BoxFuture<'_, Result<()>>;

    /// Server-side upsert: appends to an existing entry or creates one.
    fn enqueue(
        &self,
        chat_id: ChatId,
        upload: QueueUpload,
    ) -> BoxFuture<'_, Result<QueueUpsertResponse>>;

    fn fetch_queue(&self, chat_id: ChatId) -> BoxFuture<'_, Result<Option<ServerQueuedMessage>>>;

    fn update_queue(
        &self,
        chat_id: ChatId,
        content: String,
    ) -> BoxFuture<'_, Result<ServerQueuedMessage>>;

    fn clear_queue(&self, chat_id: ChatId) -> BoxFuture<'_, Result<()>>;
}

/// Decodes a raw event-stream body into frames.
pub fn frame_stream<S>(body: S) -> FrameStream
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let reader = StreamReader::new(Box::pin(body.map(|chunk| chunk.map_err(std::io::Error::other))));
    FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_SSE_LINE_BYTES))
        .scan(SseDecoder::default(), |decoder, line| {
            let out: Option<Result<SseFrame>> = match line {
                Ok(line) => decoder.push_line(&line).map(Ok),
                Err(e) => Some(Err(ParleyError::Transport(format!(
                    "event stream read failed: {}",
                    e
                ))
                .into())),
            };
            future::ready(Some(out))
        })
        .filter_map(future::ready)
        .boxed()
}

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    request_timeout: Duration,
    retry: RetryPolicy,
}

impl HttpBackend {
    pub fn new(settings: &ClientSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
            request_timeout: settings.request_timeout,
            retry: RetryPolicy::new(settings.max_retries.max(1), settings.retry_base_delay_ms),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.retry
            .execute_with_retry(move || async move {
                let resp = self
                    .authorized(self.client.get(url))
                    .timeout(self.request_timeout)
                    .send()
                    .await?;
                let resp = ensure_success(resp).await?;
                Ok(resp.json::<T>().await?)
            })
            .await
    }

    async fn delete(&self, url: &str, missing_ok: bool) -> Result<()> {
        self.retry
            .execute_with_retry(move || async move {
                let resp = self
                    .authorized(self.client.delete(url))
                    .timeout(self.request_timeout)
                    .send()
                    .await?;
                if missing_ok && resp.status() == reqwest::StatusCode::NOT_FOUND {
                    return Ok(());
                }
                ensure_success(resp).await?;
                Ok(())
            })
            .await
    }
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = match resp.text().await {
        Ok(b) => b,
        Err(_) => String::new(),
    };
    Err(ParleyError::Upstream(status, body).into())
}

fn upload_form(fields: Vec<(&'static str, String)>, files: &[AttachedFile]) -> Result<Form> {
    let mut form = Form::new();
    for (name, value) in fields {
        form = form.text(name, value);
    }
    for file in files {
        let part = Part::bytes(file.data.to_vec())
            .file_name(file.filename.clone())
            .mime_str(&file.mime_type)?;
        form = form.part("attached_files", part);
    }
    Ok(form)
}

impl ChatBackend for HttpBackend {
    fn start_chat(&self, request: ChatRequest) -> BoxFuture<'_, Result<StartResponse>> {
        Box::pin(async move {
            let mut fields = vec![
                ("prompt", request.prompt),
                ("chat_id", request.chat_id.0.clone()),
                ("model_id", request.model_id),
                ("permission_mode", request.permission_mode.as_str().to_string()),
            ];
            if let Some(thinking) = request.thinking_mode {
                fields.push(("thinking_mode", thinking));
            }
            let form = upload_form(fields, &request.attached_files)?;
            let resp = self
                .authorized(self.client.post(self.url("/chat")))
                .timeout(self.request_timeout)
                .multipart(form)
                .send()
                .await?;
            let resp = ensure_success(resp).await?;
            Ok(resp.json::<StartResponse>().await?)
        })
    }

    fn open_stream(
        &self,
        chat_id: ChatId,
        last_event_id: Option<String>,
    ) -> BoxFuture<'_, Result<FrameStream>> {
        Box::pin(async move {
            let url = self.url(&format!("/chats/{}/stream", chat_id));
            let mut builder = self
                .authorized(self.client.get(&url))
                .header(reqwest::header::ACCEPT, "text/event-stream");
            if let Some(cursor) = &last_event_id {
                builder = builder.header(LAST_EVENT_ID_HEADER, cursor.as_str());
            }
            let resp = match builder.send().await {
                Ok(r) => r,
                Err(e) => {
                    return Err(ParleyError::Transport(format!("failed to open stream: {}", e)).into())
                }
            };
            let resp = ensure_success(resp).await?;
            tracing::debug!(
                "[STREAM] Opened event stream for chat {} (cursor: {:?})",
                chat_id.short(),
                last_event_id
            );
            Ok(frame_stream(resp.bytes_stream()))
        })
    }

    fn stream_status(&self, chat_id: ChatId) -> BoxFuture<'_, Result<StreamStatus>> {
        Box::pin(async move {
            let url = self.url(&format!("/chats/{}/status", chat_id));
            self.get_json::<StreamStatus>(&url).await
        })
    }

    fn stop_stream(&self, chat_id: ChatId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let url = self.url(&format!("/chats/{}/stream", chat_id));
            self.delete(&url, true).await
        })
    }

    fn enqueue(
        &self,
        chat_id: ChatId,
        upload: QueueUpload,
    ) -> BoxFuture<'_, Result<QueueUpsertResponse>> {
        Box::pin(async move {
            let mut fields = vec![
                ("content", upload.content),
                ("model_id", upload.model_id),
                ("permission_mode", upload.permission_mode.as_str().to_string()),
            ];
            if let Some(thinking) = upload.thinking_mode {
                fields.push(("thinking_mode", thinking));
            }
            let form = upload_form(fields, &upload.files)?;
            let resp = self
                .authorized(self.client.post(self.url(&format!("/chats/{}/queue", chat_id))))
                .timeout(self.request_timeout)
                .multipart(form)
                .send()
                .await?;
            let resp = ensure_success(resp).await?;
            Ok(resp.json::<QueueUpsertResponse>().await?)
        })
    }

    fn fetch_queue(&self, chat_id: ChatId) -> BoxFuture<'_, Result<Option<ServerQueuedMessage>>> {
        Box::pin(async move {
            let url = self.url(&format!("/chats/{}/queue", chat_id));
            self.get_json::<Option<ServerQueuedMessage>>(&url).await
        })
    }

    fn update_queue(
        &self,
        chat_id: ChatId,
        content: String,
    ) -> BoxFuture<'_, Result<ServerQueuedMessage>> {
        Box::pin(async move {
            let resp = self
                .authorized(self.client.patch(self.url(&format!("/chats/{}/queue", chat_id))))
                .timeout(self.request_timeout)
                .json(&serde_json::json!({ "content": content }))
                .send()
                .await?;
            let resp = ensure_success(resp).await?;
            Ok(resp.json::<ServerQueuedMessage>().await?)
        })
    }

    fn clear_queue(&self, chat_id: ChatId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let url = self.url(&format!("/chats/{}/queue", chat_id));
            self.delete(&url, true).await
        })
    }
}

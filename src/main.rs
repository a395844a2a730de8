#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]
use parley::config::{Command, QueueAction};
use parley::logging::{init_tracing, setup_panic_hook};
use parley::orchestrator::{StartRequest, UiBindings, UiHooks};
use parley::queue::{EnqueueRequest, QueueEvent};
use parley::registry::{StreamChunk, StreamCompletion, StreamFailure};
use parley::*;

use clap::Parser;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

enum Outcome {
    Completed(Option<String>),
    Failed(String),
}

/// Prints assistant text as it streams and reports how the generation ended.
struct StdoutHooks {
    tx: mpsc::UnboundedSender<Outcome>,
}

impl UiHooks for StdoutHooks {
    fn on_chunk(&self, chunk: &StreamChunk) {
        if chunk.event.get("type").and_then(|t| t.as_str()) != Some("assistant_text") {
            return;
        }
        if let Some(text) = chunk.event.get("text").and_then(|t| t.as_str()) {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(text.as_bytes());
            let _ = out.flush();
        }
    }

    fn on_complete(&self, done: &StreamCompletion) {
        let _ = self.tx.send(Outcome::Completed(done.status.clone()));
    }

    fn on_error(&self, failure: &StreamFailure) {
        let _ = self.tx.send(Outcome::Failed(failure.message.clone()));
    }

    fn on_queue_process(&self, _chat_id: &ChatId, injection: &QueueInjection) {
        println!("\n--- queued message started: {} ---", injection.content);
    }

    fn notify_complete(&self, _chat_id: &ChatId, _message_id: &MessageId) {
        eprint!("\x07");
    }
}

fn bind(client: &ChatClient, chat: &str) -> mpsc::UnboundedReceiver<Outcome> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.orchestrator.cell().refresh(UiBindings {
        chat_id: ChatId::from(chat),
        hooks: Arc::new(StdoutHooks { tx }),
        notify: true,
    });
    rx
}

async fn wait_for_outcome(rx: &mut mpsc::UnboundedReceiver<Outcome>) -> Result<()> {
    match rx.recv().await {
        Some(Outcome::Completed(status)) => {
            println!();
            if let Some(status) = status {
                println!("[{}]", status);
            }
            Ok(())
        }
        Some(Outcome::Failed(message)) => {
            println!();
            Err(ParleyError::Processing(message).into())
        }
        None => Err(ParleyError::Internal(
            "stream callbacks dropped".to_string(),
            tracing_error::SpanTrace::capture(),
        )
        .into()),
    }
}

fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("json") => "application/json",
        Some("txt") | Some("md") | Some("rs") | Some("py") | Some("ts") => "text/plain",
        _ => "application/octet-stream",
    }
}

async fn load_files(paths: &[PathBuf]) -> Result<Vec<AttachedFile>> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let data = tokio::fs::read(path).await?;
        let filename = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => path.display().to_string(),
        };
        files.push(AttachedFile {
            filename,
            mime_type: guess_mime(path).to_string(),
            data: bytes::Bytes::from(data),
        });
    }
    Ok(files)
}

fn print_queue(entry: Option<&parley::queue::QueuedMessage>) {
    match entry {
        Some(e) => {
            println!("id:       {}", e.id);
            println!("model:    {}", e.model_id);
            println!("mode:     {}", e.permission_mode.as_str());
            println!("synced:   {}", e.synced);
            println!("queued:   {}", e.queued_at.to_rfc3339());
            let attachments = e.server_attachments.as_ref().map(Vec::len).unwrap_or(0);
            println!("files:    {} local, {} on server", e.attached_files.len(), attachments);
            println!("{}", e.content);
        }
        None => println!("(queue empty)"),
    }
}

async fn wait_for_sync(
    events: &mut tokio::sync::broadcast::Receiver<QueueEvent>,
    chat_id: &ChatId,
) -> Result<()> {
    loop {
        match events.recv().await {
            Ok(QueueEvent::Synced { chat_id: c, id }) if &c == chat_id => {
                println!("queued as {}", id);
                return Ok(());
            }
            Ok(QueueEvent::SyncDeferred { chat_id: c, reason })
            | Ok(QueueEvent::Rejected { chat_id: c, reason })
                if &c == chat_id =>
            {
                return Err(ParleyError::SyncFailure(reason).into());
            }
            Ok(_) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

async fn run_queue(client: &ChatClient, chat_id: ChatId, action: QueueAction) -> Result<()> {
    match action {
        QueueAction::Add {
            model,
            mode,
            files,
            content,
        } => {
            let mut events = client.queue.subscribe();
            let request = EnqueueRequest {
                content,
                model_id: model,
                permission_mode: mode,
                thinking_mode: None,
                files: load_files(&files).await?,
            };
            let id = client.queue.enqueue(&chat_id, request)?;
            tracing::debug!("Enqueued {} locally", id);
            if client.queue.sync_pending_messages(&chat_id, None).await? {
                if let Some(entry) = client.queue.get(&chat_id) {
                    println!("queued as {}", entry.id);
                }
                Ok(())
            } else {
                wait_for_sync(&mut events, &chat_id).await
            }
        }
        QueueAction::Show => {
            let entry = client.queue.fetch_queue(&chat_id).await?;
            print_queue(entry.as_ref());
            Ok(())
        }
        QueueAction::Edit { content } => {
            client.queue.fetch_queue(&chat_id).await?;
            client.queue.update(&chat_id, &content).await?;
            print_queue(client.queue.get(&chat_id).as_ref());
            Ok(())
        }
        QueueAction::Clear => {
            client.queue.fetch_queue(&chat_id).await?;
            match client.queue.clear_and_sync(&chat_id).await {
                Some(entry) => println!("cleared {}", entry.id),
                None => println!("(queue empty)"),
            }
            Ok(())
        }
        QueueAction::Sync { model } => {
            client
                .queue
                .sync_pending_messages(&chat_id, model.as_deref())
                .await?;
            print_queue(client.queue.get(&chat_id).as_ref());
            Ok(())
        }
    }
}

async fn run(client: &ChatClient, command: Command) -> Result<()> {
    match command {
        Command::Send {
            chat,
            model,
            mode,
            thinking,
            files,
            prompt,
        } => {
            let mut outcome = bind(client, &chat);
            let request = StartRequest {
                prompt,
                model_id: model,
                permission_mode: mode,
                thinking_mode: thinking,
                attached_files: load_files(&files).await?,
            };
            let message_id = client.orchestrator.start(request).await?;
            tracing::info!("Streaming reply {}", message_id.short());
            wait_for_outcome(&mut outcome).await
        }
        Command::Attach { chat } => {
            let mut outcome = bind(client, &chat);
            match client.orchestrator.attach().await? {
                Some(message_id) => {
                    tracing::info!("Attached to {}", message_id.short());
                    wait_for_outcome(&mut outcome).await
                }
                None => {
                    println!("No active generation for chat {}", chat);
                    Ok(())
                }
            }
        }
        Command::Replay { chat, message } => {
            let mut outcome = bind(client, &chat);
            client
                .orchestrator
                .replay(&MessageId::from(message))
                .await?;
            wait_for_outcome(&mut outcome).await
        }
        Command::Stop { chat, message } => {
            let _outcome = bind(client, &chat);
            client.orchestrator.stop(&MessageId::from(message)).await
        }
        Command::Queue { chat, action } => run_queue(client, ChatId::from(chat), action).await,
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let guard = match init_tracing(&args.log_dir, args.max_log_files) {
        Ok(g) => Some(g),
        Err(e) => {
            eprintln!("Logging disabled: {}", e);
            None
        }
    };
    setup_panic_hook();

    let client = match ChatClient::connect(&args).await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to initialise client: {}", e);
            eprintln!("Failed to initialise client: {}", e);
            drop(guard);
            std::process::exit(1);
        }
    };

    let code = match run(&client, args.command.clone()).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("Command failed: {}\n{}", e, e.span_trace);
            eprintln!("Error: {}", e);
            1
        }
    };

    client.shutdown();
    drop(guard);
    std::process::exit(code);
}

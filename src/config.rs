use crate::constants::{CONTEXT_USAGE_REFRESH_DELAY_MS, USAGE_REFRESH_DELAY_MS};
use crate::types::PermissionMode;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, env = "PARLEY_BASE_URL", default_value = "http://127.0.0.1:8080/api/v1")]
    pub base_url: String,
    #[arg(long, env = "PARLEY_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
    #[arg(long, env = "PARLEY_DATABASE", default_value = "parley.db")]
    pub database: String,
    /// Keep resume cursors in memory instead of SQLite
    #[arg(long, default_value_t = false)]
    pub memory_cursors: bool,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 30)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,
    #[arg(long, default_value_t = 250)]
    pub retry_base_delay_ms: u64,
    #[arg(long, default_value_t = USAGE_REFRESH_DELAY_MS)]
    pub usage_refresh_delay_ms: u64,
    #[arg(long, default_value_t = CONTEXT_USAGE_REFRESH_DELAY_MS)]
    pub context_refresh_delay_ms: u64,
    /// Sync queued messages in the background as soon as they are enqueued
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub queue_auto_sync: bool,
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
    #[arg(long, default_value_t = 7)]
    pub max_log_files: usize,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Send a prompt and stream the reply
    Send {
        #[arg(long)]
        chat: String,
        #[arg(long)]
        model: String,
        #[arg(long, default_value = "auto")]
        mode: PermissionMode,
        #[arg(long)]
        thinking: Option<String>,
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        prompt: String,
    },
    /// Reattach to the chat's running generation, resuming from the stored cursor
    Attach {
        #[arg(long)]
        chat: String,
    },
    /// Re-stream a message from the start of its event history
    Replay {
        #[arg(long)]
        chat: String,
        message: String,
    },
    /// Ask the server to stop the chat's generation
    Stop {
        #[arg(long)]
        chat: String,
        message: String,
    },
    /// Inspect or edit the chat's pending message
    Queue {
        #[arg(long)]
        chat: String,
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum QueueAction {
    Add {
        #[arg(long)]
        model: String,
        #[arg(long, default_value = "auto")]
        mode: PermissionMode,
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        content: String,
    },
    Show,
    Edit {
        content: String,
    },
    Clear,
    /// Push the pending message to the server now
    Sync {
        #[arg(long)]
        model: Option<String>,
    },
}

/// Runtime settings consumed by the library.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub token: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub usage_refresh_delay: Duration,
    pub context_refresh_delay: Duration,
    pub queue_auto_sync: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api/v1".to_string(),
            token: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay_ms: 250,
            usage_refresh_delay: Duration::from_millis(USAGE_REFRESH_DELAY_MS),
            context_refresh_delay: Duration::from_millis(CONTEXT_USAGE_REFRESH_DELAY_MS),
            queue_auto_sync: true,
        }
    }
}

impl From<&Args> for ClientSettings {
    fn from(args: &Args) -> Self {
        Self {
            base_url: args.base_url.clone(),
            token: args.token.clone(),
            connect_timeout: Duration::from_secs(args.connect_timeout_secs),
            request_timeout: Duration::from_secs(args.request_timeout_secs),
            max_retries: args.max_retries,
            retry_base_delay_ms: args.retry_base_delay_ms,
            usage_refresh_delay: Duration::from_millis(args.usage_refresh_delay_ms),
            context_refresh_delay: Duration::from_millis(args.context_refresh_delay_ms),
            queue_auto_sync: args.queue_auto_sync,
        }
    }
}

#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod app;
pub mod backend;
pub mod cache;
pub mod config;
pub mod constants;
pub mod cursor;
pub mod db;
pub mod hardening;
pub mod logging;
pub mod orchestrator;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod sse;
pub mod store;
pub mod str_utils;
pub mod types;
pub mod view;

pub use types::*;

pub use app::ChatClient;
pub use config::{Args, ClientSettings};

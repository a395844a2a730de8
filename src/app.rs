use crate::backend::{ChatBackend, HttpBackend};
use crate::cache::MessageCache;
use crate::config::{Args, ClientSettings};
use crate::constants::CURSOR_RETENTION_DAYS;
use crate::cursor::{CursorStore, MemoryCursorStore, SqliteCursorStore};
use crate::db::{cleanup_stale_cursors, init_db, DbPool};
use crate::orchestrator::StreamOrchestrator;
use crate::protocol::{StreamAdapter, SuppressionSet};
use crate::queue::QueueCoordinator;
use crate::registry::SessionRegistry;
use crate::types::Result;
use crate::view::ChatViewStore;
use std::sync::Arc;

/// Every coordination service, wired once per process (or per test).
pub struct ChatClient {
    pub settings: ClientSettings,
    pub backend: Arc<dyn ChatBackend>,
    pub cursors: Arc<dyn CursorStore>,
    pub registry: Arc<SessionRegistry>,
    pub queue: Arc<QueueCoordinator>,
    pub adapter: Arc<StreamAdapter>,
    pub cache: Arc<MessageCache>,
    pub view: Arc<ChatViewStore>,
    pub orchestrator: Arc<StreamOrchestrator>,
    pub db: Option<DbPool>,
}

impl ChatClient {
    pub async fn connect(args: &Args) -> Result<Self> {
        let settings = ClientSettings::from(args);
        let backend: Arc<dyn ChatBackend> = Arc::new(HttpBackend::new(&settings)?);

        if args.memory_cursors {
            return Ok(Self::with_backend(
                backend,
                Arc::new(MemoryCursorStore::new()),
                settings,
            ));
        }

        let pool = init_db(&args.database).await?;
        if let Err(e) = cleanup_stale_cursors(&pool, CURSOR_RETENTION_DAYS).await {
            tracing::warn!("Cursor cleanup failed: {}", e);
        }
        let cursors = Arc::new(SqliteCursorStore::new(pool.clone()));
        let mut client = Self::with_backend(backend, cursors, settings);
        client.db = Some(pool);
        Ok(client)
    }

    pub fn with_backend(
        backend: Arc<dyn ChatBackend>,
        cursors: Arc<dyn CursorStore>,
        settings: ClientSettings,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let queue = Arc::new(QueueCoordinator::new(
            Arc::clone(&backend),
            settings.queue_auto_sync,
        ));
        let adapter = Arc::new(StreamAdapter::new(
            Arc::clone(&backend),
            Arc::clone(&registry),
            Arc::clone(&cursors),
            Arc::clone(&queue),
            Arc::new(SuppressionSet::new()),
        ));
        let cache = Arc::new(MessageCache::new());
        let view = Arc::new(ChatViewStore::new());
        let orchestrator = Arc::new(StreamOrchestrator::new(
            Arc::clone(&backend),
            Arc::clone(&adapter),
            Arc::clone(&cache),
            Arc::clone(&view),
            settings.usage_refresh_delay,
            settings.context_refresh_delay,
        ));

        Self {
            settings,
            backend,
            cursors,
            registry,
            queue,
            adapter,
            cache,
            view,
            orchestrator,
            db: None,
        }
    }

    /// Stops background work and closes every live session.
    pub fn shutdown(&self) {
        self.orchestrator.teardown();
        let retired = self.registry.abort_all();
        tracing::info!("Client shut down ({} sessions closed)", retired.len());
    }
}

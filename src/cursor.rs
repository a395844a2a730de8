use crate::db::DbPool;
use crate::store::Store;
use crate::types::{ChatId, Result};
use futures_util::future::BoxFuture;
use sqlx::Row;
use std::collections::HashMap;

/// Per-chat resume cursor: the id of the last event observed on the chat's stream.
pub trait CursorStore: Send + Sync {
    fn load(&self, chat_id: ChatId) -> BoxFuture<'_, Result<Option<String>>>;
    fn record(&self, chat_id: ChatId, event_id: String) -> BoxFuture<'_, Result<()>>;
    fn clear(&self, chat_id: ChatId) -> BoxFuture<'_, Result<()>>;
}

#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: Store<HashMap<ChatId, String>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, chat_id: &ChatId) -> Option<String> {
        self.cursors.read(|c| c.get(chat_id).cloned())
    }
}

impl CursorStore for MemoryCursorStore {
    fn load(&self, chat_id: ChatId) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move { Ok(self.get(&chat_id)) })
    }

    fn record(&self, chat_id: ChatId, event_id: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.cursors.update(|c| {
                c.insert(chat_id, event_id);
            });
            Ok(())
        })
    }

    fn clear(&self, chat_id: ChatId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.cursors.update(|c| {
                c.remove(&chat_id);
            });
            Ok(())
        })
    }
}

/// Cursors persisted in SQLite so a restarted client can resume where it left off.
pub struct SqliteCursorStore {
    pool: DbPool,
}

impl SqliteCursorStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl CursorStore for SqliteCursorStore {
    fn load(&self, chat_id: ChatId) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT last_event_id FROM stream_cursors WHERE chat_id = ?")
                .bind(&chat_id.0)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.map(|r| r.get::<String, _>(0)))
        })
    }

    fn record(&self, chat_id: ChatId, event_id: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO stream_cursors (chat_id, last_event_id, updated_at)
                 VALUES (?, ?, datetime('now'))
                 ON CONFLICT(chat_id) DO UPDATE SET
                    last_event_id = excluded.last_event_id,
                    updated_at = excluded.updated_at",
            )
            .bind(&chat_id.0)
            .bind(&event_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn clear(&self, chat_id: ChatId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM stream_cursors WHERE chat_id = ?")
                .bind(&chat_id.0)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }
}

use crate::constants::DB_PRAGMAS;
use crate::types::{ParleyError, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;

pub type DbPool = SqlitePool;

const CREATE_CURSOR_TABLE: &str = "CREATE TABLE IF NOT EXISTS stream_cursors (
    chat_id TEXT PRIMARY KEY,
    last_event_id TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(ParleyError::Internal(
                "Invalid database path: Path contains non-UTF8 characters".to_string(),
                tracing_error::SpanTrace::capture(),
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let pool = SqlitePool::connect(&url).await?;
    configure_db(&pool).await?;
    sqlx::query(CREATE_CURSOR_TABLE).execute(&pool).await?;

    tracing::info!("Cursor database ready at {}", path_str);
    Ok(pool)
}

/// In-memory database, mostly for tests. One connection, since each would get its own database.
pub async fn init_memory_db() -> Result<DbPool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    sqlx::query(CREATE_CURSOR_TABLE).execute(&pool).await?;
    Ok(pool)
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    for pragma in DB_PRAGMAS {
        sqlx::query(pragma).execute(pool).await?;
    }
    Ok(())
}

pub async fn cleanup_stale_cursors(
    pool: &DbPool,
    retention_days: i64,
) -> std::result::Result<u64, sqlx::Error> {
    let threshold = format!("-{} days", retention_days);

    let deleted = sqlx::query("DELETE FROM stream_cursors WHERE updated_at < datetime('now', ?)")
        .bind(&threshold)
        .execute(pool)
        .await?;

    if deleted.rows_affected() > 0 {
        tracing::info!(
            "Cursor cleanup removed {} entries older than {} days",
            deleted.rows_affected(),
            retention_days
        );
    }

    Ok(deleted.rows_affected())
}

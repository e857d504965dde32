//! Event cursor persistence.
//!
//! One row per user holding the id of the last applied event. A write
//! either lands durably or leaves the previous value intact; the engine
//! keeps its in-memory cursor authoritative between successful writes.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

/// Last applied event id for a user; empty string when the cursor was
/// never initialized.
pub async fn get_event_id(pool: &SqlitePool, user_id: &str) -> Result<String> {
    let row = sqlx::query("SELECT event_id FROM last_event_ids WHERE user_id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|r| r.get("event_id")).unwrap_or_default())
}

pub async fn set_event_id(pool: &SqlitePool, user_id: &str, event_id: &str) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO last_event_ids (user_id, event_id, updated_at) VALUES (?, ?, ?)",
    )
    .bind(user_id)
    .bind(event_id)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

//! Mailbox (label/folder) CRUD operations.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::remote::types::{Label, LabelKind};

fn row_to_label(row: SqliteRow) -> Result<Label> {
    let kind = LabelKind::try_from(row.get::<i64, _>("kind") as u8)
        .map_err(anyhow::Error::msg)?;
    Ok(Label {
        id: row.get("id"),
        name: row.get("name"),
        color: row.get("color"),
        hidden: row.get::<i64, _>("hidden") != 0,
        kind,
    })
}

/// Idempotent upsert keyed by label id.
pub async fn upsert_mailbox(pool: &SqlitePool, user_id: &str, label: &Label) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO mailboxes (user_id, id, name, color, hidden, kind)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(&label.id)
    .bind(&label.name)
    .bind(&label.color)
    .bind(label.hidden as i64)
    .bind(u8::from(label.kind) as i64)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete a mailbox and everything hanging off it: message assignments
/// and the uid allocator row.
pub async fn delete_mailbox(pool: &SqlitePool, user_id: &str, label_id: &str) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM mailboxes WHERE user_id = ? AND id = ?")
        .bind(user_id)
        .bind(label_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM message_labels WHERE user_id = ? AND label_id = ?")
        .bind(user_id)
        .bind(label_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM mailbox_uids WHERE user_id = ? AND label_id = ?")
        .bind(user_id)
        .bind(label_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

pub async fn get_mailbox(
    pool: &SqlitePool,
    user_id: &str,
    label_id: &str,
) -> Result<Option<Label>> {
    let row = sqlx::query("SELECT * FROM mailboxes WHERE user_id = ? AND id = ?")
        .bind(user_id)
        .bind(label_id)
        .fetch_optional(pool)
        .await?;

    row.map(row_to_label).transpose()
}

pub async fn list_mailboxes(pool: &SqlitePool, user_id: &str) -> Result<Vec<Label>> {
    let rows = sqlx::query("SELECT * FROM mailboxes WHERE user_id = ? ORDER BY name")
        .bind(user_id)
        .fetch_all(pool)
        .await?;

    rows.into_iter().map(row_to_label).collect()
}

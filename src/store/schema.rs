//! Database schema initialization.

use anyhow::Result;
use sqlx::SqlitePool;

/// Initialize the store schema with all tables and indexes.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        -- Messages, minus their mailbox assignments
        CREATE TABLE IF NOT EXISTS messages (
            user_id TEXT NOT NULL,
            id TEXT NOT NULL,
            time INTEGER NOT NULL DEFAULT 0,
            subject TEXT NOT NULL DEFAULT '',
            sender TEXT,
            to_list TEXT NOT NULL DEFAULT '[]',
            cc_list TEXT NOT NULL DEFAULT '[]',
            bcc_list TEXT NOT NULL DEFAULT '[]',
            unread INTEGER NOT NULL DEFAULT 0,
            flags INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, id)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_time ON messages(user_id, time DESC);

        -- Per-mailbox message assignments. The uid is allocated once per
        -- (message, mailbox) pair and never reused; ord preserves the
        -- label order the remote sent.
        CREATE TABLE IF NOT EXISTS message_labels (
            user_id TEXT NOT NULL,
            message_id TEXT NOT NULL,
            label_id TEXT NOT NULL,
            uid INTEGER NOT NULL,
            ord INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, message_id, label_id)
        );

        CREATE INDEX IF NOT EXISTS idx_message_labels_mailbox
            ON message_labels(user_id, label_id, uid);

        -- Monotonic uid allocator per mailbox
        CREATE TABLE IF NOT EXISTS mailbox_uids (
            user_id TEXT NOT NULL,
            label_id TEXT NOT NULL,
            next_uid INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (user_id, label_id)
        );

        -- Labels/folders
        CREATE TABLE IF NOT EXISTS mailboxes (
            user_id TEXT NOT NULL,
            id TEXT NOT NULL,
            name TEXT NOT NULL,
            color TEXT NOT NULL DEFAULT '',
            hidden INTEGER NOT NULL DEFAULT 0,
            kind INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (user_id, id)
        );

        -- User addresses, in the order the remote reports them
        CREATE TABLE IF NOT EXISTS addresses (
            user_id TEXT NOT NULL,
            id TEXT NOT NULL,
            email TEXT NOT NULL,
            receive INTEGER NOT NULL DEFAULT 1,
            ord INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, id)
        );

        -- Event cursor: id of the last event the local state reflects
        CREATE TABLE IF NOT EXISTS last_event_ids (
            user_id TEXT PRIMARY KEY,
            event_id TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

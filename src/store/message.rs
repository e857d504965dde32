//! Message CRUD with per-mailbox uid and sequence bookkeeping.
//!
//! Every (message, mailbox) pair gets a uid allocated from a monotonic
//! per-mailbox counter; uids are never reused. IMAP sequence numbers are
//! derived as the 1-based rank of a uid within its mailbox.

use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::remote::types::{EmailAddress, Message, MessageFlags};

/// A message's current membership in one mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxAssignment {
    pub label_id: String,
    pub uid: u32,
}

/// A message removed from a mailbox, with the sequence number it held at
/// removal time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expunge {
    pub label_id: String,
    pub uid: u32,
    pub seq: u32,
}

/// What an upsert/delete changed, for IMAP push fanout.
#[derive(Debug, Default)]
pub struct MessageMutation {
    /// Mailboxes the message now belongs to, in label order.
    pub assignments: Vec<MailboxAssignment>,
    /// Mailboxes the message left.
    pub expunges: Vec<Expunge>,
}

impl MessageMutation {
    /// Every mailbox whose contents or counts this mutation touched.
    pub fn affected_mailboxes(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for label_id in self
            .assignments
            .iter()
            .map(|a| &a.label_id)
            .chain(self.expunges.iter().map(|e| &e.label_id))
        {
            if !seen.contains(label_id) {
                seen.push(label_id.clone());
            }
        }
        seen
    }
}

fn row_to_message(row: &SqliteRow) -> Result<Message> {
    let sender: Option<String> = row.get("sender");
    let sender = sender
        .map(|s| serde_json::from_str::<EmailAddress>(&s))
        .transpose()
        .context("malformed sender column")?;

    Ok(Message {
        id: row.get("id"),
        time: row.get("time"),
        subject: row.get("subject"),
        sender,
        to_list: serde_json::from_str(row.get("to_list")).context("malformed to_list column")?,
        cc_list: serde_json::from_str(row.get("cc_list")).context("malformed cc_list column")?,
        bcc_list: serde_json::from_str(row.get("bcc_list"))
            .context("malformed bcc_list column")?,
        unread: row.get::<i64, _>("unread") != 0,
        flags: MessageFlags::from_bits_truncate(row.get::<i64, _>("flags") as u32),
        label_ids: Vec::new(),
    })
}

pub async fn get_message(
    pool: &SqlitePool,
    user_id: &str,
    message_id: &str,
) -> Result<Option<Message>> {
    let row = sqlx::query("SELECT * FROM messages WHERE user_id = ? AND id = ?")
        .bind(user_id)
        .bind(message_id)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let mut message = row_to_message(&row)?;

    let labels = sqlx::query(
        "SELECT label_id FROM message_labels WHERE user_id = ? AND message_id = ? ORDER BY ord",
    )
    .bind(user_id)
    .bind(message_id)
    .fetch_all(pool)
    .await?;
    message.label_ids = labels.into_iter().map(|r| r.get("label_id")).collect();

    Ok(Some(message))
}

/// Upsert a message and reconcile its mailbox assignments, allocating
/// fresh uids for new mailboxes and keeping existing uids stable.
pub async fn upsert_message(
    pool: &SqlitePool,
    user_id: &str,
    message: &Message,
) -> Result<MessageMutation> {
    let mut tx = pool.begin().await?;

    let sender = message
        .sender
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT OR REPLACE INTO messages
        (user_id, id, time, subject, sender, to_list, cc_list, bcc_list, unread, flags)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(&message.id)
    .bind(message.time)
    .bind(&message.subject)
    .bind(sender)
    .bind(serde_json::to_string(&message.to_list)?)
    .bind(serde_json::to_string(&message.cc_list)?)
    .bind(serde_json::to_string(&message.bcc_list)?)
    .bind(message.unread as i64)
    .bind(message.flags.bits() as i64)
    .execute(&mut *tx)
    .await?;

    let existing = sqlx::query(
        "SELECT label_id, uid FROM message_labels WHERE user_id = ? AND message_id = ?",
    )
    .bind(user_id)
    .bind(&message.id)
    .fetch_all(&mut *tx)
    .await?;

    let mut mutation = MessageMutation::default();

    // Expunge mailboxes the message left. Sequence numbers are computed
    // one removal at a time, matching how an IMAP expunge stream shifts
    // later sequence numbers.
    for row in &existing {
        let label_id: String = row.get("label_id");
        if message.label_ids.contains(&label_id) {
            continue;
        }
        let uid = row.get::<i64, _>("uid") as u32;
        let seq = seq_for_uid_conn(&mut tx, user_id, &label_id, uid).await?;
        sqlx::query(
            "DELETE FROM message_labels WHERE user_id = ? AND message_id = ? AND label_id = ?",
        )
        .bind(user_id)
        .bind(&message.id)
        .bind(&label_id)
        .execute(&mut *tx)
        .await?;
        mutation.expunges.push(Expunge { label_id, uid, seq });
    }

    for (ord, label_id) in message.label_ids.iter().enumerate() {
        let kept = existing.iter().find(|row| {
            row.get::<String, _>("label_id") == *label_id
        });
        let uid = match kept {
            Some(row) => {
                let uid = row.get::<i64, _>("uid") as u32;
                sqlx::query(
                    "UPDATE message_labels SET ord = ? WHERE user_id = ? AND message_id = ? AND label_id = ?",
                )
                .bind(ord as i64)
                .bind(user_id)
                .bind(&message.id)
                .bind(label_id)
                .execute(&mut *tx)
                .await?;
                uid
            }
            None => {
                let uid = allocate_uid(&mut tx, user_id, label_id).await?;
                sqlx::query(
                    "INSERT INTO message_labels (user_id, message_id, label_id, uid, ord) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(user_id)
                .bind(&message.id)
                .bind(label_id)
                .bind(uid as i64)
                .bind(ord as i64)
                .execute(&mut *tx)
                .await?;
                uid
            }
        };
        mutation.assignments.push(MailboxAssignment {
            label_id: label_id.clone(),
            uid,
        });
    }

    tx.commit().await?;
    Ok(mutation)
}

/// Delete a message, expunging it from every mailbox it belonged to.
pub async fn delete_message(
    pool: &SqlitePool,
    user_id: &str,
    message_id: &str,
) -> Result<MessageMutation> {
    let mut tx = pool.begin().await?;

    let existing = sqlx::query(
        "SELECT label_id, uid FROM message_labels WHERE user_id = ? AND message_id = ? ORDER BY ord",
    )
    .bind(user_id)
    .bind(message_id)
    .fetch_all(&mut *tx)
    .await?;

    let mut mutation = MessageMutation::default();

    for row in &existing {
        let label_id: String = row.get("label_id");
        let uid = row.get::<i64, _>("uid") as u32;
        let seq = seq_for_uid_conn(&mut tx, user_id, &label_id, uid).await?;
        sqlx::query(
            "DELETE FROM message_labels WHERE user_id = ? AND message_id = ? AND label_id = ?",
        )
        .bind(user_id)
        .bind(message_id)
        .bind(&label_id)
        .execute(&mut *tx)
        .await?;
        mutation.expunges.push(Expunge { label_id, uid, seq });
    }

    sqlx::query("DELETE FROM messages WHERE user_id = ? AND id = ?")
        .bind(user_id)
        .bind(message_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(mutation)
}

/// (total, unread) for one mailbox.
pub async fn mailbox_counts(
    pool: &SqlitePool,
    user_id: &str,
    label_id: &str,
) -> Result<(u64, u64)> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total,
            COALESCE(SUM(m.unread), 0) AS unread
        FROM message_labels ml
        JOIN messages m ON m.user_id = ml.user_id AND m.id = ml.message_id
        WHERE ml.user_id = ? AND ml.label_id = ?
        "#,
    )
    .bind(user_id)
    .bind(label_id)
    .fetch_one(pool)
    .await?;

    Ok((
        row.get::<i64, _>("total") as u64,
        row.get::<i64, _>("unread") as u64,
    ))
}

/// 1-based position of a uid within its mailbox, by uid order.
pub async fn seq_for_uid(
    pool: &SqlitePool,
    user_id: &str,
    label_id: &str,
    uid: u32,
) -> Result<u32> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS seq FROM message_labels WHERE user_id = ? AND label_id = ? AND uid <= ?",
    )
    .bind(user_id)
    .bind(label_id)
    .bind(uid as i64)
    .fetch_one(pool)
    .await?;

    Ok(row.get::<i64, _>("seq") as u32)
}

async fn seq_for_uid_conn(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    user_id: &str,
    label_id: &str,
    uid: u32,
) -> Result<u32> {
    let conn: &mut SqliteConnection = &mut *tx;
    let row = sqlx::query(
        "SELECT COUNT(*) AS seq FROM message_labels WHERE user_id = ? AND label_id = ? AND uid <= ?",
    )
    .bind(user_id)
    .bind(label_id)
    .bind(uid as i64)
    .fetch_one(conn)
    .await?;

    Ok(row.get::<i64, _>("seq") as u32)
}

async fn allocate_uid(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    user_id: &str,
    label_id: &str,
) -> Result<u32> {
    let conn: &mut SqliteConnection = &mut *tx;
    let row = sqlx::query(
        r#"
        INSERT INTO mailbox_uids (user_id, label_id, next_uid) VALUES (?, ?, 2)
        ON CONFLICT(user_id, label_id) DO UPDATE SET next_uid = next_uid + 1
        RETURNING next_uid - 1 AS uid
        "#,
    )
    .bind(user_id)
    .bind(label_id)
    .fetch_one(conn)
    .await?;

    Ok(row.get::<i64, _>("uid") as u32)
}

//! Local mail store backed by SQLite.
//!
//! This module is split into:
//! - `mod.rs` - Store struct, connection pool, applier-facing operations
//! - `schema.rs` - Database schema initialization
//! - `message.rs` - Message CRUD with per-mailbox uid/sequence bookkeeping
//! - `mailbox.rs` - Label/folder CRUD
//! - `address.rs` - Local copy of the user's address list
//! - `cursor.rs` - Durable event cursor
//! - `push.rs` - IMAP update fanout
//! - `sync.rs` - Full-sync coordination

mod address;
mod cursor;
mod mailbox;
mod message;
mod push;
mod schema;
mod sync;

pub use message::{Expunge, MailboxAssignment, MessageMutation};
pub use push::{ImapUpdate, imap_flags};
pub use sync::{SyncCoordinator, SyncRequest};

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::remote::types::{Address, Label, Message, MessageCount};

/// Connection pool size - the engine serializes writes per user, but
/// count probes and IMAP-side reads run concurrently.
const POOL_SIZE: u32 = 8;

pub struct Store {
    pool: SqlitePool,
    sync: SyncCoordinator,
    sync_requests: Mutex<Option<mpsc::UnboundedReceiver<SyncRequest>>>,
    imap_updates: RwLock<Option<mpsc::Sender<ImapUpdate>>>,
}

impl Store {
    pub async fn open(path: &Path) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", path.display());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_with(options)
            .await
            .context("Failed to create connection pool")?;

        schema::init_schema(&pool).await?;

        Ok(Self::with_pool(pool))
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to create in-memory connection pool")?;

        schema::init_schema(&pool).await?;

        Ok(Self::with_pool(pool))
    }

    fn with_pool(pool: SqlitePool) -> Self {
        let (sync, sync_rx) = SyncCoordinator::new();
        Self {
            pool,
            sync,
            sync_requests: Mutex::new(Some(sync_rx)),
            imap_updates: RwLock::new(None),
        }
    }

    /// The coordinator the event loop nudges for full syncs.
    pub fn sync(&self) -> &SyncCoordinator {
        &self.sync
    }

    /// The receive side of the full-sync trigger channel. The sync engine
    /// takes it once at startup.
    pub fn take_sync_requests(&self) -> Option<mpsc::UnboundedReceiver<SyncRequest>> {
        self.sync_requests.lock().unwrap().take()
    }

    //
    // Event Cursor Operations
    //

    /// Last applied event id, empty if the cursor was never initialized.
    pub async fn get_event_id(&self, user_id: &str) -> Result<String> {
        cursor::get_event_id(&self.pool, user_id).await
    }

    /// Persist the cursor. Durable on return; on error the previous value
    /// is intact.
    pub async fn set_event_id(&self, user_id: &str, event_id: &str) -> Result<()> {
        cursor::set_event_id(&self.pool, user_id, event_id).await
    }

    //
    // Message Operations
    //

    pub async fn get_message(&self, user_id: &str, message_id: &str) -> Result<Option<Message>> {
        message::get_message(&self.pool, user_id, message_id).await
    }

    /// Upsert a message and push the resulting IMAP updates to every
    /// receiving address.
    pub async fn upsert_message(&self, user_id: &str, msg: &Message) -> Result<()> {
        let mutation = message::upsert_message(&self.pool, user_id, msg).await?;
        self.push_mutation(user_id, Some(msg), &mutation).await?;
        Ok(())
    }

    /// Delete a message by id and push expunges. Unknown ids are a no-op.
    pub async fn delete_message(&self, user_id: &str, message_id: &str) -> Result<()> {
        let mutation = message::delete_message(&self.pool, user_id, message_id).await?;
        self.push_mutation(user_id, None, &mutation).await?;
        Ok(())
    }

    async fn push_mutation(
        &self,
        user_id: &str,
        msg: Option<&Message>,
        mutation: &MessageMutation,
    ) -> Result<()> {
        let emails = address::receiving_emails(&self.pool, user_id).await?;
        if emails.is_empty() {
            return Ok(());
        }

        for expunge in &mutation.expunges {
            for email in &emails {
                self.imap_expunge(email, &expunge.label_id, expunge.seq)
                    .await;
            }
        }

        if let Some(msg) = msg {
            for assignment in &mutation.assignments {
                let seq =
                    message::seq_for_uid(&self.pool, user_id, &assignment.label_id, assignment.uid)
                        .await?;
                for email in &emails {
                    self.imap_message_update(email, &assignment.label_id, assignment.uid, seq, msg)
                        .await;
                }
            }
        }

        for label_id in mutation.affected_mailboxes() {
            let (total, unread) = message::mailbox_counts(&self.pool, user_id, &label_id).await?;
            for email in &emails {
                self.imap_mailbox_status(email, &label_id, total, unread)
                    .await;
            }
        }

        Ok(())
    }

    //
    // Mailbox Operations
    //

    /// Idempotent create-or-update of a mailbox record.
    pub async fn upsert_mailbox(&self, user_id: &str, label: &Label) -> Result<()> {
        mailbox::upsert_mailbox(&self.pool, user_id, label).await?;

        let (total, unread) = message::mailbox_counts(&self.pool, user_id, &label.id).await?;
        for email in address::receiving_emails(&self.pool, user_id).await? {
            self.imap_mailbox_status(&email, &label.id, total, unread)
                .await;
        }
        Ok(())
    }

    pub async fn delete_mailbox(&self, user_id: &str, label_id: &str) -> Result<()> {
        mailbox::delete_mailbox(&self.pool, user_id, label_id).await
    }

    pub async fn get_mailbox(&self, user_id: &str, label_id: &str) -> Result<Option<Label>> {
        mailbox::get_mailbox(&self.pool, user_id, label_id).await
    }

    pub async fn list_mailboxes(&self, user_id: &str) -> Result<Vec<Label>> {
        mailbox::list_mailboxes(&self.pool, user_id).await
    }

    //
    // Address Operations
    //

    /// Replace the stored address set (upserts + deletes in one pass).
    pub async fn replace_addresses(&self, user_id: &str, addresses: &[Address]) -> Result<()> {
        address::replace_addresses(&self.pool, user_id, addresses).await
    }

    pub async fn addresses(&self, user_id: &str) -> Result<Vec<Address>> {
        address::get_addresses(&self.pool, user_id).await
    }

    pub async fn receiving_emails(&self, user_id: &str) -> Result<Vec<String>> {
        address::receiving_emails(&self.pool, user_id).await
    }

    //
    // Consistency Probe
    //

    /// Compare server-reported counters against locally derived counts.
    /// A mismatch means the store drifted and needs a full re-sync.
    pub async fn is_synced(&self, user_id: &str, counts: &[MessageCount]) -> Result<bool> {
        for count in counts {
            let (total, unread) =
                message::mailbox_counts(&self.pool, user_id, &count.label_id).await?;
            if total != count.total || unread != count.unread {
                tracing::debug!(
                    label_id = %count.label_id,
                    local_total = total,
                    local_unread = unread,
                    remote_total = count.total,
                    remote_unread = count.unread,
                    "Message counts diverged"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }
}

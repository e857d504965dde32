//! IMAP update fanout.
//!
//! The IMAP server framework registers a single channel here; the store
//! pushes update records into it as deltas land. Delivery is best-effort:
//! a send is bounded by [`IMAP_SEND_TIMEOUT`] and dropped on timeout so
//! that event processing never stalls on IMAP backpressure. No registered
//! channel means updates are silently dropped.

use tokio::sync::mpsc;

use crate::constants::IMAP_SEND_TIMEOUT;
use crate::remote::types::{Message, MessageFlags};

use super::Store;

/// One update record for the IMAP push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ImapUpdate {
    /// Rendered as an untagged `OK [ALERT]` status response.
    Status { address: String, info: String },
    /// A message appeared or changed in a mailbox.
    Message {
        address: String,
        mailbox: String,
        uid: u32,
        seq_num: u32,
        flags: Vec<String>,
    },
    /// A message left a mailbox.
    Expunge {
        address: String,
        mailbox: String,
        seq_num: u32,
    },
    /// A mailbox's counters changed.
    Mailbox {
        address: String,
        mailbox: String,
        total: u64,
        unread: u64,
    },
}

/// IMAP flag strings for a message, derived from its unread bit and
/// server flags.
pub fn imap_flags(message: &Message) -> Vec<String> {
    let mut flags = Vec::new();
    if !message.unread {
        flags.push("\\Seen".to_string());
    }
    if message.flags.contains(MessageFlags::ANSWERED) {
        flags.push("\\Answered".to_string());
    }
    if message.flags.contains(MessageFlags::FORWARDED) {
        flags.push("$Forwarded".to_string());
    }
    flags
}

impl Store {
    /// Set the channel on which IMAP update records are sent. This should
    /// be the channel the IMAP backend listens on.
    pub fn set_imap_update_channel(&self, updates: mpsc::Sender<ImapUpdate>) {
        tracing::debug!("Listening for IMAP updates");
        *self.imap_updates.write().unwrap() = Some(updates);
    }

    pub(crate) async fn imap_notice(&self, address: &str, notice: &str) {
        self.imap_send_update(ImapUpdate::Status {
            address: address.to_string(),
            info: notice.to_string(),
        })
        .await;
    }

    pub(crate) async fn imap_message_update(
        &self,
        address: &str,
        mailbox: &str,
        uid: u32,
        seq_num: u32,
        message: &Message,
    ) {
        tracing::trace!(address, mailbox, uid, seq_num, "IDLE update");
        self.imap_send_update(ImapUpdate::Message {
            address: address.to_string(),
            mailbox: mailbox.to_string(),
            uid,
            seq_num,
            flags: imap_flags(message),
        })
        .await;
    }

    pub(crate) async fn imap_expunge(&self, address: &str, mailbox: &str, seq_num: u32) {
        tracing::trace!(address, mailbox, seq_num, "IDLE delete");
        self.imap_send_update(ImapUpdate::Expunge {
            address: address.to_string(),
            mailbox: mailbox.to_string(),
            seq_num,
        })
        .await;
    }

    pub(crate) async fn imap_mailbox_status(
        &self,
        address: &str,
        mailbox: &str,
        total: u64,
        unread: u64,
    ) {
        tracing::trace!(address, mailbox, total, unread, "IDLE status");
        self.imap_send_update(ImapUpdate::Mailbox {
            address: address.to_string(),
            mailbox: mailbox.to_string(),
            total,
            unread,
        })
        .await;
    }

    async fn imap_send_update(&self, update: ImapUpdate) {
        let Some(tx) = self.imap_updates.read().unwrap().clone() else {
            tracing::trace!("IMAP push unavailable");
            return;
        };

        match tokio::time::timeout(IMAP_SEND_TIMEOUT, tx.send(update)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => tracing::error!("Could not send IMAP update (channel closed)"),
            Err(_) => tracing::error!("Could not send IMAP update (timeout)"),
        }
    }
}

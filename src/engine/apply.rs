//! Delta appliers: merge one event's collections into the local store.
//!
//! Categories run in a fixed order (addresses, labels, messages, counts,
//! notices) and deltas within a category run in the order received. Every
//! applier is idempotent: the cursor is only persisted after a successful
//! apply, so a crash in between replays the event.

use anyhow::{Context, Result};

use crate::events::BridgeEvent;
use crate::remote::types::{
    AddressDelta, DeltaAction, Event, LabelDelta, Message, MessageCount, MessageDelta,
    MessagePatch, RefreshFlags,
};

use super::event_loop::EventLoop;

impl EventLoop {
    pub(crate) async fn apply_event(&mut self, event: &Event) -> Result<()> {
        tracing::debug!(event_id = %event.event_id, "Processing event");

        if event.refresh.contains(RefreshFlags::MAIL) {
            // The server asked us to throw local mail state away; the
            // full sync handles that, so per-entity deltas are skipped.
            tracing::info!("Processing refresh event");
            self.store.sync().trigger_sync();
            return Ok(());
        }

        if !event.addresses.is_empty() {
            self.apply_addresses(&event.addresses)
                .await
                .context("failed to apply address deltas")?;
        }

        if !event.labels.is_empty() {
            self.apply_labels(&event.labels)
                .await
                .context("failed to apply label deltas")?;
        }

        if !event.messages.is_empty() {
            self.apply_messages(&event.messages)
                .await
                .context("failed to apply message deltas")?;
        }

        // Counts are served on an irregular basis rather than with every
        // event, so the drift probe only runs when they are present.
        if !event.message_counts.is_empty() {
            self.apply_message_counts(&event.message_counts)
                .await
                .context("failed to apply message count deltas")?;
        }

        if !event.notices.is_empty() {
            self.apply_notices(&event.notices).await;
        }

        Ok(())
    }

    async fn apply_addresses(&mut self, deltas: &[AddressDelta]) -> Result<()> {
        tracing::debug!("Processing address change event");

        // Snapshot the previous list before the profile refresh replaces it.
        let old_list = self.client.addresses();

        if let Err(err) = self.user.update_profile().await {
            if let Err(logout_err) = self.user.logout().await {
                tracing::error!("Failed to logout user after failed update: {logout_err:#}");
            }
            return Err(err).context("failed to update user profile");
        }

        for delta in deltas {
            match delta.action {
                DeltaAction::Create => {
                    let email = delta.address.as_ref().map(|a| a.email.as_str());
                    tracing::debug!(email, "Address was created");
                    self.bus
                        .emit(BridgeEvent::AddressChanged(self.user.primary_email()));
                }

                DeltaAction::Update => {
                    let Some(old) = old_list.iter().find(|a| a.id == delta.id) else {
                        tracing::warn!("Event refers to an address that isn't present");
                        continue;
                    };
                    tracing::debug!(email = %old.email, "Address was updated");
                    // A receive flip invalidates open sessions for the address.
                    if let Some(address) = &delta.address {
                        if address.receive != old.receive {
                            self.bus
                                .emit(BridgeEvent::AddressChangedLogout(old.email.clone()));
                        }
                    }
                }

                DeltaAction::Delete => {
                    let Some(old) = old_list.iter().find(|a| a.id == delta.id) else {
                        tracing::warn!("Event refers to an address that isn't present");
                        continue;
                    };
                    tracing::debug!(email = %old.email, "Address was deleted");
                    self.user.close_connection(&old.email).await;
                    self.bus
                        .emit(BridgeEvent::AddressChangedLogout(old.email.clone()));
                }

                DeltaAction::UpdateFlags => {}
            }
        }

        self.store
            .replace_addresses(&self.user_id, &self.client.addresses())
            .await
            .context("failed to update addresses in store")?;

        Ok(())
    }

    async fn apply_labels(&mut self, deltas: &[LabelDelta]) -> Result<()> {
        tracing::debug!("Processing label change event");

        for delta in deltas {
            match delta.action {
                DeltaAction::Create | DeltaAction::Update => {
                    let Some(label) = &delta.label else {
                        tracing::error!(label_id = %delta.id, "Label delta without label record");
                        continue;
                    };
                    self.store
                        .upsert_mailbox(&self.user_id, label)
                        .await
                        .context("failed to create or update mailbox")?;
                }
                DeltaAction::Delete => {
                    self.store
                        .delete_mailbox(&self.user_id, &delta.id)
                        .await
                        .context("failed to delete mailbox")?;
                }
                DeltaAction::UpdateFlags => {}
            }
        }

        Ok(())
    }

    async fn apply_messages(&mut self, deltas: &[MessageDelta]) -> Result<()> {
        tracing::debug!("Processing message change event");

        for delta in deltas {
            match delta.action {
                DeltaAction::Create => {
                    tracing::debug!(msg_id = %delta.id, "Processing message create");

                    let Some(created) = &delta.created else {
                        tracing::error!(msg_id = %delta.id, "Got message create without body");
                        continue;
                    };
                    self.store
                        .upsert_message(&self.user_id, created)
                        .await
                        .context("failed to put message into store")?;
                }

                DeltaAction::Update | DeltaAction::UpdateFlags => {
                    tracing::debug!(msg_id = %delta.id, "Processing message update");

                    let Some(patch) = &delta.updated else {
                        tracing::error!(msg_id = %delta.id, "Got message update without patch");
                        continue;
                    };

                    let local = self
                        .store
                        .get_message(&self.user_id, &delta.id)
                        .await
                        .context("failed to get message from store for updating")?;

                    let mut message = match local {
                        Some(message) => message,
                        None => {
                            tracing::warn!(
                                msg_id = %delta.id,
                                "Message not in store for updating, trying fetch"
                            );
                            match self
                                .client
                                .fetch_message(&delta.id)
                                .await
                                .context("failed to fetch message for updating")?
                            {
                                Some(message) => message,
                                None => {
                                    // The update is older than the message's
                                    // deletion everywhere; nothing to do.
                                    tracing::warn!(
                                        msg_id = %delta.id,
                                        "Skipping update of message missing in store and on remote"
                                    );
                                    continue;
                                }
                            }
                        }
                    };

                    merge_message_patch(&mut message, patch);

                    self.store
                        .upsert_message(&self.user_id, &message)
                        .await
                        .context("failed to update message in store")?;
                }

                DeltaAction::Delete => {
                    tracing::debug!(msg_id = %delta.id, "Processing message delete");

                    self.store
                        .delete_message(&self.user_id, &delta.id)
                        .await
                        .context("failed to delete message from store")?;
                }
            }
        }

        Ok(())
    }

    async fn apply_message_counts(&mut self, counts: &[MessageCount]) -> Result<()> {
        tracing::debug!(?counts, "Processing message count change event");

        let synced = self.store.is_synced(&self.user_id, counts).await?;
        if !synced {
            self.store.sync().trigger_sync();
        }

        Ok(())
    }

    async fn apply_notices(&mut self, notices: &[String]) {
        tracing::debug!("Processing notice event");

        for notice in notices {
            tracing::info!("Notice: {:?}", notice);
            for email in self.user.active_emails() {
                self.store.imap_notice(&email, notice).await;
            }
        }
    }
}

/// Merge a sparse patch into a message. `time` always overwrites; other
/// scalar fields only when present. Label ids are either replaced
/// wholesale or reconciled through the added/removed lists, preserving
/// the existing order and appending new ids at the end.
pub(crate) fn merge_message_patch(message: &mut Message, patch: &MessagePatch) {
    message.time = patch.time;

    if let Some(subject) = &patch.subject {
        message.subject = subject.clone();
    }
    if let Some(sender) = &patch.sender {
        message.sender = Some(sender.clone());
    }
    if let Some(to_list) = &patch.to_list {
        message.to_list = to_list.clone();
    }
    if let Some(cc_list) = &patch.cc_list {
        message.cc_list = cc_list.clone();
    }
    if let Some(bcc_list) = &patch.bcc_list {
        message.bcc_list = bcc_list.clone();
    }
    if let Some(unread) = patch.unread {
        message.unread = unread;
    }
    if let Some(flags) = patch.flags {
        message.flags = flags;
    }

    if let Some(label_ids) = &patch.label_ids {
        message.label_ids = label_ids.clone();
    } else {
        for added in &patch.label_ids_added {
            if !message.label_ids.contains(added) {
                message.label_ids.push(added.clone());
            }
        }
        message
            .label_ids
            .retain(|label| !patch.label_ids_removed.contains(label));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::types::{EmailAddress, MessageFlags};

    fn message_with_labels(labels: &[&str]) -> Message {
        Message {
            id: "m1".to_string(),
            time: 100,
            subject: "Original".to_string(),
            unread: true,
            label_ids: labels.iter().map(|l| l.to_string()).collect(),
            ..Message::default()
        }
    }

    #[test]
    fn test_patch_overwrites_present_fields_only() {
        let mut message = message_with_labels(&["L1"]);
        message.sender = Some(EmailAddress {
            name: "Old".to_string(),
            address: "old@example.com".to_string(),
        });

        let patch = MessagePatch {
            time: 200,
            subject: Some("Updated".to_string()),
            unread: Some(false),
            flags: Some(MessageFlags::ANSWERED),
            ..MessagePatch::default()
        };
        merge_message_patch(&mut message, &patch);

        assert_eq!(message.time, 200);
        assert_eq!(message.subject, "Updated");
        assert!(!message.unread);
        assert_eq!(message.flags, MessageFlags::ANSWERED);
        // Absent in the patch: untouched.
        assert_eq!(message.sender.as_ref().unwrap().address, "old@example.com");
        assert_eq!(message.label_ids, vec!["L1"]);
    }

    #[test]
    fn test_full_label_list_replaces() {
        let mut message = message_with_labels(&["L1", "L2"]);
        let patch = MessagePatch {
            label_ids: Some(vec!["L9".to_string()]),
            // Ignored when the full list is present.
            label_ids_added: vec!["LX".to_string()],
            ..MessagePatch::default()
        };
        merge_message_patch(&mut message, &patch);
        assert_eq!(message.label_ids, vec!["L9"]);
    }

    #[test]
    fn test_label_reconciliation_preserves_order() {
        let mut message = message_with_labels(&["L1", "L2"]);
        let patch = MessagePatch {
            label_ids_added: vec!["L3".to_string()],
            label_ids_removed: vec!["L1".to_string()],
            ..MessagePatch::default()
        };
        merge_message_patch(&mut message, &patch);
        assert_eq!(message.label_ids, vec!["L2", "L3"]);
    }

    #[test]
    fn test_label_reconciliation_is_idempotent() {
        let mut message = message_with_labels(&["L1", "L2"]);
        let patch = MessagePatch {
            label_ids_added: vec!["L2".to_string(), "L3".to_string()],
            label_ids_removed: vec!["L1".to_string()],
            ..MessagePatch::default()
        };

        merge_message_patch(&mut message, &patch);
        let once = message.label_ids.clone();
        merge_message_patch(&mut message, &patch);

        assert_eq!(message.label_ids, once);
        assert_eq!(message.label_ids, vec!["L2", "L3"]);
    }
}

//! Wire records served by the remote event endpoint.
//!
//! The remote log is an append-only sequence of per-user deltas keyed by
//! opaque event ids. Field names follow the service's PascalCase JSON;
//! booleans arrive as 0/1 integers on some fields and are decoded by
//! [`bool_from_int`].

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize};

bitflags! {
    /// Server-side message flags, carried opaquely through the store.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageFlags: u32 {
        const RECEIVED = 0b00000001;
        const SENT = 0b00000010;
        const INTERNAL = 0b00000100;
        const ANSWERED = 0b00001000;
        const FORWARDED = 0b00010000;
    }
}

bitflags! {
    /// Refresh bitmask on an event. `MAIL` demands the client discard its
    /// local mail state and run a full re-sync.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RefreshFlags: u32 {
        const MAIL = 1;
    }
}

/// Action carried by every delta. On the wire: 0=delete, 1=create,
/// 2=update, 3=update_flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum DeltaAction {
    Delete,
    Create,
    Update,
    UpdateFlags,
}

impl TryFrom<u8> for DeltaAction {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DeltaAction::Delete),
            1 => Ok(DeltaAction::Create),
            2 => Ok(DeltaAction::Update),
            3 => Ok(DeltaAction::UpdateFlags),
            other => Err(format!("unknown delta action {}", other)),
        }
    }
}

/// One immutable record from the remote event log.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Event {
    #[serde(rename = "EventID")]
    pub event_id: String,
    /// Another event is immediately available after this one.
    #[serde(deserialize_with = "bool_from_int")]
    pub more: bool,
    #[serde(deserialize_with = "refresh_from_bits")]
    pub refresh: RefreshFlags,
    pub addresses: Vec<AddressDelta>,
    pub labels: Vec<LabelDelta>,
    pub messages: Vec<MessageDelta>,
    pub message_counts: Vec<MessageCount>,
    pub notices: Vec<String>,
}

/// A user address as the remote reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Address {
    #[serde(rename = "ID")]
    pub id: String,
    pub email: String,
    /// Whether the address can receive mail. A flip invalidates sessions.
    #[serde(deserialize_with = "bool_from_int")]
    pub receive: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddressDelta {
    #[serde(rename = "ID")]
    pub id: String,
    pub action: DeltaAction,
    #[serde(default)]
    pub address: Option<Address>,
}

/// Label (mailbox) kind. On the wire: 1=label, 3=folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum LabelKind {
    Label,
    Folder,
}

impl TryFrom<u8> for LabelKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(LabelKind::Label),
            3 => Ok(LabelKind::Folder),
            other => Err(format!("unknown label kind {}", other)),
        }
    }
}

impl From<LabelKind> for u8 {
    fn from(kind: LabelKind) -> u8 {
        match kind {
            LabelKind::Label => 1,
            LabelKind::Folder => 3,
        }
    }
}

/// A label/mailbox record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Label {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: String,
    /// Hidden labels stay out of mailbox listings but still hold mail.
    #[serde(default, deserialize_with = "bool_from_int")]
    pub hidden: bool,
    #[serde(rename = "Type")]
    pub kind: LabelKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LabelDelta {
    #[serde(rename = "ID")]
    pub id: String,
    pub action: DeltaAction,
    #[serde(default)]
    pub label: Option<Label>,
}

/// A mail participant. Kept as name + address since display names matter
/// to the IMAP side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EmailAddress {
    #[serde(default)]
    pub name: String,
    pub address: String,
}

/// A full message record as stored locally.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Message {
    #[serde(rename = "ID")]
    pub id: String,
    pub time: i64,
    pub subject: String,
    pub sender: Option<EmailAddress>,
    pub to_list: Vec<EmailAddress>,
    #[serde(rename = "CCList")]
    pub cc_list: Vec<EmailAddress>,
    #[serde(rename = "BCCList")]
    pub bcc_list: Vec<EmailAddress>,
    #[serde(deserialize_with = "bool_from_int")]
    pub unread: bool,
    #[serde(deserialize_with = "message_flags_from_bits")]
    pub flags: MessageFlags,
    #[serde(rename = "LabelIDs")]
    pub label_ids: Vec<String>,
}

/// Sparse patch carried by `update` / `update_flags` deltas. Absent fields
/// leave the local value untouched; `Time` always overwrites.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MessagePatch {
    pub time: i64,
    pub subject: Option<String>,
    pub sender: Option<EmailAddress>,
    pub to_list: Option<Vec<EmailAddress>>,
    #[serde(rename = "CCList")]
    pub cc_list: Option<Vec<EmailAddress>>,
    #[serde(rename = "BCCList")]
    pub bcc_list: Option<Vec<EmailAddress>>,
    #[serde(deserialize_with = "opt_bool_from_int")]
    pub unread: Option<bool>,
    #[serde(deserialize_with = "opt_message_flags_from_bits")]
    pub flags: Option<MessageFlags>,
    /// Full replacement of the label set; wins over added/removed.
    #[serde(rename = "LabelIDs")]
    pub label_ids: Option<Vec<String>>,
    #[serde(rename = "LabelIDsAdded")]
    pub label_ids_added: Vec<String>,
    #[serde(rename = "LabelIDsRemoved")]
    pub label_ids_removed: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageDelta {
    #[serde(rename = "ID")]
    pub id: String,
    pub action: DeltaAction,
    /// Full message on `create`.
    #[serde(default)]
    pub created: Option<Message>,
    /// Sparse patch on `update` / `update_flags`.
    #[serde(default)]
    pub updated: Option<MessagePatch>,
}

/// Per-mailbox aggregate counters, served irregularly and used only as a
/// consistency probe.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageCount {
    #[serde(rename = "LabelID")]
    pub label_id: String,
    pub total: u64,
    pub unread: u64,
}

/// Decode a 0/1 wire integer into a bool. The endpoint also serves plain
/// booleans on newer fields, so both are accepted.
fn bool_from_int<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrBool {
        Int(u8),
        Bool(bool),
    }

    match IntOrBool::deserialize(deserializer)? {
        IntOrBool::Int(0) => Ok(false),
        IntOrBool::Int(_) => Ok(true),
        IntOrBool::Bool(b) => Ok(b),
    }
}

fn opt_bool_from_int<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "bool_from_int")] bool);

    Option::<Wrapper>::deserialize(deserializer).map(|opt| opt.map(|w| w.0))
}

fn refresh_from_bits<'de, D>(deserializer: D) -> Result<RefreshFlags, D::Error>
where
    D: Deserializer<'de>,
{
    u32::deserialize(deserializer).map(RefreshFlags::from_bits_truncate)
}

fn message_flags_from_bits<'de, D>(deserializer: D) -> Result<MessageFlags, D::Error>
where
    D: Deserializer<'de>,
{
    u32::deserialize(deserializer).map(MessageFlags::from_bits_truncate)
}

fn opt_message_flags_from_bits<'de, D>(deserializer: D) -> Result<Option<MessageFlags>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<u32>::deserialize(deserializer)
        .map(|opt| opt.map(MessageFlags::from_bits_truncate))
}

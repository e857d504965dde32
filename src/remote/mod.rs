//! Contracts for the remote mail service.
//!
//! The HTTP transport lives outside this crate; the sync core only sees
//! these traits plus the sentinel errors it must classify. Test suites
//! drive the engine through scripted implementations.

pub mod types;

use async_trait::async_trait;

pub use types::{
    Address, AddressDelta, DeltaAction, EmailAddress, Event, Label, LabelDelta, LabelKind,
    Message, MessageCount, MessageDelta, MessageFlags, MessagePatch, RefreshFlags,
};

/// Sentinel errors surfaced by any remote call. The engine's classifier
/// maps these to lifecycle events and decides which ones are fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("remote service is not reachable")]
    NotReachable,
    #[error("remote service requires an application upgrade")]
    UpgradeApplication,
    #[error("request was not authorized")]
    Unauthorized,
    #[error("auth token is invalid")]
    InvalidToken,
    #[error("remote request failed: {0}")]
    Other(String),
}

/// Read side of the remote event log.
#[async_trait]
pub trait EventClient: Send + Sync {
    /// Fetch the next event after `since_id`. An empty `since_id` returns
    /// the current head event without replaying history; when no newer
    /// event exists the returned event carries `since_id` itself.
    async fn get_event(&self, since_id: &str) -> Result<Event, RemoteError>;

    /// Fetch a single message by id. `Ok(None)` means the remote does not
    /// know the message either.
    async fn fetch_message(&self, message_id: &str) -> Result<Option<Message>, RemoteError>;

    /// Snapshot of the client's current address list. Refreshed as a side
    /// effect of [`UserSession::update_profile`].
    fn addresses(&self) -> Vec<Address>;
}

/// Session-level operations on the user owning an engine.
#[async_trait]
pub trait UserSession: Send + Sync {
    fn id(&self) -> &str;

    /// Refresh the user profile; updates the client's address list.
    async fn update_profile(&self) -> Result<(), RemoteError>;

    /// Invalidate the session. After this the engine cannot restart
    /// without a fresh login.
    async fn logout(&self) -> anyhow::Result<()>;

    fn primary_email(&self) -> String;

    /// Emails currently able to receive mail; notice alerts fan out to
    /// each of these.
    fn active_emails(&self) -> Vec<String>;

    /// Close any open IMAP connection bound to this email.
    async fn close_connection(&self, email: &str);
}

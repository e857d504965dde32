//! Per-user synchronization core for a remote mail service.
//!
//! The remote service exposes an append-only event log; each event
//! carries deltas over a user's addresses, mailboxes, messages, counters
//! and server notices. This crate owns the loop that polls that log,
//! merges deltas into a local SQLite store, advances a durable cursor,
//! and fans updates out to an IMAP push channel, converging local state
//! with the remote under intermittent connectivity.
//!
//! The pieces:
//!
//! - [`engine`] - the per-user event loop (timer + on-demand polling,
//!   error classification, lifecycle)
//! - [`store`] - the local store, the durable event cursor, IMAP update
//!   fanout, and full-sync coordination
//! - [`remote`] - contracts for the remote service plus its wire types
//! - [`events`] - the broadcast bus for coarse lifecycle events
//!
//! The HTTP transport, the IMAP server framework, and the full-sync
//! engine live outside this crate and are reached only through their
//! contracts ([`remote::EventClient`], the update channel registered via
//! [`store::Store::set_imap_update_channel`], and the trigger channel
//! from [`store::Store::take_sync_requests`]).

pub mod config;
pub mod constants;
pub mod engine;
pub mod events;
pub mod logging;
pub mod remote;
pub mod store;

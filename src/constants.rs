//! Application-wide constants for tuning and configuration
//!
//! Centralizes magic numbers to make them discoverable and configurable.

use std::time::Duration;

/// Interval between event-log polls when nothing forces an earlier fetch.
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// How long `stop()` waits for the engine task to acknowledge before
/// giving up and returning.
pub const STOP_GRACE_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on a single send into the IMAP update channel.
/// The event loop must never block on IMAP backpressure longer than this.
pub const IMAP_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Capacity of the per-engine poll-request channel.
/// Overlapping poll requests are serialized by the loop, so a small
/// buffer only needs to absorb bursts from the sync coordinator.
pub const POLL_CHANNEL_CAPACITY: usize = 8;

/// Capacity of the bridge event bus.
/// Lifecycle events are coarse and rare; slow subscribers lag rather
/// than block the emitter.
pub const EVENT_BUS_CAPACITY: usize = 64;

/// File descriptor usage (percent of the soft RLIMIT_NOFILE) above which
/// the process is considered close enough to the ulimit to recommend a
/// restart.
pub const FD_USAGE_RESTART_PERCENT: u64 = 90;

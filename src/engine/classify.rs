//! Error classification for the event loop.
//!
//! A failed iteration ends up here exactly once: the classifier maps the
//! error (plus the file-descriptor probe) to the lifecycle events to emit
//! and decides whether the loop must die. Only credential errors are
//! fatal; everything else is expected to fix itself on a later tick.

use crate::remote::RemoteError;

/// Outcome of classifying one iteration's error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Classification {
    /// Stop the loop and log the user out.
    pub fatal: bool,
    /// Emit `InternetOff` and mark the connection lost.
    pub offline: bool,
    /// Emit `UpgradeApplication`.
    pub upgrade: bool,
    /// Emit `RestartBridge`. Additive: orthogonal to the error kind, so
    /// it can fire together with an offline emission.
    pub restart: bool,
}

pub(crate) fn classify(err: &anyhow::Error, fd_near_ulimit: bool) -> Classification {
    let mut classification = Classification {
        restart: fd_near_ulimit,
        ..Classification::default()
    };

    match err.downcast_ref::<RemoteError>() {
        Some(RemoteError::NotReachable) => classification.offline = true,
        Some(RemoteError::UpgradeApplication) => classification.upgrade = true,
        Some(RemoteError::Unauthorized) | Some(RemoteError::InvalidToken) => {
            classification.fatal = true
        }
        Some(RemoteError::Other(_)) | None => {}
    }

    classification
}

/// Whether this process is close to its open-file limit.
///
/// Counts `/proc/self/fd` against the soft `RLIMIT_NOFILE`; a leak that
/// gets near the limit makes every remote call fail in confusing ways,
/// so the loop recommends a restart instead of churning.
#[cfg(target_os = "linux")]
pub(crate) fn fd_near_ulimit() -> bool {
    use crate::constants::FD_USAGE_RESTART_PERCENT;

    let used = match std::fs::read_dir("/proc/self/fd") {
        Ok(entries) => entries.count() as u64,
        Err(_) => return false,
    };

    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // Safety: getrlimit writes into the struct we own and nothing else.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return false;
    }
    if limit.rlim_cur == 0 {
        return false;
    }

    used * 100 >= limit.rlim_cur * FD_USAGE_RESTART_PERCENT
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn fd_near_ulimit() -> bool {
    false
}

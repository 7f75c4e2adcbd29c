//! Shared constants for the skiff transport core.

use std::time::Duration;

// =============================================================================
// Socket Worker
// =============================================================================

/// Grace period after waking a busy worker before concluding it is stuck
/// inside a blocking resolver call and must be detached.
pub const WORKER_DETACH_GRACE: Duration = Duration::from_millis(100);

/// Listen backlog for data-connection listen sockets. A control connection
/// only ever expects a single peer.
pub const LISTEN_BACKLOG: i32 = 1;

/// Thread name for socket workers.
pub const WORKER_THREAD_NAME: &str = "skiff-socket-worker";

// =============================================================================
// Control Socket
// =============================================================================

/// Interval of the control-socket timeout watchdog.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

/// Default command timeout when the embedder supplies no options.
pub const DEFAULT_TIMEOUT_SECS: u64 = 20;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detach_grace_is_shorter_than_watchdog() {
        assert!(WORKER_DETACH_GRACE < WATCHDOG_INTERVAL);
    }

    #[test]
    fn default_timeout_spans_multiple_watchdog_ticks() {
        assert!(DEFAULT_TIMEOUT_SECS > WATCHDOG_INTERVAL.as_secs());
    }
}

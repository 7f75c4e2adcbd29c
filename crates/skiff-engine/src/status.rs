//! Transfer status bookkeeping.
//!
//! Status is written from the controller thread as bytes move and sampled
//! concurrently by a UI thread through [`TransferStatusHandle`], so the
//! record sits behind a mutex with short critical sections.
//!
//! Notification throttling uses a three-state send marker: an update only
//! posts a fresh notification when the previous one has been consumed by
//! the sampler, so a fast transfer cannot flood the embedder.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A snapshot of one transfer's progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferStatus {
    /// Expected total size; `None` when the server did not report one.
    pub total_size: Option<u64>,
    /// Offset the transfer started at (resume point).
    pub start_offset: u64,
    /// Current offset.
    pub current_offset: u64,
    /// When the transfer actually started moving bytes.
    pub started: Option<Instant>,
    /// At least one byte of payload has moved.
    pub made_progress: bool,
    /// This transfer is a directory listing.
    pub is_listing: bool,
}

impl TransferStatus {
    /// Bytes moved so far.
    pub fn transferred(&self) -> u64 {
        self.current_offset.saturating_sub(self.start_offset)
    }

    /// Wall-clock time since the transfer started.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started.map(|started| started.elapsed())
    }
}

const SEND_IDLE: u8 = 0;
const SEND_CONSUMED: u8 = 1;
const SEND_PENDING: u8 = 2;

#[derive(Default)]
struct StatusInner {
    status: Option<TransferStatus>,
    send_state: u8,
}

/// The writer side, owned by a control socket.
#[derive(Clone, Default)]
pub struct SharedTransferStatus {
    inner: Arc<Mutex<StatusInner>>,
}

impl SharedTransferStatus {
    pub fn new() -> SharedTransferStatus {
        SharedTransferStatus::default()
    }

    /// Begin tracking a transfer.
    pub fn init(&self, total_size: Option<u64>, start_offset: u64, is_listing: bool) {
        let mut inner = self.inner.lock();
        inner.status = Some(TransferStatus {
            total_size,
            start_offset,
            current_offset: start_offset,
            started: None,
            made_progress: false,
            is_listing,
        });
    }

    /// Stamp the start time once the data connection is up.
    pub fn set_start_time(&self) {
        if let Some(status) = self.inner.lock().status.as_mut() {
            status.started = Some(Instant::now());
        }
    }

    pub fn set_made_progress(&self) {
        if let Some(status) = self.inner.lock().status.as_mut() {
            status.made_progress = true;
        }
    }

    /// Advance the offset. Returns a snapshot when the embedder should be
    /// notified (previous notification consumed).
    pub fn update(&self, transferred: u64) -> Option<TransferStatus> {
        let mut inner = self.inner.lock();
        let status = inner.status.as_mut()?;
        status.current_offset += transferred;
        let snapshot = if inner.send_state == SEND_IDLE { inner.status.clone() } else { None };
        inner.send_state = SEND_PENDING;
        snapshot
    }

    /// Drop the record. Returns whether a clearing notification is due.
    pub fn reset(&self) -> bool {
        let mut inner = self.inner.lock();
        let had_status = inner.status.take().is_some();
        inner.send_state = SEND_IDLE;
        had_status
    }

    /// Current snapshot without touching the send state.
    pub fn snapshot(&self) -> Option<TransferStatus> {
        self.inner.lock().status.clone()
    }

    /// The sampling side for the UI thread.
    pub fn handle(&self) -> TransferStatusHandle {
        TransferStatusHandle { inner: self.inner.clone() }
    }
}

/// Concurrent sampling access for the embedder's UI.
#[derive(Clone)]
pub struct TransferStatusHandle {
    inner: Arc<Mutex<StatusInner>>,
}

impl TransferStatusHandle {
    /// Sample the current status. The boolean reports whether the status
    /// changed since the last sample; consuming a pending change re-arms
    /// update notifications.
    pub fn sample(&self) -> Option<(TransferStatus, bool)> {
        let mut inner = self.inner.lock();
        let Some(status) = inner.status.clone() else {
            inner.send_state = SEND_IDLE;
            return None;
        };
        if inner.send_state == SEND_PENDING {
            inner.send_state = SEND_CONSUMED;
            Some((status, true))
        } else {
            inner.send_state = SEND_IDLE;
            Some((status, false))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_before_init_is_ignored() {
        let status = SharedTransferStatus::new();
        assert!(status.update(100).is_none());
        assert!(status.snapshot().is_none());
    }

    #[test]
    fn first_update_yields_a_snapshot_then_throttles() {
        let status = SharedTransferStatus::new();
        status.init(Some(1000), 0, false);

        let first = status.update(10).expect("first update notifies");
        assert_eq!(first.current_offset, 10);

        // Sampler has not consumed the pending notification yet.
        assert!(status.update(10).is_none());
        assert_eq!(status.snapshot().unwrap().current_offset, 20);
    }

    #[test]
    fn sampling_rearms_update_notifications() {
        let status = SharedTransferStatus::new();
        let handle = status.handle();
        status.init(None, 0, true);

        assert!(status.update(5).is_some());
        let (sampled, changed) = handle.sample().unwrap();
        assert!(changed);
        assert_eq!(sampled.current_offset, 5);

        // A second sample without an update reports no change and fully
        // re-arms.
        let (_, changed) = handle.sample().unwrap();
        assert!(!changed);
        assert!(status.update(5).is_some());
    }

    #[test]
    fn reset_clears_and_reports_once() {
        let status = SharedTransferStatus::new();
        assert!(!status.reset());
        status.init(Some(10), 0, false);
        assert!(status.reset());
        assert!(status.snapshot().is_none());
    }

    #[test]
    fn transferred_respects_resume_offset() {
        let status = SharedTransferStatus::new();
        status.init(Some(1000), 400, false);
        status.update(100);
        let snapshot = status.snapshot().unwrap();
        assert_eq!(snapshot.transferred(), 100);
        assert_eq!(snapshot.current_offset, 500);
    }
}

//! Notifications to the embedder and asynchronous user requests.
//!
//! The engine never talks to a UI directly; everything user-visible goes
//! through a [`NotificationSink`]. Async requests (currently the
//! file-exists prompt) carry a monotonically assigned request number so
//! replies can be matched and stale replies dropped.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::command::Command;
use crate::path::RemotePath;
use crate::reply::ReplyCode;
use crate::status::TransferStatus;

/// Severity of a user-visible log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Progress information ("Connecting to ...").
    Status,
    /// A failure the user should see.
    Error,
    /// Diagnostic detail.
    Debug,
}

/// Identifier of one async request, for matching replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// Engine-wide allocator of request numbers.
#[derive(Debug, Clone, Default)]
pub struct RequestIdAllocator {
    next: Arc<AtomicU64>,
}

impl RequestIdAllocator {
    pub fn new() -> RequestIdAllocator {
        RequestIdAllocator::default()
    }

    pub fn next(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// A file-exists prompt sent to the embedder when a transfer target is
/// already present.
#[derive(Debug, Clone)]
pub struct FileExistsRequest {
    pub request_id: RequestId,
    /// Direction of the transfer that hit the collision.
    pub download: bool,
    pub local_file: PathBuf,
    pub remote_file: String,
    pub remote_path: RemotePath,
    pub local_size: Option<u64>,
    pub remote_size: Option<u64>,
    pub local_time: Option<SystemTime>,
    pub remote_time: Option<SystemTime>,
    /// The transfer runs in ASCII (text) mode.
    pub ascii: bool,
    /// Whether a resume makes sense (size of the existing side known).
    pub can_resume: bool,
}

/// The embedder's answer to a [`FileExistsRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileExistsAction {
    /// Transfer anyway.
    Overwrite,
    /// Transfer only if the source is strictly newer than the target.
    OverwriteNewer,
    /// Transfer only if the sizes differ (or are unknown).
    OverwriteSize,
    /// Transfer if either of the two rules above says so.
    OverwriteSizeOrNewer,
    /// Continue the existing file from its current size.
    Resume,
    /// Transfer under a different name.
    Rename(String),
    /// Do nothing; the operation completes successfully.
    Skip,
}

/// Everything the engine reports upward.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A user-visible log line.
    Log(LogLevel, String),
    /// Transfer progress changed; `None` clears the display.
    TransferStatus(Option<TransferStatus>),
    /// A directory listing is available or failed.
    DirectoryListing {
        path: RemotePath,
        modified: bool,
        failed: bool,
    },
    /// An async overwrite prompt; reply through the owning control
    /// socket's `set_file_exists_action`.
    FileExists(FileExistsRequest),
    /// Local directories were created for a download target.
    LocalDirCreated(PathBuf),
}

/// Receives engine notifications. Implementations must be cheap and
/// non-blocking; they are called from the controller thread.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);

    /// A command finished; the embedder may dequeue the next one.
    fn operation_complete(&self, command: Command, code: ReplyCode) {
        let _ = (command, code);
    }
}

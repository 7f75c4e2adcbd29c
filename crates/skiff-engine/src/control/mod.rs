//! Control socket base.
//!
//! A control socket owns one server connection's state machine and
//! mediates every command to that server. The base is protocol-agnostic:
//! it stacks operation records, supervises the command timeout, parks
//! operations on asynchronous user prompts and cache locks, and funnels
//! every completion through [`ControlSocket::reset_operation`]. Protocol
//! dialects plug in through [`Dialect`] and drive the byte stream through
//! [`RealControlSocket`].

pub mod ops;
mod real;

pub use real::{ControlEvent, ProxyBackend, RealControlSocket, Session};

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use skiff_core::constants::WATCHDOG_INTERVAL;
use skiff_core::event::{HandlerId, LoopHandle, TimerId};

use crate::cache::DirectoryCache;
use crate::command::Command;
use crate::encoding::TextCodec;
use crate::lock::{CacheLockManager, LockOwner, LockReason, LockRequest};
use crate::notify::{
    FileExistsAction, FileExistsRequest, LogLevel, Notification, NotificationSink, RequestIdAllocator,
};
use crate::path::RemotePath;
use crate::reply::ReplyCode;
use crate::server::{EncodingPreference, ServerDescriptor};
use crate::status::{SharedTransferStatus, TransferStatusHandle};

use ops::OpData;

/// Protocol-specific command logic, selected over operation tags.
///
/// The defaults mirror an empty dialect: every command is unsupported and
/// an unexpected continuation is an internal error that resets the
/// operation.
pub trait Dialect {
    /// Continue the current operation (after a lock grant, an async reply
    /// or a sub-command completion cleared the way).
    fn send_next_command(&mut self, ctl: &mut ControlSocket) -> ReplyCode;

    /// A pushed sub-operation finished with `code`; advance the parent
    /// record (now on top of the stack).
    fn parse_subcommand_result(&mut self, ctl: &mut ControlSocket, code: ReplyCode) -> ReplyCode;

    fn list(&mut self, _ctl: &mut ControlSocket, _path: Option<RemotePath>) -> ReplyCode {
        ReplyCode::NOT_SUPPORTED
    }

    fn file_transfer(&mut self, _ctl: &mut ControlSocket, _data: ops::FileTransferData) -> ReplyCode {
        ReplyCode::NOT_SUPPORTED
    }

    fn raw_command(&mut self, _ctl: &mut ControlSocket, _command: &str) -> ReplyCode {
        ReplyCode::NOT_SUPPORTED
    }

    fn delete(&mut self, _ctl: &mut ControlSocket, _path: &RemotePath, _files: &[String]) -> ReplyCode {
        ReplyCode::NOT_SUPPORTED
    }

    fn remove_dir(&mut self, _ctl: &mut ControlSocket, _path: &RemotePath, _name: &str) -> ReplyCode {
        ReplyCode::NOT_SUPPORTED
    }

    fn mkdir(&mut self, _ctl: &mut ControlSocket, _path: &RemotePath) -> ReplyCode {
        ReplyCode::NOT_SUPPORTED
    }

    fn rename(&mut self, _ctl: &mut ControlSocket, _from: &RemotePath, _to: &RemotePath) -> ReplyCode {
        ReplyCode::NOT_SUPPORTED
    }

    fn chmod(&mut self, _ctl: &mut ControlSocket, _path: &RemotePath, _mode: u32) -> ReplyCode {
        ReplyCode::NOT_SUPPORTED
    }
}

/// A dialect that implements nothing; unexpected continuations reset the
/// operation with an internal error.
#[derive(Debug, Default)]
pub struct NullDialect;

impl Dialect for NullDialect {
    fn send_next_command(&mut self, ctl: &mut ControlSocket) -> ReplyCode {
        ctl.reset_operation(self, ReplyCode::INTERNAL_ERROR);
        ReplyCode::ERROR
    }

    fn parse_subcommand_result(&mut self, ctl: &mut ControlSocket, _code: ReplyCode) -> ReplyCode {
        ctl.reset_operation(self, ReplyCode::INTERNAL_ERROR);
        ReplyCode::ERROR
    }
}

/// Protocol-agnostic connection state machine.
pub struct ControlSocket {
    handler: HandlerId,
    loop_handle: LoopHandle,
    sink: Arc<dyn NotificationSink>,
    cache: Arc<dyn DirectoryCache>,
    locks: CacheLockManager,
    options: crate::options::EngineOptions,
    requests: RequestIdAllocator,
    lock_owner: LockOwner,

    cur_op: Option<Box<OpData>>,
    server: Option<ServerDescriptor>,
    current_path: Option<RemotePath>,
    invalidate_current_path: bool,
    status: SharedTransferStatus,
    codec: TextCodec,

    stopwatch: Instant,
    timer: Option<TimerId>,
    closed: bool,
}

impl ControlSocket {
    pub fn new(
        handler: HandlerId,
        loop_handle: LoopHandle,
        sink: Arc<dyn NotificationSink>,
        cache: Arc<dyn DirectoryCache>,
        locks: CacheLockManager,
        options: crate::options::EngineOptions,
        requests: RequestIdAllocator,
    ) -> ControlSocket {
        ControlSocket {
            handler,
            loop_handle,
            sink,
            cache,
            locks,
            options,
            requests,
            lock_owner: LockOwner::next(),
            cur_op: None,
            server: None,
            current_path: None,
            invalidate_current_path: false,
            status: SharedTransferStatus::new(),
            codec: TextCodec::new(&EncodingPreference::Auto),
            stopwatch: Instant::now(),
            timer: None,
            closed: false,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn handler(&self) -> HandlerId {
        self.handler
    }

    pub fn lock_owner(&self) -> LockOwner {
        self.lock_owner
    }

    pub fn server(&self) -> Option<&ServerDescriptor> {
        self.server.as_ref()
    }

    pub fn current_path(&self) -> Option<&RemotePath> {
        self.current_path.as_ref()
    }

    pub fn set_current_path(&mut self, path: Option<RemotePath>) {
        self.current_path = path;
    }

    pub fn current_op(&self) -> Option<&OpData> {
        self.cur_op.as_deref()
    }

    pub fn current_op_mut(&mut self) -> Option<&mut OpData> {
        self.cur_op.as_deref_mut()
    }

    /// Command of the operation currently executing.
    pub fn current_command(&self) -> Command {
        self.cur_op.as_ref().map_or(Command::None, |op| op.command)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn transfer_status_handle(&self) -> TransferStatusHandle {
        self.status.handle()
    }

    // =========================================================================
    // Logging
    // =========================================================================

    pub fn log(&self, level: LogLevel, message: String) {
        self.sink.notify(Notification::Log(level, message));
    }

    pub fn log_status(&self, message: String) {
        self.log(LogLevel::Status, message);
    }

    pub fn log_error(&self, message: String) {
        self.log(LogLevel::Error, message);
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Install the server this socket talks to and reset the per-server
    /// negotiation state.
    pub fn attach_server(&mut self, server: ServerDescriptor) {
        self.codec = TextCodec::new(&server.encoding);
        self.server = Some(server);
        self.closed = false;
    }

    /// Tear the connection state down. All paths that end the connection
    /// (peer close, fatal errors, timeouts) funnel through here into
    /// [`ControlSocket::reset_operation`].
    pub fn do_close(&mut self, dialect: &mut dyn Dialect, code: ReplyCode) -> ReplyCode {
        tracing::debug!(code = ?code, "do_close");
        if self.closed {
            debug_assert!(self.cur_op.is_none());
            return code;
        }
        self.closed = true;

        let code = self.reset_operation(dialect, ReplyCode::ERROR | ReplyCode::DISCONNECTED | code);
        self.server = None;
        code
    }

    /// User-requested disconnect.
    pub fn disconnect(&mut self, dialect: &mut dyn Dialect) -> ReplyCode {
        self.log_status("Disconnected from server".into());
        self.do_close(dialect, ReplyCode::DISCONNECTED);
        ReplyCode::OK
    }

    /// Cancel whatever is in flight. A connect in progress tears the
    /// connection down; anything else fails just the operation.
    pub fn cancel(&mut self, dialect: &mut dyn Dialect) {
        if self.current_command() == Command::None {
            return;
        }
        if self.current_command() == Command::Connect {
            self.do_close(dialect, ReplyCode::CANCELED);
        } else {
            self.reset_operation(dialect, ReplyCode::CANCELED);
        }
    }

    // =========================================================================
    // Operation stack
    // =========================================================================

    /// Push a sub-operation on top of the current record.
    pub fn push_op(&mut self, mut op: Box<OpData>) {
        op.next = self.cur_op.take();
        self.cur_op = Some(op);
    }

    /// Install a fresh top-level operation.
    pub fn start_op(&mut self, op: Box<OpData>) {
        debug_assert!(self.cur_op.is_none(), "operation already in progress");
        self.cur_op = Some(op);
        self.set_wait(true);
    }

    /// The single convergence point for operation completion.
    ///
    /// Releases a held cache lock, pops sub-operations (letting the
    /// parent advance on clean codes), logs the per-command user message,
    /// destroys the record, clears transfer status, applies deferred
    /// working-directory invalidation and reports completion upward.
    pub fn reset_operation(&mut self, dialect: &mut dyn Dialect, code: ReplyCode) -> ReplyCode {
        tracing::debug!(code = ?code, "reset_operation");
        if code.would_block() {
            tracing::warn!(code = ?code, "reset_operation with WOULD_BLOCK in code");
        }

        if self.cur_op.as_ref().is_some_and(|op| op.holds_lock) {
            self.unlock_cache();
        }

        if self.cur_op.as_ref().is_some_and(|op| op.next.is_some()) {
            let mut finished = self.cur_op.take().expect("checked above");
            self.cur_op = finished.next.take();
            drop(finished);
            if code == ReplyCode::OK || code == ReplyCode::ERROR || code == ReplyCode::CRITICAL_ERROR {
                return dialect.parse_subcommand_result(self, code);
            }
            return self.reset_operation(dialect, code);
        }

        let command = self.current_command();
        let prefix_critical =
            code.contains(ReplyCode::CRITICAL_ERROR) && command != Command::Transfer;
        let prefix = if prefix_critical { "Critical error: " } else { "" };

        if let Some(op) = self.cur_op.take() {
            match op.command {
                Command::None => {
                    if prefix_critical {
                        self.log_error("Critical error".into());
                    }
                }
                Command::Connect => {
                    if code.contains(ReplyCode::CANCELED) {
                        self.log_error(format!("{}Connection attempt interrupted by user", prefix));
                    } else if code != ReplyCode::OK {
                        self.log_error(format!("{}Could not connect to server", prefix));
                    }
                }
                Command::List => {
                    if code.contains(ReplyCode::CANCELED) {
                        self.log_error(format!("{}Directory listing aborted by user", prefix));
                    } else if code != ReplyCode::OK {
                        self.log_error(format!("{}Failed to retrieve directory listing", prefix));
                    } else {
                        self.log_status("Directory listing successful".into());
                    }
                }
                Command::Transfer => {
                    if let Some(data) = op.transfer_data() {
                        if !data.download && data.transfer_initiated {
                            match &self.server {
                                None => tracing::warn!("transfer completed without a current server"),
                                Some(server) => {
                                    let size = if code == ReplyCode::OK { data.local_size } else { None };
                                    let updated = self.cache.update_file(
                                        &server.key(),
                                        &data.remote_path,
                                        &data.remote_file,
                                        size,
                                    );
                                    if updated {
                                        self.sink.notify(Notification::DirectoryListing {
                                            path: data.remote_path.clone(),
                                            modified: true,
                                            failed: false,
                                        });
                                    }
                                }
                            }
                        }
                        self.log_transfer_result(code, data);
                    }
                }
                _ => {
                    if code.contains(ReplyCode::CANCELED) {
                        self.log_error(format!("{}Interrupted by user", prefix));
                    }
                }
            }
        }

        self.reset_transfer_status();
        self.set_wait(false);

        if self.invalidate_current_path {
            self.current_path = None;
            self.invalidate_current_path = false;
        }

        self.sink.operation_complete(command, code);
        code
    }

    fn log_transfer_result(&self, code: ReplyCode, data: &ops::FileTransferData) {
        let snapshot = self.status.snapshot();
        match snapshot {
            Some(status) if code == ReplyCode::OK || status.made_progress => {
                let elapsed = status.elapsed().unwrap_or_default().as_secs().max(1);
                let time = if elapsed == 1 {
                    "1 second".to_string()
                } else {
                    format!("{} seconds", elapsed)
                };
                let size = format!("{} bytes", status.transferred());
                if code == ReplyCode::OK {
                    self.log_status(format!("File transfer successful, transferred {} in {}", size, time));
                } else if code.contains(ReplyCode::CANCELED) {
                    self.log_error(format!(
                        "File transfer aborted by user after transferring {} in {}",
                        size, time
                    ));
                } else if code.contains(ReplyCode::CRITICAL_ERROR) {
                    self.log_error(format!(
                        "Critical file transfer error after transferring {} in {}",
                        size, time
                    ));
                } else {
                    self.log_error(format!("File transfer failed after transferring {} in {}", size, time));
                }
            }
            _ => {
                if code.contains(ReplyCode::CANCELED) {
                    self.log_error("File transfer aborted by user".into());
                } else if code == ReplyCode::OK {
                    if data.transfer_initiated {
                        self.log_status("File transfer successful".into());
                    } else {
                        self.log_status("File transfer skipped".into());
                    }
                } else if code.contains(ReplyCode::CRITICAL_ERROR) {
                    self.log_error("Critical file transfer error".into());
                } else {
                    self.log_error("File transfer failed".into());
                }
            }
        }
    }

    // =========================================================================
    // Timeout watchdog
    // =========================================================================

    /// Start or stop the 1-second watchdog around an operation.
    pub fn set_wait(&mut self, wait: bool) {
        if wait {
            if self.timer.is_some() {
                return;
            }
            self.stopwatch = Instant::now();
            self.timer = Some(self.loop_handle.add_timer(self.handler, WATCHDOG_INTERVAL, false));
        } else if let Some(timer) = self.timer.take() {
            self.loop_handle.stop_timer(timer);
        }
    }

    /// Any byte sent or received restarts the timeout stopwatch.
    pub fn set_alive(&mut self) {
        self.stopwatch = Instant::now();
    }

    /// Whether the watchdog should fire now. Suppressed while parked on
    /// an async request or queued on a cache lock.
    pub fn watchdog_expired(&self) -> bool {
        let timeout = self.options.timeout_secs;
        if timeout == 0 {
            return false;
        }
        if self.cur_op.as_ref().is_some_and(|op| op.wait_for_async_request) {
            return false;
        }
        if self.locks.is_waiting(self.lock_owner) {
            return false;
        }
        self.stopwatch.elapsed() > Duration::from_secs(timeout)
    }

    pub(crate) fn timer_matches(&self, timer: TimerId) -> bool {
        self.timer == Some(timer)
    }

    /// Watchdog tick for base-only use; [`RealControlSocket`] has its own
    /// that also resets the socket.
    pub fn on_timer(&mut self, dialect: &mut dyn Dialect, timer: TimerId) {
        if self.timer != Some(timer) {
            return;
        }
        if self.watchdog_expired() {
            self.log_error("Connection timed out".into());
            self.do_close(dialect, ReplyCode::TIMEOUT);
        }
    }

    // =========================================================================
    // Transfer status
    // =========================================================================

    pub fn init_transfer_status(&mut self, total_size: Option<u64>, start_offset: u64, is_listing: bool) {
        self.status.init(total_size, start_offset, is_listing);
    }

    pub fn set_transfer_status_start_time(&mut self) {
        self.status.set_start_time();
    }

    pub fn set_transfer_status_made_progress(&mut self) {
        self.status.set_made_progress();
    }

    pub fn update_transfer_status(&mut self, transferred: u64) {
        if let Some(snapshot) = self.status.update(transferred) {
            self.sink.notify(Notification::TransferStatus(Some(snapshot)));
        }
    }

    pub fn reset_transfer_status(&mut self) {
        self.status.reset();
        self.sink.notify(Notification::TransferStatus(None));
    }

    // =========================================================================
    // Cache locks
    // =========================================================================

    /// Request the cache lock for this operation. On `false` the
    /// operation must park until the obtain-lock event arrives.
    pub fn try_lock_cache(&mut self, reason: LockReason, directory: &RemotePath) -> bool {
        let Some(server) = self.server.as_ref() else {
            tracing::warn!("try_lock_cache without a current server");
            return false;
        };
        let Some(op) = self.cur_op.as_deref_mut() else {
            tracing::warn!("try_lock_cache without an operation");
            return false;
        };
        let granted = self.locks.try_lock(
            self.lock_owner,
            self.handler,
            &server.key(),
            directory,
            reason,
            op.holds_lock,
        );
        // Set in every case so reset_operation unlocks or abandons the
        // queued wait.
        op.holds_lock = true;
        granted == LockRequest::Granted
    }

    /// Release the current operation's hold, waking the next same-keyed
    /// waiter when the entry goes away.
    pub fn unlock_cache(&mut self) {
        let Some(op) = self.cur_op.as_deref_mut() else {
            return;
        };
        if !op.holds_lock {
            return;
        }
        op.holds_lock = false;
        self.locks.unlock(self.lock_owner);
    }

    /// React to an obtain-lock event. If this socket is now first in line
    /// the operation resumes and keeps the lock until
    /// [`ControlSocket::reset_operation`] releases it; a stale wake (lost
    /// race) keeps waiting.
    pub fn on_obtain_lock(&mut self, dialect: &mut dyn Dialect) {
        if self.locks.obtain_from_event(self.lock_owner).is_none() {
            return;
        }
        dialect.send_next_command(self);
    }

    pub fn is_waiting_for_lock(&self) -> bool {
        self.locks.is_waiting(self.lock_owner)
    }

    // =========================================================================
    // Async requests and the overwrite decision
    // =========================================================================

    /// Park the current operation on an async request and hand it to the
    /// embedder.
    pub fn send_async_request(&mut self, mut request: FileExistsRequest) {
        request.request_id = self.requests.next();
        if let Some(op) = self.cur_op.as_deref_mut() {
            op.wait_for_async_request = true;
        }
        self.sink.notify(Notification::FileExists(request));
    }

    /// Decide whether a transfer may proceed against an existing target.
    ///
    /// Returns `OK` when no collision exists, `WOULD_BLOCK` after
    /// dispatching a file-exists prompt, `ERROR` on an internal invariant
    /// violation.
    pub fn check_overwrite_file(&mut self, dialect: &mut dyn Dialect) -> ReplyCode {
        let invalid_op = self
            .cur_op
            .as_ref()
            .is_none_or(|op| op.transfer_data().is_none());
        if invalid_op {
            tracing::debug!("check_overwrite_file without a transfer operation");
            self.reset_operation(dialect, ReplyCode::INTERNAL_ERROR);
            return ReplyCode::ERROR;
        }
        let Some(server) = self.server.clone() else {
            tracing::debug!("check_overwrite_file without a current server");
            self.reset_operation(dialect, ReplyCode::INTERNAL_ERROR);
            return ReplyCode::ERROR;
        };

        let data = self
            .cur_op
            .as_ref()
            .and_then(|op| op.transfer_data())
            .expect("checked above");

        if data.download && !data.local_file.exists() {
            return ReplyCode::OK;
        }

        let lookup_path = if data.try_absolute_path || self.current_path.is_none() {
            data.remote_path.clone()
        } else {
            self.current_path.clone().expect("checked above")
        };
        // Case-insensitive hits are advisory only; ignore them.
        let found = self
            .cache
            .lookup_file(&server.key(), &lookup_path, &data.remote_file)
            .filter(|lookup| lookup.matched_case);

        if !data.download && found.is_none() && data.remote_size.is_none() && data.remote_time.is_none() {
            return ReplyCode::OK;
        }

        let local_time = std::fs::metadata(&data.local_file)
            .ok()
            .and_then(|meta| meta.modified().ok());
        let mut remote_time = data.remote_time;
        if remote_time.is_none() {
            if let Some(lookup) = &found {
                remote_time = lookup.entry.time;
            }
        }
        let can_resume = if data.download {
            data.local_size.is_some()
        } else {
            data.remote_size.is_some()
        };

        let request = FileExistsRequest {
            request_id: crate::notify::RequestId(0), // assigned on dispatch
            download: data.download,
            local_file: data.local_file.clone(),
            remote_file: data.remote_file.clone(),
            remote_path: data.remote_path.clone(),
            local_size: data.local_size,
            remote_size: data.remote_size,
            local_time,
            remote_time,
            ascii: data.ascii,
            can_resume,
        };

        // Persist the backfilled remote time on the record so later
        // decisions see it.
        if let Some(data) = self.cur_op.as_deref_mut().and_then(|op| op.transfer_data_mut()) {
            data.remote_time = remote_time;
        }

        self.send_async_request(request);
        ReplyCode::WOULD_BLOCK
    }

    fn log_skip(&self, data: &ops::FileTransferData) {
        if data.download {
            let filename = data.remote_path.format_filename(&data.remote_file);
            self.log_status(format!("Skipping download of {}", filename));
        } else {
            self.log_status(format!("Skipping upload of {}", data.local_file.display()));
        }
    }

    /// Apply the embedder's reply to a file-exists prompt. Actions are
    /// interpreted in terms of the transfer direction recorded in the
    /// request. Returns whether the reply was accepted.
    pub fn set_file_exists_action(
        &mut self,
        dialect: &mut dyn Dialect,
        request: &FileExistsRequest,
        action: FileExistsAction,
    ) -> bool {
        let valid = self
            .cur_op
            .as_ref()
            .is_some_and(|op| op.command == Command::Transfer);
        if !valid {
            tracing::debug!(
                request = request.request_id.0,
                "no or invalid operation in progress, ignoring request reply"
            );
            return false;
        }
        if let Some(op) = self.cur_op.as_deref_mut() {
            op.wait_for_async_request = false;
        }

        let data = self
            .cur_op
            .as_ref()
            .and_then(|op| op.transfer_data())
            .cloned()
            .expect("transfer op checked above");

        match action {
            FileExistsAction::Overwrite => {
                dialect.send_next_command(self);
            }
            FileExistsAction::OverwriteNewer => {
                if Self::source_is_newer(request).unwrap_or(true) {
                    dialect.send_next_command(self);
                } else {
                    self.log_skip(&data);
                    self.reset_operation(dialect, ReplyCode::OK);
                }
            }
            FileExistsAction::OverwriteSize => {
                if Self::sizes_differ(request) {
                    dialect.send_next_command(self);
                } else {
                    self.log_skip(&data);
                    self.reset_operation(dialect, ReplyCode::OK);
                }
            }
            FileExistsAction::OverwriteSizeOrNewer => {
                let proceed = match Self::source_is_newer(request) {
                    // Unknown times always proceed.
                    None => true,
                    Some(newer) => Self::sizes_differ(request) || newer,
                };
                if proceed {
                    dialect.send_next_command(self);
                } else {
                    self.log_skip(&data);
                    self.reset_operation(dialect, ReplyCode::OK);
                }
            }
            FileExistsAction::Resume => {
                if let Some(data) = self.cur_op.as_deref_mut().and_then(|op| op.transfer_data_mut()) {
                    if data.download && data.local_size.is_some() {
                        data.resume = true;
                    } else if !data.download && data.remote_size.is_some() {
                        data.resume = true;
                    }
                }
                dialect.send_next_command(self);
            }
            FileExistsAction::Rename(new_name) => {
                self.apply_rename(dialect, new_name);
            }
            FileExistsAction::Skip => {
                self.log_skip(&data);
                self.reset_operation(dialect, ReplyCode::OK);
            }
        }
        true
    }

    /// `Some(true)` when the transfer source is strictly newer than the
    /// target; `None` when either timestamp is unknown.
    fn source_is_newer(request: &FileExistsRequest) -> Option<bool> {
        let local = request.local_time?;
        let remote = request.remote_time?;
        Some(if request.download { local < remote } else { local > remote })
    }

    /// Sizes differ, or are unknown (then a transfer is the only way to
    /// find out).
    fn sizes_differ(request: &FileExistsRequest) -> bool {
        request.local_size.is_none() || request.local_size != request.remote_size
    }

    fn apply_rename(&mut self, dialect: &mut dyn Dialect, new_name: String) {
        let download = self
            .cur_op
            .as_ref()
            .and_then(|op| op.transfer_data())
            .map(|data| data.download)
            .expect("transfer op checked by caller");

        if download {
            if let Some(data) = self.cur_op.as_deref_mut().and_then(|op| op.transfer_data_mut()) {
                data.local_file.set_file_name(&new_name);
                data.local_size = std::fs::metadata(&data.local_file)
                    .ok()
                    .filter(|meta| meta.is_file())
                    .map(|meta| meta.len());
            }
            if self.check_overwrite_file(dialect) == ReplyCode::OK {
                dialect.send_next_command(self);
            }
        } else {
            let (lookup_path, server_key) = {
                let data = self
                    .cur_op
                    .as_ref()
                    .and_then(|op| op.transfer_data())
                    .expect("transfer op checked by caller");
                let path = if data.try_absolute_path || self.current_path.is_none() {
                    data.remote_path.clone()
                } else {
                    self.current_path.clone().expect("checked above")
                };
                let Some(server) = self.server.as_ref() else {
                    tracing::warn!("rename reply without a current server");
                    return;
                };
                (path, server.key())
            };

            let found = self
                .cache
                .lookup_file(&server_key, &lookup_path, &new_name)
                .filter(|lookup| lookup.matched_case);

            if let Some(data) = self.cur_op.as_deref_mut().and_then(|op| op.transfer_data_mut()) {
                data.remote_file = new_name;
                match &found {
                    Some(lookup) => {
                        data.remote_size = lookup.entry.size;
                        if lookup.entry.time.is_some() {
                            data.remote_time = lookup.entry.time;
                        }
                    }
                    None => {
                        data.remote_size = None;
                        data.remote_time = None;
                    }
                }
            }

            // A known target under the new name re-runs the prompt.
            if found.is_some() && self.check_overwrite_file(dialect) != ReplyCode::OK {
                return;
            }
            dialect.send_next_command(self);
        }
    }

    // =========================================================================
    // Paths
    // =========================================================================

    /// Extract a working directory from a server PWD-style reply.
    ///
    /// Prefers the substring between the first and last double quote
    /// (un-escaping doubled quotes), falls back to single quotes, then to
    /// the first whitespace-delimited token. A supplied default rescues
    /// parse failures.
    pub fn parse_pwd_reply(&mut self, reply: &str, unquoted: bool, default_path: Option<RemotePath>) -> bool {
        let mut extracted = reply.to_string();
        if !unquoted {
            let mut span = match (reply.find('"'), reply.rfind('"')) {
                (Some(first), Some(last)) if first < last => Some((first, last)),
                _ => None,
            };
            if span.is_none() {
                if let (Some(first), Some(last)) = (reply.find('\''), reply.rfind('\'')) {
                    if first < last {
                        tracing::debug!("broken server sending single-quoted path instead of double-quoted path");
                        span = Some((first, last));
                    }
                }
            }
            match span {
                Some((first, last)) => {
                    extracted = reply[first + 1..last].replace("\"\"", "\"");
                }
                None => {
                    tracing::debug!("broken server, no quoted path found in pwd reply, trying first token as path");
                    extracted = match reply.find(' ') {
                        Some(pos) => {
                            let rest = &reply[pos + 1..];
                            match rest.find(' ') {
                                Some(end) => rest[..end].to_string(),
                                None => rest.to_string(),
                            }
                        }
                        None => String::new(),
                    };
                }
            }
        }

        let kind = self.server.as_ref().map(|server| server.kind).unwrap_or_default();
        let parsed = if extracted.is_empty() {
            None
        } else {
            RemotePath::parse(kind, &extracted)
        };

        match parsed {
            Some(path) => {
                self.current_path = Some(path);
                true
            }
            None => {
                if extracted.is_empty() {
                    self.log_error("Server returned empty path.".into());
                } else {
                    self.log_error("Failed to parse returned path.".into());
                }
                if let Some(default) = default_path {
                    tracing::debug!(path = %default, "assuming default path");
                    self.current_path = Some(default);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Schedule the working directory for invalidation when `path` covers
    /// it. Applied lazily at operation completion so an in-flight
    /// operation keeps a stable view.
    pub fn invalidate_current_working_dir(&mut self, path: &RemotePath) {
        let Some(current) = self.current_path.as_ref() else {
            return;
        };
        if current == path || path.is_parent_of(current, false) {
            if self.cur_op.is_some() {
                self.invalidate_current_path = true;
            } else {
                self.current_path = None;
            }
        }
    }

    /// Create the missing local directories for a download target,
    /// reporting the deepest directory that was created.
    pub fn create_local_dir(&self, local_file: &Path) {
        let Some(dir) = local_file.parent() else {
            return;
        };
        if dir.as_os_str().is_empty() || dir.exists() {
            return;
        }

        // Only walk back as far as needed instead of starting at the
        // filesystem root.
        let mut missing: Vec<std::ffi::OsString> = Vec::new();
        let mut cursor = dir.to_path_buf();
        while !cursor.exists() {
            let Some(name) = cursor.file_name().map(|name| name.to_os_string()) else {
                break;
            };
            missing.insert(0, name);
            if !cursor.pop() {
                break;
            }
        }

        let mut last_successful: Option<std::path::PathBuf> = None;
        for segment in missing {
            cursor.push(segment);
            match std::fs::create_dir(&cursor) {
                Ok(()) => last_successful = Some(cursor.clone()),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    last_successful = Some(cursor.clone())
                }
                Err(_) => break,
            }
        }

        if let Some(created) = last_successful {
            self.sink.notify(Notification::LocalDirCreated(created));
        }
    }

    // =========================================================================
    // Text encoding and host names
    // =========================================================================

    /// Decode server bytes, logging the one-time UTF-8 fallback notice.
    pub fn decode_server_text(&mut self, bytes: &[u8]) -> String {
        let decoded = self.codec.decode(bytes);
        if decoded.utf8_disabled {
            self.log_status(
                "Invalid character sequence received, disabling UTF-8. Select UTF-8 option in site manager to force UTF-8."
                    .into(),
            );
        }
        decoded.text
    }

    /// Encode text for the server; `force_utf8` overrides a disabled
    /// UTF-8 for this call.
    pub fn encode_server_text(&self, text: &str, force_utf8: bool) -> Vec<u8> {
        self.codec.encode(text, force_utf8)
    }

    pub fn utf8_enabled(&self) -> bool {
        self.codec.utf8_enabled()
    }

    /// IDN-map a host name to ASCII; warns and keeps the original on
    /// failure.
    pub fn convert_domain_name(&self, domain: &str) -> String {
        match idna::domain_to_ascii(domain) {
            Ok(ascii) if !ascii.is_empty() => ascii,
            _ => {
                tracing::warn!(domain, "could not convert domain name");
                domain.to_string()
            }
        }
    }

    pub(crate) fn options(&self) -> &crate::options::EngineOptions {
        &self.options
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        // No entry may outlive its socket: release held or queued locks
        // and wake successors.
        self.locks.release_all_for(self.lock_owner);
        if let Some(timer) = self.timer.take() {
            self.loop_handle.stop_timer(timer);
        }
    }
}


//! Shared test fakes for the skiff engine crates.
//!
//! Provides a recording notification sink, a scripted directory cache
//! and a small engine fixture so tests can assemble a control socket in
//! a couple of lines.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use skiff_core::event::EventLoop;
use skiff_engine::{
    CacheLockManager, CacheLookup, Command, ControlSocket, Direntry, DirectoryCache, EngineOptions,
    FileExistsRequest, LogLevel, Notification, NotificationSink, RemotePath, ReplyCode,
    RequestIdAllocator, ServerKey,
};

// =============================================================================
// Recording sink
// =============================================================================

/// Captures every notification and operation completion for assertions.
#[derive(Default)]
pub struct RecordingSink {
    notifications: Mutex<Vec<Notification>>,
    completions: Mutex<Vec<(Command, ReplyCode)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<RecordingSink> {
        Arc::new(RecordingSink::default())
    }

    /// All captured notifications, in order.
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    /// Captured log lines as (level, message) pairs.
    pub fn logs(&self) -> Vec<(LogLevel, String)> {
        self.notifications
            .lock()
            .iter()
            .filter_map(|notification| match notification {
                Notification::Log(level, message) => Some((*level, message.clone())),
                _ => None,
            })
            .collect()
    }

    /// Whether any log line contains `needle`.
    pub fn logged(&self, needle: &str) -> bool {
        self.logs().iter().any(|(_, message)| message.contains(needle))
    }

    /// Captured file-exists prompts.
    pub fn file_exists_requests(&self) -> Vec<FileExistsRequest> {
        self.notifications
            .lock()
            .iter()
            .filter_map(|notification| match notification {
                Notification::FileExists(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    /// Captured operation completions.
    pub fn completions(&self) -> Vec<(Command, ReplyCode)> {
        self.completions.lock().clone()
    }

    pub fn clear(&self) {
        self.notifications.lock().clear();
        self.completions.lock().clear();
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: Notification) {
        self.notifications.lock().push(notification);
    }

    fn operation_complete(&self, command: Command, code: ReplyCode) {
        self.completions.lock().push((command, code));
    }
}

// =============================================================================
// Scripted directory cache
// =============================================================================

type CacheKey = (ServerKey, String, String);

/// A directory cache preloaded by the test.
#[derive(Default)]
pub struct ScriptedCache {
    entries: Mutex<HashMap<CacheKey, CacheLookup>>,
    updates: Mutex<Vec<(String, String, Option<u64>)>>,
}

impl ScriptedCache {
    pub fn new() -> Arc<ScriptedCache> {
        Arc::new(ScriptedCache::default())
    }

    /// Script a lookup hit for `name` in `path`.
    pub fn add(
        &self,
        server: &ServerKey,
        path: &RemotePath,
        entry: Direntry,
        matched_case: bool,
    ) {
        let key = (server.clone(), path.to_string(), entry.name.clone());
        self.entries.lock().insert(key, CacheLookup { entry, matched_case });
    }

    /// Upload completions recorded through `update_file`.
    pub fn updates(&self) -> Vec<(String, String, Option<u64>)> {
        self.updates.lock().clone()
    }
}

impl DirectoryCache for ScriptedCache {
    fn lookup_file(&self, server: &ServerKey, path: &RemotePath, name: &str) -> Option<CacheLookup> {
        let key = (server.clone(), path.to_string(), name.to_string());
        self.entries.lock().get(&key).cloned()
    }

    fn update_file(
        &self,
        _server: &ServerKey,
        path: &RemotePath,
        name: &str,
        size: Option<u64>,
    ) -> bool {
        self.updates.lock().push((path.to_string(), name.to_string(), size));
        true
    }
}

// =============================================================================
// Counting dialect
// =============================================================================

/// A dialect that records continuation callbacks instead of running a
/// protocol. `parse_subcommand_result` finishes the parent with the
/// sub-result, the most common real-dialect behavior.
#[derive(Default)]
pub struct CountingDialect {
    pub send_next: usize,
    pub parse_results: Vec<ReplyCode>,
}

impl skiff_engine::Dialect for CountingDialect {
    fn send_next_command(&mut self, _ctl: &mut ControlSocket) -> ReplyCode {
        self.send_next += 1;
        ReplyCode::WOULD_BLOCK
    }

    fn parse_subcommand_result(&mut self, ctl: &mut ControlSocket, code: ReplyCode) -> ReplyCode {
        self.parse_results.push(code);
        ctl.reset_operation(self, code)
    }
}

// =============================================================================
// Engine fixture
// =============================================================================

/// One event loop plus the shared engine collaborators.
pub struct EngineFixture {
    pub el: EventLoop,
    pub sink: Arc<RecordingSink>,
    pub cache: Arc<ScriptedCache>,
    pub locks: CacheLockManager,
    pub requests: RequestIdAllocator,
}

impl EngineFixture {
    pub fn new() -> EngineFixture {
        let el = EventLoop::new();
        let locks = CacheLockManager::new(el.handle());
        EngineFixture {
            el,
            sink: RecordingSink::new(),
            cache: ScriptedCache::new(),
            locks,
            requests: RequestIdAllocator::new(),
        }
    }

    /// Assemble a control socket with a fresh handler id.
    pub fn control_socket(&mut self, options: EngineOptions) -> ControlSocket {
        let handler = self.el.allocate_handler();
        ControlSocket::new(
            handler,
            self.el.handle(),
            self.sink.clone(),
            self.cache.clone(),
            self.locks.clone(),
            options,
            self.requests.clone(),
        )
    }
}

impl Default for EngineFixture {
    fn default() -> Self {
        Self::new()
    }
}

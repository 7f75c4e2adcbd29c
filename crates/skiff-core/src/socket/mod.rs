//! Non-blocking TCP socket with a dedicated worker thread.
//!
//! State machine: `Idle` → `Connecting` → `Connected` → `Closing` →
//! `Closed`, or `Idle` → `Listening`. Connection and readiness outcomes
//! arrive as [`SocketEvent`]s through the dispatcher; the byte calls
//! (`read`, `peek`, `write`) never block and report `EAGAIN` when the
//! caller must wait for the next readiness event.
//!
//! Error codes follow the POSIX socket functions; see [`SysError`].

pub(crate) mod sys;
mod worker;

use std::ffi::CString;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use libc::c_int;
use parking_lot::Mutex;

use crate::constants::{LISTEN_BACKLOG, WORKER_DETACH_GRACE, WORKER_THREAD_NAME};
use crate::error::SysError;
use crate::event::{HandlerId, SocketEventDispatcher, SourceId};

use worker::{Shared, WAIT_ACCEPT, WAIT_READ, WAIT_WRITE};

// =============================================================================
// Event types
// =============================================================================

/// What happened on a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEventKind {
    /// A host name resolved to this address; a connection attempt to it
    /// is starting.
    HostAddress(String),
    /// A connection attempt failed but further addresses remain. Nonfatal.
    ConnectionNext(SysError),
    /// The connection attempt finished (`SysError::NONE` on success), or
    /// an incoming connection is ready to accept on a listening socket.
    Connection(SysError),
    /// Bytes are ready to read.
    Read(SysError),
    /// The socket accepts writes again.
    Write(SysError),
    /// The connection closed. Never delivered while readable bytes remain
    /// undelivered.
    Close(SysError),
}

/// A socket event queued in the dispatcher.
#[derive(Debug)]
pub struct SocketEvent {
    pub source: SourceId,
    pub handler: HandlerId,
    pub kind: SocketEventKind,
}

impl SocketEvent {
    pub fn new(source: SourceId, handler: HandlerId, kind: SocketEventKind) -> SocketEvent {
        SocketEvent { source, handler, kind }
    }
}

// =============================================================================
// Socket state and options
// =============================================================================

/// Connection state of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Not yet used, or reset after a failed connect.
    Idle,
    /// Bound and accepting; connection events announce peers.
    Listening,
    /// Resolution or connect in progress.
    Connecting,
    /// Read/write events may be delivered.
    Connected,
    /// Peer sent FIN; a close event is pending or delivered.
    Closing,
    /// Fully closed by the owner.
    Closed,
}

/// Address family selector for connect and listen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    #[default]
    Unspec,
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    fn to_raw(self) -> c_int {
        match self {
            AddressFamily::Unspec => libc::AF_UNSPEC,
            AddressFamily::Ipv4 => libc::AF_INET,
            AddressFamily::Ipv6 => libc::AF_INET6,
        }
    }

    fn from_raw(raw: c_int) -> AddressFamily {
        match raw {
            libc::AF_INET => AddressFamily::Ipv4,
            libc::AF_INET6 => AddressFamily::Ipv6,
            _ => AddressFamily::Unspec,
        }
    }
}

/// TCP-level option flags, applied immediately when a descriptor exists
/// and inherited by descriptors created later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SocketFlags(u8);

impl SocketFlags {
    pub const NODELAY: SocketFlags = SocketFlags(0x01);
    pub const KEEPALIVE: SocketFlags = SocketFlags(0x02);

    pub fn empty() -> SocketFlags {
        SocketFlags(0)
    }

    pub fn with(self, other: SocketFlags) -> SocketFlags {
        SocketFlags(self.0 | other.0)
    }

    pub fn nodelay(self) -> bool {
        self.0 & Self::NODELAY.0 != 0
    }

    pub fn keepalive(self) -> bool {
        self.0 & Self::KEEPALIVE.0 != 0
    }
}

// =============================================================================
// Reaper
// =============================================================================

/// Workers abandoned mid-blocking-call, waiting to be joined.
static REAPER: Mutex<Vec<JoinHandle<()>>> = Mutex::new(Vec::new());

fn park_in_reaper(handle: JoinHandle<()>) {
    REAPER.lock().push(handle);
}

/// Join every detached worker that has since finished. Returns how many
/// are still running.
pub fn reap_finished() -> usize {
    let mut reaper = REAPER.lock();
    let mut idx = 0;
    while idx < reaper.len() {
        if reaper[idx].is_finished() {
            let handle = reaper.swap_remove(idx);
            let _ = handle.join();
        } else {
            idx += 1;
        }
    }
    reaper.len()
}

/// Join every detached worker, blocking until each finishes.
pub fn reap_all() {
    let handles: Vec<_> = std::mem::take(&mut *REAPER.lock());
    for handle in handles {
        let _ = handle.join();
    }
}

#[cfg(test)]
pub(crate) fn reaper_len() -> usize {
    REAPER.lock().len()
}

// =============================================================================
// Socket
// =============================================================================

/// A non-blocking TCP socket bound to an event dispatcher.
pub struct Socket {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    dispatcher: Arc<SocketEventDispatcher>,
    peer_host: String,
    peer_port: u16,
}

impl Socket {
    /// Create an idle socket. Events go to `handler` once one is set.
    pub fn new(dispatcher: Arc<SocketEventDispatcher>, handler: Option<HandlerId>) -> Socket {
        let id = SourceId::next();
        Socket {
            shared: Arc::new(Shared::new(
                id,
                dispatcher.clone(),
                handler,
                SocketFlags::empty(),
                [-1, -1],
            )),
            thread: None,
            dispatcher,
            peer_host: String::new(),
            peer_port: 0,
        }
    }

    /// Stable id of this socket as an event source.
    pub fn source_id(&self) -> SourceId {
        self.shared.id
    }

    /// Current connection state.
    pub fn state(&self) -> SocketState {
        self.shared.inner.lock().state
    }

    /// The host name passed to the last `connect`.
    pub fn peer_host(&self) -> &str {
        &self.peer_host
    }

    /// Connect to the given host (name or literal address). Returns
    /// immediately; the outcome arrives as events: `HostAddress` per
    /// resolved address, `ConnectionNext` for each failed address with a
    /// successor, then `Connection` for success or the final failure.
    pub fn connect(&mut self, host: &str, port: u16, family: AddressFamily) -> Result<(), SysError> {
        {
            let inner = self.shared.inner.lock();
            if inner.state != SocketState::Idle && inner.state != SocketState::Closed {
                return Err(SysError(libc::EISCONN));
            }
        }
        if port == 0 {
            return Err(SysError(libc::EINVAL));
        }
        let c_host = CString::new(host).map_err(|_| SysError(libc::EINVAL))?;
        let c_port = CString::new(port.to_string()).expect("port string has no NUL");

        // A running worker must be parked before it can take a new
        // request; a worker stuck in a blocking call is detached instead.
        if self.thread.is_some() {
            let parked = {
                let mut inner = self.shared.inner.lock();
                if !inner.threadwait {
                    self.shared.wakeup(&mut inner);
                }
                inner.threadwait
            };
            if !parked {
                thread::sleep(WORKER_DETACH_GRACE);
                let still_busy = !self.shared.inner.lock().threadwait;
                if still_busy {
                    self.detach_worker();
                }
            }
        }

        self.ensure_worker()?;

        let mut inner = self.shared.inner.lock();
        inner.state = SocketState::Connecting;
        inner.family = family.to_raw();
        inner.host = Some(c_host);
        inner.port = Some(c_port);
        inner.waiting = 0;
        inner.read_suppressed = false;
        self.shared.wakeup(&mut inner);
        drop(inner);

        self.peer_host = host.to_string();
        self.peer_port = port;
        Ok(())
    }

    /// Read bytes. `Ok(0)` is orderly end-of-stream. `EAGAIN` re-arms the
    /// worker's read interest; wait for the next `Read` event.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, SysError> {
        let fd = self.shared.inner.lock().fd;
        if fd == -1 {
            return Err(SysError(libc::ENOTCONN));
        }
        match sys::recv(fd, buf, false) {
            Ok(0) => {
                // Orderly end-of-stream: let the worker re-inspect so the
                // deferred close event can be delivered.
                let mut inner = self.shared.inner.lock();
                if inner.read_suppressed {
                    inner.read_suppressed = false;
                    self.shared.wakeup(&mut inner);
                }
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(err) => {
                if err.would_block() {
                    let mut inner = self.shared.inner.lock();
                    let need_wake = inner.waiting & WAIT_READ == 0 || inner.read_suppressed;
                    inner.waiting |= WAIT_READ;
                    inner.read_suppressed = false;
                    if need_wake {
                        self.shared.wakeup(&mut inner);
                    }
                }
                Err(err)
            }
        }
    }

    /// Read bytes without consuming them. Does not re-arm interest.
    pub fn peek(&mut self, buf: &mut [u8]) -> Result<usize, SysError> {
        let fd = self.shared.inner.lock().fd;
        if fd == -1 {
            return Err(SysError(libc::ENOTCONN));
        }
        sys::recv(fd, buf, true)
    }

    /// Write bytes. A short count is not an error. `EAGAIN` re-arms the
    /// worker's write interest; wait for the next `Write` event.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, SysError> {
        let fd = self.shared.inner.lock().fd;
        if fd == -1 {
            return Err(SysError(libc::ENOTCONN));
        }
        match sys::send(fd, buf) {
            Ok(n) => Ok(n),
            Err(err) => {
                if err.would_block() {
                    let mut inner = self.shared.inner.lock();
                    if inner.waiting & WAIT_WRITE == 0 {
                        inner.waiting |= WAIT_WRITE;
                        self.shared.wakeup(&mut inner);
                    }
                }
                Err(err)
            }
        }
    }

    /// Close the socket. Pending events for the handler are purged; a
    /// worker stuck in the resolver is detached to the reaper.
    pub fn close(&mut self) {
        let (fd, handler, resolving) = {
            let mut inner = self.shared.inner.lock();
            let fd = inner.fd;
            inner.fd = -1;
            inner.host = None;
            inner.port = None;
            inner.state = SocketState::Closed;
            inner.triggered = 0;
            inner.triggered_errors = [SysError::NONE; 5];
            inner.read_suppressed = false;
            let resolving = inner.resolving;
            if self.thread.is_some() && !inner.threadwait {
                self.shared.wakeup(&mut inner);
            }
            (fd, inner.handler, resolving)
        };

        sys::close_fd(fd);

        if resolving {
            self.detach_worker();
        }

        if let Some(handler) = handler {
            self.dispatcher.remove_pending_handler(handler);
        }
    }

    /// Bind and listen. Accept readiness arrives as `Connection` events.
    pub fn listen(&mut self, family: AddressFamily, port: u16) -> Result<(), SysError> {
        {
            let inner = self.shared.inner.lock();
            if inner.state != SocketState::Idle && inner.state != SocketState::Closed {
                return Err(SysError(libc::EALREADY));
            }
        }

        let c_port = CString::new(port.to_string()).expect("port string has no NUL");
        let list = sys::resolve(None, &c_port, family.to_raw(), true)?;

        let mut fd = -1;
        let mut last_err = SysError(libc::EAI_NONAME);
        for ai in list.iter() {
            let candidate = match sys::new_stream_socket(ai) {
                Ok(candidate) => candidate,
                Err(err) => {
                    last_err = err;
                    continue;
                }
            };
            sys::set_nonblocking(candidate)?;
            match sys::bind_fd(candidate, ai) {
                Ok(()) => {
                    fd = candidate;
                    break;
                }
                Err(err) => {
                    last_err = err;
                    sys::close_fd(candidate);
                }
            }
        }
        if fd == -1 {
            return Err(last_err);
        }

        if let Err(err) = sys::listen_fd(fd, LISTEN_BACKLOG) {
            sys::close_fd(fd);
            return Err(err);
        }

        {
            let mut inner = self.shared.inner.lock();
            inner.fd = fd;
            inner.state = SocketState::Listening;
            inner.waiting = WAIT_ACCEPT;
        }
        self.ensure_worker()?;
        let mut inner = self.shared.inner.lock();
        self.shared.wakeup(&mut inner);
        Ok(())
    }

    /// Accept one pending connection. The new socket arrives connected,
    /// with its own worker watching read and write, and no handler yet.
    pub fn accept(&mut self) -> Result<Socket, SysError> {
        let (fd, sizes) = {
            let mut inner = self.shared.inner.lock();
            inner.waiting |= WAIT_ACCEPT;
            self.shared.wakeup(&mut inner);
            (inner.fd, inner.buffer_sizes)
        };
        let new_fd = sys::accept(fd)?;
        sys::set_nonblocking(new_fd)?;
        let _ = sys::apply_buffer_sizes(new_fd, sizes[0], sizes[1]);

        let mut socket = Socket::new(self.dispatcher.clone(), None);
        {
            let mut inner = socket.shared.inner.lock();
            inner.fd = new_fd;
            inner.state = SocketState::Connected;
            inner.waiting = WAIT_READ | WAIT_WRITE;
        }
        socket.ensure_worker()?;
        Ok(socket)
    }

    /// Swap or clear the event observer. Pending events are retargeted
    /// (or purged when clearing); attaching to a live socket re-arms
    /// read/write so no edge is lost, and attaching to a closing socket
    /// replays the close detection.
    pub fn set_event_handler(&mut self, handler: Option<HandlerId>) {
        let mut inner = self.shared.inner.lock();
        let old = inner.handler;

        match (old, handler) {
            (Some(old), None) => self.dispatcher.remove_pending_handler(old),
            (Some(old), Some(new)) => {
                self.dispatcher.update_pending(old, self.shared.id, new, self.shared.id)
            }
            _ => {}
        }
        inner.handler = handler;

        if handler.is_some()
            && (inner.state == SocketState::Connected || inner.state == SocketState::Closing)
        {
            inner.waiting |= WAIT_READ | WAIT_WRITE;
            inner.read_suppressed = false;
            self.shared.wakeup(&mut inner);
        }
    }

    /// Currently registered observer.
    pub fn event_handler(&self) -> Option<HandlerId> {
        self.shared.inner.lock().handler
    }

    /// Set nodelay/keepalive flags.
    pub fn set_flags(&mut self, flags: SocketFlags) {
        let mut inner = self.shared.inner.lock();
        if inner.fd != -1 {
            let changed = SocketFlags(flags.0 ^ inner.flags.0);
            let _ = sys::apply_flags(inner.fd, flags, changed);
        }
        inner.flags = flags;
    }

    /// Configured flags.
    pub fn flags(&self) -> SocketFlags {
        self.shared.inner.lock().flags
    }

    /// Set kernel buffer sizes (`-1` keeps the system default). A listen
    /// socket passes the sizes on to accepted sockets.
    pub fn set_buffer_sizes(&mut self, size_read: i32, size_write: i32) {
        let mut inner = self.shared.inner.lock();
        inner.buffer_sizes = [size_read, size_write];
        if inner.fd != -1 {
            let _ = sys::apply_buffer_sizes(inner.fd, size_read, size_write);
        }
    }

    /// Local address, empty on error.
    pub fn local_ip(&self, strip_zone_index: bool) -> Option<String> {
        let fd = self.shared.inner.lock().fd;
        sys::ip_string(fd, false, strip_zone_index)
    }

    /// Peer address, empty on error.
    pub fn peer_ip(&self, strip_zone_index: bool) -> Option<String> {
        let fd = self.shared.inner.lock().fd;
        sys::ip_string(fd, true, strip_zone_index)
    }

    /// Locally bound port.
    pub fn local_port(&self) -> Result<u16, SysError> {
        let fd = self.shared.inner.lock().fd;
        sys::port_of(fd, false)
    }

    /// Connected peer port.
    pub fn remote_port(&self) -> Result<u16, SysError> {
        let fd = self.shared.inner.lock().fd;
        sys::port_of(fd, true)
    }

    /// Address family of the connected socket, `Unspec` otherwise.
    pub fn address_family(&self) -> AddressFamily {
        let fd = self.shared.inner.lock().fd;
        sys::family_of(fd).map_or(AddressFamily::Unspec, AddressFamily::from_raw)
    }

    fn ensure_worker(&mut self) -> Result<(), SysError> {
        if self.thread.is_some() {
            return Ok(());
        }
        let pipe = sys::pipe()?;
        {
            let mut inner = self.shared.inner.lock();
            inner.pipe = pipe;
            inner.quit = false;
            inner.finished = false;
            inner.threadwait = false;
            inner.started = true;
        }
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.into())
            .spawn(move || worker::run(shared))
            .map_err(|_| SysError(libc::EAGAIN))?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Hand the worker off. A finished worker is joined inline; a live one
    /// (stuck in a blocking call) is parked in the process-wide reaper and
    /// the socket starts over with a fresh shared block.
    fn detach_worker(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        let (finished, handler, flags, sizes) = {
            let mut inner = self.shared.inner.lock();
            inner.quit = true;
            self.shared.wakeup(&mut inner);
            (inner.finished, inner.handler, inner.flags, inner.buffer_sizes)
        };

        if finished {
            let _ = handle.join();
        } else {
            park_in_reaper(handle);
        }

        self.shared = Arc::new(Shared::new(
            self.shared.id,
            self.dispatcher.clone(),
            handler,
            flags,
            sizes,
        ));
        reap_finished();
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.state() != SocketState::Idle {
            self.close();
        }
        self.detach_worker();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventHandler, EventLoop};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    struct Collector {
        events: Vec<SocketEventKind>,
    }

    impl EventHandler for Collector {
        fn handle_event(&mut self, event: Event) {
            if let Event::Socket(event) = event {
                self.events.push(event.kind);
            }
        }
    }

    fn harness() -> (EventLoop, Rc<RefCell<Collector>>, HandlerId) {
        let mut el = EventLoop::new();
        let collector = Rc::new(RefCell::new(Collector { events: Vec::new() }));
        let id = el.register(collector.clone());
        (el, collector, id)
    }

    fn wait_for<F: Fn(&[SocketEventKind]) -> bool>(
        el: &mut EventLoop,
        collector: &Rc<RefCell<Collector>>,
        pred: F,
    ) -> bool {
        for _ in 0..200 {
            if pred(&collector.borrow().events) {
                return true;
            }
            el.run_one(Duration::from_millis(50));
        }
        pred(&collector.borrow().events)
    }

    #[test]
    fn connect_rejects_port_zero() {
        let el = EventLoop::new();
        let mut socket = Socket::new(el.dispatcher(), None);
        assert_eq!(socket.connect("localhost", 0, AddressFamily::Unspec), Err(SysError(libc::EINVAL)));
    }

    #[test]
    fn connect_rejects_connected_socket() {
        let (mut el, collector, id) = harness();
        let mut listener = Socket::new(el.dispatcher(), None);
        listener.listen(AddressFamily::Ipv4, 0).unwrap();
        let port = listener.local_port().unwrap();

        let mut socket = Socket::new(el.dispatcher(), Some(id));
        socket.connect("127.0.0.1", port, AddressFamily::Ipv4).unwrap();
        assert!(wait_for(&mut el, &collector, |events| {
            events.contains(&SocketEventKind::Connection(SysError::NONE))
        }));
        assert_eq!(
            socket.connect("127.0.0.1", port, AddressFamily::Ipv4),
            Err(SysError(libc::EISCONN))
        );
    }

    #[test]
    fn loopback_connect_emits_hostaddress_then_connection() {
        let (mut el, collector, id) = harness();
        let mut listener = Socket::new(el.dispatcher(), None);
        listener.listen(AddressFamily::Ipv4, 0).unwrap();
        let port = listener.local_port().unwrap();

        let mut socket = Socket::new(el.dispatcher(), Some(id));
        socket.connect("127.0.0.1", port, AddressFamily::Ipv4).unwrap();

        assert!(wait_for(&mut el, &collector, |events| {
            events.contains(&SocketEventKind::Connection(SysError::NONE))
        }));
        let events = &collector.borrow().events;
        let host_pos = events
            .iter()
            .position(|kind| matches!(kind, SocketEventKind::HostAddress(_)))
            .expect("host address event");
        let conn_pos = events
            .iter()
            .position(|kind| *kind == SocketEventKind::Connection(SysError::NONE))
            .unwrap();
        assert!(host_pos < conn_pos);
        assert_eq!(socket.state(), SocketState::Connected);
    }

    #[test]
    fn refused_connect_reports_final_connection_error() {
        let (mut el, collector, id) = harness();
        // Bind a listener to learn a free port, then close it so the
        // connect is refused.
        let port = {
            let mut listener = Socket::new(el.dispatcher(), None);
            listener.listen(AddressFamily::Ipv4, 0).unwrap();
            let port = listener.local_port().unwrap();
            listener.close();
            port
        };

        let mut socket = Socket::new(el.dispatcher(), Some(id));
        socket.connect("127.0.0.1", port, AddressFamily::Ipv4).unwrap();

        assert!(wait_for(&mut el, &collector, |events| {
            events
                .iter()
                .any(|kind| matches!(kind, SocketEventKind::Connection(err) if err.is_err()))
        }));
        // The lone address has no successor, so no ConnectionNext.
        assert!(
            !collector
                .borrow()
                .events
                .iter()
                .any(|kind| matches!(kind, SocketEventKind::ConnectionNext(_)))
        );
    }

    #[test]
    fn read_is_delivered_before_close() {
        let (mut el, collector, id) = harness();
        let mut listener = Socket::new(el.dispatcher(), None);
        listener.listen(AddressFamily::Ipv4, 0).unwrap();
        let port = listener.local_port().unwrap();

        let mut socket = Socket::new(el.dispatcher(), Some(id));
        socket.connect("127.0.0.1", port, AddressFamily::Ipv4).unwrap();
        assert!(wait_for(&mut el, &collector, |events| {
            events.contains(&SocketEventKind::Connection(SysError::NONE))
        }));

        // Accept the peer, push bytes, then close it while the bytes are
        // still buffered.
        let mut peer = listener.accept().unwrap();
        assert_eq!(peer.write(b"220 ready\r\n").unwrap(), 11);
        peer.close();

        assert!(wait_for(&mut el, &collector, |events| {
            events.iter().any(|kind| matches!(kind, SocketEventKind::Read(_)))
        }));

        // The close stays pending until the buffered bytes are drained.
        assert!(
            !collector
                .borrow()
                .events
                .iter()
                .any(|kind| matches!(kind, SocketEventKind::Close(_)))
        );
        let mut total = 0;
        let mut buf = [0u8; 64];
        loop {
            match socket.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(err) if err.would_block() => {
                    el.run_one(Duration::from_millis(20));
                }
                Err(err) => panic!("read failed: {}", err),
            }
        }
        assert_eq!(total, 11);

        assert!(wait_for(&mut el, &collector, |events| {
            events.iter().any(|kind| matches!(kind, SocketEventKind::Close(_)))
        }));

        let events = &collector.borrow().events;
        let read_pos = events
            .iter()
            .position(|kind| matches!(kind, SocketEventKind::Read(_)))
            .expect("read event before close");
        let close_pos = events
            .iter()
            .position(|kind| matches!(kind, SocketEventKind::Close(_)))
            .unwrap();
        assert!(read_pos < close_pos, "close must not overtake buffered reads");
    }

    #[test]
    fn close_purges_pending_events() {
        let (el, _collector, id) = harness();
        let dispatcher = el.dispatcher();
        let mut socket = Socket::new(dispatcher.clone(), Some(id));
        dispatcher.send(SocketEvent::new(socket.source_id(), id, SocketEventKind::Read(SysError::NONE)));
        socket.close();
        assert!(dispatcher.pop_front().is_none());
    }

    #[test]
    fn drop_joins_or_parks_worker() {
        let el = EventLoop::new();
        {
            let mut socket = Socket::new(el.dispatcher(), None);
            let mut listener = Socket::new(el.dispatcher(), None);
            listener.listen(AddressFamily::Ipv4, 0).unwrap();
            let port = listener.local_port().unwrap();
            socket.connect("127.0.0.1", port, AddressFamily::Ipv4).unwrap();
        }
        // Dropped sockets leave at most transient reaper entries.
        reap_all();
        assert_eq!(reaper_len(), 0);
    }
}

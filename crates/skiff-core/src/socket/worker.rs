//! Per-socket worker thread.
//!
//! Each socket owns exactly one worker. The worker parks on a condition
//! variable while it has nothing to do, resolves host names (with the
//! state lock dropped across the blocking call), drives non-blocking
//! connects address by address, and waits for readiness with `select`
//! plus a self-pipe for cancellation. Readiness is reported through the
//! socket event dispatcher.
//!
//! The shared state block is jointly owned: the socket holds one `Arc`,
//! the worker the other. When the socket detaches a worker stuck in the
//! resolver, the worker keeps its `Arc` and finishes against the orphaned
//! block while the socket starts over with a fresh one.

use std::ffi::CString;
use std::os::fd::RawFd;
use std::sync::Arc;

use libc::c_int;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::SysError;
use crate::event::{HandlerId, SocketEventDispatcher, SourceId};
use crate::socket::{SocketEvent, SocketEventKind, SocketFlags, SocketState, sys};

pub(crate) const WAIT_CONNECT: u8 = 0x01;
pub(crate) const WAIT_READ: u8 = 0x02;
pub(crate) const WAIT_WRITE: u8 = 0x04;
pub(crate) const WAIT_ACCEPT: u8 = 0x08;
pub(crate) const WAIT_CLOSE: u8 = 0x10;

const EVENT_COUNT: usize = 5;

const ERR_CONNECT: usize = 0;
const ERR_READ: usize = 1;
const ERR_WRITE: usize = 2;
const ERR_ACCEPT: usize = 3;
const ERR_CLOSE: usize = 4;

/// State jointly owned by a socket and its worker.
pub(crate) struct Shared {
    pub(crate) id: SourceId,
    pub(crate) dispatcher: Arc<SocketEventDispatcher>,
    pub(crate) inner: Mutex<Inner>,
    pub(crate) cond: Condvar,
}

pub(crate) struct Inner {
    pub(crate) fd: RawFd,
    pub(crate) state: SocketState,
    pub(crate) handler: Option<HandlerId>,

    // Pending connect request.
    pub(crate) host: Option<CString>,
    pub(crate) port: Option<CString>,
    pub(crate) family: c_int,

    pub(crate) flags: SocketFlags,
    pub(crate) buffer_sizes: [c_int; 2],

    // Directions the owner wants vs. ready-but-undelivered.
    pub(crate) waiting: u8,
    pub(crate) triggered: u8,
    pub(crate) triggered_errors: [SysError; EVENT_COUNT],

    pub(crate) quit: bool,
    pub(crate) started: bool,
    pub(crate) finished: bool,
    pub(crate) threadwait: bool,
    /// Worker is inside the blocking resolver; `close` must detach.
    pub(crate) resolving: bool,
    /// Peer FIN seen with data still buffered while the owner was not
    /// interested in reads; stop watching readability until it is again.
    pub(crate) read_suppressed: bool,

    pub(crate) pipe: [RawFd; 2],
}

impl Shared {
    pub(crate) fn new(
        id: SourceId,
        dispatcher: Arc<SocketEventDispatcher>,
        handler: Option<HandlerId>,
        flags: SocketFlags,
        buffer_sizes: [c_int; 2],
    ) -> Shared {
        Shared {
            id,
            dispatcher,
            inner: Mutex::new(Inner {
                fd: -1,
                state: SocketState::Idle,
                handler,
                host: None,
                port: None,
                family: libc::AF_UNSPEC,
                flags,
                buffer_sizes,
                waiting: 0,
                triggered: 0,
                triggered_errors: [SysError::NONE; EVENT_COUNT],
                quit: false,
                started: false,
                finished: false,
                threadwait: false,
                resolving: false,
                read_suppressed: false,
                pipe: [-1, -1],
            }),
            cond: Condvar::new(),
        }
    }

    /// Cancel a readiness wait or idle park. Caller holds the lock.
    pub(crate) fn wakeup(&self, inner: &mut Inner) {
        if !inner.started || inner.finished {
            return;
        }
        if inner.threadwait {
            inner.threadwait = false;
            self.cond.notify_one();
            return;
        }
        sys::pipe_write(inner.pipe[1]);
    }
}

fn emit(shared: &Shared, inner: &Inner, kind: SocketEventKind) {
    if let Some(handler) = inner.handler {
        shared.dispatcher.send(SocketEvent::new(shared.id, handler, kind));
    }
}

/// Park until there is work (a pending host or wanted directions).
/// Returns false when the worker should exit.
fn idle_wait(shared: &Shared, guard: &mut MutexGuard<'_, Inner>) -> bool {
    if guard.quit {
        return false;
    }
    while guard.waiting == 0 && guard.host.is_none() {
        guard.threadwait = true;
        shared.cond.wait(guard);
        if guard.quit {
            return false;
        }
    }
    true
}

/// Readiness wait. Adds `extra` to the wanted directions, then blocks in
/// `select` (lock dropped) until something triggers or the wait is
/// cancelled. Returns false when the worker must abandon the current fd.
fn do_wait(shared: &Shared, guard: &mut MutexGuard<'_, Inner>, extra: u8) -> bool {
    guard.waiting |= extra;

    loop {
        let fd = guard.fd;
        let wake_fd = guard.pipe[0];
        let waiting = guard.waiting;
        let want_read = waiting & WAIT_CONNECT == 0
            && waiting & (WAIT_READ | WAIT_ACCEPT | WAIT_CLOSE) != 0
            && !guard.read_suppressed;
        let want_write = waiting & (WAIT_WRITE | WAIT_CONNECT) != 0;

        let ready = MutexGuard::unlocked(guard, || sys::wait_readiness(fd, wake_fd, want_read, want_write));

        if guard.quit || guard.fd == -1 {
            return false;
        }
        let ready = match ready {
            Ok(ready) => ready,
            Err(err) if err.0 == libc::EINTR => continue,
            Err(_) => return false,
        };

        if ready.readable {
            if guard.waiting & WAIT_ACCEPT != 0 {
                guard.triggered |= WAIT_ACCEPT;
                guard.triggered_errors[ERR_ACCEPT] = SysError::NONE;
                guard.waiting &= !WAIT_ACCEPT;
            } else if guard.waiting & WAIT_READ != 0 {
                guard.triggered |= WAIT_READ;
                guard.triggered_errors[ERR_READ] = SysError::NONE;
                guard.waiting &= !WAIT_READ;
            } else if guard.waiting & WAIT_CLOSE != 0 {
                // Close readiness. Data must drain before the close may be
                // reported; re-inspect once the owner re-arms reads.
                match sys::peek_available(guard.fd) {
                    Ok(0) => {
                        guard.triggered |= WAIT_CLOSE;
                        guard.triggered_errors[ERR_CLOSE] = SysError::NONE;
                        guard.waiting &= !WAIT_CLOSE;
                    }
                    Ok(_) => guard.read_suppressed = true,
                    Err(err) if err.would_block() => {}
                    Err(err) => {
                        guard.triggered |= WAIT_CLOSE;
                        guard.triggered_errors[ERR_CLOSE] = err;
                        guard.waiting &= !WAIT_CLOSE;
                    }
                }
            }
        }

        if ready.writable {
            if guard.waiting & WAIT_CONNECT != 0 {
                guard.triggered |= WAIT_CONNECT;
                guard.triggered_errors[ERR_CONNECT] = sys::so_error(guard.fd);
                guard.waiting &= !WAIT_CONNECT;
            } else if guard.waiting & WAIT_WRITE != 0 {
                guard.triggered |= WAIT_WRITE;
                guard.triggered_errors[ERR_WRITE] = SysError::NONE;
                guard.waiting &= !WAIT_WRITE;
            }
        }

        if guard.triggered != 0 || guard.waiting == 0 {
            return true;
        }
    }
}

/// Deliver triggered directions as events and clear them.
fn send_events(shared: &Shared, guard: &mut MutexGuard<'_, Inner>) {
    if guard.handler.is_none() {
        return;
    }
    if guard.triggered & WAIT_READ != 0 {
        let err = guard.triggered_errors[ERR_READ];
        emit(shared, guard, SocketEventKind::Read(err));
        guard.triggered &= !WAIT_READ;
    }
    if guard.triggered & WAIT_WRITE != 0 {
        let err = guard.triggered_errors[ERR_WRITE];
        emit(shared, guard, SocketEventKind::Write(err));
        guard.triggered &= !WAIT_WRITE;
    }
    if guard.triggered & WAIT_ACCEPT != 0 {
        let err = guard.triggered_errors[ERR_ACCEPT];
        emit(shared, guard, SocketEventKind::Connection(err));
        guard.triggered &= !WAIT_ACCEPT;
    }
    if guard.triggered & WAIT_CLOSE != 0 {
        let err = guard.triggered_errors[ERR_CLOSE];
        emit(shared, guard, SocketEventKind::Close(err));
        guard.triggered &= !WAIT_CLOSE;
    }
}

enum TryOutcome {
    Connected,
    NextAddress,
    Abort,
}

/// Attempt one resolved address. Mirrors the per-address half of the
/// connect sequence: announce the address, create and configure the fd,
/// start the non-blocking connect, wait for write readiness and read back
/// `SO_ERROR`.
fn try_connect_host(
    shared: &Shared,
    guard: &mut MutexGuard<'_, Inner>,
    ai: &libc::addrinfo,
    has_next: bool,
) -> TryOutcome {
    if guard.handler.is_some() {
        if let Some(address) = sys::sockaddr_to_string(ai.ai_addr, ai.ai_addrlen, true, false) {
            emit(shared, guard, SocketEventKind::HostAddress(address));
        }
    }

    let fd = match sys::new_stream_socket(ai) {
        Ok(fd) => fd,
        Err(err) => {
            let kind = if has_next {
                SocketEventKind::ConnectionNext(err)
            } else {
                SocketEventKind::Connection(err)
            };
            emit(shared, guard, kind);
            return TryOutcome::NextAddress;
        }
    };

    let flags = guard.flags;
    let sizes = guard.buffer_sizes;
    let _ = sys::apply_flags(fd, flags, flags);
    let _ = sys::apply_buffer_sizes(fd, sizes[0], sizes[1]);
    if let Err(err) = sys::set_nonblocking(fd) {
        sys::close_fd(fd);
        let kind = if has_next {
            SocketEventKind::ConnectionNext(err)
        } else {
            SocketEventKind::Connection(err)
        };
        emit(shared, guard, kind);
        return TryOutcome::NextAddress;
    }

    let mut res = sys::start_connect(fd, ai);
    if res.0 == libc::EINPROGRESS {
        guard.fd = fd;
        loop {
            let wait_ok = do_wait(shared, guard, WAIT_CONNECT);
            if guard.triggered & WAIT_CONNECT != 0 {
                break;
            }
            if !wait_ok {
                // Cancelled; only close if the fd is still ours.
                if guard.fd == fd {
                    sys::close_fd(fd);
                    guard.fd = -1;
                }
                return TryOutcome::Abort;
            }
        }
        guard.triggered &= !WAIT_CONNECT;
        res = guard.triggered_errors[ERR_CONNECT];
    }

    if res.is_err() {
        let kind = if has_next {
            SocketEventKind::ConnectionNext(res)
        } else {
            SocketEventKind::Connection(res)
        };
        emit(shared, guard, kind);
        guard.fd = -1;
        sys::close_fd(fd);
        return TryOutcome::NextAddress;
    }

    guard.fd = fd;
    guard.state = SocketState::Connected;
    emit(shared, guard, SocketEventKind::Connection(SysError::NONE));

    // Interested in everything else from here on.
    guard.waiting |= WAIT_READ | WAIT_WRITE;
    TryOutcome::Connected
}

/// Resolve the pending host and try every returned address in order.
/// Returns true when connected and the watch loop should start.
fn do_connect(shared: &Shared, guard: &mut MutexGuard<'_, Inner>) -> bool {
    let (host, port) = match (guard.host.take(), guard.port.take()) {
        (Some(host), Some(port)) => (host, port),
        _ => {
            guard.state = SocketState::Closed;
            return false;
        }
    };
    let family = guard.family;

    guard.resolving = true;
    let resolved = MutexGuard::unlocked(guard, || sys::resolve(Some(&host), &port, family, false));
    guard.resolving = false;

    if guard.quit {
        guard.state = SocketState::Closed;
        return false;
    }
    // A close (and possibly a new connect) happened while resolving;
    // abandon this attempt.
    if guard.state != SocketState::Connecting || guard.host.is_some() {
        return false;
    }

    let list = match resolved {
        Ok(list) => list,
        Err(err) => {
            emit(shared, guard, SocketEventKind::Connection(err));
            guard.state = SocketState::Closed;
            return false;
        }
    };

    let addresses: Vec<&libc::addrinfo> = list.iter().collect();
    for (idx, ai) in addresses.iter().enumerate() {
        let has_next = idx + 1 < addresses.len();
        match try_connect_host(shared, guard, ai, has_next) {
            TryOutcome::Connected => return true,
            TryOutcome::NextAddress => continue,
            TryOutcome::Abort => {
                guard.state = SocketState::Closed;
                return false;
            }
        }
    }

    emit(shared, guard, SocketEventKind::Connection(SysError(libc::ECONNABORTED)));
    guard.state = SocketState::Closed;
    false
}

/// Worker entry point.
pub(crate) fn run(shared: Arc<Shared>) {
    let mut guard = shared.inner.lock();

    'outer: loop {
        if !idle_wait(&shared, &mut guard) {
            break;
        }

        if guard.state == SocketState::Listening {
            loop {
                if !idle_wait(&shared, &mut guard) {
                    break 'outer;
                }
                if guard.fd == -1 {
                    guard.waiting = 0;
                    break;
                }
                if !do_wait(&shared, &mut guard, 0) {
                    break;
                }
                send_events(&shared, &mut guard);
            }
        } else {
            if guard.state == SocketState::Connecting && !do_connect(&shared, &mut guard) {
                continue;
            }

            guard.waiting |= WAIT_CLOSE;
            loop {
                if !idle_wait(&shared, &mut guard) {
                    break 'outer;
                }
                if guard.fd == -1 {
                    guard.waiting = 0;
                    break;
                }
                let wait_ok = do_wait(&shared, &mut guard, 0);
                if guard.triggered & WAIT_CLOSE != 0 {
                    guard.state = SocketState::Closing;
                }
                if !wait_ok {
                    break;
                }
                send_events(&shared, &mut guard);
            }
        }
    }

    guard.finished = true;
    let pipe = guard.pipe;
    guard.pipe = [-1, -1];
    drop(guard);
    sys::close_fd(pipe[0]);
    sys::close_fd(pipe[1]);
}

//! Byte-stream backend abstraction.
//!
//! A control socket talks to its peer through a [`SocketBackend`] rather
//! than the socket directly, so a proxy or TLS layer can interpose on the
//! same descriptor. The default [`DirectBackend`] passes bytes straight
//! through, subject to [`RateLimiter`] hooks.
//!
//! A proxy/TLS backend performs its own handshake by consuming the
//! socket's events; once the tunnel is usable it posts a synthetic
//! `Connection` event to its observer. The control socket then calls
//! [`SocketBackend::detach`] on it and installs a fresh [`DirectBackend`]
//! over the same descriptor.

use std::sync::Arc;

use crate::error::SysError;
use crate::socket::Socket;

/// Transfer direction, from the local endpoint's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bytes received from the peer.
    Inbound,
    /// Bytes sent to the peer.
    Outbound,
}

/// Bandwidth accounting hooks. The core performs no accounting itself.
pub trait RateLimiter: Send + Sync {
    /// How many bytes may move right now; `None` means unlimited. A zero
    /// allowance turns the I/O call into `EAGAIN`.
    fn available(&self, direction: Direction) -> Option<usize>;

    /// Record bytes actually moved.
    fn consume(&self, direction: Direction, bytes: usize);
}

/// The default limiter: everything is allowed, nothing is recorded.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

impl RateLimiter for Unlimited {
    fn available(&self, _direction: Direction) -> Option<usize> {
        None
    }

    fn consume(&self, _direction: Direction, _bytes: usize) {}
}

/// A byte stream over a socket.
pub trait SocketBackend {
    /// Read up to `buf.len()` bytes. `EAGAIN` means wait for readiness.
    fn read(&mut self, socket: &mut Socket, buf: &mut [u8]) -> Result<usize, SysError>;

    /// Write up to `buf.len()` bytes. A short count is not an error.
    fn write(&mut self, socket: &mut Socket, buf: &[u8]) -> Result<usize, SysError>;

    /// Stop interposing: the backend must no longer touch the socket.
    fn detach(&mut self);

    /// Whether `detach` has been called.
    fn detached(&self) -> bool;
}

/// Rate-limited pass-through backend.
pub struct DirectBackend {
    limiter: Arc<dyn RateLimiter>,
    detached: bool,
}

impl DirectBackend {
    pub fn new(limiter: Arc<dyn RateLimiter>) -> DirectBackend {
        DirectBackend { limiter, detached: false }
    }
}

impl SocketBackend for DirectBackend {
    fn read(&mut self, socket: &mut Socket, buf: &mut [u8]) -> Result<usize, SysError> {
        let len = match self.limiter.available(Direction::Inbound) {
            Some(0) => return Err(SysError(libc::EAGAIN)),
            Some(limit) => limit.min(buf.len()),
            None => buf.len(),
        };
        let n = socket.read(&mut buf[..len])?;
        self.limiter.consume(Direction::Inbound, n);
        Ok(n)
    }

    fn write(&mut self, socket: &mut Socket, buf: &[u8]) -> Result<usize, SysError> {
        let len = match self.limiter.available(Direction::Outbound) {
            Some(0) => return Err(SysError(libc::EAGAIN)),
            Some(limit) => limit.min(buf.len()),
            None => buf.len(),
        };
        let n = socket.write(&buf[..len])?;
        self.limiter.consume(Direction::Outbound, n);
        Ok(n)
    }

    fn detach(&mut self) {
        self.detached = true;
    }

    fn detached(&self) -> bool {
        self.detached
    }
}

// =============================================================================
// Tests
// =============================================================================

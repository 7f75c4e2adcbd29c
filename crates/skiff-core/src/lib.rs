//! skiff-core: transport foundation for the skiff transfer engine.
//!
//! This crate provides:
//! - A serial event loop with typed events and timers
//! - A socket event dispatcher with pending-event purge and retargeting
//! - A non-blocking TCP socket driven by one worker thread per socket
//! - A byte-stream backend abstraction with rate-limiter hooks
//! - POSIX errno tables and logging setup
//!
//! Everything protocol-specific lives above this crate; skiff-core only
//! moves bytes and delivers readiness events.

pub mod backend;
pub mod constants;
pub mod error;
pub mod event;
pub mod logging;
pub mod socket;

pub use backend::{Direction, DirectBackend, RateLimiter, SocketBackend, Unlimited};
pub use error::{Error, Result, SysError};
pub use event::{Event, EventHandler, EventLoop, HandlerId, LoopHandle, SourceId, TimerId};
pub use logging::{LogFormat, init_logging};
pub use socket::{
    AddressFamily, Socket, SocketEvent, SocketEventKind, SocketFlags, SocketState, reap_all,
    reap_finished,
};

//! skiff-engine: the generic operation core of the skiff transfer engine.
//!
//! This crate provides:
//! - Reply-code bitset and command identifiers (the stable contract
//!   between the core and its embedder)
//! - The control-socket base: operation stacking, transfer status,
//!   asynchronous user requests, timeout supervision, path handling and
//!   text encoding negotiation
//! - A process-wide cache lock manager with FIFO fairness
//! - The real control socket gluing the skiff-core socket and backend
//!   layers to the base
//!
//! Protocol dialects (FTP, SFTP command grammars) live above this crate
//! and plug in through the [`control::Dialect`] seam.

pub mod cache;
pub mod command;
pub mod control;
pub mod encoding;
pub mod lock;
pub mod notify;
pub mod options;
pub mod path;
pub mod reply;
pub mod server;
pub mod status;

pub use cache::{CacheLookup, Direntry, DirectoryCache, EmptyCache};
pub use command::Command;
pub use control::ops::{ConnectData, FileTransferData, OpData, OpPayload};
pub use control::{
    ControlEvent, ControlSocket, Dialect, NullDialect, ProxyBackend, RealControlSocket, Session,
};
pub use encoding::{Decoded, TextCodec};
pub use lock::{CacheLockManager, LockOwner, LockReason, LockRequest};
pub use notify::{
    FileExistsAction, FileExistsRequest, LogLevel, Notification, NotificationSink, RequestId,
    RequestIdAllocator,
};
pub use options::{EngineOptions, ProxyOptions, ProxyType};
pub use path::RemotePath;
pub use reply::ReplyCode;
pub use server::{EncodingPreference, ServerDescriptor, ServerKey, ServerKind};
pub use status::{SharedTransferStatus, TransferStatus, TransferStatusHandle};

//! Error types for skiff-core.

use std::fmt;

use thiserror::Error;

/// Main error type for skiff-core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Socket-level error carrying a POSIX errno.
    #[error("socket error: {0}")]
    Socket(SysError),

    /// The socket is in the wrong state for the requested operation.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The worker thread could not be started.
    #[error("worker spawn failed: {message}")]
    WorkerSpawn { message: String },
}

/// Convenience result type for skiff-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A POSIX errno value carried by the socket layer.
///
/// `0` means success; positive values are `errno` constants and negative
/// values are `EAI_*` resolver errors, exactly as the C APIs report them.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SysError(pub i32);

impl SysError {
    /// The "no error" value used by success events.
    pub const NONE: SysError = SysError(0);

    /// Whether this value represents success.
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Whether this value represents a failure.
    pub fn is_err(self) -> bool {
        self.0 != 0
    }

    /// Whether the operation should be retried after a readiness event.
    pub fn would_block(self) -> bool {
        self.0 == libc::EAGAIN || self.0 == libc::EWOULDBLOCK
    }

    /// The errno of the calling thread's last failed system call.
    pub fn last_os_error() -> SysError {
        SysError(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }

    /// The symbolic name of the error, if known.
    pub fn name(self) -> Option<&'static str> {
        lookup(self.0).map(|entry| entry.1)
    }

    /// A human-readable description of the error, if known.
    pub fn description(self) -> Option<&'static str> {
        lookup(self.0).map(|entry| entry.2)
    }
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match lookup(self.0) {
            Some((_, name, description)) => write!(f, "{} - {}", name, description),
            None => write!(f, "{}", self.0),
        }
    }
}

impl fmt::Debug for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "SysError({})", name),
            None => write!(f, "SysError({})", self.0),
        }
    }
}

/// Static errno table: code, symbolic name, description.
type ErrorEntry = (i32, &'static str, &'static str);

static ERROR_TABLE: &[ErrorEntry] = &[
    (libc::EACCES, "EACCES", "Permission denied"),
    (libc::EADDRINUSE, "EADDRINUSE", "Local address in use"),
    (libc::EAFNOSUPPORT, "EAFNOSUPPORT", "The specified address family is not supported"),
    (libc::EINPROGRESS, "EINPROGRESS", "Operation in progress"),
    (libc::EINVAL, "EINVAL", "Invalid argument passed"),
    (libc::EMFILE, "EMFILE", "Process file table overflow"),
    (libc::ENFILE, "ENFILE", "System limit of open files exceeded"),
    (libc::ENOBUFS, "ENOBUFS", "Out of memory"),
    (libc::ENOMEM, "ENOMEM", "Out of memory"),
    (libc::EPERM, "EPERM", "Permission denied"),
    (libc::EPROTONOSUPPORT, "EPROTONOSUPPORT", "Protocol not supported"),
    (libc::EAGAIN, "EAGAIN", "Resource temporarily unavailable"),
    (libc::EALREADY, "EALREADY", "Operation already in progress"),
    (libc::EBADF, "EBADF", "Bad file descriptor"),
    (libc::ECONNREFUSED, "ECONNREFUSED", "Connection refused by server"),
    (libc::EFAULT, "EFAULT", "Socket address outside address space"),
    (libc::EINTR, "EINTR", "Interrupted by signal"),
    (libc::EISCONN, "EISCONN", "Socket already connected"),
    (libc::ENETUNREACH, "ENETUNREACH", "Network unreachable"),
    (libc::ENOTSOCK, "ENOTSOCK", "File descriptor not a socket"),
    (libc::ETIMEDOUT, "ETIMEDOUT", "Connection attempt timed out"),
    (libc::EHOSTUNREACH, "EHOSTUNREACH", "No route to host"),
    (libc::ENOTCONN, "ENOTCONN", "Socket not connected"),
    (libc::ENETRESET, "ENETRESET", "Connection reset by network"),
    (libc::EOPNOTSUPP, "EOPNOTSUPP", "Operation not supported"),
    (libc::ESHUTDOWN, "ESHUTDOWN", "Socket has been shut down"),
    (libc::EMSGSIZE, "EMSGSIZE", "Message too large"),
    (libc::ECONNABORTED, "ECONNABORTED", "Connection aborted"),
    (libc::ECONNRESET, "ECONNRESET", "Connection reset by peer"),
    (libc::EPIPE, "EPIPE", "Local endpoint has been closed"),
    // Resolver errors (negative codes on POSIX systems)
    (libc::EAI_AGAIN, "EAI_AGAIN", "Temporary failure in name resolution"),
    (libc::EAI_BADFLAGS, "EAI_BADFLAGS", "Invalid value for ai_flags"),
    (libc::EAI_FAIL, "EAI_FAIL", "Nonrecoverable failure in name resolution"),
    (libc::EAI_FAMILY, "EAI_FAMILY", "The ai_family member is not supported"),
    (libc::EAI_MEMORY, "EAI_MEMORY", "Memory allocation failure"),
    (
        libc::EAI_NONAME,
        "EAI_NONAME",
        "Neither nodename nor servname provided, or not known",
    ),
    (
        libc::EAI_SERVICE,
        "EAI_SERVICE",
        "The servname parameter is not supported for ai_socktype",
    ),
    (libc::EAI_SOCKTYPE, "EAI_SOCKTYPE", "The ai_socktype member is not supported"),
    (libc::EAI_SYSTEM, "EAI_SYSTEM", "Other system error"),
    (libc::EAI_OVERFLOW, "EAI_OVERFLOW", "Argument buffer overflow"),
];

fn lookup(code: i32) -> Option<ErrorEntry> {
    if code == 0 {
        return None;
    }
    ERROR_TABLE.iter().find(|entry| entry.0 == code).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sys_error_name_and_description() {
        let err = SysError(libc::ECONNREFUSED);
        assert_eq!(err.name(), Some("ECONNREFUSED"));
        assert_eq!(err.description(), Some("Connection refused by server"));
        assert_eq!(err.to_string(), "ECONNREFUSED - Connection refused by server");
    }

    #[test]
    fn sys_error_unknown_code_displays_number() {
        let err = SysError(99999);
        assert_eq!(err.name(), None);
        assert_eq!(err.to_string(), "99999");
    }

    #[test]
    fn sys_error_none_is_ok() {
        assert!(SysError::NONE.is_ok());
        assert!(!SysError::NONE.is_err());
        assert!(SysError(libc::EPIPE).is_err());
    }

    #[test]
    fn would_block_covers_both_spellings() {
        assert!(SysError(libc::EAGAIN).would_block());
        assert!(SysError(libc::EWOULDBLOCK).would_block());
        assert!(!SysError(libc::EPIPE).would_block());
    }

    #[test]
    fn resolver_errors_are_in_the_table() {
        assert_eq!(SysError(libc::EAI_NONAME).name(), Some("EAI_NONAME"));
        assert_eq!(SysError(libc::EAI_AGAIN).name(), Some("EAI_AGAIN"));
    }

    #[test]
    fn descriptions_are_reasonably_long() {
        for (code, name, description) in ERROR_TABLE {
            assert_ne!(*code, 0, "{} must not shadow success", name);
            assert!(description.len() >= 10, "{} description too short", name);
        }
    }
}

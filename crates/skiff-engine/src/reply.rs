//! Reply-code bitset.
//!
//! The stable wire contract between the operation core and its embedder.
//! Codes compose with `|`; the error-carrying codes all include the
//! [`ReplyCode::ERROR`] bit so a single test covers every failure class.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Result of a command or sub-command, as a composable bitset.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReplyCode(u32);

impl ReplyCode {
    /// Success.
    pub const OK: ReplyCode = ReplyCode(0);
    /// Not an error: the operation parked, waiting on I/O, a user reply
    /// or a cache lock.
    pub const WOULD_BLOCK: ReplyCode = ReplyCode(1 << 0);
    /// The operation failed; the connection survives.
    pub const ERROR: ReplyCode = ReplyCode(1 << 1);
    /// The operation failed and retrying cannot help.
    pub const CRITICAL_ERROR: ReplyCode = ReplyCode(1 << 2 | 1 << 1);
    /// Interrupted by the user.
    pub const CANCELED: ReplyCode = ReplyCode(1 << 3 | 1 << 1);
    /// The connection is gone.
    pub const DISCONNECTED: ReplyCode = ReplyCode(1 << 4);
    /// The timeout watchdog fired.
    pub const TIMEOUT: ReplyCode = ReplyCode(1 << 5 | 1 << 1);
    /// The dialect does not implement this command.
    pub const NOT_SUPPORTED: ReplyCode = ReplyCode(1 << 6 | 1 << 1);
    /// Authentication was rejected.
    pub const PASSWORD_FAILED: ReplyCode = ReplyCode(1 << 7 | 1 << 1);
    /// An internal invariant was violated; reported, never panicked.
    pub const INTERNAL_ERROR: ReplyCode = ReplyCode(1 << 8 | 1 << 1);

    /// Raw bit representation.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Rebuild from raw bits.
    pub fn from_bits(bits: u32) -> ReplyCode {
        ReplyCode(bits)
    }

    /// Whether every bit of `other` is set in `self`.
    pub fn contains(self, other: ReplyCode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_ok(self) -> bool {
        self == ReplyCode::OK
    }

    pub fn is_error(self) -> bool {
        self.contains(ReplyCode::ERROR)
    }

    pub fn would_block(self) -> bool {
        self.contains(ReplyCode::WOULD_BLOCK)
    }
}

impl BitOr for ReplyCode {
    type Output = ReplyCode;

    fn bitor(self, rhs: ReplyCode) -> ReplyCode {
        ReplyCode(self.0 | rhs.0)
    }
}

impl BitOrAssign for ReplyCode {
    fn bitor_assign(&mut self, rhs: ReplyCode) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return write!(f, "OK");
        }
        let names: &[(ReplyCode, &str)] = &[
            (ReplyCode::WOULD_BLOCK, "WOULD_BLOCK"),
            (ReplyCode::CRITICAL_ERROR, "CRITICAL_ERROR"),
            (ReplyCode::CANCELED, "CANCELED"),
            (ReplyCode::TIMEOUT, "TIMEOUT"),
            (ReplyCode::NOT_SUPPORTED, "NOT_SUPPORTED"),
            (ReplyCode::PASSWORD_FAILED, "PASSWORD_FAILED"),
            (ReplyCode::INTERNAL_ERROR, "INTERNAL_ERROR"),
            (ReplyCode::DISCONNECTED, "DISCONNECTED"),
        ];
        let mut rest = self.0;
        let mut first = true;
        for (code, name) in names {
            if self.contains(*code) && rest & code.0 != 0 {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                rest &= !code.0;
                first = false;
            }
        }
        if rest & ReplyCode::ERROR.0 != 0 {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "ERROR")?;
            first = false;
        }
        if first {
            write!(f, "{:#x}", self.0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_are_stable() {
        assert_eq!(ReplyCode::OK.bits(), 0);
        assert_eq!(ReplyCode::WOULD_BLOCK.bits(), 1);
        assert_eq!(ReplyCode::ERROR.bits(), 1 << 1);
        assert_eq!(ReplyCode::CRITICAL_ERROR.bits(), 1 << 2 | 1 << 1);
        assert_eq!(ReplyCode::CANCELED.bits(), 1 << 3 | 1 << 1);
        assert_eq!(ReplyCode::DISCONNECTED.bits(), 1 << 4);
        assert_eq!(ReplyCode::TIMEOUT.bits(), 1 << 5 | 1 << 1);
        assert_eq!(ReplyCode::NOT_SUPPORTED.bits(), 1 << 6 | 1 << 1);
        assert_eq!(ReplyCode::PASSWORD_FAILED.bits(), 1 << 7 | 1 << 1);
        assert_eq!(ReplyCode::INTERNAL_ERROR.bits(), 1 << 8 | 1 << 1);
    }

    #[test]
    fn error_carrying_codes_contain_error() {
        for code in [
            ReplyCode::CRITICAL_ERROR,
            ReplyCode::CANCELED,
            ReplyCode::TIMEOUT,
            ReplyCode::NOT_SUPPORTED,
            ReplyCode::PASSWORD_FAILED,
            ReplyCode::INTERNAL_ERROR,
        ] {
            assert!(code.is_error(), "{:?} must carry ERROR", code);
        }
        assert!(!ReplyCode::DISCONNECTED.is_error());
        assert!(!ReplyCode::WOULD_BLOCK.is_error());
    }

    #[test]
    fn composition_keeps_all_bits() {
        let code = ReplyCode::ERROR | ReplyCode::DISCONNECTED | ReplyCode::TIMEOUT;
        assert!(code.contains(ReplyCode::ERROR));
        assert!(code.contains(ReplyCode::DISCONNECTED));
        assert!(code.contains(ReplyCode::TIMEOUT));
        assert!(!code.contains(ReplyCode::CANCELED));
    }

    #[test]
    fn canceled_is_distinguishable_from_plain_error() {
        let code = ReplyCode::CANCELED;
        assert!(code.contains(ReplyCode::CANCELED));
        assert!(!ReplyCode::ERROR.contains(ReplyCode::CANCELED));
    }

    #[test]
    fn debug_lists_set_flags() {
        assert_eq!(format!("{:?}", ReplyCode::OK), "OK");
        assert_eq!(format!("{:?}", ReplyCode::ERROR), "ERROR");
        let composed = format!("{:?}", ReplyCode::TIMEOUT | ReplyCode::DISCONNECTED);
        assert!(composed.contains("TIMEOUT"));
        assert!(composed.contains("DISCONNECTED"));
    }
}

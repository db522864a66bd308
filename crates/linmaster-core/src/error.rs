//! Error model
//!
//! Two layers: [`LinError`] for setup and infrastructure failures (port
//! open, baud change, scheduler wiring), and [`ErrorFlags`] for the latched
//! per-transaction error accumulator read and cleared by the caller.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from port setup and engine configuration
#[derive(Error, Debug)]
pub enum LinError {
    /// Underlying serial port failure
    #[error("serial port error: {0}")]
    Serial(String),

    /// I/O failure on the transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Background mode was requested on an engine built without a scheduler
    #[error("background mode requires a scheduler")]
    NoScheduler,

    /// Requested port does not exist
    #[error("port not found: {0}")]
    PortNotFound(String),
}

/// Latched transaction error accumulator.
///
/// Flags are OR-accumulated across transactions and persist until the
/// caller explicitly clears them; a successful transaction does not reset
/// previously latched flags.
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorFlags(u8);

impl ErrorFlags {
    /// No error
    pub const NONE: ErrorFlags = ErrorFlags(0x00);
    /// Engine was not in a state that permits the operation
    pub const STATE: ErrorFlags = ErrorFlags(0x01);
    /// Read-back bytes did not match what was written
    pub const ECHO: ErrorFlags = ErrorFlags(0x02);
    /// Expected bytes did not arrive within the timing budget
    pub const TIMEOUT: ErrorFlags = ErrorFlags(0x04);
    /// Received checksum did not match the recomputed value
    pub const CHECKSUM: ErrorFlags = ErrorFlags(0x08);
    /// Transport-layer failure during a transaction
    pub const MISC: ErrorFlags = ErrorFlags(0x80);

    /// True if no flag is set
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// True if every flag in `other` is set in `self`
    pub fn contains(self, other: ErrorFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bit representation
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Reconstruct from raw bits, keeping only defined flags
    pub fn from_bits(bits: u8) -> ErrorFlags {
        ErrorFlags(bits & 0x8F)
    }
}

impl BitOr for ErrorFlags {
    type Output = ErrorFlags;

    fn bitor(self, rhs: ErrorFlags) -> ErrorFlags {
        ErrorFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ErrorFlags {
    fn bitor_assign(&mut self, rhs: ErrorFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ErrorFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return write!(f, "NONE");
        }
        let mut first = true;
        for (flag, name) in [
            (ErrorFlags::STATE, "STATE"),
            (ErrorFlags::ECHO, "ECHO"),
            (ErrorFlags::TIMEOUT, "TIMEOUT"),
            (ErrorFlags::CHECKSUM, "CHECKSUM"),
            (ErrorFlags::MISC, "MISC"),
        ] {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accumulate_with_or() {
        let mut flags = ErrorFlags::NONE;
        flags |= ErrorFlags::ECHO;
        flags |= ErrorFlags::TIMEOUT;
        assert!(flags.contains(ErrorFlags::ECHO));
        assert!(flags.contains(ErrorFlags::TIMEOUT));
        assert!(!flags.contains(ErrorFlags::CHECKSUM));
        assert!(!flags.is_ok());
    }

    #[test]
    fn default_is_none() {
        assert!(ErrorFlags::default().is_ok());
        assert_eq!(ErrorFlags::default(), ErrorFlags::NONE);
    }

    #[test]
    fn debug_lists_set_flags() {
        assert_eq!(format!("{:?}", ErrorFlags::NONE), "NONE");
        assert_eq!(format!("{:?}", ErrorFlags::STATE), "STATE");
        let both = ErrorFlags::ECHO | ErrorFlags::MISC;
        assert_eq!(format!("{:?}", both), "ECHO|MISC");
    }

    #[test]
    fn bits_roundtrip() {
        let flags = ErrorFlags::STATE | ErrorFlags::CHECKSUM;
        assert_eq!(ErrorFlags::from_bits(flags.bits()), flags);
        // undefined bits are dropped
        assert_eq!(ErrorFlags::from_bits(0xFF), ErrorFlags::from_bits(0x8F));
    }

    #[test]
    fn lin_error_display() {
        let err = LinError::Serial("busy".into());
        assert_eq!(err.to_string(), "serial port error: busy");
        assert!(!LinError::NoScheduler.to_string().is_empty());
    }
}

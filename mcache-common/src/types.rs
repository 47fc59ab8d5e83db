//! # Protocol Type Definitions
//!
//! Opcodes, status codes, and size limits of the memcached binary protocol.
//!
//! ## Design Principles
//!
//! 1. **Exact Wire Values**: Every enum maps 1:1 to the byte values real
//!    servers use, so frames interoperate without translation tables.
//! 2. **Lossless Status Codes**: Unknown status codes are preserved as
//!    `Status::Other` instead of being collapsed into a generic failure.
//! 3. **Compile-Time Limits**: Key and value limits are constants so both the
//!    encoder and the client can check them before touching a socket.

use std::fmt;

/// Maximum key size in bytes accepted by memcached.
pub const MAX_KEY_LEN: usize = 250;

/// Maximum value size in bytes (default memcached item size limit, 1 MiB).
pub const MAX_VALUE_LEN: usize = 1024 * 1024;

/// Largest frame body the decoder will wait for before declaring a desync.
pub const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Counter expiration value telling the server not to create a missing key.
///
/// With this expiration an increment/decrement of a missing key answers
/// `KeyNotFound` instead of storing the initial value.
pub const DELTA_NO_ADD: u32 = 0xffff_ffff;

/// Command opcodes supported by the client.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Noop = 0x0a,
    Version = 0x0b,
    Stat = 0x10,
}

impl Opcode {
    /// Returns the opcode byte.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses an opcode byte.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Opcode::Get),
            0x01 => Some(Opcode::Set),
            0x02 => Some(Opcode::Add),
            0x03 => Some(Opcode::Replace),
            0x04 => Some(Opcode::Delete),
            0x05 => Some(Opcode::Increment),
            0x06 => Some(Opcode::Decrement),
            0x0a => Some(Opcode::Noop),
            0x0b => Some(Opcode::Version),
            0x10 => Some(Opcode::Stat),
            _ => None,
        }
    }

    /// Human-readable command name for logs.
    pub const fn name(self) -> &'static str {
        match self {
            Opcode::Get => "get",
            Opcode::Set => "set",
            Opcode::Add => "add",
            Opcode::Replace => "replace",
            Opcode::Delete => "delete",
            Opcode::Increment => "increment",
            Opcode::Decrement => "decrement",
            Opcode::Noop => "noop",
            Opcode::Version => "version",
            Opcode::Stat => "stat",
        }
    }

    /// Returns true for commands whose request must carry a key.
    pub const fn requires_key(self) -> bool {
        matches!(
            self,
            Opcode::Get
                | Opcode::Set
                | Opcode::Add
                | Opcode::Replace
                | Opcode::Delete
                | Opcode::Increment
                | Opcode::Decrement
        )
    }

    /// Request extras length mandated by the opcode.
    pub const fn request_extras_len(self) -> usize {
        match self {
            Opcode::Set | Opcode::Add | Opcode::Replace => 8,
            Opcode::Increment | Opcode::Decrement => 20,
            _ => 0,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Opcode::from_u8(value).ok_or(value)
    }
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    NoError,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    ItemNotStored,
    NonNumeric,
    UnknownCommand,
    OutOfMemory,
    /// Any status this client does not name, kept verbatim.
    Other(u16),
}

impl Status {
    /// Parses a status word.
    pub const fn from_u16(value: u16) -> Self {
        match value {
            0x0000 => Status::NoError,
            0x0001 => Status::KeyNotFound,
            0x0002 => Status::KeyExists,
            0x0003 => Status::ValueTooLarge,
            0x0004 => Status::InvalidArguments,
            0x0005 => Status::ItemNotStored,
            0x0006 => Status::NonNumeric,
            0x0081 => Status::UnknownCommand,
            0x0082 => Status::OutOfMemory,
            other => Status::Other(other),
        }
    }

    /// Returns the status word.
    pub const fn as_u16(self) -> u16 {
        match self {
            Status::NoError => 0x0000,
            Status::KeyNotFound => 0x0001,
            Status::KeyExists => 0x0002,
            Status::ValueTooLarge => 0x0003,
            Status::InvalidArguments => 0x0004,
            Status::ItemNotStored => 0x0005,
            Status::NonNumeric => 0x0006,
            Status::UnknownCommand => 0x0081,
            Status::OutOfMemory => 0x0082,
            Status::Other(value) => value,
        }
    }

    #[inline]
    pub const fn is_success(self) -> bool {
        matches!(self, Status::NoError)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::NoError => f.write_str("no error"),
            Status::KeyNotFound => f.write_str("key not found"),
            Status::KeyExists => f.write_str("key exists"),
            Status::ValueTooLarge => f.write_str("value too large"),
            Status::InvalidArguments => f.write_str("invalid arguments"),
            Status::ItemNotStored => f.write_str("item not stored"),
            Status::NonNumeric => f.write_str("incr/decr on non-numeric value"),
            Status::UnknownCommand => f.write_str("unknown command"),
            Status::OutOfMemory => f.write_str("out of memory"),
            Status::Other(code) => write!(f, "status {:#06x}", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for byte in 0u8..=0xff {
            if let Some(op) = Opcode::from_u8(byte) {
                assert_eq!(op.as_u8(), byte);
            }
        }
        assert_eq!(Opcode::from_u8(0x10), Some(Opcode::Stat));
        assert_eq!(Opcode::try_from(0x42), Err(0x42));
    }

    #[test]
    fn test_extras_layout() {
        assert_eq!(Opcode::Set.request_extras_len(), 8);
        assert_eq!(Opcode::Increment.request_extras_len(), 20);
        assert_eq!(Opcode::Get.request_extras_len(), 0);
        assert!(Opcode::Delete.requires_key());
        assert!(!Opcode::Stat.requires_key());
    }

    #[test]
    fn test_status_words() {
        assert_eq!(Status::from_u16(1), Status::KeyNotFound);
        assert_eq!(Status::from_u16(2), Status::KeyExists);
        assert_eq!(Status::from_u16(0x81), Status::UnknownCommand);
        assert_eq!(Status::from_u16(0x20), Status::Other(0x20));
        assert_eq!(Status::Other(0x20).as_u16(), 0x20);
        assert!(Status::NoError.is_success());
        assert!(!Status::KeyExists.is_success());
    }
}

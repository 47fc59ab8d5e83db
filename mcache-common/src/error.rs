//! # Protocol Errors
//!
//! Purpose: Describe every way a frame can be rejected by the codec, either
//! before it is encoded or while it is being decoded.
//!
//! ## Design Principles
//! 1. **Typed Failures**: Callers match on variants, never on strings.
//! 2. **Copyable Context**: Variants carry plain numbers so errors stay `Clone`.

use thiserror::Error;

use crate::types::{MAX_KEY_LEN, MAX_VALUE_LEN};

/// Result alias for codec operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding binary protocol frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Key-addressed commands require a non-empty key.
    #[error("key must not be empty")]
    EmptyKey,
    /// Key exceeds the protocol limit.
    #[error("key length {len} exceeds maximum of {MAX_KEY_LEN} bytes")]
    KeyTooLong { len: usize },
    /// Value exceeds the maximum item size.
    #[error("value length {len} exceeds maximum of {MAX_VALUE_LEN} bytes")]
    ValueTooLarge { len: usize },
    /// Frame started with something other than the expected magic byte.
    #[error("bad magic byte {0:#04x}")]
    BadMagic(u8),
    /// Opcode is not one this codec understands.
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    /// Total body length is shorter than the key and extras it announces.
    #[error("body length {body} is smaller than key and extras ({fixed} bytes)")]
    InconsistentLength { body: usize, fixed: usize },
    /// Announced body is larger than any frame we are willing to buffer.
    #[error("frame body of {len} bytes exceeds the frame limit")]
    FrameTooLarge { len: usize },
    /// Extras length does not match the layout of the opcode.
    #[error("unexpected extras length {len} for opcode {opcode:#04x}")]
    InvalidExtras { opcode: u8, len: usize },
    /// Counter response body was not a 64-bit integer.
    #[error("counter response body has {len} bytes, expected 8")]
    BadCounter { len: usize },
    /// A response arrived while no request was in flight.
    #[error("unsolicited response with opaque {opaque:#x}")]
    Unsolicited { opaque: u32 },
    /// A response arrived for a request other than the oldest in flight.
    #[error("response opaque {got:#x} does not match in-flight request {expected:#x}")]
    OpaqueMismatch { expected: u32, got: u32 },
    /// Reply decoded fine but does not fit the command that was sent.
    #[error("reply to opcode {opcode:#04x} has an unexpected shape")]
    UnexpectedReply { opcode: u8 },
    /// A response carried a different opcode than its request.
    #[error("response opcode {got:#04x} does not match request opcode {expected:#04x}")]
    OpcodeMismatch { expected: u8, got: u8 },
}

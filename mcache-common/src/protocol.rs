//! # Binary Protocol Codec
//!
//! Purpose: Encode typed requests into memcached binary frames and decode
//! response frames back into typed values, without performing any I/O.
//!
//! ## Design Principles
//!
//! 1. **Stateless Transform**: `encode` and `decode_*` are pure functions over
//!    byte buffers; the caller owns sockets and buffering.
//! 2. **Incremental Decoding**: A partial header or body yields
//!    `Decode::NeedMoreData` so callers can keep reading without blocking.
//! 3. **Frame Atomicity**: Requests are validated before the first byte is
//!    written, so a failed encode never leaves half a frame in the buffer.
//! 4. **Big-Endian Everywhere**: Multi-byte integers follow network order.
//!
//! ## Frame Layout
//!
//! ```text
//! Header (24 bytes total):
//! +-------+--------+---------+----------+-----------+-----------------+
//! | magic | opcode | key_len | extra_len| data_type | vbucket/status  |
//! | 1B    | 1B     | 2B      | 1B       | 1B        | 2B              |
//! +-------+--------+---------+----------+-----------+-----------------+
//! | total body length: 4B   | opaque: 4B                              |
//! +-------------------------+-----------------------------------------+
//! | cas: 8B                                                           |
//! +-------------------------------------------------------------------+
//!
//! Body (total body length bytes):
//! +---------------+-----------+--------------+
//! | extras        | key       | value        |
//! +---------------+-----------+--------------+
//!
//! Storage extras (set/add/replace, 8 bytes):  flags:4B | expiration:4B
//! Counter extras (incr/decr, 20 bytes):       delta:8B | initial:8B | expiration:4B
//! Get response extras (4 bytes):              flags:4B
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};
use crate::types::{Opcode, Status, MAX_BODY_LEN, MAX_KEY_LEN, MAX_VALUE_LEN};

/// Fixed header size for requests and responses.
pub const HEADER_LEN: usize = 24;

/// Magic byte opening every request frame.
pub const REQUEST_MAGIC: u8 = 0x80;

/// Magic byte opening every response frame.
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Raw data type; the only one defined by the protocol.
const DATA_TYPE_RAW: u8 = 0x00;

/// Outcome of an incremental decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decode<T> {
    /// A whole frame was parsed from the first `consumed` bytes.
    Complete { frame: T, consumed: usize },
    /// The buffer holds only part of a frame.
    NeedMoreData,
}

/// Fixed frame header shared by both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u8,
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub data_type: u8,
    /// vbucket id in requests, status word in responses.
    pub vbucket_or_status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    /// Parses a header from the first 24 bytes, or returns `None` when fewer
    /// bytes are available.
    pub fn parse(buf: &[u8]) -> Option<Header> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(Header {
            magic: buf[0],
            opcode: buf[1],
            key_len: u16::from_be_bytes([buf[2], buf[3]]),
            extras_len: buf[4],
            data_type: buf[5],
            vbucket_or_status: u16::from_be_bytes([buf[6], buf[7]]),
            body_len: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            opaque: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            cas: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
        })
    }

    /// Appends the header in wire order.
    pub fn write(&self, out: &mut BytesMut) {
        out.put_u8(self.magic);
        out.put_u8(self.opcode);
        out.put_u16(self.key_len);
        out.put_u8(self.extras_len);
        out.put_u8(self.data_type);
        out.put_u16(self.vbucket_or_status);
        out.put_u32(self.body_len);
        out.put_u32(self.opaque);
        out.put_u64(self.cas);
    }

    fn validate(&self, expected_magic: u8) -> ProtocolResult<usize> {
        if self.magic != expected_magic {
            return Err(ProtocolError::BadMagic(self.magic));
        }
        let body = self.body_len as usize;
        let fixed = self.key_len as usize + self.extras_len as usize;
        if body < fixed {
            return Err(ProtocolError::InconsistentLength { body, fixed });
        }
        if body > MAX_BODY_LEN {
            return Err(ProtocolError::FrameTooLarge { len: body });
        }
        Ok(HEADER_LEN + body)
    }
}

/// Request extras, laid out per opcode family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extras {
    None,
    Store { flags: u32, expiration: u32 },
    Counter { delta: u64, initial: u64, expiration: u32 },
}

impl Extras {
    /// Encoded length in bytes.
    pub const fn len(&self) -> usize {
        match self {
            Extras::None => 0,
            Extras::Store { .. } => 8,
            Extras::Counter { .. } => 20,
        }
    }

    pub const fn is_empty(&self) -> bool {
        matches!(self, Extras::None)
    }

    fn put(&self, out: &mut BytesMut) {
        match *self {
            Extras::None => {}
            Extras::Store { flags, expiration } => {
                out.put_u32(flags);
                out.put_u32(expiration);
            }
            Extras::Counter {
                delta,
                initial,
                expiration,
            } => {
                out.put_u64(delta);
                out.put_u64(initial);
                out.put_u32(expiration);
            }
        }
    }

    fn parse(opcode: Opcode, raw: &[u8]) -> ProtocolResult<Extras> {
        if raw.len() != opcode.request_extras_len() {
            return Err(ProtocolError::InvalidExtras {
                opcode: opcode.as_u8(),
                len: raw.len(),
            });
        }
        Ok(match raw.len() {
            8 => Extras::Store {
                flags: be_u32(&raw[0..4]),
                expiration: be_u32(&raw[4..8]),
            },
            20 => Extras::Counter {
                delta: be_u64(&raw[0..8]),
                initial: be_u64(&raw[8..16]),
                expiration: be_u32(&raw[16..20]),
            },
            _ => Extras::None,
        })
    }
}

/// A single command addressed to one server.
///
/// Built through the per-command constructors, which pick the extras layout
/// the opcode requires. The opaque is assigned by whoever sends the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub opcode: Opcode,
    pub key: Bytes,
    pub value: Bytes,
    pub extras: Extras,
    /// Compare-and-swap version; zero means unconditional.
    pub cas: u64,
    pub opaque: u32,
}

impl Request {
    fn new(opcode: Opcode, key: &[u8], value: &[u8], extras: Extras) -> Self {
        Request {
            opcode,
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
            extras,
            cas: 0,
            opaque: 0,
        }
    }

    pub fn get(key: &[u8]) -> Self {
        Request::new(Opcode::Get, key, &[], Extras::None)
    }

    pub fn set(key: &[u8], value: &[u8], flags: u32, expiration: u32) -> Self {
        Request::new(Opcode::Set, key, value, Extras::Store { flags, expiration })
    }

    pub fn add(key: &[u8], value: &[u8], flags: u32, expiration: u32) -> Self {
        Request::new(Opcode::Add, key, value, Extras::Store { flags, expiration })
    }

    pub fn replace(key: &[u8], value: &[u8], flags: u32, expiration: u32) -> Self {
        Request::new(Opcode::Replace, key, value, Extras::Store { flags, expiration })
    }

    pub fn delete(key: &[u8]) -> Self {
        Request::new(Opcode::Delete, key, &[], Extras::None)
    }

    pub fn increment(key: &[u8], delta: u64, initial: u64, expiration: u32) -> Self {
        Request::new(
            Opcode::Increment,
            key,
            &[],
            Extras::Counter {
                delta,
                initial,
                expiration,
            },
        )
    }

    pub fn decrement(key: &[u8], delta: u64, initial: u64, expiration: u32) -> Self {
        Request::new(
            Opcode::Decrement,
            key,
            &[],
            Extras::Counter {
                delta,
                initial,
                expiration,
            },
        )
    }

    pub fn noop() -> Self {
        Request::new(Opcode::Noop, &[], &[], Extras::None)
    }

    pub fn version() -> Self {
        Request::new(Opcode::Version, &[], &[], Extras::None)
    }

    /// Stat request; an empty group asks for the general statistics.
    pub fn stat(group: &[u8]) -> Self {
        Request::new(Opcode::Stat, group, &[], Extras::None)
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_opaque(mut self, opaque: u32) -> Self {
        self.opaque = opaque;
        self
    }

    /// Checks protocol limits without encoding.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.opcode.requires_key() && self.key.is_empty() {
            return Err(ProtocolError::EmptyKey);
        }
        if self.key.len() > MAX_KEY_LEN {
            return Err(ProtocolError::KeyTooLong {
                len: self.key.len(),
            });
        }
        if self.value.len() > MAX_VALUE_LEN {
            return Err(ProtocolError::ValueTooLarge {
                len: self.value.len(),
            });
        }
        if self.extras.len() != self.opcode.request_extras_len() {
            return Err(ProtocolError::InvalidExtras {
                opcode: self.opcode.as_u8(),
                len: self.extras.len(),
            });
        }
        Ok(())
    }

    /// Number of bytes `encode` appends for this request.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.extras.len() + self.key.len() + self.value.len()
    }
}

/// Appends one request frame to `out` and returns the number of bytes written.
///
/// Nothing is appended when validation fails.
pub fn encode(request: &Request, out: &mut BytesMut) -> ProtocolResult<usize> {
    request.validate()?;
    let len = request.encoded_len();
    out.reserve(len);
    let body_len = len - HEADER_LEN;
    Header {
        magic: REQUEST_MAGIC,
        opcode: request.opcode.as_u8(),
        key_len: request.key.len() as u16,
        extras_len: request.extras.len() as u8,
        data_type: DATA_TYPE_RAW,
        vbucket_or_status: 0,
        body_len: body_len as u32,
        opaque: request.opaque,
        cas: request.cas,
    }
    .write(out);
    request.extras.put(out);
    out.put_slice(&request.key);
    out.put_slice(&request.value);
    Ok(len)
}

/// Decodes one request frame from the front of `buf`.
pub fn decode_request(buf: &[u8]) -> ProtocolResult<Decode<Request>> {
    let header = match Header::parse(buf) {
        Some(header) => header,
        None => return Ok(Decode::NeedMoreData),
    };
    let frame_len = header.validate(REQUEST_MAGIC)?;
    if buf.len() < frame_len {
        return Ok(Decode::NeedMoreData);
    }
    let opcode = Opcode::from_u8(header.opcode).ok_or(ProtocolError::UnknownOpcode(header.opcode))?;
    let (extras, key, value) = split_body(&header, &buf[HEADER_LEN..frame_len]);
    let request = Request {
        opcode,
        extras: Extras::parse(opcode, extras)?,
        key: Bytes::copy_from_slice(key),
        value: Bytes::copy_from_slice(value),
        cas: header.cas,
        opaque: header.opaque,
    };
    Ok(Decode::Complete {
        frame: request,
        consumed: frame_len,
    })
}

/// A single server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub opcode: Opcode,
    pub status: Status,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Response {
    /// Builds an empty reply to `opcode`.
    pub fn new(opcode: Opcode, status: Status, opaque: u32) -> Self {
        Response {
            opcode,
            status,
            opaque,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.extras = Bytes::copy_from_slice(&flags.to_be_bytes());
        self
    }

    pub fn with_key(mut self, key: &[u8]) -> Self {
        self.key = Bytes::copy_from_slice(key);
        self
    }

    pub fn with_value(mut self, value: &[u8]) -> Self {
        self.value = Bytes::copy_from_slice(value);
        self
    }

    /// Flags carried by a get reply, if any.
    pub fn flags(&self) -> Option<u32> {
        if self.extras.len() >= 4 {
            Some(be_u32(&self.extras[0..4]))
        } else {
            None
        }
    }

    /// New counter value carried by an increment/decrement reply.
    pub fn counter(&self) -> ProtocolResult<u64> {
        if self.value.len() != 8 {
            return Err(ProtocolError::BadCounter {
                len: self.value.len(),
            });
        }
        Ok(be_u64(&self.value))
    }

    /// True for the empty frame that closes a stat sequence.
    pub fn is_stat_terminator(&self) -> bool {
        self.opcode == Opcode::Stat && self.key.is_empty()
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.extras.len() + self.key.len() + self.value.len()
    }
}

/// Appends one response frame to `out` and returns the number of bytes written.
pub fn encode_response(response: &Response, out: &mut BytesMut) -> usize {
    let len = response.encoded_len();
    out.reserve(len);
    Header {
        magic: RESPONSE_MAGIC,
        opcode: response.opcode.as_u8(),
        key_len: response.key.len() as u16,
        extras_len: response.extras.len() as u8,
        data_type: DATA_TYPE_RAW,
        vbucket_or_status: response.status.as_u16(),
        body_len: (len - HEADER_LEN) as u32,
        opaque: response.opaque,
        cas: response.cas,
    }
    .write(out);
    out.put_slice(&response.extras);
    out.put_slice(&response.key);
    out.put_slice(&response.value);
    len
}

/// Decodes one response frame from the front of `buf`.
///
/// Returns `NeedMoreData` for a partial header or body. Errors mean the
/// stream is desynchronized and the connection must be discarded.
pub fn decode_response(buf: &[u8]) -> ProtocolResult<Decode<Response>> {
    let header = match Header::parse(buf) {
        Some(header) => header,
        None => return Ok(Decode::NeedMoreData),
    };
    let frame_len = header.validate(RESPONSE_MAGIC)?;
    if buf.len() < frame_len {
        return Ok(Decode::NeedMoreData);
    }
    let opcode = Opcode::from_u8(header.opcode).ok_or(ProtocolError::UnknownOpcode(header.opcode))?;
    let (extras, key, value) = split_body(&header, &buf[HEADER_LEN..frame_len]);
    let response = Response {
        opcode,
        status: Status::from_u16(header.vbucket_or_status),
        opaque: header.opaque,
        cas: header.cas,
        extras: Bytes::copy_from_slice(extras),
        key: Bytes::copy_from_slice(key),
        value: Bytes::copy_from_slice(value),
    };
    Ok(Decode::Complete {
        frame: response,
        consumed: frame_len,
    })
}

fn split_body<'a>(header: &Header, body: &'a [u8]) -> (&'a [u8], &'a [u8], &'a [u8]) {
    let extras_end = header.extras_len as usize;
    let key_end = extras_end + header.key_len as usize;
    (&body[..extras_end], &body[extras_end..key_end], &body[key_end..])
}

#[inline]
fn be_u32(raw: &[u8]) -> u32 {
    u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])
}

#[inline]
fn be_u64(raw: &[u8]) -> u64 {
    u64::from_be_bytes([
        raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
    ])
}

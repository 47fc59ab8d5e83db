//! # Server Connection
//!
//! Purpose: Own the socket to one server together with its buffers, its
//! queue of pending commands, and its health state.
//!
//! ## Design Principles
//! 1. **Explicit State Machine**: Every transition goes through `ConnState`
//!    and records the timestamps that gate reconnection.
//! 2. **Frame-Atomic Writes**: Whole frames enter `outbound`; a partially
//!    written frame is always finished, never truncated.
//! 3. **Non-Blocking I/O**: All socket calls stop at `WouldBlock`; the
//!    driver decides when to wait.
//! 4. **Fail Loudly, Fail Once**: A failure closes the socket and completes
//!    every live slot with a retryable error in one place (`fail`).
//!
//! ## State Machine
//!
//! ```text
//!  Disconnected ──┐
//!                 ├─(work + retry eligible)─> Connecting ──(established)──> Connected
//!  Dead <─────────┘                              │                            │
//!   ^                                            │ (error / connect timeout)  │ (io error, close,
//!   └────────────────────────────────────────────┴────────────────────────────┘  desync)
//! ```
//!
//! A `Dead` server is retry eligible once both `last_failure + dead` and
//! `last_attempt + reconnect` have passed; before that, commands routed to it
//! fail immediately without touching the network.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Instant;

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use thiserror::Error;

use mcache_common::{decode_response, encode, Decode, ProtocolError, Request, Response};

use crate::buffer::{Finished, Pending};
use crate::config::{ServerAddr, Timeouts};
use crate::error::{ClientError, ClientResult};
use crate::log::{log_event, LogSink};

const READ_CHUNK: usize = 16 * 1024;
/// Unanswered frames one socket may carry after their callers gave up.
const MAX_ABANDONED: usize = 32;

/// Health state of a server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Dead,
}

/// A server entry of the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    /// Position in the configured list.
    pub index: usize,
    pub addr: ServerAddr,
}

/// Point-in-time view of one server connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub server: Server,
    pub state: ConnState,
    /// Number of connection attempts made so far.
    pub connect_attempts: u64,
    pub last_attempt: Option<Instant>,
    pub last_failure: Option<Instant>,
    /// Commands queued or awaiting a reply that someone still waits for.
    pub pending: usize,
}

/// Why a connection was torn down.
#[derive(Debug, Error)]
pub(crate) enum Failure {
    #[error("address resolution failed: {0}")]
    Resolve(io::Error),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("{0}")]
    Io(io::Error),
    #[error("connection closed by server")]
    Closed,
    #[error("protocol desync: {0}")]
    Protocol(ProtocolError),
    #[error("server removed from pool")]
    Removed,
    #[error("{0} timed-out requests still unanswered")]
    Unresponsive(usize),
}

enum ConnectProgress {
    Established,
    InProgress,
    Failed(Failure),
}

pub(crate) struct Connection {
    server: Server,
    token: Token,
    state: ConnState,
    stream: Option<TcpStream>,
    last_attempt: Option<Instant>,
    last_failure: Option<Instant>,
    connect_deadline: Option<Instant>,
    connect_attempts: u64,
    /// Encoded frames not yet fully written, back to back.
    outbound: BytesMut,
    /// Bytes of the first `unsent` frame already on the wire.
    head_written: usize,
    unsent: VecDeque<Pending>,
    awaiting: VecDeque<Pending>,
    inbound: BytesMut,
}

impl Connection {
    pub(crate) fn new(server: Server, token: Token) -> Self {
        Connection {
            server,
            token,
            state: ConnState::Disconnected,
            stream: None,
            last_attempt: None,
            last_failure: None,
            connect_deadline: None,
            connect_attempts: 0,
            outbound: BytesMut::with_capacity(4 * 1024),
            head_written: 0,
            unsent: VecDeque::new(),
            awaiting: VecDeque::new(),
            inbound: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    pub(crate) fn server(&self) -> &Server {
        &self.server
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.server.index = index;
    }

    pub(crate) fn state(&self) -> ConnState {
        self.state
    }

    pub(crate) fn connect_deadline(&self) -> Option<Instant> {
        match self.state {
            ConnState::Connecting => self.connect_deadline,
            _ => None,
        }
    }

    pub(crate) fn status(&self) -> ServerStatus {
        ServerStatus {
            server: self.server.clone(),
            state: self.state,
            connect_attempts: self.connect_attempts,
            last_attempt: self.last_attempt,
            last_failure: self.last_failure,
            pending: self.live_count(|_| true),
        }
    }

    /// Counts live slots matching `pred`.
    pub(crate) fn live_count(&self, pred: impl Fn(&Pending) -> bool) -> usize {
        self.unsent
            .iter()
            .chain(self.awaiting.iter())
            .filter(|pending| pending.is_live() && pred(*pending))
            .count()
    }

    /// Returns true when a new connection attempt is allowed at `now`.
    pub(crate) fn retry_eligible(&self, now: Instant, timeouts: &Timeouts) -> bool {
        let failure = match self.last_failure {
            Some(at) => at,
            None => return true,
        };
        let attempt_ok = match self.last_attempt {
            Some(at) => now >= at + timeouts.reconnect,
            None => true,
        };
        now >= failure + timeouts.dead && attempt_ok
    }

    /// Error for commands that hit this server while it is excluded.
    pub(crate) fn dead_error(&self) -> ClientError {
        ClientError::Connection {
            server: self.server.addr.to_string(),
            reason: "server is marked dead".to_string(),
        }
    }

    /// Appends one encoded frame and its slot.
    pub(crate) fn enqueue(&mut self, request: &Request, pending: Pending) -> ClientResult<()> {
        encode(request, &mut self.outbound)?;
        self.unsent.push_back(pending);
        Ok(())
    }

    /// Moves the connection forward without waiting: starts connects, checks
    /// connect completion and deadlines, and writes queued frames.
    pub(crate) fn make_progress(
        &mut self,
        registry: &Registry,
        now: Instant,
        timeouts: &Timeouts,
        log: &dyn LogSink,
        finished: &mut Vec<Finished>,
    ) {
        match self.state {
            ConnState::Disconnected | ConnState::Dead => {
                if self.unsent.is_empty() {
                    return;
                }
                if self.retry_eligible(now, timeouts) {
                    self.start_connect(registry, now, timeouts, log, finished);
                } else {
                    self.short_circuit(finished);
                }
            }
            ConnState::Connecting => self.poll_connect(registry, now, log, finished),
            ConnState::Connected => {}
        }
        if self.state == ConnState::Connected && !self.outbound.is_empty() {
            if let Err(err) = self.write_pending() {
                self.fail(registry, now, Failure::Io(err), log, finished);
            }
        }
    }

    /// Handles a readiness event for this connection's token.
    pub(crate) fn on_ready(
        &mut self,
        registry: &Registry,
        now: Instant,
        readable: bool,
        writable: bool,
        log: &dyn LogSink,
        finished: &mut Vec<Finished>,
    ) {
        match self.state {
            ConnState::Connecting => {
                self.poll_connect(registry, now, log, finished);
                if self.state == ConnState::Connected {
                    if let Err(err) = self.write_pending() {
                        self.fail(registry, now, Failure::Io(err), log, finished);
                    }
                }
            }
            ConnState::Connected => {
                if readable {
                    if let Err(failure) = self.read_available(finished) {
                        self.fail(registry, now, failure, log, finished);
                        return;
                    }
                }
                if writable {
                    if let Err(err) = self.write_pending() {
                        self.fail(registry, now, Failure::Io(err), log, finished);
                    }
                }
            }
            ConnState::Disconnected | ConnState::Dead => {}
        }
    }

    fn start_connect(
        &mut self,
        registry: &Registry,
        now: Instant,
        timeouts: &Timeouts,
        log: &dyn LogSink,
        finished: &mut Vec<Finished>,
    ) {
        self.last_attempt = Some(now);
        self.connect_attempts += 1;
        let addr = match self.server.addr.resolve() {
            Ok(addr) => addr,
            Err(err) => {
                self.fail(registry, now, Failure::Resolve(err), log, finished);
                return;
            }
        };
        let registered = TcpStream::connect(addr).and_then(|mut stream| {
            registry
                .register(&mut stream, self.token, Interest::READABLE | Interest::WRITABLE)
                .map(|()| stream)
        });
        match registered {
            Ok(stream) => {
                log_event!(log, DEBUG, "connecting to {} ({})", self.server.addr, addr);
                self.stream = Some(stream);
                self.state = ConnState::Connecting;
                self.connect_deadline = Some(now + timeouts.connect);
            }
            Err(err) => self.fail(registry, now, Failure::Io(err), log, finished),
        }
    }

    fn poll_connect(
        &mut self,
        registry: &Registry,
        now: Instant,
        log: &dyn LogSink,
        finished: &mut Vec<Finished>,
    ) {
        let progress = match self.stream.as_ref() {
            None => ConnectProgress::Failed(Failure::Closed),
            Some(stream) => match stream.take_error() {
                Ok(Some(err)) | Err(err) => ConnectProgress::Failed(Failure::Io(err)),
                Ok(None) => match stream.peer_addr() {
                    Ok(_) => {
                        // Small frames; disable Nagle.
                        let _ = stream.set_nodelay(true);
                        ConnectProgress::Established
                    }
                    Err(err) if err.kind() == io::ErrorKind::NotConnected => {
                        ConnectProgress::InProgress
                    }
                    Err(err) => ConnectProgress::Failed(Failure::Io(err)),
                },
            },
        };

        match progress {
            ConnectProgress::Established => {
                if self.last_failure.is_some() {
                    log_event!(log, INFO, "server {} is back", self.server.addr);
                } else {
                    log_event!(log, DEBUG, "connected to {}", self.server.addr);
                }
                self.state = ConnState::Connected;
                self.connect_deadline = None;
            }
            ConnectProgress::InProgress => {
                if self.connect_deadline.map_or(false, |deadline| now >= deadline) {
                    self.fail(registry, now, Failure::ConnectTimeout, log, finished);
                }
            }
            ConnectProgress::Failed(failure) => self.fail(registry, now, failure, log, finished),
        }
    }

    /// Writes queued bytes until the socket would block.
    fn write_pending(&mut self) -> io::Result<()> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Ok(()),
        };
        while !self.outbound.is_empty() {
            match stream.write(&self.outbound) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    ))
                }
                Ok(n) => {
                    self.outbound.advance(n);
                    self.head_written += n;
                    while let Some(front) = self.unsent.front() {
                        if self.head_written < front.frame_len {
                            break;
                        }
                        self.head_written -= front.frame_len;
                        if let Some(sent) = self.unsent.pop_front() {
                            self.awaiting.push_back(sent);
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Reads until the socket would block, then matches complete replies.
    fn read_available(&mut self, finished: &mut Vec<Finished>) -> Result<(), Failure> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(Failure::Closed),
        };
        let mut chunk = [0u8; READ_CHUNK];
        let mut closed = false;
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => self.inbound.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Failure::Io(err)),
            }
        }
        self.decode_inbound(finished)?;
        if closed {
            return Err(Failure::Closed);
        }
        Ok(())
    }

    fn decode_inbound(&mut self, finished: &mut Vec<Finished>) -> Result<(), Failure> {
        loop {
            match decode_response(&self.inbound).map_err(Failure::Protocol)? {
                Decode::NeedMoreData => return Ok(()),
                Decode::Complete { frame, consumed } => {
                    self.inbound.advance(consumed);
                    self.match_response(frame, finished)?;
                }
            }
        }
    }

    fn match_response(
        &mut self,
        response: Response,
        finished: &mut Vec<Finished>,
    ) -> Result<(), Failure> {
        let front = match self.awaiting.front_mut() {
            Some(front) => front,
            None => {
                return Err(Failure::Protocol(ProtocolError::Unsolicited {
                    opaque: response.opaque,
                }))
            }
        };
        if response.opaque != front.opaque {
            return Err(Failure::Protocol(ProtocolError::OpaqueMismatch {
                expected: front.opaque,
                got: response.opaque,
            }));
        }
        if response.opcode != front.opcode {
            return Err(Failure::Protocol(ProtocolError::OpcodeMismatch {
                expected: front.opcode.as_u8(),
                got: response.opcode.as_u8(),
            }));
        }
        let result = match front.accept(response) {
            Some(result) => result,
            None => return Ok(()),
        };
        if let Some(pending) = self.awaiting.pop_front() {
            if pending.is_live() {
                finished.push(Finished {
                    server: self.server.index,
                    pending,
                    result,
                });
            }
        }
        Ok(())
    }

    /// Completes every live slot with the dead-server error, without I/O.
    fn short_circuit(&mut self, finished: &mut Vec<Finished>) {
        let slots: Vec<Pending> = self.unsent.drain(..).collect();
        for pending in slots {
            if pending.is_live() {
                finished.push(Finished {
                    server: self.server.index,
                    result: Err(self.dead_error()),
                    pending,
                });
            }
        }
        self.outbound.clear();
        self.head_written = 0;
    }

    /// Tears the connection down and completes every live slot.
    ///
    /// The first reply slot receives the protocol error itself on desync;
    /// all others get a retryable connection error.
    pub(crate) fn fail(
        &mut self,
        registry: &Registry,
        now: Instant,
        failure: Failure,
        log: &dyn LogSink,
        finished: &mut Vec<Finished>,
    ) {
        match failure {
            Failure::Removed => log_event!(log, INFO, "closing connection to {}", self.server.addr),
            _ => log_event!(log, WARN, "server {} marked dead: {}", self.server.addr, failure),
        }
        self.close_socket(registry);
        if !matches!(failure, Failure::Removed) {
            self.state = ConnState::Dead;
            self.last_failure = Some(now);
        }

        let reason = failure.to_string();
        let mut protocol_error = match failure {
            Failure::Protocol(err) => Some(err),
            _ => None,
        };
        let slots: Vec<Pending> = self.awaiting.drain(..).chain(self.unsent.drain(..)).collect();
        for pending in slots {
            if !pending.is_live() {
                continue;
            }
            let result = match protocol_error.take() {
                Some(err) => Err(ClientError::Protocol(err)),
                None => Err(ClientError::Connection {
                    server: self.server.addr.to_string(),
                    reason: reason.clone(),
                }),
            };
            finished.push(Finished {
                server: self.server.index,
                pending,
                result,
            });
        }
        self.outbound.clear();
        self.inbound.clear();
        self.head_written = 0;
    }

    fn close_socket(&mut self, registry: &Registry) {
        if let Some(mut stream) = self.stream.take() {
            let _ = registry.deregister(&mut stream);
        }
        self.connect_deadline = None;
    }

    /// Gives up on slots matching `pred`.
    ///
    /// Unsent frames are removed from the outbound buffer, except a frame
    /// that is already partially written: it is finished and, like frames
    /// already on the wire, its reply is read and dropped. Returns the
    /// slots given up on, as they were before being marked.
    pub(crate) fn abandon(&mut self, mut pred: impl FnMut(&Pending) -> bool) -> Vec<Pending> {
        let mut dropped = Vec::new();
        let mut kept = VecDeque::with_capacity(self.unsent.len());
        let mut outbound = BytesMut::with_capacity(self.outbound.len());
        let mut offset = 0;
        for (position, mut pending) in self.unsent.drain(..).enumerate() {
            let partial = position == 0 && self.head_written > 0;
            let len = if position == 0 {
                pending.frame_len - self.head_written
            } else {
                pending.frame_len
            };
            let bytes = &self.outbound[offset..offset + len];
            offset += len;
            if !pending.is_live() || !pred(&pending) {
                outbound.extend_from_slice(bytes);
                kept.push_back(pending);
            } else if partial {
                dropped.push(pending.clone());
                pending.abandoned = true;
                outbound.extend_from_slice(bytes);
                kept.push_back(pending);
            } else {
                dropped.push(pending);
            }
        }
        self.unsent = kept;
        self.outbound = outbound;

        for pending in self.awaiting.iter_mut() {
            if pending.is_live() && pred(&*pending) {
                dropped.push(pending.clone());
                pending.abandoned = true;
            }
        }
        dropped
    }

    /// Marks the server dead once more than `MAX_ABANDONED` written frames
    /// wait for replies nobody reads. Returns true if it did.
    pub(crate) fn shed_unresponsive(
        &mut self,
        registry: &Registry,
        now: Instant,
        log: &dyn LogSink,
        finished: &mut Vec<Finished>,
    ) -> bool {
        let abandoned = self
            .unsent
            .iter()
            .chain(self.awaiting.iter())
            .filter(|pending| !pending.is_live())
            .count();
        if abandoned <= MAX_ABANDONED {
            return false;
        }
        self.fail(registry, now, Failure::Unresponsive(abandoned), log, finished);
        true
    }

    /// Closes the socket of a server leaving the pool.
    pub(crate) fn retire(
        &mut self,
        registry: &Registry,
        now: Instant,
        log: &dyn LogSink,
        finished: &mut Vec<Finished>,
    ) {
        self.fail(registry, now, Failure::Removed, log, finished);
        self.state = ConnState::Disconnected;
    }
}

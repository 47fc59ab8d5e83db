//! # Command Buffer
//!
//! Purpose: Decouple issuing a command from writing it, and match every
//! reply back to the command that produced it.
//!
//! ## Design Principles
//! 1. **FIFO Slots**: Each command owns a pending slot that travels with its
//!    frame through the connection queues; replies arrive in the same order.
//! 2. **Owned Results**: Every finished command yields a freshly owned
//!    `Output`; nothing is aliased between calls.
//! 3. **Explicit Modes**: Direct commands hand their result to the waiting
//!    call, buffered ones are collected for the next `flush`.
//!
//! ## Slot Lifecycle
//!
//! ```text
//! submit ──> Connection.unsent ──(fully written)──> Connection.awaiting
//!                 │                                       │
//!          (reset/timeout:                        (reply matched)
//!           dropped unless                                │
//!           partially written)                            v
//!                                                    Finished ──> CommandBuffer
//!                                                                 ├── direct: seq -> result
//!                                                                 └── completed: Vec<Completion>
//! ```

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use mcache_common::{Opcode, ProtocolError, Request, Response};

use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};

/// Which optional fields a `get` should return alongside the value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetFields {
    pub flags: bool,
    pub cas: bool,
}

impl GetFields {
    /// Value only.
    pub const VALUE: GetFields = GetFields {
        flags: false,
        cas: false,
    };
    pub const WITH_FLAGS: GetFields = GetFields {
        flags: true,
        cas: false,
    };
    pub const WITH_CAS: GetFields = GetFields {
        flags: false,
        cas: true,
    };
    pub const ALL: GetFields = GetFields {
        flags: true,
        cas: true,
    };
}

/// A value fetched by `get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub value: Vec<u8>,
    /// Present only when requested through `GetFields::flags`.
    pub flags: Option<u32>,
    /// Present only when requested through `GetFields::cas`.
    pub cas: Option<u64>,
}

/// Typed result of one finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// delete and noop.
    Done,
    /// set, add and replace, with the item's new CAS version.
    Stored { cas: u64 },
    Item(Item),
    /// New counter value after increment or decrement.
    Counter(u64),
    Stats(BTreeMap<String, String>),
}

/// A buffered command's outcome, returned by `flush`.
#[derive(Debug)]
pub struct Completion {
    /// Index of the server the command was routed to.
    pub server: usize,
    pub opcode: Opcode,
    pub key: Vec<u8>,
    pub result: ClientResult<Output>,
}

/// How a reply must be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expect {
    Item(GetFields),
    Stored,
    Done,
    Counter,
    Stats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    /// A call is blocked waiting for this command.
    Direct,
    /// Queued while buffering was enabled; reported by `flush`.
    Buffered,
}

/// Pending-response slot of one encoded command.
#[derive(Debug, Clone)]
pub(crate) struct Pending {
    pub(crate) seq: u64,
    pub(crate) opaque: u32,
    pub(crate) opcode: Opcode,
    pub(crate) key: Bytes,
    pub(crate) expect: Expect,
    pub(crate) dispatch: Dispatch,
    /// Encoded frame length in bytes.
    pub(crate) frame_len: usize,
    /// Reply will be read and dropped; nobody waits for it any more.
    pub(crate) abandoned: bool,
    stats: BTreeMap<String, String>,
}

impl Pending {
    pub(crate) fn is_live(&self) -> bool {
        !self.abandoned
    }

    /// Feeds one reply frame to the slot.
    ///
    /// Returns `None` while more frames belong to this command (stat
    /// sequences), otherwise the final result.
    pub(crate) fn accept(&mut self, response: Response) -> Option<ClientResult<Output>> {
        if !response.status.is_success() {
            return Some(Err(ClientError::from_status(response.status)));
        }
        let output = match self.expect {
            Expect::Stats => {
                if !response.is_stat_terminator() {
                    self.stats.insert(
                        String::from_utf8_lossy(&response.key).into_owned(),
                        String::from_utf8_lossy(&response.value).into_owned(),
                    );
                    return None;
                }
                Output::Stats(std::mem::take(&mut self.stats))
            }
            Expect::Item(fields) => Output::Item(Item {
                flags: if fields.flags {
                    Some(response.flags().unwrap_or(0))
                } else {
                    None
                },
                cas: if fields.cas { Some(response.cas) } else { None },
                value: response.value.to_vec(),
            }),
            Expect::Stored => Output::Stored { cas: response.cas },
            Expect::Counter => match response.counter() {
                Ok(value) => Output::Counter(value),
                Err(err) => return Some(Err(err.into())),
            },
            Expect::Done => Output::Done,
        };
        Some(Ok(output))
    }
}

/// A slot that reached its end, with the result it carries.
#[derive(Debug)]
pub(crate) struct Finished {
    pub(crate) server: usize,
    pub(crate) pending: Pending,
    pub(crate) result: ClientResult<Output>,
}

/// Per-client command bookkeeping: buffering flag, sequence and opaque
/// counters, and results waiting to be collected.
#[derive(Debug)]
pub(crate) struct CommandBuffer {
    enabled: bool,
    next_seq: u64,
    next_opaque: u32,
    direct: HashMap<u64, ClientResult<Output>>,
    completed: Vec<(u64, Completion)>,
}

impl CommandBuffer {
    pub(crate) fn new(enabled: bool) -> Self {
        CommandBuffer {
            enabled,
            next_seq: 0,
            next_opaque: 0,
            direct: HashMap::new(),
            completed: Vec::new(),
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub(crate) fn dispatch_mode(&self) -> Dispatch {
        if self.enabled {
            Dispatch::Buffered
        } else {
            Dispatch::Direct
        }
    }

    /// Encodes `request` onto the connection's outbound queue.
    ///
    /// The frame is validated first, so a rejected request leaves the queue
    /// untouched.
    pub(crate) fn submit(
        &mut self,
        conn: &mut Connection,
        request: Request,
        expect: Expect,
        dispatch: Dispatch,
    ) -> ClientResult<u64> {
        request.validate()?;
        let seq = self.next_seq;
        let opaque = self.next_opaque;
        let request = request.with_opaque(opaque);
        let pending = Pending {
            seq,
            opaque,
            opcode: request.opcode,
            key: request.key.clone(),
            expect,
            dispatch,
            frame_len: request.encoded_len(),
            abandoned: false,
            stats: BTreeMap::new(),
        };
        conn.enqueue(&request, pending)?;
        self.next_seq += 1;
        self.next_opaque = self.next_opaque.wrapping_add(1);
        Ok(seq)
    }

    /// Stores results of finished slots where their consumers will look.
    pub(crate) fn absorb(&mut self, finished: Vec<Finished>) {
        for Finished {
            server,
            pending,
            result,
        } in finished
        {
            match pending.dispatch {
                Dispatch::Direct => {
                    self.direct.insert(pending.seq, result);
                }
                Dispatch::Buffered => self.completed.push((
                    pending.seq,
                    Completion {
                        server,
                        opcode: pending.opcode,
                        key: pending.key.to_vec(),
                        result,
                    },
                )),
            }
        }
    }

    pub(crate) fn has_direct(&self, seq: u64) -> bool {
        self.direct.contains_key(&seq)
    }

    pub(crate) fn take_direct(&mut self, seq: u64) -> Option<ClientResult<Output>> {
        self.direct.remove(&seq)
    }

    /// Removes every collected completion, in issue order.
    pub(crate) fn drain_completions(&mut self) -> Vec<Completion> {
        let mut completed = std::mem::take(&mut self.completed);
        completed.sort_by_key(|(seq, _)| *seq);
        completed.into_iter().map(|(_, completion)| completion).collect()
    }

    /// Forgets collected completions that nobody flushed.
    pub(crate) fn clear_completions(&mut self) {
        self.completed.clear();
    }

    pub(crate) fn pending_completions(&self) -> usize {
        self.completed.len()
    }
}

/// Error for a reply whose shape does not fit the command that was sent.
pub(crate) fn unexpected_output(opcode: Opcode) -> ClientError {
    ClientError::Protocol(ProtocolError::UnexpectedReply {
        opcode: opcode.as_u8(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcache_common::Status;

    fn pending(expect: Expect) -> Pending {
        Pending {
            seq: 0,
            opaque: 0,
            opcode: Opcode::Get,
            key: Bytes::from_static(b"k"),
            expect,
            dispatch: Dispatch::Direct,
            frame_len: 0,
            abandoned: false,
            stats: BTreeMap::new(),
        }
    }

    #[test]
    fn item_fields_are_opt_in() {
        let reply = Response::new(Opcode::Get, Status::NoError, 0)
            .with_flags(7)
            .with_cas(11)
            .with_value(b"v");
        let value_only = pending(Expect::Item(GetFields::VALUE)).accept(reply.clone());
        assert_eq!(
            value_only.unwrap().unwrap(),
            Output::Item(Item {
                value: b"v".to_vec(),
                flags: None,
                cas: None
            })
        );
        let all = pending(Expect::Item(GetFields::ALL)).accept(reply);
        assert_eq!(
            all.unwrap().unwrap(),
            Output::Item(Item {
                value: b"v".to_vec(),
                flags: Some(7),
                cas: Some(11)
            })
        );
    }

    #[test]
    fn stats_accumulate_until_terminator() {
        let mut slot = pending(Expect::Stats);
        let entry = |k: &[u8], v: &[u8]| {
            Response::new(Opcode::Stat, Status::NoError, 0)
                .with_key(k)
                .with_value(v)
        };
        assert!(slot.accept(entry(b"pid", b"42")).is_none());
        assert!(slot.accept(entry(b"uptime", b"7")).is_none());
        let done = slot
            .accept(Response::new(Opcode::Stat, Status::NoError, 0))
            .unwrap()
            .unwrap();
        match done {
            Output::Stats(stats) => {
                assert_eq!(stats.len(), 2);
                assert_eq!(stats["pid"], "42");
            }
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[test]
    fn failure_status_maps_to_error() {
        let miss = Response::new(Opcode::Get, Status::KeyNotFound, 0);
        let result = pending(Expect::Item(GetFields::VALUE)).accept(miss).unwrap();
        assert!(matches!(result, Err(ClientError::NotFound)));

        let bad_counter = Response::new(Opcode::Increment, Status::NoError, 0).with_value(b"x");
        let result = pending(Expect::Counter).accept(bad_counter).unwrap();
        assert!(matches!(result, Err(ClientError::Protocol(_))));
    }

    #[test]
    fn completions_come_back_in_issue_order() {
        let mut buffer = CommandBuffer::new(true);
        let finished = |seq: u64| {
            let mut slot = pending(Expect::Done);
            slot.seq = seq;
            slot.dispatch = Dispatch::Buffered;
            Finished {
                server: (seq % 2) as usize,
                pending: slot,
                result: Ok(Output::Done),
            }
        };
        buffer.absorb(vec![finished(2), finished(0)]);
        buffer.absorb(vec![finished(1)]);
        assert_eq!(buffer.pending_completions(), 3);
        let servers: Vec<usize> = buffer.drain_completions().iter().map(|c| c.server).collect();
        assert_eq!(servers, vec![0, 1, 0]);
        assert_eq!(buffer.pending_completions(), 0);
    }
}

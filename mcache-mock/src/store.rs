//! # Mock Item Store
//!
//! Purpose: Execute decoded requests against an in-memory item table with
//! memcached semantics (CAS versions, expiration, counters, stats).
//!
//! ## Design Principles
//! 1. **Single Lock**: One `parking_lot::Mutex` guards items and counters;
//!    every request is applied atomically.
//! 2. **Protocol Statuses**: Outcomes are expressed as response statuses, so
//!    the connection loop never branches on command semantics.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use mcache_common::{Extras, Opcode, Request, Response, Status, DELTA_NO_ADD};
use parking_lot::Mutex;

/// Expirations up to this many seconds are relative to now.
const RELATIVE_EXPIRATION_LIMIT: u32 = 60 * 60 * 24 * 30;

pub const VERSION: &str = "1.6.0-mock";

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
    expires_at: Option<SystemTime>,
}

impl Entry {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

#[derive(Debug, Default)]
struct Counters {
    cmd_get: u64,
    cmd_set: u64,
    get_hits: u64,
    get_misses: u64,
    total_connections: u64,
}

#[derive(Debug, Default)]
struct Inner {
    items: HashMap<Vec<u8>, Entry>,
    next_cas: u64,
    counters: Counters,
}

impl Inner {
    fn live(&mut self, key: &[u8], now: SystemTime) -> Option<&mut Entry> {
        if self.items.get(key).map_or(false, |entry| entry.is_expired(now)) {
            self.items.remove(key);
        }
        self.items.get_mut(key)
    }

    fn bump_cas(&mut self) -> u64 {
        self.next_cas += 1;
        self.next_cas
    }
}

/// Shared item table of one mock server.
#[derive(Debug)]
pub struct Store {
    inner: Mutex<Inner>,
    started: Instant,
}

impl Default for Store {
    fn default() -> Self {
        Store::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Store {
            inner: Mutex::new(Inner::default()),
            started: Instant::now(),
        }
    }

    pub(crate) fn connection_opened(&self) {
        self.inner.lock().counters.total_connections += 1;
    }

    pub fn total_connections(&self) -> u64 {
        self.inner.lock().counters.total_connections
    }

    /// Current value of `key`, bypassing the protocol.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.live(key, SystemTime::now()).map(|entry| entry.value.clone())
    }

    /// Applies one request and returns the response frames to send back.
    pub fn execute(&self, request: &Request) -> Vec<Response> {
        let reply = |status: Status| Response::new(request.opcode, status, request.opaque);
        let now = SystemTime::now();
        let mut inner = self.inner.lock();

        let response = match request.opcode {
            Opcode::Get => {
                inner.counters.cmd_get += 1;
                let found = inner
                    .live(&request.key, now)
                    .map(|entry| (entry.value.clone(), entry.flags, entry.cas));
                match found {
                    Some((value, flags, cas)) => {
                        inner.counters.get_hits += 1;
                        reply(Status::NoError)
                            .with_flags(flags)
                            .with_cas(cas)
                            .with_value(&value)
                    }
                    None => {
                        inner.counters.get_misses += 1;
                        reply(Status::KeyNotFound).with_value(b"Not found")
                    }
                }
            }
            Opcode::Set | Opcode::Add | Opcode::Replace => {
                inner.counters.cmd_set += 1;
                let (flags, expiration) = match request.extras {
                    Extras::Store { flags, expiration } => (flags, expiration),
                    _ => return vec![reply(Status::InvalidArguments)],
                };
                let current = inner.live(&request.key, now).map(|entry| entry.cas);
                let status = match (request.opcode, current) {
                    (Opcode::Add, Some(_)) => Some(Status::KeyExists),
                    (Opcode::Replace, None) => Some(Status::KeyNotFound),
                    (_, None) if request.cas != 0 => Some(Status::KeyNotFound),
                    (_, Some(cas)) if request.cas != 0 && request.cas != cas => {
                        Some(Status::KeyExists)
                    }
                    _ => None,
                };
                match status {
                    Some(status) => reply(status),
                    None => {
                        let cas = inner.bump_cas();
                        inner.items.insert(
                            request.key.to_vec(),
                            Entry {
                                value: request.value.to_vec(),
                                flags,
                                cas,
                                expires_at: expires_at(expiration, now),
                            },
                        );
                        reply(Status::NoError).with_cas(cas)
                    }
                }
            }
            Opcode::Delete => {
                let current = inner.live(&request.key, now).map(|entry| entry.cas);
                match current {
                    None => reply(Status::KeyNotFound),
                    Some(cas) if request.cas != 0 && request.cas != cas => reply(Status::KeyExists),
                    Some(_) => {
                        inner.items.remove(&request.key[..]);
                        reply(Status::NoError)
                    }
                }
            }
            Opcode::Increment | Opcode::Decrement => {
                let (delta, initial, expiration) = match request.extras {
                    Extras::Counter {
                        delta,
                        initial,
                        expiration,
                    } => (delta, initial, expiration),
                    _ => return vec![reply(Status::InvalidArguments)],
                };
                count(&mut inner, request, delta, initial, expiration, now)
            }
            Opcode::Noop => reply(Status::NoError),
            Opcode::Version => reply(Status::NoError).with_value(VERSION.as_bytes()),
            Opcode::Stat => {
                drop(inner);
                return self.stats(request);
            }
        };
        vec![response]
    }

    fn stats(&self, request: &Request) -> Vec<Response> {
        let entry = |key: &str, value: String| {
            Response::new(Opcode::Stat, Status::NoError, request.opaque)
                .with_key(key.as_bytes())
                .with_value(value.as_bytes())
        };
        let terminator = Response::new(Opcode::Stat, Status::NoError, request.opaque);
        let inner = self.inner.lock();
        match &request.key[..] {
            b"" => {
                let uptime = self.started.elapsed().as_secs();
                vec![
                    entry("pid", std::process::id().to_string()),
                    entry("uptime", uptime.to_string()),
                    entry("version", VERSION.to_string()),
                    entry("curr_items", inner.items.len().to_string()),
                    entry("total_connections", inner.counters.total_connections.to_string()),
                    entry("cmd_get", inner.counters.cmd_get.to_string()),
                    entry("cmd_set", inner.counters.cmd_set.to_string()),
                    entry("get_hits", inner.counters.get_hits.to_string()),
                    entry("get_misses", inner.counters.get_misses.to_string()),
                    terminator,
                ]
            }
            b"settings" => vec![
                entry("maxbytes", (64u64 * 1024 * 1024).to_string()),
                entry("item_size_max", mcache_common::MAX_VALUE_LEN.to_string()),
                terminator,
            ],
            _ => vec![Response::new(Opcode::Stat, Status::KeyNotFound, request.opaque)
                .with_value(b"Not found")],
        }
    }
}

fn count(
    inner: &mut Inner,
    request: &Request,
    delta: u64,
    initial: u64,
    expiration: u32,
    now: SystemTime,
) -> Response {
    let reply = |status: Status| Response::new(request.opcode, status, request.opaque);
    let current = inner
        .live(&request.key, now)
        .map(|entry| (entry.value.clone(), entry.cas));
    let value = match current {
        None if expiration == DELTA_NO_ADD => return reply(Status::KeyNotFound),
        None => initial,
        Some((_, cas)) if request.cas != 0 && request.cas != cas => {
            return reply(Status::KeyExists)
        }
        Some((raw, _)) => {
            let parsed = std::str::from_utf8(&raw)
                .ok()
                .and_then(|text| text.trim().parse::<u64>().ok());
            match (parsed, request.opcode) {
                (None, _) => return reply(Status::NonNumeric).with_value(b"Non-numeric value"),
                (Some(old), Opcode::Increment) => old.wrapping_add(delta),
                (Some(old), _) => old.saturating_sub(delta),
            }
        }
    };

    let cas = inner.bump_cas();
    let (flags, expires) = match inner.items.get(&request.key[..]) {
        Some(entry) => (entry.flags, entry.expires_at),
        None => (0, expires_at(expiration, now)),
    };
    inner.items.insert(
        request.key.to_vec(),
        Entry {
            value: value.to_string().into_bytes(),
            flags,
            cas,
            expires_at: expires,
        },
    );
    reply(Status::NoError)
        .with_cas(cas)
        .with_value(&value.to_be_bytes())
}

fn expires_at(expiration: u32, now: SystemTime) -> Option<SystemTime> {
    match expiration {
        0 => None,
        secs if secs <= RELATIVE_EXPIRATION_LIMIT => Some(now + Duration::from_secs(secs.into())),
        secs => Some(UNIX_EPOCH + Duration::from_secs(secs.into())),
    }
}

//! # Client API
//!
//! Purpose: Expose a blocking, multi-server memcached client speaking the
//! binary protocol, with per-call timeouts and optional request buffering.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides routing, connection state, and
//!    framing behind one call per cache operation.
//! 2. **Borrow-Friendly API**: Keys and values are accepted as `&[u8]`;
//!    results are freshly owned values.
//! 3. **Typed Outcomes**: Misses and CAS conflicts are `ClientError` variants,
//!    never strings.
//! 4. **No Hidden Threads**: Every byte is written and read inside the call
//!    that needs it, bounded by that call's deadline.
//!
//! ## Call Path
//!
//! ```text
//! Client::get(key) ──> ServerPool::route(key) ──> CommandBuffer::submit
//!                                                       │
//!        buffering on:  Reply::Buffered <───────────────┤
//!        buffering off: Driver::run(Target::Command) ───┘──> Reply::Ready(Item)
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mcache_common::{Opcode, Request};

use crate::buffer::{
    unexpected_output, CommandBuffer, Completion, Dispatch, Expect, GetFields, Item, Output,
};
use crate::config::{ClientConfig, IntoServerList, ServerAddr, Timeouts};
use crate::connection::{ConnState, Server, ServerStatus};
use crate::driver::{Driver, Target};
use crate::error::{ClientError, ClientResult};
use crate::log::{log_event, LogSink, TracingSink};
use crate::pool::ServerPool;

/// Outcome of a data operation.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<T> {
    /// The server answered; buffering was off.
    Ready(T),
    /// The command was queued; its result is returned by `Client::flush`.
    Buffered,
}

impl<T> Reply<T> {
    /// Returns the value, or `None` for a buffered command.
    pub fn ready(self) -> Option<T> {
        match self {
            Reply::Ready(value) => Some(value),
            Reply::Buffered => None,
        }
    }

    pub fn is_buffered(&self) -> bool {
        matches!(self, Reply::Buffered)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reply<U> {
        match self {
            Reply::Ready(value) => Reply::Ready(f(value)),
            Reply::Buffered => Reply::Buffered,
        }
    }
}

/// Parameters of `set`, `add` and `replace`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreParams {
    /// Seconds from now, or a unix timestamp past 30 days; 0 never expires.
    pub expiration: u32,
    /// Opaque caller tag stored with the item.
    pub flags: u32,
    /// Store only if the item's current CAS matches; 0 disables the check.
    pub cas: u64,
}

/// Parameters of `increment` and `decrement`.
///
/// A missing key is created with `initial` (returned as the result) unless
/// `expiration` is `DELTA_NO_ADD`, in which case the call fails with
/// `ClientError::NotFound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub delta: u64,
    pub initial: u64,
    pub expiration: u32,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            delta: 1,
            initial: 0,
            expiration: 0,
        }
    }
}

/// Multi-server memcached client.
///
/// Not meant to be shared between threads: every operation takes
/// `&mut self`. Use one client per thread.
pub struct Client {
    timeouts: Timeouts,
    pool: ServerPool,
    buffer: CommandBuffer,
    driver: Driver,
    log: Arc<dyn LogSink>,
}

impl Client {
    /// Creates a client for `servers` with default timeouts.
    pub fn connect(servers: impl IntoServerList) -> ClientResult<Self> {
        let servers = servers
            .into_server_list()?
            .iter()
            .map(ToString::to_string)
            .collect();
        Self::with_config(ClientConfig {
            servers,
            ..ClientConfig::default()
        })
    }

    /// Creates a client from a full configuration.
    pub fn with_config(config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        let mut client = Client {
            timeouts: config.timeouts(),
            pool: ServerPool::new(),
            buffer: CommandBuffer::new(config.buffering),
            driver: Driver::new()?,
            log: Arc::new(TracingSink),
        };
        client.install_servers(config.server_addrs()?)?;
        Ok(client)
    }

    /// Replaces the log sink.
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log = sink;
        self
    }

    /// Fetches `key`, with flags and CAS only when requested in `fields`.
    pub fn get(
        &mut self,
        key: &[u8],
        fields: GetFields,
        timeout: Option<Duration>,
    ) -> ClientResult<Reply<Item>> {
        let reply = self.dispatch_key(Request::get(key), Expect::Item(fields), timeout)?;
        expect_output(reply, Opcode::Get, |output| match output {
            Output::Item(item) => Some(item),
            _ => None,
        })
    }

    /// Stores `value` unconditionally (or under `params.cas`) and returns
    /// the new CAS.
    pub fn set(
        &mut self,
        key: &[u8],
        value: &[u8],
        params: StoreParams,
        timeout: Option<Duration>,
    ) -> ClientResult<Reply<u64>> {
        let request =
            Request::set(key, value, params.flags, params.expiration).with_cas(params.cas);
        self.store(request, timeout)
    }

    /// Stores `value` only if `key` is absent; `params.cas` is ignored.
    pub fn add(
        &mut self,
        key: &[u8],
        value: &[u8],
        params: StoreParams,
        timeout: Option<Duration>,
    ) -> ClientResult<Reply<u64>> {
        self.store(Request::add(key, value, params.flags, params.expiration), timeout)
    }

    /// Stores `value` only if `key` is present.
    pub fn replace(
        &mut self,
        key: &[u8],
        value: &[u8],
        params: StoreParams,
        timeout: Option<Duration>,
    ) -> ClientResult<Reply<u64>> {
        let request =
            Request::replace(key, value, params.flags, params.expiration).with_cas(params.cas);
        self.store(request, timeout)
    }

    pub fn delete(&mut self, key: &[u8], timeout: Option<Duration>) -> ClientResult<Reply<()>> {
        let reply = self.dispatch_key(Request::delete(key), Expect::Done, timeout)?;
        expect_done(reply, Opcode::Delete)
    }

    /// Adds `counter.delta` and returns the new value.
    pub fn increment(
        &mut self,
        key: &[u8],
        counter: Counter,
        timeout: Option<Duration>,
    ) -> ClientResult<Reply<u64>> {
        let request = Request::increment(key, counter.delta, counter.initial, counter.expiration);
        self.count(request, timeout)
    }

    /// Subtracts `counter.delta`, flooring at zero, and returns the new value.
    pub fn decrement(
        &mut self,
        key: &[u8],
        counter: Counter,
        timeout: Option<Duration>,
    ) -> ClientResult<Reply<u64>> {
        let request = Request::decrement(key, counter.delta, counter.initial, counter.expiration);
        self.count(request, timeout)
    }

    /// Round trip to the server at `server` index.
    pub fn noop(&mut self, server: usize, timeout: Option<Duration>) -> ClientResult<Reply<()>> {
        let reply = self.dispatch(server, Request::noop(), Expect::Done, timeout)?;
        expect_done(reply, Opcode::Noop)
    }

    /// Server version string.
    pub fn version(
        &mut self,
        server: usize,
        timeout: Option<Duration>,
    ) -> ClientResult<Reply<String>> {
        let expect = Expect::Item(GetFields::VALUE);
        let reply = self.dispatch(server, Request::version(), expect, timeout)?;
        expect_output(reply, Opcode::Version, |output| match output {
            Output::Item(item) => Some(String::from_utf8_lossy(&item.value).into_owned()),
            _ => None,
        })
    }

    /// Statistics of one server; an empty `group` asks for general stats.
    pub fn stat(
        &mut self,
        group: &str,
        server: usize,
        timeout: Option<Duration>,
    ) -> ClientResult<Reply<BTreeMap<String, String>>> {
        let reply = self.dispatch(server, Request::stat(group.as_bytes()), Expect::Stats, timeout)?;
        expect_output(reply, Opcode::Stat, |output| match output {
            Output::Stats(stats) => Some(stats),
            _ => None,
        })
    }

    /// Sends every buffered command and waits for all replies.
    ///
    /// Returns one completion per buffered command in issue order. Commands
    /// still unanswered at the deadline complete with `ClientError::Timeout`.
    /// `None` waits up to the io timeout.
    pub fn flush(&mut self, timeout: Option<Duration>) -> ClientResult<Vec<Completion>> {
        let deadline = Instant::now() + timeout.unwrap_or(self.timeouts.io);
        self.driver.run(
            &mut self.pool,
            &mut self.buffer,
            &self.timeouts,
            &*self.log,
            deadline,
            Target::AllBuffered,
        )?;
        Ok(self.buffer.drain_completions())
    }

    /// Drops buffered commands that were not sent yet, along with collected
    /// completions nobody flushed.
    pub fn reset_buffers(&mut self) {
        let mut dropped = 0;
        for conn in self.pool.connections_mut() {
            dropped += conn
                .abandon(|pending| pending.dispatch == Dispatch::Buffered)
                .len();
        }
        let unflushed = self.buffer.pending_completions();
        self.buffer.clear_completions();
        if dropped + unflushed > 0 {
            log_event!(
                self.log,
                DEBUG,
                "reset dropped {} queued command(s) and {} unflushed result(s)",
                dropped,
                unflushed
            );
        }
    }

    pub fn buffering(&self) -> bool {
        self.buffer.enabled()
    }

    /// Turns buffering on or off. Already buffered commands stay queued
    /// until the next `flush` or `reset_buffers`.
    pub fn set_buffering(&mut self, enabled: bool) {
        self.buffer.set_enabled(enabled);
    }

    /// Replaces the server list. Connections to servers that remain are
    /// kept; commands pending on removed servers fail.
    pub fn set_servers(&mut self, servers: impl IntoServerList) -> ClientResult<()> {
        self.install_servers(servers.into_server_list()?)
    }

    fn install_servers(&mut self, addrs: Vec<ServerAddr>) -> ClientResult<()> {
        let mut finished = Vec::new();
        self.pool.set_servers(
            addrs,
            self.driver.registry(),
            Instant::now(),
            &*self.log,
            &mut finished,
        )?;
        self.buffer.absorb(finished);
        Ok(())
    }

    pub fn servers(&self) -> Vec<Server> {
        self.pool.servers()
    }

    /// Server that owns `key` under the current list.
    pub fn server_for_key(&self, key: &[u8]) -> ClientResult<Server> {
        let index = self.pool.route(key)?;
        self.pool
            .servers()
            .into_iter()
            .nth(index)
            .ok_or_else(|| ClientError::config("no servers configured"))
    }

    pub fn server_status(&self) -> Vec<ServerStatus> {
        self.pool.status()
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Replaces all timeouts; read at the start of every later call.
    pub fn set_timeouts(&mut self, timeouts: Timeouts) -> ClientResult<()> {
        timeouts.validate()?;
        self.timeouts = timeouts;
        Ok(())
    }

    fn store(&mut self, request: Request, timeout: Option<Duration>) -> ClientResult<Reply<u64>> {
        let opcode = request.opcode;
        let reply = self.dispatch_key(request, Expect::Stored, timeout)?;
        expect_output(reply, opcode, |output| match output {
            Output::Stored { cas } => Some(cas),
            _ => None,
        })
    }

    fn count(&mut self, request: Request, timeout: Option<Duration>) -> ClientResult<Reply<u64>> {
        let opcode = request.opcode;
        let reply = self.dispatch_key(request, Expect::Counter, timeout)?;
        expect_output(reply, opcode, |output| match output {
            Output::Counter(value) => Some(value),
            _ => None,
        })
    }

    fn dispatch_key(
        &mut self,
        request: Request,
        expect: Expect,
        timeout: Option<Duration>,
    ) -> ClientResult<Reply<Output>> {
        request.validate()?;
        let server = self.pool.route(&request.key)?;
        self.dispatch(server, request, expect, timeout)
    }

    fn dispatch(
        &mut self,
        server: usize,
        request: Request,
        expect: Expect,
        timeout: Option<Duration>,
    ) -> ClientResult<Reply<Output>> {
        let started = Instant::now();
        let deadline = started + timeout.unwrap_or(self.timeouts.io);
        let mode = self.buffer.dispatch_mode();
        let conn = self.pool.connection_mut(server)?;
        if conn.state() == ConnState::Dead && !conn.retry_eligible(started, &self.timeouts) {
            return Err(conn.dead_error());
        }
        let seq = self.buffer.submit(conn, request, expect, mode)?;
        if mode == Dispatch::Buffered {
            return Ok(Reply::Buffered);
        }

        self.driver.run(
            &mut self.pool,
            &mut self.buffer,
            &self.timeouts,
            &*self.log,
            deadline,
            Target::Command(seq),
        )?;
        match self.buffer.take_direct(seq) {
            Some(result) => result.map(Reply::Ready),
            None => Err(ClientError::Timeout),
        }
    }
}

fn expect_output<T>(
    reply: Reply<Output>,
    opcode: Opcode,
    extract: impl FnOnce(Output) -> Option<T>,
) -> ClientResult<Reply<T>> {
    match reply {
        Reply::Buffered => Ok(Reply::Buffered),
        Reply::Ready(output) => extract(output)
            .map(Reply::Ready)
            .ok_or_else(|| unexpected_output(opcode)),
    }
}

fn expect_done(reply: Reply<Output>, opcode: Opcode) -> ClientResult<Reply<()>> {
    expect_output(reply, opcode, |output| match output {
        Output::Done => Some(()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_helpers() {
        let ready: Reply<u64> = Reply::Ready(3);
        assert!(!ready.is_buffered());
        assert_eq!(ready.clone().map(|v| v * 2), Reply::Ready(6));
        assert_eq!(ready.ready(), Some(3));

        let buffered: Reply<u64> = Reply::Buffered;
        assert!(buffered.is_buffered());
        assert_eq!(buffered.ready(), None);
    }

    #[test]
    fn test_expect_output_rejects_wrong_shape() {
        let err = expect_done(Reply::Ready(Output::Counter(1)), Opcode::Delete).unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
        assert_eq!(
            expect_done(Reply::Buffered, Opcode::Delete).unwrap(),
            Reply::Buffered
        );
    }

    #[test]
    fn test_invalid_key_never_reaches_a_connection() {
        let mut client = Client::connect("127.0.0.1:1").unwrap();
        let err = client.get(b"", GetFields::VALUE, None).unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
        let long = vec![b'k'; 251];
        let err = client.delete(&long, None).unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
        assert_eq!(client.server_status()[0].connect_attempts, 0);
    }

    #[test]
    fn test_set_timeouts_validates() {
        let mut client = Client::connect("127.0.0.1:1").unwrap();
        let bad = Timeouts {
            io: Duration::ZERO,
            ..Timeouts::default()
        };
        assert!(matches!(client.set_timeouts(bad), Err(ClientError::Config(_))));
        assert_eq!(client.timeouts(), Timeouts::default());
    }

    #[test]
    fn test_duplicate_servers_rejected() {
        let mut client = Client::connect("a:1,b:2").unwrap();
        assert!(matches!(client.set_servers("a:1,a:1"), Err(ClientError::Config(_))));
        assert_eq!(client.servers().len(), 2);
    }
}

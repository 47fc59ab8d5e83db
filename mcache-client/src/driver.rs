//! # I/O Driver
//!
//! Purpose: Multiplex every server socket on one `mio::Poll` and run the
//! connections until a target is reached or the deadline passes.
//!
//! ## Design Principles
//! 1. **Single Thread**: All I/O happens on the calling thread, inside the
//!    call that needs it.
//! 2. **Bounded Waits**: Every wait is capped by the call deadline and the
//!    earliest connect deadline.
//! 3. **Progress Before Waiting**: Connections are pushed forward (connects
//!    started, frames written) before blocking in `poll`.
//!
//! ## Loop
//!
//! ```text
//! loop:
//!   make_progress(every connection) ──> absorb finished slots
//!   target met?      ──> return
//!   deadline passed? ──> abandon outstanding slots ──> return
//!   poll(min(deadline, connect deadlines))
//!   on_ready(connection for each event) ──> absorb finished slots
//! ```

use std::io;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Registry};

use crate::buffer::{CommandBuffer, Dispatch, Finished};
use crate::config::Timeouts;
use crate::error::{ClientError, ClientResult};
use crate::log::{log_event, LogSink};
use crate::pool::ServerPool;

const EVENT_CAPACITY: usize = 256;

/// What a driver run waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    /// Result of one direct command.
    Command(u64),
    /// Every live buffered command.
    AllBuffered,
}

pub(crate) struct Driver {
    poll: Poll,
    events: Events,
}

impl Driver {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Driver {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
        })
    }

    pub(crate) fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Runs I/O until `target` is met or `deadline` passes.
    ///
    /// For `Target::Command` an expired deadline abandons the command and
    /// returns `ClientError::Timeout`. For `Target::AllBuffered` the
    /// abandoned commands are recorded as timed-out completions instead.
    pub(crate) fn run(
        &mut self,
        pool: &mut ServerPool,
        buffer: &mut CommandBuffer,
        timeouts: &Timeouts,
        log: &dyn LogSink,
        deadline: Instant,
        target: Target,
    ) -> ClientResult<()> {
        let mut finished = Vec::new();
        loop {
            let now = Instant::now();
            for conn in pool.connections_mut() {
                conn.make_progress(self.poll.registry(), now, timeouts, log, &mut finished);
            }
            buffer.absorb(std::mem::take(&mut finished));

            if target_met(pool, buffer, target) {
                return Ok(());
            }
            if now >= deadline {
                return expire(pool, buffer, self.poll.registry(), log, target);
            }

            let wake = pool
                .next_connect_deadline()
                .map_or(deadline, |connect| connect.min(deadline));
            let wait = wake.saturating_duration_since(now).max(Duration::from_millis(1));
            match self.poll.poll(&mut self.events, Some(wait)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // Nobody will drive these slots again.
                    let _ = expire(pool, buffer, self.poll.registry(), log, target);
                    return Err(ClientError::Io(err));
                }
            }

            let now = Instant::now();
            for event in self.events.iter() {
                if let Some(conn) = pool.by_token_mut(event.token()) {
                    // Errors and hang-ups surface through the next read.
                    let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                    conn.on_ready(
                        self.poll.registry(),
                        now,
                        readable,
                        event.is_writable(),
                        log,
                        &mut finished,
                    );
                }
            }
            buffer.absorb(std::mem::take(&mut finished));
        }
    }
}

fn target_met(pool: &mut ServerPool, buffer: &CommandBuffer, target: Target) -> bool {
    match target {
        Target::Command(seq) => buffer.has_direct(seq),
        Target::AllBuffered => pool
            .connections_mut()
            .all(|conn| conn.live_count(|pending| pending.dispatch == Dispatch::Buffered) == 0),
    }
}

fn expire(
    pool: &mut ServerPool,
    buffer: &mut CommandBuffer,
    registry: &Registry,
    log: &dyn LogSink,
    target: Target,
) -> ClientResult<()> {
    let now = Instant::now();
    let mut finished = Vec::new();
    let result = match target {
        Target::Command(seq) => {
            for conn in pool.connections_mut() {
                if !conn.abandon(|pending| pending.seq == seq).is_empty() {
                    log_event!(log, DEBUG, "command timed out on {}", conn.server().addr);
                }
            }
            Err(ClientError::Timeout)
        }
        Target::AllBuffered => {
            for conn in pool.connections_mut() {
                let server = conn.server().index;
                let dropped = conn.abandon(|pending| pending.dispatch == Dispatch::Buffered);
                if !dropped.is_empty() {
                    log_event!(
                        log,
                        DEBUG,
                        "{} buffered command(s) timed out on {}",
                        dropped.len(),
                        conn.server().addr
                    );
                }
                finished.extend(dropped.into_iter().map(|pending| Finished {
                    server,
                    pending,
                    result: Err(ClientError::Timeout),
                }));
            }
            Ok(())
        }
    };
    for conn in pool.connections_mut() {
        conn.shed_unresponsive(registry, now, log, &mut finished);
    }
    buffer.absorb(finished);
    result
}

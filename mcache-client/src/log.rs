//! # Logging Sink
//!
//! The client reports connection state changes and protocol trouble through a
//! `LogSink` it holds by reference. The sink is called synchronously on the
//! calling thread. `TracingSink` forwards to `tracing` and is the default.

use std::fmt;

use tracing::Level;

/// Receiver of client log events.
pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, message: fmt::Arguments<'_>);
}

/// Forwards events to the `tracing` dispatcher under the `mcache` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: Level, message: fmt::Arguments<'_>) {
        match level {
            Level::ERROR => tracing::error!(target: "mcache", "{}", message),
            Level::WARN => tracing::warn!(target: "mcache", "{}", message),
            Level::INFO => tracing::info!(target: "mcache", "{}", message),
            Level::DEBUG => tracing::debug!(target: "mcache", "{}", message),
            _ => tracing::trace!(target: "mcache", "{}", message),
        }
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn log(&self, _level: Level, _message: fmt::Arguments<'_>) {}
}

macro_rules! log_event {
    ($sink:expr, $level:ident, $($arg:tt)+) => {
        $sink.log(::tracing::Level::$level, format_args!($($arg)+))
    };
}

pub(crate) use log_event;

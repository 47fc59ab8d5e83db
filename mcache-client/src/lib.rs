//! # mcache Client
//!
//! Purpose: Provide a synchronous memcached client speaking the binary
//! protocol to a pool of servers, with key routing, per-call timeouts, dead
//! server tracking, and optional request buffering.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` is the only entry point; routing, framing,
//!    and socket state stay internal.
//! 2. **Consistent Hashing**: Keys map to servers through a continuum that
//!    survives list changes with minimal remapping.
//! 3. **Bounded Blocking**: Every call waits at most its timeout; failing
//!    servers are short-circuited until they are retry eligible.
//! 4. **Protocol Clarity**: Frames are encoded and decoded explicitly by
//!    `mcache-common`.
//!
//! ## Example
//!
//! ```no_run
//! use mcache_client::{Client, GetFields, StoreParams};
//!
//! let mut client = Client::connect("127.0.0.1:11211,127.0.0.1:11212")?;
//! client.set(b"greeting", b"hello", StoreParams::default(), None)?;
//! let item = client.get(b"greeting", GetFields::VALUE, None)?.ready();
//! assert_eq!(item.map(|item| item.value), Some(b"hello".to_vec()));
//! # Ok::<(), mcache_client::ClientError>(())
//! ```

mod buffer;
mod client;
mod config;
mod connection;
mod driver;
mod error;
mod log;
mod pool;

pub use buffer::{Completion, GetFields, Item, Output};
pub use client::{Client, Counter, Reply, StoreParams};
pub use config::{parse_server_list, ClientConfig, IntoServerList, ServerAddr, Timeouts, DEFAULT_PORT};
pub use connection::{ConnState, Server, ServerStatus};
pub use error::{ClientError, ClientResult};
pub use log::{LogSink, NullSink, TracingSink};
pub use mcache_common::{Opcode, Status, DELTA_NO_ADD, MAX_KEY_LEN, MAX_VALUE_LEN};

// mcache-common - Wire types and codec for the mcache client
//
// This crate defines the memcached binary protocol frames spoken between the
// client and cache servers. It performs no I/O.

pub mod error;
pub mod protocol;
pub mod types;

// Re-export for convenience
pub use error::*;
pub use protocol::*;
pub use types::*;

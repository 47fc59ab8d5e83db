//! # Mock memcached Server
//!
//! Purpose: Serve the memcached binary protocol from memory so client tests
//! run without an external daemon.
//!
//! ## Design Principles
//! 1. **Self-Contained**: Each `MockServer` owns a thread with a
//!    current-thread tokio runtime, bound to an ephemeral loopback port.
//! 2. **Shared Store**: Connections of one server share a `Store`; tests can
//!    inspect it directly.
//! 3. **Failure Injection**: `MockOptions::stall` accepts connections and
//!    reads requests but never answers.
//! 4. **Clean Shutdown**: Dropping the server stops the runtime and joins its
//!    thread, closing every socket.

mod store;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use mcache_common::{decode_request, encode_response, Decode};

pub use store::{Store, VERSION};

/// Behaviour switches for a mock server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockOptions {
    /// Read requests but never reply.
    pub stall: bool,
}

/// In-process memcached binary-protocol server.
pub struct MockServer {
    addr: SocketAddr,
    store: Arc<Store>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MockServer {
    /// Starts a well-behaved server on an ephemeral port.
    pub fn start() -> io::Result<Self> {
        Self::start_with(MockOptions::default())
    }

    pub fn start_with(options: MockOptions) -> io::Result<Self> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let store = Arc::new(Store::new());
        let (tx, rx) = oneshot::channel();

        let served = store.clone();
        let thread = std::thread::Builder::new()
            .name(format!("mcache-mock-{}", addr.port()))
            .spawn(move || runtime.block_on(serve(listener, served, options, rx)))?;

        Ok(MockServer {
            addr,
            store,
            shutdown: Some(tx),
            thread: Some(thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port` form accepted by the client's server list.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> u64 {
        self.store.total_connections()
    }

    /// Stops the server and waits for its thread.
    pub fn shutdown(self) {}
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

async fn serve(
    listener: std::net::TcpListener,
    store: Arc<Store>,
    options: MockOptions,
    mut shutdown: oneshot::Receiver<()>,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            tracing::warn!("mock listener setup failed: {}", err);
            return;
        }
    };
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    store.connection_opened();
                    let store = store.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, store, options).await {
                            tracing::debug!("mock connection ended: {}", err);
                        }
                    });
                }
                Err(err) => tracing::warn!("mock accept failed: {}", err),
            },
        }
    }
}

/// Handles a single client connection.
async fn handle_connection(
    mut stream: TcpStream,
    store: Arc<Store>,
    options: MockOptions,
) -> io::Result<()> {
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut out = BytesMut::with_capacity(8 * 1024);

    loop {
        let bytes = stream.read_buf(&mut buffer).await?;
        if bytes == 0 {
            return Ok(());
        }
        if options.stall {
            buffer.clear();
            continue;
        }

        loop {
            match decode_request(&buffer) {
                Ok(Decode::Complete { frame, consumed }) => {
                    let _ = buffer.split_to(consumed);
                    for response in store.execute(&frame) {
                        encode_response(&response, &mut out);
                    }
                }
                Ok(Decode::NeedMoreData) => break,
                Err(err) => {
                    // Drop the connection; the stream cannot be resynchronized.
                    return Err(io::Error::new(io::ErrorKind::InvalidData, err));
                }
            }
        }
        if !out.is_empty() {
            stream.write_all(&out).await?;
            out.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcache_common::{decode_response, encode, Opcode, Request, Status};
    use std::io::{Read, Write};

    fn roundtrip(addr: SocketAddr, request: &Request) -> mcache_common::Response {
        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        let mut out = BytesMut::new();
        encode(request, &mut out).unwrap();
        stream.write_all(&out).unwrap();

        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "server closed early");
            buf.extend_from_slice(&chunk[..n]);
            if let Decode::Complete { frame, .. } = decode_response(&buf).unwrap() {
                return frame;
            }
        }
    }

    #[test]
    fn test_serves_binary_protocol() {
        let server = MockServer::start().unwrap();
        let stored = roundtrip(server.addr(), &Request::set(b"k", b"v", 3, 0).with_opaque(9));
        assert_eq!(stored.status, Status::NoError);
        assert_eq!(stored.opaque, 9);

        let fetched = roundtrip(server.addr(), &Request::get(b"k"));
        assert_eq!(fetched.opcode, Opcode::Get);
        assert_eq!(&fetched.value[..], b"v");
        assert_eq!(fetched.flags(), Some(3));
        assert_eq!(server.store().get(b"k"), Some(b"v".to_vec()));
        assert_eq!(server.connections(), 2);
    }

    #[test]
    fn test_version_reply() {
        let server = MockServer::start().unwrap();
        let reply = roundtrip(server.addr(), &Request::version());
        assert_eq!(&reply.value[..], VERSION.as_bytes());
    }
}

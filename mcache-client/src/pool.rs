//! # Server Pool
//!
//! Purpose: Hold one connection per configured server and route keys to
//! servers through a consistent-hash continuum.
//!
//! ## Design Principles
//! 1. **Stable Routing**: The same key always maps to the same server for a
//!    given server list.
//! 2. **Minimal Remap**: Adding or removing a server moves only the keys that
//!    hashed near its points on the continuum.
//! 3. **Keep Live Sockets**: Replacing the list keeps connections (and their
//!    queued work) of servers that stay.
//!
//! ## Continuum Layout
//!
//! ```text
//! hash("host:port-0") .. hash("host:port-159") for every server, sorted:
//!
//!   0 ──●──────●───●────────●──────●──> u32::MAX
//!       s1     s0  s2       s0     s1
//!
//! key ──hash──> first point >= hash (wrapping to the start) ──> server
//! ```

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use mio::{Registry, Token};

use crate::buffer::Finished;
use crate::config::ServerAddr;
use crate::connection::{Connection, Server, ServerStatus};
use crate::error::{ClientError, ClientResult};
use crate::log::{log_event, LogSink};

/// Continuum points per server.
const POINTS_PER_SERVER: usize = 160;

#[derive(Debug, Default)]
struct Continuum {
    /// (point hash, server index), sorted.
    points: Vec<(u32, usize)>,
}

impl Continuum {
    fn build(servers: &[ServerAddr]) -> Self {
        let mut points = Vec::with_capacity(servers.len() * POINTS_PER_SERVER);
        for (index, addr) in servers.iter().enumerate() {
            let label = addr.to_string();
            for point in 0..POINTS_PER_SERVER {
                points.push((hash_key(format!("{}-{}", label, point).as_bytes()), index));
            }
        }
        points.sort_unstable();
        Continuum { points }
    }

    fn locate(&self, key: &[u8]) -> Option<usize> {
        let first = self.points.first()?;
        let hash = hash_key(key);
        let at = self.points.partition_point(|&(point, _)| point < hash);
        Some(self.points.get(at).unwrap_or(first).1)
    }
}

/// FNV-1a (32-bit) followed by the murmur3 finalizer, so labels differing in
/// their last byte still land far apart.
fn hash_key(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85eb_ca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2_ae35);
    hash ^ (hash >> 16)
}

pub(crate) struct ServerPool {
    connections: Vec<Connection>,
    continuum: Continuum,
    next_token: usize,
}

impl ServerPool {
    pub(crate) fn new() -> Self {
        ServerPool {
            connections: Vec::new(),
            continuum: Continuum::default(),
            next_token: 0,
        }
    }

    pub(crate) fn servers(&self) -> Vec<Server> {
        self.connections.iter().map(|conn| conn.server().clone()).collect()
    }

    /// Replaces the server list.
    ///
    /// Servers present in both lists keep their connection; removed servers
    /// are closed and their pending commands fail with a connection error.
    pub(crate) fn set_servers(
        &mut self,
        addrs: Vec<ServerAddr>,
        registry: &Registry,
        now: Instant,
        log: &dyn LogSink,
        finished: &mut Vec<Finished>,
    ) -> ClientResult<()> {
        if addrs.is_empty() {
            return Err(ClientError::config("server list is empty"));
        }
        let mut seen = HashSet::with_capacity(addrs.len());
        for addr in &addrs {
            if !seen.insert(addr) {
                return Err(ClientError::config(format!("duplicate server {}", addr)));
            }
        }

        let mut existing: HashMap<ServerAddr, Connection> = self
            .connections
            .drain(..)
            .map(|conn| (conn.server().addr.clone(), conn))
            .collect();
        let mut connections = Vec::with_capacity(addrs.len());
        for (index, addr) in addrs.iter().enumerate() {
            let conn = match existing.remove(addr) {
                Some(mut conn) => {
                    conn.set_index(index);
                    conn
                }
                None => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    Connection::new(
                        Server {
                            index,
                            addr: addr.clone(),
                        },
                        token,
                    )
                }
            };
            connections.push(conn);
        }
        for (_, mut removed) in existing {
            removed.retire(registry, now, log, finished);
        }

        log_event!(log, INFO, "server list set to {} server(s)", connections.len());
        self.connections = connections;
        self.continuum = Continuum::build(&addrs);
        Ok(())
    }

    /// Index of the server that owns `key`.
    pub(crate) fn route(&self, key: &[u8]) -> ClientResult<usize> {
        match self.connections.len() {
            0 => Err(ClientError::config("no servers configured")),
            1 => Ok(0),
            _ => self
                .continuum
                .locate(key)
                .ok_or_else(|| ClientError::config("no servers configured")),
        }
    }

    pub(crate) fn connection_mut(&mut self, index: usize) -> ClientResult<&mut Connection> {
        let count = self.connections.len();
        self.connections.get_mut(index).ok_or_else(|| {
            ClientError::config(format!("server index {} out of range ({} servers)", index, count))
        })
    }

    pub(crate) fn by_token_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.connections.iter_mut().find(|conn| conn.token() == token)
    }

    pub(crate) fn connections_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.iter_mut()
    }

    /// Earliest pending connect deadline across all servers.
    pub(crate) fn next_connect_deadline(&self) -> Option<Instant> {
        self.connections
            .iter()
            .filter_map(Connection::connect_deadline)
            .min()
    }

    pub(crate) fn status(&self) -> Vec<ServerStatus> {
        self.connections.iter().map(Connection::status).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(count: usize) -> Vec<ServerAddr> {
        (0..count)
            .map(|i| ServerAddr::new(format!("10.0.0.{}", i + 1), 11211))
            .collect()
    }

    #[test]
    fn test_continuum_is_deterministic() {
        let a = Continuum::build(&addrs(3));
        let b = Continuum::build(&addrs(3));
        for i in 0..200 {
            let key = format!("key-{}", i);
            assert_eq!(a.locate(key.as_bytes()), b.locate(key.as_bytes()));
        }
    }

    #[test]
    fn test_continuum_distributes() {
        let continuum = Continuum::build(&addrs(4));
        let mut counts = [0u32; 4];
        for i in 0..4000 {
            let key = format!("key-{}", i);
            counts[continuum.locate(key.as_bytes()).unwrap()] += 1;
        }
        for count in &counts {
            assert!(*count > 500, "poor distribution: {:?}", counts);
        }
    }

    #[test]
    fn test_adding_server_moves_few_keys() {
        let before = Continuum::build(&addrs(4));
        let after = Continuum::build(&addrs(5));
        let moved = (0..5000)
            .filter(|i| {
                let key = format!("key-{}", i);
                let old = before.locate(key.as_bytes()).unwrap();
                let new = after.locate(key.as_bytes()).unwrap();
                // Keys may only move to the new server.
                assert!(old == new || new == 4);
                old != new
            })
            .count();
        assert!(moved < 2000, "{} keys moved", moved);
    }

    #[test]
    fn test_empty_continuum_routes_nowhere() {
        assert_eq!(Continuum::default().locate(b"k"), None);
    }
}

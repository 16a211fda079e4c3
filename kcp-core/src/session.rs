//! Session table: maps an inbound datagram to the connection that owns it.
//!
//! Address-keyed sessions follow the sender's address. Conv-keyed sessions read the conv
//! field from the datagram, so a peer keeps its session when its address changes.

use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::RwLock;

use crate::wire::peek_conv;

/// Lookup key for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKey {
    Addr(SocketAddr),
    Conv(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Address,
    /// `offset` is the number of framing bytes (checksum, FEC header) ahead of the conv.
    Conv { offset: usize },
}

/// Little-endian conv at `offset`; `None` when the datagram is too short.
pub fn read_conv(datagram: &[u8], offset: usize) -> Option<u32> {
    datagram.get(offset..).and_then(peek_conv)
}

/// Concurrent session table. `T` is a cheap handle to the connection.
pub struct SessionManager<T> {
    strategy: Strategy,
    sessions: RwLock<HashMap<SessionKey, T>>,
}

impl<T: Clone> SessionManager<T> {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Key a datagram from `from` resolves to.
    pub fn key_for(&self, datagram: &[u8], from: SocketAddr) -> Option<SessionKey> {
        match self.strategy {
            Strategy::Address => Some(SessionKey::Addr(from)),
            Strategy::Conv { offset } => read_conv(datagram, offset).map(SessionKey::Conv),
        }
    }

    pub fn get(&self, datagram: &[u8], from: SocketAddr) -> Option<T> {
        let key = self.key_for(datagram, from)?;
        self.get_key(&key)
    }

    pub fn get_key(&self, key: &SessionKey) -> Option<T> {
        self.sessions.read().get(key).cloned()
    }

    /// Insert or replace. Returns the previous handle.
    pub fn register(&self, key: SessionKey, value: T) -> Option<T> {
        self.sessions.write().insert(key, value)
    }

    pub fn remove(&self, key: &SessionKey) -> Option<T> {
        self.sessions.write().remove(key)
    }

    /// Point-in-time copy of every session.
    pub fn snapshot(&self) -> Vec<(SessionKey, T)> {
        self.sessions
            .read()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn address_keyed_lookup() {
        let table = SessionManager::new(Strategy::Address);
        table.register(SessionKey::Addr(addr(1000)), 1u32);
        assert_eq!(table.get(b"anything", addr(1000)), Some(1));
        assert_eq!(table.get(b"anything", addr(1001)), None);
    }

    #[test]
    fn read_conv_honours_offset() {
        let datagram = [9, 9, 0x2a, 0, 0, 0, 1];
        assert_eq!(read_conv(&datagram, 2), Some(42));
        assert_eq!(read_conv(&datagram, 4), None);
        assert_eq!(read_conv(&datagram, usize::MAX), None);
    }

    #[test]
    fn remove_forgets_only_that_key() {
        let table = SessionManager::new(Strategy::Address);
        let a = SessionKey::Addr(addr(1));
        let b = SessionKey::Addr(addr(2));
        table.register(a, "s");
        table.register(b, "t");
        assert_eq!(table.remove(&a), Some("s"));
        assert_eq!(table.get_key(&a), None);
        assert_eq!(table.get_key(&b), Some("t"));
        assert_eq!(table.remove(&a), None);
        assert_eq!(table.remove(&b), Some("t"));
        assert!(table.is_empty());
    }

    #[test]
    fn snapshot_is_a_copy() {
        let table = SessionManager::new(Strategy::Conv { offset: 0 });
        table.register(SessionKey::Conv(1), 10);
        table.register(SessionKey::Conv(2), 20);
        let snap = table.snapshot();
        table.remove(&SessionKey::Conv(1));
        assert_eq!(snap.len(), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn concurrent_register_and_lookup() {
        let table = Arc::new(SessionManager::new(Strategy::Conv { offset: 0 }));
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    for i in 0..100u32 {
                        let conv = t * 1000 + i;
                        table.register(SessionKey::Conv(conv), conv);
                        assert_eq!(table.get(&conv.to_le_bytes(), addr(1)), Some(conv));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(table.len(), 400);
    }
}

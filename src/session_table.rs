//! Concurrent flow tables shared by the dispatch path and the event pump.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::Ipv4Addr;

use etherparse::TcpHeader;
use parking_lot::Mutex;

use crate::packet::IpV4Packet;

/// Demultiplexing key for emulated TCP flows within one tunnel.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct FlowKey {
    pub source: Ipv4Addr,
    pub destination_port: u16,
}

impl FlowKey {
    pub const fn new(source: Ipv4Addr, destination_port: u16) -> Self {
        Self {
            source,
            destination_port,
        }
    }

    /// Key of the flow a TCP-carrying packet belongs to, or `None` if the
    /// TCP header does not parse.
    pub fn from_packet(packet: &IpV4Packet) -> Option<Self> {
        let (tcp, _) = TcpHeader::from_slice(&packet.payload).ok()?;
        Some(Self::new(packet.source(), tcp.destination_port))
    }

    /// Unspecified address or port zero cannot name a real flow.
    pub fn is_valid(&self) -> bool {
        !self.source.is_unspecified() && self.destination_port != 0
    }
}

/// `Live` flows receive new traffic; `Parked` flows are only pumped until
/// they finish shutting down.
pub struct SessionTable<K, V> {
    live: Mutex<HashMap<K, V>>,
    parked: Mutex<HashMap<K, V>>,
}

impl<K, V> Default for SessionTable<K, V> {
    fn default() -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
            parked: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> SessionTable<K, V>
where
    K: Copy + Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live(&self, key: &K) -> Option<V> {
        self.live.lock().get(key).cloned()
    }

    pub fn parked(&self, key: &K) -> Option<V> {
        self.parked.lock().get(key).cloned()
    }

    /// Returns the entry previously live under `key`, if any.
    pub fn insert_live(&self, key: K, value: V) -> Option<V> {
        self.live.lock().insert(key, value)
    }

    /// Move `key` from `Live` to `Parked`. Returns false if it was not live.
    pub fn park(&self, key: &K) -> bool {
        let Some(value) = self.live.lock().remove(key) else {
            return false;
        };
        self.parked.lock().insert(*key, value);
        true
    }

    pub fn remove_parked(&self, key: &K) -> Option<V> {
        self.parked.lock().remove(key)
    }

    /// Remove `key` from both tables, returning whatever was there.
    pub fn remove(&self, key: &K) -> (Option<V>, Option<V>) {
        let live = self.live.lock().remove(key);
        let parked = self.parked.lock().remove(key);
        (live, parked)
    }

    /// Snapshot of live keys; entries may be removed while iterating it.
    pub fn live_keys(&self) -> Vec<K> {
        self.live.lock().keys().copied().collect()
    }

    pub fn parked_keys(&self) -> Vec<K> {
        self.parked.lock().keys().copied().collect()
    }

    pub fn live_len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn parked_len(&self) -> usize {
        self.parked.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(last: u8, port: u16) -> FlowKey {
        FlowKey::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    #[test]
    fn park_moves_entry_out_of_live() {
        let table = SessionTable::new();
        table.insert_live(key(1, 80), "a");

        assert!(table.park(&key(1, 80)));
        assert!(table.live(&key(1, 80)).is_none());
        assert_eq!(table.parked(&key(1, 80)), Some("a"));
        assert!(!table.park(&key(1, 80)));

        // a fresh flow may reuse the key while the old one drains
        table.insert_live(key(1, 80), "b");
        assert_eq!(table.live(&key(1, 80)), Some("b"));
        assert_eq!(table.parked(&key(1, 80)), Some("a"));
    }

    #[test]
    fn remove_clears_both_tables_and_is_repeatable() {
        let table = SessionTable::new();
        table.insert_live(key(1, 80), 1);
        table.park(&key(1, 80));
        table.insert_live(key(1, 80), 2);

        assert_eq!(table.remove(&key(1, 80)), (Some(2), Some(1)));
        assert_eq!(table.remove(&key(1, 80)), (None, None));
        assert_eq!(table.live_len(), 0);
        assert_eq!(table.parked_len(), 0);
    }

    #[test]
    fn snapshot_survives_removal_during_sweep() {
        let table = SessionTable::new();
        for port in 1..=5 {
            table.insert_live(key(1, port), port);
        }
        for k in table.live_keys() {
            table.remove(&k);
        }
        assert_eq!(table.live_len(), 0);
    }

    #[test]
    fn invalid_keys() {
        assert!(key(1, 443).is_valid());
        assert!(!key(1, 0).is_valid());
        assert!(!FlowKey::new(Ipv4Addr::UNSPECIFIED, 443).is_valid());
    }
}

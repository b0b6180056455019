//! TTL-bounded maps for ARP and DNS state. Entries expire lazily on read
//! and eagerly on the periodic cleanup sweep.

use core::net::Ipv4Addr;

use std::collections::HashMap;

use embassy_time::{Duration, Instant};

use ccnet_link::NodeId;
use ccnet_proto::MacAddr;

/// What an ARP reply teaches us about an address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArpInfo {
    pub mac: MacAddr,
    pub hostname: String,
    pub node_id: NodeId,
}

struct Entry<V> {
    value: V,
    expires: Instant,
}

/// A map whose entries carry an absolute expiry.
pub struct TtlCache<K, V> {
    map: HashMap<K, Entry<V>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: core::hash::Hash + Eq + Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            map: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Upserts with the cache's default TTL.
    pub fn insert(&mut self, key: K, value: V, now: Instant) {
        self.insert_with_ttl(key, value, self.ttl, now);
    }

    /// Upserts with an explicit TTL (DNS answers carry their own).
    pub fn insert_with_ttl(&mut self, key: K, value: V, ttl: Duration, now: Instant) {
        self.map.insert(
            key,
            Entry {
                value,
                expires: now + ttl,
            },
        );
    }

    /// A fresh entry, or nothing. Expired entries are not returned even
    /// before the sweep catches them.
    pub fn get(&self, key: &K, now: Instant) -> Option<&V> {
        self.map
            .get(key)
            .filter(|entry| entry.expires > now)
            .map(|entry| &entry.value)
    }

    /// Seconds until the entry expires, for answers served from cache.
    pub fn remaining_secs(&self, key: &K, now: Instant) -> Option<u64> {
        self.map
            .get(key)
            .and_then(|entry| entry.expires.checked_duration_since(now))
            .map(|left| left.as_secs())
    }

    /// Drops expired entries; returns how many were dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| entry.expires > now);

        before - self.map.len()
    }

    pub fn flush(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Live entries with their remaining lifetime, for the state snapshot.
    pub fn snapshot(&self, now: Instant) -> impl Iterator<Item = (&K, &V, u64)> {
        self.map.iter().filter_map(move |(key, entry)| {
            entry
                .expires
                .checked_duration_since(now)
                .map(|left| (key, &entry.value, left.as_secs()))
        })
    }
}

/// The ARP cache: ip → (mac, hostname, node-id).
pub type ArpCache = TtlCache<Ipv4Addr, ArpInfo>;

/// The DNS cache: hostname → ip.
pub type DnsCache = TtlCache<String, Ipv4Addr>;

//! Monotonic traffic counters, reset only explicitly.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub dns_queries: u64,
    pub arp_requests: u64,
    pub http_requests: u64,
    pub ws_conns: u64,
    pub udp_packets: u64,
    pub errors: u64,
}

impl Statistics {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn sent(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn received(&mut self, bytes: usize) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
    }
}

/// What `stats()` returns and what the stats file carries.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct StatsSnapshot {
    #[serde(flatten)]
    pub counters: Statistics,
    pub uptime_ms: u64,
}

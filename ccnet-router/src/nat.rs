//! Source/destination NAT with a 5-minute idle conntrack table.

use core::net::Ipv4Addr;

use std::collections::HashMap;

use embassy_time::{Duration, Instant};

use log::debug;

/// Conntrack entries idle longer than this are aged out.
pub const NAT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Translated source ports are allocated from this range.
pub const NAT_PORT_START: u16 = 32768;
pub const NAT_PORT_END: u16 = 65535;

/// A static destination-NAT rule: WAN-side port to a LAN host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortForward {
    pub proto: String,
    pub wan_port: u16,
    pub dest_ip: Ipv4Addr,
    pub dest_port: u16,
}

impl PortForward {
    /// Parses `wan_port:proto:dest_ip:dest_port`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut parts = s.split(':');

        let wan_port = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| format!("bad forward {s:?}"))?;
        let proto = parts
            .next()
            .ok_or_else(|| format!("bad forward {s:?}"))?
            .to_string();
        let dest_ip = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| format!("bad forward {s:?}"))?;
        let dest_port = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| format!("bad forward {s:?}"))?;

        Ok(Self {
            proto,
            wan_port,
            dest_ip,
            dest_port,
        })
    }
}

struct NatEntry {
    translated_port: u16,
    last_used: Instant,
}

/// The connection-tracking table for SNAT, plus the reverse index used to
/// route return traffic back in.
pub struct NatTable {
    entries: HashMap<(Ipv4Addr, u16), NatEntry>,
    reverse: HashMap<u16, (Ipv4Addr, u16)>,
    next_port: u16,
}

impl Default for NatTable {
    fn default() -> Self {
        Self::new()
    }
}

impl NatTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            reverse: HashMap::new(),
            next_port: NAT_PORT_START,
        }
    }

    /// Translates an outbound flow, reusing (and refreshing) the existing
    /// mapping for a known `(src_ip, src_port)` pair.
    pub fn snat(&mut self, src_ip: Ipv4Addr, src_port: u16, now: Instant) -> Option<u16> {
        if let Some(entry) = self.entries.get_mut(&(src_ip, src_port)) {
            entry.last_used = now;
            return Some(entry.translated_port);
        }

        let translated = self.alloc_port()?;

        debug!("nat: {src_ip}:{src_port} -> :{translated}");

        self.entries.insert(
            (src_ip, src_port),
            NatEntry {
                translated_port: translated,
                last_used: now,
            },
        );
        self.reverse.insert(translated, (src_ip, src_port));

        Some(translated)
    }

    /// Maps return traffic on a translated port back to the original flow.
    pub fn lookup_inbound(&mut self, translated_port: u16, now: Instant) -> Option<(Ipv4Addr, u16)> {
        let original = *self.reverse.get(&translated_port)?;

        if let Some(entry) = self.entries.get_mut(&original) {
            entry.last_used = now;
        }

        Some(original)
    }

    /// Ages out idle flows. Returns how many were dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let dead: Vec<(Ipv4Addr, u16)> = self
            .entries
            .iter()
            .filter(|(_, entry)| now - entry.last_used > NAT_IDLE_TIMEOUT)
            .map(|(key, _)| *key)
            .collect();

        for key in &dead {
            if let Some(entry) = self.entries.remove(key) {
                self.reverse.remove(&entry.translated_port);
            }
        }

        dead.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn alloc_port(&mut self) -> Option<u16> {
        const ATTEMPTS: usize = (NAT_PORT_END - NAT_PORT_START) as usize + 1;

        for _ in 0..ATTEMPTS {
            let candidate = self.next_port;

            self.next_port = if self.next_port == NAT_PORT_END {
                NAT_PORT_START
            } else {
                self.next_port + 1
            };

            if !self.reverse.contains_key(&candidate) {
                return Some(candidate);
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snat_is_idempotent_per_flow() {
        let mut nat = NatTable::new();
        let now = Instant::now();

        let src = Ipv4Addr::new(10, 0, 1, 50);

        let first = nat.snat(src, 5000, now).unwrap();
        let second = nat.snat(src, 5000, now + Duration::from_secs(10)).unwrap();

        assert_eq!(first, second);
        assert_eq!(nat.len(), 1);
    }

    #[test]
    fn distinct_flows_get_distinct_ports() {
        let mut nat = NatTable::new();
        let now = Instant::now();

        let a = nat.snat(Ipv4Addr::new(10, 0, 1, 50), 5000, now).unwrap();
        let b = nat.snat(Ipv4Addr::new(10, 0, 1, 50), 5001, now).unwrap();
        let c = nat.snat(Ipv4Addr::new(10, 0, 1, 51), 5000, now).unwrap();

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!((NAT_PORT_START..=NAT_PORT_END).contains(&a));
    }

    #[test]
    fn return_traffic_finds_the_original_flow() {
        let mut nat = NatTable::new();
        let now = Instant::now();

        let src = Ipv4Addr::new(10, 0, 1, 50);
        let translated = nat.snat(src, 5000, now).unwrap();

        assert_eq!(nat.lookup_inbound(translated, now), Some((src, 5000)));
        assert_eq!(nat.lookup_inbound(translated + 1, now), None);
    }

    #[test]
    fn idle_flows_age_out_and_refresh_extends() {
        let mut nat = NatTable::new();
        let now = Instant::now();

        let src = Ipv4Addr::new(10, 0, 1, 50);
        let translated = nat.snat(src, 5000, now).unwrap();

        // activity at +4 min keeps the flow alive at +6
        nat.snat(src, 5000, now + Duration::from_secs(240)).unwrap();
        assert_eq!(nat.sweep(now + Duration::from_secs(360)), 0);

        // silence past the timeout removes it, freeing the port
        assert_eq!(nat.sweep(now + Duration::from_secs(600)), 1);
        assert!(nat.is_empty());
        assert_eq!(nat.lookup_inbound(translated, now), None);
    }

    #[test]
    fn port_forward_parsing() {
        let forward = PortForward::parse("8080:udp:10.0.1.50:80").unwrap();

        assert_eq!(forward.wan_port, 8080);
        assert_eq!(forward.proto, "udp");
        assert_eq!(forward.dest_ip, Ipv4Addr::new(10, 0, 1, 50));
        assert_eq!(forward.dest_port, 80);

        assert!(PortForward::parse("8080:udp:nope:80").is_err());
        assert!(PortForward::parse("8080").is_err());
    }
}

//! Per-node identity: id, MAC, IPv4, hostnames and the tags the node
//! listens on. Immutable once the daemon has started.

use core::fmt::{self, Display};
use core::net::Ipv4Addr;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// A MAC-like identifier, rendered `XX:XX:XX:XX:XX:XX`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// The derived MAC for a node-id: `CC:AF:` plus the id in big-endian.
    pub fn for_node(id: u32) -> Self {
        let id = id.to_be_bytes();

        Self([0xCC, 0xAF, id[0], id[1], id[2], id[3]])
    }
}

impl Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0; 6];
        let mut parts = s.split(':');

        for octet in octets.iter_mut() {
            let part = parts.next().ok_or(Error::InvalidMac)?;
            *octet = u8::from_str_radix(part, 16).map_err(|_| Error::InvalidMac)?;
        }

        if parts.next().is_some() {
            return Err(Error::InvalidMac);
        }

        Ok(Self(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;

        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The tag strings this node listens on, one per protocol role.
///
/// Defaults are the canonical tags; a config may override individual entries
/// to segregate traffic on a shared medium.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolTags {
    pub generic: String,
    pub discovery: String,
    pub dns: String,
    pub arp: String,
    pub http: String,
    pub ws: String,
    pub udp: String,
}

impl Default for ProtocolTags {
    fn default() -> Self {
        Self {
            generic: "ccnet".into(),
            discovery: "ccnet_discovery".into(),
            dns: "ccnet_dns".into(),
            arp: "ccnet_arp".into(),
            http: "ccnet_http".into(),
            ws: "ccnet_ws".into(),
            udp: "ccnet_udp".into(),
        }
    }
}

/// Everything a node knows about itself. Created at daemon start from the
/// config store and never mutated afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub id: u32,
    pub mac: MacAddr,
    pub ipv4: Ipv4Addr,
    pub hostname: String,
    pub fqdn: String,
    pub gateway: Ipv4Addr,
    pub dns: Vec<Ipv4Addr>,
    #[serde(default)]
    pub tags: ProtocolTags,
}

impl NodeIdentity {
    /// Builds the identity for `id`, deriving every field that was not
    /// configured.
    pub fn derive(
        id: u32,
        hostname: Option<String>,
        mac: Option<MacAddr>,
        ipv4: Option<Ipv4Addr>,
        gateway: Option<Ipv4Addr>,
        dns: Vec<Ipv4Addr>,
    ) -> Self {
        let hostname = hostname.unwrap_or_else(|| format!("cc-{}", id));
        let fqdn = format!("{}.local", hostname);
        let gateway = gateway.unwrap_or(Ipv4Addr::new(10, 0, 0, 1));
        let dns = if dns.is_empty() { vec![gateway] } else { dns };

        Self {
            id,
            mac: mac.unwrap_or_else(|| MacAddr::for_node(id)),
            ipv4: ipv4.unwrap_or_else(|| derive_ipv4(id)),
            hostname,
            fqdn,
            gateway,
            dns,
            tags: ProtocolTags::default(),
        }
    }

    /// True iff `name` is one of the names this node answers for
    /// authoritatively.
    pub fn is_self_name(&self, name: &str) -> bool {
        name == "localhost" || name == self.hostname || name == self.fqdn
    }

    /// The authoritative answer for one of our own names, bypassing any
    /// cache: `127.0.0.1` for `localhost`, our IPv4 otherwise.
    pub fn resolve_self(&self, name: &str) -> Option<Ipv4Addr> {
        if name == "localhost" {
            Some(Ipv4Addr::LOCALHOST)
        } else if name == self.hostname || name == self.fqdn {
            Some(self.ipv4)
        } else {
            None
        }
    }
}

/// The derived address for a node-id: `10.0.<id/254 mod 256>.<id mod 254 + 1>`.
pub fn derive_ipv4(id: u32) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, ((id / 254) % 256) as u8, (id % 254 + 1) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_derivation() {
        assert_eq!(MacAddr::for_node(1).to_string(), "CC:AF:00:00:00:01");
        assert_eq!(MacAddr::for_node(2).to_string(), "CC:AF:00:00:00:02");
        assert_eq!(MacAddr::for_node(0x0102_0304).to_string(), "CC:AF:01:02:03:04");
    }

    #[test]
    fn mac_parse_round_trip() {
        let mac: MacAddr = "CC:AF:00:00:00:2A".parse().unwrap();
        assert_eq!(mac.to_string(), "CC:AF:00:00:00:2A");

        assert!("CC:AF:00:00:00".parse::<MacAddr>().is_err());
        assert!("CC:AF:00:00:00:2A:FF".parse::<MacAddr>().is_err());
        assert!("not-a-mac".parse::<MacAddr>().is_err());
    }

    #[test]
    fn ip_derivation() {
        assert_eq!(derive_ipv4(1), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(derive_ipv4(2), Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(derive_ipv4(253), Ipv4Addr::new(10, 0, 0, 254));
        assert_eq!(derive_ipv4(254), Ipv4Addr::new(10, 0, 1, 1));
        assert_eq!(derive_ipv4(508), Ipv4Addr::new(10, 0, 2, 1));
    }

    #[test]
    fn derived_identity_defaults() {
        let identity = NodeIdentity::derive(7, None, None, None, None, Vec::new());

        assert_eq!(identity.hostname, "cc-7");
        assert_eq!(identity.fqdn, "cc-7.local");
        assert_eq!(identity.mac, MacAddr::for_node(7));
        assert_eq!(identity.ipv4, Ipv4Addr::new(10, 0, 0, 8));
        assert_eq!(identity.dns, vec![identity.gateway]);
    }

    #[test]
    fn self_resolution_bypasses_the_network() {
        let identity =
            NodeIdentity::derive(1, Some("alpha".into()), None, None, None, Vec::new());

        assert_eq!(identity.resolve_self("localhost"), Some(Ipv4Addr::LOCALHOST));
        assert_eq!(identity.resolve_self("alpha"), Some(identity.ipv4));
        assert_eq!(identity.resolve_self("alpha.local"), Some(identity.ipv4));
        assert_eq!(identity.resolve_self("beta"), None);
    }
}

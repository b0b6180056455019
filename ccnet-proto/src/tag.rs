//! Protocol tags: the string that prefixes every datagram on the medium and
//! selects a handler on the receiver.

use core::fmt::{self, Display};
use core::net::Ipv4Addr;
use core::str::FromStr;

/// A recognized protocol tag.
///
/// Canonical tag strings are emitted on output; the aliases
/// (`network_adapter_*`, `UDP_PACKET`, the router's upper-case service tags)
/// are accepted on input only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Tag {
    /// `ccnet` — generic/identity traffic (`whoami?`).
    Generic,
    /// `ccnet_discovery` — discovery, announce, id_query.
    Discovery,
    /// `network_adapter_discovery` — hostname_query/hostname_response.
    ///
    /// Kept distinct from [`Tag::Discovery`] because replies must go back on
    /// the tag the query arrived on.
    AdapterDiscovery,
    /// `ccnet_dns`.
    Dns,
    /// `ccnet_arp`.
    Arp,
    /// `ccnet_http`.
    Http,
    /// `ccnet_ws`.
    Ws,
    /// `ccnet_udp` (alias `UDP_PACKET`).
    Udp,
    /// `DHCP` — router-side address assignment.
    Dhcp,
    /// `WIRELESS_AUTH` — AP association handshake.
    WirelessAuth,
    /// `BEACON` — wireless advertisement.
    Beacon,
    /// `ping_<source-ip>`; the source IP keeps concurrent pingers apart.
    Ping(Ipv4Addr),
    /// `pong_<source-ip>`.
    Pong(Ipv4Addr),
}

impl Tag {
    /// Parses a tag string, accepting every alias the wire format allows.
    pub fn parse(tag: &str) -> Option<Self> {
        let tag = match tag {
            "ccnet" => Self::Generic,
            "ccnet_discovery" => Self::Discovery,
            "network_adapter_discovery" => Self::AdapterDiscovery,
            "ccnet_dns" | "network_adapter_dns" | "DNS" => Self::Dns,
            "ccnet_arp" => Self::Arp,
            "ccnet_http" | "network_adapter_http" => Self::Http,
            "ccnet_ws" | "network_adapter_ws" => Self::Ws,
            "ccnet_udp" | "network_adapter_udp" | "UDP_PACKET" => Self::Udp,
            "DHCP" => Self::Dhcp,
            "WIRELESS_AUTH" => Self::WirelessAuth,
            "BEACON" => Self::Beacon,
            _ => {
                if let Some(ip) = tag.strip_prefix("ping_") {
                    Self::Ping(Ipv4Addr::from_str(ip).ok()?)
                } else if let Some(ip) = tag.strip_prefix("pong_") {
                    Self::Pong(Ipv4Addr::from_str(ip).ok()?)
                } else {
                    return None;
                }
            }
        };

        Some(tag)
    }

    /// The canonical tag string for the fixed (non-ping) tags.
    pub fn canonical(&self) -> Option<&'static str> {
        match self {
            Self::Generic => Some("ccnet"),
            Self::Discovery => Some("ccnet_discovery"),
            Self::AdapterDiscovery => Some("network_adapter_discovery"),
            Self::Dns => Some("ccnet_dns"),
            Self::Arp => Some("ccnet_arp"),
            Self::Http => Some("ccnet_http"),
            Self::Ws => Some("ccnet_ws"),
            Self::Udp => Some("ccnet_udp"),
            Self::Dhcp => Some("DHCP"),
            Self::WirelessAuth => Some("WIRELESS_AUTH"),
            Self::Beacon => Some("BEACON"),
            Self::Ping(_) | Self::Pong(_) => None,
        }
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ping(ip) => write!(f, "ping_{}", ip),
            Self::Pong(ip) => write!(f, "pong_{}", ip),
            other => write!(f, "{}", other.canonical().unwrap()),
        }
    }
}

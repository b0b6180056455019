#![allow(async_fn_in_trait)]
#![warn(clippy::large_futures)]

//! DHCP over the ccnet medium.
//!
//! Address assignment rides the `DHCP` protocol tag as tagged JSON, but the
//! conversation is classic BOOTP: DISCOVER broadcast, OFFER unicast, REQUEST,
//! ACK/NAK, RELEASE. The [`server`] half is a pure lease pool driven by the
//! router daemon; the [`client`] half is an async state machine that owns its
//! own link endpoint.

use core::fmt::{self, Debug, Display};
use core::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use ccnet_proto::MacAddr;

pub mod client;
pub mod server;

/// The protocol tag DHCP traffic rides on.
pub const TAG: &str = "DHCP";

#[derive(Debug)]
pub enum Error<E> {
    Io(E),
    Proto(ccnet_proto::Error),
    /// No usable reply within the configured retries.
    Timeout,
    /// The server refused the requested address.
    Nak(String),
    /// An operation that needs a bound lease was called without one.
    NotBound,
}

impl<E> From<ccnet_proto::Error> for Error<E> {
    fn from(err: ccnet_proto::Error) -> Self {
        Self::Proto(err)
    }
}

impl<E> Display for Error<E>
where
    E: Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "IO error: {}", err),
            Self::Proto(err) => write!(f, "Protocol error: {}", err),
            Self::Timeout => write!(f, "Timeout"),
            Self::Nak(reason) => write!(f, "Request refused: {}", reason),
            Self::NotBound => write!(f, "No bound lease"),
        }
    }
}

impl<E> std::error::Error for Error<E> where E: Display + Debug {}

/// The DHCP conversation, tagged by upper-case `type` as on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum DhcpMessage {
    Discover {
        xid: u32,
        mac: MacAddr,
        hostname: String,
    },
    Offer {
        xid: u32,
        ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        subnet: Ipv4Addr,
        gateway: Ipv4Addr,
        dns: Vec<Ipv4Addr>,
        lease_time: u64,
    },
    Request {
        xid: u32,
        mac: MacAddr,
        hostname: String,
        requested_ip: Ipv4Addr,
    },
    Ack {
        xid: u32,
        ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        subnet: Ipv4Addr,
        gateway: Ipv4Addr,
        dns: Vec<Ipv4Addr>,
        lease_time: u64,
    },
    Nak {
        xid: u32,
        reason: String,
    },
    Release {
        mac: MacAddr,
        ip: Ipv4Addr,
    },
}

/// The network settings a successful negotiation yields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub ip: Ipv4Addr,
    pub server_ip: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Vec<Ipv4Addr>,
    pub lease_time_secs: u64,
}

impl Settings {
    fn from_ack(msg: &DhcpMessage) -> Option<Self> {
        if let DhcpMessage::Ack {
            ip,
            server_ip,
            subnet,
            gateway,
            dns,
            lease_time,
            ..
        } = msg
        {
            Some(Self {
                ip: *ip,
                server_ip: *server_ip,
                subnet: *subnet,
                gateway: *gateway,
                dns: dns.clone(),
                lease_time_secs: *lease_time,
            })
        } else {
            None
        }
    }
}

//! The UDP datagram format carried on the `ccnet_udp` tag: an inner packet
//! with ports, length and an advisory checksum, wrapped in an IP-style
//! envelope with source/destination addresses and a TTL.

use core::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::{now_millis, Error};

/// Largest payload a single datagram may carry.
pub const MAX_PAYLOAD: usize = 65507;

/// Size of the logical UDP header, counted into `length`.
pub const HEADER_LEN: u16 = 8;

/// The checksum of the packet fields: a plain sum of the ports, the length
/// and the payload bytes, mod 65536.
///
/// This detects no structured corruption of any practical value; it is a
/// placeholder kept for wire compatibility, not an integrity primitive.
pub fn checksum(source_port: u16, dest_port: u16, length: u16, data: &str) -> u16 {
    let mut sum = source_port as u32 + dest_port as u32 + length as u32;

    for byte in data.as_bytes() {
        sum += *byte as u32;
    }

    (sum % 65536) as u16
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpPacket {
    pub protocol: String,
    pub source_port: u16,
    pub dest_port: u16,
    pub length: u16,
    pub checksum: u16,
    pub data: String,
    /// Millis since epoch at creation; diagnostic only.
    pub timestamp: u64,
}

impl UdpPacket {
    /// Builds a packet for `data`, computing length and checksum.
    ///
    /// Fails with [`Error::PayloadTooLarge`] beyond [`MAX_PAYLOAD`] bytes;
    /// such a datagram would be dropped by every receiver anyway.
    pub fn new(source_port: u16, dest_port: u16, data: String) -> Result<Self, Error> {
        if data.len() > MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge);
        }

        let length = HEADER_LEN + data.len() as u16;

        Ok(Self {
            protocol: "UDP".into(),
            source_port,
            dest_port,
            length,
            checksum: checksum(source_port, dest_port, length, &data),
            data,
            timestamp: now_millis(),
        })
    }

    /// Recomputes the checksum and compares; receivers may be configured to
    /// drop on mismatch.
    pub fn verify(&self) -> bool {
        self.length == HEADER_LEN.wrapping_add(self.data.len() as u16)
            && self.checksum
                == checksum(self.source_port, self.dest_port, self.length, &self.data)
    }
}

/// The IP-style envelope the UDP packet travels in on the medium.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPacket {
    pub protocol: String,
    pub source_ip: Ipv4Addr,
    pub dest_ip: Ipv4Addr,
    pub ttl: u8,
    pub udp_packet: UdpPacket,
}

impl NetworkPacket {
    pub fn new(source_ip: Ipv4Addr, dest_ip: Ipv4Addr, udp_packet: UdpPacket) -> Self {
        Self {
            protocol: "UDP".into(),
            source_ip,
            dest_ip,
            ttl: 64,
            udp_packet,
        }
    }
}

//! A medium backend over real UDP broadcast, so that separate OS processes
//! (or hosts on one LAN segment) form a single-hop ccnet medium.
//!
//! Every frame travels as a broadcast datagram carrying a small JSON
//! envelope; unicast is broadcast plus a `dest` filter on the receivers.
//! Processes on the same host cannot share the medium port without
//! `SO_REUSEADDR`, which std does not expose; co-located nodes should use
//! [`crate::hub`] instead.

use std::borrow::Cow;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use async_io::Async;

use log::debug;

use serde::{Deserialize, Serialize};

use crate::{ErrorType, Frame, LinkError, LinkRecv, LinkSend, NodeId};

/// The UDP port the medium rides on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 17423;

/// Largest frame the backend accepts: the UDP-subsystem payload cap plus
/// envelope overhead.
const MAX_FRAME: usize = 65536 + 512;

#[derive(Serialize, Deserialize)]
struct Envelope<'a> {
    sender: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dest: Option<NodeId>,
    tag: Cow<'a, str>,
    payload: Cow<'a, str>,
}

fn accepts(dest: Option<NodeId>, sender: NodeId, our_node: NodeId) -> bool {
    // Our own broadcasts loop back on most hosts; the medium never
    // delivers a frame to its sender
    sender != our_node && dest.map(|dest| dest == our_node).unwrap_or(true)
}

/// One endpoint on the UDP-broadcast medium.
pub struct UdpLink {
    socket: Async<UdpSocket>,
    node: NodeId,
    medium_port: u16,
    buf: Box<[u8]>,
}

impl UdpLink {
    /// Binds the medium socket on `0.0.0.0:<medium_port>` with broadcast
    /// enabled.
    pub fn bind(node: NodeId, medium_port: u16) -> Result<Self, LinkError> {
        let socket = UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            medium_port,
        )))?;
        socket.set_broadcast(true)?;

        Ok(Self {
            socket: Async::new(socket)?,
            node,
            medium_port,
            buf: vec![0; MAX_FRAME].into_boxed_slice(),
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    async fn transmit(
        &mut self,
        dest: Option<NodeId>,
        tag: &str,
        payload: &str,
    ) -> Result<(), LinkError> {
        let envelope = Envelope {
            sender: self.node,
            dest,
            tag: Cow::Borrowed(tag),
            payload: Cow::Borrowed(payload),
        };

        let data = serde_json::to_vec(&envelope).map_err(|_| LinkError::InvalidFrame)?;

        self.socket
            .send_to(
                &data,
                SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, self.medium_port)),
            )
            .await?;

        Ok(())
    }
}

impl ErrorType for UdpLink {
    type Error = LinkError;
}

impl LinkSend for UdpLink {
    async fn unicast(
        &mut self,
        dest: NodeId,
        tag: &str,
        payload: &str,
    ) -> Result<(), Self::Error> {
        self.transmit(Some(dest), tag, payload).await
    }

    async fn broadcast(&mut self, tag: &str, payload: &str) -> Result<(), Self::Error> {
        self.transmit(None, tag, payload).await
    }
}

impl LinkRecv for UdpLink {
    async fn receive(&mut self) -> Result<Frame, Self::Error> {
        loop {
            let (len, remote) = self.socket.recv_from(&mut self.buf).await?;

            let envelope: Envelope = match serde_json::from_slice(&self.buf[..len]) {
                Ok(envelope) => envelope,
                Err(err) => {
                    debug!("udp link: undecodable frame from {remote}: {err}");
                    continue;
                }
            };

            if !accepts(envelope.dest, envelope.sender, self.node) {
                continue;
            }

            return Ok(Frame {
                sender: envelope.sender,
                tag: envelope.tag.into_owned(),
                payload: envelope.payload.into_owned(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let envelope = Envelope {
            sender: 7,
            dest: Some(9),
            tag: Cow::Borrowed("ccnet_dns"),
            payload: Cow::Borrowed(r#"{"type":"query","hostname":"alpha"}"#),
        };

        let data = serde_json::to_vec(&envelope).unwrap();
        let back: Envelope = serde_json::from_slice(&data).unwrap();

        assert_eq!(back.sender, 7);
        assert_eq!(back.dest, Some(9));
        assert_eq!(back.tag, "ccnet_dns");
    }

    #[test]
    fn broadcast_envelope_omits_dest() {
        let envelope = Envelope {
            sender: 1,
            dest: None,
            tag: Cow::Borrowed("t"),
            payload: Cow::Borrowed("{}"),
        };

        let text = serde_json::to_string(&envelope).unwrap();
        assert!(!text.contains("dest"));

        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back.dest, None);
    }

    #[test]
    fn filter_semantics() {
        // broadcast: everyone but the sender
        assert!(accepts(None, 1, 2));
        assert!(!accepts(None, 1, 1));

        // unicast: the addressee only
        assert!(accepts(Some(2), 1, 2));
        assert!(!accepts(Some(3), 1, 2));
        assert!(!accepts(Some(1), 1, 1));
    }
}

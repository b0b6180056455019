//! The router's protocol core: a pure state machine fed decoded frames,
//! producing frames to transmit. No I/O here; the daemon owns the medium.

use core::net::Ipv4Addr;

use embassy_time::{Duration, Instant};

use log::{debug, info};

use serde::Serialize;

use ccnet_dhcp::server::Server as DhcpServer;
use ccnet_dhcp::DhcpMessage;
use ccnet_link::{Frame, NodeId};
use ccnet_proto::msg::{self, DnsMessage};
use ccnet_proto::udp::{checksum, NetworkPacket, UdpPacket};
use ccnet_proto::Tag;

use crate::cidr::Cidr;
use crate::config::RouterConfig;
use crate::firewall::{Action, Chain, Firewall, PacketMeta};
use crate::iface::{Interfaces, LAN, WAN};
use crate::nat::{NatTable, PortForward};
use crate::routes::RoutingTable;
use crate::wireless::{AccessPoint, AuthMessage};
use crate::RouterStats;

/// TTL for the router's own DNS answers, seconds.
const DNS_TTL: u64 = 300;

/// A frame the core wants transmitted.
#[derive(Clone, Debug)]
pub struct Outgoing {
    pub dest: Option<NodeId>,
    pub tag: String,
    pub payload: String,
}

impl Outgoing {
    fn unicast<T: Serialize>(dest: NodeId, tag: &str, msg: &T) -> Option<Self> {
        Some(Self {
            dest: Some(dest),
            tag: tag.to_string(),
            payload: msg::encode(msg).ok()?,
        })
    }

    fn broadcast<T: Serialize>(tag: &str, msg: &T) -> Option<Self> {
        Some(Self {
            dest: None,
            tag: tag.to_string(),
            payload: msg::encode(msg).ok()?,
        })
    }
}

pub struct Router {
    node_id: NodeId,
    hostname: String,
    fqdn: String,
    lan_ip: Ipv4Addr,
    wan_ip: Option<Ipv4Addr>,
    lan_subnet: Cidr,

    pub ifaces: Interfaces,
    pub routes: RoutingTable,
    pub firewall: Firewall,
    pub nat: NatTable,
    nat_enabled: bool,
    port_forwards: Vec<PortForward>,
    dmz_host: Option<Ipv4Addr>,

    pub dhcp: DhcpServer,
    pub ap: Option<AccessPoint>,

    pub stats: RouterStats,
    /// Set when the lease table changed and should be persisted.
    pub leases_dirty: bool,
}

impl Router {
    pub fn new(config: &RouterConfig, firewall: Firewall) -> Self {
        let ifaces = Interfaces::classify(&config.interfaces);

        let routes = RoutingTable::gateway_defaults(
            config.lan_subnet,
            if ifaces.wan { config.wan_gateway } else { None },
        );

        let dhcp = DhcpServer::new(
            config.lan_ip,
            config.lan_subnet.netmask(),
            config.lan_ip,
            config.dns.clone(),
            config.dhcp_range_start,
            config.dhcp_range_end,
            Duration::from_secs(config.dhcp_lease_time),
        );

        let ap = ifaces.wlan.then(|| {
            AccessPoint::new(config.ssid.clone(), config.security, config.channel)
        });

        Self {
            node_id: config.node_id,
            hostname: config.hostname.clone(),
            fqdn: config.fqdn(),
            lan_ip: config.lan_ip,
            wan_ip: config.wan_ip,
            lan_subnet: config.lan_subnet,
            ifaces,
            routes,
            firewall,
            nat: NatTable::new(),
            nat_enabled: config.nat_enabled,
            port_forwards: config.port_forwards.clone(),
            dmz_host: config.dmz_host,
            dhcp,
            ap,
            stats: RouterStats::default(),
            leases_dirty: false,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn lan_ip(&self) -> Ipv4Addr {
        self.lan_ip
    }

    /// Demultiplexes one frame off the medium.
    pub fn handle_frame(&mut self, frame: &Frame, now: Instant) -> Vec<Outgoing> {
        let Some(tag) = Tag::parse(&frame.tag) else {
            return Vec::new();
        };

        match tag {
            Tag::Dhcp if self.ifaces.lan => self.on_dhcp(frame, now).into_iter().collect(),
            Tag::Dns => self.on_dns(frame).into_iter().collect(),
            Tag::WirelessAuth => self.on_wireless(frame, now).into_iter().collect(),
            Tag::Udp => self.on_udp(frame, now).into_iter().collect(),
            // The router is not a general node; everything else on the
            // medium belongs to the per-node daemons
            _ => Vec::new(),
        }
    }

    /// Periodic maintenance: lease expiry, conntrack aging, gauges.
    pub fn sweep(&mut self, now: Instant) {
        if self.dhcp.sweep(now) > 0 {
            self.leases_dirty = true;
        }

        self.nat.sweep(now);

        self.stats.dhcp_leases_active = self.dhcp.active_leases();
        self.stats.clients_associated =
            self.ap.as_ref().map(|ap| ap.associated()).unwrap_or(0);
    }

    fn on_dhcp(&mut self, frame: &Frame, now: Instant) -> Option<Outgoing> {
        let request: DhcpMessage = msg::decode(&frame.payload).ok()?;

        let reply = self.dhcp.handle(&request, now);

        if matches!(request, DhcpMessage::Release { .. })
            || matches!(reply, Some(DhcpMessage::Ack { .. }))
        {
            self.leases_dirty = true;
        }

        Outgoing::unicast(frame.sender, ccnet_dhcp::TAG, &reply?)
    }

    fn on_dns(&mut self, frame: &Frame) -> Option<Outgoing> {
        let request: DnsMessage = msg::decode(&frame.payload).ok()?;

        let DnsMessage::Query { hostname } = request else {
            return None;
        };

        if hostname != self.hostname && hostname != self.fqdn {
            return None;
        }

        Outgoing::unicast(
            frame.sender,
            "ccnet_dns",
            &DnsMessage::Response {
                hostname,
                ip: self.lan_ip,
                ttl: DNS_TTL,
            },
        )
    }

    fn on_wireless(&mut self, frame: &Frame, now: Instant) -> Option<Outgoing> {
        let ap = self.ap.as_mut()?;

        let request: AuthMessage = msg::decode(&frame.payload).ok()?;
        let reply = ap.handle(&request, now)?;

        self.stats.clients_associated = ap.associated();

        Outgoing::unicast(frame.sender, "WIRELESS_AUTH", &reply)
    }

    fn on_udp(&mut self, frame: &Frame, now: Instant) -> Option<Outgoing> {
        let packet: NetworkPacket = serde_json::from_str(&frame.payload).ok()?;

        self.forward(packet, now)
    }

    /// The forwarding plane: PREROUTING DNAT, FORWARD filtering, TTL, SNAT,
    /// retransmit.
    fn forward(&mut self, mut packet: NetworkPacket, now: Instant) -> Option<Outgoing> {
        // Return traffic and published services: rewrite WAN-addressed
        // destinations before any chain sees the packet
        if self.nat_enabled && Some(packet.dest_ip) == self.wan_ip {
            if let Some(rewritten) = self.dnat(&packet, now) {
                packet = rewritten;
            }
        }

        // Packets still addressed to the router itself are INPUT traffic
        if packet.dest_ip == self.lan_ip || Some(packet.dest_ip) == self.wan_ip {
            let meta = self.meta_for(&packet);
            if self.firewall.evaluate(Chain::Input, &meta) != Action::Accept {
                self.stats.packets_dropped += 1;
            }
            return None;
        }

        let in_iface = if self.lan_subnet.contains(packet.source_ip) {
            LAN
        } else {
            WAN
        };

        if (in_iface == WAN && !self.ifaces.wan) || (in_iface == LAN && !self.ifaces.lan) {
            self.stats.packets_dropped += 1;
            return None;
        }

        let Some(route) = self.routes.lookup(packet.dest_ip) else {
            debug!("router: no route to {}", packet.dest_ip);
            self.stats.packets_dropped += 1;
            return None;
        };
        let out_iface = route.interface.clone();

        // Same-segment traffic reaches its destination directly on the
        // single-hop medium; only cross-interface flows traverse the router
        if out_iface == in_iface {
            return None;
        }

        let meta = PacketMeta {
            iface: in_iface,
            src_ip: packet.source_ip,
            dst_ip: packet.dest_ip,
            proto: "udp",
            sport: packet.udp_packet.source_port,
            dport: packet.udp_packet.dest_port,
        };

        if self.firewall.evaluate(Chain::Forward, &meta) != Action::Accept {
            debug!(
                "router: FORWARD blocked {}:{} -> {}:{}",
                meta.src_ip, meta.sport, meta.dst_ip, meta.dport
            );
            self.stats.packets_dropped += 1;
            return None;
        }

        if packet.ttl <= 1 {
            self.stats.packets_dropped += 1;
            return None;
        }
        packet.ttl -= 1;

        // SNAT on the way out to the WAN
        if self.nat_enabled && out_iface == WAN && self.lan_subnet.contains(packet.source_ip) {
            let Some(wan_ip) = self.wan_ip else {
                self.stats.packets_dropped += 1;
                return None;
            };

            let Some(translated) =
                self.nat
                    .snat(packet.source_ip, packet.udp_packet.source_port, now)
            else {
                self.stats.packets_dropped += 1;
                return None;
            };

            packet.source_ip = wan_ip;
            rewrite_ports(&mut packet.udp_packet, Some(translated), None);
            self.stats.packets_nat_translated += 1;
        }

        self.stats.packets_forwarded += 1;

        Outgoing::broadcast("ccnet_udp", &packet)
    }

    /// Destination NAT for WAN-addressed packets: conntrack return traffic
    /// first, then the static forwards, then the DMZ host.
    fn dnat(&mut self, packet: &NetworkPacket, now: Instant) -> Option<NetworkPacket> {
        let dport = packet.udp_packet.dest_port;

        if let Some((ip, port)) = self.nat.lookup_inbound(dport, now) {
            let mut rewritten = packet.clone();
            rewritten.dest_ip = ip;
            rewrite_ports(&mut rewritten.udp_packet, None, Some(port));
            self.stats.packets_nat_translated += 1;

            return Some(rewritten);
        }

        if let Some(forward) = self
            .port_forwards
            .iter()
            .find(|forward| forward.wan_port == dport && forward.proto.eq_ignore_ascii_case("udp"))
        {
            info!(
                "router: forwarding wan:{dport} -> {}:{}",
                forward.dest_ip, forward.dest_port
            );

            let mut rewritten = packet.clone();
            rewritten.dest_ip = forward.dest_ip;
            rewrite_ports(&mut rewritten.udp_packet, None, Some(forward.dest_port));
            self.stats.packets_nat_translated += 1;

            return Some(rewritten);
        }

        if let Some(dmz) = self.dmz_host {
            let mut rewritten = packet.clone();
            rewritten.dest_ip = dmz;
            self.stats.packets_nat_translated += 1;

            return Some(rewritten);
        }

        None
    }

    fn meta_for<'a>(&self, packet: &'a NetworkPacket) -> PacketMeta<'a> {
        let in_iface = if self.lan_subnet.contains(packet.source_ip) {
            LAN
        } else {
            WAN
        };

        PacketMeta {
            iface: in_iface,
            src_ip: packet.source_ip,
            dst_ip: packet.dest_ip,
            proto: "udp",
            sport: packet.udp_packet.source_port,
            dport: packet.udp_packet.dest_port,
        }
    }
}

/// Rewrites ports in place, keeping length and checksum consistent with the
/// packet format.
fn rewrite_ports(packet: &mut UdpPacket, source: Option<u16>, dest: Option<u16>) {
    if let Some(source) = source {
        packet.source_port = source;
    }
    if let Some(dest) = dest {
        packet.dest_port = dest;
    }

    packet.checksum = checksum(
        packet.source_port,
        packet.dest_port,
        packet.length,
        &packet.data,
    );
}

#[cfg(test)]
mod tests {
    use ccnet_proto::MacAddr;

    use super::*;

    fn config() -> RouterConfig {
        let mut config = RouterConfig::defaults(100);
        config.wan_ip = Some(Ipv4Addr::new(203, 0, 113, 7));
        config.wan_gateway = Some(Ipv4Addr::new(203, 0, 113, 1));
        config.dhcp_range_end = Ipv4Addr::new(10, 0, 1, 102);

        config
    }

    fn router() -> Router {
        Router::new(&config(), Firewall::new())
    }

    fn udp_frame(sender: NodeId, src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16) -> Frame {
        let packet = NetworkPacket::new(src, dst, UdpPacket::new(sport, dport, "x".into()).unwrap());

        Frame::new(sender, "ccnet_udp", serde_json::to_string(&packet).unwrap())
    }

    fn forwarded(out: &[Outgoing]) -> NetworkPacket {
        assert_eq!(out.len(), 1);
        serde_json::from_str(&out[0].payload).unwrap()
    }

    #[test]
    fn lan_to_wan_is_source_translated() {
        let mut router = router();
        let now = Instant::now();

        let frame = udp_frame(
            2,
            Ipv4Addr::new(10, 0, 1, 50),
            5000,
            Ipv4Addr::new(8, 8, 8, 8),
            53,
        );
        let out = router.handle_frame(&frame, now);

        let packet = forwarded(&out);
        assert_eq!(packet.source_ip, Ipv4Addr::new(203, 0, 113, 7));
        assert_ne!(packet.udp_packet.source_port, 5000);
        assert_eq!(packet.ttl, 63);
        assert!(packet.udp_packet.verify());

        assert_eq!(router.stats.packets_forwarded, 1);
        assert_eq!(router.stats.packets_nat_translated, 1);
    }

    #[test]
    fn snat_is_stable_for_a_flow() {
        let mut router = router();
        let now = Instant::now();

        let frame = udp_frame(
            2,
            Ipv4Addr::new(10, 0, 1, 50),
            5000,
            Ipv4Addr::new(8, 8, 8, 8),
            53,
        );

        let first = forwarded(&router.handle_frame(&frame, now));
        let second = forwarded(&router.handle_frame(&frame, now));

        assert_eq!(
            first.udp_packet.source_port,
            second.udp_packet.source_port
        );
    }

    #[test]
    fn return_traffic_is_destination_translated() {
        let mut router = router();
        let now = Instant::now();

        let out_frame = udp_frame(
            2,
            Ipv4Addr::new(10, 0, 1, 50),
            5000,
            Ipv4Addr::new(8, 8, 8, 8),
            53,
        );
        let translated = forwarded(&router.handle_frame(&out_frame, now))
            .udp_packet
            .source_port;

        let back_frame = udp_frame(
            99,
            Ipv4Addr::new(8, 8, 8, 8),
            53,
            Ipv4Addr::new(203, 0, 113, 7),
            translated,
        );
        let back = forwarded(&router.handle_frame(&back_frame, now));

        assert_eq!(back.dest_ip, Ipv4Addr::new(10, 0, 1, 50));
        assert_eq!(back.udp_packet.dest_port, 5000);
        assert!(back.udp_packet.verify());
    }

    #[test]
    fn firewall_drop_blocks_forwarding() {
        let firewall = Firewall::parse("FORWARD src=10.0.1.50 DROP\n").unwrap();
        let mut router = Router::new(&config(), firewall);
        let now = Instant::now();

        let frame = udp_frame(
            2,
            Ipv4Addr::new(10, 0, 1, 50),
            5000,
            Ipv4Addr::new(8, 8, 8, 8),
            53,
        );

        assert!(router.handle_frame(&frame, now).is_empty());
        assert_eq!(router.stats.packets_dropped, 1);
        assert_eq!(router.stats.packets_forwarded, 0);

        // a different LAN host still gets through
        let frame = udp_frame(
            3,
            Ipv4Addr::new(10, 0, 1, 51),
            5000,
            Ipv4Addr::new(8, 8, 8, 8),
            53,
        );
        assert_eq!(router.handle_frame(&frame, now).len(), 1);
    }

    #[test]
    fn port_forward_rewrites_inbound() {
        let mut cfg = config();
        cfg.port_forwards = vec![PortForward {
            proto: "udp".into(),
            wan_port: 8080,
            dest_ip: Ipv4Addr::new(10, 0, 1, 60),
            dest_port: 80,
        }];
        let mut router = Router::new(&cfg, Firewall::new());

        let frame = udp_frame(
            99,
            Ipv4Addr::new(8, 8, 8, 8),
            4000,
            Ipv4Addr::new(203, 0, 113, 7),
            8080,
        );
        let packet = forwarded(&router.handle_frame(&frame, Instant::now()));

        assert_eq!(packet.dest_ip, Ipv4Addr::new(10, 0, 1, 60));
        assert_eq!(packet.udp_packet.dest_port, 80);
    }

    #[test]
    fn unmatched_wan_traffic_goes_to_the_dmz() {
        let mut cfg = config();
        cfg.dmz_host = Some(Ipv4Addr::new(10, 0, 1, 99));
        let mut router = Router::new(&cfg, Firewall::new());

        let frame = udp_frame(
            99,
            Ipv4Addr::new(8, 8, 8, 8),
            4000,
            Ipv4Addr::new(203, 0, 113, 7),
            12345,
        );
        let packet = forwarded(&router.handle_frame(&frame, Instant::now()));

        assert_eq!(packet.dest_ip, Ipv4Addr::new(10, 0, 1, 99));
    }

    #[test]
    fn ttl_expiry_drops() {
        let mut router = router();

        let mut packet = NetworkPacket::new(
            Ipv4Addr::new(10, 0, 1, 50),
            Ipv4Addr::new(8, 8, 8, 8),
            UdpPacket::new(5000, 53, "x".into()).unwrap(),
        );
        packet.ttl = 1;

        let frame = Frame::new(2, "ccnet_udp", serde_json::to_string(&packet).unwrap());

        assert!(router.handle_frame(&frame, Instant::now()).is_empty());
        assert_eq!(router.stats.packets_dropped, 1);
    }

    #[test]
    fn dhcp_conversation_over_frames() {
        let mut router = router();
        let now = Instant::now();

        let discover = DhcpMessage::Discover {
            xid: 7,
            mac: MacAddr::for_node(2),
            hostname: "alpha".into(),
        };
        let frame = Frame::new(2, "DHCP", msg::encode(&discover).unwrap());

        let out = router.handle_frame(&frame, now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dest, Some(2));
        assert_eq!(out[0].tag, "DHCP");

        let reply: DhcpMessage = msg::decode(&out[0].payload).unwrap();
        assert!(matches!(reply, DhcpMessage::Offer { xid: 7, .. }));
    }

    #[test]
    fn router_answers_dns_for_its_own_name() {
        let mut router = router();

        let query = DnsMessage::Query {
            hostname: "gateway".into(),
        };
        let frame = Frame::new(2, "ccnet_dns", msg::encode(&query).unwrap());

        let out = router.handle_frame(&frame, Instant::now());
        assert_eq!(out.len(), 1);

        let reply: DnsMessage = msg::decode(&out[0].payload).unwrap();
        assert!(
            matches!(reply, DnsMessage::Response { ip, .. } if ip == Ipv4Addr::new(10, 0, 1, 1))
        );
    }

    #[test]
    fn no_wireless_interface_means_no_association() {
        let mut cfg = config();
        cfg.interfaces = vec![crate::iface::IfaceKind::Wired, crate::iface::IfaceKind::Wired];
        let mut router = Router::new(&cfg, Firewall::new());

        let auth = AuthMessage::Open {
            mac: MacAddr::for_node(2),
        };
        let frame = Frame::new(2, "WIRELESS_AUTH", msg::encode(&auth).unwrap());

        assert!(router.handle_frame(&frame, Instant::now()).is_empty());
    }
}

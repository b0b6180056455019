//! Per-protocol frame handling plus the network-facing half of the command
//! set. Everything here runs on the daemon task.

use core::net::Ipv4Addr;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant};

use log::{debug, error};

use ccnet_link::{Frame, LinkRecv, LinkSend, NodeId};
use ccnet_proto::msg::{
    self, ArpMessage, DiscoveryMessage, DnsMessage, HttpMessage, PingMessage, Protocols,
    WhoamiReply, WsMessage, WHOAMI,
};
use ccnet_proto::udp::{NetworkPacket, UdpPacket};
use ccnet_proto::{now_millis, Tag};

use crate::cache::ArpInfo;
use crate::daemon::{
    Daemon, DiscoverCollect, InflightHttp, PendingEntry, PendingPing, PendingWsConnect, WsClientConn,
    WsConn,
};
use crate::handle::{Peer, Reply, WsIncoming, WsIncomingQueue};
use crate::registry::WsEvent;
use crate::{HttpRequest, HttpResponse, NetError};

/// The port a `ws://` URL addresses; the WS default port when absent.
pub(crate) fn ws_url_port(url: &str) -> u16 {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);

    authority
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .unwrap_or(8080)
}

impl<M, L> Daemon<M, L>
where
    M: RawMutex + Send + Sync,
    L: LinkSend + LinkRecv,
{
    /// Demultiplexes one incoming datagram by protocol tag.
    pub(crate) async fn on_frame(&mut self, frame: Frame) {
        self.state.stats.received(frame.payload.len());

        let Some(tag) = self.classify(&frame.tag) else {
            debug!("netd: unknown tag {:?} from node {}", frame.tag, frame.sender);
            self.state.stats.errors += 1;
            return;
        };

        match tag {
            Tag::Generic => self.on_generic(frame).await,
            Tag::Discovery => self.on_discovery(frame, false).await,
            Tag::AdapterDiscovery => self.on_discovery(frame, true).await,
            Tag::Dns => self.on_dns(frame).await,
            Tag::Arp => self.on_arp(frame).await,
            Tag::Http => self.on_http(frame).await,
            Tag::Ws => self.on_ws(frame).await,
            Tag::Udp => self.on_udp(frame),
            Tag::Ping(source) => self.on_ping(source, frame).await,
            Tag::Pong(source) => self.on_pong(source, frame),
            // Router-side traffic shares the medium; not ours to answer
            Tag::Dhcp | Tag::WirelessAuth | Tag::Beacon => {}
        }
    }

    /// Maps a tag string to a protocol, honoring configured overrides first
    /// and the wire aliases second.
    fn classify(&self, tag: &str) -> Option<Tag> {
        let tags = &self.state.identity.tags;

        if tag == tags.generic {
            Some(Tag::Generic)
        } else if tag == tags.discovery {
            Some(Tag::Discovery)
        } else if tag == tags.dns {
            Some(Tag::Dns)
        } else if tag == tags.arp {
            Some(Tag::Arp)
        } else if tag == tags.http {
            Some(Tag::Http)
        } else if tag == tags.ws {
            Some(Tag::Ws)
        } else if tag == tags.udp {
            Some(Tag::Udp)
        } else {
            Tag::parse(tag)
        }
    }

    async fn on_generic(&mut self, frame: Frame) {
        if frame.payload.trim() == WHOAMI {
            let identity = &self.state.identity;
            let reply = WhoamiReply {
                id: identity.id,
                hostname: identity.hostname.clone(),
                mac: identity.mac,
                ip: identity.ipv4,
            };

            let tag = identity.tags.generic.clone();
            if let Ok(payload) = msg::encode(&reply) {
                self.emit(Some(frame.sender), &tag, &payload).await;
            }
        }
        // Replies on the generic tag are consumed by whoever asked, not by
        // the daemon
    }

    async fn on_discovery(&mut self, frame: Frame, adapter: bool) {
        let message: DiscoveryMessage = match msg::decode(&frame.payload) {
            Ok(message) => message,
            Err(_) => {
                self.state.stats.errors += 1;
                return;
            }
        };

        let now = Instant::now();
        let reply_tag = if adapter {
            "network_adapter_discovery".to_string()
        } else {
            self.state.identity.tags.discovery.clone()
        };

        match message {
            DiscoveryMessage::Query => {
                let identity = &self.state.identity;
                let response = DiscoveryMessage::Response {
                    id: identity.id,
                    hostname: identity.hostname.clone(),
                    fqdn: identity.fqdn.clone(),
                    mac: identity.mac,
                    ip: identity.ipv4,
                    services: self.state.registry.services(),
                    routes: Vec::new(),
                    ts: now_millis(),
                    protocols: Protocols {
                        udp: self.state.udp_enabled,
                    },
                };

                if let Ok(payload) = msg::encode(&response) {
                    self.emit(Some(frame.sender), &reply_tag, &payload).await;
                }
            }
            DiscoveryMessage::Response {
                hostname,
                fqdn,
                mac,
                ip,
                services,
                protocols,
                ..
            } => {
                self.state.arp.insert(
                    ip,
                    ArpInfo {
                        mac,
                        hostname: hostname.clone(),
                        node_id: frame.sender,
                    },
                    now,
                );
                self.state.dns.insert(hostname.clone(), ip, now);

                for collect in &mut self.state.pending.discover {
                    if !collect.found.iter().any(|peer| peer.node == frame.sender) {
                        collect.found.push(Peer {
                            node: frame.sender,
                            hostname: hostname.clone(),
                            fqdn: fqdn.clone(),
                            mac,
                            ip,
                            services: services.clone(),
                            udp: protocols.udp,
                        });
                    }
                }
            }
            DiscoveryMessage::Announce {
                hostname, ip, mac, ..
            } => {
                self.state.arp.insert(
                    ip,
                    ArpInfo {
                        mac,
                        hostname: hostname.clone(),
                        node_id: frame.sender,
                    },
                    now,
                );
                self.state.dns.insert(hostname, ip, now);
            }
            DiscoveryMessage::IdQuery { ip } => {
                if ip == self.state.identity.ipv4 {
                    let response = DiscoveryMessage::IdResponse {
                        ip,
                        mac: self.state.identity.mac,
                        hostname: self.state.identity.hostname.clone(),
                    };

                    if let Ok(payload) = msg::encode(&response) {
                        self.emit(Some(frame.sender), &reply_tag, &payload).await;
                    }
                }
            }
            DiscoveryMessage::IdResponse { ip, mac, hostname } => {
                self.state.arp.insert(
                    ip,
                    ArpInfo {
                        mac,
                        hostname,
                        node_id: frame.sender,
                    },
                    now,
                );

                if let Some(entries) = self.state.pending.id_query.remove(&ip) {
                    for entry in entries {
                        entry.reply.signal(Ok(frame.sender));
                    }
                }
            }
            DiscoveryMessage::HostnameQuery { hostname } => {
                if self.state.identity.is_self_name(&hostname) {
                    let response = DiscoveryMessage::HostnameResponse {
                        hostname,
                        ip: self.state.identity.ipv4,
                    };

                    if let Ok(payload) = msg::encode(&response) {
                        self.emit(Some(frame.sender), &reply_tag, &payload).await;
                    }
                }
            }
            DiscoveryMessage::HostnameResponse { hostname, ip } => {
                self.state.dns.insert(hostname.clone(), ip, now);

                if let Some(entries) = self.state.pending.hostname_query.remove(&hostname) {
                    for entry in entries {
                        entry.reply.signal(Ok(frame.sender));
                    }
                }
            }
        }
    }

    async fn on_dns(&mut self, frame: Frame) {
        let message: DnsMessage = match msg::decode(&frame.payload) {
            Ok(message) => message,
            Err(_) => {
                self.state.stats.errors += 1;
                return;
            }
        };

        let now = Instant::now();

        match message {
            DnsMessage::Query { hostname } => {
                self.state.stats.dns_queries += 1;

                // One authoritative reply: our own names win over the cache
                let answer = self
                    .state
                    .identity
                    .resolve_self(&hostname)
                    .map(|ip| (ip, self.state.dns.ttl().as_secs()))
                    .or_else(|| {
                        let ip = *self.state.dns.get(&hostname, now)?;
                        let ttl = self.state.dns.remaining_secs(&hostname, now)?;
                        Some((ip, ttl))
                    });

                if let Some((ip, ttl)) = answer {
                    let response = DnsMessage::Response { hostname, ip, ttl };

                    let tag = self.state.identity.tags.dns.clone();
                    if let Ok(payload) = msg::encode(&response) {
                        self.emit(Some(frame.sender), &tag, &payload).await;
                    }
                }
                // Negative answers are never sent and never cached
            }
            DnsMessage::Response { hostname, ip, ttl } => {
                self.state
                    .dns
                    .insert_with_ttl(hostname.clone(), ip, Duration::from_secs(ttl), now);

                if let Some(entries) = self.state.pending.dns.remove(&hostname) {
                    for entry in entries {
                        entry.reply.signal(Ok(ip));
                    }
                }
            }
        }
    }

    async fn on_arp(&mut self, frame: Frame) {
        let message: ArpMessage = match msg::decode(&frame.payload) {
            Ok(message) => message,
            Err(_) => {
                self.state.stats.errors += 1;
                return;
            }
        };

        match message {
            ArpMessage::Request { target_ip } => {
                self.state.stats.arp_requests += 1;

                if target_ip == self.state.identity.ipv4 {
                    let reply = ArpMessage::Reply {
                        ip: self.state.identity.ipv4,
                        mac: self.state.identity.mac,
                        hostname: self.state.identity.hostname.clone(),
                    };

                    let tag = self.state.identity.tags.arp.clone();
                    if let Ok(payload) = msg::encode(&reply) {
                        self.emit(Some(frame.sender), &tag, &payload).await;
                    }
                }
            }
            ArpMessage::Reply { ip, mac, hostname } => {
                self.state.arp.insert(
                    ip,
                    ArpInfo {
                        mac,
                        hostname,
                        node_id: frame.sender,
                    },
                    Instant::now(),
                );
            }
        }
    }

    async fn on_ping(&mut self, source: Ipv4Addr, frame: Frame) {
        let message: PingMessage = match msg::decode(&frame.payload) {
            Ok(message) => message,
            Err(_) => {
                self.state.stats.errors += 1;
                return;
            }
        };

        if let PingMessage::Ping { seq, timestamp, .. } = message {
            let pong = PingMessage::Pong {
                seq,
                timestamp,
                source: self.state.identity.ipv4,
            };

            let tag = Tag::Pong(source).to_string();
            if let Ok(payload) = msg::encode(&pong) {
                self.emit(Some(frame.sender), &tag, &payload).await;
            }
        }
    }

    fn on_pong(&mut self, source: Ipv4Addr, frame: Frame) {
        // Pong tags carry the original pinger's address; everyone else's
        // pongs are not ours
        if source != self.state.identity.ipv4 {
            return;
        }

        let Ok(PingMessage::Pong { seq, .. }) = msg::decode(&frame.payload) else {
            self.state.stats.errors += 1;
            return;
        };

        if let Some(pending) = self.state.pending.ping.remove(&seq) {
            pending.reply.signal(Ok(Instant::now() - pending.sent));
        }
    }

    async fn on_http(&mut self, frame: Frame) {
        let message: HttpMessage = match msg::decode(&frame.payload) {
            Ok(message) => message,
            Err(_) => {
                self.state.stats.errors += 1;
                return;
            }
        };

        match message {
            HttpMessage::Request {
                id,
                method,
                path,
                port,
                headers,
                body,
            } => {
                self.state.stats.http_requests += 1;

                let Some(handler) = self.state.registry.http(port) else {
                    self.send_http_response(frame.sender, id, HttpResponse::not_found())
                        .await;
                    return;
                };

                let request = HttpRequest {
                    method,
                    path,
                    headers,
                    body,
                    source: frame.sender,
                };

                // The handler call itself may panic; the returned future is
                // poll-guarded separately
                match std::panic::catch_unwind(AssertUnwindSafe(|| handler(request))) {
                    Ok(fut) => self.inflight.push(InflightHttp {
                        peer: frame.sender,
                        id,
                        fut,
                    }),
                    Err(_) => {
                        error!("netd: http handler on port {port} panicked");
                        self.state.stats.errors += 1;
                        self.send_http_response(frame.sender, id, HttpResponse::server_error())
                            .await;
                    }
                }
            }
            HttpMessage::Response {
                id,
                code,
                headers,
                body,
                ..
            } => {
                if let Some(entry) = self.state.pending.http.remove(&id) {
                    entry.reply.signal(Ok(HttpResponse {
                        code,
                        headers,
                        body,
                    }));
                } else {
                    // The waiter timed out and is gone
                    debug!("netd: dropping late http response {id}");
                }
            }
        }
    }

    pub(crate) async fn send_http_response(
        &mut self,
        peer: NodeId,
        id: u64,
        response: HttpResponse,
    ) {
        let message = HttpMessage::Response {
            id,
            code: response.code,
            headers: response.headers,
            body: response.body,
            ts: now_millis(),
        };

        let tag = self.state.identity.tags.http.clone();
        if let Ok(payload) = msg::encode(&message) {
            self.emit(Some(peer), &tag, &payload).await;
        }
    }

    async fn on_ws(&mut self, frame: Frame) {
        let message: WsMessage = match msg::decode(&frame.payload) {
            Ok(message) => message,
            Err(_) => {
                self.state.stats.errors += 1;
                return;
            }
        };

        let now = Instant::now();

        match message {
            WsMessage::Connect { connection_id, url } => {
                let port = ws_url_port(&url);

                let reply = if self.state.registry.ws(port).is_some() {
                    self.state.ws_conns.insert(
                        connection_id.clone(),
                        WsConn {
                            peer: frame.sender,
                            port,
                            established: now,
                            last_activity: now,
                        },
                    );
                    self.state.stats.ws_conns += 1;

                    WsMessage::Accept {
                        connection_id: connection_id.clone(),
                    }
                } else {
                    WsMessage::Reject {
                        connection_id: connection_id.clone(),
                        reason: format!("no ws handler on port {port}"),
                    }
                };

                let accepted = matches!(reply, WsMessage::Accept { .. });

                let tag = self.state.identity.tags.ws.clone();
                if let Ok(payload) = msg::encode(&reply) {
                    self.emit(Some(frame.sender), &tag, &payload).await;
                }

                if accepted {
                    self.notify_ws_handler(
                        port,
                        WsEvent::Open {
                            connection_id,
                            peer: frame.sender,
                        },
                    );
                }
            }
            WsMessage::Accept { connection_id } => {
                if let Some(pending) = self.state.pending.ws_connect.remove(&connection_id) {
                    self.state.ws_client_conns.insert(
                        connection_id.clone(),
                        WsClientConn {
                            peer: pending.peer,
                            queue: pending.queue.clone(),
                            last_activity: now,
                        },
                    );
                    self.state.stats.ws_conns += 1;

                    pending.reply.signal(Ok((connection_id, pending.queue)));
                }
            }
            WsMessage::Reject {
                connection_id,
                reason,
            } => {
                if let Some(pending) = self.state.pending.ws_connect.remove(&connection_id) {
                    pending.reply.signal(Err(NetError::Rejected(reason)));
                }
            }
            WsMessage::Data {
                connection_id,
                data,
            } => {
                if let Some(conn) = self.state.ws_conns.get_mut(&connection_id) {
                    conn.last_activity = now;
                    let port = conn.port;

                    self.notify_ws_handler(
                        port,
                        WsEvent::Message {
                            connection_id,
                            data,
                        },
                    );
                } else if let Some(conn) = self.state.ws_client_conns.get_mut(&connection_id) {
                    conn.last_activity = now;

                    if conn.queue.try_send(WsIncoming::Data(data)).is_err() {
                        self.state.stats.errors += 1;
                    }
                } else {
                    // No implicit accept: data for unknown connections is
                    // dropped and counted
                    debug!("netd: ws data for unknown connection {connection_id}");
                    self.state.stats.errors += 1;
                }
            }
            WsMessage::Close { connection_id } => {
                if let Some(conn) = self.state.ws_conns.remove(&connection_id) {
                    self.notify_ws_handler(conn.port, WsEvent::Closed { connection_id });
                } else if let Some(conn) = self.state.ws_client_conns.remove(&connection_id) {
                    let _ = conn.queue.try_send(WsIncoming::Closed);
                }
            }
        }
    }

    fn on_udp(&mut self, frame: Frame) {
        let packet: NetworkPacket = match serde_json::from_str(&frame.payload) {
            Ok(packet) => packet,
            Err(_) => {
                self.state.stats.errors += 1;
                return;
            }
        };

        // UDP rides broadcast; everything not addressed to us is simply
        // someone else's traffic
        if packet.dest_ip != self.state.identity.ipv4 {
            return;
        }

        self.state.stats.udp_packets += 1;
        self.state.udp.dispatch(&packet);
    }

    // ---- command starters -------------------------------------------------

    pub(crate) async fn resolve(
        &mut self,
        hostname: String,
        reply: Reply<M, Result<Ipv4Addr, NetError>>,
    ) {
        if let Some(ip) = self.state.identity.resolve_self(&hostname) {
            reply.signal(Ok(ip));
            return;
        }

        let now = Instant::now();

        if let Some(ip) = self.state.dns.get(&hostname, now) {
            reply.signal(Ok(*ip));
            return;
        }

        if self.link.is_none() {
            reply.signal(Err(NetError::NetworkUnavailable));
            return;
        }

        let deadline = now + self.state.resolve_timeout;
        self.state
            .pending
            .dns
            .entry(hostname.clone())
            .or_default()
            .push(PendingEntry { reply, deadline });

        let query = DnsMessage::Query { hostname };
        let tag = self.state.identity.tags.dns.clone();
        if let Ok(payload) = msg::encode(&query) {
            self.emit(None, &tag, &payload).await;
        }
    }

    pub(crate) async fn lookup_node(
        &mut self,
        host: String,
        reply: Reply<M, Result<NodeId, NetError>>,
    ) {
        let identity = &self.state.identity;

        if identity.is_self_name(&host) {
            reply.signal(Ok(identity.id));
            return;
        }

        let now = Instant::now();

        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            if ip == identity.ipv4 || ip.is_loopback() {
                reply.signal(Ok(identity.id));
                return;
            }

            if let Some(info) = self.state.arp.get(&ip, now) {
                reply.signal(Ok(info.node_id));
                return;
            }

            if self.link.is_none() {
                reply.signal(Err(NetError::NetworkUnavailable));
                return;
            }

            let deadline = now + self.state.resolve_timeout;
            self.state
                .pending
                .id_query
                .entry(ip)
                .or_default()
                .push(PendingEntry { reply, deadline });

            let query = DiscoveryMessage::IdQuery { ip };
            let tag = self.state.identity.tags.discovery.clone();
            if let Ok(payload) = msg::encode(&query) {
                self.emit(None, &tag, &payload).await;
            }

            return;
        }

        // Hostname: a warm DNS + ARP pair answers without a round-trip
        if let Some(ip) = self.state.dns.get(&host, now) {
            if let Some(info) = self.state.arp.get(ip, now) {
                reply.signal(Ok(info.node_id));
                return;
            }
        }

        if self.link.is_none() {
            reply.signal(Err(NetError::NetworkUnavailable));
            return;
        }

        let deadline = now + self.state.resolve_timeout;
        self.state
            .pending
            .hostname_query
            .entry(host.clone())
            .or_default()
            .push(PendingEntry { reply, deadline });

        let query = DiscoveryMessage::HostnameQuery { hostname: host };
        if let Ok(payload) = msg::encode(&query) {
            self.emit(None, "network_adapter_discovery", &payload).await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn start_http_request(
        &mut self,
        node: NodeId,
        port: u16,
        method: String,
        path: String,
        headers: std::collections::BTreeMap<String, String>,
        body: String,
        reply: Reply<M, Result<HttpResponse, NetError>>,
    ) {
        let now = Instant::now();
        let id = self.state.next_request_id;
        self.state.next_request_id += 1;

        if node == self.state.identity.id {
            // Loopback: the handler future completes through the same
            // in-flight path as remote requests
            let Some(handler) = self.state.registry.http(port) else {
                reply.signal(Ok(HttpResponse::not_found()));
                return;
            };

            let request = HttpRequest {
                method,
                path,
                headers,
                body,
                source: node,
            };

            self.state.pending.http.insert(
                id,
                PendingEntry {
                    reply,
                    deadline: now + self.state.http_timeout,
                },
            );

            match std::panic::catch_unwind(AssertUnwindSafe(|| handler(request))) {
                Ok(fut) => self.inflight.push(InflightHttp {
                    peer: node,
                    id,
                    fut,
                }),
                Err(_) => {
                    self.state.stats.errors += 1;
                    if let Some(entry) = self.state.pending.http.remove(&id) {
                        entry.reply.signal(Ok(HttpResponse::server_error()));
                    }
                }
            }

            return;
        }

        if self.link.is_none() {
            reply.signal(Err(NetError::NetworkUnavailable));
            return;
        }

        self.state.pending.http.insert(
            id,
            PendingEntry {
                reply,
                deadline: now + self.state.http_timeout,
            },
        );

        let request = HttpMessage::Request {
            id,
            method,
            path,
            port,
            headers,
            body,
        };

        let tag = self.state.identity.tags.http.clone();
        if let Ok(payload) = msg::encode(&request) {
            self.emit(Some(node), &tag, &payload).await;
        }
    }

    pub(crate) async fn start_ws_connect(
        &mut self,
        node: NodeId,
        url: String,
        reply: Reply<M, Result<(String, WsIncomingQueue<M>), NetError>>,
    ) {
        let now = Instant::now();
        let connection_id = format!("ws_{}_{}", now_millis(), rand::random::<u16>());
        let queue: WsIncomingQueue<M> = Arc::new(Channel::new());

        if node == self.state.identity.id {
            let port = ws_url_port(&url);

            if self.state.registry.ws(port).is_none() {
                reply.signal(Err(NetError::Rejected(format!(
                    "no ws handler on port {port}"
                ))));
                return;
            }

            self.state.ws_conns.insert(
                connection_id.clone(),
                WsConn {
                    peer: node,
                    port,
                    established: now,
                    last_activity: now,
                },
            );
            self.state.ws_client_conns.insert(
                connection_id.clone(),
                WsClientConn {
                    peer: node,
                    queue: queue.clone(),
                    last_activity: now,
                },
            );
            self.state.stats.ws_conns += 1;

            reply.signal(Ok((connection_id.clone(), queue)));

            self.notify_ws_handler(
                port,
                WsEvent::Open {
                    connection_id,
                    peer: node,
                },
            );

            return;
        }

        if self.link.is_none() {
            reply.signal(Err(NetError::NetworkUnavailable));
            return;
        }

        self.state.pending.ws_connect.insert(
            connection_id.clone(),
            PendingWsConnect {
                reply,
                queue,
                peer: node,
                deadline: now + self.state.ws_timeout,
            },
        );

        let connect = WsMessage::Connect {
            connection_id,
            url,
        };

        let tag = self.state.identity.tags.ws.clone();
        if let Ok(payload) = msg::encode(&connect) {
            self.emit(Some(node), &tag, &payload).await;
        }
    }

    pub(crate) async fn ws_send(&mut self, connection_id: &str, data: String, from_server: bool) {
        let now = Instant::now();
        let self_id = self.state.identity.id;

        let peer = if from_server {
            let Some(conn) = self.state.ws_conns.get_mut(connection_id) else {
                return;
            };
            conn.last_activity = now;
            conn.peer
        } else {
            let Some(conn) = self.state.ws_client_conns.get_mut(connection_id) else {
                return;
            };
            conn.last_activity = now;
            conn.peer
        };

        if peer == self_id {
            // Loopback delivery to the other half of the same connection
            if from_server {
                if let Some(conn) = self.state.ws_client_conns.get_mut(connection_id) {
                    conn.last_activity = now;
                    if conn.queue.try_send(WsIncoming::Data(data)).is_err() {
                        self.state.stats.errors += 1;
                    }
                }
            } else {
                let port = self
                    .state
                    .ws_conns
                    .get(connection_id)
                    .map(|conn| conn.port);

                if let Some(port) = port {
                    self.notify_ws_handler(
                        port,
                        WsEvent::Message {
                            connection_id: connection_id.to_string(),
                            data,
                        },
                    );
                }
            }

            return;
        }

        let message = WsMessage::Data {
            connection_id: connection_id.to_string(),
            data,
        };

        let tag = self.state.identity.tags.ws.clone();
        if let Ok(payload) = msg::encode(&message) {
            self.emit(Some(peer), &tag, &payload).await;
        }
    }

    pub(crate) async fn ws_close(&mut self, connection_id: &str) {
        let Some(conn) = self.state.ws_client_conns.remove(connection_id) else {
            return;
        };

        if conn.peer == self.state.identity.id {
            if let Some(server) = self.state.ws_conns.remove(connection_id) {
                self.notify_ws_handler(
                    server.port,
                    WsEvent::Closed {
                        connection_id: connection_id.to_string(),
                    },
                );
            }
            return;
        }

        let message = WsMessage::Close {
            connection_id: connection_id.to_string(),
        };

        let tag = self.state.identity.tags.ws.clone();
        if let Ok(payload) = msg::encode(&message) {
            self.emit(Some(conn.peer), &tag, &payload).await;
        }
    }

    pub(crate) async fn start_ping(
        &mut self,
        node: NodeId,
        seq: u32,
        reply: Reply<M, Result<embassy_time::Duration, NetError>>,
    ) {
        if self.link.is_none() {
            reply.signal(Err(NetError::NetworkUnavailable));
            return;
        }

        let now = Instant::now();

        self.state.pending.ping.insert(
            seq,
            PendingPing {
                reply,
                sent: now,
                deadline: now + self.state.resolve_timeout,
            },
        );

        let ping = PingMessage::Ping {
            seq,
            timestamp: now_millis(),
            source: self.state.identity.ipv4,
        };

        let tag = Tag::Ping(self.state.identity.ipv4).to_string();
        if let Ok(payload) = msg::encode(&ping) {
            self.emit(Some(node), &tag, &payload).await;
        }
    }

    pub(crate) async fn start_discover(&mut self, reply: Reply<M, Vec<Peer>>) {
        if self.link.is_none() {
            reply.signal(Vec::new());
            return;
        }

        self.state.pending.discover.push(DiscoverCollect {
            reply,
            found: Vec::new(),
            deadline: Instant::now() + self.state.resolve_timeout,
        });

        let tag = self.state.identity.tags.discovery.clone();
        if let Ok(payload) = msg::encode(&DiscoveryMessage::Query) {
            self.emit(None, &tag, &payload).await;
        }
    }

    /// Sends one datagram from a bound socket. Oversized payloads are
    /// dropped and counted, matching the receive side.
    pub(crate) async fn udp_send(
        &mut self,
        port: u16,
        dest_ip: Ipv4Addr,
        dest_port: u16,
        data: String,
    ) -> Result<(), NetError> {
        if !self.state.udp.is_bound(port) {
            return Err(NetError::Closed);
        }

        let loopback = dest_ip.is_loopback();
        let source_ip = if loopback {
            Ipv4Addr::LOCALHOST
        } else {
            self.state.identity.ipv4
        };

        let packet = match UdpPacket::new(port, dest_port, data) {
            Ok(packet) => packet,
            Err(_) => {
                self.state.udp.stats.packets_dropped += 1;
                return Ok(());
            }
        };

        let bytes = packet.data.len();
        let envelope = NetworkPacket::new(source_ip, dest_ip, packet);

        self.state.stats.udp_packets += 1;
        self.state.udp.record_sent(bytes);

        if loopback || dest_ip == self.state.identity.ipv4 {
            self.state.udp.dispatch(&envelope);
            return Ok(());
        }

        if self.link.is_none() {
            return Err(NetError::NetworkUnavailable);
        }

        let payload =
            serde_json::to_string(&envelope).map_err(|_| NetError::NetworkUnavailable)?;

        let tag = self.state.identity.tags.udp.clone();
        self.emit(None, &tag, &payload).await;

        Ok(())
    }
}

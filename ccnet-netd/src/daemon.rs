//! The daemon: one cooperative loop multiplexing the medium, the command
//! channel, a 1-second tick and the in-flight HTTP handler futures.
//!
//! All protocol state lives here and is only touched from the loop task.
//! Handlers run as continuations polled alongside the loop, so a slow HTTP
//! handler delays its own response and nothing else.

use core::future::poll_fn;
use core::net::Ipv4Addr;
use core::task::Poll;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use embassy_futures::select::{select4, Either4};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::{Duration, Instant, Timer};

use log::{debug, error, info, warn};

use ccnet_link::{Frame, LinkRecv, LinkSend, NodeId};
use ccnet_proto::msg::{self, DiscoveryMessage};
use ccnet_proto::{now_millis, NodeIdentity};

use crate::cache::{ArpCache, DnsCache};
use crate::config::Config;
use crate::handle::{
    Command, CommandQueue, NodeInfo, OpTimeouts, Peer, Reply, WsIncoming, WsIncomingQueue,
};
use crate::persist::{
    self, write_json_atomic, write_pid_file, Paths, SavedArp, SavedDns, SavedServer, SavedState,
};
use crate::registry::{BoxFuture, ServerRegistry, WsEvent, WsSender};
use crate::stats::{Statistics, StatsSnapshot};
use crate::udp::UdpSubsystem;
use crate::{DaemonError, HttpResponse, Netd, NetError};

const TICK: Duration = Duration::from_secs(1);
const CLEANUP_PERIOD: Duration = Duration::from_secs(60);
const STATS_PERIOD: Duration = Duration::from_secs(10);
const STATE_SAVE_PERIOD: Duration = Duration::from_secs(300);

/// A server-side WS connection: present iff the accept handshake completed.
pub(crate) struct WsConn {
    pub peer: NodeId,
    pub port: u16,
    #[allow(dead_code)]
    pub established: Instant,
    pub last_activity: Instant,
}

/// A client-side WS connection.
pub(crate) struct WsClientConn<M>
where
    M: RawMutex + Send + Sync,
{
    pub peer: NodeId,
    pub queue: WsIncomingQueue<M>,
    pub last_activity: Instant,
}

pub(crate) struct PendingEntry<M, T>
where
    M: RawMutex + Send + Sync,
{
    pub reply: Reply<M, T>,
    pub deadline: Instant,
}

pub(crate) struct PendingWsConnect<M>
where
    M: RawMutex + Send + Sync,
{
    pub reply: Reply<M, Result<(String, WsIncomingQueue<M>), NetError>>,
    pub queue: WsIncomingQueue<M>,
    pub peer: NodeId,
    pub deadline: Instant,
}

pub(crate) struct PendingPing<M>
where
    M: RawMutex + Send + Sync,
{
    pub reply: Reply<M, Result<Duration, NetError>>,
    pub sent: Instant,
    pub deadline: Instant,
}

pub(crate) struct DiscoverCollect<M>
where
    M: RawMutex + Send + Sync,
{
    pub reply: Reply<M, Vec<Peer>>,
    pub found: Vec<Peer>,
    pub deadline: Instant,
}

/// Correlation state for every operation waiting on the medium.
pub(crate) struct Pending<M>
where
    M: RawMutex + Send + Sync,
{
    pub http: HashMap<u64, PendingEntry<M, Result<HttpResponse, NetError>>>,
    pub dns: HashMap<String, Vec<PendingEntry<M, Result<Ipv4Addr, NetError>>>>,
    pub id_query: HashMap<Ipv4Addr, Vec<PendingEntry<M, Result<NodeId, NetError>>>>,
    pub hostname_query: HashMap<String, Vec<PendingEntry<M, Result<NodeId, NetError>>>>,
    pub ws_connect: HashMap<String, PendingWsConnect<M>>,
    pub ping: HashMap<u32, PendingPing<M>>,
    pub discover: Vec<DiscoverCollect<M>>,
}

impl<M> Pending<M>
where
    M: RawMutex + Send + Sync,
{
    fn new() -> Self {
        Self {
            http: HashMap::new(),
            dns: HashMap::new(),
            id_query: HashMap::new(),
            hostname_query: HashMap::new(),
            ws_connect: HashMap::new(),
            ping: HashMap::new(),
            discover: Vec::new(),
        }
    }

    /// Drops waiters whose deadline passed; discovery collections complete
    /// with whatever they gathered.
    fn sweep(&mut self, now: Instant) {
        self.http.retain(|_, entry| entry.deadline > now);
        self.dns.retain(|_, entries| {
            entries.retain(|entry| entry.deadline > now);
            !entries.is_empty()
        });
        self.id_query.retain(|_, entries| {
            entries.retain(|entry| entry.deadline > now);
            !entries.is_empty()
        });
        self.hostname_query.retain(|_, entries| {
            entries.retain(|entry| entry.deadline > now);
            !entries.is_empty()
        });
        self.ws_connect.retain(|_, entry| entry.deadline > now);
        self.ping.retain(|_, entry| entry.deadline > now);

        let mut waiting = Vec::new();
        for collect in self.discover.drain(..) {
            if collect.deadline <= now {
                collect.reply.signal(collect.found);
            } else {
                waiting.push(collect);
            }
        }
        self.discover = waiting;
    }

    fn fail_all(&mut self) {
        for (_, entry) in self.http.drain() {
            entry.reply.signal(Err(NetError::Unavailable));
        }
        for (_, entries) in self.dns.drain() {
            for entry in entries {
                entry.reply.signal(Err(NetError::Unavailable));
            }
        }
        for (_, entries) in self.id_query.drain() {
            for entry in entries {
                entry.reply.signal(Err(NetError::Unavailable));
            }
        }
        for (_, entries) in self.hostname_query.drain() {
            for entry in entries {
                entry.reply.signal(Err(NetError::Unavailable));
            }
        }
        for (_, entry) in self.ws_connect.drain() {
            entry.reply.signal(Err(NetError::Unavailable));
        }
        for (_, entry) in self.ping.drain() {
            entry.reply.signal(Err(NetError::Unavailable));
        }
        for collect in self.discover.drain(..) {
            collect.reply.signal(collect.found);
        }
    }
}

/// All mutable protocol state, separate from the link so the loop can
/// borrow both sides at once.
pub(crate) struct State<M>
where
    M: RawMutex + Send + Sync,
{
    pub identity: NodeIdentity,
    pub arp: ArpCache,
    pub dns: DnsCache,
    pub registry: ServerRegistry,
    pub ws_conns: HashMap<String, WsConn>,
    pub ws_client_conns: HashMap<String, WsClientConn<M>>,
    pub udp: UdpSubsystem<M>,
    pub stats: Statistics,
    pub pending: Pending<M>,
    pub next_request_id: u64,
    pub started: Instant,
    pub started_at_ms: u64,
    pub udp_enabled: bool,
    pub connection_timeout: Duration,
    pub http_timeout: Duration,
    pub ws_timeout: Duration,
    pub resolve_timeout: Duration,
}

pub(crate) struct InflightHttp {
    pub peer: NodeId,
    pub id: u64,
    pub fut: BoxFuture<HttpResponse>,
}

enum Event {
    Frame(Frame),
    Command,
    Tick,
    /// An HTTP handler future finished (or panicked).
    HttpDone {
        peer: NodeId,
        id: u64,
        response: HttpResponse,
        panicked: bool,
    },
    LinkFault,
}

enum Flow {
    Continue,
    Stop,
}

pub struct Daemon<M, L>
where
    M: RawMutex + Send + Sync + 'static,
{
    pub(crate) config: Config,
    pub(crate) paths: Paths,
    pub(crate) link: Option<L>,
    pub(crate) commands: Arc<CommandQueue<M>>,
    pub(crate) state: State<M>,
    pub(crate) inflight: Vec<InflightHttp>,
    next_broadcast: Instant,
    next_cleanup: Instant,
    next_stats_write: Instant,
    next_state_save: Instant,
}

impl<M, L> Daemon<M, L>
where
    M: RawMutex + Send + Sync,
    L: LinkSend + LinkRecv,
{
    /// Builds the daemon and its handle. `link` is `None` in limited mode
    /// (no medium attached).
    pub fn new(config: Config, link: Option<L>) -> (Self, Netd<M>) {
        let identity = config.identity();
        let paths = Paths::new(config.root.clone());
        let commands: Arc<CommandQueue<M>> = Arc::new(CommandQueue::new());

        let timeouts = OpTimeouts {
            http: Duration::from_secs(config.http_timeout),
            ws: Duration::from_secs(config.ws_timeout),
            resolve: Duration::from_secs(config.resolve_timeout),
        };

        let handle = Netd::new(commands.clone(), timeouts);

        let now = Instant::now();

        let state = State {
            identity,
            arp: ArpCache::new(Duration::from_secs(config.arp_ttl)),
            dns: DnsCache::new(Duration::from_secs(config.dns_ttl)),
            registry: ServerRegistry::new(),
            ws_conns: HashMap::new(),
            ws_client_conns: HashMap::new(),
            udp: UdpSubsystem::new(config.udp_buffer_size, config.udp_verify_checksum),
            stats: Statistics::default(),
            pending: Pending::new(),
            next_request_id: 1,
            started: now,
            started_at_ms: now_millis(),
            udp_enabled: config.udp_enabled,
            connection_timeout: Duration::from_secs(config.connection_timeout),
            http_timeout: timeouts.http,
            ws_timeout: timeouts.ws,
            resolve_timeout: timeouts.resolve,
        };

        let daemon = Self {
            config,
            paths,
            link,
            commands,
            state,
            inflight: Vec::new(),
            next_broadcast: now,
            next_cleanup: now + CLEANUP_PERIOD,
            next_stats_write: now + STATS_PERIOD,
            next_state_save: now + STATE_SAVE_PERIOD,
        };

        (daemon, handle)
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.state.identity
    }

    /// Runs the daemon until a stop signal appears.
    pub async fn run(&mut self) -> Result<(), DaemonError> {
        self.startup()?;

        if self.config.discovery_enabled {
            self.announce().await;
            self.next_broadcast =
                Instant::now() + Duration::from_secs(self.config.discovery_interval);
        }

        info!(
            "netd: running as node {} ({} / {})",
            self.state.identity.id, self.state.identity.hostname, self.state.identity.ipv4
        );

        let mut next_tick = Instant::now() + TICK;

        loop {
            let event = self.next_event(next_tick).await;

            match event {
                Event::Frame(frame) => self.on_frame(frame).await,
                Event::Command => {}
                Event::HttpDone {
                    peer,
                    id,
                    response,
                    panicked,
                } => {
                    if panicked {
                        self.state.stats.errors += 1;
                    }
                    self.finish_http(peer, id, response).await;
                }
                Event::Tick => {
                    next_tick += TICK;

                    if let Flow::Stop = self.on_tick().await {
                        break;
                    }
                }
                Event::LinkFault => {}
            }
        }

        self.shutdown();

        Ok(())
    }

    fn startup(&mut self) -> Result<(), DaemonError> {
        self.paths.ensure_runtime_dirs()?;

        if persist::check_stop_signals(&self.paths) {
            return Err(DaemonError::StopSignal);
        }

        if self.paths.pid_file().exists() {
            return Err(DaemonError::AlreadyRunning);
        }

        write_pid_file(&self.paths.pid_file(), self.state.identity.id)?;

        self.load_state();
        self.write_info_file();

        Ok(())
    }

    fn shutdown(&mut self) {
        info!("netd: stopping");

        self.save_state();
        self.write_stats_file();

        self.state.pending.fail_all();
        self.state.registry.clear();
        self.inflight.clear();

        if let Err(err) = std::fs::remove_file(self.paths.pid_file()) {
            warn!("netd: could not remove PID file: {err}");
        }

        // Dropping the link closes the medium
        self.link = None;
    }

    /// One multiplexed wait: medium, commands, tick, handler futures.
    async fn next_event(&mut self, next_tick: Instant) -> Event {
        // The select borrows link, commands and inflight; bind its result
        // before touching the rest of the daemon
        let selected = {
            let Self {
                link,
                commands,
                inflight,
                ..
            } = self;

            let frame = async {
                match link {
                    Some(link) => link.receive().await,
                    None => core::future::pending().await,
                }
            };

            select4(
                frame,
                commands.receive(),
                Timer::at(next_tick),
                poll_inflight(inflight),
            )
            .await
        };

        match selected {
            Either4::First(Ok(frame)) => Event::Frame(frame),
            Either4::First(Err(err)) => {
                warn!("netd: link receive failed: {err}");
                self.state.stats.errors += 1;
                Event::LinkFault
            }
            Either4::Second(command) => {
                self.on_command(command).await;
                Event::Command
            }
            Either4::Third(_) => Event::Tick,
            Either4::Fourth((peer, id, response, panicked)) => Event::HttpDone {
                peer,
                id,
                response,
                panicked,
            },
        }
    }

    async fn on_tick(&mut self) -> Flow {
        let now = Instant::now();

        if persist::check_stop_signals(&self.paths) {
            return Flow::Stop;
        }

        // Expired waiters are cheap to drop, so they go every tick; the
        // heavier cache sweeps keep their own period
        self.state.pending.sweep(now);

        if self.config.discovery_enabled && now >= self.next_broadcast {
            self.announce().await;
            self.next_broadcast = now + Duration::from_secs(self.config.discovery_interval);
        }

        if now >= self.next_cleanup {
            self.cleanup(now);
            self.next_cleanup = now + CLEANUP_PERIOD;
        }

        if now >= self.next_stats_write {
            self.write_stats_file();
            self.next_stats_write = now + STATS_PERIOD;
        }

        if now >= self.next_state_save {
            self.save_state();
            self.next_state_save = now + STATE_SAVE_PERIOD;
        }

        Flow::Continue
    }

    /// The periodic expiry sweep over everything that carries a TTL.
    fn cleanup(&mut self, now: Instant) {
        let dropped_arp = self.state.arp.sweep(now);
        let dropped_dns = self.state.dns.sweep(now);

        let timeout = self.state.connection_timeout;

        let dead: Vec<String> = self
            .state
            .ws_conns
            .iter()
            .filter(|(_, conn)| now - conn.last_activity > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in dead {
            debug!("netd: ws connection {id} idled out");
            if let Some(conn) = self.state.ws_conns.remove(&id) {
                self.notify_ws_handler(conn.port, WsEvent::Closed { connection_id: id });
            }
        }

        let dead: Vec<String> = self
            .state
            .ws_client_conns
            .iter()
            .filter(|(_, conn)| now - conn.last_activity > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in dead {
            if let Some(conn) = self.state.ws_client_conns.remove(&id) {
                let _ = conn.queue.try_send(WsIncoming::Closed);
            }
        }

        if dropped_arp + dropped_dns > 0 {
            debug!("netd: cleanup dropped {dropped_arp} ARP / {dropped_dns} DNS entries");
        }
    }

    async fn on_command(&mut self, command: Command<M>) {
        match command {
            Command::Info { reply } => reply.signal(self.node_info()),
            Command::Stats { reply } => reply.signal(self.stats_snapshot()),
            Command::UdpStats { reply } => reply.signal(self.state.udp.stats),
            Command::ResetStats => self.state.stats.reset(),
            Command::RegisterHttp {
                port,
                handler,
                reply,
            } => reply.signal(self.state.registry.register_http(port, handler)),
            Command::RegisterWs {
                port,
                handler,
                reply,
            } => reply.signal(self.state.registry.register_ws(port, handler)),
            Command::Unregister { port, reply } => {
                reply.signal(self.state.registry.unregister(port))
            }
            Command::BroadcastPresence => self.announce().await,
            Command::Resolve { hostname, reply } => self.resolve(hostname, reply).await,
            Command::LookupNode { host, reply } => self.lookup_node(host, reply).await,
            Command::HttpRequest {
                node,
                port,
                method,
                path,
                headers,
                body,
                reply,
            } => {
                self.start_http_request(node, port, method, path, headers, body, reply)
                    .await
            }
            Command::WsConnect { node, url, reply } => self.start_ws_connect(node, url, reply).await,
            Command::WsSend {
                connection_id,
                data,
                from_server,
            } => self.ws_send(&connection_id, data, from_server).await,
            Command::WsClose { connection_id } => self.ws_close(&connection_id).await,
            Command::Ping { node, seq, reply } => self.start_ping(node, seq, reply).await,
            Command::Discover { reply } => self.start_discover(reply).await,
            Command::UdpOpen {
                port,
                buffer_size,
                reply,
            } => reply.signal(self.state.udp.open(port, buffer_size)),
            Command::UdpRebind { from, to, reply } => {
                reply.signal(self.state.udp.rebind(from, to))
            }
            Command::UdpSend {
                port,
                dest_ip,
                dest_port,
                data,
                reply,
            } => reply.signal(self.udp_send(port, dest_ip, dest_port, data).await),
            Command::UdpTryRecv { port, reply } => {
                reply.signal(self.state.udp.try_recv(port))
            }
            Command::UdpClose { port } => {
                self.state.udp.close(port);
            }
        }
    }

    fn node_info(&self) -> NodeInfo {
        NodeInfo {
            identity: self.state.identity.clone(),
            modem_available: self.link.is_some(),
            udp_enabled: self.state.udp_enabled,
        }
    }

    fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            counters: self.state.stats,
            uptime_ms: (Instant::now() - self.state.started).as_millis(),
        }
    }

    /// Periodic presence broadcast on the discovery tag.
    pub(crate) async fn announce(&mut self) {
        let announce = DiscoveryMessage::Announce {
            id: self.state.identity.id,
            hostname: self.state.identity.hostname.clone(),
            ip: self.state.identity.ipv4,
            mac: self.state.identity.mac,
            services: self.state.registry.services(),
            ts: now_millis(),
        };

        let tag = self.state.identity.tags.discovery.clone();
        if let Ok(payload) = msg::encode(&announce) {
            self.emit(None, &tag, &payload).await;
        }
    }

    /// Transmits on the medium, keeping the counters honest. Send failures
    /// are counted and logged, never fatal.
    pub(crate) async fn emit(&mut self, dest: Option<NodeId>, tag: &str, payload: &str) {
        let Self { link, state, .. } = self;

        let Some(link) = link else {
            state.stats.errors += 1;
            return;
        };

        let result = match dest {
            Some(node) => link.unicast(node, tag, payload).await,
            None => link.broadcast(tag, payload).await,
        };

        match result {
            Ok(()) => state.stats.sent(payload.len()),
            Err(err) => {
                warn!("netd: send on tag {tag} failed: {err}");
                state.stats.errors += 1;
            }
        }
    }

    /// Completes a finished handler future: reply to the peer, or to the
    /// local waiter for loopback requests.
    async fn finish_http(&mut self, peer: NodeId, id: u64, response: HttpResponse) {
        if peer == self.state.identity.id {
            if let Some(entry) = self.state.pending.http.remove(&id) {
                entry.reply.signal(Ok(response));
            }
            return;
        }

        self.send_http_response(peer, id, response).await;
    }

    fn load_state(&mut self) {
        let Some(saved) = persist::read_json::<SavedState>(&self.paths.state_file()) else {
            return;
        };

        let now = Instant::now();

        for entry in saved.arp {
            self.state.arp.insert_with_ttl(
                entry.ip,
                crate::cache::ArpInfo {
                    mac: entry.mac,
                    hostname: entry.hostname,
                    node_id: entry.node_id,
                },
                Duration::from_secs(entry.expires_in_secs),
                now,
            );
        }

        for entry in saved.dns {
            self.state.dns.insert_with_ttl(
                entry.hostname,
                entry.ip,
                Duration::from_secs(entry.expires_in_secs),
                now,
            );
        }

        // Servers are code; the snapshot only documents what was bound
        self.state.stats = saved.stats;

        info!(
            "netd: restored {} ARP / {} DNS entries",
            self.state.arp.len(),
            self.state.dns.len()
        );
    }

    fn save_state(&mut self) {
        let now = Instant::now();

        let state = SavedState {
            arp: self
                .state
                .arp
                .snapshot(now)
                .map(|(ip, info, left)| SavedArp {
                    ip: *ip,
                    mac: info.mac,
                    hostname: info.hostname.clone(),
                    node_id: info.node_id,
                    expires_in_secs: left,
                })
                .collect(),
            dns: self
                .state
                .dns
                .snapshot(now)
                .map(|(hostname, ip, left)| SavedDns {
                    hostname: hostname.clone(),
                    ip: *ip,
                    expires_in_secs: left,
                })
                .collect(),
            servers: self
                .state
                .registry
                .services()
                .iter()
                .map(|service| SavedServer {
                    port: service.port,
                    http: service.name == "http",
                    ws: service.name == "ws",
                })
                .collect(),
            stats: self.state.stats,
            started_at_ms: self.state.started_at_ms,
        };

        if let Err(err) = write_json_atomic(&self.paths.state_file(), &state) {
            warn!("netd: state save failed: {err}");
        }
    }

    fn write_stats_file(&mut self) {
        let snapshot = self.stats_snapshot();

        if let Err(err) = write_json_atomic(&self.paths.stats_file(), &snapshot) {
            warn!("netd: stats write failed: {err}");
        }
    }

    fn write_info_file(&self) {
        if let Err(err) = write_json_atomic(&self.paths.info_file(), &self.node_info()) {
            warn!("netd: info write failed: {err}");
        }
    }

    /// Invokes a WS handler, isolating panics.
    pub(crate) fn notify_ws_handler(&mut self, port: u16, event: WsEvent) {
        let Some(handler) = self.state.registry.ws(port) else {
            return;
        };

        let sender = self.ws_sender_for(&event);

        if std::panic::catch_unwind(AssertUnwindSafe(|| handler(event, &sender))).is_err() {
            error!("netd: ws handler on port {port} panicked");
            self.state.stats.errors += 1;
        }
    }

    fn ws_sender_for(&self, event: &WsEvent) -> WsSender {
        let connection_id = match event {
            WsEvent::Open { connection_id, .. }
            | WsEvent::Message { connection_id, .. }
            | WsEvent::Closed { connection_id } => connection_id.clone(),
        };

        let commands = self.commands.clone();

        WsSender::new(
            connection_id,
            Arc::new(move |conn: &str, data: String| {
                if commands
                    .try_send(Command::WsSend {
                        connection_id: conn.to_string(),
                        data,
                        from_server: true,
                    })
                    .is_err()
                {
                    warn!("netd: ws send queue full, dropping frame on {conn}");
                }
            }),
        )
    }
}

/// Polls every in-flight handler future once per wake, isolating panics.
/// Pending forever while the set is empty.
fn poll_inflight(
    inflight: &mut Vec<InflightHttp>,
) -> impl core::future::Future<Output = (NodeId, u64, HttpResponse, bool)> + '_ {
    poll_fn(move |cx| {
        let mut index = 0;

        while index < inflight.len() {
            let polled = std::panic::catch_unwind(AssertUnwindSafe(|| {
                inflight[index].fut.as_mut().poll(cx)
            }));

            match polled {
                Ok(Poll::Ready(response)) => {
                    let entry = inflight.swap_remove(index);
                    return Poll::Ready((entry.peer, entry.id, response, false));
                }
                Ok(Poll::Pending) => index += 1,
                Err(_) => {
                    let entry = inflight.swap_remove(index);
                    error!("netd: http handler for request {} panicked", entry.id);
                    return Poll::Ready((
                        entry.peer,
                        entry.id,
                        HttpResponse::server_error(),
                        true,
                    ));
                }
            }
        }

        Poll::Pending
    })
}

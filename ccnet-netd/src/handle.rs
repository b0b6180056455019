//! [`Netd`]: the node-local face of the daemon.
//!
//! Operations are shipped to the event loop over a bounded command channel
//! and answered through one-shot signals, so every piece of protocol state
//! stays owned by the loop task. Callers enforce their own deadlines; a
//! reply that arrives after its waiter gave up is dropped by the loop's
//! pending-sweep.

use core::net::Ipv4Addr;

use std::collections::BTreeMap;
use std::sync::Arc;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};

use serde::Serialize;

use ccnet_link::NodeId;
use ccnet_proto::NodeIdentity;

use crate::registry::{HttpHandler, WsHandler};
use crate::stats::StatsSnapshot;
use crate::udp::Datagram;
use crate::{HttpResponse, NetError};

/// Commands queued to the loop before senders start to block.
pub(crate) const COMMAND_DEPTH: usize = 32;

pub(crate) type CommandQueue<M> = Channel<M, Command<M>, COMMAND_DEPTH>;
pub(crate) type Reply<M, T> = Arc<Signal<M, T>>;

/// Incoming traffic on a client-side WS connection.
#[derive(Clone, Debug)]
pub(crate) enum WsIncoming {
    Data(String),
    Closed,
}

pub(crate) type WsIncomingQueue<M> = Arc<Channel<M, WsIncoming, 16>>;

/// Resolution that ran out of time means nobody answered for the name.
fn unreachable_on_timeout(err: NetError) -> NetError {
    match err {
        NetError::Timeout => NetError::HostUnreachable,
        other => other,
    }
}

/// A peer that answered a discovery query.
#[derive(Clone, Debug, Serialize)]
pub struct Peer {
    /// The node-id the response arrived from.
    pub node: NodeId,
    pub hostname: String,
    pub fqdn: String,
    pub mac: ccnet_proto::MacAddr,
    pub ip: Ipv4Addr,
    pub services: Vec<ccnet_proto::msg::Service>,
    pub udp: bool,
}

/// What `info()` returns; also the payload of `/var/run/network.info`.
#[derive(Clone, Debug, Serialize)]
pub struct NodeInfo {
    #[serde(flatten)]
    pub identity: NodeIdentity,
    pub modem_available: bool,
    pub udp_enabled: bool,
}

pub(crate) enum Command<M>
where
    M: RawMutex + Send + Sync,
{
    Info {
        reply: Reply<M, NodeInfo>,
    },
    Stats {
        reply: Reply<M, StatsSnapshot>,
    },
    UdpStats {
        reply: Reply<M, crate::udp::UdpStats>,
    },
    ResetStats,
    RegisterHttp {
        port: u16,
        handler: HttpHandler,
        reply: Reply<M, Result<(), NetError>>,
    },
    RegisterWs {
        port: u16,
        handler: WsHandler,
        reply: Reply<M, Result<(), NetError>>,
    },
    Unregister {
        port: u16,
        reply: Reply<M, bool>,
    },
    BroadcastPresence,
    Resolve {
        hostname: String,
        reply: Reply<M, Result<Ipv4Addr, NetError>>,
    },
    LookupNode {
        host: String,
        reply: Reply<M, Result<NodeId, NetError>>,
    },
    HttpRequest {
        node: NodeId,
        port: u16,
        method: String,
        path: String,
        headers: BTreeMap<String, String>,
        body: String,
        reply: Reply<M, Result<HttpResponse, NetError>>,
    },
    WsConnect {
        node: NodeId,
        url: String,
        reply: Reply<M, Result<(String, WsIncomingQueue<M>), NetError>>,
    },
    WsSend {
        connection_id: String,
        data: String,
        /// Which side of the connection is sending; disambiguates loopback
        /// connections, which appear in both connection tables.
        from_server: bool,
    },
    WsClose {
        connection_id: String,
    },
    Ping {
        node: NodeId,
        seq: u32,
        reply: Reply<M, Result<Duration, NetError>>,
    },
    Discover {
        reply: Reply<M, Vec<Peer>>,
    },
    UdpOpen {
        port: u16,
        buffer_size: Option<usize>,
        #[allow(clippy::type_complexity)]
        reply: Reply<M, Result<(u16, Arc<Signal<M, ()>>), NetError>>,
    },
    UdpRebind {
        from: u16,
        to: u16,
        reply: Reply<M, Result<(), NetError>>,
    },
    UdpSend {
        port: u16,
        dest_ip: Ipv4Addr,
        dest_port: u16,
        data: String,
        reply: Reply<M, Result<(), NetError>>,
    },
    UdpTryRecv {
        port: u16,
        reply: Reply<M, Result<Option<Datagram>, NetError>>,
    },
    UdpClose {
        port: u16,
    },
}

/// Deadlines for the operations that wait on the network, copied from the
/// node config when the daemon is built.
#[derive(Clone, Copy, Debug)]
pub(crate) struct OpTimeouts {
    pub http: Duration,
    pub ws: Duration,
    pub resolve: Duration,
}

/// The clonable daemon handle.
pub struct Netd<M>
where
    M: RawMutex + Send + Sync + 'static,
{
    commands: Arc<CommandQueue<M>>,
    timeouts: OpTimeouts,
}

impl<M> Clone for Netd<M>
where
    M: RawMutex + Send + Sync,
{
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            timeouts: self.timeouts,
        }
    }
}

impl<M> Netd<M>
where
    M: RawMutex + Send + Sync,
{
    pub(crate) fn new(commands: Arc<CommandQueue<M>>, timeouts: OpTimeouts) -> Self {
        Self { commands, timeouts }
    }

    /// Ships a command and waits for the loop's answer. Used for operations
    /// the loop answers immediately from its own state.
    async fn call<T>(&self, build: impl FnOnce(Reply<M, T>) -> Command<M>) -> T {
        let reply: Reply<M, T> = Arc::new(Signal::new());

        self.commands.send(build(reply.clone())).await;

        reply.wait().await
    }

    /// Ships a command whose answer depends on the network, bounded by
    /// `timeout`.
    async fn call_deadline<T>(
        &self,
        timeout: Duration,
        build: impl FnOnce(Reply<M, Result<T, NetError>>) -> Command<M>,
    ) -> Result<T, NetError> {
        let reply: Reply<M, Result<T, NetError>> = Arc::new(Signal::new());

        self.commands.send(build(reply.clone())).await;

        match select(reply.wait(), Timer::after(timeout)).await {
            Either::First(result) => result,
            Either::Second(_) => Err(NetError::Timeout),
        }
    }

    pub async fn info(&self) -> NodeInfo {
        self.call(|reply| Command::Info { reply }).await
    }

    pub async fn stats(&self) -> StatsSnapshot {
        self.call(|reply| Command::Stats { reply }).await
    }

    /// UDP subsystem counters (drops, buffer pressure, active sockets).
    pub async fn udp_stats(&self) -> crate::udp::UdpStats {
        self.call(|reply| Command::UdpStats { reply }).await
    }

    pub async fn reset_stats(&self) {
        self.commands.send(Command::ResetStats).await;
    }

    pub async fn register_http_server(
        &self,
        port: u16,
        handler: HttpHandler,
    ) -> Result<(), NetError> {
        self.call(|reply| Command::RegisterHttp {
            port,
            handler,
            reply,
        })
        .await
    }

    pub async fn register_ws_server(
        &self,
        port: u16,
        handler: WsHandler,
    ) -> Result<(), NetError> {
        self.call(|reply| Command::RegisterWs {
            port,
            handler,
            reply,
        })
        .await
    }

    /// Unbinds both roles on `port`; returns whether anything was bound.
    pub async fn unregister_server(&self, port: u16) -> bool {
        self.call(|reply| Command::Unregister { port, reply }).await
    }

    /// Triggers an immediate presence announce, besides the periodic one.
    pub async fn broadcast_presence(&self) {
        self.commands.send(Command::BroadcastPresence).await;
    }

    /// Resolves a hostname to an address: self-names answer instantly and
    /// authoritatively, everything else goes through cache then the medium.
    pub async fn resolve(&self, hostname: impl Into<String>) -> Result<Ipv4Addr, NetError> {
        let hostname = hostname.into();

        self.call_deadline(self.timeouts.resolve, |reply| Command::Resolve {
            hostname,
            reply,
        })
        .await
        .map_err(unreachable_on_timeout)
    }

    /// Resolves a hostname or dotted-quad to the node-id serving it.
    pub async fn lookup_node(&self, host: impl Into<String>) -> Result<NodeId, NetError> {
        let host = host.into();

        self.call_deadline(self.timeouts.resolve, |reply| Command::LookupNode {
            host,
            reply,
        })
        .await
        .map_err(unreachable_on_timeout)
    }

    /// Issues a local HTTP request to `node` and waits for the correlated
    /// response.
    pub async fn http_request(
        &self,
        node: NodeId,
        port: u16,
        method: impl Into<String>,
        path: impl Into<String>,
        headers: BTreeMap<String, String>,
        body: impl Into<String>,
    ) -> Result<HttpResponse, NetError> {
        let (method, path, body) = (method.into(), path.into(), body.into());

        self.call_deadline(self.timeouts.http, |reply| Command::HttpRequest {
            node,
            port,
            method,
            path,
            headers,
            body,
            reply,
        })
        .await
    }

    /// Opens a WS connection to `node`; `url` is what the peer's handler
    /// sees and its port selects the handler.
    pub async fn ws_connect(
        &self,
        node: NodeId,
        url: impl Into<String>,
    ) -> Result<WsClientConn<M>, NetError> {
        let url = url.into();

        let (connection_id, incoming) = self
            .call_deadline(self.timeouts.ws, |reply| Command::WsConnect {
                node,
                url,
                reply,
            })
            .await?;

        Ok(WsClientConn {
            handle: self.clone(),
            connection_id,
            incoming,
            closed: false,
        })
    }

    /// Pings `node`, returning the round-trip time.
    pub async fn ping(&self, node: NodeId, seq: u32) -> Result<Duration, NetError> {
        self.call_deadline(self.timeouts.resolve, |reply| Command::Ping {
            node,
            seq,
            reply,
        })
        .await
    }

    /// Broadcasts a discovery query and collects the peers that answer
    /// within the resolution window.
    pub async fn discover(&self) -> Vec<Peer> {
        self.call(|reply| Command::Discover { reply }).await
    }

    /// Opens a UDP socket; port 0 auto-assigns from the ephemeral range.
    pub async fn udp_socket(&self, port: u16) -> Result<UdpSocket<M>, NetError> {
        self.udp_socket_with(port, None).await
    }

    /// As [`Self::udp_socket`], with an explicit receive-buffer capacity.
    pub async fn udp_socket_with(
        &self,
        port: u16,
        buffer_size: Option<usize>,
    ) -> Result<UdpSocket<M>, NetError> {
        let (port, notify) = self
            .call(|reply| Command::UdpOpen {
                port,
                buffer_size,
                reply,
            })
            .await?;

        Ok(UdpSocket {
            handle: self.clone(),
            port,
            notify,
            closed: false,
        })
    }
}

/// A bound UDP socket. Closes (releasing the port and flushing the buffer)
/// when dropped.
pub struct UdpSocket<M>
where
    M: RawMutex + Send + Sync + 'static,
{
    handle: Netd<M>,
    port: u16,
    notify: Arc<Signal<M, ()>>,
    closed: bool,
}

impl<M> UdpSocket<M>
where
    M: RawMutex + Send + Sync,
{
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Sends a datagram. Self-addressed traffic loops back through the
    /// daemon without touching the medium.
    pub async fn send(
        &self,
        data: impl Into<String>,
        dest_ip: Ipv4Addr,
        dest_port: u16,
    ) -> Result<(), NetError> {
        let data = data.into();
        let port = self.port;

        self.handle
            .call(|reply| Command::UdpSend {
                port,
                dest_ip,
                dest_port,
                data,
                reply,
            })
            .await
    }

    /// Waits for the next datagram, at most `timeout`.
    pub async fn receive(&self, timeout: Duration) -> Result<Datagram, NetError> {
        let deadline = Instant::now() + timeout;

        loop {
            let port = self.port;
            if let Some(datagram) = self
                .handle
                .call(|reply| Command::UdpTryRecv { port, reply })
                .await?
            {
                return Ok(datagram);
            }

            if let Either::Second(_) = select(self.notify.wait(), Timer::at(deadline)).await {
                return Err(NetError::Timeout);
            }
        }
    }

    /// Moves the socket to `port`; fails with `AddrInUse` if taken.
    pub async fn bind(&mut self, port: u16) -> Result<(), NetError> {
        let from = self.port;

        self.handle
            .call(|reply| Command::UdpRebind {
                from,
                to: port,
                reply,
            })
            .await?;

        self.port = port;

        Ok(())
    }

    /// Releases the port explicitly.
    pub async fn close(mut self) {
        self.closed = true;

        self.handle.commands.send(Command::UdpClose { port: self.port }).await;
    }
}

impl<M> Drop for UdpSocket<M>
where
    M: RawMutex + Send + Sync,
{
    fn drop(&mut self) {
        if !self.closed {
            // Best effort: a full command queue leaks the port until the
            // daemon notices the dead waiter
            let _ = self
                .handle
                .commands
                .try_send(Command::UdpClose { port: self.port });
        }
    }
}

/// A client-side WS connection.
pub struct WsClientConn<M>
where
    M: RawMutex + Send + Sync + 'static,
{
    handle: Netd<M>,
    connection_id: String,
    incoming: WsIncomingQueue<M>,
    closed: bool,
}

impl<M> WsClientConn<M>
where
    M: RawMutex + Send + Sync,
{
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub async fn send(&self, data: impl Into<String>) {
        self.handle
            .commands
            .send(Command::WsSend {
                connection_id: self.connection_id.clone(),
                data: data.into(),
                from_server: false,
            })
            .await;
    }

    /// Waits for the next data frame from the peer.
    pub async fn receive(&self, timeout: Duration) -> Result<String, NetError> {
        match select(self.incoming.receive(), Timer::after(timeout)).await {
            Either::First(WsIncoming::Data(data)) => Ok(data),
            Either::First(WsIncoming::Closed) => Err(NetError::Closed),
            Either::Second(_) => Err(NetError::Timeout),
        }
    }

    pub async fn close(mut self) {
        self.closed = true;

        self.handle
            .commands
            .send(Command::WsClose {
                connection_id: self.connection_id.clone(),
            })
            .await;
    }
}

impl<M> Drop for WsClientConn<M>
where
    M: RawMutex + Send + Sync,
{
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.handle.commands.try_send(Command::WsClose {
                connection_id: self.connection_id.clone(),
            });
        }
    }
}

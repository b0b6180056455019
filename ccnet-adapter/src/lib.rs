#![allow(async_fn_in_trait)]
#![warn(clippy::large_futures)]

//! The client facade of the stack.
//!
//! User code hands the adapter a URL; the adapter classifies the host as
//! local (the ccnet medium) or remote, resolves local hostnames to node-ids
//! through the daemon, and dispatches transparently. Remote targets go
//! through a [`ForeignStack`] the embedder supplies; the default
//! [`NoForeignStack`] fails them.

use core::fmt::{self, Display};
use core::net::Ipv4Addr;

use std::collections::BTreeMap;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::Duration;

use log::debug;

use ccnet_netd::{HttpResponse, Netd, NetError, WsClientConn};

pub mod url;

pub use url::{is_local_host, Url};

#[derive(Debug)]
pub enum AdapterError {
    Net(NetError),
    InvalidUrl(String),
    /// The host is remote and no foreign stack is wired in.
    RemoteUnsupported,
    /// The foreign stack failed.
    Foreign(String),
}

impl Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Net(err) => write!(f, "{}", err),
            Self::InvalidUrl(url) => write!(f, "Invalid URL: {}", url),
            Self::RemoteUnsupported => write!(f, "Remote host and no foreign stack configured"),
            Self::Foreign(what) => write!(f, "Foreign stack error: {}", what),
        }
    }
}

impl std::error::Error for AdapterError {}

impl From<NetError> for AdapterError {
    fn from(err: NetError) -> Self {
        Self::Net(err)
    }
}

/// The host environment's own HTTP/WS facilities, used for remote targets.
pub trait ForeignStack {
    type Ws: ForeignWs;

    async fn http(
        &self,
        method: &str,
        url: &Url,
        headers: &BTreeMap<String, String>,
        body: &str,
    ) -> Result<HttpResponse, AdapterError>;

    async fn ws_connect(&self, url: &Url) -> Result<Self::Ws, AdapterError>;
}

/// A foreign WS connection.
pub trait ForeignWs {
    async fn send(&mut self, data: &str) -> Result<(), AdapterError>;
    async fn receive(&mut self, timeout: Duration) -> Result<String, AdapterError>;
    async fn close(&mut self);
}

/// The default foreign stack: every remote operation fails.
#[derive(Default, Clone)]
pub struct NoForeignStack(());

/// Uninhabited; satisfies the associated type, and no value of it can ever
/// exist to call these methods on.
pub enum NoForeignWs {}

impl ForeignWs for NoForeignWs {
    async fn send(&mut self, _data: &str) -> Result<(), AdapterError> {
        unreachable!("NoForeignWs is uninhabited")
    }

    async fn receive(&mut self, _timeout: Duration) -> Result<String, AdapterError> {
        unreachable!("NoForeignWs is uninhabited")
    }

    async fn close(&mut self) {
        unreachable!("NoForeignWs is uninhabited")
    }
}

impl ForeignStack for NoForeignStack {
    type Ws = NoForeignWs;

    async fn http(
        &self,
        _method: &str,
        _url: &Url,
        _headers: &BTreeMap<String, String>,
        _body: &str,
    ) -> Result<HttpResponse, AdapterError> {
        Err(AdapterError::RemoteUnsupported)
    }

    async fn ws_connect(&self, _url: &Url) -> Result<Self::Ws, AdapterError> {
        Err(AdapterError::RemoteUnsupported)
    }
}

/// A WS channel that is either a medium connection or a foreign one.
pub enum WsChannel<M, W>
where
    M: RawMutex + Send + Sync + 'static,
    W: ForeignWs,
{
    Local(WsClientConn<M>),
    Foreign(W),
}

impl<M, W> WsChannel<M, W>
where
    M: RawMutex + Send + Sync,
    W: ForeignWs,
{
    pub async fn send(&mut self, data: impl Into<String>) -> Result<(), AdapterError> {
        match self {
            Self::Local(conn) => {
                conn.send(data).await;
                Ok(())
            }
            Self::Foreign(ws) => ws.send(&data.into()).await,
        }
    }

    pub async fn receive(&mut self, timeout: Duration) -> Result<String, AdapterError> {
        match self {
            Self::Local(conn) => Ok(conn.receive(timeout).await?),
            Self::Foreign(ws) => ws.receive(timeout).await,
        }
    }

    pub async fn close(self) -> Result<(), AdapterError> {
        match self {
            Self::Local(conn) => {
                conn.close().await;
                Ok(())
            }
            Self::Foreign(mut ws) => {
                ws.close().await;
                Ok(())
            }
        }
    }
}

/// The adapter proper.
pub struct NetAdapter<M, F = NoForeignStack>
where
    M: RawMutex + Send + Sync + 'static,
{
    netd: Netd<M>,
    foreign: F,
    hostname: String,
    fqdn: String,
}

impl<M> NetAdapter<M, NoForeignStack>
where
    M: RawMutex + Send + Sync,
{
    /// An adapter with no foreign stack: local-only.
    pub async fn new(netd: Netd<M>) -> Self {
        Self::with_foreign(netd, NoForeignStack::default()).await
    }
}

impl<M, F> NetAdapter<M, F>
where
    M: RawMutex + Send + Sync,
    F: ForeignStack,
{
    pub async fn with_foreign(netd: Netd<M>, foreign: F) -> Self {
        let info = netd.info().await;

        Self {
            netd,
            foreign,
            hostname: info.identity.hostname,
            fqdn: info.identity.fqdn,
        }
    }

    pub fn netd(&self) -> &Netd<M> {
        &self.netd
    }

    fn is_local(&self, host: &str) -> bool {
        is_local_host(host, &self.hostname, &self.fqdn)
    }

    /// GET a URL.
    pub async fn get(&self, url: &str) -> Result<HttpResponse, AdapterError> {
        self.request("GET", url, BTreeMap::new(), "").await
    }

    /// POST a body to a URL.
    pub async fn post(&self, url: &str, body: impl Into<String>) -> Result<HttpResponse, AdapterError> {
        self.request("POST", url, BTreeMap::new(), body.into()).await
    }

    /// An HTTP request with any method. Local hosts go over the medium and
    /// are correlated by request id; remote hosts go to the foreign stack.
    pub async fn request(
        &self,
        method: &str,
        url: &str,
        headers: BTreeMap<String, String>,
        body: impl Into<String>,
    ) -> Result<HttpResponse, AdapterError> {
        let url = Url::parse(url)?;
        let body = body.into();

        if !self.is_local(&url.host) {
            debug!("adapter: {method} {url} via foreign stack");
            return self.foreign.http(method, &url, &headers, &body).await;
        }

        let node = self.netd.lookup_node(url.host.clone()).await?;

        Ok(self
            .netd
            .http_request(node, url.port, method, url.path.clone(), headers, body)
            .await?)
    }

    /// Opens a WS channel to a URL.
    pub async fn ws_connect(&self, url: &str) -> Result<WsChannel<M, F::Ws>, AdapterError> {
        let url = Url::parse(url)?;

        if !self.is_local(&url.host) {
            return Ok(WsChannel::Foreign(self.foreign.ws_connect(&url).await?));
        }

        let node = self.netd.lookup_node(url.host.clone()).await?;
        let conn = self.netd.ws_connect(node, url.to_string()).await?;

        Ok(WsChannel::Local(conn))
    }

    /// Opens a UDP socket (the UDP subsystem is always local).
    pub async fn udp_socket(&self, port: u16) -> Result<ccnet_netd::UdpSocket<M>, AdapterError> {
        Ok(self.netd.udp_socket(port).await?)
    }

    /// Resolves a local hostname to its address.
    pub async fn resolve(&self, host: &str) -> Result<Ipv4Addr, AdapterError> {
        Ok(self.netd.resolve(host).await?)
    }

    /// Pings a local host, returning the round-trip time.
    pub async fn ping(&self, host: &str, seq: u32) -> Result<Duration, AdapterError> {
        let node = self.netd.lookup_node(host).await?;

        Ok(self.netd.ping(node, seq).await?)
    }
}

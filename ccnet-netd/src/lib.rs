#![allow(async_fn_in_trait)]
#![warn(clippy::large_futures)]

//! The per-node network daemon.
//!
//! One single-threaded cooperative loop owns all protocol state: the TTL
//! caches, the server registry, the WebSocket connection table and the UDP
//! socket table. Everything else on the node talks to it through [`Netd`],
//! a cheap-to-clone handle whose operations are shipped to the loop over a
//! bounded channel and answered through one-shot signals.

use core::fmt::{self, Display};

use std::collections::BTreeMap;

pub mod cache;
pub mod config;
pub mod daemon;
pub mod handle;
pub mod logger;
pub mod persist;
pub mod registry;
pub mod stats;
pub mod udp;

mod handlers;

pub use config::Config;
pub use daemon::Daemon;
pub use handle::{Netd, NodeInfo, Peer, UdpSocket, WsClientConn};
pub use registry::{http_handler, HttpHandler, WsEvent, WsHandler, WsSender};

/// Fatal daemon errors; everything here ends the process with a specific
/// exit code.
#[derive(Debug)]
pub enum DaemonError {
    /// Missing or unusable configuration.
    Configuration(String),
    /// The PID file names a daemon that is (presumed) alive.
    AlreadyRunning,
    /// A stop signal was present at startup; it has been consumed.
    StopSignal,
    /// Runtime directories could not be created, or another fatal IO fault
    /// at init.
    Io(std::io::Error),
}

impl DaemonError {
    /// The process exit code the CLI maps this error to.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 2,
            Self::AlreadyRunning => 3,
            Self::StopSignal => 4,
            Self::Io(_) => 1,
        }
    }
}

impl Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(what) => write!(f, "Configuration error: {}", what),
            Self::AlreadyRunning => write!(f, "Daemon already running (PID file present)"),
            Self::StopSignal => write!(f, "Stop signal present"),
            Self::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for DaemonError {}

impl From<std::io::Error> for DaemonError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Errors surfaced to callers of the daemon handle and the adapter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetError {
    /// No medium attached; the daemon runs in limited mode.
    NetworkUnavailable,
    /// Name resolution found no answerer within the timeout.
    HostUnreachable,
    /// The operation's deadline passed.
    Timeout,
    /// The port already has a socket, or the registry role is taken.
    AddrInUse,
    /// The ephemeral range is fully allocated.
    PortExhausted,
    /// The socket or connection is gone.
    Closed,
    /// The peer rejected the connection.
    Rejected(String),
    /// The daemon loop is gone.
    Unavailable,
}

impl Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NetworkUnavailable => write!(f, "Network unavailable"),
            Self::HostUnreachable => write!(f, "Host unreachable"),
            Self::Timeout => write!(f, "Timed out"),
            Self::AddrInUse => write!(f, "Address in use"),
            Self::PortExhausted => write!(f, "Ephemeral ports exhausted"),
            Self::Closed => write!(f, "Closed"),
            Self::Rejected(reason) => write!(f, "Rejected: {}", reason),
            Self::Unavailable => write!(f, "Daemon unavailable"),
        }
    }
}

impl std::error::Error for NetError {}

/// An HTTP request as delivered to a registered handler.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    /// Node-id of the requesting peer.
    pub source: ccnet_link::NodeId,
}

/// An HTTP response, either produced by a handler or returned to a client.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(code: u16, body: impl Into<String>) -> Self {
        Self {
            code,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    pub fn not_found() -> Self {
        Self::new(404, "no handler bound")
    }

    pub fn server_error() -> Self {
        Self::new(500, "handler failed")
    }
}

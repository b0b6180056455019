#![allow(async_fn_in_trait)]
#![warn(clippy::large_futures)]

//! The gateway router.
//!
//! One router node serves a LAN segment of the medium: it assigns addresses
//! over DHCP, forwards UDP traffic between the LAN and the WAN side with
//! source/destination NAT, filters everything through a chain firewall, and
//! runs a (toy, non-cryptographic) wireless association protocol next to a
//! 100ms SSID beacon.
//!
//! The protocol logic lives in [`router::Router`], a pure state machine fed
//! decoded frames; [`daemon::RouterDaemon`] wires it to the medium, the
//! tick timers and the persistence files.

use core::fmt::{self, Display};

pub mod cidr;
pub mod config;
pub mod daemon;
pub mod firewall;
pub mod iface;
pub mod nat;
pub mod router;
pub mod routes;
pub mod wireless;

pub use config::RouterConfig;
pub use daemon::RouterDaemon;

use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum RouterError {
    Configuration(String),
    AlreadyRunning,
    StopSignal,
    Io(std::io::Error),
}

impl RouterError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 2,
            Self::AlreadyRunning => 3,
            Self::StopSignal => 4,
            Self::Io(_) => 1,
        }
    }
}

impl Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(what) => write!(f, "Configuration error: {}", what),
            Self::AlreadyRunning => write!(f, "Router already running (PID file present)"),
            Self::StopSignal => write!(f, "Stop signal present"),
            Self::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for RouterError {}

impl From<std::io::Error> for RouterError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Router counters, written to `/var/run/router.stats` every 10s.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct RouterStats {
    pub packets_forwarded: u64,
    pub packets_dropped: u64,
    pub packets_nat_translated: u64,
    pub dhcp_leases_active: usize,
    pub beacons_sent: u64,
    pub clients_associated: usize,
}

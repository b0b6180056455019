//! Persistent state: the runtime-file layout, PID/stop-file protocol, and
//! the JSON snapshots for stats, identity and caches.
//!
//! All writes are best-effort and atomic (temp file + rename); a failed
//! write must never corrupt what a previous run persisted.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::warn;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use ccnet_link::NodeId;
use ccnet_proto::MacAddr;

use crate::stats::Statistics;

/// The logical file layout, resolved against a configurable root.
#[derive(Clone, Debug)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn join(&self, logical: &str) -> PathBuf {
        self.root.join(logical.trim_start_matches('/'))
    }

    pub fn pid_file(&self) -> PathBuf {
        self.join("/var/run/netd.pid")
    }

    pub fn stop_file(&self) -> PathBuf {
        self.join("/var/run/netd.stop")
    }

    pub fn stop_all_file(&self) -> PathBuf {
        self.join("/var/run/netd.stop.all")
    }

    pub fn stats_file(&self) -> PathBuf {
        self.join("/var/run/netd.stats")
    }

    pub fn info_file(&self) -> PathBuf {
        self.join("/var/run/network.info")
    }

    pub fn state_file(&self) -> PathBuf {
        self.join("/var/cache/netd.state")
    }

    pub fn router_pid_file(&self) -> PathBuf {
        self.join("/var/run/routerd.pid")
    }

    pub fn router_stop_file(&self) -> PathBuf {
        self.join("/var/run/routerd.stop")
    }

    pub fn router_stats_file(&self) -> PathBuf {
        self.join("/var/run/router.stats")
    }

    pub fn leases_file(&self) -> PathBuf {
        self.join("/var/lib/dhcp/leases")
    }

    pub fn client_lease_file(&self) -> PathBuf {
        self.join("/var/lib/dhcp/client.lease")
    }

    /// Creates the runtime directories. Failure here is fatal at init.
    pub fn ensure_runtime_dirs(&self) -> io::Result<()> {
        for dir in ["/var/run", "/var/cache", "/var/lib/dhcp", "/var/log"] {
            fs::create_dir_all(self.join(dir))?;
        }

        Ok(())
    }
}

/// Writes `value` as JSON via a temp file and rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)?;

    Ok(())
}

/// Reads a JSON file; unreadable or undecodable files yield `None` with a
/// warning, never an error.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let text = fs::read_to_string(path).ok()?;

    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("ignoring undecodable state file {}: {err}", path.display());
            None
        }
    }
}

/// The PID-file payload: presence means "running on this node".
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PidFile {
    pub pid: u32,
    pub node_id: NodeId,
}

pub fn write_pid_file(path: &Path, node_id: NodeId) -> io::Result<()> {
    write_json_atomic(
        path,
        &PidFile {
            pid: std::process::id(),
            node_id,
        },
    )
}

/// Which stop signals are present. The local signal is consumed (deleted)
/// by the reader; the global one is shared and left in place.
pub fn check_stop_signals(paths: &Paths) -> bool {
    let mut stop = false;

    if paths.stop_file().exists() {
        if let Err(err) = fs::remove_file(paths.stop_file()) {
            warn!("could not consume stop file: {err}");
        }
        stop = true;
    }

    if paths.stop_all_file().exists() {
        stop = true;
    }

    stop
}

/// One persisted ARP entry; lifetimes are stored as remaining seconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavedArp {
    pub ip: core::net::Ipv4Addr,
    pub mac: MacAddr,
    pub hostname: String,
    pub node_id: NodeId,
    pub expires_in_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavedDns {
    pub hostname: String,
    pub ip: core::net::Ipv4Addr,
    pub expires_in_secs: u64,
}

/// Which roles a port had bound; informational (handlers are code and do
/// not survive a restart).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SavedServer {
    pub port: u16,
    pub http: bool,
    pub ws: bool,
}

/// The `/var/cache/netd.state` snapshot.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SavedState {
    pub arp: Vec<SavedArp>,
    pub dns: Vec<SavedDns>,
    pub servers: Vec<SavedServer>,
    pub stats: Statistics,
    /// Wall-clock millis of daemon start, for uptime continuity display.
    pub started_at_ms: u64,
}

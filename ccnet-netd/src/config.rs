//! The config store: node identity and tunables, read once at startup from
//! `key = value` files.
//!
//! Lookup order is `/etc/network.cfg` then `/config/network.cfg`, both
//! resolved against the configured root so tests and unprivileged runs can
//! relocate the whole tree.

use core::net::Ipv4Addr;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::LevelFilter;

use ccnet_proto::{MacAddr, NodeIdentity};

use crate::DaemonError;

#[derive(Clone, Debug)]
pub struct Config {
    /// Filesystem root the logical `/etc`, `/var`, `/config` paths resolve
    /// against.
    pub root: PathBuf,
    pub node_id: u32,
    pub hostname: Option<String>,
    pub ipv4: Option<Ipv4Addr>,
    pub mac: Option<MacAddr>,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,

    /// DNS cache TTL, seconds.
    pub dns_ttl: u64,
    /// ARP cache TTL, seconds.
    pub arp_ttl: u64,
    /// Presence broadcast period, seconds.
    pub discovery_interval: u64,
    pub discovery_enabled: bool,
    /// WS idle timeout, seconds.
    pub connection_timeout: u64,

    pub log_level: LevelFilter,
    pub log_file: PathBuf,

    /// Per-socket receive queue capacity.
    pub udp_buffer_size: usize,
    /// Drop incoming UDP packets whose advisory checksum mismatches.
    pub udp_verify_checksum: bool,
    pub udp_enabled: bool,

    /// Request/response deadline for local HTTP, seconds.
    pub http_timeout: u64,
    /// WS connect deadline, seconds.
    pub ws_timeout: u64,
    /// Hostname/id resolution deadline, seconds.
    pub resolve_timeout: u64,
}

impl Config {
    /// A config with every tunable at its default, for node `node_id`.
    pub fn defaults(node_id: u32) -> Self {
        Self {
            root: PathBuf::from("/"),
            node_id,
            hostname: None,
            ipv4: None,
            mac: None,
            gateway: None,
            dns: Vec::new(),
            dns_ttl: 300,
            arp_ttl: 600,
            discovery_interval: 30,
            discovery_enabled: true,
            connection_timeout: 30,
            log_level: LevelFilter::Info,
            log_file: PathBuf::from("/var/log/netd.log"),
            udp_buffer_size: 100,
            udp_verify_checksum: false,
            udp_enabled: true,
            http_timeout: 5,
            ws_timeout: 5,
            resolve_timeout: 2,
        }
    }

    /// Loads the node config from the first of `/etc/network.cfg`,
    /// `/config/network.cfg` under `root`.
    ///
    /// A missing file is fatal unless a node id is supplied by the caller
    /// (derived-everything mode).
    pub fn load(root: impl Into<PathBuf>, node_id: Option<u32>) -> Result<Self, DaemonError> {
        let root = root.into();

        let candidates = ["etc/network.cfg", "config/network.cfg"];
        let file = candidates.iter().map(|p| root.join(p)).find(|p| p.exists());

        let values = match &file {
            Some(path) => parse_kv_file(path)?,
            None => BTreeMap::new(),
        };

        let node_id = node_id
            .or_else(|| values.get("node.id").and_then(|v| v.parse().ok()))
            .ok_or_else(|| {
                DaemonError::Configuration(format!(
                    "no config file under {} and no node id given",
                    root.display()
                ))
            })?;

        let mut config = Self::defaults(node_id);
        config.root = root;
        config.apply(&values)?;

        Ok(config)
    }

    fn apply(&mut self, values: &BTreeMap<String, String>) -> Result<(), DaemonError> {
        for (key, value) in values {
            match key.as_str() {
                "node.id" => {}
                "hostname" => self.hostname = Some(value.clone()),
                "ipv4" => self.ipv4 = Some(parse(key, value)?),
                "mac" => self.mac = Some(value.parse().map_err(|_| bad(key, value))?),
                "gateway" => self.gateway = Some(parse(key, value)?),
                "dns" => {
                    self.dns = value
                        .split(',')
                        .map(|part| part.trim().parse().map_err(|_| bad(key, value)))
                        .collect::<Result<_, _>>()?;
                }
                "cache.dns_ttl" => self.dns_ttl = parse(key, value)?,
                "cache.arp_ttl" => self.arp_ttl = parse(key, value)?,
                "services.discovery.interval" => self.discovery_interval = parse(key, value)?,
                "services.discovery.enabled" => self.discovery_enabled = parse_bool(key, value)?,
                "advanced.connection_timeout" => self.connection_timeout = parse(key, value)?,
                "logging.level" => {
                    self.log_level = value.parse().map_err(|_| bad(key, value))?;
                }
                "logging.file" => self.log_file = PathBuf::from(value),
                "udp.buffer_size" => self.udp_buffer_size = parse(key, value)?,
                "udp.verify_checksum" => self.udp_verify_checksum = parse_bool(key, value)?,
                "udp.enabled" => self.udp_enabled = parse_bool(key, value)?,
                "advanced.http_timeout" => self.http_timeout = parse(key, value)?,
                "advanced.ws_timeout" => self.ws_timeout = parse(key, value)?,
                "advanced.resolve_timeout" => self.resolve_timeout = parse(key, value)?,
                // Unrecognized keys are kept forward-compatible
                _ => log::debug!("config: ignoring unknown key {key}"),
            }
        }

        Ok(())
    }

    /// The immutable identity this config produces.
    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity::derive(
            self.node_id,
            self.hostname.clone(),
            self.mac,
            self.ipv4,
            self.gateway,
            self.dns.clone(),
        )
    }

    /// Resolves a logical absolute path (e.g. `/var/run/netd.pid`) against
    /// the configured root.
    pub fn resolve(&self, logical: &str) -> PathBuf {
        self.root.join(logical.trim_start_matches('/'))
    }
}

/// Parses one `key = value` (or `key: value`) per line; `#` comments.
pub fn parse_kv(text: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let split = line
            .find('=')
            .or_else(|| line.find(':'))
            .map(|at| (line[..at].trim(), line[at + 1..].trim()));

        if let Some((key, value)) = split {
            if !key.is_empty() {
                values.insert(key.to_string(), value.to_string());
            }
        }
    }

    values
}

fn parse_kv_file(path: &Path) -> Result<BTreeMap<String, String>, DaemonError> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        DaemonError::Configuration(format!("{}: {}", path.display(), err))
    })?;

    Ok(parse_kv(&text))
}

fn parse<T: core::str::FromStr>(key: &str, value: &str) -> Result<T, DaemonError> {
    value.parse().map_err(|_| bad(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, DaemonError> {
    match value {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(bad(key, value)),
    }
}

fn bad(key: &str, value: &str) -> DaemonError {
    DaemonError::Configuration(format!("invalid value for {key}: {value:?}"))
}

//! Router configuration: `/etc/router.cfg` (key/value, same format as the
//! node config) plus the firewall rules file.

use core::net::Ipv4Addr;

use std::path::PathBuf;

use log::LevelFilter;

use ccnet_netd::config::parse_kv;

use crate::cidr::Cidr;
use crate::firewall::Firewall;
use crate::iface::IfaceKind;
use crate::nat::PortForward;
use crate::wireless::Security;
use crate::RouterError;

#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub root: PathBuf,
    pub node_id: u32,
    pub hostname: String,

    pub lan_ip: Ipv4Addr,
    pub lan_subnet: Cidr,
    pub wan_ip: Option<Ipv4Addr>,
    pub wan_gateway: Option<Ipv4Addr>,

    pub dhcp_range_start: Ipv4Addr,
    pub dhcp_range_end: Ipv4Addr,
    /// Lease duration, seconds.
    pub dhcp_lease_time: u64,
    pub dns: Vec<Ipv4Addr>,

    pub nat_enabled: bool,
    pub port_forwards: Vec<PortForward>,
    pub dmz_host: Option<Ipv4Addr>,

    pub interfaces: Vec<IfaceKind>,

    pub ssid: String,
    pub security: Security,
    pub channel: u8,
    /// Beacon period, milliseconds.
    pub beacon_interval_ms: u64,

    pub log_level: LevelFilter,
    pub log_file: PathBuf,
}

impl RouterConfig {
    pub fn defaults(node_id: u32) -> Self {
        let lan_ip = Ipv4Addr::new(10, 0, 1, 1);

        Self {
            root: PathBuf::from("/"),
            node_id,
            hostname: "gateway".into(),
            lan_ip,
            lan_subnet: Cidr::new(Ipv4Addr::new(10, 0, 1, 0), 24).unwrap(),
            wan_ip: None,
            wan_gateway: None,
            dhcp_range_start: Ipv4Addr::new(10, 0, 1, 100),
            dhcp_range_end: Ipv4Addr::new(10, 0, 1, 200),
            dhcp_lease_time: 3600,
            dns: vec![lan_ip],
            nat_enabled: true,
            port_forwards: Vec::new(),
            dmz_host: None,
            interfaces: vec![IfaceKind::Wireless, IfaceKind::Wired, IfaceKind::Wired],
            ssid: "ccnet".into(),
            security: Security::Wpa3,
            channel: 6,
            beacon_interval_ms: 100,
            log_level: LevelFilter::Info,
            log_file: PathBuf::from("/var/log/routerd.log"),
        }
    }

    /// Loads `/etc/router.cfg` under `root`; a missing file falls back to
    /// defaults when a node id is supplied.
    pub fn load(root: impl Into<PathBuf>, node_id: Option<u32>) -> Result<Self, RouterError> {
        let root = root.into();
        let path = root.join("etc/router.cfg");

        let values = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|err| RouterError::Configuration(format!("{}: {err}", path.display())))?;
            parse_kv(&text)
        } else {
            Default::default()
        };

        let node_id = node_id
            .or_else(|| values.get("node.id").and_then(|v| v.parse().ok()))
            .ok_or_else(|| {
                RouterError::Configuration(format!(
                    "no router config under {} and no node id given",
                    root.display()
                ))
            })?;

        let mut config = Self::defaults(node_id);
        config.root = root;

        for (key, value) in &values {
            match key.as_str() {
                "node.id" => {}
                "hostname" => config.hostname = value.clone(),
                "lan.ip" => config.lan_ip = parse(key, value)?,
                "lan.subnet" => {
                    config.lan_subnet = value
                        .parse()
                        .map_err(|_| bad(key, value))?;
                }
                "wan.ip" => config.wan_ip = Some(parse(key, value)?),
                "wan.gateway" => config.wan_gateway = Some(parse(key, value)?),
                "dhcp.range_start" => config.dhcp_range_start = parse(key, value)?,
                "dhcp.range_end" => config.dhcp_range_end = parse(key, value)?,
                "dhcp.lease_time" => config.dhcp_lease_time = parse(key, value)?,
                "dns" => {
                    config.dns = value
                        .split(',')
                        .map(|part| part.trim().parse().map_err(|_| bad(key, value)))
                        .collect::<Result<_, _>>()?;
                }
                "nat.enabled" => config.nat_enabled = parse_bool(key, value)?,
                "nat.forward" => {
                    config.port_forwards = value
                        .split(',')
                        .map(|part| PortForward::parse(part.trim()))
                        .collect::<Result<_, _>>()
                        .map_err(RouterError::Configuration)?;
                }
                "nat.dmz" => config.dmz_host = Some(parse(key, value)?),
                "interfaces" => {
                    config.interfaces = value
                        .split(',')
                        .map(|part| part.trim().parse())
                        .collect::<Result<_, _>>()
                        .map_err(RouterError::Configuration)?;
                }
                "wireless.ssid" => config.ssid = value.clone(),
                "wireless.security" => {
                    config.security = match value.as_str() {
                        "OPEN" | "open" => Security::Open,
                        "WPA3" | "wpa3" => Security::Wpa3,
                        _ => return Err(bad(key, value)),
                    };
                }
                "wireless.channel" => config.channel = parse(key, value)?,
                "wireless.beacon_interval_ms" => config.beacon_interval_ms = parse(key, value)?,
                "logging.level" => {
                    config.log_level = value.parse().map_err(|_| bad(key, value))?;
                }
                "logging.file" => config.log_file = PathBuf::from(value),
                _ => log::debug!("router config: ignoring unknown key {key}"),
            }
        }

        Ok(config)
    }

    /// Loads `/etc/firewall.rules` under the configured root; absent file
    /// means an empty accept-all firewall.
    pub fn load_firewall(&self) -> Result<Firewall, RouterError> {
        let path = self.root.join("etc/firewall.rules");

        if !path.exists() {
            return Ok(Firewall::new());
        }

        let text = std::fs::read_to_string(&path)
            .map_err(|err| RouterError::Configuration(format!("{}: {err}", path.display())))?;

        Firewall::parse(&text).map_err(RouterError::Configuration)
    }

    pub fn fqdn(&self) -> String {
        format!("{}.local", self.hostname)
    }
}

fn parse<T: core::str::FromStr>(key: &str, value: &str) -> Result<T, RouterError> {
    value.parse().map_err(|_| bad(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, RouterError> {
    match value {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(bad(key, value)),
    }
}

fn bad(key: &str, value: &str) -> RouterError {
    RouterError::Configuration(format!("invalid value for {key}: {value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str, router_cfg: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "ccnet-router-config-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::fs::write(root.join("etc/router.cfg"), router_cfg).unwrap();

        root
    }

    #[test]
    fn loads_a_full_config() {
        let root = temp_root(
            "full",
            "node.id = 1\n\
             hostname = gw\n\
             lan.ip = 10.0.1.1\n\
             lan.subnet = 10.0.1.0/24\n\
             wan.ip = 203.0.113.7\n\
             wan.gateway = 203.0.113.1\n\
             dhcp.range_start = 10.0.1.100\n\
             dhcp.range_end = 10.0.1.102\n\
             nat.forward = 8080:udp:10.0.1.50:80\n\
             nat.dmz = 10.0.1.99\n\
             wireless.ssid = lab\n\
             wireless.security = OPEN\n",
        );

        let config = RouterConfig::load(&root, None).unwrap();

        assert_eq!(config.node_id, 1);
        assert_eq!(config.hostname, "gw");
        assert_eq!(config.wan_ip, Some(Ipv4Addr::new(203, 0, 113, 7)));
        assert_eq!(config.port_forwards.len(), 1);
        assert_eq!(config.dmz_host, Some(Ipv4Addr::new(10, 0, 1, 99)));
        assert_eq!(config.security, Security::Open);
        assert_eq!(config.ssid, "lab");
    }

    #[test]
    fn missing_config_needs_a_node_id() {
        let root = std::env::temp_dir().join(format!(
            "ccnet-router-config-missing-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root).unwrap();

        assert!(RouterConfig::load(&root, None).is_err());
        assert!(RouterConfig::load(&root, Some(1)).is_ok());
    }

    #[test]
    fn firewall_file_is_optional() {
        let root = temp_root("fw", "node.id = 1\n");

        let config = RouterConfig::load(&root, None).unwrap();
        let firewall = config.load_firewall().unwrap();
        assert!(firewall.is_empty());

        std::fs::write(
            root.join("etc/firewall.rules"),
            "FORWARD src=10.0.1.50 DROP\nPOLICY INPUT ACCEPT\n",
        )
        .unwrap();

        let firewall = config.load_firewall().unwrap();
        assert_eq!(firewall.len(), 1);
    }
}

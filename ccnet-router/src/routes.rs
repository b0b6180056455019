//! The routing table: longest-prefix match, ties broken by metric.

use core::net::Ipv4Addr;

use crate::cidr::Cidr;
use crate::iface::{LAN, WAN};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub destination: Cidr,
    pub gateway: Option<Ipv4Addr>,
    pub interface: String,
    pub metric: u32,
}

#[derive(Clone, Debug, Default)]
pub struct RoutingTable {
    routes: Vec<Route>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard gateway setup: the LAN subnet on `eth0`, everything
    /// else via the WAN gateway on `eth1`.
    pub fn gateway_defaults(lan_subnet: Cidr, wan_gateway: Option<Ipv4Addr>) -> Self {
        let mut table = Self::new();

        table.add(Route {
            destination: lan_subnet,
            gateway: None,
            interface: LAN.into(),
            metric: 0,
        });

        if let Some(gateway) = wan_gateway {
            table.add(Route {
                destination: "0.0.0.0/0".parse().unwrap(),
                gateway: Some(gateway),
                interface: WAN.into(),
                metric: 100,
            });
        }

        table
    }

    pub fn add(&mut self, route: Route) {
        self.routes.push(route);
        // Most-specific first, then cheapest; lookup takes the first hit
        self.routes
            .sort_by(|a, b| {
                b.destination
                    .prefix()
                    .cmp(&a.destination.prefix())
                    .then(a.metric.cmp(&b.metric))
            });
    }

    pub fn lookup(&self, dest: Ipv4Addr) -> Option<&Route> {
        self.routes
            .iter()
            .find(|route| route.destination.contains(dest))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }
}

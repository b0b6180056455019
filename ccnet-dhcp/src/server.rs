//! The server half: a lease pool keyed by client MAC.
//!
//! Pure state machine; the router daemon feeds it decoded messages and
//! transmits whatever reply comes back. Pool invariant: every pool address
//! is either marked available or held by exactly one lease.

use core::net::Ipv4Addr;

use std::collections::BTreeMap;

use embassy_time::{Duration, Instant};

use log::{debug, info};

use serde::{Deserialize, Serialize};

use ccnet_proto::MacAddr;

use crate::DhcpMessage;

/// How long an OFFER reserves its address while waiting for the REQUEST.
const OFFER_TTL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct Lease {
    pub ip: Ipv4Addr,
    pub hostname: String,
    pub expires: Instant,
}

#[derive(Clone, Debug)]
struct Offer {
    ip: Ipv4Addr,
    made: Instant,
}

/// A persistable snapshot of one lease; expiry is stored as remaining time
/// because monotonic instants do not survive a restart.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub hostname: String,
    pub expires_in_secs: u64,
}

pub struct Server {
    pub ip: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Vec<Ipv4Addr>,
    pub lease_duration: Duration,
    pool: Vec<(Ipv4Addr, bool)>,
    leases: BTreeMap<MacAddr, Lease>,
    offers: BTreeMap<MacAddr, Offer>,
}

impl Server {
    /// Builds a server handing out `range_start..=range_end`, inclusive and
    /// in order.
    pub fn new(
        ip: Ipv4Addr,
        subnet: Ipv4Addr,
        gateway: Ipv4Addr,
        dns: Vec<Ipv4Addr>,
        range_start: Ipv4Addr,
        range_end: Ipv4Addr,
        lease_duration: Duration,
    ) -> Self {
        let start: u32 = range_start.into();
        let end: u32 = range_end.into();

        let pool = (start..=end).map(|addr| (Ipv4Addr::from(addr), true)).collect();

        Self {
            ip,
            subnet,
            gateway,
            dns,
            lease_duration,
            pool,
            leases: BTreeMap::new(),
            offers: BTreeMap::new(),
        }
    }

    /// Feeds one decoded message through the state machine, returning the
    /// reply to unicast back, if any.
    pub fn handle(&mut self, msg: &DhcpMessage, now: Instant) -> Option<DhcpMessage> {
        match msg {
            DhcpMessage::Discover { xid, mac, hostname } => {
                debug!("dhcp: DISCOVER from {mac} ({hostname})");

                let ip = self.select(mac, now)?;
                self.offers.insert(*mac, Offer { ip, made: now });

                info!("dhcp: offering {ip} to {mac}");

                Some(DhcpMessage::Offer {
                    xid: *xid,
                    ip,
                    server_ip: self.ip,
                    subnet: self.subnet,
                    gateway: self.gateway,
                    dns: self.dns.clone(),
                    lease_time: self.lease_duration.as_secs(),
                })
            }
            DhcpMessage::Request {
                xid,
                mac,
                hostname,
                requested_ip,
            } => Some(self.request(*xid, *mac, hostname, *requested_ip, now)),
            DhcpMessage::Release { mac, ip } => {
                let held = self.leases.get(mac).map(|lease| lease.ip);

                if held == Some(*ip) {
                    info!("dhcp: {mac} released {ip}");

                    self.leases.remove(mac);
                    self.mark(*ip, true);
                }

                None
            }
            // Server-to-client traffic looped back by the medium
            _ => None,
        }
    }

    /// Drops expired leases (returning their addresses to the pool) and
    /// stale offers. Returns the number of leases that expired.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<MacAddr> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires < now)
            .map(|(mac, _)| *mac)
            .collect();

        for mac in &expired {
            if let Some(lease) = self.leases.remove(mac) {
                info!("dhcp: lease for {mac} on {} expired", lease.ip);
                self.mark(lease.ip, true);
            }
        }

        self.offers.retain(|_, offer| now - offer.made < OFFER_TTL);

        expired.len()
    }

    pub fn leases(&self) -> impl Iterator<Item = (&MacAddr, &Lease)> {
        self.leases.iter()
    }

    pub fn active_leases(&self) -> usize {
        self.leases.len()
    }

    pub fn available(&self) -> usize {
        self.pool.iter().filter(|(_, available)| *available).count()
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    /// Snapshot for the lease file.
    pub fn records(&self, now: Instant) -> Vec<LeaseRecord> {
        self.leases
            .iter()
            .map(|(mac, lease)| LeaseRecord {
                mac: *mac,
                ip: lease.ip,
                hostname: lease.hostname.clone(),
                expires_in_secs: lease
                    .expires
                    .checked_duration_since(now)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
            })
            .collect()
    }

    /// Reloads leases from a snapshot, claiming their pool addresses.
    pub fn restore(&mut self, records: Vec<LeaseRecord>, now: Instant) {
        for record in records {
            if !self.in_pool(record.ip) {
                continue;
            }

            self.mark(record.ip, false);
            self.leases.insert(
                record.mac,
                Lease {
                    ip: record.ip,
                    hostname: record.hostname,
                    expires: now + Duration::from_secs(record.expires_in_secs),
                },
            );
        }
    }

    fn request(
        &mut self,
        xid: u32,
        mac: MacAddr,
        hostname: &str,
        requested_ip: Ipv4Addr,
        now: Instant,
    ) -> DhcpMessage {
        let offered = self.offers.get(&mac).map(|offer| offer.ip);
        let held = self.leases.get(&mac).map(|lease| lease.ip);

        // A REQUEST is honored for the address we offered, or for the
        // address the client already holds (renewal)
        let acceptable =
            offered == Some(requested_ip) || held == Some(requested_ip);

        if !acceptable || !self.claimable(&mac, requested_ip) {
            debug!("dhcp: NAK for {mac} requesting {requested_ip}");

            return DhcpMessage::Nak {
                xid,
                reason: format!("{} is not the offered address", requested_ip),
            };
        }

        self.offers.remove(&mac);
        self.mark(requested_ip, false);
        self.leases.insert(
            mac,
            Lease {
                ip: requested_ip,
                hostname: hostname.to_string(),
                expires: now + self.lease_duration,
            },
        );

        info!("dhcp: {requested_ip} leased to {mac} ({hostname})");

        DhcpMessage::Ack {
            xid,
            ip: requested_ip,
            server_ip: self.ip,
            subnet: self.subnet,
            gateway: self.gateway,
            dns: self.dns.clone(),
            lease_time: self.lease_duration.as_secs(),
        }
    }

    /// Picks the address to offer: the client's current lease if it has one,
    /// otherwise the first pool entry neither leased nor offered elsewhere.
    fn select(&self, mac: &MacAddr, now: Instant) -> Option<Ipv4Addr> {
        if let Some(lease) = self.leases.get(mac) {
            return Some(lease.ip);
        }

        self.pool
            .iter()
            .filter(|(_, available)| *available)
            .map(|(ip, _)| *ip)
            .find(|ip| {
                !self.offers.iter().any(|(other, offer)| {
                    other != mac && offer.ip == *ip && now - offer.made < OFFER_TTL
                })
            })
    }

    fn claimable(&self, mac: &MacAddr, ip: Ipv4Addr) -> bool {
        self.in_pool(ip)
            && (self
                .pool
                .iter()
                .any(|(addr, available)| *addr == ip && *available)
                || self.leases.get(mac).map(|lease| lease.ip) == Some(ip))
    }

    fn in_pool(&self, ip: Ipv4Addr) -> bool {
        self.pool.iter().any(|(addr, _)| *addr == ip)
    }

    fn mark(&mut self, ip: Ipv4Addr, available: bool) {
        if let Some(entry) = self.pool.iter_mut().find(|(addr, _)| *addr == ip) {
            entry.1 = available;
        }
    }
}

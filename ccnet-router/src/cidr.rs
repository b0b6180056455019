//! CIDR prefixes with full arbitrary-length masks.
//!
//! The ancestors of this code matched whole octets only (/8, /16, /24);
//! matching here is over the real bit prefix, which keeps octet-aligned
//! rule files meaning the same thing while accepting everything between.

use core::fmt::{self, Display};
use core::net::Ipv4Addr;
use core::str::FromStr;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Cidr {
    addr: Ipv4Addr,
    prefix: u8,
}

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidCidr;

impl Display for InvalidCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid CIDR")
    }
}

impl std::error::Error for InvalidCidr {}

impl Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, InvalidCidr> {
        if prefix > 32 {
            return Err(InvalidCidr);
        }

        Ok(Self { addr, prefix })
    }

    /// A /32 for a single host.
    pub fn host(addr: Ipv4Addr) -> Self {
        Self { addr, prefix: 32 }
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask())
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = self.mask();

        u32::from(self.addr) & mask == u32::from(ip) & mask
    }
}

impl Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = InvalidCidr;

    /// Accepts `a.b.c.d/n` and bare `a.b.c.d` (a host).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr = addr.parse().map_err(|_| InvalidCidr)?;
                let prefix = prefix.parse().map_err(|_| InvalidCidr)?;

                Self::new(addr, prefix)
            }
            None => Ok(Self::host(s.parse().map_err(|_| InvalidCidr)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn octet_aligned_prefixes() {
        let net: Cidr = "10.0.1.0/24".parse().unwrap();

        assert!(net.contains(Ipv4Addr::new(10, 0, 1, 1)));
        assert!(net.contains(Ipv4Addr::new(10, 0, 1, 254)));
        assert!(!net.contains(Ipv4Addr::new(10, 0, 2, 1)));
        assert_eq!(net.netmask(), Ipv4Addr::new(255, 255, 255, 0));
    }

    #[test]
    fn sub_octet_prefixes() {
        let net: Cidr = "172.16.0.0/12".parse().unwrap();

        assert!(net.contains(Ipv4Addr::new(172, 16, 0, 1)));
        assert!(net.contains(Ipv4Addr::new(172, 31, 255, 255)));
        assert!(!net.contains(Ipv4Addr::new(172, 32, 0, 1)));
        assert!(!net.contains(Ipv4Addr::new(172, 15, 255, 255)));
    }

    #[test]
    fn edge_prefixes() {
        let all: Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains(Ipv4Addr::new(8, 8, 8, 8)));

        let host: Cidr = "10.0.1.50".parse().unwrap();
        assert_eq!(host.prefix(), 32);
        assert!(host.contains(Ipv4Addr::new(10, 0, 1, 50)));
        assert!(!host.contains(Ipv4Addr::new(10, 0, 1, 51)));
    }

    #[test]
    fn invalid_inputs() {
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("not-an-ip/8".parse::<Cidr>().is_err());
        assert!("10.0.0.0/x".parse::<Cidr>().is_err());
    }
}

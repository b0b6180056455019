//! Interface classification: the first wireless interface becomes `wlan0`,
//! the first wired one `eth0` (LAN), the second wired one `eth1` (WAN).
//! Any of the three can be absent; the matching function blocks simply
//! stay disabled.

use core::str::FromStr;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IfaceKind {
    Wireless,
    Wired,
}

impl FromStr for IfaceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "wireless" | "wlan" => Ok(Self::Wireless),
            "wired" | "eth" => Ok(Self::Wired),
            other => Err(format!("unknown interface kind {other:?}")),
        }
    }
}

/// The classified interface roles. Role names are the conventional ones and
/// double as the `interface` field of routes and firewall rules.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Interfaces {
    pub wlan: bool,
    pub lan: bool,
    pub wan: bool,
}

pub const WLAN: &str = "wlan0";
pub const LAN: &str = "eth0";
pub const WAN: &str = "eth1";

impl Interfaces {
    /// Classifies the attached interfaces in declaration order.
    pub fn classify(attached: &[IfaceKind]) -> Self {
        let mut ifaces = Self::default();
        let mut wired = 0;

        for kind in attached {
            match kind {
                IfaceKind::Wireless => {
                    if !ifaces.wlan {
                        ifaces.wlan = true;
                    }
                }
                IfaceKind::Wired => {
                    match wired {
                        0 => ifaces.lan = true,
                        1 => ifaces.wan = true,
                        _ => {}
                    }
                    wired += 1;
                }
            }
        }

        ifaces
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_complement() {
        let ifaces = Interfaces::classify(&[
            IfaceKind::Wireless,
            IfaceKind::Wired,
            IfaceKind::Wired,
        ]);

        assert!(ifaces.wlan);
        assert!(ifaces.lan);
        assert!(ifaces.wan);
    }

    #[test]
    fn declaration_order_decides_lan_vs_wan() {
        let ifaces = Interfaces::classify(&[IfaceKind::Wired]);

        assert!(ifaces.lan);
        assert!(!ifaces.wan);
        assert!(!ifaces.wlan);
    }

    #[test]
    fn extra_interfaces_are_ignored() {
        let ifaces = Interfaces::classify(&[
            IfaceKind::Wired,
            IfaceKind::Wired,
            IfaceKind::Wired,
            IfaceKind::Wireless,
            IfaceKind::Wireless,
        ]);

        assert_eq!(
            ifaces,
            Interfaces {
                wlan: true,
                lan: true,
                wan: true
            }
        );
    }

    #[test]
    fn kinds_parse() {
        assert_eq!("wireless".parse::<IfaceKind>().unwrap(), IfaceKind::Wireless);
        assert_eq!("wired".parse::<IfaceKind>().unwrap(), IfaceKind::Wired);
        assert!("fiber".parse::<IfaceKind>().is_err());
    }
}

//! The chain firewall: INPUT, FORWARD and OUTPUT chains of ordered rules,
//! first match wins, per-chain default policy.
//!
//! Rule file format, one rule per line:
//!
//! ```text
//! # chain [in=iface] [src=cidr] [dst=cidr] [proto=p] [sport=n] [dport=n] action
//! FORWARD src=10.0.1.50 DROP
//! FORWARD in=eth1 dst=10.0.1.0/24 proto=udp dport=8080 ACCEPT
//! POLICY FORWARD ACCEPT
//! ```

use core::fmt::{self, Display};
use core::net::Ipv4Addr;
use core::str::FromStr;

use crate::cidr::Cidr;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Chain {
    Input,
    Forward,
    Output,
}

impl FromStr for Chain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INPUT" => Ok(Self::Input),
            "FORWARD" => Ok(Self::Forward),
            "OUTPUT" => Ok(Self::Output),
            other => Err(format!("unknown chain {other:?}")),
        }
    }
}

impl Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "INPUT"),
            Self::Forward => write!(f, "FORWARD"),
            Self::Output => write!(f, "OUTPUT"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Accept,
    Drop,
    Reject,
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACCEPT" => Ok(Self::Accept),
            "DROP" => Ok(Self::Drop),
            "REJECT" => Ok(Self::Reject),
            other => Err(format!("unknown action {other:?}")),
        }
    }
}

/// One rule; empty conditions match everything (the match is an AND over
/// the conditions that are present).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirewallRule {
    pub chain: Chain,
    pub iface: Option<String>,
    pub src: Option<Cidr>,
    pub dst: Option<Cidr>,
    pub proto: Option<String>,
    pub sport: Option<u16>,
    pub dport: Option<u16>,
    pub action: Action,
}

/// What a rule is matched against.
#[derive(Clone, Debug)]
pub struct PacketMeta<'a> {
    pub iface: &'a str,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub proto: &'a str,
    pub sport: u16,
    pub dport: u16,
}

impl FirewallRule {
    fn matches(&self, packet: &PacketMeta) -> bool {
        self.iface.as_deref().map_or(true, |iface| iface == packet.iface)
            && self.src.map_or(true, |src| src.contains(packet.src_ip))
            && self.dst.map_or(true, |dst| dst.contains(packet.dst_ip))
            && self
                .proto
                .as_deref()
                .map_or(true, |proto| proto.eq_ignore_ascii_case(packet.proto))
            && self.sport.map_or(true, |sport| sport == packet.sport)
            && self.dport.map_or(true, |dport| dport == packet.dport)
    }

    /// Parses a rule line: `CHAIN [cond=value ...] ACTION`.
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut parts = line.split_whitespace();

        let chain: Chain = parts.next().ok_or("empty rule")?.parse()?;

        let mut rule = Self {
            chain,
            iface: None,
            src: None,
            dst: None,
            proto: None,
            sport: None,
            dport: None,
            action: Action::Accept,
        };

        let mut action = None;

        for part in parts {
            if let Some((key, value)) = part.split_once('=') {
                match key {
                    "in" | "iface" => rule.iface = Some(value.to_string()),
                    "src" => {
                        rule.src = Some(value.parse().map_err(|_| format!("bad src {value:?}"))?)
                    }
                    "dst" => {
                        rule.dst = Some(value.parse().map_err(|_| format!("bad dst {value:?}"))?)
                    }
                    "proto" => rule.proto = Some(value.to_string()),
                    "sport" => {
                        rule.sport = Some(value.parse().map_err(|_| format!("bad sport {value:?}"))?)
                    }
                    "dport" => {
                        rule.dport = Some(value.parse().map_err(|_| format!("bad dport {value:?}"))?)
                    }
                    other => return Err(format!("unknown condition {other:?}")),
                }
            } else {
                action = Some(part.parse()?);
            }
        }

        rule.action = action.ok_or("rule without action")?;

        Ok(rule)
    }
}

pub struct Firewall {
    rules: Vec<FirewallRule>,
    input_policy: Action,
    forward_policy: Action,
    output_policy: Action,
}

impl Default for Firewall {
    /// Everything accepted until rules say otherwise.
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            input_policy: Action::Accept,
            forward_policy: Action::Accept,
            output_policy: Action::Accept,
        }
    }
}

impl Firewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a whole rules file; `POLICY CHAIN ACTION` lines set default
    /// policies, `#` starts a comment.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut firewall = Self::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(rest) = line.strip_prefix("POLICY ") {
                let mut parts = rest.split_whitespace();
                let chain: Chain = parts.next().ok_or("POLICY without chain")?.parse()?;
                let action: Action = parts.next().ok_or("POLICY without action")?.parse()?;

                firewall.set_policy(chain, action);
            } else {
                firewall.push(FirewallRule::parse(line)?);
            }
        }

        Ok(firewall)
    }

    pub fn push(&mut self, rule: FirewallRule) {
        self.rules.push(rule);
    }

    pub fn set_policy(&mut self, chain: Chain, action: Action) {
        match chain {
            Chain::Input => self.input_policy = action,
            Chain::Forward => self.forward_policy = action,
            Chain::Output => self.output_policy = action,
        }
    }

    pub fn policy(&self, chain: Chain) -> Action {
        match chain {
            Chain::Input => self.input_policy,
            Chain::Forward => self.forward_policy,
            Chain::Output => self.output_policy,
        }
    }

    /// First matching rule's action, or the chain policy.
    pub fn evaluate(&self, chain: Chain, packet: &PacketMeta) -> Action {
        self.rules
            .iter()
            .filter(|rule| rule.chain == chain)
            .find(|rule| rule.matches(packet))
            .map(|rule| rule.action)
            .unwrap_or_else(|| self.policy(chain))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

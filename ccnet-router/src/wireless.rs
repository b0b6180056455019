//! The access-point side of the association protocol, plus beaconing.
//!
//! The `WPA3-like` SAE exchange here performs no cryptography whatsoever:
//! the router hands out a random challenge and accepts any non-empty
//! confirmation. It is a wire-compatible placeholder for the handshake
//! shape, not a security primitive, and must never be treated as one.

use std::collections::HashMap;

use embassy_time::Instant;

use log::{debug, info};

use rand::Rng;

use serde::{Deserialize, Serialize};

use ccnet_proto::MacAddr;

/// Security mode, as advertised in beacons.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Security {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "WPA3")]
    Wpa3,
}

/// Association messages, tagged by `auth_type` as on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "auth_type")]
pub enum AuthMessage {
    #[serde(rename = "OPEN")]
    Open { mac: MacAddr },
    #[serde(rename = "SAE_COMMIT")]
    SaeCommit { mac: MacAddr },
    #[serde(rename = "SAE_CONFIRM")]
    SaeConfirm {
        mac: MacAddr,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        challenge: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confirm: Option<String>,
    },
    #[serde(rename = "ASSOCIATED")]
    Associated { mac: MacAddr, success: bool },
}

/// The periodic wireless advertisement.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BeaconMessage {
    #[serde(rename = "BEACON")]
    Beacon {
        ssid: String,
        security: Security,
        channel: u8,
    },
}

enum AssocState {
    /// SAE commit seen, waiting for the confirmation of this challenge.
    Challenged(String),
    Associated,
}

pub struct AccessPoint {
    pub ssid: String,
    pub security: Security,
    pub channel: u8,
    clients: HashMap<MacAddr, AssocState>,
}

impl AccessPoint {
    pub fn new(ssid: impl Into<String>, security: Security, channel: u8) -> Self {
        Self {
            ssid: ssid.into(),
            security,
            channel,
            clients: HashMap::new(),
        }
    }

    pub fn beacon(&self) -> BeaconMessage {
        BeaconMessage::Beacon {
            ssid: self.ssid.clone(),
            security: self.security,
            channel: self.channel,
        }
    }

    pub fn associated(&self) -> usize {
        self.clients
            .values()
            .filter(|state| matches!(state, AssocState::Associated))
            .count()
    }

    pub fn is_associated(&self, mac: &MacAddr) -> bool {
        matches!(self.clients.get(mac), Some(AssocState::Associated))
    }

    /// Feeds one association message through the handshake, returning the
    /// reply to unicast back.
    pub fn handle(&mut self, msg: &AuthMessage, _now: Instant) -> Option<AuthMessage> {
        match msg {
            AuthMessage::Open { mac } => {
                if self.security != Security::Open {
                    debug!("ap: open association from {mac} refused, network is WPA3");
                    return Some(AuthMessage::Associated {
                        mac: *mac,
                        success: false,
                    });
                }

                info!("ap: {mac} associated (open)");
                self.clients.insert(*mac, AssocState::Associated);

                Some(AuthMessage::Associated {
                    mac: *mac,
                    success: true,
                })
            }
            AuthMessage::SaeCommit { mac } => {
                let challenge = format!("{:08x}", rand::thread_rng().gen::<u32>());

                self.clients
                    .insert(*mac, AssocState::Challenged(challenge.clone()));

                Some(AuthMessage::SaeConfirm {
                    mac: *mac,
                    challenge: Some(challenge),
                    confirm: None,
                })
            }
            AuthMessage::SaeConfirm { mac, confirm, .. } => {
                let Some(AssocState::Challenged(_)) = self.clients.get(mac) else {
                    return Some(AuthMessage::Associated {
                        mac: *mac,
                        success: false,
                    });
                };

                // Placeholder acceptance: any non-empty confirmation passes
                let success = confirm.as_deref().is_some_and(|c| !c.is_empty());

                if success {
                    info!("ap: {mac} associated (sae)");
                    self.clients.insert(*mac, AssocState::Associated);
                } else {
                    self.clients.remove(mac);
                }

                Some(AuthMessage::Associated {
                    mac: *mac,
                    success,
                })
            }
            AuthMessage::Associated { .. } => None,
        }
    }

    pub fn deauth(&mut self, mac: &MacAddr) -> bool {
        self.clients.remove(mac).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u32) -> MacAddr {
        MacAddr::for_node(n)
    }

    #[test]
    fn open_association() {
        let mut ap = AccessPoint::new("ccnet", Security::Open, 6);
        let now = Instant::now();

        let reply = ap.handle(&AuthMessage::Open { mac: mac(1) }, now).unwrap();

        assert!(matches!(reply, AuthMessage::Associated { success: true, .. }));
        assert!(ap.is_associated(&mac(1)));
        assert_eq!(ap.associated(), 1);
    }

    #[test]
    fn sae_handshake() {
        let mut ap = AccessPoint::new("ccnet", Security::Wpa3, 11);
        let now = Instant::now();

        let reply = ap
            .handle(&AuthMessage::SaeCommit { mac: mac(1) }, now)
            .unwrap();

        let AuthMessage::SaeConfirm { challenge, .. } = reply else {
            panic!("expected SAE_CONFIRM");
        };
        assert!(challenge.is_some());
        assert!(!ap.is_associated(&mac(1)));

        let reply = ap
            .handle(
                &AuthMessage::SaeConfirm {
                    mac: mac(1),
                    challenge: None,
                    confirm: Some("derived-value".into()),
                },
                now,
            )
            .unwrap();

        assert!(matches!(reply, AuthMessage::Associated { success: true, .. }));
        assert!(ap.is_associated(&mac(1)));
    }

    #[test]
    fn empty_confirmation_fails() {
        let mut ap = AccessPoint::new("ccnet", Security::Wpa3, 11);
        let now = Instant::now();

        ap.handle(&AuthMessage::SaeCommit { mac: mac(1) }, now);

        let reply = ap
            .handle(
                &AuthMessage::SaeConfirm {
                    mac: mac(1),
                    challenge: None,
                    confirm: Some(String::new()),
                },
                now,
            )
            .unwrap();

        assert!(matches!(reply, AuthMessage::Associated { success: false, .. }));
        assert!(!ap.is_associated(&mac(1)));
    }

    #[test]
    fn confirm_without_commit_is_refused() {
        let mut ap = AccessPoint::new("ccnet", Security::Wpa3, 11);

        let reply = ap
            .handle(
                &AuthMessage::SaeConfirm {
                    mac: mac(1),
                    challenge: None,
                    confirm: Some("x".into()),
                },
                Instant::now(),
            )
            .unwrap();

        assert!(matches!(reply, AuthMessage::Associated { success: false, .. }));
    }

    #[test]
    fn open_refused_on_wpa3_network() {
        let mut ap = AccessPoint::new("ccnet", Security::Wpa3, 11);

        let reply = ap
            .handle(&AuthMessage::Open { mac: mac(1) }, Instant::now())
            .unwrap();

        assert!(matches!(reply, AuthMessage::Associated { success: false, .. }));
    }

    #[test]
    fn beacon_carries_the_advertised_identity() {
        let ap = AccessPoint::new("ccnet", Security::Wpa3, 11);

        let text = serde_json::to_string(&ap.beacon()).unwrap();
        assert!(text.contains(r#""type":"BEACON""#));
        assert!(text.contains(r#""ssid":"ccnet""#));
        assert!(text.contains(r#""security":"WPA3""#));
    }
}

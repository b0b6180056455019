//! Typed wire messages, one enum per protocol tag.
//!
//! All payloads are internally tagged JSON (`"type": "..."`). Deserialization
//! fails closed: a payload with an unknown `type` is an error for the caller
//! to count, never a crash. Aliased type strings (`ws_connect`, `http_request`,
//! ...) are accepted on input; the short form is emitted.

use core::net::Ipv4Addr;

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{Error, MacAddr};

/// Serializes a message for the medium.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, Error> {
    Ok(serde_json::to_string(msg)?)
}

/// Deserializes a payload received from the medium.
pub fn decode<T: DeserializeOwned>(payload: &str) -> Result<T, Error> {
    Ok(serde_json::from_str(payload)?)
}

/// The bare-string identity probe on the generic tag.
pub const WHOAMI: &str = "whoami?";

/// The reply to [`WHOAMI`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WhoamiReply {
    pub id: u32,
    pub hostname: String,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
}

/// A service a node announces: name plus the port it serves on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub port: u16,
}

/// Transport capabilities advertised in discovery responses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protocols {
    pub udp: bool,
}

/// Messages on the discovery tags (`ccnet_discovery`,
/// `network_adapter_discovery`).
///
/// The responding node's id is not a field: it is the `sender` of the frame
/// the response arrives in.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryMessage {
    Query,
    Response {
        id: u32,
        hostname: String,
        fqdn: String,
        mac: MacAddr,
        ip: Ipv4Addr,
        services: Vec<Service>,
        routes: Vec<String>,
        ts: u64,
        protocols: Protocols,
    },
    Announce {
        id: u32,
        hostname: String,
        ip: Ipv4Addr,
        mac: MacAddr,
        services: Vec<Service>,
        ts: u64,
    },
    IdQuery {
        ip: Ipv4Addr,
    },
    IdResponse {
        ip: Ipv4Addr,
        mac: MacAddr,
        hostname: String,
    },
    HostnameQuery {
        hostname: String,
    },
    HostnameResponse {
        hostname: String,
        ip: Ipv4Addr,
    },
}

/// Messages on the `ccnet_dns` tag. A-records only; TTL in seconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DnsMessage {
    Query { hostname: String },
    Response {
        hostname: String,
        ip: Ipv4Addr,
        ttl: u64,
    },
}

/// Messages on the `ccnet_arp` tag.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArpMessage {
    Request { target_ip: Ipv4Addr },
    Reply {
        ip: Ipv4Addr,
        mac: MacAddr,
        hostname: String,
    },
}

/// Messages on the `ping_<ip>` / `pong_<ip>` tag pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PingMessage {
    Ping {
        seq: u32,
        timestamp: u64,
        source: Ipv4Addr,
    },
    Pong {
        seq: u32,
        timestamp: u64,
        source: Ipv4Addr,
    },
}

/// Messages on the `ccnet_http` tag. Correlation between request and
/// response is by `id` alone, never by arrival order.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HttpMessage {
    #[serde(alias = "http_request")]
    Request {
        id: u64,
        method: String,
        path: String,
        port: u16,
        headers: BTreeMap<String, String>,
        body: String,
    },
    #[serde(alias = "http_response")]
    Response {
        id: u64,
        code: u16,
        headers: BTreeMap<String, String>,
        body: String,
        ts: u64,
    },
}

/// Messages on the `ccnet_ws` tag.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    #[serde(alias = "ws_connect")]
    Connect {
        #[serde(rename = "connectionId")]
        connection_id: String,
        url: String,
    },
    #[serde(alias = "ws_accept")]
    Accept {
        #[serde(rename = "connectionId")]
        connection_id: String,
    },
    #[serde(alias = "ws_reject")]
    Reject {
        #[serde(rename = "connectionId")]
        connection_id: String,
        reason: String,
    },
    #[serde(alias = "ws_data")]
    Data {
        #[serde(rename = "connectionId")]
        connection_id: String,
        data: String,
    },
    #[serde(alias = "ws_close")]
    Close {
        #[serde(rename = "connectionId")]
        connection_id: String,
    },
}

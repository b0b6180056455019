#![allow(async_fn_in_trait)]
#![warn(clippy::large_futures)]

use core::fmt::{self, Display};

pub mod identity;
pub mod msg;
pub mod tag;
pub mod udp;

pub use identity::{MacAddr, NodeIdentity, ProtocolTags};
pub use tag::Tag;

#[derive(Debug)]
pub enum Error {
    Json(serde_json::Error),
    InvalidMac,
    PayloadTooLarge,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(err) => write!(f, "JSON error: {}", err),
            Self::InvalidMac => write!(f, "Invalid MAC address"),
            Self::PayloadTooLarge => write!(f, "Payload too large"),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

/// Millis since the Unix epoch; carried in wire messages for diagnostics.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

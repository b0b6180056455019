#![allow(async_fn_in_trait)]
#![warn(clippy::large_futures)]

use core::fmt::{self, Debug, Display};

use embassy_sync::blocking_mutex::raw::RawMutex;

use serde::{Deserialize, Serialize};

pub mod hub;
pub mod udp;

/// The integer address of a participant on the medium.
pub type NodeId = u32;

/// One datagram as seen on the medium: who sent it, the protocol tag that
/// selects a handler on the receiver, and the (structured-text) payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub sender: NodeId,
    pub tag: String,
    pub payload: String,
}

impl Frame {
    pub fn new(sender: NodeId, tag: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            sender,
            tag: tag.into(),
            payload: payload.into(),
        }
    }
}

/// Associated error type for the link traits.
pub trait ErrorType {
    type Error: Debug + Display;
}

impl<T> ErrorType for &mut T
where
    T: ErrorType,
{
    type Error = T::Error;
}

/// The transmit half of a link: unicast to a node-id, or broadcast to
/// everybody in range.
pub trait LinkSend: ErrorType {
    async fn unicast(&mut self, dest: NodeId, tag: &str, payload: &str)
        -> Result<(), Self::Error>;

    async fn broadcast(&mut self, tag: &str, payload: &str) -> Result<(), Self::Error>;
}

/// The receive half of a link.
///
/// Frames from sender A carrying the same tag are delivered in send order;
/// frames from different senders may interleave.
pub trait LinkRecv: ErrorType {
    async fn receive(&mut self) -> Result<Frame, Self::Error>;
}

impl<T> LinkSend for &mut T
where
    T: LinkSend,
{
    async fn unicast(
        &mut self,
        dest: NodeId,
        tag: &str,
        payload: &str,
    ) -> Result<(), Self::Error> {
        (**self).unicast(dest, tag, payload).await
    }

    async fn broadcast(&mut self, tag: &str, payload: &str) -> Result<(), Self::Error> {
        (**self).broadcast(tag, payload).await
    }
}

impl<T> LinkRecv for &mut T
where
    T: LinkRecv,
{
    async fn receive(&mut self) -> Result<Frame, Self::Error> {
        (**self).receive().await
    }
}

/// A `RawMutex` over `std::sync::Mutex`, for parameterizing the embassy-sync
/// primitives on hosted targets.
pub struct StdRawMutex(std::sync::Mutex<()>);

unsafe impl RawMutex for StdRawMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self(std::sync::Mutex::new(()));

    fn lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.0.lock().unwrap();

        f()
    }
}

#[derive(Debug)]
pub enum LinkError {
    Io(std::io::Error),
    InvalidFrame,
}

impl Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "IO error: {}", err),
            Self::InvalidFrame => write!(f, "Invalid frame"),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

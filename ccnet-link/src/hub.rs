//! An in-process implementation of the medium: every attached endpoint sees
//! every broadcast and every unicast addressed to its node-id.
//!
//! The hub is what tests and single-process multi-node deployments run on;
//! separate OS processes use [`crate::udp`] instead. Per sender-endpoint the
//! hub preserves delivery order, matching the ordering guarantee of the
//! medium.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Channel;

use log::warn;

use crate::{ErrorType, Frame, LinkRecv, LinkSend, NodeId};

/// Frames queued per endpoint before the hub starts dropping. The medium is
/// lossy; a slow receiver loses frames rather than stalling the senders.
pub const QUEUE_DEPTH: usize = 64;

struct Port<M>
where
    M: RawMutex,
{
    id: usize,
    node: NodeId,
    queue: Arc<Channel<M, Frame, QUEUE_DEPTH>>,
}

struct Shared<M>
where
    M: RawMutex,
{
    ports: Mutex<Vec<Port<M>>>,
    next_port: AtomicUsize,
}

/// The medium itself. Cheap to clone; all clones refer to the same set of
/// attached endpoints.
pub struct Hub<M>(Arc<Shared<M>>)
where
    M: RawMutex;

impl<M> Default for Hub<M>
where
    M: RawMutex,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Clone for Hub<M>
where
    M: RawMutex,
{
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<M> Hub<M>
where
    M: RawMutex,
{
    pub fn new() -> Self {
        Self(Arc::new(Shared {
            ports: Mutex::new(Vec::new()),
            next_port: AtomicUsize::new(0),
        }))
    }

    /// Attaches a new endpoint for `node`. A node may attach more than one
    /// endpoint; unicasts addressed to the node are delivered to all of them.
    pub fn attach(&self, node: NodeId) -> HubLink<M> {
        let queue = Arc::new(Channel::new());
        let id = self.0.next_port.fetch_add(1, Ordering::Relaxed);

        self.0.ports.lock().unwrap().push(Port {
            id,
            node,
            queue: queue.clone(),
        });

        HubLink {
            shared: self.0.clone(),
            port: id,
            node,
            queue,
        }
    }
}

/// One endpoint on the hub. Detaches on drop.
pub struct HubLink<M>
where
    M: RawMutex,
{
    shared: Arc<Shared<M>>,
    port: usize,
    node: NodeId,
    queue: Arc<Channel<M, Frame, QUEUE_DEPTH>>,
}

impl<M> HubLink<M>
where
    M: RawMutex,
{
    pub fn node(&self) -> NodeId {
        self.node
    }

    fn deliver(&self, dest: Option<NodeId>, tag: &str, payload: &str) {
        let frame = Frame::new(self.node, tag, payload);

        for port in self.shared.ports.lock().unwrap().iter() {
            // The sending endpoint never hears its own transmission
            if port.id == self.port {
                continue;
            }

            if dest.map(|dest| dest == port.node).unwrap_or(true)
                && port.queue.try_send(frame.clone()).is_err()
            {
                warn!(
                    "hub: endpoint queue full, dropping frame for node {} (tag {})",
                    port.node, tag
                );
            }
        }
    }
}

impl<M> Drop for HubLink<M>
where
    M: RawMutex,
{
    fn drop(&mut self) {
        self.shared
            .ports
            .lock()
            .unwrap()
            .retain(|port| port.id != self.port);
    }
}

impl<M> ErrorType for HubLink<M>
where
    M: RawMutex,
{
    type Error = core::convert::Infallible;
}

impl<M> LinkSend for HubLink<M>
where
    M: RawMutex,
{
    async fn unicast(
        &mut self,
        dest: NodeId,
        tag: &str,
        payload: &str,
    ) -> Result<(), Self::Error> {
        self.deliver(Some(dest), tag, payload);

        Ok(())
    }

    async fn broadcast(&mut self, tag: &str, payload: &str) -> Result<(), Self::Error> {
        self.deliver(None, tag, payload);

        Ok(())
    }
}

impl<M> LinkRecv for HubLink<M>
where
    M: RawMutex,
{
    async fn receive(&mut self) -> Result<Frame, Self::Error> {
        Ok(self.queue.receive().await)
    }
}

#[cfg(test)]
mod tests {
    use futures_lite::future::block_on;

    use crate::StdRawMutex;

    use super::*;

    #[test]
    fn unicast_reaches_only_the_addressee() {
        block_on(async {
            let hub = Hub::<StdRawMutex>::new();

            let mut a = hub.attach(1);
            let mut b = hub.attach(2);
            let c = hub.attach(3);

            a.unicast(2, "t", "hello").await.unwrap();

            let frame = b.receive().await.unwrap();
            assert_eq!(frame.sender, 1);
            assert_eq!(frame.payload, "hello");

            assert!(c.queue.try_receive().is_err());
        });
    }

    #[test]
    fn broadcast_skips_the_sender() {
        block_on(async {
            let hub = Hub::<StdRawMutex>::new();

            let mut a = hub.attach(1);
            let b = hub.attach(2);

            a.broadcast("t", "x").await.unwrap();

            assert!(a.queue.try_receive().is_err());
            assert_eq!(b.queue.try_receive().unwrap().payload, "x");
        });
    }

    #[test]
    fn per_sender_order_is_preserved() {
        block_on(async {
            let hub = Hub::<StdRawMutex>::new();

            let mut a = hub.attach(1);
            let mut b = hub.attach(2);

            for i in 0..10 {
                a.unicast(2, "t", &i.to_string()).await.unwrap();
            }

            for i in 0..10 {
                assert_eq!(b.receive().await.unwrap().payload, i.to_string());
            }
        });
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        block_on(async {
            let hub = Hub::<StdRawMutex>::new();

            let mut a = hub.attach(1);
            let b = hub.attach(2);

            for _ in 0..QUEUE_DEPTH + 5 {
                a.unicast(2, "t", "x").await.unwrap();
            }

            let mut received = 0;
            while b.queue.try_receive().is_ok() {
                received += 1;
            }

            assert_eq!(received, QUEUE_DEPTH);
        });
    }

    #[test]
    fn second_endpoint_of_a_node_also_hears_unicasts() {
        block_on(async {
            let hub = Hub::<StdRawMutex>::new();

            let mut a = hub.attach(1);
            let mut b_daemon = hub.attach(2);
            let mut b_client = hub.attach(2);

            a.unicast(2, "t", "both").await.unwrap();

            assert_eq!(b_daemon.receive().await.unwrap().payload, "both");
            assert_eq!(b_client.receive().await.unwrap().payload, "both");
        });
    }
}

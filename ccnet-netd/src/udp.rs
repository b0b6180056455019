//! The UDP subsystem: ephemeral-port allocation, the socket table, bounded
//! per-socket receive buffers, and incoming-packet dispatch.
//!
//! Pure state driven by the daemon task; blocked receivers are woken through
//! a per-socket signal.

use core::net::Ipv4Addr;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::signal::Signal;

use log::debug;

use ccnet_proto::udp::{NetworkPacket, MAX_PAYLOAD};

use crate::NetError;

/// First and last auto-assignable port; everything below is explicit-bind
/// territory.
pub const EPHEMERAL_START: u16 = 49152;
pub const EPHEMERAL_END: u16 = 65535;

/// One queued datagram, as handed to `receive`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    pub data: String,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub ts: u64,
}

struct SocketState<M>
where
    M: RawMutex + Send + Sync,
{
    buffer: VecDeque<Datagram>,
    cap: usize,
    notify: Arc<Signal<M, ()>>,
}

/// Subsystem-wide counters; `packets_dropped` covers buffer overflow,
/// unbound ports and malformed packets alike.
#[derive(Clone, Copy, Debug, Default)]
pub struct UdpStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active_sockets: usize,
}

pub struct UdpSubsystem<M>
where
    M: RawMutex + Send + Sync,
{
    sockets: HashMap<u16, SocketState<M>>,
    next_port: u16,
    buffer_size: usize,
    verify_checksum: bool,
    pub stats: UdpStats,
}

impl<M> UdpSubsystem<M>
where
    M: RawMutex + Send + Sync,
{
    pub fn new(buffer_size: usize, verify_checksum: bool) -> Self {
        Self {
            sockets: HashMap::new(),
            next_port: EPHEMERAL_START,
            buffer_size,
            verify_checksum,
            stats: UdpStats::default(),
        }
    }

    /// Claims `port` (0 = auto-assign) and returns the bound port plus the
    /// signal that fires when a datagram arrives for it.
    pub fn open(
        &mut self,
        port: u16,
        buffer_size: Option<usize>,
    ) -> Result<(u16, Arc<Signal<M, ()>>), NetError> {
        let port = if port == 0 {
            self.alloc_ephemeral()?
        } else if self.sockets.contains_key(&port) {
            return Err(NetError::AddrInUse);
        } else {
            port
        };

        let notify = Arc::new(Signal::new());

        self.sockets.insert(
            port,
            SocketState {
                buffer: VecDeque::new(),
                cap: buffer_size.unwrap_or(self.buffer_size),
                notify: notify.clone(),
            },
        );
        self.stats.active_sockets = self.sockets.len();

        Ok((port, notify))
    }

    /// Moves a socket to `to`. The new port is claimed before the old one
    /// is released, so two sockets can never trade through a shared port;
    /// the first claim wins and the loser sees `AddrInUse`.
    pub fn rebind(&mut self, from: u16, to: u16) -> Result<(), NetError> {
        if from == to {
            return Ok(());
        }

        if self.sockets.contains_key(&to) {
            return Err(NetError::AddrInUse);
        }

        let state = self.sockets.remove(&from).ok_or(NetError::Closed)?;
        self.sockets.insert(to, state);

        Ok(())
    }

    /// Releases the port and flushes its buffer.
    pub fn close(&mut self, port: u16) -> bool {
        let existed = self.sockets.remove(&port).is_some();
        self.stats.active_sockets = self.sockets.len();

        existed
    }

    pub fn is_bound(&self, port: u16) -> bool {
        self.sockets.contains_key(&port)
    }

    pub fn bound_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.sockets.keys().copied()
    }

    /// Pops the oldest buffered datagram for `port`.
    pub fn try_recv(&mut self, port: u16) -> Result<Option<Datagram>, NetError> {
        self.sockets
            .get_mut(&port)
            .map(|socket| socket.buffer.pop_front())
            .ok_or(NetError::Closed)
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes as u64;
    }

    /// Delivers one incoming packet to the socket bound on its destination
    /// port. Malformed packets, unbound ports and full buffers all count as
    /// drops; none of them are surfaced.
    pub fn dispatch(&mut self, packet: &NetworkPacket) {
        let udp = &packet.udp_packet;

        if udp.data.len() > MAX_PAYLOAD {
            debug!("udp: dropping oversized packet ({} bytes)", udp.data.len());
            self.stats.packets_dropped += 1;
            return;
        }

        if self.verify_checksum && !udp.verify() {
            debug!("udp: dropping packet with bad checksum on port {}", udp.dest_port);
            self.stats.packets_dropped += 1;
            return;
        }

        let Some(socket) = self.sockets.get_mut(&udp.dest_port) else {
            debug!("udp: no socket bound on port {}", udp.dest_port);
            self.stats.packets_dropped += 1;
            return;
        };

        if socket.buffer.len() >= socket.cap {
            self.stats.packets_dropped += 1;
            return;
        }

        socket.buffer.push_back(Datagram {
            data: udp.data.clone(),
            src_ip: packet.source_ip,
            src_port: udp.source_port,
            ts: udp.timestamp,
        });

        self.stats.packets_received += 1;
        self.stats.bytes_received += udp.data.len() as u64;

        socket.notify.signal(());
    }

    /// Scans forward from `next_port`, wrapping at the end of the range,
    /// for at most one full range worth of attempts.
    fn alloc_ephemeral(&mut self) -> Result<u16, NetError> {
        const ATTEMPTS: usize = (EPHEMERAL_END - EPHEMERAL_START) as usize + 1;

        for _ in 0..ATTEMPTS {
            let candidate = self.next_port;

            self.next_port = if self.next_port == EPHEMERAL_END {
                EPHEMERAL_START
            } else {
                self.next_port + 1
            };

            if !self.sockets.contains_key(&candidate) {
                return Ok(candidate);
            }
        }

        Err(NetError::PortExhausted)
    }
}

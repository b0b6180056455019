//! The client half: INIT → DISCOVERING → REQUESTING → BOUND → RENEWING.
//!
//! The client owns a link endpoint of its own and drives the whole
//! negotiation with broadcast requests and a select-with-deadline receive,
//! retrying each phase a bounded number of times.

use core::net::Ipv4Addr;

use embassy_futures::select::{select, Either};
use embassy_time::{Duration, Instant, Timer};

use log::{info, warn};

use ccnet_link::{LinkRecv, LinkSend};
use ccnet_proto::{msg, MacAddr};

use crate::{DhcpMessage, Error, Settings, TAG};

/// Where the client currently stands in the negotiation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Init,
    Discovering,
    Requesting,
    Bound,
    Renewing,
}

#[derive(Clone, Debug)]
struct Binding {
    settings: Settings,
    acquired: Instant,
}

pub struct Client {
    pub mac: MacAddr,
    pub hostname: String,
    /// Per-phase reply deadline.
    pub timeout: Duration,
    /// Attempts per phase before giving up.
    pub retries: usize,
    state: State,
    binding: Option<Binding>,
}

impl Client {
    pub fn new(mac: MacAddr, hostname: impl Into<String>) -> Self {
        Self {
            mac,
            hostname: hostname.into(),
            timeout: Duration::from_secs(10),
            retries: 3,
            state: State::Init,
            binding: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn settings(&self) -> Option<&Settings> {
        self.binding.as_ref().map(|binding| &binding.settings)
    }

    /// Runs discover+request until bound.
    pub async fn bind<L>(&mut self, link: &mut L) -> Result<Settings, Error<L::Error>>
    where
        L: LinkSend + LinkRecv,
    {
        let mut last_nak = None;

        for _ in 0..self.retries {
            let offer = self.discover(link).await?;

            match self.request(link, offer).await? {
                Ok(settings) => {
                    self.state = State::Bound;
                    self.binding = Some(Binding {
                        settings: settings.clone(),
                        acquired: Instant::now(),
                    });

                    info!("dhcp client: bound to {}", settings.ip);

                    return Ok(settings);
                }
                Err(reason) => {
                    warn!("dhcp client: request refused: {reason}");
                    last_nak = Some(reason);
                }
            }
        }

        Err(last_nak.map(Error::Nak).unwrap_or(Error::Timeout))
    }

    /// Keeps a bound lease alive, renewing past the halfway point. Returns
    /// when a renewal goes unanswered, leaving rebinding to the caller.
    pub async fn keep<L>(&mut self, link: &mut L) -> Result<(), Error<L::Error>>
    where
        L: LinkSend + LinkRecv,
    {
        loop {
            let binding = self.binding.as_ref().ok_or(Error::NotBound)?;
            let duration = Duration::from_secs(binding.settings.lease_time_secs);

            if Instant::now() - binding.acquired >= duration / 2 {
                self.state = State::Renewing;

                let ip = binding.settings.ip;
                match self.request(link, ip).await? {
                    Ok(settings) => {
                        self.state = State::Bound;
                        self.binding = Some(Binding {
                            settings,
                            acquired: Instant::now(),
                        });
                    }
                    Err(reason) => {
                        warn!("dhcp client: renewal refused: {reason}");
                        break;
                    }
                }
            } else {
                Timer::after(Duration::from_secs(60)).await;
            }
        }

        Ok(())
    }

    /// Releases the bound address and returns to `Init`.
    pub async fn release<L>(&mut self, link: &mut L) -> Result<(), Error<L::Error>>
    where
        L: LinkSend + LinkRecv,
    {
        let binding = self.binding.take().ok_or(Error::NotBound)?;

        let release = DhcpMessage::Release {
            mac: self.mac,
            ip: binding.settings.ip,
        };

        link.broadcast(TAG, &msg::encode(&release)?)
            .await
            .map_err(Error::Io)?;

        self.state = State::Init;

        Ok(())
    }

    async fn discover<L>(&mut self, link: &mut L) -> Result<Ipv4Addr, Error<L::Error>>
    where
        L: LinkSend + LinkRecv,
    {
        self.state = State::Discovering;

        for _ in 0..self.retries {
            let xid = rand::random();

            let discover = DhcpMessage::Discover {
                xid,
                mac: self.mac,
                hostname: self.hostname.clone(),
            };

            link.broadcast(TAG, &msg::encode(&discover)?)
                .await
                .map_err(Error::Io)?;

            if let Some(DhcpMessage::Offer { ip, .. }) =
                recv_reply(link, xid, self.timeout).await?
            {
                info!("dhcp client: offered {ip}");

                return Ok(ip);
            }

            info!("dhcp client: no offer, retrying");
        }

        Err(Error::Timeout)
    }

    /// One REQUEST phase; `Ok(Err(reason))` is a NAK.
    async fn request<L>(
        &mut self,
        link: &mut L,
        requested_ip: Ipv4Addr,
    ) -> Result<Result<Settings, String>, Error<L::Error>>
    where
        L: LinkSend + LinkRecv,
    {
        self.state = State::Requesting;

        for _ in 0..self.retries {
            let xid = rand::random();

            let request = DhcpMessage::Request {
                xid,
                mac: self.mac,
                hostname: self.hostname.clone(),
                requested_ip,
            };

            link.broadcast(TAG, &msg::encode(&request)?)
                .await
                .map_err(Error::Io)?;

            match recv_reply(link, xid, self.timeout).await? {
                Some(ref ack @ DhcpMessage::Ack { .. }) => {
                    return Ok(Ok(Settings::from_ack(ack).unwrap()));
                }
                Some(DhcpMessage::Nak { reason, .. }) => {
                    return Ok(Err(reason));
                }
                _ => continue,
            }
        }

        Err(Error::Timeout)
    }
}

/// Waits for a DHCP reply carrying `xid`, discarding everything else, until
/// the deadline passes.
async fn recv_reply<L>(
    link: &mut L,
    xid: u32,
    timeout: Duration,
) -> Result<Option<DhcpMessage>, Error<L::Error>>
where
    L: LinkRecv,
{
    let deadline = Instant::now() + timeout;

    loop {
        let frame = match select(link.receive(), Timer::at(deadline)).await {
            Either::First(result) => result.map_err(Error::Io)?,
            Either::Second(_) => return Ok(None),
        };

        if frame.tag != TAG {
            continue;
        }

        let reply: DhcpMessage = match msg::decode(&frame.payload) {
            Ok(reply) => reply,
            Err(_) => continue,
        };

        let matches = match &reply {
            DhcpMessage::Offer { xid: got, .. }
            | DhcpMessage::Ack { xid: got, .. }
            | DhcpMessage::Nak { xid: got, .. } => *got == xid,
            _ => false,
        };

        if matches {
            return Ok(Some(reply));
        }
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::select::{select, Either};
    use embassy_time::{Duration, Instant};

    use futures_lite::future::block_on;

    use ccnet_link::hub::Hub;
    use ccnet_link::StdRawMutex;

    use crate::server::Server;

    use super::*;

    async fn serve(hub: &Hub<StdRawMutex>, server: &mut Server) {
        let mut link = hub.attach(100);

        loop {
            let frame = link.receive().await.unwrap();
            if frame.tag != TAG {
                continue;
            }

            let Ok(request) = msg::decode::<DhcpMessage>(&frame.payload) else {
                continue;
            };

            if let Some(reply) = server.handle(&request, Instant::now()) {
                link.unicast(frame.sender, TAG, &msg::encode(&reply).unwrap())
                    .await
                    .unwrap();
            }
        }
    }

    fn test_server() -> Server {
        Server::new(
            Ipv4Addr::new(10, 0, 1, 1),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(10, 0, 1, 1),
            vec![Ipv4Addr::new(10, 0, 1, 1)],
            Ipv4Addr::new(10, 0, 1, 100),
            Ipv4Addr::new(10, 0, 1, 101),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn client_binds_against_a_live_server() {
        block_on(async {
            let hub = Hub::<StdRawMutex>::new();
            let mut server = test_server();

            let mut link = hub.attach(1);
            let mut client = Client::new(MacAddr::for_node(1), "alpha");
            client.timeout = Duration::from_millis(500);

            let settings = match select(client.bind(&mut link), serve(&hub, &mut server)).await
            {
                Either::First(result) => result.unwrap(),
                Either::Second(_) => unreachable!(),
            };

            assert_eq!(settings.ip, Ipv4Addr::new(10, 0, 1, 100));
            assert_eq!(settings.gateway, Ipv4Addr::new(10, 0, 1, 1));
            assert_eq!(client.state(), State::Bound);
        });
    }

    #[test]
    fn release_returns_to_init() {
        block_on(async {
            let hub = Hub::<StdRawMutex>::new();
            let mut server = test_server();

            let mut link = hub.attach(1);
            let mut client = Client::new(MacAddr::for_node(1), "alpha");
            client.timeout = Duration::from_millis(500);

            match select(client.bind(&mut link), serve(&hub, &mut server)).await {
                Either::First(result) => {
                    result.unwrap();
                }
                Either::Second(_) => unreachable!(),
            }

            client.release(&mut link).await.unwrap();

            assert_eq!(client.state(), State::Init);
            assert!(client.settings().is_none());
        });
    }

    #[test]
    fn unanswered_discover_times_out() {
        block_on(async {
            let hub = Hub::<StdRawMutex>::new();

            let mut link = hub.attach(1);
            let mut client = Client::new(MacAddr::for_node(1), "alpha");
            client.timeout = Duration::from_millis(50);
            client.retries = 2;

            let started = Instant::now();
            let result = client.bind(&mut link).await;

            assert!(matches!(result, Err(Error::Timeout)));
            assert!(Instant::now() - started >= Duration::from_millis(100));
        });
    }
}

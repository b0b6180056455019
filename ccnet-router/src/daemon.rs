//! The router daemon: wires the protocol core to the medium, the 1-second
//! maintenance tick and the beacon timer, and owns the persistence files.

use embassy_futures::select::{select3, Either3};
use embassy_time::{Duration, Instant, Timer};

use log::{info, warn};

use ccnet_dhcp::server::LeaseRecord;
use ccnet_link::{LinkRecv, LinkSend};
use ccnet_netd::persist::{read_json, write_json_atomic, write_pid_file, Paths};

use crate::config::RouterConfig;
use crate::router::Router;
use crate::{RouterError, RouterStats};

const TICK: Duration = Duration::from_secs(1);
const STATS_PERIOD: Duration = Duration::from_secs(10);

pub struct RouterDaemon<L> {
    core: Router,
    link: L,
    paths: Paths,
    beacon_interval: Duration,
    next_beacon: Instant,
    next_stats_write: Instant,
}

impl<L> RouterDaemon<L>
where
    L: LinkSend + LinkRecv,
{
    pub fn new(config: RouterConfig, link: L) -> Result<Self, RouterError> {
        let firewall = config.load_firewall()?;
        let paths = Paths::new(config.root.clone());
        let beacon_interval = Duration::from_millis(config.beacon_interval_ms.max(10));

        let now = Instant::now();

        Ok(Self {
            core: Router::new(&config, firewall),
            link,
            paths,
            beacon_interval,
            next_beacon: now,
            next_stats_write: now + STATS_PERIOD,
        })
    }

    pub fn core(&self) -> &Router {
        &self.core
    }

    pub async fn run(&mut self) -> Result<(), RouterError> {
        self.startup()?;

        info!(
            "routerd: running as node {} on {}",
            self.core.node_id(),
            self.core.lan_ip()
        );

        let mut next_tick = Instant::now() + TICK;

        loop {
            let event = select3(
                self.link.receive(),
                Timer::at(next_tick),
                Timer::at(self.next_beacon),
            )
            .await;

            let stop = match event {
                Either3::First(Ok(frame)) => {
                    let outgoing = self.core.handle_frame(&frame, Instant::now());

                    for out in outgoing {
                        self.transmit(out.dest, &out.tag, &out.payload).await;
                    }

                    false
                }
                Either3::First(Err(err)) => {
                    warn!("routerd: link receive failed: {err}");
                    false
                }
                Either3::Second(_) => {
                    next_tick += TICK;
                    self.on_tick()
                }
                Either3::Third(_) => {
                    self.beacon().await;
                    false
                }
            };

            if stop {
                break;
            }
        }

        self.shutdown();

        Ok(())
    }

    fn startup(&mut self) -> Result<(), RouterError> {
        self.paths.ensure_runtime_dirs()?;

        if self.check_stop_signals() {
            return Err(RouterError::StopSignal);
        }

        if self.paths.router_pid_file().exists() {
            return Err(RouterError::AlreadyRunning);
        }

        write_pid_file(&self.paths.router_pid_file(), self.core.node_id())?;

        // Leases survive restarts; their remaining lifetime was persisted
        if let Some(records) = read_json::<Vec<LeaseRecord>>(&self.paths.leases_file()) {
            self.core.dhcp.restore(records, Instant::now());
            info!(
                "routerd: restored {} leases",
                self.core.dhcp.active_leases()
            );
        }

        Ok(())
    }

    fn shutdown(&mut self) {
        info!("routerd: stopping");

        self.persist_leases();
        self.write_stats();

        if let Err(err) = std::fs::remove_file(self.paths.router_pid_file()) {
            warn!("routerd: could not remove PID file: {err}");
        }
    }

    /// Returns true when a stop signal was consumed.
    fn on_tick(&mut self) -> bool {
        if self.check_stop_signals() {
            return true;
        }

        let now = Instant::now();

        self.core.sweep(now);

        if self.core.leases_dirty {
            self.persist_leases();
            self.core.leases_dirty = false;
        }

        if now >= self.next_stats_write {
            self.write_stats();
            self.next_stats_write = now + STATS_PERIOD;
        }

        false
    }

    /// The local stop file is consumed; the global one is shared and only
    /// observed.
    fn check_stop_signals(&self) -> bool {
        let mut stop = false;

        if self.paths.router_stop_file().exists() {
            if let Err(err) = std::fs::remove_file(self.paths.router_stop_file()) {
                warn!("routerd: could not consume stop file: {err}");
            }
            stop = true;
        }

        if self.paths.stop_all_file().exists() {
            stop = true;
        }

        stop
    }

    async fn beacon(&mut self) {
        self.next_beacon = Instant::now() + self.beacon_interval;

        let Some(ap) = &self.core.ap else {
            // No wireless interface: check back rarely
            self.next_beacon = Instant::now() + Duration::from_secs(3600);
            return;
        };

        let Ok(payload) = serde_json::to_string(&ap.beacon()) else {
            return;
        };

        if self.link.broadcast("BEACON", &payload).await.is_ok() {
            self.core.stats.beacons_sent += 1;
        }
    }

    async fn transmit(&mut self, dest: Option<ccnet_link::NodeId>, tag: &str, payload: &str) {
        let result = match dest {
            Some(node) => self.link.unicast(node, tag, payload).await,
            None => self.link.broadcast(tag, payload).await,
        };

        if let Err(err) = result {
            warn!("routerd: send on tag {tag} failed: {err}");
        }
    }

    fn persist_leases(&self) {
        let records = self.core.dhcp.records(Instant::now());

        if let Err(err) = write_json_atomic(&self.paths.leases_file(), &records) {
            warn!("routerd: lease persistence failed: {err}");
        }
    }

    fn write_stats(&self) {
        let stats: RouterStats = self.core.stats;

        if let Err(err) = write_json_atomic(&self.paths.router_stats_file(), &stats) {
            warn!("routerd: stats write failed: {err}");
        }
    }
}

//! Router end-to-end scenarios: a live router daemon on the hub, DHCP
//! clients negotiating against it, raw endpoints probing the forwarding
//! plane.

use core::net::Ipv4Addr;

use std::path::PathBuf;

use embassy_futures::select::{select, Either};
use embassy_time::{Duration, Timer};

use futures_lite::future::block_on;

use ccnet_dhcp::client::Client;
use ccnet_dhcp::Error as DhcpError;
use ccnet_link::hub::{Hub, HubLink};
use ccnet_link::{LinkRecv, LinkSend, StdRawMutex};
use ccnet_proto::udp::{NetworkPacket, UdpPacket};
use ccnet_proto::MacAddr;
use ccnet_router::{RouterConfig, RouterDaemon};

const ROUTER_NODE: u32 = 100;

fn temp_root(tag: &str) -> PathBuf {
    let _ = env_logger::builder().is_test(true).try_init();

    let root = std::env::temp_dir().join(format!(
        "ccnet-router-test-{tag}-{}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&root);
    std::fs::create_dir_all(&root).unwrap();

    root
}

fn router_config(tag: &str) -> RouterConfig {
    let mut config = RouterConfig::defaults(ROUTER_NODE);
    config.root = temp_root(tag);
    config.wan_ip = Some(Ipv4Addr::new(203, 0, 113, 7));
    config.wan_gateway = Some(Ipv4Addr::new(203, 0, 113, 1));
    config.dhcp_range_end = Ipv4Addr::new(10, 0, 1, 102);
    config.beacon_interval_ms = 50;

    config
}

fn dhcp_client(node: u32) -> Client {
    let mut client = Client::new(MacAddr::for_node(node), format!("cc-{node}"));
    client.timeout = Duration::from_millis(300);
    client.retries = 2;

    client
}

fn run_router<F>(config: RouterConfig, hub: &Hub<StdRawMutex>, test: F)
where
    F: core::future::Future<Output = ()>,
{
    let link = hub.attach(ROUTER_NODE);
    let mut daemon = RouterDaemon::new(config, link).unwrap();

    block_on(async {
        match select(daemon.run(), test).await {
            Either::First(result) => panic!("router exited during the test: {result:?}"),
            Either::Second(()) => {}
        }
    });
}

#[test]
fn s7_dhcp_lease_exhaustion_and_reuse() {
    let hub = Hub::<StdRawMutex>::new();
    let config = router_config("s7");

    run_router(config, &hub, async {
        let mut links: Vec<HubLink<StdRawMutex>> = (1..=4).map(|n| hub.attach(n)).collect();

        // three addresses, three winners
        let mut ips = Vec::new();
        for node in 1..=3u32 {
            let mut client = dhcp_client(node);
            let settings = client.bind(&mut links[(node - 1) as usize]).await.unwrap();
            ips.push(settings.ip);
        }

        let mut unique = ips.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 3);

        // the pool is depleted: the fourth client gets nothing
        let mut d = dhcp_client(4);
        match d.bind(&mut links[3]).await {
            Err(DhcpError::Timeout) | Err(DhcpError::Nak(_)) => {}
            other => panic!("expected exhaustion, got {other:?}"),
        }

        // releasing one address frees it for the waiting client
        let mut a = dhcp_client(1);
        a.bind(&mut links[0]).await.unwrap();
        a.release(&mut links[0]).await.unwrap();

        Timer::after(Duration::from_millis(100)).await;

        let settings = d.bind(&mut links[3]).await.unwrap();
        assert!(ips.contains(&settings.ip));
    });
}

#[test]
fn dhcp_leases_are_persisted() {
    let hub = Hub::<StdRawMutex>::new();
    let config = router_config("persist");
    let leases_file = config.root.join("var/lib/dhcp/leases");

    run_router(config, &hub, async {
        let mut link = hub.attach(1);
        let mut client = dhcp_client(1);

        client.bind(&mut link).await.unwrap();

        // persisted on the next maintenance tick
        Timer::after(Duration::from_millis(1500)).await;

        let text = std::fs::read_to_string(&leases_file).unwrap();
        let records: Vec<ccnet_dhcp::server::LeaseRecord> =
            serde_json::from_str(&text).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mac, MacAddr::for_node(1));
    });
}

fn udp_payload(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16) -> String {
    let packet = NetworkPacket::new(src, dst, UdpPacket::new(sport, dport, "x".into()).unwrap());

    serde_json::to_string(&packet).unwrap()
}

#[test]
fn s8_firewall_blocks_forwarding_on_the_wire() {
    let hub = Hub::<StdRawMutex>::new();
    let config = router_config("s8");

    std::fs::create_dir_all(config.root.join("etc")).unwrap();
    std::fs::write(
        config.root.join("etc/firewall.rules"),
        "FORWARD src=10.0.1.50 DROP\n",
    )
    .unwrap();

    run_router(config, &hub, async {
        let mut sender = hub.attach(1);
        let mut observer = hub.attach(2);

        // blocked source: nothing forwarded
        sender
            .broadcast(
                "ccnet_udp",
                &udp_payload(
                    Ipv4Addr::new(10, 0, 1, 50),
                    5000,
                    Ipv4Addr::new(8, 8, 8, 8),
                    53,
                ),
            )
            .await
            .unwrap();

        let watch = async {
            loop {
                let frame = observer.receive().await.unwrap();
                if frame.sender == ROUTER_NODE && frame.tag == "ccnet_udp" {
                    break frame;
                }
            }
        };

        match select(watch, Timer::after(Duration::from_millis(300))).await {
            Either::First(frame) => panic!("blocked packet was forwarded: {frame:?}"),
            Either::Second(_) => {}
        }

        // a different LAN host is forwarded (and source-translated)
        sender
            .broadcast(
                "ccnet_udp",
                &udp_payload(
                    Ipv4Addr::new(10, 0, 1, 51),
                    5000,
                    Ipv4Addr::new(8, 8, 8, 8),
                    53,
                ),
            )
            .await
            .unwrap();

        let watch = async {
            loop {
                let frame = observer.receive().await.unwrap();
                if frame.sender == ROUTER_NODE && frame.tag == "ccnet_udp" {
                    break frame;
                }
            }
        };

        let frame = match select(watch, Timer::after(Duration::from_secs(1))).await {
            Either::First(frame) => frame,
            Either::Second(_) => panic!("allowed packet was not forwarded"),
        };

        let packet: NetworkPacket = serde_json::from_str(&frame.payload).unwrap();
        assert_eq!(packet.source_ip, Ipv4Addr::new(203, 0, 113, 7));
        assert_eq!(packet.ttl, 63);
    });
}

#[test]
fn beacons_are_broadcast_on_the_wireless_interface() {
    let hub = Hub::<StdRawMutex>::new();
    let config = router_config("beacon");

    run_router(config, &hub, async {
        let mut listener = hub.attach(1);

        let watch = async {
            loop {
                let frame = listener.receive().await.unwrap();
                if frame.tag == "BEACON" {
                    break frame;
                }
            }
        };

        let frame = match select(watch, Timer::after(Duration::from_secs(1))).await {
            Either::First(frame) => frame,
            Either::Second(_) => panic!("no beacon within a second"),
        };

        assert_eq!(frame.sender, ROUTER_NODE);
        assert!(frame.payload.contains(r#""type":"BEACON""#));
        assert!(frame.payload.contains(r#""ssid":"ccnet""#));
    });
}

#[test]
fn renewal_keeps_the_same_address_across_the_wire() {
    let hub = Hub::<StdRawMutex>::new();
    let config = router_config("renew");

    run_router(config, &hub, async {
        let mut link = hub.attach(1);
        let mut client = dhcp_client(1);

        let first = client.bind(&mut link).await.unwrap();

        // a re-bind by the same MAC keeps its lease
        let mut again = dhcp_client(1);
        let second = again.bind(&mut link).await.unwrap();

        assert_eq!(first.ip, second.ip);
    });
}

#[test]
fn nat_idempotence_across_the_wire() {
    let hub = Hub::<StdRawMutex>::new();
    let config = router_config("nat");

    run_router(config, &hub, async {
        let mut sender = hub.attach(1);
        let mut observer = hub.attach(2);

        let mut seen_ports = Vec::new();

        for _ in 0..2 {
            sender
                .broadcast(
                    "ccnet_udp",
                    &udp_payload(
                        Ipv4Addr::new(10, 0, 1, 60),
                        7000,
                        Ipv4Addr::new(8, 8, 8, 8),
                        53,
                    ),
                )
                .await
                .unwrap();

            let watch = async {
                loop {
                    let frame = observer.receive().await.unwrap();
                    if frame.sender == ROUTER_NODE && frame.tag == "ccnet_udp" {
                        break frame;
                    }
                }
            };

            let frame = match select(watch, Timer::after(Duration::from_secs(1))).await {
                Either::First(frame) => frame,
                Either::Second(_) => panic!("packet was not forwarded"),
            };

            let packet: NetworkPacket = serde_json::from_str(&frame.payload).unwrap();
            seen_ports.push(packet.udp_packet.source_port);
        }

        assert_eq!(seen_ports[0], seen_ports[1]);
    });
}

#[test]
fn router_startup_is_guarded_by_the_pid_file() {
    let hub = Hub::<StdRawMutex>::new();
    let config = router_config("pid");
    let root = config.root.clone();

    let paths = ccnet_netd::persist::Paths::new(&root);
    paths.ensure_runtime_dirs().unwrap();
    ccnet_netd::persist::write_pid_file(&paths.router_pid_file(), ROUTER_NODE).unwrap();

    let link = hub.attach(ROUTER_NODE);
    let mut daemon = RouterDaemon::new(config, link).unwrap();

    block_on(async {
        match daemon.run().await {
            Err(err) => assert_eq!(err.exit_code(), 3),
            Ok(()) => panic!("router started despite the PID file"),
        }
    });
}

//! End-to-end scenarios: several daemons on one in-process hub, driven by a
//! test future raced against the daemon loops.

use core::net::Ipv4Addr;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use embassy_futures::join::join;
use embassy_futures::select::{select, select3, Either, Either3};
use embassy_time::{Duration, Instant, Timer};

use futures_lite::future::block_on;

use ccnet_link::hub::{Hub, HubLink};
use ccnet_link::{LinkRecv, LinkSend, StdRawMutex};
use ccnet_proto::msg::{self, ArpMessage};
use ccnet_netd::{http_handler, Config, Daemon, HttpResponse, Netd, NetError, WsEvent, WsHandler};

type TestDaemon = Daemon<StdRawMutex, HubLink<StdRawMutex>>;
type Handle = Netd<StdRawMutex>;

fn temp_root(tag: &str, node: u32) -> PathBuf {
    let _ = env_logger::builder().is_test(true).try_init();

    let root = std::env::temp_dir().join(format!(
        "ccnet-scenario-{tag}-{node}-{}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&root);

    root
}

fn node_config(tag: &str, id: u32, hostname: Option<&str>) -> Config {
    let mut config = Config::defaults(id);
    config.root = temp_root(tag, id);
    config.hostname = hostname.map(Into::into);
    config.discovery_enabled = false;
    config.resolve_timeout = 1;

    config
}

fn spawn(hub: &Hub<StdRawMutex>, config: Config) -> (TestDaemon, Handle) {
    let link = hub.attach(config.node_id);

    Daemon::new(config, Some(link))
}

/// Runs `test` against two live daemons.
fn with_two_nodes<F, Fut>(tag: &str, hostname2: Option<&str>, test: F)
where
    F: FnOnce(Handle, Handle) -> Fut,
    Fut: core::future::Future<Output = ()>,
{
    let hub = Hub::<StdRawMutex>::new();

    let (mut d1, h1) = spawn(&hub, node_config(tag, 1, None));
    let (mut d2, h2) = spawn(&hub, node_config(tag, 2, hostname2));

    block_on(async {
        match select3(d1.run(), d2.run(), test(h1, h2)).await {
            Either3::Third(()) => {}
            _ => panic!("a daemon exited during the test"),
        }
    });
}

#[test]
fn s1_two_node_discovery() {
    with_two_nodes("s1", Some("alpha"), |h1, _h2| async move {
        let peers = h1.discover().await;

        assert_eq!(peers.len(), 1);

        let peer = &peers[0];
        assert_eq!(peer.node, 2);
        assert_eq!(peer.hostname, "alpha");
        assert_eq!(peer.ip, Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(peer.mac.to_string(), "CC:AF:00:00:00:02");
    });
}

#[test]
fn s2_dns_cache_expiry() {
    let hub = Hub::<StdRawMutex>::new();

    let mut config1 = node_config("s2", 1, None);
    config1.dns_ttl = 2;
    let mut config2 = node_config("s2", 2, Some("alpha"));
    config2.dns_ttl = 2;

    let (mut d1, h1) = spawn(&hub, config1);
    let (mut d2, _h2) = spawn(&hub, config2);

    block_on(async {
        let stop2: Arc<embassy_sync::signal::Signal<StdRawMutex, ()>> =
            Arc::new(embassy_sync::signal::Signal::new());

        let node2 = {
            let stop2 = stop2.clone();
            async move {
                // node 2 serves until the test stops it, then goes silent
                match select(d2.run(), stop2.wait()).await {
                    Either::First(_) => panic!("node 2 exited on its own"),
                    Either::Second(()) => {}
                }

                core::future::pending::<()>().await
            }
        };

        let test = async {
            let ip = h1.resolve("alpha").await.unwrap();
            assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 3));

            // cached answer, no answerer needed
            let ip = h1.resolve("alpha").await.unwrap();
            assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 3));

            stop2.signal(());

            // wait out the TTL; with the cache expired and the only
            // answerer gone, resolution fails
            Timer::after(Duration::from_secs(3)).await;

            let err = h1.resolve("alpha").await.unwrap_err();
            assert_eq!(err, NetError::HostUnreachable);
        };

        match select3(d1.run(), node2, test).await {
            Either3::Third(()) => {}
            _ => panic!("a daemon exited during the test"),
        }
    });
}

#[test]
fn s3_http_server_echo() {
    with_two_nodes("s3", None, |h1, h2| async move {
        h1.register_http_server(
            80,
            http_handler(|req| async move { HttpResponse::ok(req.path) }),
        )
        .await
        .unwrap();

        let node = h2.lookup_node("cc-1").await.unwrap();
        assert_eq!(node, 1);

        let response = h2
            .http_request(node, 80, "GET", "/foo", BTreeMap::new(), "")
            .await
            .unwrap();

        assert_eq!(response.code, 200);
        assert_eq!(response.body, "/foo");
    });
}

#[test]
fn s4_out_of_order_http_correlation() {
    with_two_nodes("s4", None, |h1, h2| async move {
        h1.register_http_server(
            80,
            http_handler(|req| async move {
                let delay = if req.path == "/slow" { 200 } else { 50 };
                Timer::after(Duration::from_millis(delay)).await;

                HttpResponse::ok(req.path)
            }),
        )
        .await
        .unwrap();

        let node = h2.lookup_node("10.0.0.2").await.unwrap();

        let started = Instant::now();

        let slow = async {
            let response = h2
                .http_request(node, 80, "GET", "/slow", BTreeMap::new(), "")
                .await
                .unwrap();
            (response, Instant::now() - started)
        };
        let fast = async {
            let response = h2
                .http_request(node, 80, "GET", "/fast", BTreeMap::new(), "")
                .await
                .unwrap();
            (response, Instant::now() - started)
        };

        let ((slow_response, slow_elapsed), (fast_response, fast_elapsed)) =
            join(slow, fast).await;

        // each future resolved with its own body, not by arrival order
        assert_eq!(slow_response.body, "/slow");
        assert_eq!(fast_response.body, "/fast");

        assert!(fast_elapsed < Duration::from_millis(150), "fast: {fast_elapsed:?}");
        assert!(slow_elapsed >= Duration::from_millis(200), "slow: {slow_elapsed:?}");
    });
}

#[test]
fn s5_udp_loopback_echo() {
    let hub = Hub::<StdRawMutex>::new();
    let (mut d1, h1) = spawn(&hub, node_config("s5", 1, None));

    block_on(async {
        let test = async {
            let server = h1.udp_socket(12345).await.unwrap();
            let client = h1.udp_socket(0).await.unwrap();

            client
                .send("ping", Ipv4Addr::LOCALHOST, 12345)
                .await
                .unwrap();

            let datagram = server.receive(Duration::from_secs(2)).await.unwrap();
            assert_eq!(datagram.data, "ping");
            assert_eq!(datagram.src_ip, Ipv4Addr::LOCALHOST);
            assert_eq!(datagram.src_port, client.port());

            server
                .send("pong", datagram.src_ip, datagram.src_port)
                .await
                .unwrap();

            let datagram = client.receive(Duration::from_secs(2)).await.unwrap();
            assert_eq!(datagram.data, "pong");
            assert_eq!(datagram.src_ip, Ipv4Addr::LOCALHOST);
            assert_eq!(datagram.src_port, 12345);
        };

        match select(d1.run(), test).await {
            Either::Second(()) => {}
            _ => panic!("daemon exited during the test"),
        }
    });
}

#[test]
fn s6_udp_buffer_overflow() {
    let hub = Hub::<StdRawMutex>::new();
    let (mut d1, h1) = spawn(&hub, node_config("s6", 1, None));

    block_on(async {
        let test = async {
            let server = h1.udp_socket_with(9, Some(3)).await.unwrap();
            let client = h1.udp_socket(0).await.unwrap();

            let dropped_before = h1.udp_stats().await.packets_dropped;

            for i in 0..10 {
                client
                    .send(i.to_string(), Ipv4Addr::LOCALHOST, 9)
                    .await
                    .unwrap();
            }

            // the first three, in arrival order, and nothing else
            for expected in ["0", "1", "2"] {
                let datagram = server.receive(Duration::from_millis(200)).await.unwrap();
                assert_eq!(datagram.data, expected);
            }
            assert!(matches!(
                server.receive(Duration::from_millis(200)).await,
                Err(NetError::Timeout)
            ));

            let dropped = h1.udp_stats().await.packets_dropped - dropped_before;
            assert_eq!(dropped, 7);
        };

        match select(d1.run(), test).await {
            Either::Second(()) => {}
            _ => panic!("daemon exited during the test"),
        }
    });
}

#[test]
fn udp_port_conflicts_surface_to_the_caller() {
    let hub = Hub::<StdRawMutex>::new();
    let (mut d1, h1) = spawn(&hub, node_config("udp-conflict", 1, None));

    block_on(async {
        let test = async {
            let _first = h1.udp_socket(5000).await.unwrap();

            assert!(matches!(
                h1.udp_socket(5000).await,
                Err(NetError::AddrInUse)
            ));

            let ephemeral = h1.udp_socket(0).await.unwrap();
            assert!(ephemeral.port() >= 49152);
        };

        match select(d1.run(), test).await {
            Either::Second(()) => {}
            _ => panic!("daemon exited during the test"),
        }
    });
}

#[test]
fn arp_round_trip_against_a_raw_endpoint() {
    let hub = Hub::<StdRawMutex>::new();
    let (mut d1, _h1) = spawn(&hub, node_config("arp", 1, None));

    // The prober speaks raw frames, like a foreign implementation would
    let mut prober = hub.attach(9);

    block_on(async {
        let test = async {
            let request = ArpMessage::Request {
                target_ip: Ipv4Addr::new(10, 0, 0, 2),
            };

            prober
                .broadcast("ccnet_arp", &msg::encode(&request).unwrap())
                .await
                .unwrap();

            let frame = prober.receive().await.unwrap();
            assert_eq!(frame.sender, 1);
            assert_eq!(frame.tag, "ccnet_arp");

            let reply: ArpMessage = msg::decode(&frame.payload).unwrap();
            let ArpMessage::Reply { ip, mac, hostname } = reply else {
                panic!("expected an ARP reply");
            };

            assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 2));
            assert_eq!(mac.to_string(), "CC:AF:00:00:00:01");
            assert_eq!(hostname, "cc-1");
        };

        match select(d1.run(), test).await {
            Either::Second(()) => {}
            _ => panic!("daemon exited during the test"),
        }
    });
}

#[test]
fn ws_lifecycle_echo_and_reject() {
    with_two_nodes("ws", None, |h1, h2| async move {
        let echo: WsHandler = Arc::new(|event, sender| {
            if let WsEvent::Message { data, .. } = event {
                sender.send(format!("echo:{data}"));
            }
        });

        h1.register_ws_server(8080, echo).await.unwrap();

        let node = h2.lookup_node("10.0.0.2").await.unwrap();

        let conn = h2.ws_connect(node, "ws://cc-1:8080/chat").await.unwrap();
        conn.send("hi").await;

        let data = conn.receive(Duration::from_secs(2)).await.unwrap();
        assert_eq!(data, "echo:hi");

        conn.close().await;

        // no handler on 9000: rejected, not timed out
        match h2.ws_connect(node, "ws://cc-1:9000/chat").await {
            Err(NetError::Rejected(_)) => {}
            Err(other) => panic!("expected rejection, got {other:?}"),
            Ok(_) => panic!("expected rejection, got a successful connection"),
        }
    });
}

#[test]
fn ping_round_trip() {
    with_two_nodes("ping", None, |h1, _h2| async move {
        let node = h1.lookup_node("10.0.0.3").await.unwrap();

        let rtt = h1.ping(node, 1).await.unwrap();
        assert!(rtt < Duration::from_secs(1));
    });
}

#[test]
fn http_to_an_unbound_port_is_404() {
    with_two_nodes("http404", None, |_h1, h2| async move {
        let node = h2.lookup_node("10.0.0.2").await.unwrap();

        let response = h2
            .http_request(node, 8088, "GET", "/", BTreeMap::new(), "")
            .await
            .unwrap();

        assert_eq!(response.code, 404);
    });
}

#[test]
fn panicking_http_handler_yields_500_and_keeps_the_daemon_alive() {
    with_two_nodes("http500", None, |h1, h2| async move {
        h1.register_http_server(
            80,
            http_handler(|req| async move {
                if req.path == "/boom" {
                    panic!("handler exploded");
                }

                HttpResponse::ok("fine")
            }),
        )
        .await
        .unwrap();

        let node = h2.lookup_node("10.0.0.2").await.unwrap();

        let response = h2
            .http_request(node, 80, "GET", "/boom", BTreeMap::new(), "")
            .await
            .unwrap();
        assert_eq!(response.code, 500);

        // the loop survived
        let response = h2
            .http_request(node, 80, "GET", "/ok", BTreeMap::new(), "")
            .await
            .unwrap();
        assert_eq!(response.code, 200);

        let stats = h1.stats().await;
        assert!(stats.counters.errors >= 1);
    });
}

#[test]
fn stop_file_shuts_the_daemon_down_cleanly() {
    let hub = Hub::<StdRawMutex>::new();
    let config = node_config("stop", 1, None);
    let root = config.root.clone();

    let (mut d1, h1) = spawn(&hub, config);

    block_on(async {
        let paths = ccnet_netd::persist::Paths::new(&root);

        let run = d1.run();
        let test = async {
            // give the daemon a moment to come up, then check the PID file
            Timer::after(Duration::from_millis(200)).await;
            assert!(paths.pid_file().exists());

            let info = h1.info().await;
            assert!(info.modem_available);

            std::fs::write(paths.stop_file(), "").unwrap();

            // consumed on the next tick
            Timer::after(Duration::from_secs(3)).await;
            unreachable!("daemon should have stopped first");
        };

        match select(run, test).await {
            Either::First(result) => result.unwrap(),
            Either::Second(()) => unreachable!(),
        }

        assert!(!paths.pid_file().exists());
        assert!(!paths.stop_file().exists());
        assert!(paths.state_file().exists());
        assert!(paths.stats_file().exists());
    });
}

#[test]
fn second_daemon_refuses_to_start_on_a_live_pid_file() {
    let hub = Hub::<StdRawMutex>::new();
    let config = node_config("pid", 1, None);
    let root = config.root.clone();

    let paths = ccnet_netd::persist::Paths::new(&root);
    paths.ensure_runtime_dirs().unwrap();
    ccnet_netd::persist::write_pid_file(&paths.pid_file(), 1).unwrap();

    let (mut d1, _h1) = spawn(&hub, config);

    block_on(async {
        match d1.run().await {
            Err(err) => assert_eq!(err.exit_code(), 3),
            Ok(()) => panic!("daemon started despite the PID file"),
        }
    });
}

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use ccnet_link::udp::{UdpLink, DEFAULT_PORT};
use ccnet_netd::persist::Paths;
use ccnet_netd::logger;
use ccnet_router::{RouterConfig, RouterDaemon};

/// The gateway router daemon.
#[derive(Parser, Debug)]
#[command(name = "routerd", version, about)]
struct Args {
    /// Write the router stop signal and exit.
    #[arg(long)]
    stop: bool,

    /// Print the current router stats file and exit.
    #[arg(long)]
    status: bool,

    /// Filesystem root for /etc and /var.
    #[arg(long, default_value = "/")]
    root: PathBuf,

    /// Node id override; required when no config file provides one.
    #[arg(long)]
    node_id: Option<u32>,

    /// UDP port the medium rides on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    medium_port: u16,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let paths = Paths::new(&args.root);

    if args.stop {
        if let Err(err) = paths
            .ensure_runtime_dirs()
            .and_then(|_| std::fs::write(paths.router_stop_file(), ""))
        {
            eprintln!("routerd: cannot write stop signal: {err}");
            return ExitCode::from(1);
        }

        return ExitCode::SUCCESS;
    }

    if args.status {
        return match std::fs::read_to_string(paths.router_stats_file()) {
            Ok(stats) => {
                println!("{stats}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("routerd: no stats file: {err}");
                ExitCode::from(1)
            }
        };
    }

    let config = match RouterConfig::load(&args.root, args.node_id) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("routerd: {err}");
            return ExitCode::from(err.exit_code() as u8);
        }
    };

    let log_file = config
        .root
        .join(config.log_file.to_string_lossy().trim_start_matches('/'));
    logger::init(config.log_level, Some(&log_file));

    let link = match UdpLink::bind(config.node_id, args.medium_port) {
        Ok(link) => link,
        Err(err) => {
            eprintln!("routerd: cannot open the medium: {err}");
            return ExitCode::from(1);
        }
    };

    let mut daemon = match RouterDaemon::new(config, link) {
        Ok(daemon) => daemon,
        Err(err) => {
            eprintln!("routerd: {err}");
            return ExitCode::from(err.exit_code() as u8);
        }
    };

    match futures_lite::future::block_on(daemon.run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("routerd: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

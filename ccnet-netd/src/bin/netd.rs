use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use log::warn;

use ccnet_link::udp::{UdpLink, DEFAULT_PORT};
use ccnet_link::StdRawMutex;
use ccnet_netd::persist::Paths;
use ccnet_netd::{logger, Config, Daemon};

/// The per-node network daemon.
#[derive(Parser, Debug)]
#[command(name = "netd", version, about)]
struct Args {
    /// Write the local stop signal and exit.
    #[arg(long)]
    stop: bool,

    /// Print the current node info file and exit.
    #[arg(long)]
    status: bool,

    /// Filesystem root for /etc, /var and /config (for tests and
    /// unprivileged runs).
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
            .and_then(|_| std::fs::write(paths.stop_file(), ""))
        {
            eprintln!("netd: cannot write stop signal: {err}");
            return ExitCode::from(1);
        }

        return ExitCode::SUCCESS;
    }

    if args.status {
        return match std::fs::read_to_string(paths.info_file()) {
            Ok(info) => {
                println!("{info}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("netd: no info file: {err}");
                ExitCode::from(1)
            }
        };
    }

    let config = match Config::load(&args.root, args.node_id) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("netd: {err}");
            return ExitCode::from(err.exit_code() as u8);
        }
    };

    let log_file = config.resolve(&config.log_file.to_string_lossy());
    logger::init(config.log_level, Some(&log_file));

    // A node without a medium still runs, in limited mode
    let link = match UdpLink::bind(config.node_id, args.medium_port) {
        Ok(link) => Some(link),
        Err(err) => {
            warn!("netd: no medium available ({err}); starting in limited mode");
            None
        }
    };

    let (mut daemon, _handle) = Daemon::<StdRawMutex, UdpLink>::new(config, link);

    match futures_lite::future::block_on(daemon.run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("netd: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

//! periphhome - ESPHome native API node daemon

use clap::{Parser, Subcommand};
use periphhome::cancel::{self, CancelToken, Canceller};
use periphhome::error::{Error, Result};
use periphhome::{config, install, Node, NodeOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// How often the config file and executable are checked for modification.
const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "periphhome", version, about = "ESPHome native API node")]
struct Args {
    /// Path to the YAML configuration file.
    config: PathBuf,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the node.
    Run,
    /// Install the node to run on boot.
    Install,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = main_impl() {
        eprintln!("periphhome: {}.", e);
        std::process::exit(1);
    }
}

fn main_impl() -> Result<()> {
    let args = Args::parse();
    // Absolute right away: the working directory under systemd differs.
    let config_path = args
        .config
        .canonicalize()
        .map_err(|e| Error::Config(format!("{}: {}", args.config.display(), e)))?;

    match args.command {
        Cmd::Install => install::install(&config_path),
        Cmd::Run => run(&config_path),
    }
}

fn run(config_path: &Path) -> Result<()> {
    log::info!("periphhome v{} starting", periphhome::VERSION);
    let cfg = config::Root::load(config_path)?;

    let (canceller, token) = cancel::root();
    let canceller = Arc::new(canceller);

    {
        let canceller = Arc::clone(&canceller);
        ctrlc::set_handler(move || {
            log::info!("received shutdown signal");
            canceller.cancel();
        })
        .map_err(|e| Error::Other(format!("error setting signal handler: {}", e)))?;
    }

    // Exit when the binary or the configuration changes; the service
    // manager restarts us with the new bits.
    spawn_change_watcher(
        vec![config_path.to_path_buf(), std::env::current_exe()?],
        Arc::clone(&canceller),
        token.clone(),
    );

    let node = Node::new(&token, cfg, NodeOptions::default())?;
    log::info!("node initialized");
    token.wait();
    log::info!("closing node");
    node.close()
}

fn spawn_change_watcher(paths: Vec<PathBuf>, canceller: Arc<Canceller>, token: CancelToken) {
    let baseline: Vec<Option<SystemTime>> = paths.iter().map(|p| mtime(p)).collect();
    for (path, mtime) in paths.iter().zip(&baseline) {
        log::info!("watching: {} @ {:?}", path.display(), mtime);
    }
    let _ = std::thread::Builder::new()
        .name("change-watcher".into())
        .spawn(move || {
            while !token.wait_timeout(WATCH_POLL_INTERVAL) {
                for (path, baseline) in paths.iter().zip(&baseline) {
                    let current = mtime(path);
                    if current.is_some() && current != *baseline {
                        log::info!("{} was modified, exiting", path.display());
                        canceller.cancel();
                        return;
                    }
                }
            }
        });
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

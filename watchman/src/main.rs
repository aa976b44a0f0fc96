use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::info;
use tokio::signal::unix::{signal, SignalKind};

use watchman::{bootstrap, listener};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// config file path, overrides CONF_DIR/watchman.yml
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// run the kernel and capability checks, then exit
    #[arg(long, default_value_t = false)]
    preflight: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.preflight {
        bootstrap::preflight()?;
        println!("preflight ok");
        return Ok(());
    }

    let wm = bootstrap::initialize(args.config.as_deref())?;
    wm.add_listener("logging", listener::logging());
    let handles = Arc::clone(&wm).watch();

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
    info!("received signal, shutting down");
    wm.stop();
    for handle in handles {
        handle.await?;
    }
    Ok(())
}

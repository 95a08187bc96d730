// peerlink-sim: runs a server and clients over the loopback channel and checks every echo.

mod config;
mod scenario;

use std::path::PathBuf;

use anyhow::bail;
use tracing::info;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("peerlink-sim {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => match args.next() {
                Some(path) => config_path = Some(PathBuf::from(path)),
                None => bail!("{arg} needs a path"),
            },
            other => bail!("unknown argument {other:?} (try --config <path> or --version)"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load(config_path.as_deref())?;
    info!(
        session = %cfg.session_id,
        clients = cfg.clients,
        sizes = ?cfg.message_sizes,
        "starting loopback run"
    );
    let report = scenario::run(&cfg)?;
    info!(
        messages = report.messages,
        bytes = report.bytes,
        disconnects = report.disconnects,
        ticks = report.ticks,
        "run complete"
    );
    Ok(())
}

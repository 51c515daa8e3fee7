use std::fs::File;

use anyhow::{Context, Result};
use socks5_udp_checker::{tui, version, CheckerConfig};

const LOG_FILE: &str = "socks5-udp-checker.log";

/// Install file logging when `RUST_LOG` is set.
///
/// Logs never go to the terminal: the alternate screen owns it.
fn init_logging() -> Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        return Ok(());
    }

    let path = std::env::temp_dir().join(LOG_FILE);
    let file = File::create(&path).with_context(|| format!("creating log file {}", path.display()))?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("socks5_udp_checker=info"))
        .target(env_logger::Target::Pipe(Box::new(file)))
        .init();

    log::info!(
        "socks5-udp-checker v{} (commit {}, built {}) starting",
        version::VERSION,
        version::COMMIT,
        version::DATE,
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let config = CheckerConfig::default();
    tui::run(&config).await.context("terminal session failed")?;

    log::info!("exiting");
    Ok(())
}

//! edgeview: live camera preview with a switchable GPU visualization

use std::path::PathBuf;

use color_eyre::Result;
use edgeview::Config;
use tracing::info;

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edgeview=debug".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("edgeview launching...");

    // Optional TOML config as the only argument
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    info!(
        backend = ?config.capture.backend,
        target = %config.capture.target(),
        "configuration loaded"
    );

    edgeview::display::run_viewer(config)?;

    info!("edgeview shutting down");
    Ok(())
}

//! peerbeam server binary.

use peerbeam::{Config, RelayError};
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), RelayError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    info!(
        bind = %config.server.bind_address,
        "starting peerbeam {}",
        env!("CARGO_PKG_VERSION")
    );
    peerbeam::run(config).await
}

/// Load configuration from the first argument, from `peerbeam.toml` in the
/// working directory, or fall back to defaults.
fn load_config() -> Result<Config, RelayError> {
    if let Some(path) = std::env::args().nth(1) {
        return Ok(Config::from_file(Path::new(&path))?);
    }
    let default_path = Path::new("peerbeam.toml");
    if default_path.exists() {
        return Ok(Config::from_file(default_path)?);
    }
    warn!("no config file found, using defaults");
    Ok(Config::default())
}

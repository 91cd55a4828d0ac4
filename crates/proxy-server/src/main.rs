//! Meridian proxy server binary.

use proxy_server::{Config, ProxyServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // An explicit config path may be passed as the only argument;
    // otherwise the standard search paths apply.
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from_file(path)?,
        None => Config::load()?,
    };

    let level = config.logging.level.as_deref().unwrap_or("info");
    match config.logging.format.as_deref() {
        Some("json") => common::logging::init_json(level),
        _ => common::logging::init(level),
    }

    tracing::info!("Meridian proxy starting");

    ProxyServer::new(config).run().await?;

    Ok(())
}

#![cfg(not(tarpaulin_include))]

use clap::Parser;
use trialsheet::app;
use trialsheet::config::ServerConfig;

/// Main entry point for the data-entry web server
///
/// Settings come from flags or `TRIALSHEET_*` environment variables; logging
/// is controlled with `RUST_LOG` (default `info`).
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::parse();
    app::run(config).await
}

use std::path::PathBuf;

use anyhow::Result;
use arcane::config::{EdgeSettings, default_config_path};
use arcane::edge::EdgeServer;
use arcane::telemetry::init_tracing;
use clap::{ArgAction, Parser};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "arcane", version, about = "SNI-routed DoH responder and ticket proxy", long_about = None)]
struct Args {
    /// Override path to arcane.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the TLS listen address (ADDR:PORT)
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Increase logging verbosity
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let mut settings = EdgeSettings::load_or_default(&config_path)?;
    if let Some(listen) = args.listen {
        settings.server.listen = listen;
    }

    init_tracing(args.verbose, &settings.telemetry)?;

    let server = EdgeServer::new(settings)?;
    info!(config = %config_path.display(), "Loaded configuration");
    server.run().await
}

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pv_gateway::bootstrap;
use pv_gateway::cli::{Cli, Command, ConfigCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = pv_gateway::cli::load_config(&cli.config)?;
            bootstrap::run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = pv_gateway::cli::load_config(&cli.config)?;
            if !pv_gateway::cli::validate(&config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = pv_gateway::cli::load_config(&cli.config)?;
            pv_gateway::cli::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("palaver {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for the serve path.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pv_gateway=debug")),
        )
        .json()
        .init();
}

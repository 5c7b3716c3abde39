mod cli;

use clap::Parser;
use cli::{Cli, Commands, ConfigArgs};
use std::sync::Arc;
use tracing::info;
use vmflow::config::{Config, ConfigError};
use vmflow::daemon::Daemon;
use vmflow::{executor, observability, server};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[tokio::main]
async fn main() -> Result<(), AnyError> {
    observability::init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => {
            let config = load_config(&args.config)?;
            let address = args.address.unwrap_or(config.server.bind_addr);
            let executor = executor::from_config(&config.executor);

            let daemon = Arc::new(Daemon::start(config, executor).await?);
            server::run(address, daemon).await?;
        }
        Commands::CheckConfig(args) => {
            let config = load_config(&args)?;
            info!("Configuration is valid");
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(args: &ConfigArgs) -> Result<Config, ConfigError> {
    match &args.config {
        Some(path) => Config::load_from_path(path.clone()),
        None => Config::load(),
    }
}

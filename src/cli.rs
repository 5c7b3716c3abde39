use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "vmflow")]
#[command(about = "VM job orchestration daemon", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon and its operator HTTP server
    Server(ServerArgs),
    /// Load and validate configuration, then print it
    CheckConfig(ConfigArgs),
}

#[derive(clap::Args, Debug)]
pub struct ServerArgs {
    /// Address to bind the HTTP server to; overrides `server.bind_addr`
    #[arg(long)]
    pub address: Option<SocketAddr>,

    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(clap::Args, Debug)]
pub struct ConfigArgs {
    /// Configuration file; defaults to $VMFLOW_CONFIG or config/vmflow.toml
    #[arg(long)]
    pub config: Option<PathBuf>,
}

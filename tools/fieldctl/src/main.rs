//! fieldctl - FieldLink transport diagnostics
//!
//! Operator tool for poking at the transports a field node runs on: dump CAN
//! frames from a socketcand gateway, probe connectivity, and read or write
//! Modbus registers.

mod can;
mod config;
mod modbus;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "fieldctl")]
#[command(about = "FieldLink field-node transport diagnostics")]
struct Cli {
    /// Configuration file (YAML); FIELDCTL_* environment variables override
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// CAN bus gateway operations
    #[command(subcommand)]
    Can(can::CanCommands),

    /// Modbus register operations
    #[command(subcommand)]
    Modbus(modbus::ModbusCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = config::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Can(command) => can::handle_command(command, &config).await,
        Commands::Modbus(command) => modbus::handle_command(command, &config).await,
    }
}

fn init_logging(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

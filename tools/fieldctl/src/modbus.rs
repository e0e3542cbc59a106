//! Modbus register commands

use crate::config::FieldctlConfig;
use anyhow::{bail, Context, Result};
use clap::{Subcommand, ValueEnum};
use colored::Colorize;
use fieldlink_modbus::{ModbusNetwork, ModbusNetworkConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RegisterKind {
    /// Coils (function 0x01)
    Coil,
    /// Discrete inputs (function 0x02)
    Discrete,
    /// Holding registers (function 0x03)
    Holding,
    /// Input registers (function 0x04)
    Input,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum WriteKind {
    /// Single coil (function 0x05)
    Coil,
    /// Single holding register (function 0x06)
    Holding,
}

#[derive(Subcommand)]
pub enum ModbusCommands {
    /// Read registers or bits
    Read {
        /// Register kind
        #[arg(value_enum)]
        kind: RegisterKind,
        /// Starting register address
        address: u16,
        /// Number of values to read
        #[arg(default_value_t = 1)]
        count: u16,
        /// Unit (slave) id
        #[arg(long, default_value_t = 1)]
        unit: u8,
        /// Modbus TCP host (overrides configuration)
        #[arg(long)]
        host: Option<String>,
        /// Modbus TCP port (overrides configuration)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Write a single coil or holding register
    Write {
        /// Register kind
        #[arg(value_enum)]
        kind: WriteKind,
        /// Register address
        address: u16,
        /// Value: on/off for coils, a 16-bit number for registers
        value: String,
        /// Unit (slave) id
        #[arg(long, default_value_t = 1)]
        unit: u8,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
}

pub async fn handle_command(command: ModbusCommands, config: &FieldctlConfig) -> Result<()> {
    match command {
        ModbusCommands::Read {
            kind,
            address,
            count,
            unit,
            host,
            port,
        } => {
            let network = build_network(config, host, port)?;
            let device = network.device(unit);
            match kind {
                RegisterKind::Coil => {
                    print_bits(address, &device.read_coils(address, count).await?);
                },
                RegisterKind::Discrete => {
                    print_bits(address, &device.read_discrete_inputs(address, count).await?);
                },
                RegisterKind::Holding => {
                    print_words(address, &device.read_holding_registers(address, count).await?);
                },
                RegisterKind::Input => {
                    print_words(address, &device.read_input_registers(address, count).await?);
                },
            }
            network.shutdown().await;
            Ok(())
        },
        ModbusCommands::Write {
            kind,
            address,
            value,
            unit,
            host,
            port,
        } => {
            let network = build_network(config, host, port)?;
            let device = network.device(unit);
            match kind {
                WriteKind::Coil => {
                    let value = parse_coil_value(&value)?;
                    device.write_coil(address, value).await?;
                    println!("coil {address} {}", if value { "on".green() } else { "off".red() });
                },
                WriteKind::Holding => {
                    let value = parse_word_value(&value)?;
                    device.write_register(address, value).await?;
                    println!("register {address} = {}", format!("0x{value:04X}").green());
                },
            }
            network.shutdown().await;
            Ok(())
        },
    }
}

fn build_network(
    config: &FieldctlConfig,
    host: Option<String>,
    port: Option<u16>,
) -> Result<ModbusNetwork> {
    let mut net_config = match (&config.modbus, &host) {
        (Some(modbus), _) => modbus.clone(),
        (None, Some(_)) => ModbusNetworkConfig::default(),
        (None, None) => bail!("no Modbus endpoint configured; pass --host or a config file"),
    };
    if let Some(host) = host {
        net_config.host = Some(host);
        net_config.device = None;
    }
    if let Some(port) = port {
        net_config.port = port;
    }
    let network = ModbusNetwork::new(net_config).context("building Modbus network")?;
    tracing::debug!("using Modbus endpoint {}", network.description());
    Ok(network)
}

fn print_bits(address: u16, bits: &[bool]) {
    for (offset, bit) in bits.iter().enumerate() {
        let state = if *bit { "1".green() } else { "0".dimmed() };
        println!("{:>6}  {state}", address + offset as u16);
    }
}

fn print_words(address: u16, words: &[u16]) {
    for (offset, word) in words.iter().enumerate() {
        println!(
            "{:>6}  {}  {word}",
            address + offset as u16,
            format!("0x{word:04X}").green()
        );
    }
}

fn parse_coil_value(text: &str) -> Result<bool> {
    match text.to_ascii_lowercase().as_str() {
        "1" | "on" | "true" => Ok(true),
        "0" | "off" | "false" => Ok(false),
        other => bail!("invalid coil value [{other}]; use on/off"),
    }
}

fn parse_word_value(text: &str) -> Result<u16> {
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        text.parse()
    };
    parsed.with_context(|| format!("invalid register value [{text}]"))
}

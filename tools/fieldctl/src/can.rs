//! CAN bus gateway commands

use crate::config::FieldctlConfig;
use anyhow::{bail, Context, Result};
use clap::Subcommand;
use colored::Colorize;
use fieldlink_canbus::socketcand::message::parse_address;
use fieldlink_canbus::socketcand::Subscription;
use fieldlink_canbus::{
    CanbusFrame, CanbusNetwork, CanbusNetworkConfig, FrameListener, SocketcandConnection,
};
use std::sync::Arc;

#[derive(Subcommand)]
pub enum CanCommands {
    /// Dump frames from a bus to stdout
    Dump {
        /// Bus name on the gateway, e.g. can0
        bus: String,
        /// Only frames for this arbitration address (hex); all frames when
        /// omitted (monitor mode)
        #[arg(long)]
        address: Option<String>,
        /// Gateway host (overrides configuration)
        #[arg(long)]
        host: Option<String>,
        /// Gateway port (overrides configuration)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Probe gateway connectivity with an echo command
    Verify {
        /// Bus name on the gateway
        bus: String,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },

    /// Write one frame onto the bus
    Send {
        /// Bus name on the gateway
        bus: String,
        /// Arbitration address (hex)
        address: String,
        /// Frame data as hex bytes, e.g. DEADBEEF
        data: String,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
}

pub async fn handle_command(command: CanCommands, config: &FieldctlConfig) -> Result<()> {
    match command {
        CanCommands::Dump {
            bus,
            address,
            host,
            port,
        } => {
            let conn = open_connection(config, host, port, &bus).await?;
            dump(&conn, address).await?;
            conn.close().await;
            Ok(())
        },
        CanCommands::Verify { bus, host, port } => {
            let conn = open_connection(config, host, port, &bus).await?;
            let check = conn.verify_connectivity().await?;
            let verified = check.await;
            conn.close().await;
            if verified {
                println!("{}", "connectivity verified".green());
                Ok(())
            } else {
                println!("{}", "no echo reply before timeout".red());
                std::process::exit(1);
            }
        },
        CanCommands::Send {
            bus,
            address,
            data,
            host,
            port,
        } => {
            let (address, extended) =
                parse_address(&address).context("invalid arbitration address")?;
            let data = parse_hex_bytes(&data)?;
            let frame = CanbusFrame::new(address, extended, 0, 0, data)?;
            let conn = open_connection(config, host, port, &bus).await?;
            conn.send_frame(&frame).await?;
            conn.close().await;
            println!("sent {}", frame.to_string().green());
            Ok(())
        },
    }
}

/// Listener printing each frame with its local receive time
struct PrintListener;

impl FrameListener for PrintListener {
    fn frame_received(&self, frame: &CanbusFrame) {
        let received = chrono::Local::now().format("%H:%M:%S%.3f");
        let bus_time = format!("({}.{:06})", frame.seconds(), frame.microseconds());
        println!(
            "{} {} {}",
            received.to_string().dimmed(),
            frame.to_string().green(),
            bus_time.dimmed()
        );
    }
}

async fn dump(conn: &SocketcandConnection, address: Option<String>) -> Result<()> {
    let listener: Arc<dyn FrameListener> = Arc::new(PrintListener);
    match address {
        Some(token) => {
            let (address, extended) =
                parse_address(&token).context("invalid arbitration address")?;
            conn.subscribe(Subscription::new(address, extended, None, listener)?)
                .await?;
            eprintln!("dumping frames for 0x{address:X}; Ctrl-C to stop");
        },
        None => {
            conn.monitor(listener).await?;
            eprintln!("dumping all frames; Ctrl-C to stop");
        },
    }
    tokio::signal::ctrl_c().await.context("signal handler")?;
    Ok(())
}

async fn open_connection(
    config: &FieldctlConfig,
    host: Option<String>,
    port: Option<u16>,
    bus: &str,
) -> Result<SocketcandConnection> {
    let mut net_config = match (&config.can, &host) {
        (Some(can), _) => can.clone(),
        (None, Some(host)) => CanbusNetworkConfig {
            host: host.clone(),
            port: fieldlink_canbus::network::DEFAULT_PORT,
            read_timeout_ms: 400,
            verify_timeout_ms: 10_000,
        },
        (None, None) => bail!("no CAN gateway configured; pass --host or a config file"),
    };
    if let Some(host) = host {
        net_config.host = host;
    }
    if let Some(port) = port {
        net_config.port = port;
    }
    let network = CanbusNetwork::new(net_config)?;
    tracing::debug!("using CAN gateway {}", network.description());
    let conn = network.create_connection(bus);
    conn.open()
        .await
        .with_context(|| format!("opening {}", network.description()))?;
    Ok(conn)
}

fn parse_hex_bytes(text: &str) -> Result<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() % 2 != 0 {
        bail!("hex data must have an even number of digits");
    }
    (0..compact.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&compact[i..i + 2], 16)
                .with_context(|| format!("invalid hex byte [{}]", &compact[i..i + 2]))
        })
        .collect()
}

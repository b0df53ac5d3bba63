//! Simulated bootloader ECU
//!
//! # Usage
//!
//! ```bash
//! ./example-ecu --interface vcan0
//! ./example-ecu --config config/example-ecu.toml --block-size 8 --st-min 5
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use canboot_uds::config::{SocketCanConfig, TransportConfig};
use canboot_uds::transport::create_port;
use clap::Parser;
use example_ecu::{EcuConfig, EcuSimulator};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "example-ecu")]
#[command(about = "Simulated UDS bootloader on a J1939 bus")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// CAN interface name
    #[arg(short, long)]
    interface: Option<String>,

    /// J1939 source address of the ECU (e.g. 0x6A)
    #[arg(long, value_parser = parse_u8)]
    ecu_address: Option<u8>,

    /// Block size sent in flow control frames
    #[arg(long)]
    block_size: Option<u8>,

    /// Raw STmin byte sent in flow control frames
    #[arg(long, value_parser = parse_u8)]
    st_min: Option<u8>,

    /// Status broadcast period in milliseconds
    #[arg(long)]
    heartbeat_ms: Option<u64>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn parse_u8(s: &str) -> Result<u8, String> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("invalid byte value '{}': {}", s, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "example_ecu=debug,canboot_uds=debug"
    } else {
        "example_ecu=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading config from: {}", path.display());
            EcuConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?
        }
        None => EcuConfig::default(),
    };

    // Command line overrides the file
    if let Some(interface) = args.interface {
        config.transport.interface = interface;
    }
    if let Some(address) = args.ecu_address {
        config.transport.ecu_address = address;
    }
    if let Some(block_size) = args.block_size {
        config.flow_control.block_size = block_size;
    }
    if let Some(st_min) = args.st_min {
        config.flow_control.separation_time = st_min;
    }
    if let Some(ms) = args.heartbeat_ms {
        config.transport.heartbeat_ms = ms;
    }

    info!(
        interface = %config.transport.interface,
        address = format!("0x{:02X}", config.transport.ecu_address),
        block_size = config.flow_control.block_size,
        st_min = config.flow_control.separation_time,
        byte_order = %config.transfer.byte_order,
        "Starting bootloader simulator"
    );

    let port = create_port(&TransportConfig::SocketCan(SocketCanConfig {
        interface: config.transport.interface.clone(),
        echo_tx: false,
    }))
    .await
    .context("Failed to open CAN interface")?;

    let mut task = EcuSimulator::new(port, config).spawn();

    info!("Press Ctrl+C to stop");
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutting down...");
        }
        result = &mut task => {
            result.context("Simulator task failed")??;
            return Ok(());
        }
    }

    task.abort();
    Ok(())
}

//! canboot - flash firmware into UDS bootloaders over CAN
//!
//! Talks to the ECU on J1939 diagnostic identifiers through SocketCAN, or to
//! an in-process simulated ECU with `--mock`.

mod commands;
mod config;
mod output;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use canboot_uds::j1939::CanIdentifier;
use canboot_uds::ByteOrder;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::commands::reset::ResetKind;
use crate::commands::Session;
use crate::config::Overrides;
use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "canboot")]
#[command(author, version, about = "UDS-over-CAN bootloader client")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CANBOOT_CONFIG")]
    config: Option<PathBuf>,

    /// CAN interface
    #[arg(short, long, env = "CANBOOT_INTERFACE")]
    interface: Option<String>,

    /// Use an in-process simulated ECU instead of a CAN interface
    #[arg(long)]
    mock: bool,

    /// Request identifier (tester -> ECU), e.g. 0x18DA6AF1
    #[arg(long)]
    tx_id: Option<CanIdentifier>,

    /// Response identifier (ECU -> tester), e.g. 0x18DAF16A
    #[arg(long)]
    rx_id: Option<CanIdentifier>,

    /// Order of PID, address and length fields
    #[arg(long, value_enum)]
    byte_order: Option<ByteOrderArg>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ByteOrderArg {
    Big,
    Little,
}

impl From<ByteOrderArg> for ByteOrder {
    fn from(arg: ByteOrderArg) -> Self {
        match arg {
            ByteOrderArg::Big => ByteOrder::Big,
            ByteOrderArg::Little => ByteOrder::Little,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Download a firmware image
    Flash {
        /// Raw binary image
        file: PathBuf,

        /// Restart into the bootloader first and into the application after
        #[arg(long)]
        auto_reset: bool,
    },

    /// Check whether the bootloader is running
    Check,

    /// Reset the ECU
    Reset {
        #[arg(long, value_enum, default_value = "uds")]
        kind: ResetKind,
    },

    /// Read or change the ECU's J1939 source address
    SourceAddress {
        #[command(subcommand)]
        action: SourceAddressAction,
    },

    /// Listen to the bus and rank the nodes heard
    Detect {
        /// Listening window in seconds
        #[arg(long, default_value = "2")]
        seconds: f64,

        /// Address the best candidate from now on
        #[arg(long)]
        apply: bool,

        /// Store the applied identifiers in the config file
        #[arg(long, requires = "apply")]
        save: bool,
    },

    /// Poll fuel and temperature from every node on the bus
    Collect {
        /// Polling window in seconds
        #[arg(long, default_value = "10")]
        seconds: f64,
    },

    /// Show the identifiers in use
    Ids,
}

#[derive(Subcommand)]
enum SourceAddressAction {
    /// Read the current address
    Read,

    /// Write a new address
    Write {
        /// New address, decimal or 0x-prefixed hex
        #[arg(value_parser = parse_address)]
        address: u16,

        /// Store the new identifiers in the config file
        #[arg(long)]
        save: bool,
    },
}

fn parse_address(s: &str) -> Result<u16, String> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("invalid address '{}': {}", s, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("canboot_uds=debug,canboot=debug,example_ecu=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let mut bootloader_config = config::load(cli.config.as_deref())?;
    Overrides {
        interface: cli.interface.clone(),
        mock: cli.mock,
        tx_id: cli.tx_id,
        rx_id: cli.rx_id,
        byte_order: cli.byte_order.map(ByteOrder::from),
    }
    .apply(&mut bootloader_config);

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config::config_path()?,
    };

    let ctx = OutputContext::new(cli.output, cli.no_color, cli.quiet);
    let session = Session::connect(bootloader_config, config_path).await?;

    match &cli.command {
        Commands::Flash { file, auto_reset } => {
            commands::flash(&session, file, *auto_reset, &ctx).await?;
        }

        Commands::Check => {
            if !commands::check(&session, &ctx).await? {
                std::process::exit(1);
            }
        }

        Commands::Reset { kind } => {
            commands::reset(&session, *kind, &ctx).await?;
        }

        Commands::SourceAddress { action } => match action {
            SourceAddressAction::Read => {
                commands::read_source_address(&session, &ctx).await?;
            }
            SourceAddressAction::Write { address, save } => {
                commands::write_source_address(&session, *address, *save, &ctx).await?;
            }
        },

        Commands::Detect {
            seconds,
            apply,
            save,
        } => {
            let window = Duration::from_secs_f64(seconds.max(0.0));
            commands::detect(&session, window, *apply, *save, &ctx).await?;
        }

        Commands::Collect { seconds } => {
            let window = Duration::from_secs_f64(seconds.max(0.0));
            commands::collect(&session, window, &ctx).await?;
        }

        Commands::Ids => {
            commands::ids(&session, &ctx).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x42"), Ok(0x42));
        assert_eq!(parse_address("66"), Ok(66));
        assert_eq!(parse_address("0x1FF"), Ok(0x1FF));
        assert!(parse_address("zz").is_err());
    }

    #[test]
    fn test_cli_parses_flash() {
        let cli = Cli::try_parse_from([
            "canboot",
            "--mock",
            "--tx-id",
            "0x18DA22F1",
            "flash",
            "image.bin",
            "--auto-reset",
        ])
        .unwrap();
        assert!(cli.mock);
        assert_eq!(cli.tx_id.map(|id| id.encode()), Some(0x18DA_22F1));
        match cli.command {
            Commands::Flash { file, auto_reset } => {
                assert_eq!(file, PathBuf::from("image.bin"));
                assert!(auto_reset);
            }
            _ => panic!("Expected flash"),
        }
    }

    #[test]
    fn test_cli_parses_collect() {
        let cli = Cli::try_parse_from(["canboot", "--mock", "collect", "--seconds", "3"]).unwrap();
        match cli.command {
            Commands::Collect { seconds } => assert_eq!(seconds, 3.0),
            _ => panic!("Expected collect"),
        }

        let cli = Cli::try_parse_from(["canboot", "collect"]).unwrap();
        assert!(matches!(cli.command, Commands::Collect { seconds } if seconds == 10.0));
    }
}

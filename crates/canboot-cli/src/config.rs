//! Configuration file handling for canboot

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use canboot_uds::config::{MockConfig, SocketCanConfig, TransportConfig};
use canboot_uds::j1939::CanIdentifier;
use canboot_uds::{BootloaderConfig, ByteOrder, UdsIdentifiers};

/// Get the default config file path
pub fn config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Could not determine config directory")?
        .join("canboot");

    Ok(config_dir.join("config.toml"))
}

/// Load `path`, or the default file when it exists, or the defaults
pub fn load(path: Option<&Path>) -> Result<BootloaderConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let default = config_path()?;
            if !default.exists() {
                return Ok(BootloaderConfig::default());
            }
            default
        }
    };
    BootloaderConfig::load(&path)
        .with_context(|| format!("Failed to load config file: {}", path.display()))
}

/// Command line values that override the file
#[derive(Debug, Default)]
pub struct Overrides {
    pub interface: Option<String>,
    pub mock: bool,
    pub tx_id: Option<CanIdentifier>,
    pub rx_id: Option<CanIdentifier>,
    pub byte_order: Option<ByteOrder>,
}

impl Overrides {
    pub fn apply(&self, config: &mut BootloaderConfig) {
        if self.mock {
            config.transport = TransportConfig::Mock(MockConfig::default());
        } else if let Some(interface) = &self.interface {
            let echo_tx = match &config.transport {
                TransportConfig::SocketCan(cfg) => cfg.echo_tx,
                TransportConfig::Mock(_) => true,
            };
            config.transport = TransportConfig::SocketCan(SocketCanConfig {
                interface: interface.clone(),
                echo_tx,
            });
        }

        let mut identifiers = config.uds_identifiers();
        if let Some(tx) = self.tx_id {
            identifiers.set_tx(tx);
        }
        if let Some(rx) = self.rx_id {
            identifiers.set_rx(rx);
        }
        config.identifiers.tx_id = identifiers.tx;
        config.identifiers.rx_id = identifiers.rx;

        if let Some(order) = self.byte_order {
            config.transfer.byte_order = order;
        }
    }
}

/// Store `identifiers` in the config file at `path`, keeping everything else
pub fn save_identifiers(path: &Path, identifiers: &UdsIdentifiers) -> Result<()> {
    let mut config = if path.exists() {
        BootloaderConfig::load(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?
    } else {
        BootloaderConfig::default()
    };
    config.identifiers.tx_id = identifiers.tx;
    config.identifiers.rx_id = identifiers.rx;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let content = config.to_toml_string()?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))
}

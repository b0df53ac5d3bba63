//! Bootloader configuration
//!
//! Loaded from TOML. Every field has a default matching the stock
//! bootloader, so an empty file is a valid configuration:
//!
//! ```toml
//! [transport]
//! type = "socketcan"
//! interface = "can0"
//!
//! [identifiers]
//! tx_id = "0x18DA6AF1"
//! rx_id = "0x18DAF16A"
//!
//! [transfer]
//! byte_order = "little"
//!
//! [collector]
//! poll_interval_ms = 500
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::isotp::{BlockLimits, DEFAULT_MAX_BLOCK_LENGTH, MAX_FIRST_FRAME_LENGTH};
use crate::j1939::CanIdentifier;
use crate::uds::{download, ByteOrder, UdsIdentifiers};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete bootloader client configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootloaderConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub identifiers: IdentifierConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
}

impl BootloaderConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transfer;
        if !(3..=MAX_FIRST_FRAME_LENGTH).contains(&t.max_block_length) {
            return Err(ConfigError::Invalid(format!(
                "transfer.max_block_length must be within 3..={}, got {}",
                MAX_FIRST_FRAME_LENGTH, t.max_block_length
            )));
        }
        if self.collector.poll_interval_ms == 0 || self.collector.cycle_pause_ms == 0 {
            return Err(ConfigError::Invalid(
                "collector intervals must not be 0".to_string(),
            ));
        }
        if t.max_memory_length == 0 {
            return Err(ConfigError::Invalid(
                "transfer.max_memory_length must not be 0".to_string(),
            ));
        }
        if let TransportConfig::SocketCan(cfg) = &self.transport {
            if cfg.interface.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "transport.interface must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn uds_identifiers(&self) -> UdsIdentifiers {
        UdsIdentifiers::new(self.identifiers.tx_id, self.identifiers.rx_id)
    }

    pub fn block_limits(&self) -> BlockLimits {
        BlockLimits {
            max_block_length: self.transfer.max_block_length,
            block_counter_start: self.transfer.block_counter_start,
            block_counter_wrap: self.transfer.block_counter_wrap,
        }
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Raw CAN through SocketCAN (Linux only)
    SocketCan(SocketCanConfig),
    /// In-process bus for tests and demos
    Mock(MockConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::SocketCan(SocketCanConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketCanConfig {
    /// CAN interface name (e.g., "can0")
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Publish our own transmissions to subscribers as Tx frames
    #[serde(default = "default_true")]
    pub echo_tx: bool,
}

fn default_interface() -> String {
    "can0".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for SocketCanConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            echo_tx: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MockConfig {
    /// Delay applied to every send
    #[serde(default)]
    pub latency_ms: u64,
}

// =============================================================================
// Addressing
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IdentifierConfig {
    /// Tester -> ECU
    #[serde(default = "default_tx_id")]
    pub tx_id: CanIdentifier,
    /// ECU -> tester
    #[serde(default = "default_rx_id")]
    pub rx_id: CanIdentifier,
}

fn default_tx_id() -> CanIdentifier {
    UdsIdentifiers::default().tx
}

fn default_rx_id() -> CanIdentifier {
    UdsIdentifiers::default().rx
}

impl Default for IdentifierConfig {
    fn default() -> Self {
        Self {
            tx_id: default_tx_id(),
            rx_id: default_rx_id(),
        }
    }
}

// =============================================================================
// Transfer
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Order of PID, address and length fields
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default = "default_memory_address")]
    pub memory_address: u32,
    /// Upper bound announced in RequestDownload
    #[serde(default = "default_max_memory_length")]
    pub max_memory_length: u32,
    /// TransferData block size including SID and block sequence
    #[serde(default = "default_max_block_length")]
    pub max_block_length: usize,
    /// Lower bound for consecutive frame pacing
    #[serde(default = "default_min_separation_ms")]
    pub min_separation_ms: u64,
    #[serde(default = "default_block_counter")]
    pub block_counter_start: u8,
    #[serde(default = "default_block_counter")]
    pub block_counter_wrap: u8,
    /// Written to the fingerprint DID before erasing
    #[serde(default = "default_fingerprint")]
    pub fingerprint_value: u8,
}

fn default_memory_address() -> u32 {
    download::DEFAULT_MEMORY_ADDRESS
}

fn default_max_memory_length() -> u32 {
    download::MAX_MEMORY_LENGTH
}

fn default_max_block_length() -> usize {
    DEFAULT_MAX_BLOCK_LENGTH
}

fn default_min_separation_ms() -> u64 {
    10
}

fn default_block_counter() -> u8 {
    1
}

fn default_fingerprint() -> u8 {
    0xAA
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            byte_order: ByteOrder::default(),
            memory_address: default_memory_address(),
            max_memory_length: default_max_memory_length(),
            max_block_length: default_max_block_length(),
            min_separation_ms: default_min_separation_ms(),
            block_counter_start: default_block_counter(),
            block_counter_wrap: default_block_counter(),
            fingerprint_value: default_fingerprint(),
        }
    }
}

impl TransferConfig {
    pub fn min_separation(&self) -> Duration {
        Duration::from_millis(self.min_separation_ms)
    }
}

// =============================================================================
// Timeouts
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Source address read/write answer deadline
    #[serde(default = "default_source_address_ms")]
    pub source_address_ms: u64,
    /// Wait after the bootloader-entry reset before programming
    #[serde(default = "default_auto_reset_delay_ms")]
    pub auto_reset_delay_ms: u64,
    /// Longest a download may go without progress or a state change
    #[serde(default = "default_transfer_idle_ms")]
    pub transfer_idle_ms: u64,
}

fn default_source_address_ms() -> u64 {
    2500
}

fn default_auto_reset_delay_ms() -> u64 {
    650
}

fn default_transfer_idle_ms() -> u64 {
    10_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            source_address_ms: default_source_address_ms(),
            auto_reset_delay_ms: default_auto_reset_delay_ms(),
            transfer_idle_ms: default_transfer_idle_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn source_address(&self) -> Duration {
        Duration::from_millis(self.source_address_ms)
    }

    pub fn auto_reset_delay(&self) -> Duration {
        Duration::from_millis(self.auto_reset_delay_ms)
    }

    pub fn transfer_idle(&self) -> Duration {
        Duration::from_millis(self.transfer_idle_ms)
    }
}

// =============================================================================
// Telemetry collector
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Pause between the fuel and the temperature read of one node
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Pause before the next node is polled
    #[serde(default = "default_cycle_pause_ms")]
    pub cycle_pause_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_cycle_pause_ms() -> u64 {
    1000
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            cycle_pause_ms: default_cycle_pause_ms(),
        }
    }
}

impl CollectorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cycle_pause(&self) -> Duration {
        Duration::from_millis(self.cycle_pause_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = BootloaderConfig::from_toml_str("").unwrap();
        assert_eq!(config, BootloaderConfig::default());
        assert_eq!(config.identifiers.tx_id.encode(), 0x18DA_6AF1);
        assert_eq!(config.identifiers.rx_id.encode(), 0x18DA_F16A);
        assert_eq!(config.transfer.max_block_length, 1026);
        assert_eq!(config.timeouts.source_address(), Duration::from_millis(2500));
        assert_eq!(config.timeouts.auto_reset_delay(), Duration::from_millis(650));
        assert_eq!(config.timeouts.transfer_idle(), Duration::from_secs(10));
        assert_eq!(config.collector.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.collector.cycle_pause(), Duration::from_secs(1));
    }

    #[test]
    fn test_parse_full_config() {
        let config = BootloaderConfig::from_toml_str(
            r#"
            [transport]
            type = "mock"
            latency_ms = 2

            [identifiers]
            tx_id = "0x18DA22F1"
            rx_id = "18DAF122"

            [transfer]
            byte_order = "little"
            max_block_length = 258
            block_counter_wrap = 0

            [timeouts]
            source_address_ms = 1000

            [collector]
            poll_interval_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.transport, TransportConfig::Mock(MockConfig { latency_ms: 2 }));
        assert_eq!(config.uds_identifiers().ecu_address(), 0x22);
        assert_eq!(config.transfer.byte_order, ByteOrder::Little);
        assert_eq!(config.block_limits().max_block_length, 258);
        assert_eq!(config.block_limits().block_counter_wrap, 0);
        assert_eq!(config.block_limits().block_counter_start, 1);
        assert_eq!(config.timeouts.source_address_ms, 1000);
        assert_eq!(config.timeouts.auto_reset_delay_ms, 650);
        assert_eq!(config.collector.poll_interval_ms, 250);
        assert_eq!(config.collector.cycle_pause_ms, 1000);
    }

    #[test]
    fn test_socketcan_transport() {
        let config = BootloaderConfig::from_toml_str(
            r#"
            [transport]
            type = "socketcan"
            interface = "vcan0"
            "#,
        )
        .unwrap();
        match config.transport {
            TransportConfig::SocketCan(cfg) => {
                assert_eq!(cfg.interface, "vcan0");
                assert!(cfg.echo_tx);
            }
            other => panic!("Expected socketcan transport, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_invalid_values() {
        let err = BootloaderConfig::from_toml_str("[transfer]\nmax_block_length = 5000\n");
        assert!(matches!(err, Err(ConfigError::Invalid(_))));

        let err = BootloaderConfig::from_toml_str("[identifiers]\ntx_id = \"0xFFFFFFFF\"\n");
        assert!(matches!(err, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_from_file_and_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[transfer]\nfingerprint_value = 0x55").unwrap();

        let config = BootloaderConfig::load(file.path()).unwrap();
        assert_eq!(config.transfer.fingerprint_value, 0x55);

        let text = config.to_toml_string().unwrap();
        assert_eq!(BootloaderConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        let err = BootloaderConfig::load(Path::new("/definitely/not/here.toml"));
        assert!(matches!(err, Err(ConfigError::Io { .. })));
    }
}

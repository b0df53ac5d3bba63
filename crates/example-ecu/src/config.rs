//! Simulated bootloader ECU configuration
//!
//! Every field has a default matching the stock bootloader, so the simulator
//! runs without a file. Behaviour switches let tests provoke failure paths.

use std::path::Path;

use canboot_uds::uds::{ByteOrder, DEFAULT_ECU_ADDRESS};
use serde::{Deserialize, Serialize};

/// Complete simulator configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EcuConfig {
    #[serde(default)]
    pub transport: EcuTransportConfig,

    /// Flow control sent for segmented requests
    #[serde(default)]
    pub flow_control: FlowControlConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub behavior: BehaviorConfig,

    /// Telemetry answered to ReadDataById
    #[serde(default)]
    pub sensors: SensorConfig,
}

impl EcuConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcuTransportConfig {
    /// CAN interface
    #[serde(default = "default_interface")]
    pub interface: String,

    /// J1939 source address the ECU answers from
    #[serde(default = "default_ecu_address")]
    pub ecu_address: u8,

    /// J1939 priority of outgoing frames
    #[serde(default = "default_priority")]
    pub priority: u8,

    /// Broadcast period of the status frame, 0 disables it
    #[serde(default)]
    pub heartbeat_ms: u64,
}

fn default_interface() -> String {
    "vcan0".to_string()
}

fn default_ecu_address() -> u8 {
    DEFAULT_ECU_ADDRESS
}

fn default_priority() -> u8 {
    6
}

impl Default for EcuTransportConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            ecu_address: default_ecu_address(),
            priority: default_priority(),
            heartbeat_ms: 0,
        }
    }
}

// =============================================================================
// Flow Control
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowControlConfig {
    /// Consecutive frames per flow control, 0 = unlimited
    #[serde(default)]
    pub block_size: u8,

    /// Raw STmin byte
    #[serde(default)]
    pub separation_time: u8,

    /// Number of Wait flow controls sent before the first ContinueToSend
    #[serde(default)]
    pub wait_frames: u8,
}

// =============================================================================
// Transfer
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Order of PID, address and length fields
    #[serde(default)]
    pub byte_order: ByteOrder,

    /// Block counter start value
    #[serde(default = "default_block_counter")]
    pub block_counter_start: u8,

    /// Block counter value used after 255
    #[serde(default = "default_block_counter")]
    pub block_counter_wrap: u8,

    /// Flash size in bytes
    #[serde(default = "default_flash_size")]
    pub flash_size: u32,
}

fn default_block_counter() -> u8 {
    1
}

fn default_flash_size() -> u32 {
    256 * 1024
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            byte_order: ByteOrder::default(),
            block_counter_start: default_block_counter(),
            block_counter_wrap: default_block_counter(),
            flash_size: default_flash_size(),
        }
    }
}

// =============================================================================
// Behaviour
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BehaviorConfig {
    /// Fixed security seed instead of a random one
    #[serde(default)]
    pub fixed_seed: Option<u16>,

    /// ResponsePending (0x78) answers sent before the erase result
    #[serde(default)]
    pub erase_pending_responses: u8,

    /// Delay before every response
    #[serde(default)]
    pub response_delay_ms: u64,

    /// Answer the erase routine with GeneralProgrammingFailure
    #[serde(default)]
    pub fail_erase: bool,

    /// Never answer source address writes
    #[serde(default)]
    pub ignore_source_address_write: bool,
}

// =============================================================================
// Sensors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// `raw_fuel_level` reading
    #[serde(default = "default_fuel_level")]
    pub fuel_level: u16,

    /// `raw_temperature` reading in tenths of a degree
    #[serde(default = "default_temperature")]
    pub temperature: u16,
}

fn default_fuel_level() -> u16 {
    512
}

fn default_temperature() -> u16 {
    215
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            fuel_level: default_fuel_level(),
            temperature: default_temperature(),
        }
    }
}

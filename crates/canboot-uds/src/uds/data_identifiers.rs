//! Data identifiers known to the bootloader
//!
//! Manufacturer-specific parameters live in the low range, the ISO 14229-1
//! identification DIDs in 0xF188..0xF1F0.

use serde::Serialize;

/// Immutable descriptor of a readable/writable data identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UdsVar {
    pub name: &'static str,
    pub pid: u16,
    /// Value size in bytes
    pub size: u16,
    pub description: &'static str,
}

const fn var(name: &'static str, pid: u16, size: u16, description: &'static str) -> UdsVar {
    UdsVar {
        name,
        pid,
        size,
        description,
    }
}

pub const CAN_BAUD_RATE: UdsVar = var("can_baud_rate", 0x0010, 1, "CAN bus bit rate");
pub const CAN_SA: UdsVar = var("can_sa", 0x0011, 1, "J1939 source address of the device");
pub const EMPTY_FUEL_TANK: UdsVar = var("empty_fuel_tank", 0x0012, 2, "Empty tank calibration point");
pub const FULL_FUEL_TANK: UdsVar = var("full_fuel_tank", 0x0013, 2, "Full tank calibration point");
pub const CURR_FUEL_TANK: UdsVar = var("curr_fuel_tank", 0x0014, 2, "Current fuel level");
pub const FINGERPRINT: UdsVar = var("fingerprint", 0x1500, 2, "Programming fingerprint");
pub const TYPE_SESSION: UdsVar = var("type_session", 0x0016, 1, "Active diagnostic session");
pub const K_FUEL_LEVEL: UdsVar = var("k_fuel_level", 0x0017, 2, "Fuel level filter coefficient");
pub const RAW_FUEL_LEVEL: UdsVar = var("raw_fuel_level", 0x0018, 2, "Raw fuel level reading");
pub const RAW_TEMPERATURE: UdsVar = var("raw_temperature", 0x0019, 2, "Raw temperature reading");

/// Every known identifier, in display order
pub const CATALOG: &[UdsVar] = &[
    CAN_BAUD_RATE,
    CAN_SA,
    EMPTY_FUEL_TANK,
    FULL_FUEL_TANK,
    CURR_FUEL_TANK,
    FINGERPRINT,
    TYPE_SESSION,
    K_FUEL_LEVEL,
    RAW_FUEL_LEVEL,
    RAW_TEMPERATURE,
    var("vmecusndid", 0xF188, 18, "Vehicle manufacturer ECU software number"),
    var("vmecusvndid", 0xF189, 32, "Vehicle manufacturer ECU software version number"),
    var("ssiddid", 0xF18A, 32, "System supplier identifier"),
    var("ecumddid", 0xF18B, 16, "ECU manufacturing date"),
    var("ecusndid", 0xF18C, 253, "ECU serial number"),
    var("vindid", 0xF190, 17, "VIN"),
    var("vmecuhndid", 0xF191, 32, "Vehicle manufacturer ECU hardware number"),
    var("ssecuhwndid", 0xF192, 32, "System supplier ECU hardware number"),
    var("ssecuhwvndid", 0xF193, 16, "System supplier ECU hardware version number"),
    var("ssecuswndid", 0xF194, 128, "System supplier ECU software number"),
    var("ssecuswvndid", 0xF195, 128, "System supplier ECU software version number"),
    var("erotandid", 0xF196, 64, "Exhaust regulation or type approval number"),
    var("snoetdid", 0xF197, 64, "System name or engine type"),
    var("rscotsndid", 0xF198, 32, "Repair shop code or tester serial number"),
    var("pddid", 0xF199, 16, "Programming date"),
    var("eiddid", 0xF19D, 16, "ECU installation date"),
    var("vmecuscndid", 0xF1A0, 18, "Vehicle manufacturer ECU software configuration number"),
    var("vmecuscvndid", 0xF1A1, 32, "Vehicle manufacturer ECU software configuration version number"),
    var("idoptvms", 0xF1A2, 256, "Identification options, vehicle manufacturer specific"),
    var("idoptsss", 0xF1F0, 256, "Identification options, system supplier specific"),
];

pub fn by_name(name: &str) -> Option<&'static UdsVar> {
    CATALOG.iter().find(|v| v.name == name)
}

pub fn by_pid(pid: u16) -> Option<&'static UdsVar> {
    CATALOG.iter().find(|v| v.pid == pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_catalog_keys_are_unique() {
        let names: HashSet<_> = CATALOG.iter().map(|v| v.name).collect();
        let pids: HashSet<_> = CATALOG.iter().map(|v| v.pid).collect();
        assert_eq!(names.len(), CATALOG.len());
        assert_eq!(pids.len(), CATALOG.len());
        assert_eq!(CATALOG.len(), 30);
    }

    #[test]
    fn test_lookup() {
        assert_eq!(by_name("fingerprint"), Some(&FINGERPRINT));
        assert_eq!(by_pid(0x0011).map(|v| v.name), Some("can_sa"));
        assert_eq!(by_name("vindid").map(|v| (v.pid, v.size)), Some((0xF190, 17)));
        assert!(by_name("nope").is_none());
    }

    #[test]
    fn test_option_tables_are_256_bytes() {
        assert_eq!(by_name("idoptvms").map(|v| v.size), Some(256));
        assert_eq!(by_pid(0xF1F0).map(|v| v.size), Some(256));
    }
}

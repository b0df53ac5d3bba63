//! Tester/ECU identifier pair

use serde::{Deserialize, Serialize};

use crate::j1939::CanIdentifier;

/// Default tester source address
pub const DEFAULT_TESTER_ADDRESS: u8 = 0xF1;
/// Default ECU source address
pub const DEFAULT_ECU_ADDRESS: u8 = 0x6A;

/// Identifiers used for one diagnostic conversation
///
/// `tx` is what the tester sends on, `rx` is what the ECU answers on. The
/// setters keep the pair consistent: the ECU address is both the `tx`
/// destination and the `rx` source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdsIdentifiers {
    pub tx: CanIdentifier,
    pub rx: CanIdentifier,
}

impl Default for UdsIdentifiers {
    fn default() -> Self {
        Self {
            tx: CanIdentifier::decode(0x18DA_6AF1),
            rx: CanIdentifier::decode(0x18DA_F16A),
        }
    }
}

impl UdsIdentifiers {
    pub fn new(tx: CanIdentifier, rx: CanIdentifier) -> Self {
        Self { tx, rx }
    }

    /// Replace the request identifier; the ECU is expected to answer from its destination
    pub fn set_tx(&mut self, tx: CanIdentifier) {
        self.tx = tx;
        self.rx.set_src(tx.dst());
    }

    /// Replace the response identifier; requests are re-addressed to its source
    pub fn set_rx(&mut self, rx: CanIdentifier) {
        self.rx = rx;
        self.tx.set_dst(rx.src());
    }

    /// Re-address the ECU
    pub fn set_source_address(&mut self, address: u8) {
        self.tx.set_dst(address);
        self.rx.set_src(address);
    }

    /// Point the pair at an observed `device` talking to `tester`
    pub fn apply_candidate(&mut self, device: u8, tester: u8) {
        self.tx.set_src(tester);
        self.tx.set_dst(device);
        self.rx.set_src(device);
        self.rx.set_dst(tester);
    }

    pub fn ecu_address(&self) -> u8 {
        self.rx.src()
    }

    pub fn tester_address(&self) -> u8 {
        self.tx.src()
    }
}

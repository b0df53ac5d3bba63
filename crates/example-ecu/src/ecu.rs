//! Simulated UDS bootloader
//!
//! Answers the flashing sequence the way the stock bootloader does. Requests
//! and responses are complete UDS messages without ISO-TP framing.

use std::sync::atomic::{AtomicU8, Ordering};

use canboot_uds::uds::data_identifiers::{
    self, CAN_SA, FINGERPRINT, RAW_FUEL_LEVEL, RAW_TEMPERATURE,
};
use canboot_uds::uds::services::SecurityAccess;
use canboot_uds::uds::{
    download, reset_type, routine, security_level, service_id, session_type, ByteOrder,
    NegativeResponseCode,
};
use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::EcuConfig;

/// Create a positive response for a service
pub fn positive_response(sid: u8, data: &[u8]) -> Vec<u8> {
    let mut response = Vec::with_capacity(1 + data.len());
    response.push(service_id::positive_response(sid));
    response.extend_from_slice(data);
    response
}

/// Create a negative response
pub fn negative_response(sid: u8, nrc: NegativeResponseCode) -> Vec<u8> {
    vec![service_id::NEGATIVE_RESPONSE, sid, u8::from(nrc)]
}

#[derive(Debug)]
struct DownloadState {
    address: u32,
    size: u32,
    buffer: Vec<u8>,
    expected_block: u8,
}

/// Bootloader state shared between the receive loop and observers
pub struct SimulatedBootloader {
    config: EcuConfig,
    session: AtomicU8,
    source_address: AtomicU8,
    security_unlocked: RwLock<bool>,
    current_seed: RwLock<Option<u16>>,
    fingerprint: RwLock<u16>,
    erased: RwLock<bool>,
    download: RwLock<Option<DownloadState>>,
    /// Last committed image and its load address
    memory: RwLock<Option<(u32, Vec<u8>)>>,
    last_reset: RwLock<Option<u8>>,
}

impl SimulatedBootloader {
    pub fn new(config: EcuConfig) -> Self {
        let source_address = config.transport.ecu_address;
        Self {
            config,
            session: AtomicU8::new(session_type::DEFAULT),
            source_address: AtomicU8::new(source_address),
            security_unlocked: RwLock::new(false),
            current_seed: RwLock::new(None),
            fingerprint: RwLock::new(0),
            erased: RwLock::new(false),
            download: RwLock::new(None),
            memory: RwLock::new(None),
            last_reset: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &EcuConfig {
        &self.config
    }

    fn byte_order(&self) -> ByteOrder {
        self.config.transfer.byte_order
    }

    pub fn session(&self) -> u8 {
        self.session.load(Ordering::SeqCst)
    }

    /// J1939 address the ECU currently answers from
    pub fn source_address(&self) -> u8 {
        self.source_address.load(Ordering::SeqCst)
    }

    pub fn fingerprint(&self) -> u16 {
        *self.fingerprint.read()
    }

    pub fn is_unlocked(&self) -> bool {
        *self.security_unlocked.read()
    }

    /// Image committed by the last RequestTransferExit
    pub fn memory(&self) -> Option<Vec<u8>> {
        self.memory.read().as_ref().map(|(_, image)| image.clone())
    }

    pub fn memory_address(&self) -> Option<u32> {
        self.memory.read().as_ref().map(|(address, _)| *address)
    }

    pub fn last_reset(&self) -> Option<u8> {
        *self.last_reset.read()
    }

    /// Process a UDS request and return the responses in order
    ///
    /// Usually one response; ResponsePending answers precede the real one
    /// and an empty list means the request stays unanswered.
    pub fn process_request(&self, request: &[u8]) -> Vec<Vec<u8>> {
        let Some(&sid) = request.first() else {
            return vec![negative_response(
                0x00,
                NegativeResponseCode::IncorrectMessageLengthOrFormat,
            )];
        };

        match sid {
            service_id::DIAGNOSTIC_SESSION_CONTROL => vec![self.handle_session_control(request)],
            service_id::SECURITY_ACCESS => vec![self.handle_security_access(request)],
            service_id::WRITE_DATA_BY_ID => self.handle_write_data_by_id(request),
            service_id::READ_DATA_BY_ID => vec![self.handle_read_data_by_id(request)],
            service_id::ROUTINE_CONTROL => self.handle_routine_control(request),
            service_id::REQUEST_DOWNLOAD => vec![self.handle_request_download(request)],
            service_id::TRANSFER_DATA => vec![self.handle_transfer_data(request)],
            service_id::REQUEST_TRANSFER_EXIT => vec![self.handle_request_transfer_exit()],
            service_id::ECU_RESET => vec![self.handle_ecu_reset(request)],
            _ => {
                debug!(service_id = sid, "Unsupported service");
                vec![negative_response(
                    sid,
                    NegativeResponseCode::ServiceNotSupported,
                )]
            }
        }
    }

    fn handle_session_control(&self, request: &[u8]) -> Vec<u8> {
        let Some(&session) = request.get(1) else {
            return negative_response(
                service_id::DIAGNOSTIC_SESSION_CONTROL,
                NegativeResponseCode::IncorrectMessageLengthOrFormat,
            );
        };

        match session {
            session_type::DEFAULT | session_type::PROGRAMMING | session_type::EXTENDED => {
                let previous = self.session.swap(session, Ordering::SeqCst);
                if previous != session {
                    *self.security_unlocked.write() = false;
                    self.download.write().take();
                }
                info!(session = format!("0x{:02X}", session), "Session changed");
                // P2 = 50 ms, P2* = 500 ms
                positive_response(
                    service_id::DIAGNOSTIC_SESSION_CONTROL,
                    &[session, 0x00, 0x32, 0x01, 0xF4],
                )
            }
            _ => negative_response(
                service_id::DIAGNOSTIC_SESSION_CONTROL,
                NegativeResponseCode::SubFunctionNotSupported,
            ),
        }
    }

    fn handle_security_access(&self, request: &[u8]) -> Vec<u8> {
        match request.get(1..) {
            Some([security_level::REQUEST_SEED, ..]) => {
                if self.session() != session_type::PROGRAMMING {
                    return negative_response(
                        service_id::SECURITY_ACCESS,
                        NegativeResponseCode::ConditionsNotCorrect,
                    );
                }
                let seed = self
                    .config
                    .behavior
                    .fixed_seed
                    .unwrap_or_else(|| rand::thread_rng().gen());
                *self.current_seed.write() = Some(seed);
                info!(seed = format!("0x{:04X}", seed), "Security access: providing seed");

                let [lo, hi] = seed.to_le_bytes();
                positive_response(
                    service_id::SECURITY_ACCESS,
                    &[security_level::REQUEST_SEED, lo, hi],
                )
            }
            Some([security_level::SEND_KEY, hi, lo, ..]) => {
                let Some(seed) = self.current_seed.write().take() else {
                    return negative_response(
                        service_id::SECURITY_ACCESS,
                        NegativeResponseCode::RequestSequenceError,
                    );
                };
                let key = u16::from_be_bytes([*hi, *lo]);
                let expected = SecurityAccess::derive_key(seed);
                if key == expected {
                    info!("Security access: key accepted");
                    *self.security_unlocked.write() = true;
                    positive_response(service_id::SECURITY_ACCESS, &[security_level::SEND_KEY])
                } else {
                    warn!(
                        expected = format!("0x{:04X}", expected),
                        received = format!("0x{:04X}", key),
                        "Security access: invalid key"
                    );
                    negative_response(service_id::SECURITY_ACCESS, NegativeResponseCode::InvalidKey)
                }
            }
            _ => negative_response(
                service_id::SECURITY_ACCESS,
                NegativeResponseCode::SubFunctionNotSupported,
            ),
        }
    }

    fn pid(&self, request: &[u8]) -> Option<u16> {
        match request {
            [_, a, b, ..] => Some(self.byte_order().read_u16([*a, *b])),
            _ => None,
        }
    }

    fn handle_write_data_by_id(&self, request: &[u8]) -> Vec<Vec<u8>> {
        let sid = service_id::WRITE_DATA_BY_ID;
        let (Some(pid), Some(&value)) = (self.pid(request), request.get(3)) else {
            return vec![negative_response(
                sid,
                NegativeResponseCode::IncorrectMessageLengthOrFormat,
            )];
        };
        let echo = self.byte_order().u16_bytes(pid);

        if pid == FINGERPRINT.pid {
            if !self.is_unlocked() {
                return vec![negative_response(
                    sid,
                    NegativeResponseCode::SecurityAccessDenied,
                )];
            }
            *self.fingerprint.write() = value as u16;
            info!(fingerprint = value, "Fingerprint written");
            return vec![positive_response(sid, &echo)];
        }

        if pid == CAN_SA.pid {
            if self.config.behavior.ignore_source_address_write {
                debug!("Ignoring source address write");
                return Vec::new();
            }
            let previous = self.source_address.swap(value, Ordering::SeqCst);
            info!(
                from = format!("0x{:02X}", previous),
                to = format!("0x{:02X}", value),
                "Source address changed"
            );
            return vec![positive_response(sid, &echo)];
        }

        debug!(pid = format!("0x{:04X}", pid), "Write to unsupported PID");
        vec![negative_response(sid, NegativeResponseCode::RequestOutOfRange)]
    }

    fn handle_read_data_by_id(&self, request: &[u8]) -> Vec<u8> {
        let sid = service_id::READ_DATA_BY_ID;
        let Some(pid) = self.pid(request) else {
            return negative_response(sid, NegativeResponseCode::IncorrectMessageLengthOrFormat);
        };
        let Some(var) = data_identifiers::by_pid(pid) else {
            return negative_response(sid, NegativeResponseCode::RequestOutOfRange);
        };

        let value: u32 = if pid == FINGERPRINT.pid {
            self.fingerprint() as u32
        } else if pid == CAN_SA.pid {
            self.source_address() as u32
        } else if pid == RAW_FUEL_LEVEL.pid {
            self.config.sensors.fuel_level as u32
        } else if pid == RAW_TEMPERATURE.pid {
            self.config.sensors.temperature as u32
        } else {
            0
        };

        let mut data = self.byte_order().u16_bytes(pid).to_vec();
        data.extend_from_slice(&value.to_le_bytes()[..var.size.min(4) as usize]);
        positive_response(sid, &data)
    }

    fn handle_routine_control(&self, request: &[u8]) -> Vec<Vec<u8>> {
        let sid = service_id::ROUTINE_CONTROL;
        let routine_id = match request {
            [_, routine::START_ROUTINE, lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
            [_, _, _, _, ..] => {
                return vec![negative_response(
                    sid,
                    NegativeResponseCode::SubFunctionNotSupported,
                )]
            }
            _ => {
                return vec![negative_response(
                    sid,
                    NegativeResponseCode::IncorrectMessageLengthOrFormat,
                )]
            }
        };

        if routine_id != routine::ERASE_MEMORY {
            return vec![negative_response(sid, NegativeResponseCode::RequestOutOfRange)];
        }
        if !self.is_unlocked() {
            return vec![negative_response(
                sid,
                NegativeResponseCode::SecurityAccessDenied,
            )];
        }

        let mut responses: Vec<Vec<u8>> = (0..self.config.behavior.erase_pending_responses)
            .map(|_| negative_response(sid, NegativeResponseCode::ResponsePending))
            .collect();

        if self.config.behavior.fail_erase {
            warn!("Erase failed");
            responses.push(negative_response(
                sid,
                NegativeResponseCode::GeneralProgrammingFailure,
            ));
        } else {
            *self.erased.write() = true;
            info!("Flash erased");
            let [lo, hi] = routine::ERASE_MEMORY.to_le_bytes();
            responses.push(positive_response(sid, &[routine::START_ROUTINE, lo, hi]));
        }
        responses
    }

    fn handle_request_download(&self, request: &[u8]) -> Vec<u8> {
        let sid = service_id::REQUEST_DOWNLOAD;
        let (address, size) = match request {
            [_, download::DATA_FORMAT, download::ADDRESS_AND_LENGTH_FORMAT, a0, a1, a2, a3, l0, l1, l2, l3, ..] =>
            {
                let order = self.byte_order();
                (
                    order.read_u32([*a0, *a1, *a2, *a3]),
                    order.read_u32([*l0, *l1, *l2, *l3]),
                )
            }
            _ => return negative_response(sid, NegativeResponseCode::IncorrectMessageLengthOrFormat),
        };

        if !self.is_unlocked() {
            return negative_response(sid, NegativeResponseCode::SecurityAccessDenied);
        }
        if !*self.erased.read() {
            debug!("Download denied: flash not erased");
            return negative_response(sid, NegativeResponseCode::ConditionsNotCorrect);
        }
        if size == 0 || size > self.config.transfer.flash_size {
            return negative_response(sid, NegativeResponseCode::UploadDownloadNotAccepted);
        }

        info!(
            address = format!("0x{:08X}", address),
            size, "RequestDownload: initiating download"
        );
        *self.download.write() = Some(DownloadState {
            address,
            size,
            buffer: Vec::with_capacity(size as usize),
            expected_block: self.config.transfer.block_counter_start,
        });

        // lengthFormatIdentifier 0x20: two bytes of maxNumberOfBlockLength
        positive_response(sid, &[0x20, 0x04, 0x02])
    }

    fn handle_transfer_data(&self, request: &[u8]) -> Vec<u8> {
        let sid = service_id::TRANSFER_DATA;
        let Some(&block) = request.get(1) else {
            return negative_response(sid, NegativeResponseCode::IncorrectMessageLengthOrFormat);
        };

        let mut download = self.download.write();
        let Some(state) = download.as_mut() else {
            return negative_response(sid, NegativeResponseCode::RequestSequenceError);
        };

        if block != state.expected_block {
            warn!(
                expected = state.expected_block,
                received = block,
                "Wrong block sequence counter"
            );
            return negative_response(sid, NegativeResponseCode::WrongBlockSequenceCounter);
        }

        let data = &request[2..];
        if state.buffer.len() + data.len() > self.config.transfer.flash_size as usize {
            return negative_response(sid, NegativeResponseCode::TransferDataSuspended);
        }
        state.buffer.extend_from_slice(data);
        state.expected_block = match block {
            u8::MAX => self.config.transfer.block_counter_wrap,
            n => n + 1,
        };
        debug!(block, received = state.buffer.len(), "Block received");

        positive_response(sid, &[block])
    }

    fn handle_request_transfer_exit(&self) -> Vec<u8> {
        let sid = service_id::REQUEST_TRANSFER_EXIT;
        let Some(state) = self.download.write().take() else {
            return negative_response(sid, NegativeResponseCode::RequestSequenceError);
        };

        if (state.buffer.len() as u64) < state.size as u64 {
            warn!(
                received = state.buffer.len(),
                expected = state.size,
                "Transfer exit before all data arrived"
            );
        }
        info!(
            address = format!("0x{:08X}", state.address),
            bytes = state.buffer.len(),
            "Image committed"
        );
        *self.memory.write() = Some((state.address, state.buffer));
        *self.erased.write() = false;
        positive_response(sid, &[])
    }

    fn handle_ecu_reset(&self, request: &[u8]) -> Vec<u8> {
        let sid = service_id::ECU_RESET;
        let Some(&kind) = request.get(1) else {
            return negative_response(sid, NegativeResponseCode::IncorrectMessageLengthOrFormat);
        };

        match kind {
            reset_type::HARD_RESET
            | reset_type::KEY_OFF_ON_RESET
            | reset_type::SOFTWARE_RESET
            | reset_type::UDS_SOFTWARE_RESET => {
                info!(kind = format!("0x{:02X}", kind), "ECU reset");
                *self.last_reset.write() = Some(kind);
                self.session.store(session_type::DEFAULT, Ordering::SeqCst);
                *self.security_unlocked.write() = false;
                self.download.write().take();
                positive_response(sid, &[kind])
            }
            _ => negative_response(sid, NegativeResponseCode::SubFunctionNotSupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BehaviorConfig;

    fn ecu_with(behavior: BehaviorConfig) -> SimulatedBootloader {
        let mut config = EcuConfig::default();
        config.behavior = behavior;
        SimulatedBootloader::new(config)
    }

    fn unlocked() -> SimulatedBootloader {
        let ecu = ecu_with(BehaviorConfig {
            fixed_seed: Some(0x1234),
            ..Default::default()
        });
        ecu.process_request(&[0x10, 0x02]);
        ecu.process_request(&[0x27, 0x01]);
        let [hi, lo] = SecurityAccess::derive_key(0x1234).to_be_bytes();
        assert_eq!(ecu.process_request(&[0x27, 0x02, hi, lo]), vec![vec![0x67, 0x02]]);
        ecu
    }

    #[test]
    fn test_session_control() {
        let ecu = ecu_with(BehaviorConfig::default());
        assert_eq!(
            ecu.process_request(&[0x10, 0x02]),
            vec![vec![0x50, 0x02, 0x00, 0x32, 0x01, 0xF4]]
        );
        assert_eq!(ecu.session(), 0x02);
        assert_eq!(ecu.process_request(&[0x10, 0x44]), vec![vec![0x7F, 0x10, 0x12]]);
    }

    #[test]
    fn test_seed_is_little_endian() {
        let ecu = ecu_with(BehaviorConfig {
            fixed_seed: Some(0x1234),
            ..Default::default()
        });
        ecu.process_request(&[0x10, 0x02]);
        assert_eq!(
            ecu.process_request(&[0x27, 0x01]),
            vec![vec![0x67, 0x01, 0x34, 0x12]]
        );
    }

    #[test]
    fn test_wrong_key_rejected() {
        let ecu = ecu_with(BehaviorConfig {
            fixed_seed: Some(0x1234),
            ..Default::default()
        });
        ecu.process_request(&[0x10, 0x02]);
        ecu.process_request(&[0x27, 0x01]);
        assert_eq!(
            ecu.process_request(&[0x27, 0x02, 0x00, 0x00]),
            vec![vec![0x7F, 0x27, 0x35]]
        );
        assert!(!ecu.is_unlocked());
    }

    #[test]
    fn test_fingerprint_requires_unlock() {
        let ecu = ecu_with(BehaviorConfig::default());
        assert_eq!(
            ecu.process_request(&[0x2E, 0x15, 0x00, 0x01]),
            vec![vec![0x7F, 0x2E, 0x33]]
        );

        let ecu = unlocked();
        assert_eq!(
            ecu.process_request(&[0x2E, 0x15, 0x00, 0x01]),
            vec![vec![0x6E, 0x15, 0x00]]
        );
        assert_eq!(ecu.fingerprint(), 1);
        assert_eq!(
            ecu.process_request(&[0x22, 0x15, 0x00]),
            vec![vec![0x62, 0x15, 0x00, 0x01, 0x00]]
        );
    }

    #[test]
    fn test_sensor_readings() {
        let ecu = ecu_with(BehaviorConfig::default());
        assert_eq!(
            ecu.process_request(&[0x22, 0x00, 0x18]),
            vec![vec![0x62, 0x00, 0x18, 0x00, 0x02]]
        );
        assert_eq!(
            ecu.process_request(&[0x22, 0x00, 0x19]),
            vec![vec![0x62, 0x00, 0x19, 0xD7, 0x00]]
        );
    }

    #[test]
    fn test_source_address_write() {
        let ecu = ecu_with(BehaviorConfig::default());
        assert_eq!(
            ecu.process_request(&[0x2E, 0x00, 0x11, 0x42]),
            vec![vec![0x6E, 0x00, 0x11]]
        );
        assert_eq!(ecu.source_address(), 0x42);
        assert_eq!(
            ecu.process_request(&[0x22, 0x00, 0x11]),
            vec![vec![0x62, 0x00, 0x11, 0x42]]
        );

        let silent = ecu_with(BehaviorConfig {
            ignore_source_address_write: true,
            ..Default::default()
        });
        assert!(silent.process_request(&[0x2E, 0x00, 0x11, 0x42]).is_empty());
        assert_eq!(silent.source_address(), 0x6A);
    }

    #[test]
    fn test_erase_pending_then_result() {
        let ecu = unlocked();
        let ecu = SimulatedBootloader {
            config: EcuConfig {
                behavior: BehaviorConfig {
                    erase_pending_responses: 2,
                    ..Default::default()
                },
                ..EcuConfig::default()
            },
            ..ecu
        };
        assert_eq!(
            ecu.process_request(&[0x31, 0x01, 0xFF, 0x00]),
            vec![
                vec![0x7F, 0x31, 0x78],
                vec![0x7F, 0x31, 0x78],
                vec![0x71, 0x01, 0xFF, 0x00],
            ]
        );
    }

    #[test]
    fn test_download_and_commit() {
        let ecu = unlocked();
        ecu.process_request(&[0x31, 0x01, 0xFF, 0x00]);
        assert_eq!(
            ecu.process_request(&[
                0x34, 0x00, 0x44, 0x08, 0x00, 0x78, 0x00, 0x00, 0x00, 0x00, 0x04
            ]),
            vec![vec![0x74, 0x20, 0x04, 0x02]]
        );
        assert_eq!(
            ecu.process_request(&[0x36, 0x01, 0xDE, 0xAD]),
            vec![vec![0x76, 0x01]]
        );
        assert_eq!(
            ecu.process_request(&[0x36, 0x01, 0xBE, 0xEF]),
            vec![vec![0x7F, 0x36, 0x73]]
        );
        assert_eq!(
            ecu.process_request(&[0x36, 0x02, 0xBE, 0xEF]),
            vec![vec![0x76, 0x02]]
        );
        assert_eq!(ecu.process_request(&[0x37]), vec![vec![0x77]]);
        assert_eq!(ecu.memory(), Some(vec![0xDE, 0xAD, 0xBE, 0xEF]));
        assert_eq!(ecu.memory_address(), Some(0x0800_7800));
    }

    #[test]
    fn test_download_requires_erase() {
        let ecu = unlocked();
        assert_eq!(
            ecu.process_request(&[
                0x34, 0x00, 0x44, 0x08, 0x00, 0x78, 0x00, 0x00, 0x00, 0x00, 0x04
            ]),
            vec![vec![0x7F, 0x34, 0x22]]
        );
    }

    #[test]
    fn test_fail_erase() {
        let ecu = unlocked();
        let ecu = SimulatedBootloader {
            config: EcuConfig {
                behavior: BehaviorConfig {
                    fail_erase: true,
                    ..Default::default()
                },
                ..EcuConfig::default()
            },
            ..ecu
        };
        assert_eq!(
            ecu.process_request(&[0x31, 0x01, 0xFF, 0x00]),
            vec![vec![0x7F, 0x31, 0x72]]
        );
    }

    #[test]
    fn test_reset_records_kind() {
        let ecu = unlocked();
        assert_eq!(ecu.process_request(&[0x11, 0x60]), vec![vec![0x51, 0x60]]);
        assert_eq!(ecu.last_reset(), Some(0x60));
        assert_eq!(ecu.session(), 0x01);
        assert!(!ecu.is_unlocked());
    }

    #[test]
    fn test_unsupported_service() {
        let ecu = ecu_with(BehaviorConfig::default());
        assert_eq!(ecu.process_request(&[0x3E, 0x00]), vec![vec![0x7F, 0x3E, 0x11]]);
    }
}

//! Request builders and response verifiers
//!
//! Every request fits a single classic CAN frame (RequestDownload is the
//! exception and is split into a first and a consecutive frame by hand).
//! Payloads carry the ISO-TP PCI byte first and are padded with 0xFF.
//!
//! Verifiers never fail loudly: a response either is the expected positive
//! answer or it is not. [`negative_response`] is there for callers that want
//! to tell a rejected request from noise.

use super::data_identifiers::{self, UdsVar};
use super::{
    download, reset_type, routine, security_level, service_id, ByteOrder, NegativeResponseCode,
    UdsError,
};

/// One classic CAN payload
pub type Payload = [u8; 8];

pub const PADDING: u8 = 0xFF;

/// Build a payload from `bytes`, padding the remainder
pub fn padded(bytes: &[u8]) -> Payload {
    let mut payload = [PADDING; 8];
    let n = bytes.len().min(8);
    payload[..n].copy_from_slice(&bytes[..n]);
    payload
}

/// Single-frame request: `[len, sid, params..]`
fn single_frame(sid: u8, params: &[u8]) -> Payload {
    let mut bytes = Vec::with_capacity(8);
    bytes.push(params.len() as u8 + 1);
    bytes.push(sid);
    bytes.extend_from_slice(params);
    padded(&bytes)
}

fn is_positive(data: &[u8], sid: u8) -> bool {
    data.get(1) == Some(&service_id::positive_response(sid))
}

/// `[len, 0x7F, sid, nrc]` addressed to `sid`
pub fn negative_response(data: &[u8], sid: u8) -> Option<NegativeResponseCode> {
    match data {
        [_, service_id::NEGATIVE_RESPONSE, rejected, nrc, ..] if *rejected == sid => {
            Some(NegativeResponseCode::from(*nrc))
        }
        _ => None,
    }
}

/// Same as [`negative_response`] but as an error value
pub fn check_negative(data: &[u8], sid: u8) -> Result<(), UdsError> {
    match negative_response(data, sid) {
        Some(nrc) => Err(UdsError::NegativeResponse {
            service_id: sid,
            nrc,
        }),
        None => Ok(()),
    }
}

fn pid_field(data: &[u8], order: ByteOrder) -> Option<u16> {
    match data {
        [_, _, a, b, ..] => Some(order.read_u16([*a, *b])),
        _ => None,
    }
}

// =============================================================================
// DiagnosticSessionControl (0x10)
// =============================================================================

pub struct DiagnosticSessionControl;

impl DiagnosticSessionControl {
    pub fn request(session: u8) -> Payload {
        single_frame(service_id::DIAGNOSTIC_SESSION_CONTROL, &[session])
    }

    pub fn verify(data: &[u8]) -> bool {
        is_positive(data, service_id::DIAGNOSTIC_SESSION_CONTROL)
    }
}

// =============================================================================
// SecurityAccess (0x27)
// =============================================================================

pub struct SecurityAccess;

impl SecurityAccess {
    pub fn request_seed() -> Payload {
        single_frame(service_id::SECURITY_ACCESS, &[security_level::REQUEST_SEED])
    }

    /// Extract the seed from a positive answer
    ///
    /// The seed is little-endian in the payload while the key goes out
    /// big-endian (see [`Self::send_key`]). Bootloaders in the field rely on
    /// exactly this pairing.
    pub fn verify_seed(data: &[u8]) -> Option<u16> {
        match data {
            [_, 0x67, security_level::REQUEST_SEED, lo, hi, ..] => {
                Some(u16::from_le_bytes([*lo, *hi]))
            }
            _ => None,
        }
    }

    /// Key expected by the bootloader; weak, but fixed by deployed firmware
    pub fn derive_key(seed: u16) -> u16 {
        (seed ^ 0xAA55) | seed
    }

    pub fn send_key(key: u16) -> Payload {
        let [hi, lo] = key.to_be_bytes();
        single_frame(
            service_id::SECURITY_ACCESS,
            &[security_level::SEND_KEY, hi, lo],
        )
    }

    pub fn verify_key(data: &[u8]) -> bool {
        is_positive(data, service_id::SECURITY_ACCESS)
            && data.get(2) == Some(&security_level::SEND_KEY)
    }
}

// =============================================================================
// WriteDataByIdentifier (0x2E)
// =============================================================================

pub struct WriteDataById;

impl WriteDataById {
    /// `[3 + size, 0x2E, pid, value (LE, size bytes)]`
    pub fn request(var: &UdsVar, value: u32, order: ByteOrder) -> Result<Payload, UdsError> {
        if var.size > 4 {
            return Err(UdsError::ValueTooLarge { size: var.size });
        }
        let mut params = order.u16_bytes(var.pid).to_vec();
        params.extend_from_slice(&value.to_le_bytes()[..var.size as usize]);
        Ok(single_frame(service_id::WRITE_DATA_BY_ID, &params))
    }

    /// Fingerprint write: a single value byte behind the PID
    pub fn fingerprint(value: u8, order: ByteOrder) -> Payload {
        let [b0, b1] = order.u16_bytes(data_identifiers::FINGERPRINT.pid);
        [
            0x04,
            service_id::WRITE_DATA_BY_ID,
            b0,
            b1,
            value,
            PADDING,
            PADDING,
            PADDING,
        ]
    }

    pub fn verify(data: &[u8], pid: u16, order: ByteOrder) -> bool {
        is_positive(data, service_id::WRITE_DATA_BY_ID) && pid_field(data, order) == Some(pid)
    }
}

// =============================================================================
// ReadDataByIdentifier (0x22)
// =============================================================================

pub struct ReadDataById;

impl ReadDataById {
    pub fn request(pid: u16, order: ByteOrder) -> Payload {
        single_frame(service_id::READ_DATA_BY_ID, &order.u16_bytes(pid))
    }

    pub fn verify(data: &[u8], pid: u16, order: ByteOrder) -> bool {
        is_positive(data, service_id::READ_DATA_BY_ID) && pid_field(data, order) == Some(pid)
    }

    /// Value bytes behind the PID, accumulated little-endian
    ///
    /// Length comes from the PCI byte (`len - 3`); anything that would not fit
    /// a `u32` or lies beyond the received bytes is ignored.
    pub fn value(data: &[u8]) -> u32 {
        let declared = match data.first() {
            Some(&len) if len > 3 => (len - 3) as usize,
            _ => return 0,
        };
        data.iter()
            .skip(4)
            .take(declared.min(4))
            .enumerate()
            .fold(0u32, |acc, (i, b)| acc | (*b as u32) << (8 * i))
    }
}

// =============================================================================
// RoutineControl (0x31)
// =============================================================================

pub struct RoutineControl;

impl RoutineControl {
    /// Start the erase routine; routine id 0x00FF goes out little-endian
    pub fn erase_memory() -> Payload {
        let [lo, hi] = routine::ERASE_MEMORY.to_le_bytes();
        single_frame(
            service_id::ROUTINE_CONTROL,
            &[routine::START_ROUTINE, lo, hi],
        )
    }

    pub fn verify_erase(data: &[u8]) -> bool {
        match data {
            [_, 0x71, routine::START_ROUTINE, lo, hi, ..] => {
                u16::from_le_bytes([*lo, *hi]) == routine::ERASE_MEMORY
            }
            _ => false,
        }
    }
}

// =============================================================================
// RequestDownload (0x34)
// =============================================================================

/// RequestDownload is 11 bytes long and therefore segmented
pub struct RequestDownload;

impl RequestDownload {
    /// SID, format, address-and-length format, 4 + 4 bytes
    pub const LENGTH: u8 = 0x0B;

    pub fn first_frame(address: u32, order: ByteOrder) -> Payload {
        let addr = order.u32_bytes(address);
        [
            0x10,
            Self::LENGTH,
            service_id::REQUEST_DOWNLOAD,
            download::DATA_FORMAT,
            download::ADDRESS_AND_LENGTH_FORMAT,
            addr[0],
            addr[1],
            addr[2],
        ]
    }

    pub fn consecutive_frame(address: u32, length: u32, order: ByteOrder) -> Payload {
        let addr = order.u32_bytes(address);
        let len = order.u32_bytes(length);
        padded(&[0x21, addr[3], len[0], len[1], len[2], len[3]])
    }

    pub fn verify(data: &[u8]) -> bool {
        is_positive(data, service_id::REQUEST_DOWNLOAD)
    }
}

// =============================================================================
// TransferData (0x36) / RequestTransferExit (0x37)
// =============================================================================

pub struct TransferData;

impl TransferData {
    /// Block acknowledgement echoing the block sequence counter
    pub fn verify_block(data: &[u8], block_sequence: u8) -> bool {
        is_positive(data, service_id::TRANSFER_DATA) && data.get(2) == Some(&block_sequence)
    }
}

pub struct RequestTransferExit;

impl RequestTransferExit {
    pub fn request() -> Payload {
        single_frame(service_id::REQUEST_TRANSFER_EXIT, &[])
    }

    pub fn verify(data: &[u8]) -> bool {
        is_positive(data, service_id::REQUEST_TRANSFER_EXIT)
    }
}

// =============================================================================
// ECUReset (0x11)
// =============================================================================

pub struct EcuReset;

impl EcuReset {
    pub fn request(kind: u8) -> Payload {
        single_frame(service_id::ECU_RESET, &[kind])
    }

    /// Restart into the bootloader
    pub fn uds_reset() -> Payload {
        Self::request(reset_type::UDS_SOFTWARE_RESET)
    }

    /// Restart into the application
    pub fn software_reset() -> Payload {
        Self::request(reset_type::SOFTWARE_RESET)
    }

    pub fn verify(data: &[u8], kind: u8) -> bool {
        is_positive(data, service_id::ECU_RESET) && data.get(2) == Some(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_session_control_programming() {
        assert_eq!(
            DiagnosticSessionControl::request(0x02),
            [0x02, 0x10, 0x02, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert!(DiagnosticSessionControl::verify(&[0x06, 0x50, 0x02, 0x00]));
        assert!(!DiagnosticSessionControl::verify(&[0x03, 0x7F, 0x10, 0x22]));
        assert!(!DiagnosticSessionControl::verify(&[]));
    }

    #[test]
    fn test_seed_parsed_little_endian() {
        assert_eq!(
            SecurityAccess::request_seed(),
            [0x02, 0x27, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        let seed = SecurityAccess::verify_seed(&[0x04, 0x67, 0x01, 0x34, 0x12, 0xFF, 0xFF, 0xFF]);
        assert_eq!(seed, Some(0x1234));
        assert_eq!(SecurityAccess::verify_seed(&[0x04, 0x67, 0x02, 0x34, 0x12]), None);
        assert_eq!(SecurityAccess::verify_seed(&[0x02, 0x67, 0x01]), None);
    }

    #[rstest]
    #[case(0x0000, 0xAA55)]
    #[case(0x1234, 0xBA75)]
    #[case(0xFFFF, 0xFFFF)]
    #[case(0xAA55, 0xAA55)]
    fn test_key_derivation(#[case] seed: u16, #[case] key: u16) {
        assert_eq!(SecurityAccess::derive_key(seed), key);
        assert_eq!(SecurityAccess::derive_key(seed), SecurityAccess::derive_key(seed));
    }

    #[test]
    fn test_key_sent_big_endian() {
        assert_eq!(
            SecurityAccess::send_key(0xBA75),
            [0x04, 0x27, 0x02, 0xBA, 0x75, 0xFF, 0xFF, 0xFF]
        );
        assert!(SecurityAccess::verify_key(&[0x02, 0x67, 0x02]));
        assert!(!SecurityAccess::verify_key(&[0x02, 0x67, 0x01]));
        assert!(!SecurityAccess::verify_key(&[0x03, 0x7F, 0x27, 0x35]));
    }

    #[test]
    fn test_write_fingerprint_frame() {
        assert_eq!(
            WriteDataById::fingerprint(0xAA, ByteOrder::Big),
            [0x04, 0x2E, 0x15, 0x00, 0xAA, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(
            WriteDataById::fingerprint(0xAA, ByteOrder::Little),
            [0x04, 0x2E, 0x00, 0x15, 0xAA, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_write_value_little_endian() {
        let frame = WriteDataById::request(&data_identifiers::FULL_FUEL_TANK, 0x0102, ByteOrder::Big)
            .unwrap();
        assert_eq!(frame, [0x05, 0x2E, 0x00, 0x13, 0x02, 0x01, 0xFF, 0xFF]);

        let frame = WriteDataById::request(&data_identifiers::CAN_SA, 0x1FF, ByteOrder::Little)
            .unwrap();
        assert_eq!(frame, [0x04, 0x2E, 0x11, 0x00, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_write_rejects_large_values() {
        let vin = data_identifiers::by_name("vindid").unwrap();
        assert_eq!(
            WriteDataById::request(vin, 0, ByteOrder::Big),
            Err(UdsError::ValueTooLarge { size: 17 })
        );
        let options = data_identifiers::by_name("idoptvms").unwrap();
        assert_eq!(
            WriteDataById::request(options, 0, ByteOrder::Big),
            Err(UdsError::ValueTooLarge { size: 256 })
        );
    }

    #[rstest]
    #[case(ByteOrder::Big)]
    #[case(ByteOrder::Little)]
    fn test_write_verify_pid_per_order(#[case] order: ByteOrder) {
        let [a, b] = order.u16_bytes(0x1500);
        assert!(WriteDataById::verify(&[0x03, 0x6E, a, b], 0x1500, order));
        assert!(!WriteDataById::verify(&[0x03, 0x6E, b, a], 0x1500, order));
        assert!(!WriteDataById::verify(&[0x03, 0x62, a, b], 0x1500, order));
    }

    #[rstest]
    #[case(ByteOrder::Big)]
    #[case(ByteOrder::Little)]
    fn test_read_pid_roundtrip(#[case] order: ByteOrder) {
        for var in data_identifiers::CATALOG {
            let request = ReadDataById::request(var.pid, order);
            assert_eq!(pid_field(&request, order), Some(var.pid));
            let mut response = request;
            response[1] = 0x62;
            assert!(ReadDataById::verify(&response, var.pid, order));
        }
    }

    #[test]
    fn test_read_value() {
        assert_eq!(ReadDataById::value(&[0x05, 0x62, 0x15, 0x00, 0xAA, 0x01, 0xFF, 0xFF]), 0x01AA);
        assert_eq!(ReadDataById::value(&[0x04, 0x62, 0x00, 0x11, 0x6A, 0xFF, 0xFF, 0xFF]), 0x6A);
        assert_eq!(ReadDataById::value(&[0x03, 0x62, 0x00, 0x11, 0x6A]), 0);
        // Declared longer than received
        assert_eq!(ReadDataById::value(&[0x07, 0x62, 0x00, 0x11, 0x01]), 0x01);
    }

    #[test]
    fn test_erase_routine() {
        assert_eq!(
            RoutineControl::erase_memory(),
            [0x04, 0x31, 0x01, 0xFF, 0x00, 0xFF, 0xFF, 0xFF]
        );
        assert!(RoutineControl::verify_erase(&[0x04, 0x71, 0x01, 0xFF, 0x00]));
        assert!(!RoutineControl::verify_erase(&[0x04, 0x71, 0x01, 0x00, 0xFF]));
        assert!(!RoutineControl::verify_erase(&[0x04, 0x71, 0x02, 0xFF, 0x00]));
    }

    #[test]
    fn test_request_download_frames_big_endian() {
        let addr = download::DEFAULT_MEMORY_ADDRESS;
        assert_eq!(
            RequestDownload::first_frame(addr, ByteOrder::Big),
            [0x10, 0x0B, 0x34, 0x00, 0x44, 0x08, 0x00, 0x78]
        );
        assert_eq!(
            RequestDownload::consecutive_frame(addr, 0x0001_0400, ByteOrder::Big),
            [0x21, 0x00, 0x00, 0x01, 0x04, 0x00, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_request_download_frames_little_endian() {
        let addr = download::DEFAULT_MEMORY_ADDRESS;
        assert_eq!(
            RequestDownload::first_frame(addr, ByteOrder::Little),
            [0x10, 0x0B, 0x34, 0x00, 0x44, 0x00, 0x78, 0x00]
        );
        assert_eq!(
            RequestDownload::consecutive_frame(addr, 10, ByteOrder::Little),
            [0x21, 0x08, 0x0A, 0x00, 0x00, 0x00, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_transfer_block_ack() {
        assert!(TransferData::verify_block(&[0x02, 0x76, 0x01], 0x01));
        assert!(!TransferData::verify_block(&[0x02, 0x76, 0x02], 0x01));
        assert!(!TransferData::verify_block(&[0x03, 0x7F, 0x36, 0x73], 0x01));
    }

    #[test]
    fn test_transfer_exit_and_reset() {
        assert_eq!(
            RequestTransferExit::request(),
            [0x01, 0x37, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert!(RequestTransferExit::verify(&[0x01, 0x77]));

        assert_eq!(EcuReset::uds_reset(), [0x02, 0x11, 0x60, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(EcuReset::verify(&[0x02, 0x51, 0x60], reset_type::UDS_SOFTWARE_RESET));
        assert!(!EcuReset::verify(&[0x02, 0x51, 0x03], reset_type::UDS_SOFTWARE_RESET));
    }

    #[test]
    fn test_negative_response() {
        let data = [0x03, 0x7F, 0x31, 0x78, 0xFF, 0xFF, 0xFF, 0xFF];
        assert_eq!(
            negative_response(&data, service_id::ROUTINE_CONTROL),
            Some(NegativeResponseCode::ResponsePending)
        );
        assert_eq!(negative_response(&data, service_id::ECU_RESET), None);
        assert!(check_negative(&data, service_id::ROUTINE_CONTROL).is_err());
    }
}

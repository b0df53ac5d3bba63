//! UDS Negative Response Codes (NRC)

use std::fmt;

/// Negative response codes a bootloader is expected to return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegativeResponseCode {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLengthOrFormat,
    BusyRepeatRequest,
    ConditionsNotCorrect,
    RequestSequenceError,
    RequestOutOfRange,
    SecurityAccessDenied,
    InvalidKey,
    ExceededNumberOfAttempts,
    RequiredTimeDelayNotExpired,
    UploadDownloadNotAccepted,
    TransferDataSuspended,
    GeneralProgrammingFailure,
    WrongBlockSequenceCounter,
    /// The ECU accepted the request but needs more time
    ResponsePending,
    SubFunctionNotSupportedInActiveSession,
    ServiceNotSupportedInActiveSession,
    Other(u8),
}

const TABLE: &[(u8, NegativeResponseCode, &str)] = &[
    (0x10, NegativeResponseCode::GeneralReject, "general reject"),
    (0x11, NegativeResponseCode::ServiceNotSupported, "service not supported"),
    (0x12, NegativeResponseCode::SubFunctionNotSupported, "sub-function not supported"),
    (0x13, NegativeResponseCode::IncorrectMessageLengthOrFormat, "incorrect message length or format"),
    (0x21, NegativeResponseCode::BusyRepeatRequest, "busy, repeat request"),
    (0x22, NegativeResponseCode::ConditionsNotCorrect, "conditions not correct"),
    (0x24, NegativeResponseCode::RequestSequenceError, "request sequence error"),
    (0x31, NegativeResponseCode::RequestOutOfRange, "request out of range"),
    (0x33, NegativeResponseCode::SecurityAccessDenied, "security access denied"),
    (0x35, NegativeResponseCode::InvalidKey, "invalid key"),
    (0x36, NegativeResponseCode::ExceededNumberOfAttempts, "exceeded number of attempts"),
    (0x37, NegativeResponseCode::RequiredTimeDelayNotExpired, "required time delay not expired"),
    (0x70, NegativeResponseCode::UploadDownloadNotAccepted, "upload/download not accepted"),
    (0x71, NegativeResponseCode::TransferDataSuspended, "transfer data suspended"),
    (0x72, NegativeResponseCode::GeneralProgrammingFailure, "general programming failure"),
    (0x73, NegativeResponseCode::WrongBlockSequenceCounter, "wrong block sequence counter"),
    (0x78, NegativeResponseCode::ResponsePending, "response pending"),
    (0x7E, NegativeResponseCode::SubFunctionNotSupportedInActiveSession, "sub-function not supported in active session"),
    (0x7F, NegativeResponseCode::ServiceNotSupportedInActiveSession, "service not supported in active session"),
];

impl From<u8> for NegativeResponseCode {
    fn from(value: u8) -> Self {
        TABLE
            .iter()
            .find(|(code, _, _)| *code == value)
            .map(|(_, nrc, _)| *nrc)
            .unwrap_or(Self::Other(value))
    }
}

impl From<NegativeResponseCode> for u8 {
    fn from(nrc: NegativeResponseCode) -> Self {
        if let NegativeResponseCode::Other(v) = nrc {
            return v;
        }
        TABLE
            .iter()
            .find(|(_, n, _)| *n == nrc)
            .map(|(code, _, _)| *code)
            .unwrap_or_default()
    }
}

impl fmt::UpperHex for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&u8::from(*self), f)
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match TABLE.iter().find(|(_, n, _)| n == self) {
            Some((_, _, text)) => f.write_str(text),
            None => write!(f, "unknown NRC 0x{:02X}", u8::from(*self)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nrc_byte_roundtrip() {
        for code in 0..=u8::MAX {
            assert_eq!(u8::from(NegativeResponseCode::from(code)), code);
        }
    }

    #[test]
    fn test_nrc_display() {
        assert_eq!(NegativeResponseCode::from(0x35).to_string(), "invalid key");
        assert_eq!(NegativeResponseCode::from(0x99).to_string(), "unknown NRC 0x99");
        assert_eq!(format!("{:02X}", NegativeResponseCode::ResponsePending), "78");
    }
}

//! ISO 15765-2 (ISO-TP) sender side for TransferData
//!
//! The firmware image is cut into blocks of at most `max_block_length` bytes
//! (SID + block sequence + data). Each block travels as one segmented
//! message:
//!
//! ```text
//! FF  [0x1L LL 36 seq d0 d1 d2 d3]     L = block length incl. 2 header bytes
//! CF  [0x2n d  d  d   d  d  d  d ]     n = 1, 2, .. 15, 0, 1 ..
//! FC  [0x3s bs st ..]                  from the ECU, after FF and after bs CFs
//! ```
//!
//! Only segmentation is implemented; the tester never receives multi-frame
//! messages.

use std::time::Duration;

use bytes::Bytes;

use crate::uds::service_id;
use crate::uds::services::{padded, Payload};

/// Protocol control information, high nibble of the first byte
pub mod pci {
    pub const SINGLE_FRAME: u8 = 0x0;
    pub const FIRST_FRAME: u8 = 0x1;
    pub const CONSECUTIVE_FRAME: u8 = 0x2;
    pub const FLOW_CONTROL: u8 = 0x3;
}

/// 1024 data bytes plus SID and block sequence, the ECU's receive buffer
pub const DEFAULT_MAX_BLOCK_LENGTH: usize = 1026;
/// FF_DL is 12 bits wide
pub const MAX_FIRST_FRAME_LENGTH: usize = 0xFFF;
/// Bytes each block spends on SID + block sequence
pub const BLOCK_HEADER_LENGTH: usize = 2;

const FIRST_FRAME_DATA: usize = 4;
const CONSECUTIVE_FRAME_DATA: usize = 7;

pub fn frame_type(data: &[u8]) -> Option<u8> {
    data.first().map(|b| b >> 4)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    ContinueToSend,
    Wait,
    Overflow,
    Reserved(u8),
}

impl From<u8> for FlowStatus {
    fn from(value: u8) -> Self {
        match value & 0x0F {
            0 => Self::ContinueToSend,
            1 => Self::Wait,
            2 => Self::Overflow,
            other => Self::Reserved(other),
        }
    }
}

impl From<FlowStatus> for u8 {
    fn from(status: FlowStatus) -> Self {
        match status {
            FlowStatus::ContinueToSend => 0,
            FlowStatus::Wait => 1,
            FlowStatus::Overflow => 2,
            FlowStatus::Reserved(v) => v & 0x0F,
        }
    }
}

/// Last flow control frame received from the ECU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControl {
    pub frame_type: u8,
    pub flow_status: FlowStatus,
    /// Consecutive frames allowed before the next FC, 0 = no limit
    pub block_size: u8,
    /// Raw STmin byte
    pub separation_time: u8,
}

impl FlowControl {
    pub fn parse(data: &[u8]) -> Option<Self> {
        match data {
            [first, bs, st, ..] if first >> 4 == pci::FLOW_CONTROL => Some(Self {
                frame_type: pci::FLOW_CONTROL,
                flow_status: FlowStatus::from(*first),
                block_size: *bs,
                separation_time: *st,
            }),
            _ => None,
        }
    }

    pub fn frame(flow_status: FlowStatus, block_size: u8, separation_time: u8) -> Payload {
        padded(&[
            (pci::FLOW_CONTROL << 4) | u8::from(flow_status),
            block_size,
            separation_time,
        ])
    }

    pub fn separation_time(&self) -> Duration {
        decode_st_min(self.separation_time)
    }

    /// Interval between consecutive frames, never below `floor`
    pub fn pacing(&self, floor: Duration) -> Duration {
        self.separation_time().max(floor)
    }
}

/// STmin: 0..=127 ms, 0xF1..=0xF9 in 100 µs steps, anything else reads as 127 ms
pub fn decode_st_min(raw: u8) -> Duration {
    match raw {
        0x00..=0x7F => Duration::from_millis(raw as u64),
        0xF1..=0xF9 => Duration::from_micros((raw - 0xF0) as u64 * 100),
        _ => Duration::from_millis(0x7F),
    }
}

/// Block layout and counter behaviour agreed with the bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLimits {
    /// Bytes per block including the 2 header bytes
    pub max_block_length: usize,
    /// Sequence number of the first block
    pub block_counter_start: u8,
    /// Value the block counter takes after 0xFF
    pub block_counter_wrap: u8,
}

impl Default for BlockLimits {
    fn default() -> Self {
        Self {
            max_block_length: DEFAULT_MAX_BLOCK_LENGTH,
            block_counter_start: 1,
            block_counter_wrap: 1,
        }
    }
}

impl BlockLimits {
    /// Data bytes per full block
    pub fn block_payload(&self) -> usize {
        self.max_block_length - BLOCK_HEADER_LENGTH
    }

    fn sanitized(mut self) -> Self {
        self.max_block_length = self
            .max_block_length
            .clamp(BLOCK_HEADER_LENGTH + 1, MAX_FIRST_FRAME_LENGTH);
        self
    }
}

/// Number of TransferData blocks needed for `len` bytes
pub fn block_count(len: usize, limits: &BlockLimits) -> usize {
    len.div_ceil(limits.sanitized().block_payload())
}

/// Progress of one firmware transfer
#[derive(Debug, Clone)]
pub struct TransferSession {
    image: Bytes,
    limits: BlockLimits,
    /// Next unsent image byte
    offset: usize,
    /// Image length plus 2 header bytes per block
    total: usize,
    sent: usize,
    block_len: usize,
    block_sent: usize,
    block_sequence: Option<u8>,
    frame_sequence: u8,
    /// Consecutive frames left before the next FC, `None` when unlimited
    allowance: Option<usize>,
}

impl TransferSession {
    pub fn new(image: Bytes, limits: BlockLimits) -> Self {
        let limits = limits.sanitized();
        let total = image.len() + BLOCK_HEADER_LENGTH * block_count(image.len(), &limits);
        Self {
            image,
            limits,
            offset: 0,
            total,
            sent: 0,
            block_len: 0,
            block_sent: 0,
            block_sequence: None,
            frame_sequence: 0,
            allowance: Some(0),
        }
    }

    /// Rewind to the first block
    pub fn reset(&mut self) {
        *self = Self::new(self.image.clone(), self.limits);
    }

    pub fn image(&self) -> &Bytes {
        &self.image
    }

    pub fn total_bytes(&self) -> usize {
        self.total
    }

    pub fn bytes_sent(&self) -> usize {
        self.sent
    }

    pub fn remaining(&self) -> usize {
        self.total - self.sent
    }

    /// Length of the current block including its header
    pub fn block_length(&self) -> usize {
        self.block_len
    }

    /// Sequence number of the block in flight (0 before the first block)
    pub fn block_sequence(&self) -> u8 {
        self.block_sequence.unwrap_or(0)
    }

    pub fn frame_sequence(&self) -> u8 {
        self.frame_sequence
    }

    pub fn is_complete(&self) -> bool {
        self.sent == self.total
    }

    pub fn block_complete(&self) -> bool {
        self.block_sent == self.block_len
    }

    /// The FC allowance is used up and the block still has data
    pub fn awaiting_flow_control(&self) -> bool {
        !self.block_complete() && self.allowance == Some(0)
    }

    pub fn can_send_consecutive(&self) -> bool {
        !self.block_complete() && self.allowance != Some(0)
    }

    pub fn apply_flow_control(&mut self, fc: &FlowControl) {
        self.allowance = match fc.block_size {
            0 => None,
            n => Some(n as usize),
        };
    }

    fn next_block_sequence(&self) -> u8 {
        match self.block_sequence {
            None => self.limits.block_counter_start,
            Some(u8::MAX) => self.limits.block_counter_wrap,
            Some(n) => n + 1,
        }
    }

    fn take(&mut self, n: usize) -> &[u8] {
        let start = self.offset;
        self.offset += n;
        self.block_sent += n;
        self.sent += n;
        &self.image[start..start + n]
    }

    /// Open the next block; `None` once everything has been sent
    pub fn first_frame(&mut self) -> Option<Payload> {
        if self.is_complete() {
            return None;
        }

        self.block_len = self.remaining().min(self.limits.max_block_length);
        let sequence = self.next_block_sequence();
        self.block_sequence = Some(sequence);
        self.frame_sequence = 0;
        self.allowance = Some(0);
        self.block_sent = BLOCK_HEADER_LENGTH;
        self.sent += BLOCK_HEADER_LENGTH;

        let mut bytes = vec![
            (pci::FIRST_FRAME << 4) | ((self.block_len >> 8) & 0x0F) as u8,
            (self.block_len & 0xFF) as u8,
            service_id::TRANSFER_DATA,
            sequence,
        ];
        let n = (self.block_len - BLOCK_HEADER_LENGTH).min(FIRST_FRAME_DATA);
        bytes.extend_from_slice(self.take(n));

        Some(padded(&bytes))
    }

    /// Next consecutive frame of the current block, if the FC allows one
    pub fn consecutive_frame(&mut self) -> Option<Payload> {
        if !self.can_send_consecutive() {
            return None;
        }

        self.frame_sequence = (self.frame_sequence + 1) & 0x0F;
        if let Some(left) = self.allowance.as_mut() {
            *left -= 1;
        }

        let mut bytes = vec![(pci::CONSECUTIVE_FRAME << 4) | self.frame_sequence];
        let n = (self.block_len - self.block_sent).min(CONSECUTIVE_FRAME_DATA);
        bytes.extend_from_slice(self.take(n));

        Some(padded(&bytes))
    }
}

/// Every frame of `image`, as sent when the ECU never limits the block size
pub fn segment(image: &[u8], limits: BlockLimits) -> Vec<Payload> {
    let mut session = TransferSession::new(Bytes::copy_from_slice(image), limits);
    let unlimited = FlowControl {
        frame_type: pci::FLOW_CONTROL,
        flow_status: FlowStatus::ContinueToSend,
        block_size: 0,
        separation_time: 0,
    };

    let mut frames = Vec::new();
    while let Some(ff) = session.first_frame() {
        frames.push(ff);
        session.apply_flow_control(&unlimited);
        while let Some(cf) = session.consecutive_frame() {
            frames.push(cf);
        }
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
    }

    /// Strip PCI, SID and block sequence bytes back off
    fn reassemble(frames: &[Payload]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut left = 0usize;
        for frame in frames {
            match frame[0] >> 4 {
                pci::FIRST_FRAME => {
                    let len = (((frame[0] & 0x0F) as usize) << 8) | frame[1] as usize;
                    assert_eq!(frame[2], 0x36);
                    let n = (len - 2).min(4);
                    out.extend_from_slice(&frame[4..4 + n]);
                    left = len - 2 - n;
                }
                pci::CONSECUTIVE_FRAME => {
                    let n = left.min(7);
                    out.extend_from_slice(&frame[1..1 + n]);
                    left -= n;
                }
                other => panic!("unexpected frame type {}", other),
            }
        }
        assert_eq!(left, 0);
        out
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(4)]
    #[case(1024)]
    #[case(1025)]
    #[case(2050)]
    #[case(100_000)]
    fn test_segmentation_reproduces_image(#[case] len: usize) {
        let data = image(len);
        let frames = segment(&data, BlockLimits::default());
        assert_eq!(reassemble(&frames), data);
        if len == 0 {
            assert!(frames.is_empty());
        }
    }

    #[test]
    fn test_first_frame_layout() {
        let data = image(10);
        let mut session = TransferSession::new(Bytes::from(data.clone()), BlockLimits::default());
        assert_eq!(session.total_bytes(), 12);

        let ff = session.first_frame().unwrap();
        assert_eq!(ff, [0x10, 0x0C, 0x36, 0x01, data[0], data[1], data[2], data[3]]);
        assert_eq!(session.bytes_sent(), 6);
        assert!(session.awaiting_flow_control());
        assert!(session.consecutive_frame().is_none());
    }

    #[test]
    fn test_short_block_padding() {
        let mut session = TransferSession::new(Bytes::from_static(&[0xAB]), BlockLimits::default());
        let ff = session.first_frame().unwrap();
        assert_eq!(ff, [0x10, 0x03, 0x36, 0x01, 0xAB, 0xFF, 0xFF, 0xFF]);
        assert!(session.block_complete());
        assert!(session.is_complete());
        assert!(session.first_frame().is_none());
    }

    #[test]
    fn test_total_counts_two_header_bytes_per_block() {
        let limits = BlockLimits::default();
        assert_eq!(TransferSession::new(Bytes::from(image(1024)), limits).total_bytes(), 1026);
        assert_eq!(TransferSession::new(Bytes::from(image(1025)), limits).total_bytes(), 1029);
        assert_eq!(TransferSession::new(Bytes::from(image(2048)), limits).total_bytes(), 2052);
        assert_eq!(TransferSession::new(Bytes::new(), limits).total_bytes(), 0);
    }

    #[test]
    fn test_full_block_length() {
        let frames = segment(&image(2050), BlockLimits::default());
        // 1026 + 1026 + 4 bytes
        let lengths: Vec<usize> = frames
            .iter()
            .filter(|f| f[0] >> 4 == pci::FIRST_FRAME)
            .map(|f| (((f[0] & 0x0F) as usize) << 8) | f[1] as usize)
            .collect();
        assert_eq!(lengths, vec![1026, 1026, 4]);
    }

    #[test]
    fn test_consecutive_frame_sequence_wraps() {
        let frames = segment(&image(1024), BlockLimits::default());
        let sequence: Vec<u8> = frames[1..].iter().map(|f| f[0] & 0x0F).collect();
        assert_eq!(sequence.len(), 146);
        for (i, sn) in sequence.iter().enumerate() {
            assert_eq!(*sn as usize, (i + 1) % 16);
        }
    }

    #[test]
    fn test_block_sequence_wraps_to_one() {
        let limits = BlockLimits {
            max_block_length: 3,
            ..BlockLimits::default()
        };
        let frames = segment(&image(600), limits);
        let sequence: Vec<u8> = frames.iter().map(|f| f[3]).collect();
        assert_eq!(sequence.len(), 600);
        assert_eq!(sequence[0], 1);
        assert_eq!(sequence[254], 255);
        assert_eq!(sequence[255], 1);
        assert_eq!(sequence[509], 255);
        assert_eq!(sequence[510], 1);
        assert!(!sequence.contains(&0));
    }

    #[test]
    fn test_block_size_limits_consecutive_frames() {
        let mut session = TransferSession::new(Bytes::from(image(100)), BlockLimits::default());
        session.first_frame().unwrap();

        let fc = FlowControl::parse(&[0x30, 0x02, 0x05]).unwrap();
        session.apply_flow_control(&fc);
        assert!(session.consecutive_frame().is_some());
        assert!(session.consecutive_frame().is_some());
        assert!(session.consecutive_frame().is_none());
        assert!(session.awaiting_flow_control());

        session.apply_flow_control(&FlowControl::parse(&[0x30, 0x00, 0x00]).unwrap());
        let mut count = 0;
        while session.consecutive_frame().is_some() {
            count += 1;
        }
        // 100 data bytes: 4 in FF, 14 in the first two CFs, 82 left
        assert_eq!(count, 12);
        assert!(session.block_complete());
        assert!(session.is_complete());
    }

    #[test]
    fn test_reset_rewinds() {
        let mut session = TransferSession::new(Bytes::from(image(20)), BlockLimits::default());
        session.first_frame().unwrap();
        session.reset();
        assert_eq!(session.bytes_sent(), 0);
        assert_eq!(session.block_sequence(), 0);
        assert_eq!(session.first_frame().unwrap()[3], 1);
    }

    #[test]
    fn test_flow_control_parse() {
        let fc = FlowControl::parse(&[0x30, 0x08, 0x14, 0xFF]).unwrap();
        assert_eq!(fc.flow_status, FlowStatus::ContinueToSend);
        assert_eq!(fc.block_size, 8);
        assert_eq!(fc.separation_time(), Duration::from_millis(20));

        assert_eq!(
            FlowControl::parse(&[0x31, 0, 0]).map(|f| f.flow_status),
            Some(FlowStatus::Wait)
        );
        assert_eq!(
            FlowControl::parse(&[0x32, 0, 0]).map(|f| f.flow_status),
            Some(FlowStatus::Overflow)
        );
        assert!(FlowControl::parse(&[0x02, 0x50, 0x02]).is_none());
        assert!(FlowControl::parse(&[0x30]).is_none());
    }

    #[rstest]
    #[case(0x00, Duration::from_millis(10))]
    #[case(0x05, Duration::from_millis(10))]
    #[case(0x14, Duration::from_millis(20))]
    #[case(0xF5, Duration::from_millis(10))]
    #[case(0x80, Duration::from_millis(127))]
    fn test_pacing_floor(#[case] st: u8, #[case] expected: Duration) {
        let fc = FlowControl::parse(&[0x30, 0x00, st]).unwrap();
        assert_eq!(fc.pacing(Duration::from_millis(10)), expected);
    }

    #[test]
    fn test_st_min_microseconds() {
        assert_eq!(decode_st_min(0xF1), Duration::from_micros(100));
        assert_eq!(decode_st_min(0xF9), Duration::from_micros(900));
    }

    #[test]
    fn test_flow_control_frame_builder() {
        assert_eq!(
            FlowControl::frame(FlowStatus::ContinueToSend, 0, 0),
            [0x30, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(FlowControl::frame(FlowStatus::Wait, 4, 10)[0], 0x31);
    }
}

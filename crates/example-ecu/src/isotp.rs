//! ISO-TP receive side
//!
//! Reassembles single and segmented requests from the tester and decides
//! when a flow control frame is due.

use canboot_uds::isotp::{pci, FlowControl, FlowStatus};
use canboot_uds::uds::services::Payload;
use tracing::{debug, warn};

use crate::config::FlowControlConfig;

/// Outcome of feeding one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A complete request
    Message(Vec<u8>),
    /// Answer with these flow control frames, in order
    FlowControl(Vec<Payload>),
    Nothing,
}

#[derive(Debug)]
struct Segmented {
    buffer: Vec<u8>,
    expected: usize,
    next_sn: u8,
    since_flow_control: u8,
}

/// One reassembly channel
#[derive(Debug)]
pub struct Reassembler {
    config: FlowControlConfig,
    current: Option<Segmented>,
}

impl Reassembler {
    pub fn new(config: FlowControlConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    fn continue_to_send(&self) -> Payload {
        FlowControl::frame(
            FlowStatus::ContinueToSend,
            self.config.block_size,
            self.config.separation_time,
        )
    }

    pub fn push(&mut self, data: &[u8]) -> Received {
        let Some(first) = data.first() else {
            return Received::Nothing;
        };

        match first >> 4 {
            pci::SINGLE_FRAME => {
                self.current = None;
                let len = (first & 0x0F) as usize;
                match data.get(1..1 + len) {
                    Some(message) if len > 0 => Received::Message(message.to_vec()),
                    _ => {
                        warn!(data = %hex::encode_upper(data), "Malformed single frame");
                        Received::Nothing
                    }
                }
            }
            pci::FIRST_FRAME if data.len() >= 2 => {
                let expected = (((first & 0x0F) as usize) << 8) | data[1] as usize;
                let mut buffer = Vec::with_capacity(expected);
                buffer.extend_from_slice(&data[2..data.len().min(2 + expected)]);
                debug!(expected, "First frame");
                self.current = Some(Segmented {
                    buffer,
                    expected,
                    next_sn: 1,
                    since_flow_control: 0,
                });

                let mut frames: Vec<Payload> = (0..self.config.wait_frames)
                    .map(|_| FlowControl::frame(FlowStatus::Wait, 0, 0))
                    .collect();
                frames.push(self.continue_to_send());
                Received::FlowControl(frames)
            }
            pci::CONSECUTIVE_FRAME => self.consecutive(data),
            _ => Received::Nothing,
        }
    }

    fn consecutive(&mut self, data: &[u8]) -> Received {
        let block_size = self.config.block_size;
        let Some(segmented) = self.current.as_mut() else {
            debug!("Consecutive frame without first frame");
            return Received::Nothing;
        };

        let sn = data[0] & 0x0F;
        if sn != segmented.next_sn {
            warn!(
                expected = segmented.next_sn,
                received = sn,
                "Consecutive frame out of sequence"
            );
            self.current = None;
            return Received::Nothing;
        }
        segmented.next_sn = (segmented.next_sn + 1) & 0x0F;

        let left = segmented.expected - segmented.buffer.len();
        let take = left.min(data.len() - 1);
        segmented.buffer.extend_from_slice(&data[1..1 + take]);

        if segmented.buffer.len() == segmented.expected {
            let message = std::mem::take(&mut segmented.buffer);
            self.current = None;
            return Received::Message(message);
        }

        segmented.since_flow_control += 1;
        if block_size > 0 && segmented.since_flow_control == block_size {
            segmented.since_flow_control = 0;
            return Received::FlowControl(vec![self.continue_to_send()]);
        }
        Received::Nothing
    }
}

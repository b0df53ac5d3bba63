//! Pure bootloader state machine

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use super::{BootloaderState, Command, Effect, Event, Notification, Severity, TimerKind};
use crate::config::BootloaderConfig;
use crate::error::BootloaderError;
use crate::isotp::{BlockLimits, FlowControl, FlowStatus, TransferSession};
use crate::transport::{CanFrame, Direction};
use crate::uds::data_identifiers::{CAN_SA, FINGERPRINT};
use crate::uds::services::{
    check_negative, negative_response, DiagnosticSessionControl, EcuReset, Payload, ReadDataById,
    RequestDownload, RequestTransferExit, RoutineControl, SecurityAccess, TransferData,
    WriteDataById,
};
use crate::uds::{
    reset_type, service_id, session_type, ByteOrder, NegativeResponseCode, UdsIdentifiers,
};

/// Static parameters of the download sequence
#[derive(Debug, Clone, PartialEq)]
pub struct MachineConfig {
    pub identifiers: UdsIdentifiers,
    pub byte_order: ByteOrder,
    pub memory_address: u32,
    pub max_memory_length: u32,
    pub limits: BlockLimits,
    /// Lower bound for consecutive frame pacing
    pub min_separation: Duration,
    pub fingerprint_value: u8,
    pub source_address_timeout: Duration,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self::from(&BootloaderConfig::default())
    }
}

impl From<&BootloaderConfig> for MachineConfig {
    fn from(config: &BootloaderConfig) -> Self {
        Self {
            identifiers: config.uds_identifiers(),
            byte_order: config.transfer.byte_order,
            memory_address: config.transfer.memory_address,
            max_memory_length: config.transfer.max_memory_length,
            limits: config.block_limits(),
            min_separation: config.transfer.min_separation(),
            fingerprint_value: config.transfer.fingerprint_value,
            source_address_timeout: config.timeouts.source_address(),
        }
    }
}

/// UDS bootloader client
///
/// Commands go through [`Bootloader::execute`], bus frames and timer expiries
/// through [`Bootloader::handle`]. Both return the effects the caller has to
/// carry out, in order.
pub struct Bootloader {
    config: MachineConfig,
    state: BootloaderState,
    identifiers: UdsIdentifiers,
    byte_order: ByteOrder,
    firmware: Option<Bytes>,
    session: Option<TransferSession>,
    flow_control: Option<FlowControl>,
    /// Consecutive frame timer is running
    burst_active: bool,
    /// Address being written and the identifier the ECU may answer from afterwards
    pending_source_address: Option<(u8, u32)>,
}

impl Bootloader {
    pub fn new(config: MachineConfig) -> Self {
        Self {
            identifiers: config.identifiers,
            byte_order: config.byte_order,
            config,
            state: BootloaderState::Ready,
            firmware: None,
            session: None,
            flow_control: None,
            burst_active: false,
            pending_source_address: None,
        }
    }

    pub fn state(&self) -> BootloaderState {
        self.state
    }

    pub fn identifiers(&self) -> UdsIdentifiers {
        self.identifiers
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn firmware_len(&self) -> Option<usize> {
        self.firmware.as_ref().map(|f| f.len())
    }

    /// Last flow control frame of the running transfer
    pub fn flow_control(&self) -> Option<FlowControl> {
        self.flow_control
    }

    /// Run a caller command
    ///
    /// Rejected commands return an error and leave the machine untouched.
    pub fn execute(&mut self, command: Command) -> Result<Vec<Effect>, BootloaderError> {
        let mut out = Vec::new();
        match command {
            Command::Start => {
                self.require_ready()?;
                let firmware = self.firmware.clone().ok_or(BootloaderError::NoFirmware)?;
                if firmware.is_empty() {
                    return Err(BootloaderError::EmptyFirmware);
                }

                let session = TransferSession::new(firmware, self.config.limits);
                let total = session.total_bytes();
                self.session = Some(session);
                self.flow_control = None;

                let image_len = self.session.as_ref().map_or(0, |s| s.image().len());
                if image_len as u64 > self.config.max_memory_length as u64 {
                    warn!(
                        image_len,
                        max_memory_length = self.config.max_memory_length,
                        "Image exceeds the download length, RequestDownload is clamped"
                    );
                    self.status(
                        &mut out,
                        Severity::Info,
                        format!(
                            "Image of {} bytes exceeds the memory length of {} bytes",
                            image_len, self.config.max_memory_length
                        ),
                    );
                }

                self.status(
                    &mut out,
                    Severity::Info,
                    format!("Starting download of {} bytes", total),
                );
                out.push(Effect::Notify(Notification::Progress { sent: 0, total }));
                self.send(
                    &mut out,
                    DiagnosticSessionControl::request(session_type::PROGRAMMING),
                );
                self.transition(&mut out, BootloaderState::SetProgrammingSession);
            }
            Command::SetFirmware(image) => {
                self.require_idle()?;
                info!(bytes = image.len(), "Firmware image set");
                self.firmware = Some(image);
            }
            Command::ResetState => {
                self.stop_burst(&mut out);
                if self.pending_source_address.take().is_some()
                    || matches!(self.state, BootloaderState::ReadCanSourceAddress)
                {
                    out.push(Effect::CancelTimer(TimerKind::SourceAddress));
                }
                self.session = None;
                self.flow_control = None;
                self.transition(&mut out, BootloaderState::Ready);
            }
            Command::EcuUdsReset => {
                self.require_ready()?;
                self.send(&mut out, EcuReset::uds_reset());
                self.transition(&mut out, BootloaderState::EcuUdsReset);
            }
            Command::EcuSoftwareReset => {
                self.require_ready()?;
                self.send(&mut out, EcuReset::software_reset());
                self.transition(&mut out, BootloaderState::EcuSoftwareReset);
            }
            Command::CheckState => {
                self.require_ready()?;
                self.send(
                    &mut out,
                    ReadDataById::request(FINGERPRINT.pid, self.byte_order),
                );
                self.transition(&mut out, BootloaderState::ReadFingerprint);
            }
            Command::WriteSourceAddress(value) => {
                self.require_ready()?;
                let address = u8::try_from(value).map_err(|_| {
                    BootloaderError::InvalidValue(format!(
                        "source address 0x{:X} exceeds 0xFF",
                        value
                    ))
                })?;
                let payload = WriteDataById::request(&CAN_SA, address as u32, self.byte_order)?;

                // Sent on the identifiers as they are now; they change only on success
                let tx = self.identifiers.tx;
                let answer_from = self.identifiers.rx.with_src(address).encode();
                self.pending_source_address = Some((address, answer_from));

                info!(address = format!("0x{:02X}", address), "Writing CAN source address");
                out.push(Effect::Send(CanFrame::new(tx.encode(), payload)));
                out.push(Effect::StartTimer {
                    kind: TimerKind::SourceAddress,
                    period: self.config.source_address_timeout,
                });
                self.transition(&mut out, BootloaderState::WriteCanSourceAddress);
            }
            Command::ReadSourceAddress => {
                self.require_ready()?;
                self.send(&mut out, ReadDataById::request(CAN_SA.pid, self.byte_order));
                out.push(Effect::StartTimer {
                    kind: TimerKind::SourceAddress,
                    period: self.config.source_address_timeout,
                });
                self.transition(&mut out, BootloaderState::ReadCanSourceAddress);
            }
            Command::SetByteOrder(order) => {
                self.require_idle()?;
                info!(%order, "Byte order changed");
                self.byte_order = order;
            }
            Command::SetIdentifiers(identifiers) => {
                self.require_idle()?;
                self.set_identifiers(&mut out, identifiers);
            }
            Command::ApplyCandidate { device, tester } => {
                self.require_idle()?;
                let mut identifiers = self.identifiers;
                identifiers.apply_candidate(device, tester);
                self.set_identifiers(&mut out, identifiers);
            }
        }
        Ok(out)
    }

    /// Feed a received frame or a timer expiry
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        let mut out = Vec::new();
        match event {
            Event::Frame(frame) => self.on_frame(&mut out, &frame),
            Event::TimerFired(TimerKind::ConsecutiveFrame) => self.on_consecutive_tick(&mut out),
            Event::TimerFired(TimerKind::SourceAddress) => self.on_source_address_timeout(&mut out),
        }
        out
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn require_ready(&self) -> Result<(), BootloaderError> {
        match self.state {
            BootloaderState::Ready => Ok(()),
            state => Err(BootloaderError::PreconditionViolation { state }),
        }
    }

    fn require_idle(&self) -> Result<(), BootloaderError> {
        if self.state.is_idle() {
            Ok(())
        } else {
            Err(BootloaderError::PreconditionViolation { state: self.state })
        }
    }

    fn transition(&mut self, out: &mut Vec<Effect>, state: BootloaderState) {
        if self.state != state {
            info!(from = %self.state, to = %state, "State transition");
            self.state = state;
            out.push(Effect::Notify(Notification::StateChanged(state)));
        }
    }

    fn send(&self, out: &mut Vec<Effect>, payload: Payload) {
        out.push(Effect::Send(CanFrame::new(
            self.identifiers.tx.encode(),
            payload,
        )));
    }

    fn status(&self, out: &mut Vec<Effect>, severity: Severity, message: String) {
        out.push(Effect::Notify(Notification::Status { severity, message }));
    }

    fn progress(&self, out: &mut Vec<Effect>) {
        if let Some(session) = &self.session {
            out.push(Effect::Notify(Notification::Progress {
                sent: session.bytes_sent(),
                total: session.total_bytes(),
            }));
        }
    }

    fn set_identifiers(&mut self, out: &mut Vec<Effect>, identifiers: UdsIdentifiers) {
        info!(
            tx = %identifiers.tx,
            rx = %identifiers.rx,
            "Identifiers changed"
        );
        self.identifiers = identifiers;
        out.push(Effect::Notify(Notification::IdentifiersChanged(identifiers)));
    }

    fn stop_burst(&mut self, out: &mut Vec<Effect>) {
        if self.burst_active {
            self.burst_active = false;
            out.push(Effect::CancelTimer(TimerKind::ConsecutiveFrame));
        }
    }

    fn start_burst(&mut self, out: &mut Vec<Effect>, fc: &FlowControl) {
        let period = fc.pacing(self.config.min_separation);
        debug!(
            block_size = fc.block_size,
            period_us = period.as_micros() as u64,
            "Sending consecutive frames"
        );
        self.burst_active = true;
        out.push(Effect::StartTimer {
            kind: TimerKind::ConsecutiveFrame,
            period,
        });
    }

    /// Abort the running exchange
    fn fail(&mut self, out: &mut Vec<Effect>, message: String) {
        error!(state = %self.state, "{}", message);
        self.stop_burst(out);
        self.status(out, Severity::Error, message);

        match self.state {
            state if state.is_programming() => {
                self.session = None;
                self.transition(out, BootloaderState::Error);
                out.push(Effect::Notify(Notification::Finished { success: false }));
            }
            BootloaderState::EcuUdsReset => {
                out.push(Effect::Notify(Notification::ResetCompleted {
                    kind: reset_type::UDS_SOFTWARE_RESET,
                    success: false,
                }));
                self.transition(out, BootloaderState::Ready);
            }
            BootloaderState::EcuSoftwareReset => {
                out.push(Effect::Notify(Notification::ResetCompleted {
                    kind: reset_type::SOFTWARE_RESET,
                    success: false,
                }));
                self.transition(out, BootloaderState::Ready);
            }
            BootloaderState::ReadFingerprint => {
                out.push(Effect::Notify(Notification::BootloaderActive { active: false }));
                self.transition(out, BootloaderState::Ready);
            }
            BootloaderState::WriteCanSourceAddress => {
                out.push(Effect::CancelTimer(TimerKind::SourceAddress));
                let address = self
                    .pending_source_address
                    .take()
                    .map(|(address, _)| address)
                    .unwrap_or(self.identifiers.ecu_address());
                out.push(Effect::Notify(Notification::SourceAddressApplied {
                    address,
                    success: false,
                }));
                self.transition(out, BootloaderState::Ready);
            }
            BootloaderState::ReadCanSourceAddress => {
                out.push(Effect::CancelTimer(TimerKind::SourceAddress));
                out.push(Effect::Notify(Notification::SourceAddressRead {
                    address: self.identifiers.ecu_address(),
                    success: false,
                }));
                self.transition(out, BootloaderState::Ready);
            }
            _ => {}
        }
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    fn accepts(&self, frame: &CanFrame) -> bool {
        if frame.id == self.identifiers.rx.encode() {
            return true;
        }
        match (self.state, self.pending_source_address) {
            (BootloaderState::WriteCanSourceAddress, Some((_, answer_from))) => {
                frame.id == answer_from
            }
            _ => false,
        }
    }

    fn on_frame(&mut self, out: &mut Vec<Effect>, frame: &CanFrame) {
        if frame.direction == Direction::Tx || self.state.is_idle() {
            return;
        }
        if !self.accepts(frame) {
            return;
        }
        debug!(state = %self.state, frame = %frame, "Response");

        let data = frame.payload();
        if let Some(sid) = self.expected_service() {
            if negative_response(data, sid) == Some(NegativeResponseCode::ResponsePending) {
                debug!(state = %self.state, "ECU response pending");
                return;
            }
        }

        match self.state {
            BootloaderState::SetProgrammingSession => {
                if DiagnosticSessionControl::verify(data) {
                    self.send(out, SecurityAccess::request_seed());
                    self.transition(out, BootloaderState::RequestSeed);
                } else {
                    self.reject(out, data, "Programming session");
                }
            }
            BootloaderState::RequestSeed => match SecurityAccess::verify_seed(data) {
                Some(seed) => {
                    let key = SecurityAccess::derive_key(seed);
                    debug!(
                        seed = format!("0x{:04X}", seed),
                        key = format!("0x{:04X}", key),
                        "Security access"
                    );
                    self.send(out, SecurityAccess::send_key(key));
                    self.transition(out, BootloaderState::SeedVerification);
                }
                None => self.reject(out, data, "Seed request"),
            },
            BootloaderState::SeedVerification => {
                if SecurityAccess::verify_key(data) {
                    self.send(
                        out,
                        WriteDataById::fingerprint(self.config.fingerprint_value, self.byte_order),
                    );
                    self.transition(out, BootloaderState::WriteFingerprint);
                } else {
                    self.reject(out, data, "Security key");
                }
            }
            BootloaderState::WriteFingerprint => {
                if WriteDataById::verify(data, FINGERPRINT.pid, self.byte_order) {
                    self.send(out, RoutineControl::erase_memory());
                    self.transition(out, BootloaderState::EraseFirmware);
                } else {
                    self.reject(out, data, "Fingerprint write");
                }
            }
            BootloaderState::EraseFirmware => {
                if RoutineControl::verify_erase(data) {
                    self.send(
                        out,
                        RequestDownload::first_frame(self.config.memory_address, self.byte_order),
                    );
                    self.transition(out, BootloaderState::RequestDownload);
                } else {
                    self.reject(out, data, "Memory erase");
                }
            }
            BootloaderState::RequestDownload => match FlowControl::parse(data) {
                Some(fc) if fc.flow_status == FlowStatus::ContinueToSend => {
                    let length = self.memory_length();
                    self.send(
                        out,
                        RequestDownload::consecutive_frame(
                            self.config.memory_address,
                            length,
                            self.byte_order,
                        ),
                    );
                    self.transition(out, BootloaderState::RequestDownloadConsecutive);
                }
                Some(fc) if fc.flow_status == FlowStatus::Wait => {
                    debug!("Flow control wait during request download");
                }
                Some(fc) => self.fail(
                    out,
                    format!("Request download refused by flow control {:?}", fc.flow_status),
                ),
                None => self.reject(out, data, "Request download"),
            },
            BootloaderState::RequestDownloadConsecutive => {
                if RequestDownload::verify(data) {
                    self.next_block(out);
                } else {
                    self.reject(out, data, "Request download");
                }
            }
            BootloaderState::TransferDataFf => self.on_flow_control(out, data),
            BootloaderState::TransferDataCf => self.on_transfer_response(out, data),
            BootloaderState::RequestTransferExit => {
                if RequestTransferExit::verify(data) {
                    self.session = None;
                    self.flow_control = None;
                    self.status(out, Severity::Success, "Firmware download complete".to_string());
                    self.transition(out, BootloaderState::Ready);
                    out.push(Effect::Notify(Notification::Finished { success: true }));
                } else {
                    self.reject(out, data, "Transfer exit");
                }
            }
            BootloaderState::EcuUdsReset => {
                self.on_reset_response(out, data, reset_type::UDS_SOFTWARE_RESET)
            }
            BootloaderState::EcuSoftwareReset => {
                self.on_reset_response(out, data, reset_type::SOFTWARE_RESET)
            }
            BootloaderState::ReadFingerprint => {
                if ReadDataById::verify(data, FINGERPRINT.pid, self.byte_order) {
                    let value = ReadDataById::value(data);
                    self.status(
                        out,
                        Severity::Success,
                        format!("Bootloader active (fingerprint 0x{:02X})", value),
                    );
                    out.push(Effect::Notify(Notification::BootloaderActive { active: true }));
                    self.transition(out, BootloaderState::Ready);
                } else {
                    self.reject(out, data, "Fingerprint read");
                }
            }
            BootloaderState::WriteCanSourceAddress => {
                if WriteDataById::verify(data, CAN_SA.pid, self.byte_order) {
                    out.push(Effect::CancelTimer(TimerKind::SourceAddress));
                    if let Some((address, _)) = self.pending_source_address.take() {
                        let mut identifiers = self.identifiers;
                        identifiers.set_source_address(address);
                        self.set_identifiers(out, identifiers);
                        self.status(
                            out,
                            Severity::Success,
                            format!("Source address set to 0x{:02X}", address),
                        );
                        out.push(Effect::Notify(Notification::SourceAddressApplied {
                            address,
                            success: true,
                        }));
                    }
                    self.transition(out, BootloaderState::Ready);
                } else {
                    self.reject(out, data, "Source address write");
                }
            }
            BootloaderState::ReadCanSourceAddress => {
                if ReadDataById::verify(data, CAN_SA.pid, self.byte_order) {
                    let address = (ReadDataById::value(data) & 0xFF) as u8;
                    out.push(Effect::CancelTimer(TimerKind::SourceAddress));
                    self.status(
                        out,
                        Severity::Success,
                        format!("Source address is 0x{:02X}", address),
                    );
                    out.push(Effect::Notify(Notification::SourceAddressRead {
                        address,
                        success: true,
                    }));
                    self.transition(out, BootloaderState::Ready);
                } else {
                    self.reject(out, data, "Source address read");
                }
            }
            BootloaderState::Ready | BootloaderState::Error => {}
        }
    }

    /// Service whose answer the current state waits for
    fn expected_service(&self) -> Option<u8> {
        let sid = match self.state {
            BootloaderState::SetProgrammingSession => service_id::DIAGNOSTIC_SESSION_CONTROL,
            BootloaderState::RequestSeed | BootloaderState::SeedVerification => {
                service_id::SECURITY_ACCESS
            }
            BootloaderState::WriteFingerprint | BootloaderState::WriteCanSourceAddress => {
                service_id::WRITE_DATA_BY_ID
            }
            BootloaderState::EraseFirmware => service_id::ROUTINE_CONTROL,
            BootloaderState::RequestDownload | BootloaderState::RequestDownloadConsecutive => {
                service_id::REQUEST_DOWNLOAD
            }
            BootloaderState::TransferDataFf | BootloaderState::TransferDataCf => {
                service_id::TRANSFER_DATA
            }
            BootloaderState::RequestTransferExit => service_id::REQUEST_TRANSFER_EXIT,
            BootloaderState::EcuUdsReset | BootloaderState::EcuSoftwareReset => {
                service_id::ECU_RESET
            }
            BootloaderState::ReadFingerprint | BootloaderState::ReadCanSourceAddress => {
                service_id::READ_DATA_BY_ID
            }
            BootloaderState::Ready | BootloaderState::Error => return None,
        };
        Some(sid)
    }

    /// Fail with a description of what came back instead
    fn reject(&mut self, out: &mut Vec<Effect>, data: &[u8], what: &str) {
        let negative = self
            .expected_service()
            .map(|sid| check_negative(data, sid))
            .unwrap_or(Ok(()));
        let message = match negative {
            Err(e) => format!("{} rejected: {}", what, e),
            Ok(()) => format!("{} failed: unexpected response {}", what, hex::encode_upper(data)),
        };
        self.fail(out, message);
    }

    fn memory_length(&self) -> u32 {
        let len = self.session.as_ref().map(|s| s.image().len()).unwrap_or(0);
        u32::try_from(len)
            .unwrap_or(u32::MAX)
            .min(self.config.max_memory_length)
    }

    /// Open the next TransferData block
    fn next_block(&mut self, out: &mut Vec<Effect>) {
        let frame = self.session.as_mut().and_then(|s| s.first_frame());
        match frame {
            Some(payload) => {
                if let Some(session) = &self.session {
                    debug!(
                        block = session.block_sequence(),
                        length = session.block_length(),
                        "TransferData block"
                    );
                }
                self.send(out, payload);
                self.progress(out);
                self.transition(out, BootloaderState::TransferDataFf);
            }
            None => self.fail(out, "No firmware data left to transfer".to_string()),
        }
    }

    fn on_flow_control(&mut self, out: &mut Vec<Effect>, data: &[u8]) {
        match FlowControl::parse(data) {
            Some(fc) if fc.flow_status == FlowStatus::ContinueToSend => {
                self.flow_control = Some(fc);
                let block_complete = match self.session.as_mut() {
                    Some(session) => {
                        session.apply_flow_control(&fc);
                        session.block_complete()
                    }
                    None => {
                        self.fail(out, "Transfer session missing".to_string());
                        return;
                    }
                };
                self.transition(out, BootloaderState::TransferDataCf);
                if !block_complete {
                    self.start_burst(out, &fc);
                }
            }
            Some(fc) if fc.flow_status == FlowStatus::Wait => {
                debug!("Flow control wait");
            }
            Some(fc) => self.fail(
                out,
                format!("Transfer aborted by flow control {:?}", fc.flow_status),
            ),
            None => self.reject(out, data, "Transfer data"),
        }
    }

    fn on_transfer_response(&mut self, out: &mut Vec<Effect>, data: &[u8]) {
        if self.burst_active {
            if negative_response(data, service_id::TRANSFER_DATA).is_some() {
                self.reject(out, data, "Transfer data");
            } else {
                warn!(data = %hex::encode_upper(data), "Frame ignored while sending consecutive frames");
            }
            return;
        }

        let (block_complete, transfer_complete, block_sequence) = match &self.session {
            Some(s) => (s.block_complete(), s.is_complete(), s.block_sequence()),
            None => {
                self.fail(out, "Transfer session missing".to_string());
                return;
            }
        };

        if block_complete {
            if !TransferData::verify_block(data, block_sequence) {
                self.reject(out, data, "Transfer data block");
            } else if transfer_complete {
                self.send(out, RequestTransferExit::request());
                self.transition(out, BootloaderState::RequestTransferExit);
            } else {
                self.next_block(out);
            }
            return;
        }

        // Allowance used up, the ECU owes us a flow control frame
        match FlowControl::parse(data) {
            Some(fc) if fc.flow_status == FlowStatus::ContinueToSend => {
                self.flow_control = Some(fc);
                if let Some(session) = self.session.as_mut() {
                    session.apply_flow_control(&fc);
                }
                self.start_burst(out, &fc);
            }
            Some(fc) if fc.flow_status == FlowStatus::Wait => {
                debug!("Flow control wait");
            }
            Some(fc) => self.fail(
                out,
                format!("Transfer aborted by flow control {:?}", fc.flow_status),
            ),
            None => self.reject(out, data, "Transfer data"),
        }
    }

    fn on_reset_response(&mut self, out: &mut Vec<Effect>, data: &[u8], kind: u8) {
        if EcuReset::verify(data, kind) {
            self.status(out, Severity::Success, format!("ECU reset 0x{:02X} accepted", kind));
            out.push(Effect::Notify(Notification::ResetCompleted {
                kind,
                success: true,
            }));
            self.transition(out, BootloaderState::Ready);
        } else {
            self.reject(out, data, "ECU reset");
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    fn on_consecutive_tick(&mut self, out: &mut Vec<Effect>) {
        if self.state != BootloaderState::TransferDataCf || !self.burst_active {
            debug!(state = %self.state, "Stale consecutive frame tick");
            return;
        }

        let frame = self.session.as_mut().and_then(|s| s.consecutive_frame());
        if let Some(payload) = frame {
            self.send(out, payload);
            self.progress(out);
        }

        let done = self
            .session
            .as_ref()
            .map(|s| !s.can_send_consecutive())
            .unwrap_or(true);
        if done {
            self.stop_burst(out);
        }
    }

    fn on_source_address_timeout(&mut self, out: &mut Vec<Effect>) {
        match self.state {
            BootloaderState::WriteCanSourceAddress | BootloaderState::ReadCanSourceAddress => {
                warn!(state = %self.state, "Source address request timed out");
                self.fail(out, "No answer to source address request".to_string());
            }
            _ => debug!(state = %self.state, "Stale source address timeout"),
        }
    }
}

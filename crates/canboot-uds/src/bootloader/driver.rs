//! Tokio driver for the bootloader state machine
//!
//! One task owns the [`Bootloader`]. It waits on caller requests, bus frames
//! and the two timers, feeds whatever arrives into the machine and carries
//! out the returned effects. Callers talk to it through a cloneable
//! [`BootloaderHandle`] and observe progress on a broadcast channel.

use std::future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, error, warn};

use super::{
    Bootloader, BootloaderState, Command, Effect, Event, MachineConfig, Notification, Severity,
    TimerKind,
};
use crate::error::BootloaderError;
use crate::firmware;
use crate::transport::{CanFrame, CanPort};
use crate::uds::{ByteOrder, UdsIdentifiers};

const REQUEST_CAPACITY: usize = 32;
const NOTIFICATION_CAPACITY: usize = 1024;

/// Point-in-time view of the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub state: BootloaderState,
    pub identifiers: UdsIdentifiers,
    pub byte_order: ByteOrder,
    pub firmware_len: Option<usize>,
}

enum Request {
    Execute {
        command: Command,
        reply: oneshot::Sender<Result<(), BootloaderError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
}

/// Cloneable client of a running driver
#[derive(Clone)]
pub struct BootloaderHandle {
    requests: mpsc::Sender<Request>,
    notifications: broadcast::Sender<Notification>,
}

impl BootloaderHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Run a command; protocol outcomes arrive later as notifications
    pub async fn execute(&self, command: Command) -> Result<(), BootloaderError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request::Execute { command, reply })
            .await
            .map_err(|_| BootloaderError::Closed)?;
        response.await.map_err(|_| BootloaderError::Closed)?
    }

    pub async fn snapshot(&self) -> Result<Snapshot, BootloaderError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request::Snapshot { reply })
            .await
            .map_err(|_| BootloaderError::Closed)?;
        response.await.map_err(|_| BootloaderError::Closed)
    }

    pub async fn state(&self) -> Result<BootloaderState, BootloaderError> {
        Ok(self.snapshot().await?.state)
    }

    pub async fn identifiers(&self) -> Result<UdsIdentifiers, BootloaderError> {
        Ok(self.snapshot().await?.identifiers)
    }

    pub async fn start(&self) -> Result<(), BootloaderError> {
        self.execute(Command::Start).await
    }

    pub async fn set_firmware(&self, image: Bytes) -> Result<(), BootloaderError> {
        self.execute(Command::SetFirmware(image)).await
    }

    /// Read an image from disk and hand it to the machine
    pub async fn load_firmware(&self, path: impl AsRef<Path>) -> Result<usize, BootloaderError> {
        let image = firmware::load(path).await?;
        let len = image.len();
        self.set_firmware(image).await?;
        Ok(len)
    }

    pub async fn reset_state(&self) -> Result<(), BootloaderError> {
        self.execute(Command::ResetState).await
    }

    pub async fn ecu_uds_reset(&self) -> Result<(), BootloaderError> {
        self.execute(Command::EcuUdsReset).await
    }

    pub async fn ecu_software_reset(&self) -> Result<(), BootloaderError> {
        self.execute(Command::EcuSoftwareReset).await
    }

    pub async fn check_state(&self) -> Result<(), BootloaderError> {
        self.execute(Command::CheckState).await
    }

    pub async fn write_source_address(&self, address: u16) -> Result<(), BootloaderError> {
        self.execute(Command::WriteSourceAddress(address)).await
    }

    pub async fn read_source_address(&self) -> Result<(), BootloaderError> {
        self.execute(Command::ReadSourceAddress).await
    }

    pub async fn set_byte_order(&self, order: ByteOrder) -> Result<(), BootloaderError> {
        self.execute(Command::SetByteOrder(order)).await
    }

    pub async fn set_identifiers(&self, identifiers: UdsIdentifiers) -> Result<(), BootloaderError> {
        self.execute(Command::SetIdentifiers(identifiers)).await
    }

    pub async fn apply_candidate(&self, device: u8, tester: u8) -> Result<(), BootloaderError> {
        self.execute(Command::ApplyCandidate { device, tester }).await
    }
}

/// Wait for the first notification `pick` maps to a value
///
/// Subscribe before issuing the command whose outcome you wait for.
pub async fn wait_for<T>(
    notifications: &mut broadcast::Receiver<Notification>,
    mut pick: impl FnMut(&Notification) -> Option<T>,
) -> Result<T, BootloaderError> {
    loop {
        match notifications.recv().await {
            Ok(notification) => {
                if let Some(value) = pick(&notification) {
                    return Ok(value);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Notification receiver lagged");
            }
            Err(RecvError::Closed) => return Err(BootloaderError::Closed),
        }
    }
}

/// [`wait_for`] that gives up once the download goes quiet
///
/// Every `Progress` or `StateChanged` notification restarts the `idle`
/// period. Returns `Ok(None)` when it runs out.
pub async fn wait_while_active<T>(
    notifications: &mut broadcast::Receiver<Notification>,
    idle: Duration,
    mut pick: impl FnMut(&Notification) -> Option<T>,
) -> Result<Option<T>, BootloaderError> {
    let mut deadline = Instant::now() + idle;
    loop {
        let notification = match tokio::time::timeout_at(deadline, notifications.recv()).await {
            Err(_) => return Ok(None),
            Ok(Ok(notification)) => notification,
            Ok(Err(RecvError::Lagged(skipped))) => {
                warn!(skipped, "Notification receiver lagged");
                continue;
            }
            Ok(Err(RecvError::Closed)) => return Err(BootloaderError::Closed),
        };
        if matches!(
            notification,
            Notification::Progress { .. } | Notification::StateChanged(_)
        ) {
            deadline = Instant::now() + idle;
        }
        if let Some(value) = pick(&notification) {
            return Ok(Some(value));
        }
    }
}

/// Start a driver task for `port`
///
/// The task ends when every handle has been dropped.
pub fn spawn(port: Arc<dyn CanPort>, config: MachineConfig) -> (BootloaderHandle, JoinHandle<()>) {
    let (requests, request_rx) = mpsc::channel(REQUEST_CAPACITY);
    let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

    let driver = Driver {
        machine: Bootloader::new(config),
        frames: port.subscribe(),
        port,
        notifications: notifications.clone(),
        consecutive: None,
        source_address: None,
    };
    let task = tokio::spawn(driver.run(request_rx));

    (
        BootloaderHandle {
            requests,
            notifications,
        },
        task,
    )
}

enum Wake {
    Request(Option<Request>),
    Frame(Result<CanFrame, RecvError>),
    ConsecutiveTick,
    SourceAddressExpired,
}

struct Driver {
    machine: Bootloader,
    port: Arc<dyn CanPort>,
    frames: broadcast::Receiver<CanFrame>,
    notifications: broadcast::Sender<Notification>,
    consecutive: Option<Interval>,
    source_address: Option<Pin<Box<Sleep>>>,
}

impl Driver {
    async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        debug!(port = %self.port.name(), "Bootloader driver started");
        loop {
            let wake = tokio::select! {
                request = requests.recv() => Wake::Request(request),
                frame = self.frames.recv() => Wake::Frame(frame),
                _ = next_tick(&mut self.consecutive) => Wake::ConsecutiveTick,
                _ = expired(&mut self.source_address) => Wake::SourceAddressExpired,
            };

            match wake {
                Wake::Request(None) => break,
                Wake::Request(Some(Request::Snapshot { reply })) => {
                    let _ = reply.send(self.snapshot());
                }
                Wake::Request(Some(Request::Execute { command, reply })) => {
                    match self.machine.execute(command) {
                        Ok(effects) => {
                            self.apply(effects).await;
                            let _ = reply.send(Ok(()));
                        }
                        Err(e) => {
                            debug!(error = %e, "Command rejected");
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                Wake::Frame(Ok(frame)) => {
                    let effects = self.machine.handle(Event::Frame(frame));
                    self.apply(effects).await;
                }
                Wake::Frame(Err(RecvError::Lagged(skipped))) => {
                    warn!(skipped, "Bootloader fell behind the bus");
                }
                Wake::Frame(Err(RecvError::Closed)) => {
                    error!(port = %self.port.name(), "CAN port closed");
                    break;
                }
                Wake::ConsecutiveTick => {
                    let effects = self
                        .machine
                        .handle(Event::TimerFired(TimerKind::ConsecutiveFrame));
                    self.apply(effects).await;
                }
                Wake::SourceAddressExpired => {
                    self.source_address = None;
                    let effects = self.machine.handle(Event::TimerFired(TimerKind::SourceAddress));
                    self.apply(effects).await;
                }
            }
        }
        debug!("Bootloader driver stopped");
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.machine.state(),
            identifiers: self.machine.identifiers(),
            byte_order: self.machine.byte_order(),
            firmware_len: self.machine.firmware_len(),
        }
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(frame) => {
                    debug!(frame = %frame, "Request");
                    if let Err(e) = self.port.send_frame(frame).await {
                        error!(error = %e, "Failed to send frame");
                        let _ = self.notifications.send(Notification::Status {
                            severity: Severity::Error,
                            message: format!("Send failed: {}", e),
                        });
                    }
                }
                Effect::Notify(notification) => {
                    // No subscribers is fine
                    let _ = self.notifications.send(notification);
                }
                Effect::StartTimer {
                    kind: TimerKind::ConsecutiveFrame,
                    period,
                } => {
                    self.consecutive = Some(pacing_interval(period));
                }
                Effect::StartTimer {
                    kind: TimerKind::SourceAddress,
                    period,
                } => {
                    self.source_address = Some(Box::pin(tokio::time::sleep(period)));
                }
                Effect::CancelTimer(TimerKind::ConsecutiveFrame) => self.consecutive = None,
                Effect::CancelTimer(TimerKind::SourceAddress) => self.source_address = None,
            }
        }
    }
}

/// First tick one period from now, later ticks keep their spacing
fn pacing_interval(period: Duration) -> Interval {
    let period = period.max(Duration::from_micros(100));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

async fn expired(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::transport::{Direction, MockCanBus};

    const RX: u32 = 0x18DA_F16A;

    fn setup() -> (Arc<MockCanBus>, BootloaderHandle, broadcast::Receiver<CanFrame>) {
        let bus = MockCanBus::new();
        let client: Arc<dyn CanPort> = Arc::new(bus.attach(&MockConfig::default()));
        let ecu = bus.attach(&MockConfig::default());
        let ecu_rx = ecu.subscribe();
        // The ECU side is driven through `inject`
        drop(ecu);
        let (handle, _task) = spawn(client, MachineConfig::default());
        (bus, handle, ecu_rx)
    }

    async fn next_request(frames: &mut broadcast::Receiver<CanFrame>) -> CanFrame {
        loop {
            let frame = frames.recv().await.unwrap();
            if frame.direction == Direction::Rx && frame.id != RX {
                return frame;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_while_active_resets_on_progress() {
        let (tx, mut rx) = broadcast::channel(16);
        let idle = Duration::from_secs(1);

        let feeder = tokio::spawn(async move {
            for sent in 1..=3 {
                tokio::time::sleep(Duration::from_millis(800)).await;
                tx.send(Notification::Progress { sent, total: 3 }).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(800)).await;
            tx.send(Notification::Finished { success: true }).unwrap();
            tx
        });

        let started = Instant::now();
        let finished = wait_while_active(&mut rx, idle, |n| match n {
            Notification::Finished { success } => Some(*success),
            _ => None,
        })
        .await
        .unwrap();
        assert_eq!(finished, Some(true));
        assert_eq!(started.elapsed(), Duration::from_millis(3200));
        drop(feeder.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_while_active_gives_up_when_quiet() {
        let (tx, mut rx) = broadcast::channel(16);
        tx.send(Notification::StateChanged(BootloaderState::EraseFirmware))
            .unwrap();
        // Status lines do not count as activity
        tx.send(Notification::Status {
            severity: Severity::Info,
            message: "still here".to_string(),
        })
        .unwrap();

        let started = Instant::now();
        let finished = wait_while_active(&mut rx, Duration::from_secs(2), |n| match n {
            Notification::Finished { success } => Some(*success),
            _ => None,
        })
        .await
        .unwrap();
        assert_eq!(finished, None);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        drop(tx);
    }

    #[tokio::test]
    async fn test_check_state_round_trip() {
        let (bus, handle, mut ecu) = setup();
        let mut notifications = handle.subscribe();

        handle.check_state().await.unwrap();
        let request = next_request(&mut ecu).await;
        assert_eq!(request.id, 0x18DA_6AF1);
        assert_eq!(request.payload()[..4], [0x03, 0x22, 0x15, 0x00]);

        bus.inject(RX, &[0x04, 0x62, 0x15, 0x00, 0xAA]);
        let active = wait_for(&mut notifications, |n| match n {
            Notification::BootloaderActive { active } => Some(*active),
            _ => None,
        })
        .await
        .unwrap();
        assert!(active);
        assert_eq!(handle.state().await.unwrap(), BootloaderState::Ready);
    }

    #[tokio::test]
    async fn test_precondition_reported_to_caller() {
        let (_bus, handle, _ecu) = setup();
        handle.ecu_uds_reset().await.unwrap();

        match handle.check_state().await {
            Err(BootloaderError::PreconditionViolation { state }) => {
                assert_eq!(state, BootloaderState::EcuUdsReset)
            }
            other => panic!("Expected precondition violation, got {:?}", other),
        }
        assert!(matches!(handle.start().await, Err(BootloaderError::PreconditionViolation { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_address_timeout() {
        let (_bus, handle, _ecu) = setup();
        let mut notifications = handle.subscribe();
        let started = Instant::now();

        handle.write_source_address(0x42).await.unwrap();
        let outcome = wait_for(&mut notifications, |n| match n {
            Notification::SourceAddressApplied { address, success } => Some((*address, *success)),
            _ => None,
        })
        .await
        .unwrap();

        assert_eq!(outcome, (0x42, false));
        assert!(started.elapsed() >= Duration::from_millis(2500));
        assert_eq!(handle.state().await.unwrap(), BootloaderState::Ready);
        assert_eq!(handle.identifiers().await.unwrap(), UdsIdentifiers::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_frames_paced() {
        let (bus, handle, mut ecu) = setup();
        let mut notifications = handle.subscribe();
        handle.set_firmware(Bytes::from(vec![0x42u8; 40])).await.unwrap();
        handle.start().await.unwrap();

        // Answer the preamble by hand
        let script: [&[u8]; 7] = [
            &[0x02, 0x50, 0x02],
            &[0x04, 0x67, 0x01, 0x00, 0x00],
            &[0x02, 0x67, 0x02],
            &[0x03, 0x6E, 0x15, 0x00],
            &[0x04, 0x71, 0x01, 0xFF, 0x00],
            &[0x30, 0x00, 0x00],
            &[0x02, 0x74, 0x20],
        ];
        for answer in script {
            next_request(&mut ecu).await;
            bus.inject(RX, answer);
        }

        let ff = next_request(&mut ecu).await;
        assert_eq!(ff.payload()[..4], [0x10, 0x2A, 0x36, 0x01]);
        bus.inject(RX, &[0x30, 0x00, 0x14]);

        // 36 bytes left: 6 consecutive frames, 20 ms apart
        let mut stamps = Vec::new();
        for sn in 1..=6u8 {
            let cf = next_request(&mut ecu).await;
            assert_eq!(cf.payload()[0], 0x20 | sn);
            stamps.push(Instant::now());
        }
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(20));
        }

        bus.inject(RX, &[0x02, 0x76, 0x01]);
        let exit = next_request(&mut ecu).await;
        assert_eq!(exit.payload()[..2], [0x01, 0x37]);
        bus.inject(RX, &[0x01, 0x77]);

        let success = wait_for(&mut notifications, |n| match n {
            Notification::Finished { success } => Some(*success),
            _ => None,
        })
        .await
        .unwrap();
        assert!(success);
    }

    #[tokio::test]
    async fn test_handle_closed_after_task_ends() {
        let bus = MockCanBus::new();
        let port: Arc<dyn CanPort> = Arc::new(bus.attach(&MockConfig::default()));
        let (handle, task) = spawn(port, MachineConfig::default());
        task.abort();
        let _ = task.await;
        assert!(matches!(handle.check_state().await, Err(BootloaderError::Closed)));
    }
}

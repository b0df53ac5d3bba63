//! Source address changes, node detection and identifier filtering
//!
//! Run with: cargo test -p canboot-tests --test addressing_test

use std::time::Duration;

use canboot_tests::{image, TestHarness};
use canboot_uds::j1939::CanIdentifier;
use canboot_uds::{detect, wait_for, BootloaderError, BootloaderState, MachineConfig, Notification};
use example_ecu::config::{BehaviorConfig, EcuTransportConfig};
use example_ecu::EcuConfig;
use pretty_assertions::assert_eq;

fn ecu_at(address: u8, heartbeat_ms: u64) -> EcuConfig {
    EcuConfig {
        transport: EcuTransportConfig {
            ecu_address: address,
            heartbeat_ms,
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn bootloader_active(harness: &TestHarness) -> bool {
    let mut notifications = harness.handle.subscribe();
    harness.handle.check_state().await.unwrap();
    wait_for(&mut notifications, |n| match n {
        Notification::BootloaderActive { active } => Some(*active),
        _ => None,
    })
    .await
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_write_source_address() {
    let harness = TestHarness::with_defaults();
    let mut notifications = harness.handle.subscribe();

    harness.handle.write_source_address(0x42).await.unwrap();
    let applied = wait_for(&mut notifications, |n| match n {
        Notification::SourceAddressApplied { address, success } => Some((*address, *success)),
        _ => None,
    })
    .await
    .unwrap();

    assert_eq!(applied, (0x42, true));
    assert_eq!(harness.ecu.source_address(), 0x42);

    let identifiers = harness.handle.identifiers().await.unwrap();
    assert_eq!(identifiers.tx.encode(), 0x18DA_42F1);
    assert_eq!(identifiers.rx.encode(), 0x18DA_F142);
    assert_eq!(harness.handle.state().await.unwrap(), BootloaderState::Ready);

    // The ECU answered from its new address
    let answer = harness.frames_from(0x42);
    assert_eq!(answer.len(), 1);
    assert_eq!(&answer[0].payload()[..4], &[0x03, 0x6E, 0x00, 0x11]);
}

#[tokio::test(start_paused = true)]
async fn test_flash_after_source_address_change() {
    let harness = TestHarness::with_defaults();
    let mut notifications = harness.handle.subscribe();

    harness.handle.write_source_address(0x30).await.unwrap();
    wait_for(&mut notifications, |n| match n {
        Notification::SourceAddressApplied { success, .. } => Some(*success),
        _ => None,
    })
    .await
    .unwrap();

    assert!(bootloader_active(&harness).await);

    let firmware = image(900);
    assert!(harness.flash(&firmware).await.unwrap());
    assert_eq!(harness.ecu.memory(), Some(firmware));

    // Nothing after the change went to the old address
    let old_destination = harness
        .tester_frames()
        .into_iter()
        .skip(1)
        .filter(|f| CanIdentifier::decode(f.id).dst() == 0x6A)
        .count();
    assert_eq!(old_destination, 0);
}

#[tokio::test(start_paused = true)]
async fn test_source_address_write_timeout() {
    let ecu = EcuConfig {
        behavior: BehaviorConfig {
            ignore_source_address_write: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let harness = TestHarness::new(ecu, MachineConfig::default());
    let before = harness.handle.identifiers().await.unwrap();
    let mut notifications = harness.handle.subscribe();

    let started = tokio::time::Instant::now();
    harness.handle.write_source_address(0x42).await.unwrap();
    let applied = wait_for(&mut notifications, |n| match n {
        Notification::SourceAddressApplied { address, success } => Some((*address, *success)),
        _ => None,
    })
    .await
    .unwrap();

    assert_eq!(applied, (0x42, false));
    assert!(started.elapsed() >= Duration::from_millis(2500));
    assert_eq!(harness.handle.identifiers().await.unwrap(), before);
    assert_eq!(harness.handle.state().await.unwrap(), BootloaderState::Ready);
    assert_eq!(harness.ecu.source_address(), 0x6A);
}

#[tokio::test(start_paused = true)]
async fn test_source_address_out_of_range() {
    let harness = TestHarness::with_defaults();

    let err = harness.handle.write_source_address(0x1FF).await.unwrap_err();
    assert!(matches!(err, BootloaderError::InvalidValue(_)));
    assert!(harness.tester_frames().is_empty());
    assert_eq!(harness.handle.state().await.unwrap(), BootloaderState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_read_source_address() {
    let harness = TestHarness::with_defaults();
    let mut notifications = harness.handle.subscribe();

    harness.handle.read_source_address().await.unwrap();
    let read = wait_for(&mut notifications, |n| match n {
        Notification::SourceAddressRead { address, success } => Some((*address, *success)),
        _ => None,
    })
    .await
    .unwrap();

    assert_eq!(read, (0x6A, true));
}

#[tokio::test(start_paused = true)]
async fn test_read_source_address_timeout() {
    // Nobody answers at 0x6A
    let harness = TestHarness::new(ecu_at(0x25, 0), MachineConfig::default());
    let mut notifications = harness.handle.subscribe();

    harness.handle.read_source_address().await.unwrap();
    let read = wait_for(&mut notifications, |n| match n {
        Notification::SourceAddressRead { success, .. } => Some(*success),
        _ => None,
    })
    .await
    .unwrap();

    assert!(!read);
    assert_eq!(harness.handle.state().await.unwrap(), BootloaderState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_detect_and_apply_candidate() {
    let harness = TestHarness::new(ecu_at(0x25, 100), MachineConfig::default());

    let identifiers = harness.handle.identifiers().await.unwrap();
    let port = harness.tester_port.clone();
    let detection = tokio::spawn(async move {
        detect(port, &identifiers, Duration::from_millis(1050)).await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // A quieter node on the same bus
    for _ in 0..3 {
        harness.bus.inject(0x0CF0_0433, &[0x00; 8]);
    }

    let candidates = detection.await.unwrap().unwrap();
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[1].address, 0x33);
    assert_eq!(candidates[1].total, 3);

    let best = candidates.first().copied().unwrap();
    assert_eq!(best.address, 0x25);
    assert!(best.total >= 10);
    assert_eq!(best.tester, 0xF1);

    harness
        .handle
        .apply_candidate(best.address, best.tester)
        .await
        .unwrap();
    let identifiers = harness.handle.identifiers().await.unwrap();
    assert_eq!(identifiers.tx.encode(), 0x18DA_25F1);
    assert_eq!(identifiers.rx.encode(), 0x18DA_F125);

    assert!(bootloader_active(&harness).await);
}

#[tokio::test(start_paused = true)]
async fn test_ignores_frames_from_other_identifiers() {
    // The driver addresses 0x6A but the ECU sits at 0x25
    let harness = TestHarness::new(ecu_at(0x25, 0), MachineConfig::default());
    let mut notifications = harness.handle.subscribe();

    harness.handle.check_state().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A valid fingerprint answer, but from the wrong node
    harness
        .bus
        .inject(0x18DA_F125, &[0x04, 0x62, 0x15, 0x00, 0xAA, 0x00, 0x00, 0x00]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        harness.handle.state().await.unwrap(),
        BootloaderState::ReadFingerprint
    );

    // The same answer on the response identifier is taken
    harness
        .bus
        .inject(0x18DA_F16A, &[0x04, 0x62, 0x15, 0x00, 0xAA, 0x00, 0x00, 0x00]);
    let active = wait_for(&mut notifications, |n| match n {
        Notification::BootloaderActive { active } => Some(*active),
        _ => None,
    })
    .await
    .unwrap();

    assert!(active);
    assert_eq!(harness.handle.state().await.unwrap(), BootloaderState::Ready);
}

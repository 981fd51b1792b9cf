//! 看门狗集成测试
//!
//! 使用合成时间调用 `scan_at`，不依赖后台线程的节奏。

mod common;

use common::*;
use dm_can::MockBus;
use dm_driver::{CoreEvent, MotorKey};
use dm_protocol::{ControlMode, MotorStatus};
use std::time::{Duration, Instant};

fn disables(bus: &MockBus, id: u16) -> usize {
    bus.sent_with_id(id).iter().filter(|f| is_disable(f)).count()
}

#[test]
fn test_one_disable_per_cooldown() {
    let bus = MockBus::new();
    let controller = controller(
        &[("can0", &bus)],
        vec![motor("can0", 1, ControlMode::Velocity)],
        fast_config(),
    );
    let key = MotorKey::new("can0", 1);
    controller.enable(&key).unwrap();
    let t0 = Instant::now();
    let watchdog = controller.watchdog();

    // 阈值 100ms，冷却 300ms
    assert!(watchdog.scan_at(t0 + Duration::from_millis(50)).is_empty());
    let found = watchdog.scan_at(t0 + Duration::from_millis(150));
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].key, key);
    assert!(found[0].send_error.is_none());
    assert!(watchdog.scan_at(t0 + Duration::from_millis(200)).is_empty());
    assert!(watchdog.scan_at(t0 + Duration::from_millis(400)).is_empty());
    assert_eq!(watchdog.scan_at(t0 + Duration::from_millis(500)).len(), 1);

    assert_eq!(disables(&bus, 0x201), 2);
}

#[test]
fn test_disabled_feedback_releases_latch() {
    let bus = MockBus::new();
    let controller = controller(
        &[("can0", &bus)],
        vec![motor("can0", 1, ControlMode::Velocity)],
        fast_config(),
    );
    let key = MotorKey::new("can0", 1);
    controller.enable(&key).unwrap();
    let watchdog = controller.watchdog();
    assert_eq!(
        watchdog
            .scan_at(Instant::now() + Duration::from_millis(150))
            .len(),
        1
    );

    bus.inject(feedback_frame(0x11, 0x1, MotorStatus::Disabled));
    assert!(wait_until(Duration::from_secs(1), || {
        !controller.registry().is_enabled(&key).unwrap()
    }));
    assert!(
        watchdog
            .scan_at(Instant::now() + Duration::from_secs(10))
            .is_empty()
    );
    assert_eq!(disables(&bus, 0x201), 1);
}

#[test]
fn test_fresh_motor_is_left_alone() {
    let bus = MockBus::new();
    let controller = controller(
        &[("can0", &bus)],
        vec![
            motor("can0", 1, ControlMode::Velocity),
            motor("can0", 2, ControlMode::Velocity),
        ],
        fast_config(),
    );
    let stale = MotorKey::new("can0", 1);
    let fresh = MotorKey::new("can0", 2);
    controller.enable(&stale).unwrap();
    controller.enable(&fresh).unwrap();
    let events = controller.subscribe_events();

    std::thread::sleep(Duration::from_millis(120));
    bus.inject(feedback_frame(0x12, 0x2, MotorStatus::Enabled));
    assert!(wait_until(Duration::from_secs(1), || {
        controller
            .snapshot_motor(&fresh)
            .unwrap()
            .telemetry
            .is_some()
    }));

    let found = controller.watchdog().scan_at(Instant::now());
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].key, stale);
    assert_eq!(disables(&bus, 0x202), 0);
    assert!(matches!(
        events.try_recv(),
        Ok(CoreEvent::WatchdogDisabled { key, .. }) if key == stale
    ));
}

#[test]
fn test_disabled_motors_are_ignored() {
    let bus = MockBus::new();
    let controller = controller(
        &[("can0", &bus)],
        vec![motor("can0", 1, ControlMode::Velocity)],
        fast_config(),
    );
    let found = controller
        .watchdog()
        .scan_at(Instant::now() + Duration::from_secs(5));
    assert!(found.is_empty());
    assert!(bus.sent_frames().is_empty());
}

#[test]
fn test_send_failure_is_reported() {
    let bus = MockBus::new();
    let controller = controller(
        &[("can0", &bus)],
        vec![motor("can0", 1, ControlMode::Velocity)],
        fast_config(),
    );
    let key = MotorKey::new("can0", 1);
    controller.enable(&key).unwrap();
    let events = controller.subscribe_events();
    bus.fail_sends(Some(dm_can::MockFailure::DeviceDown));

    let found = controller
        .watchdog()
        .scan_at(Instant::now() + Duration::from_millis(150));
    assert_eq!(found.len(), 1);
    assert!(found[0].send_error.is_some());
    assert!(matches!(
        events.try_recv(),
        Ok(CoreEvent::WatchdogSendFailed { .. })
    ));
}

#[test]
fn test_background_watchdog_intervenes() {
    let bus = MockBus::new();
    let mut config = fast_config();
    config.watchdog.interval_ms = 10;
    let controller = controller(
        &[("can0", &bus)],
        vec![motor("can0", 1, ControlMode::Velocity)],
        config,
    );
    controller.enable(&MotorKey::new("can0", 1)).unwrap();
    let mut handle = controller.spawn_watchdog().unwrap();
    assert!(handle.is_running());

    assert!(wait_until(Duration::from_secs(2), || disables(&bus, 0x201) == 1));
    handle.stop();
    assert!(!handle.is_running());
}

//! 控制器命令与参数访问集成测试

mod common;

use common::*;
use dm_can::MockBus;
use dm_driver::{DriverError, MitTarget, MotorKey, RegistryRecord};
use dm_protocol::{ControlMode, DmFrame, ID_MANAGEMENT, MotorStatus, ProtocolError};
use std::time::Duration;

// 辅助函数：应答读寄存器，PMAX/VMAX/TMAX 返回给定浮点值，CTRL_MODE 返回 MIT
fn register_responder(p_max: f32, v_max: f32, t_max: f32) -> impl FnMut(&DmFrame) -> Vec<DmFrame> + Send {
    move |frame| {
        if frame.id != ID_MANAGEMENT {
            return Vec::new();
        }
        let mut reply = *frame;
        if frame.data[2] == 0x33 {
            let value = match frame.data[3] {
                0x15 => p_max.to_bits(),
                0x16 => v_max.to_bits(),
                0x17 => t_max.to_bits(),
                0x0A => 1,
                _ => 0,
            };
            reply.data[4..8].copy_from_slice(&value.to_le_bytes());
        }
        vec![reply]
    }
}

#[test]
fn test_mode_precondition_sends_nothing() {
    let bus = MockBus::new();
    let controller = controller(
        &[("can0", &bus)],
        vec![motor("can0", 1, ControlMode::Mit)],
        fast_config(),
    );
    let key = MotorKey::new("can0", 1);

    match controller.set_velocity(&key, 1.0) {
        Err(DriverError::ModePrecondition {
            required, actual, ..
        }) => {
            assert_eq!(required, ControlMode::Velocity);
            assert_eq!(actual, ControlMode::Mit);
        },
        other => panic!("expected ModePrecondition, got {other:?}"),
    }
    assert!(matches!(
        controller.set_position_velocity(&key, 0.5, 1.0),
        Err(DriverError::ModePrecondition { .. })
    ));
    assert!(bus.sent_frames().is_empty());
}

#[test]
fn test_mit_target_out_of_range_is_rejected() {
    let bus = MockBus::new();
    let controller = controller(
        &[("can0", &bus)],
        vec![motor("can0", 1, ControlMode::Mit)],
        fast_config(),
    );
    let key = MotorKey::new("can0", 1);
    let target = MitTarget {
        position: 0.0,
        velocity: 0.0,
        kp: 450.0,
        kd: 1.0,
        torque: 0.0,
    };
    assert!(matches!(
        controller.set_mit_target(&key, target),
        Err(DriverError::Protocol(ProtocolError::OutOfRange { field: "kp", .. }))
    ));
    assert!(bus.sent_frames().is_empty());

    controller
        .set_mit_target(
            &key,
            MitTarget {
                kp: 20.0,
                ..target
            },
        )
        .unwrap();
    assert_eq!(bus.sent_with_id(0x301).len(), 1);
}

#[test]
fn test_unknown_motor() {
    let bus = MockBus::new();
    let controller = controller(&[("can0", &bus)], Vec::new(), fast_config());
    assert!(matches!(
        controller.enable(&MotorKey::new("can0", 4)),
        Err(DriverError::UnknownMotor(_))
    ));
    assert!(bus.sent_frames().is_empty());
}

#[test]
fn test_refresh_limits_and_mode() {
    let bus = MockBus::new();
    bus.set_responder(register_responder(3.14, 45.0, 18.0));
    let controller = controller(
        &[("can0", &bus)],
        vec![motor("can0", 1, ControlMode::Disabled)],
        fast_config(),
    );
    let key = MotorKey::new("can0", 1);

    let limits = controller.refresh_limits(&key).unwrap();
    assert_eq!(limits.p_max, 3.14);
    assert_eq!(limits.v_max, 45.0);
    assert_eq!(limits.t_max, 18.0);
    assert_eq!(controller.registry().limits(&key).unwrap(), limits);

    assert_eq!(controller.refresh_mode(&key).unwrap(), ControlMode::Mit);
    assert_eq!(controller.registry().mode(&key).unwrap(), ControlMode::Mit);
}

#[test]
fn test_unusable_limits_are_rejected() {
    let bus = MockBus::new();
    bus.set_responder(register_responder(0.0, 45.0, 18.0));
    let controller = controller(
        &[("can0", &bus)],
        vec![motor("can0", 1, ControlMode::Mit)],
        fast_config(),
    );
    let key = MotorKey::new("can0", 1);
    let before = controller.registry().limits(&key).unwrap();
    assert!(controller.refresh_limits(&key).is_err());
    assert_eq!(controller.registry().limits(&key).unwrap(), before);
}

#[test]
fn test_set_mode_requires_ack() {
    let bus = MockBus::new();
    let controller = controller(
        &[("can0", &bus)],
        vec![motor("can0", 1, ControlMode::Disabled)],
        fast_config(),
    );
    let key = MotorKey::new("can0", 1);
    assert!(matches!(
        controller.set_mode(&key, ControlMode::Velocity),
        Err(DriverError::Timeout)
    ));
    assert_eq!(controller.registry().mode(&key).unwrap(), ControlMode::Disabled);

    bus.set_responder(management_responder(&[1], true));
    controller.set_mode(&key, ControlMode::Velocity).unwrap();
    assert_eq!(controller.registry().mode(&key).unwrap(), ControlMode::Velocity);
    assert!(controller.set_mode(&key, ControlMode::Disabled).is_err());
}

#[test]
fn test_feedback_updates_snapshot() {
    let bus = MockBus::new();
    let controller = controller(
        &[("can0", &bus)],
        vec![motor("can0", 1, ControlMode::Velocity)],
        fast_config(),
    );
    let key = MotorKey::new("can0", 1);
    bus.inject(feedback_frame(0x11, 0x1, MotorStatus::Enabled));
    assert!(wait_until(Duration::from_secs(1), || {
        controller.snapshot_motor(&key).unwrap().telemetry.is_some()
    }));

    let snapshot = controller.snapshot_motor(&key).unwrap();
    let telemetry = snapshot.telemetry.unwrap();
    assert_eq!(telemetry.status, MotorStatus::Enabled);
    assert_eq!(telemetry.temp_mos, 31);
    assert!((telemetry.position - 0.25).abs() < 1e-3);
    assert!(snapshot.enabled);
    assert!(snapshot.last_seen.is_some());
}

#[test]
fn test_record_export_import() {
    let bus = MockBus::new();
    let mut named = motor("can0", 1, ControlMode::Velocity);
    named.name = Some("left".into());
    named.groups = vec!["wheels".into()];
    let controller = controller(
        &[("can0", &bus)],
        vec![named, motor("can0", 2, ControlMode::Mit)],
        fast_config(),
    );

    let record = controller.export_record();
    assert_eq!(record.motors.len(), 2);
    let text = record.to_toml_string().unwrap();
    let parsed = RegistryRecord::from_toml_str(&text).unwrap();
    assert_eq!(parsed, record);

    let other = MockBus::new();
    let fresh = common::controller(&[("can0", &other)], Vec::new(), fast_config());
    assert_eq!(fresh.import_record(&parsed).unwrap(), 2);
    assert_eq!(fresh.registry().group("wheels"), vec![MotorKey::new("can0", 1)]);
    assert_eq!(
        fresh.registry().mode(&MotorKey::new("can0", 2)).unwrap(),
        ControlMode::Mit
    );
}

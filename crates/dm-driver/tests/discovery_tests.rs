//! 发现与 ID 分配集成测试

mod common;

use common::*;
use dm_can::MockBus;
use dm_driver::{
    AbortReason, AssignmentError, AssignmentOutcome, AssignmentRequest, ChannelId, DiscoveryPhase,
    DriverError, MotorKey,
};
use std::sync::Arc;
use dm_protocol::{ControlMode, ID_MANAGEMENT, MotorStatus, Rid};

#[test]
fn test_passive_feedback_registers_motor() {
    let bus = MockBus::new();
    let controller = controller(&[("can0", &bus)], Vec::new(), fast_config());
    let mut session = controller.start_discovery(&[ChannelId::from("can0")]).unwrap();
    bus.inject(feedback_frame(0x11, 0x1, MotorStatus::Disabled));

    let found = session.passive_listen().unwrap();
    assert_eq!(found.len(), 1);

    let key = MotorKey::new("can0", 0x01);
    assert_eq!(controller.registry().len(), 1);
    assert!(controller.registry().contains(&key));
    assert_eq!(controller.registry().master_id(&key).unwrap(), 0x11);
    assert_eq!(session.status_handle().phase(), DiscoveryPhase::PassiveListen);
}

#[test]
fn test_known_motors_are_not_rediscovered() {
    let bus = MockBus::new();
    let controller = controller(
        &[("can0", &bus)],
        vec![motor("can0", 1, ControlMode::Velocity)],
        fast_config(),
    );
    let mut session = controller.start_discovery(&[ChannelId::from("can0")]).unwrap();
    bus.inject(feedback_frame(0x11, 0x1, MotorStatus::Enabled));

    assert!(session.passive_listen().unwrap().is_empty());
    assert_eq!(controller.registry().len(), 1);
}

#[test]
fn test_unacknowledged_write_keeps_prior_ids() {
    let bus = MockBus::new();
    let controller = controller(
        &[("can0", &bus)],
        vec![motor("can0", 1, ControlMode::Velocity)],
        fast_config(),
    );
    let key = MotorKey::new("can0", 1);
    let mut session = controller.start_discovery(&[ChannelId::from("can0")]).unwrap();

    let results = controller
        .assign_ids(
            &mut session,
            vec![AssignmentRequest::new(key.clone(), 5, ControlMode::Velocity)],
        )
        .unwrap();
    assert!(matches!(
        results[0].outcome,
        AssignmentOutcome::Aborted(AssignmentError::NotAcknowledged { rid: Rid::EscId, .. })
    ));

    // 首个写入未确认后不再继续
    assert_eq!(bus.sent_with_id(ID_MANAGEMENT).len(), 1);
    assert!(controller.registry().contains(&key));
    assert_eq!(controller.registry().master_id(&key).unwrap(), 0x11);
    assert!(!controller.registry().contains(&MotorKey::new("can0", 5)));

    let report = session.finish();
    assert_eq!(report.phase, DiscoveryPhase::Aborted);
    assert_eq!(report.aborted_reason, Some(AbortReason::AssignmentsIncomplete));
}

#[test]
fn test_successful_assignment_writes_in_order_and_saves() {
    let bus = MockBus::new();
    bus.set_responder(management_responder(&[1], true));
    let controller = controller(
        &[("can0", &bus)],
        vec![motor("can0", 1, ControlMode::Disabled)],
        fast_config(),
    );
    let mut session = controller.start_discovery(&[ChannelId::from("can0")]).unwrap();

    let results = session
        .assign(vec![AssignmentRequest::new(
            MotorKey::new("can0", 1),
            3,
            ControlMode::Velocity,
        )])
        .unwrap();
    let new_key = MotorKey::new("can0", 3);
    assert_eq!(results[0].outcome, AssignmentOutcome::Saved(new_key.clone()));
    assert_eq!(session.phase(), DiscoveryPhase::Complete);

    // 先失能，再按 ESC_ID、MST_ID、CTRL_MODE 顺序写入，最后保存
    let sent = bus.sent_frames();
    assert_eq!(sent[0].id, 0x201);
    assert!(is_disable(&sent[0]));
    let management: Vec<(u8, u8)> = bus
        .sent_with_id(ID_MANAGEMENT)
        .iter()
        .map(|f| (f.data[2], f.data[3]))
        .collect();
    assert_eq!(management, vec![(0x55, 0x08), (0x55, 0x07), (0x55, 0x0A), (0xAA, 0x00)]);

    let registry = controller.registry();
    assert!(!registry.contains(&MotorKey::new("can0", 1)));
    assert_eq!(registry.master_id(&new_key).unwrap(), 0x13);
    assert_eq!(registry.mode(&new_key).unwrap(), ControlMode::Velocity);
    assert!(!registry.is_unsaved(&new_key).unwrap());
}

#[test]
fn test_missing_save_ack_is_unsaved() {
    let bus = MockBus::new();
    bus.set_responder(management_responder(&[1], false));
    let controller = controller(
        &[("can0", &bus)],
        vec![motor("can0", 1, ControlMode::Velocity)],
        fast_config(),
    );
    let mut session = controller.start_discovery(&[ChannelId::from("can0")]).unwrap();

    let results = session
        .assign(vec![AssignmentRequest::new(
            MotorKey::new("can0", 1),
            2,
            ControlMode::Mit,
        )])
        .unwrap();
    let new_key = MotorKey::new("can0", 2);
    assert_eq!(results[0].outcome, AssignmentOutcome::Unsaved(new_key.clone()));
    assert!(controller.registry().is_unsaved(&new_key).unwrap());
    assert_eq!(session.phase(), DiscoveryPhase::Aborted);
}

#[test]
fn test_failure_only_affects_that_motor() {
    let bus = MockBus::new();
    // 只有 ESC 1 应答
    bus.set_responder(management_responder(&[1], true));
    let controller = controller(
        &[("can0", &bus)],
        vec![
            motor("can0", 1, ControlMode::Velocity),
            motor("can0", 2, ControlMode::Velocity),
        ],
        fast_config(),
    );
    let mut session = controller.start_discovery(&[ChannelId::from("can0")]).unwrap();

    let results = session
        .assign(vec![
            AssignmentRequest::new(MotorKey::new("can0", 2), 6, ControlMode::Velocity),
            AssignmentRequest::new(MotorKey::new("can0", 1), 5, ControlMode::Velocity),
        ])
        .unwrap();
    assert!(matches!(results[0].outcome, AssignmentOutcome::Aborted(_)));
    assert_eq!(
        results[1].outcome,
        AssignmentOutcome::Saved(MotorKey::new("can0", 5))
    );
    assert!(controller.registry().contains(&MotorKey::new("can0", 2)));
}

#[test]
fn test_target_identity_in_use() {
    let bus = MockBus::new();
    let controller = controller(
        &[("can0", &bus)],
        vec![
            motor("can0", 1, ControlMode::Velocity),
            motor("can0", 2, ControlMode::Velocity),
        ],
        fast_config(),
    );
    let mut session = controller.start_discovery(&[ChannelId::from("can0")]).unwrap();
    let results = session
        .assign(vec![AssignmentRequest::new(
            MotorKey::new("can0", 1),
            2,
            ControlMode::Velocity,
        )])
        .unwrap();
    assert_eq!(
        results[0].outcome,
        AssignmentOutcome::Aborted(AssignmentError::IdentityInUse(MotorKey::new("can0", 2)))
    );
    assert!(bus.sent_frames().is_empty());
}

#[test]
fn test_assignment_refused_after_estop() {
    let bus = MockBus::new();
    bus.set_responder(management_responder(&[1], true));
    let controller = controller(
        &[("can0", &bus)],
        vec![motor("can0", 1, ControlMode::Velocity)],
        fast_config(),
    );
    let mut session = controller.start_discovery(&[ChannelId::from("can0")]).unwrap();
    controller.estop();

    let results = session
        .assign(vec![AssignmentRequest::new(
            MotorKey::new("can0", 1),
            4,
            ControlMode::Velocity,
        )])
        .unwrap();
    assert_eq!(
        results[0].outcome,
        AssignmentOutcome::Aborted(AssignmentError::Cancelled)
    );
    assert_eq!(session.aborted_reason(), Some(&AbortReason::EStop));
    assert!(bus.sent_with_id(ID_MANAGEMENT).is_empty());
}

#[test]
fn test_estop_during_assignment_stops_rid_writes() {
    let bus = MockBus::new();
    let controller = Arc::new(controller(
        &[("can0", &bus)],
        vec![motor("can0", 1, ControlMode::Velocity)],
        fast_config(),
    ));
    let weak = Arc::downgrade(&controller);
    let mut echo = management_responder(&[1], true);
    bus.set_responder(move |frame| {
        // 在 ESC_ID 写入应答之前锁存 E-STOP
        if frame.id == ID_MANAGEMENT
            && frame.data[2] == 0x55
            && frame.data[3] == Rid::EscId as u8
            && let Some(controller) = weak.upgrade()
        {
            controller.estop();
        }
        echo(frame)
    });

    let mut session = controller.start_discovery(&[ChannelId::from("can0")]).unwrap();
    let results = session
        .assign(vec![AssignmentRequest::new(
            MotorKey::new("can0", 1),
            5,
            ControlMode::Velocity,
        )])
        .unwrap();

    assert_eq!(
        results[0].outcome,
        AssignmentOutcome::Aborted(AssignmentError::Cancelled)
    );
    assert_eq!(session.phase(), DiscoveryPhase::Aborted);
    assert_eq!(session.aborted_reason(), Some(&AbortReason::EStop));

    let management = bus.sent_with_id(ID_MANAGEMENT);
    assert_eq!(management.len(), 1);
    assert_eq!(management[0].data[3], Rid::EscId as u8);
    assert!(controller.registry().contains(&MotorKey::new("can0", 1)));
    assert!(!controller.registry().contains(&MotorKey::new("can0", 5)));
    assert!(!controller.registry().is_enabled(&MotorKey::new("can0", 1)).unwrap());
    bus.clear_responder();
}

#[test]
fn test_session_registers_with_estop_until_finished() {
    let bus = MockBus::new();
    let controller = controller(&[("can0", &bus)], Vec::new(), fast_config());

    let finished = controller.start_discovery(&[ChannelId::from("can0")]).unwrap();
    finished.finish();
    let live = controller.start_discovery(&[ChannelId::from("can0")]).unwrap();

    let report = controller.estop();
    assert_eq!(report.cancelled_activities, 1);
    assert!(live.cancel_token().is_cancelled());
    assert_eq!(live.finish().aborted_reason, Some(AbortReason::EStop));
}

#[test]
fn test_discovery_refused_while_latched() {
    let bus = MockBus::new();
    let controller = controller(&[("can0", &bus)], Vec::new(), fast_config());
    controller.estop();
    assert!(matches!(
        controller.start_discovery(&[ChannelId::from("can0")]),
        Err(DriverError::EStopLatched)
    ));

    assert!(controller.clear_estop());
    assert!(controller.start_discovery(&[ChannelId::from("can0")]).is_ok());
}

//! 集成测试公用工具：mock 总线上的控制器与模拟电机
#![allow(dead_code)]

use dm_can::MockBus;
use dm_driver::{ControllerBuilder, CoreConfig, MotorController, MotorRecord, RegistryRecord};
use dm_protocol::{ControlMode, DmFrame, Feedback, FeedbackLimits, ID_MANAGEMENT, MotorStatus};
use std::time::{Duration, Instant};

pub fn feedback_frame(master_id: u16, esc_nibble: u8, status: MotorStatus) -> DmFrame {
    Feedback {
        master_id,
        esc_nibble,
        status,
        position: 0.25,
        velocity: 0.0,
        torque: 0.0,
        temp_mos: 31,
        temp_rotor: 29,
        timestamp_us: 0,
    }
    .to_frame(&FeedbackLimits::default())
}

pub fn motor(channel: &str, esc_id: u8, mode: ControlMode) -> MotorRecord {
    MotorRecord {
        channel: channel.into(),
        esc_id,
        master_id: esc_id as u16 + 0x10,
        mode,
        name: None,
        groups: Vec::new(),
        limits: None,
        unsaved: false,
    }
}

/// 在给定 mock 总线上构建控制器
pub fn controller(buses: &[(&str, &MockBus)], motors: Vec<MotorRecord>, config: CoreConfig) -> MotorController {
    let mut builder = ControllerBuilder::new()
        .config(config)
        .record(RegistryRecord { motors });
    for (name, bus) in buses {
        builder = builder.adapter(*name, bus.adapter());
    }
    builder.build().unwrap()
}

/// 测试用的短超时配置
pub fn fast_config() -> CoreConfig {
    let mut config = CoreConfig::default();
    config.discovery.passive_duration_ms = 100;
    config.discovery.probe_timeout_ms = 20;
    config.discovery.rid_timeout_ms = 50;
    config.watchdog.threshold_ms = 100;
    config.watchdog.cooldown_ms = 300;
    config
}

/// 管理帧应答器：对 `esc_ids` 中的电机回显读写，`ack_save` 控制是否应答保存
pub fn management_responder(
    esc_ids: &'static [u8],
    ack_save: bool,
) -> impl FnMut(&DmFrame) -> Vec<DmFrame> + Send + 'static {
    move |frame| {
        if frame.id != ID_MANAGEMENT {
            return Vec::new();
        }
        let esc = u16::from_le_bytes([frame.data[0], frame.data[1]]);
        if esc > u8::MAX as u16 || !esc_ids.contains(&(esc as u8)) {
            return Vec::new();
        }
        if frame.data[2] == 0xAA && !ack_save {
            return Vec::new();
        }
        vec![*frame]
    }
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

pub fn is_disable(frame: &DmFrame) -> bool {
    frame.data == [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFD]
}

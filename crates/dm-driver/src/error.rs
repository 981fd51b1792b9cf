//! 驱动层错误类型定义

use crate::registry::{ChannelId, MotorKey};
use dm_can::CanError;
use dm_protocol::{ControlMode, ProtocolError, Rid};
use std::time::Duration;
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 总线错误（不在驱动内部静默重试）
    #[error("CAN bus error: {0}")]
    Bus(#[from] CanError),

    /// 协议编解码错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 电机当前模式与命令不匹配，命令未发送
    #[error("Motor {key} is in {actual} mode, command requires {required} mode")]
    ModePrecondition {
        key: MotorKey,
        required: ControlMode,
        actual: ControlMode,
    },

    /// E-STOP 已锁存，必须先 `clear_estop()`
    #[error("E-STOP is latched; clear it before issuing motion commands")]
    EStopLatched,

    #[error("Unknown motor: {0}")]
    UnknownMotor(MotorKey),

    #[error("Unknown channel: {0}")]
    UnknownChannel(ChannelId),

    /// 同一通道上同一帧 ID 只能有一个周期发送
    #[error("Arbitration ID 0x{id:03X} already has a periodic schedule")]
    DuplicateSchedule { id: u16 },

    /// 周期发送已被停止（可能被 E-STOP 清除）
    #[error("Periodic schedule for 0x{id:03X} is no longer active")]
    UnknownSchedule { id: u16 },

    /// 编组中存在模式不符合的电机，未启动任何周期发送
    #[error("Group not ready: {} motor(s) not in {required} mode: {}", .not_ready.len(), join_keys(.not_ready))]
    GroupNotReady {
        required: ControlMode,
        not_ready: Vec<MotorKey>,
    },

    #[error("Assignment failed: {0}")]
    Assignment(#[from] AssignmentError),

    /// 发现会话的阶段不允许该操作
    #[error("Discovery session is in phase {actual:?}, cannot {operation}")]
    InvalidPhase {
        operation: &'static str,
        actual: crate::discovery::DiscoveryPhase,
    },

    /// 通道已关闭（RX / 调度线程退出）
    #[error("Channel closed")]
    ChannelClosed,

    /// 等待应答超时
    #[error("Operation timeout")]
    Timeout,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

fn join_keys(keys: &[MotorKey]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// ID 分配失败
///
/// 任何一步失败都会中止该电机的分配，注册表中的原 ID 保持不变。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssignmentError {
    #[error("RID {rid:?} write to ESC 0x{esc_id:02X} not acknowledged within {timeout:?}")]
    NotAcknowledged {
        esc_id: u8,
        rid: Rid,
        timeout: Duration,
    },

    #[error("RID {rid:?} write to ESC 0x{esc_id:02X} failed: {message}")]
    WriteFailed { esc_id: u8, rid: Rid, message: String },

    #[error("Disable before assignment failed on ESC 0x{esc_id:02X}: {message}")]
    DisableFailed { esc_id: u8, message: String },

    #[error("Target identity {0} is already used by another motor")]
    IdentityInUse(MotorKey),

    #[error("Motor {0} is not registered")]
    UnknownMotor(MotorKey),

    #[error("Target ESC_ID 0x{0:02X} is outside 0..=127")]
    InvalidTarget(u8),

    #[error("Control mode {0} cannot be written to the motor")]
    UnwritableMode(ControlMode),

    #[error("Assignment cancelled before it started")]
    Cancelled,
}

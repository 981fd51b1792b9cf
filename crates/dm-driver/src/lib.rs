//! 驱动层模块
//!
//! 达妙电机的运行时核心，包括：
//! - 通道：RX 线程、接收流、按帧 ID 管理的周期发送表
//! - 注册表：电机状态的唯一所有者
//! - 发现与 ID 分配状态机
//! - 看门狗与全局 E-STOP
//! - 多电机编排调度
//!
//! # 使用场景
//!
//! 大多数调用方只需要 [`ControllerBuilder`] 与 [`MotorController`]；
//! 各组件也可单独使用（例如测试中直接用 [`Channel`] 搭配 mock 总线）。

mod builder;
pub mod channel;
pub mod config;
mod controller;
pub mod discovery;
mod error;
pub mod estop;
pub mod events;
pub mod hooks;
pub mod management;
pub mod metrics;
pub mod persistence;
pub mod registry;
pub mod scheduler;
pub mod watchdog;

pub use builder::ControllerBuilder;
pub use channel::{Channel, ChannelMap, FrameStream, PeriodicHandle};
pub use config::{ChannelConfig, CoreConfig, DiscoveryConfig, WatchdogConfig};
pub use controller::{MitTarget, MotorController};
pub use discovery::{
    AbortReason, AssignmentOutcome, AssignmentRequest, AssignmentResult, CancelToken,
    DiscoveredMotor, DiscoveryConflict, DiscoveryPhase, DiscoveryReport, DiscoverySession,
    DiscoverySource, DiscoveryStatus, DiscoveryStatusHandle, PendingFeedback,
};
pub use error::{AssignmentError, DriverError};
pub use estop::{EStop, EStopReport};
pub use events::{CoreEvent, EventBus, StopReason};
pub use hooks::{FrameCallback, HookManager, RegistryFeedbackHook};
pub use metrics::{ChannelMetrics, MetricsSnapshot};
pub use persistence::{MotorRecord, RegistryRecord};
pub use registry::{ChannelId, MotorKey, MotorSnapshot, Registry, Telemetry};
pub use scheduler::{Choreography, ChoreographyHandle, ScheduleParams, Scheduler};
pub use watchdog::{Intervention, Watchdog, WatchdogHandle};

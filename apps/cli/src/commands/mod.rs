//! 命令定义和实现

pub mod assign;
pub mod config;
pub mod demo;
pub mod discover;
pub mod monitor;
pub mod motor;

pub use assign::AssignCommand;
pub use config::ConfigCommand;
pub use demo::DemoCommand;
pub use discover::DiscoverCommand;
pub use monitor::MonitorCommand;
pub use motor::{MotorArgs, VelocityCommand};

use clap::ValueEnum;
use dm_protocol::ControlMode;

/// 可写入电机的控制模式
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Mit,
    #[value(name = "pos-vel")]
    PositionVelocity,
    Velocity,
}

impl From<ModeArg> for ControlMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Mit => ControlMode::Mit,
            ModeArg::PositionVelocity => ControlMode::PositionVelocity,
            ModeArg::Velocity => ControlMode::Velocity,
        }
    }
}

//! 多电机演示命令
//!
//! 演示运行期间 Ctrl-C 触发 E-STOP；正常结束时停止编排并失能参与的电机。

use crate::session::{ConnectArgs, Session};
use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use dm_driver::{Choreography, MotorKey, ScheduleParams};
use std::time::{Duration, Instant};

/// 编组与节拍参数
#[derive(Args, Debug, Clone)]
pub struct GroupArgs {
    /// 参与的电机（逗号分隔的 `[channel:]esc`）
    #[arg(short, long, value_delimiter = ',', conflicts_with = "group")]
    pub motors: Vec<String>,

    /// 使用电机记录中的分组
    #[arg(short, long)]
    pub group: Option<String>,

    /// 运行时长（秒），0 表示直到 Ctrl-C
    #[arg(short, long, default_value_t = 10.0)]
    pub duration: f32,

    /// 负载更新节拍（毫秒）
    #[arg(long, default_value_t = 20)]
    pub tick_ms: u64,

    /// 周期发送周期（毫秒）
    #[arg(long, default_value_t = 10)]
    pub period_ms: u64,
}

/// 演示命令
#[derive(Subcommand, Debug)]
pub enum DemoCommand {
    /// 正弦速度波，相邻电机相位递增
    Sine {
        #[command(flatten)]
        group: GroupArgs,

        /// 峰值速度（rad/s）
        #[arg(long, default_value_t = 3.0)]
        amplitude: f32,

        /// 频率（Hz）
        #[arg(long, default_value_t = 0.5)]
        frequency: f32,

        /// 相邻电机的相位差（rad）
        #[arg(long, default_value_t = 0.8)]
        phase_step: f32,
    },

    /// 接力：每次只有一台电机运动，方向每轮交替
    Duet {
        #[command(flatten)]
        group: GroupArgs,

        /// 峰值速度（rad/s）
        #[arg(long, default_value_t = 4.0)]
        speed: f32,

        /// 每台电机的持续时间（秒）
        #[arg(long, default_value_t = 1.5)]
        hold: f32,
    },

    /// 位置速度模式的 8 字轨迹（偶数位 x，奇数位 y）
    Figure8 {
        #[command(flatten)]
        group: GroupArgs,

        /// 位置幅值（rad）
        #[arg(long, default_value_t = 1.0)]
        amplitude: f32,

        /// 频率（Hz）
        #[arg(long, default_value_t = 0.25)]
        frequency: f32,

        /// 位置速度模式的速度上限（rad/s）
        #[arg(long, default_value_t = 5.0)]
        max_velocity: f32,
    },
}

impl DemoCommand {
    fn split(&self) -> (Choreography, &GroupArgs) {
        match self {
            DemoCommand::Sine {
                group,
                amplitude,
                frequency,
                phase_step,
            } => (
                Choreography::Sine {
                    amplitude: *amplitude,
                    frequency_hz: *frequency,
                    phase_step: *phase_step,
                },
                group,
            ),
            DemoCommand::Duet { group, speed, hold } => (
                Choreography::Duet {
                    speed: *speed,
                    hold_s: *hold,
                },
                group,
            ),
            DemoCommand::Figure8 {
                group,
                amplitude,
                frequency,
                max_velocity,
            } => (
                Choreography::FigureEight {
                    amplitude: *amplitude,
                    frequency_hz: *frequency,
                    max_velocity: *max_velocity,
                },
                group,
            ),
        }
    }

    pub fn execute(&self, connect: &ConnectArgs) -> Result<()> {
        let (choreography, args) = self.split();
        let session = Session::open(connect)?;
        session.install_estop_handler()?;
        let controller = &session.controller;

        let motors: Vec<MotorKey> = match &args.group {
            Some(name) => controller.registry().group(name),
            None => args
                .motors
                .iter()
                .map(|m| connect.motor_key(m))
                .collect::<Result<_>>()?,
        };
        if motors.is_empty() {
            bail!("没有参与演示的电机（使用 --motors 或 --group）");
        }

        for key in &motors {
            controller.enable(key)?;
        }
        let params = ScheduleParams {
            tick: Duration::from_millis(args.tick_ms.max(1)),
            period: Duration::from_millis(args.period_ms.max(1)),
        };
        let handle = match controller.start_choreography(choreography, &motors, params) {
            Ok(handle) => handle,
            Err(e) => {
                for key in &motors {
                    let _ = controller.disable(key);
                }
                return Err(e.into());
            },
        };
        println!(
            "⏳ {} 演示运行中，{} 台电机（Ctrl-C 急停）",
            choreography.name(),
            motors.len()
        );

        let started = Instant::now();
        let limit = (args.duration > 0.0).then(|| Duration::from_secs_f32(args.duration));
        while !session.is_interrupted() && controller.scheduler().is_active(&handle) {
            if limit.is_some_and(|limit| started.elapsed() >= limit) {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        if session.is_interrupted() {
            println!("🛑 已急停");
            return Ok(());
        }
        controller.stop_choreography(&handle);
        for key in &motors {
            controller.disable(key)?;
        }
        println!("✅ 演示结束");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> GroupArgs {
        GroupArgs {
            motors: vec!["can0:1".into(), "can0:2".into()],
            group: None,
            duration: 5.0,
            tick_ms: 20,
            period_ms: 10,
        }
    }

    #[test]
    fn test_split_maps_parameters() {
        let cmd = DemoCommand::Duet {
            group: group(),
            speed: 2.0,
            hold: 0.5,
        };
        let (choreography, args) = cmd.split();
        assert_eq!(
            choreography,
            Choreography::Duet {
                speed: 2.0,
                hold_s: 0.5
            }
        );
        assert_eq!(args.motors.len(), 2);
    }

    #[test]
    fn test_figure8_name() {
        let cmd = DemoCommand::Figure8 {
            group: group(),
            amplitude: 1.0,
            frequency: 0.25,
            max_velocity: 5.0,
        };
        assert_eq!(cmd.split().0.name(), "figure-eight");
    }
}

//! 单电机命令：使能、失能、置零、速度

use crate::session::{ConnectArgs, Session};
use anyhow::Result;
use clap::Args;
use dm_protocol::encode_velocity;
use std::time::{Duration, Instant};

/// 单电机参数
#[derive(Args, Debug)]
pub struct MotorArgs {
    /// 电机（`[channel:]esc`，如 can0:1）
    pub motor: String,
}

impl MotorArgs {
    pub fn enable(&self, connect: &ConnectArgs) -> Result<()> {
        let key = connect.motor_key(&self.motor)?;
        Session::open(connect)?.controller.enable(&key)?;
        println!("✅ {} 已使能", key);
        Ok(())
    }

    pub fn disable(&self, connect: &ConnectArgs) -> Result<()> {
        let key = connect.motor_key(&self.motor)?;
        Session::open(connect)?.controller.disable(&key)?;
        println!("✅ {} 已失能", key);
        Ok(())
    }

    pub fn zero(&self, connect: &ConnectArgs) -> Result<()> {
        let key = connect.motor_key(&self.motor)?;
        Session::open(connect)?.controller.zero(&key)?;
        println!("✅ {} 零点已设置", key);
        Ok(())
    }
}

/// 速度命令参数
#[derive(Args, Debug)]
pub struct VelocityCommand {
    /// 电机（`[channel:]esc`）
    pub motor: String,

    /// 目标速度（rad/s）
    #[arg(allow_hyphen_values = true)]
    pub rad_per_s: f32,

    /// 保持时间（秒），期间周期重发；结束后速度归零。为 0 时只发送一次
    #[arg(long, default_value_t = 0.0)]
    pub hold: f32,

    /// 重发周期（毫秒）
    #[arg(long, default_value_t = 10)]
    pub period_ms: u64,
}

impl VelocityCommand {
    pub fn execute(&self, connect: &ConnectArgs) -> Result<()> {
        let key = connect.motor_key(&self.motor)?;
        let session = Session::open(connect)?;
        let controller = &session.controller;

        // 先走一次带模式与 E-STOP 检查的发送
        controller.set_velocity(&key, self.rad_per_s)?;
        if self.hold <= 0.0 {
            println!("✅ {} -> {:.3} rad/s", key, self.rad_per_s);
            return Ok(());
        }

        session.install_estop_handler()?;
        let channel = controller.channel(&key.channel)?;
        let handle = channel.start_periodic(
            encode_velocity(key.esc_id, self.rad_per_s)?,
            Duration::from_millis(self.period_ms.max(1)),
        )?;
        println!(
            "⏳ {} -> {:.3} rad/s，保持 {:.1}s（Ctrl-C 急停）",
            key, self.rad_per_s, self.hold
        );

        let deadline = Instant::now() + Duration::from_secs_f32(self.hold);
        while Instant::now() < deadline && !session.is_interrupted() {
            std::thread::sleep(Duration::from_millis(20));
        }
        channel.stop_periodic(&handle);
        if session.is_interrupted() {
            println!("🛑 已急停");
            return Ok(());
        }
        controller.set_velocity(&key, 0.0)?;
        println!("✅ {} 已停止", key);
        Ok(())
    }
}

//! ID 分配命令

use crate::commands::ModeArg;
use crate::session::{ConnectArgs, Session, parse_u8};
use anyhow::{Result, bail};
use clap::Args;
use dm_driver::{AssignmentOutcome, AssignmentRequest};

/// ID 分配命令参数
#[derive(Args, Debug)]
pub struct AssignCommand {
    /// 当前电机（`[channel:]esc`，如 can0:1）
    pub motor: String,

    /// 新的 ESC_ID（0..=127，MST_ID 自动取 ESC_ID + 0x10）
    #[arg(value_parser = parse_esc)]
    pub new_esc_id: u8,

    /// 写入的控制模式
    #[arg(short, long, value_enum, default_value = "velocity")]
    pub mode: ModeArg,
}

fn parse_esc(text: &str) -> Result<u8, String> {
    match parse_u8(text) {
        Ok(id) if id <= dm_protocol::MAX_ESC_ID => Ok(id),
        Ok(id) => Err(format!("ESC_ID {} is outside 0..=127", id)),
        Err(e) => Err(e.to_string()),
    }
}

impl AssignCommand {
    pub fn execute(&self, connect: &ConnectArgs) -> Result<()> {
        let key = connect.motor_key(&self.motor)?;
        let session = Session::open(connect)?;
        session.install_estop_handler()?;

        if !session.controller.registry().contains(&key) {
            bail!("电机 {} 未知，请先运行 discover", key);
        }
        let mut discovery = session
            .controller
            .start_discovery(std::slice::from_ref(&key.channel))?;
        let request = AssignmentRequest::new(key.clone(), self.new_esc_id, self.mode.into());
        println!(
            "⏳ {} -> ESC 0x{:02X} / master 0x{:03X} ({})",
            key,
            request.new_esc_id,
            request.new_master_id,
            request.mode
        );

        let results = session.controller.assign_ids(&mut discovery, vec![request])?;
        let outcome = results
            .into_iter()
            .next()
            .map(|r| r.outcome)
            .ok_or_else(|| anyhow::anyhow!("分配没有返回结果"))?;
        // 已写入的身份都要落盘，包括未保存到 Flash 的
        match outcome {
            AssignmentOutcome::Saved(new_key) => {
                println!("✅ {} 已保存", new_key);
                session.persist()?;
            },
            AssignmentOutcome::Unsaved(new_key) => {
                println!("⚠️  {} 已写入但未确认保存，断电后需要重新分配", new_key);
                session.persist()?;
            },
            AssignmentOutcome::Aborted(e) => {
                bail!("分配中止，{} 保持原 ID: {}", key, e);
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_esc_range() {
        assert_eq!(parse_esc("0x7F"), Ok(127));
        assert_eq!(parse_esc("3"), Ok(3));
        assert!(parse_esc("128").is_err());
        assert!(parse_esc("x").is_err());
    }
}

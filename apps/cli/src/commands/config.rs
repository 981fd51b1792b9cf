//! 配置管理命令
//!
//! 查看生效的核心配置与电机记录位置

use crate::session::ConnectArgs;
use anyhow::Result;
use clap::Subcommand;

/// 配置命令
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// 显示生效的配置与已知电机
    Show,

    /// 显示配置文件路径
    Path,
}

impl ConfigCommand {
    pub fn execute(self, connect: &ConnectArgs) -> Result<()> {
        let store = connect.store()?;
        match self {
            ConfigCommand::Show => {
                let config = store.load_config()?;
                println!("# {}", store.config_path().display());
                print!("{}", config.to_toml_string()?);

                let record = store.load_motors()?;
                println!();
                println!("# {}", store.motors_path().display());
                if record.motors.is_empty() {
                    println!("# (no known motors)");
                }
                for motor in &record.motors {
                    println!(
                        "{}  master=0x{:03X}  mode={}{}{}",
                        motor.key(),
                        motor.master_id,
                        motor.mode,
                        motor
                            .name
                            .as_deref()
                            .map(|n| format!("  name={}", n))
                            .unwrap_or_default(),
                        if motor.unsaved { "  (unsaved)" } else { "" }
                    );
                }
            },
            ConfigCommand::Path => {
                println!("{}", store.dir().display());
                println!("  config: {}", store.config_path().display());
                println!("  motors: {}", store.motors_path().display());
            },
        }
        Ok(())
    }
}

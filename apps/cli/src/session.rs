//! 连接会话
//!
//! 读取配置与电机记录，打开 SocketCAN 通道，并在 Ctrl-C 时触发 E-STOP。

use crate::store::Store;
use anyhow::{Context, Result, bail};
use clap::Args;
use dm_driver::{ChannelId, ControllerBuilder, CoreConfig, MotorController, MotorKey};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

/// 通道与配置目录参数（所有命令共用）
#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// CAN 接口，可重复或以逗号分隔（如 can0,can1）
    #[arg(short, long = "channel", global = true, value_delimiter = ',', default_value = "can0")]
    pub channels: Vec<String>,

    /// 配置目录（默认 <config_dir>/dm-motor）
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,
}

impl ConnectArgs {
    pub fn store(&self) -> Result<Store> {
        Store::open(self.config_dir.as_deref())
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.iter().map(|c| ChannelId::new(c.as_str())).collect()
    }

    /// 解析 `[channel:]esc` 形式的电机标识；省略通道时使用第一个通道
    pub fn motor_key(&self, text: &str) -> Result<MotorKey> {
        let default_channel = self.channels.first().map(String::as_str).unwrap_or("can0");
        parse_motor(text, default_channel)
    }
}

/// 解析 `can0:1`、`can0/0x01` 或 `1`
pub fn parse_motor(text: &str, default_channel: &str) -> Result<MotorKey> {
    let (channel, esc) = match text.rsplit_once([':', '/']) {
        Some(("", esc)) => (default_channel, esc),
        Some((channel, esc)) => (channel, esc),
        None => (default_channel, text),
    };
    let esc_id = parse_u8(esc).with_context(|| format!("无效的电机标识: {}", text))?;
    Ok(MotorKey::new(channel, esc_id))
}

pub fn parse_u8(text: &str) -> Result<u8> {
    let text = text.trim();
    let value = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16)?,
        None => text.parse()?,
    };
    Ok(value)
}

/// 已打开的控制器与记录存放位置
pub struct Session {
    pub controller: Arc<MotorController>,
    pub store: Store,
    /// Ctrl-C 后置位
    pub interrupted: Arc<AtomicBool>,
}

impl Session {
    pub fn open(args: &ConnectArgs) -> Result<Self> {
        let store = args.store()?;
        let config = store.load_config()?;
        let record = store.load_motors()?;
        let controller = connect(args, config)?
            .record(record)
            .build()
            .context("打开 CAN 通道失败")?;
        info!(
            "Connected to {} ({} known motor(s))",
            args.channels.join(", "),
            controller.registry().len()
        );
        Ok(Self {
            controller: Arc::new(controller),
            store,
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Ctrl-C 触发 E-STOP 并置位 `interrupted`
    pub fn install_estop_handler(&self) -> Result<()> {
        let controller = self.controller.clone();
        let interrupted = self.interrupted.clone();
        ctrlc::set_handler(move || {
            if interrupted.swap(true, Ordering::SeqCst) {
                return;
            }
            let report = controller.estop();
            if report.is_clean() {
                warn!(
                    "E-STOP: {} schedule(s) stopped, {} motor(s) disabled",
                    report.stopped_schedules,
                    report.disabled.len()
                );
            } else {
                for (key, e) in &report.failures {
                    error!("E-STOP could not disable {}: {}", key, e);
                }
            }
        })
        .context("注册 Ctrl-C 处理失败")
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// 写回电机记录
    pub fn persist(&self) -> Result<()> {
        let record = self.controller.export_record();
        self.store.save_motors(&record)?;
        info!(
            "Saved {} motor(s) to {}",
            record.motors.len(),
            self.store.motors_path().display()
        );
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn connect(args: &ConnectArgs, config: CoreConfig) -> Result<ControllerBuilder> {
    if args.channels.is_empty() {
        bail!("至少需要一个 CAN 接口");
    }
    let mut builder = ControllerBuilder::new().config(config);
    for channel in &args.channels {
        builder = builder.socketcan(channel.as_str());
    }
    Ok(builder)
}

#[cfg(not(target_os = "linux"))]
fn connect(_args: &ConnectArgs, _config: CoreConfig) -> Result<ControllerBuilder> {
    bail!("SocketCAN is only available on Linux")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_motor_forms() {
        assert_eq!(parse_motor("can1:2", "can0").unwrap(), MotorKey::new("can1", 2));
        assert_eq!(parse_motor("can1/0x0A", "can0").unwrap(), MotorKey::new("can1", 10));
        assert_eq!(parse_motor("7", "can0").unwrap(), MotorKey::new("can0", 7));
        assert_eq!(parse_motor(":7", "can2").unwrap(), MotorKey::new("can2", 7));
    }

    #[test]
    fn test_parse_motor_errors() {
        assert!(parse_motor("can0:", "can0").is_err());
        assert!(parse_motor("can0:300", "can0").is_err());
        assert!(parse_motor("wheel", "can0").is_err());
    }

    #[test]
    fn test_parse_u8_hex() {
        assert_eq!(parse_u8("0x7F").unwrap(), 127);
        assert_eq!(parse_u8(" 16 ").unwrap(), 16);
    }
}

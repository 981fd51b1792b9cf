//! 配置与电机记录的存放位置
//!
//! 默认目录为 `<config_dir>/dm-motor/`：
//! - `config.toml`：`CoreConfig`（缺失时使用默认值）
//! - `motors.toml`：已知电机身份（`RegistryRecord`）

use anyhow::{Context, Result};
use dm_driver::{CoreConfig, RegistryRecord};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "dm-motor";
const CONFIG_FILE: &str = "config.toml";
const MOTORS_FILE: &str = "motors.toml";

/// 配置目录
pub fn default_dir() -> Result<PathBuf> {
    let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("无法确定配置目录"))?;
    path.push(APP_DIR);
    Ok(path)
}

#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `dir` 为空时使用默认目录
    pub fn open(dir: Option<&Path>) -> Result<Self> {
        match dir {
            Some(dir) => Ok(Self::new(dir)),
            None => Ok(Self::new(default_dir()?)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    pub fn motors_path(&self) -> PathBuf {
        self.dir.join(MOTORS_FILE)
    }

    pub fn load_config(&self) -> Result<CoreConfig> {
        let path = self.config_path();
        if !path.exists() {
            return Ok(CoreConfig::default());
        }
        CoreConfig::load(&path).with_context(|| format!("读取配置文件失败: {}", path.display()))
    }

    pub fn load_motors(&self) -> Result<RegistryRecord> {
        let path = self.motors_path();
        RegistryRecord::load(&path).with_context(|| format!("读取电机记录失败: {}", path.display()))
    }

    pub fn save_motors(&self, record: &RegistryRecord) -> Result<()> {
        let path = self.motors_path();
        record
            .save(&path)
            .with_context(|| format!("写入电机记录失败: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_driver::MotorRecord;
    use dm_protocol::ControlMode;

    #[test]
    fn test_missing_files_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("nested"));
        assert!(store.load_motors().unwrap().motors.is_empty());
        assert_eq!(
            store.load_config().unwrap().watchdog.threshold_ms,
            CoreConfig::default().watchdog.threshold_ms
        );
    }

    #[test]
    fn test_motors_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("nested"));
        let record = RegistryRecord {
            motors: vec![MotorRecord {
                channel: "can0".into(),
                esc_id: 3,
                master_id: 0x13,
                mode: ControlMode::Velocity,
                name: Some("wheel".into()),
                groups: vec!["base".into()],
                limits: None,
                unsaved: false,
            }],
        };
        store.save_motors(&record).unwrap();
        assert!(store.motors_path().exists());
        assert_eq!(store.load_motors().unwrap(), record);
    }

    #[test]
    fn test_invalid_config_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        std::fs::write(store.config_path(), "[watchdog]\nthreshold_ms = \"soon\"\n").unwrap();
        let err = store.load_config().unwrap_err();
        assert!(format!("{err:#}").contains("config.toml"));
    }
}

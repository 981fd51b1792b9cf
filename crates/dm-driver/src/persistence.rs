//! 注册表持久化记录
//!
//! 只保存身份与元数据（不含实时遥测），用于下次启动时在发现之前预填注册表。

use crate::error::DriverError;
use crate::registry::{ChannelId, MotorKey, Registry};
use dm_protocol::{ControlMode, FeedbackLimits};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// 单个电机的持久化记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorRecord {
    pub channel: ChannelId,
    pub esc_id: u8,
    pub master_id: u16,
    #[serde(default)]
    pub mode: ControlMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    /// 缺省时使用默认映射范围
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<FeedbackLimits>,
    /// ID 已写入但未保存到电机 Flash
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unsaved: bool,
}

impl MotorRecord {
    pub fn key(&self) -> MotorKey {
        MotorKey::new(self.channel.clone(), self.esc_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    #[serde(default)]
    pub motors: Vec<MotorRecord>,
}

impl RegistryRecord {
    pub fn from_toml_str(text: &str) -> Result<Self, DriverError> {
        toml::from_str(text).map_err(|e| DriverError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String, DriverError> {
        toml::to_string_pretty(self).map_err(|e| DriverError::Config(e.to_string()))
    }

    /// 从文件读取；文件不存在时返回空记录
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DriverError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| DriverError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DriverError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DriverError::Config(format!("{}: {}", parent.display(), e)))?;
        }
        std::fs::write(path, self.to_toml_string()?)
            .map_err(|e| DriverError::Config(format!("{}: {}", path.display(), e)))
    }
}

impl Registry {
    /// 导出身份与元数据
    pub fn to_record(&self) -> RegistryRecord {
        let motors = self
            .keys()
            .into_iter()
            .filter_map(|key| {
                self.with_motor(&key, |m| MotorRecord {
                    channel: m.key.channel.clone(),
                    esc_id: m.key.esc_id,
                    master_id: m.master_id,
                    mode: m.mode,
                    name: m.name.clone(),
                    groups: m.groups.iter().cloned().collect(),
                    limits: (m.limits != FeedbackLimits::default()).then_some(m.limits),
                    unsaved: m.unsaved,
                })
                .ok()
            })
            .collect();
        RegistryRecord { motors }
    }

    /// 用记录预填注册表，返回新加入的电机数
    ///
    /// 已存在的身份只更新元数据；MST_ID 冲突时返回错误，之前的记录已生效。
    pub fn load_record(&self, record: &RegistryRecord) -> Result<usize, DriverError> {
        let mut added = 0;
        for motor in &record.motors {
            let key = motor.key();
            if self.insert(key.clone(), motor.master_id)? {
                added += 1;
            }
            self.with_motor(&key, |m| {
                m.mode = motor.mode;
                m.name = motor.name.clone();
                m.groups = motor.groups.iter().cloned().collect();
                m.limits = motor.limits.unwrap_or_default();
                m.unsaved = motor.unsaved;
            })?;
        }
        debug!("Loaded {} motor record(s), {} new", record.motors.len(), added);
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_and_reload() {
        let registry = Registry::new();
        let key = MotorKey::new("can0", 1);
        registry.insert(key.clone(), 0x11).unwrap();
        registry.set_mode(&key, ControlMode::Velocity).unwrap();
        registry
            .set_metadata(&key, Some("left wheel".into()), ["base".to_string()])
            .unwrap();

        let text = registry.to_record().to_toml_string().unwrap();
        assert!(text.contains("left wheel"));
        assert!(!text.contains("telemetry"));

        let restored = Registry::new();
        let record = RegistryRecord::from_toml_str(&text).unwrap();
        assert_eq!(restored.load_record(&record).unwrap(), 1);
        assert_eq!(restored.mode(&key).unwrap(), ControlMode::Velocity);
        assert_eq!(restored.group("base"), vec![key.clone()]);
        assert_eq!(restored.lookup_master(&ChannelId::from("can0"), 0x11), Some(key));
    }

    #[test]
    fn test_minimal_record() {
        let record = RegistryRecord::from_toml_str(
            r#"
            [[motors]]
            channel = "can1"
            esc_id = 2
            master_id = 18
            "#,
        )
        .unwrap();
        let motor = &record.motors[0];
        assert_eq!(motor.mode, ControlMode::Disabled);
        assert!(motor.limits.is_none());
        assert!(!motor.unsaved);
    }

    #[test]
    fn test_conflicting_master_rejected() {
        let registry = Registry::new();
        registry.insert(MotorKey::new("can0", 1), 0x11).unwrap();
        let record = RegistryRecord {
            motors: vec![MotorRecord {
                channel: "can0".into(),
                esc_id: 5,
                master_id: 0x11,
                mode: ControlMode::Velocity,
                name: None,
                groups: Vec::new(),
                limits: None,
                unsaved: false,
            }],
        };
        assert!(registry.load_record(&record).is_err());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let record = RegistryRecord::load("/nonexistent/dm-motor/motors.toml").unwrap();
        assert!(record.motors.is_empty());
    }
}

//! 运行配置
//!
//! POD 配置结构，时长统一使用 `*_ms` 整数字段，便于 TOML 序列化。
//! 所有字段都有默认值，配置文件只需写出需要覆盖的部分。

use crate::error::DriverError;
use dm_protocol::MAX_ESC_ID;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CoreConfig {
    pub channel: ChannelConfig,
    pub watchdog: WatchdogConfig,
    pub discovery: DiscoveryConfig,
}

/// 通道配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// 适配器读超时（RX 线程检查退出标志的周期）
    pub receive_timeout_ms: u64,
    /// 每个接收订阅者的缓冲帧数，超出后丢帧并计数
    pub stream_capacity: usize,
    /// 事件订阅者缓冲
    pub event_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            receive_timeout_ms: 2,
            stream_capacity: 512,
            event_capacity: 256,
        }
    }
}

/// 看门狗配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    /// 扫描周期
    pub interval_ms: u64,
    /// 超过该时长无反馈视为失联
    pub threshold_ms: u64,
    /// 同一电机两次失能之间的最短间隔
    pub cooldown_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 50,
            threshold_ms: 500,
            cooldown_ms: 1000,
        }
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_millis(self.threshold_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// 发现流程配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// 被动监听时长
    pub passive_duration_ms: u64,
    /// 主动探测的 ESC_ID 范围（闭区间）
    pub probe_first: u8,
    pub probe_last: u8,
    /// 每个探测的反馈等待时间
    pub probe_timeout_ms: u64,
    /// RID 读写应答等待时间
    pub rid_timeout_ms: u64,
    /// 保存命令是否需要应答才算成功
    pub require_save_ack: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            passive_duration_ms: 1000,
            probe_first: 1,
            probe_last: 16,
            probe_timeout_ms: 50,
            rid_timeout_ms: 500,
            require_save_ack: true,
        }
    }
}

impl DiscoveryConfig {
    pub fn passive_duration(&self) -> Duration {
        Duration::from_millis(self.passive_duration_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn rid_timeout(&self) -> Duration {
        Duration::from_millis(self.rid_timeout_ms)
    }
}

impl CoreConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, DriverError> {
        let config: CoreConfig =
            toml::from_str(text).map_err(|e| DriverError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, DriverError> {
        toml::to_string_pretty(self).map_err(|e| DriverError::Config(e.to_string()))
    }

    /// 从文件加载；文件不存在时返回默认配置
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DriverError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| DriverError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), DriverError> {
        let fail = |msg: &str| Err(DriverError::Config(msg.to_string()));
        if self.channel.stream_capacity == 0 {
            return fail("channel.stream_capacity must be > 0");
        }
        if self.channel.receive_timeout_ms == 0 {
            return fail("channel.receive_timeout_ms must be > 0");
        }
        if self.watchdog.interval_ms == 0 || self.watchdog.threshold_ms == 0 {
            return fail("watchdog.interval_ms and watchdog.threshold_ms must be > 0");
        }
        let d = &self.discovery;
        if d.probe_first > d.probe_last || d.probe_last > MAX_ESC_ID {
            return fail("discovery probe range must satisfy probe_first <= probe_last <= 127");
        }
        if d.rid_timeout_ms == 0 || d.probe_timeout_ms == 0 {
            return fail("discovery timeouts must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.watchdog.threshold(), Duration::from_millis(500));
        assert_eq!(config.discovery.probe_first, 1);
        assert_eq!(config.discovery.probe_last, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CoreConfig::from_toml_str(
            r#"
            [watchdog]
            threshold_ms = 200

            [discovery]
            probe_last = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.watchdog.threshold_ms, 200);
        assert_eq!(config.watchdog.cooldown_ms, 1000);
        assert_eq!(config.discovery.probe_last, 8);
        assert_eq!(config.channel.stream_capacity, 512);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = CoreConfig::from_toml_str("[discovery]\nprobe_first = 20\nprobe_last = 10\n")
            .unwrap_err();
        assert!(matches!(err, DriverError::Config(_)));

        assert!(CoreConfig::from_toml_str("[channel]\nstream_capacity = 0\n").is_err());
        assert!(CoreConfig::from_toml_str("[watchdog]\ninterval_ms = \"fast\"\n").is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = CoreConfig::default();
        config.watchdog.enabled = false;
        let text = config.to_toml_string().unwrap();
        assert_eq!(CoreConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = CoreConfig::load("/nonexistent/dm-motor/config.toml").unwrap();
        assert_eq!(config, CoreConfig::default());
    }
}

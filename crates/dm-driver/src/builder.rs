//! Builder 模式实现
//!
//! 链式构造 [`MotorController`]：先登记所有通道（接口已由外部配置好），
//! 再一次性打开并为每个通道挂上注册表反馈回调。
//!
//! # Example
//!
//! ```no_run
//! use dm_driver::{ControllerBuilder, CoreConfig};
//!
//! let controller = ControllerBuilder::new()
//!     .config(CoreConfig::default())
//!     .socketcan("can0")
//!     .build()
//!     .unwrap();
//! ```

use crate::channel::{Channel, ChannelMap};
use crate::config::{ChannelConfig, CoreConfig};
use crate::controller::MotorController;
use crate::error::DriverError;
use crate::hooks::RegistryFeedbackHook;
use crate::persistence::RegistryRecord;
use crate::registry::{ChannelId, Registry};
use dm_can::SplittableAdapter;
use std::sync::Arc;
use tracing::info;

type ChannelOpener = Box<dyn FnOnce(ChannelId, &ChannelConfig) -> Result<Channel, DriverError>>;

/// 控制器 Builder
#[derive(Default)]
pub struct ControllerBuilder {
    config: CoreConfig,
    record: Option<RegistryRecord>,
    channels: Vec<(ChannelId, ChannelOpener)>,
}

impl ControllerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    /// 启动时预填的电机身份
    pub fn record(mut self, record: RegistryRecord) -> Self {
        self.record = Some(record);
        self
    }

    /// 使用任意已打开的适配器
    pub fn adapter<A>(mut self, id: impl Into<ChannelId>, adapter: A) -> Self
    where
        A: SplittableAdapter + 'static,
    {
        self.channels.push((
            id.into(),
            Box::new(move |id: ChannelId, config: &ChannelConfig| {
                Channel::open(id, adapter, config)
            }),
        ));
        self
    }

    /// SocketCAN 接口（接收所有帧）
    #[cfg(target_os = "linux")]
    pub fn socketcan(self, interface: impl Into<String>) -> Self {
        self.socketcan_filtered(interface, &[])
    }

    /// SocketCAN 接口，仅接收给定 MST_ID 与 0x7FF
    ///
    /// `master_ids` 为空时不设过滤；发现流程需要看到所有反馈，不应使用过滤。
    #[cfg(target_os = "linux")]
    pub fn socketcan_filtered(mut self, interface: impl Into<String>, master_ids: &[u16]) -> Self {
        let interface = interface.into();
        let master_ids = master_ids.to_vec();
        self.channels.push((
            ChannelId::new(interface.clone()),
            Box::new(move |id: ChannelId, config: &ChannelConfig| {
                let mut adapter = dm_can::SocketCanAdapter::new(interface)?;
                if !master_ids.is_empty() {
                    adapter = adapter.with_feedback_filters(&master_ids)?;
                }
                Channel::open(id, adapter, config)
            }),
        ));
        self
    }

    pub fn build(self) -> Result<MotorController, DriverError> {
        self.config.validate()?;
        if self.channels.is_empty() {
            return Err(DriverError::InvalidInput("at least one channel is required".into()));
        }

        let registry = Arc::new(Registry::new());
        if let Some(record) = &self.record {
            registry.load_record(record)?;
        }

        let mut channels = ChannelMap::new();
        for (id, open) in self.channels {
            if channels.contains_key(&id) {
                return Err(DriverError::InvalidInput(format!("channel {} added twice", id)));
            }
            let channel = open(id.clone(), &self.config.channel)?;
            channel.add_callback(Arc::new(RegistryFeedbackHook::new(
                id.clone(),
                registry.clone(),
                channel.metrics(),
            )));
            channels.insert(id, Arc::new(channel));
        }

        info!(
            "Controller ready: {} channel(s), {} known motor(s)",
            channels.len(),
            registry.len()
        );
        Ok(MotorController::new(self.config, registry, channels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_can::MockBus;

    #[test]
    fn test_build_requires_channel() {
        assert!(matches!(
            ControllerBuilder::new().build(),
            Err(DriverError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let bus = MockBus::new();
        let result = ControllerBuilder::new()
            .adapter("can0", bus.adapter())
            .adapter("can0", bus.adapter())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = CoreConfig::default();
        config.channel.stream_capacity = 0;
        let result = ControllerBuilder::new()
            .config(config)
            .adapter("can0", MockBus::new().adapter())
            .build();
        assert!(matches!(result, Err(DriverError::Config(_))));
    }
}

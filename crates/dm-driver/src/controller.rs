//! 电机控制器（对外 API）
//!
//! 持有进程内唯一的注册表、所有通道、E-STOP 与编排调度器。
//! 调用方只使用 [`MotorKey`]，所有状态修改都经由注册表完成。

use crate::channel::{Channel, ChannelMap};
use crate::config::CoreConfig;
use crate::discovery::{AssignmentRequest, AssignmentResult, DiscoverySession};
use crate::error::DriverError;
use crate::estop::{EStop, EStopRegistration, EStopReport};
use crate::events::{CoreEvent, EventBus};
use crate::management;
use crate::persistence::RegistryRecord;
use crate::registry::{ChannelId, MotorKey, MotorSnapshot, Registry};
use crate::scheduler::{Choreography, ChoreographyHandle, ScheduleParams, Scheduler};
use crate::watchdog::{Watchdog, WatchdogHandle};
use crossbeam_channel::Receiver;
use dm_protocol::{
    ControlMode, FeedbackLimits, MitCommand, Rid, encode_disable, encode_enable,
    encode_position_velocity, encode_velocity, encode_zero,
};
use std::sync::Arc;
use tracing::{debug, info};

/// MIT 目标（物理单位）
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MitTarget {
    pub position: f32,
    pub velocity: f32,
    pub kp: f32,
    pub kd: f32,
    pub torque: f32,
}

/// 电机控制器
///
/// 通过 [`ControllerBuilder`](crate::ControllerBuilder) 创建。
pub struct MotorController {
    config: CoreConfig,
    registry: Arc<Registry>,
    channels: Arc<ChannelMap>,
    events: Arc<EventBus>,
    estop: Arc<EStop>,
    scheduler: Scheduler,
}

impl MotorController {
    pub(crate) fn new(config: CoreConfig, registry: Arc<Registry>, channels: ChannelMap) -> Self {
        let channels = Arc::new(channels);
        let events = Arc::new(EventBus::new(config.channel.event_capacity));
        let estop = Arc::new(EStop::new(registry.clone(), channels.clone(), events.clone()));
        let scheduler = Scheduler::new(registry.clone(), channels.clone(), estop.clone(), events.clone());
        Self {
            config,
            registry,
            channels,
            events,
            estop,
            scheduler,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn channel(&self, id: &ChannelId) -> Result<&Arc<Channel>, DriverError> {
        self.channels
            .get(id)
            .ok_or_else(|| DriverError::UnknownChannel(id.clone()))
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.keys().cloned().collect()
    }

    /// 已注册电机所在的通道
    fn target(&self, key: &MotorKey) -> Result<&Arc<Channel>, DriverError> {
        if !self.registry.contains(key) {
            return Err(DriverError::UnknownMotor(key.clone()));
        }
        self.channel(&key.channel)
    }

    fn require_mode(&self, key: &MotorKey, required: ControlMode) -> Result<(), DriverError> {
        let actual = self.registry.mode(key)?;
        if actual != required {
            return Err(DriverError::ModePrecondition {
                key: key.clone(),
                required,
                actual,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // 运动命令
    // ------------------------------------------------------------------

    pub fn enable(&self, key: &MotorKey) -> Result<(), DriverError> {
        self.registry.ensure_not_estopped()?;
        self.target(key)?.send(encode_enable(key.esc_id)?)?;
        self.registry.set_enabled(key, true)?;
        debug!("Enabled {}", key);
        Ok(())
    }

    /// 失能（E-STOP 锁存时同样允许）
    pub fn disable(&self, key: &MotorKey) -> Result<(), DriverError> {
        self.target(key)?.send(encode_disable(key.esc_id)?)?;
        self.registry.set_enabled(key, false)?;
        debug!("Disabled {}", key);
        Ok(())
    }

    /// 将当前位置设为零点
    pub fn zero(&self, key: &MotorKey) -> Result<(), DriverError> {
        self.target(key)?.send(encode_zero(key.esc_id)?)
    }

    pub fn set_velocity(&self, key: &MotorKey, rad_per_s: f32) -> Result<(), DriverError> {
        self.registry.ensure_not_estopped()?;
        let channel = self.target(key)?;
        self.require_mode(key, ControlMode::Velocity)?;
        channel.send(encode_velocity(key.esc_id, rad_per_s)?)
    }

    pub fn set_position_velocity(&self, key: &MotorKey, position: f32, velocity: f32) -> Result<(), DriverError> {
        self.registry.ensure_not_estopped()?;
        let channel = self.target(key)?;
        self.require_mode(key, ControlMode::PositionVelocity)?;
        channel.send(encode_position_velocity(key.esc_id, position, velocity)?)
    }

    /// 超出电机 MIT 范围的目标直接拒绝，不做截断
    pub fn set_mit_target(&self, key: &MotorKey, target: MitTarget) -> Result<(), DriverError> {
        self.registry.ensure_not_estopped()?;
        let channel = self.target(key)?;
        self.require_mode(key, ControlMode::Mit)?;
        let limits = self.registry.mit_limits(key)?;
        let frame = MitCommand::new(
            key.esc_id,
            target.position,
            target.velocity,
            target.kp,
            target.kd,
            target.torque,
        )
        .to_frame(&limits)?;
        channel.send(frame)
    }

    // ------------------------------------------------------------------
    // 参数访问
    // ------------------------------------------------------------------

    /// 写 CTRL_MODE 并在确认后更新注册表
    pub fn set_mode(&self, key: &MotorKey, mode: ControlMode) -> Result<(), DriverError> {
        let value = mode
            .register_value()
            .ok_or_else(|| DriverError::InvalidInput(format!("{} mode cannot be written", mode)))?;
        let channel = self.target(key)?;
        management::write_rid(
            channel,
            key.esc_id,
            Rid::ControlMode,
            value,
            self.config.discovery.rid_timeout(),
        )?;
        self.registry.set_mode(key, mode)?;
        info!("{} switched to {} mode", key, mode);
        Ok(())
    }

    pub fn read_rid(&self, key: &MotorKey, rid: Rid) -> Result<u32, DriverError> {
        management::read_rid(self.target(key)?, key.esc_id, rid, self.config.discovery.rid_timeout())
    }

    pub fn read_rid_f32(&self, key: &MotorKey, rid: Rid) -> Result<f32, DriverError> {
        management::read_rid_f32(self.target(key)?, key.esc_id, rid, self.config.discovery.rid_timeout())
    }

    /// 读取 CTRL_MODE 并写入注册表
    pub fn refresh_mode(&self, key: &MotorKey) -> Result<ControlMode, DriverError> {
        let mode = ControlMode::from_register(self.read_rid(key, Rid::ControlMode)?)?;
        self.registry.set_mode(key, mode)?;
        Ok(mode)
    }

    /// 读取 PMAX / VMAX / TMAX 并写入注册表
    pub fn refresh_limits(&self, key: &MotorKey) -> Result<FeedbackLimits, DriverError> {
        let limits = FeedbackLimits {
            p_max: self.read_rid_f32(key, Rid::PMax)?,
            v_max: self.read_rid_f32(key, Rid::VMax)?,
            t_max: self.read_rid_f32(key, Rid::TMax)?,
        };
        if [limits.p_max, limits.v_max, limits.t_max]
            .iter()
            .any(|v| !v.is_finite() || *v <= 0.0)
        {
            return Err(DriverError::InvalidInput(format!(
                "motor {} reported unusable limits {:?}",
                key, limits
            )));
        }
        self.registry.set_limits(key, limits)?;
        Ok(limits)
    }

    /// 保存参数到电机 Flash；成功后清除未保存标记
    pub fn save_params(&self, key: &MotorKey) -> Result<(), DriverError> {
        management::save(self.target(key)?, key.esc_id, self.config.discovery.rid_timeout())?;
        self.registry.with_motor(key, |m| m.unsaved = false)?;
        info!("Parameters of {} saved", key);
        Ok(())
    }

    pub fn refresh_params(&self, key: &MotorKey) -> Result<(), DriverError> {
        management::refresh(self.target(key)?, key.esc_id)
    }

    // ------------------------------------------------------------------
    // 发现
    // ------------------------------------------------------------------

    /// 在给定通道上开始一次发现
    ///
    /// 会话登记到 E-STOP：急停会中止进行中的发现与 ID 写入，锁存期间不能开始
    pub fn start_discovery(&self, channel_ids: &[ChannelId]) -> Result<DiscoverySession, DriverError> {
        let channels = channel_ids
            .iter()
            .map(|id| self.channel(id).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        let mut session = DiscoverySession::new(
            channels,
            self.registry.clone(),
            self.events.clone(),
            self.config.discovery.clone(),
        )?;
        let registration = EStopRegistration::new(self.estop.clone(), session.cancel_token())?;
        session.attach_estop(registration);
        Ok(session)
    }

    pub fn assign_ids(
        &self,
        session: &mut DiscoverySession,
        requests: Vec<AssignmentRequest>,
    ) -> Result<Vec<AssignmentResult>, DriverError> {
        session.assign(requests)
    }

    // ------------------------------------------------------------------
    // 安全
    // ------------------------------------------------------------------

    pub fn estop(&self) -> EStopReport {
        self.estop.engage()
    }

    pub fn clear_estop(&self) -> bool {
        self.estop.clear()
    }

    pub fn estop_latched(&self) -> bool {
        self.estop.is_latched()
    }

    pub fn watchdog(&self) -> Watchdog {
        Watchdog::new(
            self.registry.clone(),
            self.channels.clone(),
            self.events.clone(),
            self.config.watchdog.clone(),
        )
    }

    /// 按配置启动后台看门狗；配置关闭时返回 `None`
    pub fn spawn_watchdog(&self) -> Option<WatchdogHandle> {
        self.config.watchdog.enabled.then(|| self.watchdog().spawn())
    }

    // ------------------------------------------------------------------
    // 编排
    // ------------------------------------------------------------------

    pub fn start_choreography(
        &self,
        choreography: Choreography,
        group: &[MotorKey],
        params: ScheduleParams,
    ) -> Result<ChoreographyHandle, DriverError> {
        self.scheduler.start(choreography, group, params)
    }

    pub fn stop_choreography(&self, handle: &ChoreographyHandle) -> bool {
        self.scheduler.stop(handle)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // ------------------------------------------------------------------
    // 观察与持久化
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> Vec<MotorSnapshot> {
        self.registry.snapshot()
    }

    pub fn snapshot_motor(&self, key: &MotorKey) -> Result<MotorSnapshot, DriverError> {
        self.registry.snapshot_motor(key)
    }

    pub fn subscribe_events(&self) -> Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn export_record(&self) -> RegistryRecord {
        self.registry.to_record()
    }

    pub fn import_record(&self, record: &RegistryRecord) -> Result<usize, DriverError> {
        self.registry.load_record(record)
    }

    /// 停止所有编排并关闭所有通道
    pub fn close(&self) {
        self.scheduler.stop_all();
        for channel in self.channels.values() {
            channel.close();
        }
        debug!("Controller closed");
    }
}

impl Drop for MotorController {
    fn drop(&mut self) {
        self.close();
    }
}

//! 电机注册表
//!
//! 进程内唯一的电机状态所有者。其他组件只持有 [`MotorKey`]，
//! 所有修改都经由注册表方法完成：
//!
//! - 外层索引使用 `RwLock`，只在增删电机或改 ID 时写锁
//! - 每个电机一个 `Mutex`，不同电机可并发更新
//! - E-STOP 锁存是一个原子标志
//!
//! 反馈帧在 RX 线程中通过 [`Registry::record_feedback`] 写入，
//! 只持有锁数微秒，不会阻塞接收路径。

use crate::error::DriverError;
use dm_protocol::{
    ControlMode, DmFrame, FaultKind, FeedbackLimits, MitLimits, MotorStatus, decode_feedback,
    validate_esc_id,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// 通道标识（接口名，如 `can0`）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ChannelId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// 电机身份键：通道 + ESC_ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MotorKey {
    pub channel: ChannelId,
    pub esc_id: u8,
}

impl MotorKey {
    pub fn new(channel: impl Into<ChannelId>, esc_id: u8) -> Self {
        Self {
            channel: channel.into(),
            esc_id,
        }
    }
}

impl fmt::Display for MotorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/0x{:02X}", self.channel, self.esc_id)
    }
}

/// 最近一次反馈（物理单位）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Telemetry {
    pub status: MotorStatus,
    pub position: f32,
    pub velocity: f32,
    pub torque: f32,
    pub temp_mos: u8,
    pub temp_rotor: u8,
}

/// 看门狗记录（生命周期与电机一致）
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WatchdogRecord {
    pub(crate) last_intervention: Option<Instant>,
}

/// 单个电机的状态，仅注册表可见
#[derive(Debug, Clone)]
pub(crate) struct Motor {
    pub(crate) key: MotorKey,
    pub(crate) master_id: u16,
    pub(crate) mode: ControlMode,
    pub(crate) telemetry: Option<Telemetry>,
    pub(crate) last_feedback: Option<Instant>,
    pub(crate) enabled: bool,
    pub(crate) latched_at: Option<Instant>,
    pub(crate) name: Option<String>,
    pub(crate) groups: BTreeSet<String>,
    pub(crate) limits: FeedbackLimits,
    pub(crate) mit_limits: MitLimits,
    pub(crate) watchdog: WatchdogRecord,
    pub(crate) unsaved: bool,
}

impl Motor {
    pub(crate) fn new(key: MotorKey, master_id: u16) -> Self {
        Self {
            key,
            master_id,
            mode: ControlMode::Disabled,
            telemetry: None,
            last_feedback: None,
            enabled: false,
            latched_at: None,
            name: None,
            groups: BTreeSet::new(),
            limits: FeedbackLimits::default(),
            mit_limits: MitLimits::default(),
            watchdog: WatchdogRecord::default(),
            unsaved: false,
        }
    }

    fn set_enabled(&mut self, enabled: bool, now: Instant) {
        if enabled && !self.enabled {
            self.latched_at = Some(now);
        }
        self.enabled = enabled;
    }

    /// 最近一次活动：反馈时间与使能时间取较晚者
    pub(crate) fn last_activity(&self) -> Option<Instant> {
        match (self.last_feedback, self.latched_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    fn snapshot(&self, now: Instant) -> MotorSnapshot {
        let intervened = match (self.watchdog.last_intervention, self.last_feedback) {
            (Some(intervention), Some(feedback)) => intervention >= feedback,
            (Some(_), None) => true,
            (None, _) => false,
        };
        MotorSnapshot {
            key: self.key.clone(),
            master_id: self.master_id,
            mode: self.mode,
            enabled: self.enabled,
            telemetry: self.telemetry,
            fault: self.telemetry.and_then(|t| t.status.fault()),
            last_seen: self.last_feedback.map(|t| now.saturating_duration_since(t)),
            watchdog_intervened: intervened,
            name: self.name.clone(),
            groups: self.groups.iter().cloned().collect(),
            limits: self.limits,
            unsaved: self.unsaved,
        }
    }
}

/// 只读快照（供 UI / 日志使用）
#[derive(Debug, Clone, PartialEq)]
pub struct MotorSnapshot {
    pub key: MotorKey,
    pub master_id: u16,
    pub mode: ControlMode,
    pub enabled: bool,
    pub telemetry: Option<Telemetry>,
    pub fault: Option<FaultKind>,
    /// 距最近一次反馈的时间
    pub last_seen: Option<Duration>,
    /// 看门狗在最近一次反馈之后介入过
    pub watchdog_intervened: bool,
    pub name: Option<String>,
    pub groups: Vec<String>,
    pub limits: FeedbackLimits,
    pub unsaved: bool,
}

type MotorCell = Arc<Mutex<Motor>>;

#[derive(Default)]
struct Index {
    motors: BTreeMap<MotorKey, MotorCell>,
    by_master: HashMap<(ChannelId, u16), MotorKey>,
}

/// 电机注册表
#[derive(Default)]
pub struct Registry {
    index: RwLock<Index>,
    estop: AtomicBool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, key: &MotorKey) -> Result<MotorCell, DriverError> {
        self.index
            .read()
            .motors
            .get(key)
            .cloned()
            .ok_or_else(|| DriverError::UnknownMotor(key.clone()))
    }

    /// 在单个电机的锁内执行闭包
    pub(crate) fn with_motor<R>(
        &self,
        key: &MotorKey,
        f: impl FnOnce(&mut Motor) -> R,
    ) -> Result<R, DriverError> {
        let cell = self.cell(key)?;
        let mut motor = cell.lock();
        Ok(f(&mut motor))
    }

    /// 注册电机；已存在相同身份时返回 `false`
    pub fn insert(&self, key: MotorKey, master_id: u16) -> Result<bool, DriverError> {
        validate_esc_id(key.esc_id)?;
        let mut index = self.index.write();
        if index.motors.contains_key(&key) {
            return Ok(false);
        }
        let master_key = (key.channel.clone(), master_id);
        if let Some(existing) = index.by_master.get(&master_key) {
            return Err(DriverError::InvalidInput(format!(
                "master id 0x{:03X} on {} already belongs to {}",
                master_id, key.channel, existing
            )));
        }
        index.by_master.insert(master_key, key.clone());
        index
            .motors
            .insert(key.clone(), Arc::new(Mutex::new(Motor::new(key.clone(), master_id))));
        debug!("Registered motor {} (master 0x{:03X})", key, master_id);
        Ok(true)
    }

    pub fn remove(&self, key: &MotorKey) -> bool {
        let mut index = self.index.write();
        match index.motors.remove(key) {
            Some(cell) => {
                let master_id = cell.lock().master_id;
                index.by_master.remove(&(key.channel.clone(), master_id));
                true
            },
            None => false,
        }
    }

    pub fn contains(&self, key: &MotorKey) -> bool {
        self.index.read().motors.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.index.read().motors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 按 MST_ID 查找
    pub fn lookup_master(&self, channel: &ChannelId, master_id: u16) -> Option<MotorKey> {
        self.index
            .read()
            .by_master
            .get(&(channel.clone(), master_id))
            .cloned()
    }

    pub fn keys(&self) -> Vec<MotorKey> {
        self.index.read().motors.keys().cloned().collect()
    }

    pub fn keys_on(&self, channel: &ChannelId) -> Vec<MotorKey> {
        self.index
            .read()
            .motors
            .keys()
            .filter(|k| &k.channel == channel)
            .cloned()
            .collect()
    }

    /// 属于某个分组的电机
    pub fn group(&self, name: &str) -> Vec<MotorKey> {
        let cells: Vec<MotorCell> = self.index.read().motors.values().cloned().collect();
        cells
            .iter()
            .filter_map(|cell| {
                let motor = cell.lock();
                motor.groups.contains(name).then(|| motor.key.clone())
            })
            .collect()
    }

    /// 解码反馈帧并更新对应电机
    ///
    /// 未注册的 MST_ID 返回 `Ok(None)`。
    pub fn record_feedback(
        &self,
        channel: &ChannelId,
        frame: &DmFrame,
        now: Instant,
    ) -> Result<Option<MotorKey>, DriverError> {
        let Some(key) = self.lookup_master(channel, frame.id) else {
            return Ok(None);
        };
        let cell = self.cell(&key)?;
        let mut motor = cell.lock();
        let feedback = decode_feedback(frame, &motor.limits)?;
        motor.telemetry = Some(Telemetry {
            status: feedback.status,
            position: feedback.position,
            velocity: feedback.velocity,
            torque: feedback.torque,
            temp_mos: feedback.temp_mos,
            temp_rotor: feedback.temp_rotor,
        });
        motor.last_feedback = Some(now);
        match feedback.status {
            MotorStatus::Enabled => motor.set_enabled(true, now),
            MotorStatus::Disabled => motor.set_enabled(false, now),
            _ => {},
        }
        trace!("Feedback from {}: {:?}", key, feedback.status);
        Ok(Some(key))
    }

    pub fn mode(&self, key: &MotorKey) -> Result<ControlMode, DriverError> {
        self.with_motor(key, |m| m.mode)
    }

    pub fn set_mode(&self, key: &MotorKey, mode: ControlMode) -> Result<(), DriverError> {
        self.with_motor(key, |m| m.mode = mode)
    }

    pub fn master_id(&self, key: &MotorKey) -> Result<u16, DriverError> {
        self.with_motor(key, |m| m.master_id)
    }

    pub fn is_enabled(&self, key: &MotorKey) -> Result<bool, DriverError> {
        self.with_motor(key, |m| m.enabled)
    }

    pub fn set_enabled(&self, key: &MotorKey, enabled: bool) -> Result<(), DriverError> {
        let now = Instant::now();
        self.with_motor(key, |m| m.set_enabled(enabled, now))
    }

    /// 当前锁存为使能的电机
    pub fn enabled_motors(&self) -> Vec<MotorKey> {
        let cells: Vec<MotorCell> = self.index.read().motors.values().cloned().collect();
        cells
            .iter()
            .filter_map(|cell| {
                let motor = cell.lock();
                motor.enabled.then(|| motor.key.clone())
            })
            .collect()
    }

    pub fn limits(&self, key: &MotorKey) -> Result<FeedbackLimits, DriverError> {
        self.with_motor(key, |m| m.limits)
    }

    pub fn set_limits(&self, key: &MotorKey, limits: FeedbackLimits) -> Result<(), DriverError> {
        self.with_motor(key, |m| m.limits = limits)
    }

    pub fn mit_limits(&self, key: &MotorKey) -> Result<MitLimits, DriverError> {
        self.with_motor(key, |m| m.mit_limits)
    }

    pub fn set_mit_limits(&self, key: &MotorKey, limits: MitLimits) -> Result<(), DriverError> {
        self.with_motor(key, |m| m.mit_limits = limits)
    }

    /// 设置显示名称与分组
    pub fn set_metadata(
        &self,
        key: &MotorKey,
        name: Option<String>,
        groups: impl IntoIterator<Item = String>,
    ) -> Result<(), DriverError> {
        let groups: BTreeSet<String> = groups.into_iter().collect();
        self.with_motor(key, |m| {
            m.name = name;
            m.groups = groups;
        })
    }

    pub fn is_unsaved(&self, key: &MotorKey) -> Result<bool, DriverError> {
        self.with_motor(key, |m| m.unsaved)
    }

    /// ID 分配成功后更新身份
    ///
    /// 新身份已被其他电机占用时返回错误，原身份保持不变。
    pub fn reassign(
        &self,
        key: &MotorKey,
        new_esc_id: u8,
        new_master_id: u16,
        mode: ControlMode,
        unsaved: bool,
    ) -> Result<MotorKey, DriverError> {
        validate_esc_id(new_esc_id)?;
        let new_key = MotorKey::new(key.channel.clone(), new_esc_id);
        let mut index = self.index.write();
        let cell = index
            .motors
            .get(key)
            .cloned()
            .ok_or_else(|| DriverError::UnknownMotor(key.clone()))?;
        if &new_key != key && index.motors.contains_key(&new_key) {
            return Err(DriverError::InvalidInput(format!(
                "{} is already registered",
                new_key
            )));
        }
        let new_master = (key.channel.clone(), new_master_id);
        if let Some(owner) = index.by_master.get(&new_master)
            && owner != key
        {
            return Err(DriverError::InvalidInput(format!(
                "master id 0x{:03X} already belongs to {}",
                new_master_id, owner
            )));
        }

        let mut motor = cell.lock();
        index.by_master.remove(&(key.channel.clone(), motor.master_id));
        index.motors.remove(key);
        motor.key = new_key.clone();
        motor.master_id = new_master_id;
        motor.mode = mode;
        motor.unsaved = unsaved;
        drop(motor);
        index.by_master.insert(new_master, new_key.clone());
        index.motors.insert(new_key.clone(), cell);
        info!(
            "Motor {} reassigned to {} (master 0x{:03X}, {} mode{})",
            key,
            new_key,
            new_master_id,
            mode,
            if unsaved { ", unsaved" } else { "" }
        );
        Ok(new_key)
    }

    pub fn snapshot(&self) -> Vec<MotorSnapshot> {
        let now = Instant::now();
        let cells: Vec<MotorCell> = self.index.read().motors.values().cloned().collect();
        cells.iter().map(|cell| cell.lock().snapshot(now)).collect()
    }

    pub fn snapshot_motor(&self, key: &MotorKey) -> Result<MotorSnapshot, DriverError> {
        let now = Instant::now();
        self.with_motor(key, |m| m.snapshot(now))
    }

    // ------------------------------------------------------------------
    // E-STOP 锁存
    // ------------------------------------------------------------------

    pub fn estop_latched(&self) -> bool {
        self.estop.load(Ordering::Acquire)
    }

    /// 锁存 E-STOP，返回之前是否已锁存
    pub(crate) fn latch_estop(&self) -> bool {
        self.estop.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn release_estop(&self) -> bool {
        self.estop.swap(false, Ordering::AcqRel)
    }

    /// E-STOP 锁存时拒绝运动类命令
    pub fn ensure_not_estopped(&self) -> Result<(), DriverError> {
        if self.estop_latched() {
            return Err(DriverError::EStopLatched);
        }
        Ok(())
    }
}

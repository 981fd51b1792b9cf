//! 电机发现与 ID 分配状态机
//!
//! 一次发现运行对应一个 [`DiscoverySession`]：
//!
//! ```text
//! Idle → PassiveListen → ActiveProbe → Assigning → Saving → {Complete, Aborted}
//! ```
//!
//! - **PassiveListen**：在限定时间内监听反馈帧，按 `master_id = esc_id + 0x10`
//!   推断 ESC_ID；无法确定的帧留作待定，重复的硬件 ID 作为冲突上报，不写入注册表。
//! - **ActiveProbe**：对范围内尚未发现的 ESC_ID 发送 0 rad/s 速度帧并等待反馈。
//!   这是唯一不经操作员确认就会向电机发命令的阶段，只允许发送不产生运动的帧。
//! - **Assigning / Saving**：依次写 ESC_ID、MST_ID、CTRL_MODE 并逐个等待回显，
//!   然后保存到电机 Flash。任一写入未确认即中止该电机，注册表中的原 ID 不变。
//!
//! 会话在 [`DiscoverySession::finish`] 时被消耗，不支持中途恢复。

use crate::channel::{Channel, FrameStream};
use crate::config::DiscoveryConfig;
use crate::error::{AssignmentError, DriverError};
use crate::estop::EStopRegistration;
use crate::events::{CoreEvent, EventBus};
use crate::management;
use crate::registry::{ChannelId, MotorKey, Registry};
use arc_swap::ArcSwap;
use crossbeam_channel::Select;
use dm_protocol::{
    ControlMode, DmFrame, FeedbackLimits, ID_MANAGEMENT, ID_POS_VEL_BASE, MotorStatus, Rid,
    decode_feedback, encode_disable, encode_rid_save, encode_velocity, esc_id_from_master,
    master_id_for, validate_esc_id,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 取消检查间隔
const CANCEL_POLL: Duration = Duration::from_millis(20);

/// 状态机阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryPhase {
    Idle,
    PassiveListen,
    ActiveProbe,
    Assigning,
    Saving,
    Complete,
    Aborted,
}

impl DiscoveryPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, DiscoveryPhase::Complete | DiscoveryPhase::Aborted)
    }
}

/// 会话中止原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// 操作员取消
    Cancelled,
    /// 不可恢复的总线错误
    BusFailure(String),
    /// E-STOP 锁存
    EStop,
    /// 存在未保存或失败的分配
    AssignmentsIncomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySource {
    Passive,
    Probe,
}

/// 新发现并写入注册表的电机
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredMotor {
    pub key: MotorKey,
    pub master_id: u16,
    pub status: MotorStatus,
    pub source: DiscoverySource,
}

/// 无法确定 ESC_ID 的反馈
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFeedback {
    pub channel: ChannelId,
    pub master_id: u16,
    /// 反馈帧 byte0 低 4 位
    pub esc_nibble: u8,
}

/// 重复的硬件 ID，需要操作员处理
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConflict {
    pub channel: ChannelId,
    pub esc_id: u8,
    /// 映射到该 ESC_ID 的所有 MST_ID（含已注册的）
    pub master_ids: Vec<u16>,
    /// 观察到的 ESC_ID 低 4 位
    pub esc_nibbles: Vec<u8>,
}

/// 一次 ID 分配请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentRequest {
    pub key: MotorKey,
    pub new_esc_id: u8,
    pub new_master_id: u16,
    pub mode: ControlMode,
}

impl AssignmentRequest {
    /// 按 `master_id = esc_id + 0x10` 约定生成请求
    pub fn new(key: MotorKey, new_esc_id: u8, mode: ControlMode) -> Self {
        Self {
            key,
            new_esc_id,
            new_master_id: master_id_for(new_esc_id),
            mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssignmentOutcome {
    /// 写入并保存成功，返回新的身份
    Saved(MotorKey),
    /// 写入成功但保存未确认：断电后需重新分配
    Unsaved(MotorKey),
    /// 分配中止，原身份不变
    Aborted(AssignmentError),
}

impl AssignmentOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, AssignmentOutcome::Saved(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentResult {
    pub request: AssignmentRequest,
    pub outcome: AssignmentOutcome,
}

/// 会话结束时的汇总
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryReport {
    pub phase: DiscoveryPhase,
    pub aborted_reason: Option<AbortReason>,
    pub discovered: Vec<DiscoveredMotor>,
    pub pending: Vec<PendingFeedback>,
    pub conflicts: Vec<DiscoveryConflict>,
    pub assignments: Vec<AssignmentResult>,
}

/// 供 UI 读取的会话状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryStatus {
    pub phase: DiscoveryPhase,
    pub discovered: usize,
    pub pending: usize,
    pub conflicts: usize,
    pub candidates_remaining: usize,
}

impl Default for DiscoveryStatus {
    fn default() -> Self {
        Self {
            phase: DiscoveryPhase::Idle,
            discovered: 0,
            pending: 0,
            conflicts: 0,
            candidates_remaining: 0,
        }
    }
}

/// 会话状态的只读句柄（无锁读取）
#[derive(Clone)]
pub struct DiscoveryStatusHandle(Arc<ArcSwap<DiscoveryStatus>>);

impl DiscoveryStatusHandle {
    pub fn load(&self) -> DiscoveryStatus {
        self.0.load().as_ref().clone()
    }

    pub fn phase(&self) -> DiscoveryPhase {
        self.0.load().phase
    }
}

/// 取消令牌，可跨线程克隆
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

struct SessionChannel {
    channel: Arc<Channel>,
    stream: FrameStream,
}

#[derive(Default)]
struct Observation {
    nibbles: BTreeSet<u8>,
    last: Option<(DmFrame, MotorStatus)>,
}

/// 一次发现运行
pub struct DiscoverySession {
    channels: Vec<SessionChannel>,
    registry: Arc<Registry>,
    events: Arc<EventBus>,
    config: DiscoveryConfig,
    phase: DiscoveryPhase,
    status: Arc<ArcSwap<DiscoveryStatus>>,
    cancel: CancelToken,
    candidates: BTreeMap<ChannelId, BTreeSet<u8>>,
    discovered: Vec<DiscoveredMotor>,
    pending: Vec<PendingFeedback>,
    conflicts: Vec<DiscoveryConflict>,
    assignments: Vec<AssignmentResult>,
    aborted_reason: Option<AbortReason>,
    registration: Option<EStopRegistration>,
}

impl DiscoverySession {
    /// 创建会话并立即订阅各通道的接收流
    pub fn new(
        channels: Vec<Arc<Channel>>,
        registry: Arc<Registry>,
        events: Arc<EventBus>,
        config: DiscoveryConfig,
    ) -> Result<Self, DriverError> {
        if channels.is_empty() {
            return Err(DriverError::InvalidInput("discovery needs at least one channel".into()));
        }
        let channels = channels
            .into_iter()
            .map(|channel| {
                let stream = channel.receive_stream();
                SessionChannel { channel, stream }
            })
            .collect();
        Ok(Self {
            channels,
            registry,
            events,
            config,
            phase: DiscoveryPhase::Idle,
            status: Arc::new(ArcSwap::from_pointee(DiscoveryStatus::default())),
            cancel: CancelToken::new(),
            candidates: BTreeMap::new(),
            discovered: Vec::new(),
            pending: Vec::new(),
            conflicts: Vec::new(),
            assignments: Vec::new(),
            aborted_reason: None,
            registration: None,
        })
    }

    /// 把会话登记到 E-STOP，会话结束或析构时自动注销
    pub(crate) fn attach_estop(&mut self, registration: EStopRegistration) {
        self.registration = Some(registration);
    }

    pub fn phase(&self) -> DiscoveryPhase {
        self.phase
    }

    pub fn aborted_reason(&self) -> Option<&AbortReason> {
        self.aborted_reason.as_ref()
    }

    pub fn discovered(&self) -> &[DiscoveredMotor] {
        &self.discovered
    }

    pub fn pending(&self) -> &[PendingFeedback] {
        &self.pending
    }

    pub fn conflicts(&self) -> &[DiscoveryConflict] {
        &self.conflicts
    }

    pub fn status_handle(&self) -> DiscoveryStatusHandle {
        DiscoveryStatusHandle(self.status.clone())
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn publish_status(&self) {
        self.status.store(Arc::new(DiscoveryStatus {
            phase: self.phase,
            discovered: self.discovered.len(),
            pending: self.pending.len(),
            conflicts: self.conflicts.len(),
            candidates_remaining: self.candidates.values().map(BTreeSet::len).sum(),
        }));
    }

    fn enter(&mut self, phase: DiscoveryPhase) {
        if self.phase == phase {
            return;
        }
        debug!("Discovery phase {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
        self.publish_status();
        self.events.publish(CoreEvent::DiscoveryPhaseChanged { phase });
    }

    fn abort(&mut self, reason: AbortReason) {
        warn!("Discovery aborted: {:?}", reason);
        self.aborted_reason = Some(reason);
        self.enter(DiscoveryPhase::Aborted);
    }

    fn require_phase(&self, operation: &'static str, allowed: &[DiscoveryPhase]) -> Result<(), DriverError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(DriverError::InvalidPhase {
                operation,
                actual: self.phase,
            })
        }
    }

    /// 被动监听，返回本阶段新写入注册表的电机
    ///
    /// 取消或 E-STOP 时会话进入 `Aborted`，本阶段观察到的电机不写入注册表。
    pub fn passive_listen(&mut self) -> Result<Vec<DiscoveredMotor>, DriverError> {
        self.require_phase("listen passively", &[DiscoveryPhase::Idle])?;
        self.enter(DiscoveryPhase::PassiveListen);
        let duration = self.config.passive_duration();
        info!("Passive listen for {:?} on {} channel(s)", duration, self.channels.len());

        let mut observed: BTreeMap<(ChannelId, u16), Observation> = BTreeMap::new();
        let deadline = Instant::now() + duration;
        loop {
            if let Some(reason) = self.interruption() {
                self.abort(reason);
                return Ok(Vec::new());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let mut select = Select::new();
            for entry in &self.channels {
                select.recv(entry.stream.receiver());
            }
            let Ok(operation) = select.select_timeout(remaining.min(CANCEL_POLL)) else {
                continue;
            };
            let index = operation.index();
            let entry = &self.channels[index];
            let Ok(frame) = operation.recv(entry.stream.receiver()) else {
                continue;
            };
            if !is_feedback_candidate(&frame) {
                continue;
            }
            let Ok(feedback) = decode_feedback(&frame, &FeedbackLimits::default()) else {
                continue;
            };
            let observation = observed
                .entry((entry.channel.id().clone(), frame.id))
                .or_default();
            observation.nibbles.insert(feedback.esc_nibble);
            observation.last = Some((frame, feedback.status));
        }

        let mut found = Vec::new();
        let now = Instant::now();
        for ((channel, master_id), observation) in observed {
            if self.registry.lookup_master(&channel, master_id).is_some() {
                continue;
            }
            let Some((frame, status)) = observation.last else {
                continue;
            };
            let nibbles: Vec<u8> = observation.nibbles.into_iter().collect();
            let inferred = esc_id_from_master(master_id);

            let Some(esc_id) = inferred else {
                self.pending.push(PendingFeedback {
                    channel,
                    master_id,
                    esc_nibble: nibbles[0],
                });
                continue;
            };
            if nibbles.len() > 1 {
                self.report_conflict(DiscoveryConflict {
                    channel,
                    esc_id,
                    master_ids: vec![master_id],
                    esc_nibbles: nibbles,
                });
                continue;
            }
            if nibbles[0] != esc_id & 0x0F {
                self.pending.push(PendingFeedback {
                    channel,
                    master_id,
                    esc_nibble: nibbles[0],
                });
                continue;
            }

            let key = MotorKey::new(channel.clone(), esc_id);
            if let Ok(registered) = self.registry.master_id(&key) {
                self.report_conflict(DiscoveryConflict {
                    channel,
                    esc_id,
                    master_ids: vec![registered, master_id],
                    esc_nibbles: nibbles,
                });
                continue;
            }
            if !self.register(&key, master_id, &frame, now) {
                continue;
            }
            found.push(DiscoveredMotor {
                key,
                master_id,
                status,
                source: DiscoverySource::Passive,
            });
        }

        info!(
            "Passive listen found {} motor(s), {} pending, {} conflict(s)",
            found.len(),
            self.pending.len(),
            self.conflicts.len()
        );
        self.discovered.extend(found.iter().cloned());
        self.publish_status();
        Ok(found)
    }

    fn register(&self, key: &MotorKey, master_id: u16, frame: &DmFrame, now: Instant) -> bool {
        match self.registry.insert(key.clone(), master_id) {
            Ok(true) => {
                if let Err(e) = self.registry.record_feedback(&key.channel, frame, now) {
                    debug!("Initial feedback for {} not recorded: {}", key, e);
                }
                info!("Discovered motor {} (master 0x{:03X})", key, master_id);
                true
            },
            Ok(false) => false,
            Err(e) => {
                warn!("Could not register {}: {}", key, e);
                false
            },
        }
    }

    fn report_conflict(&mut self, conflict: DiscoveryConflict) {
        warn!(
            "Duplicate identity on {}: ESC 0x{:02X} maps to master(s) {:03X?} with nibble(s) {:?}",
            conflict.channel, conflict.esc_id, conflict.master_ids, conflict.esc_nibbles
        );
        self.events.publish(CoreEvent::DiscoveryConflict {
            channel: conflict.channel.clone(),
            esc_id: conflict.esc_id,
            master_ids: conflict.master_ids.clone(),
        });
        self.conflicts.push(conflict);
    }

    /// 主动探测，返回本阶段新发现的电机
    ///
    /// 只发送 0 rad/s 的速度帧。E-STOP 锁存、取消或设备掉线时会话中止。
    pub fn active_probe(&mut self) -> Result<Vec<DiscoveredMotor>, DriverError> {
        self.require_phase("probe", &[DiscoveryPhase::Idle, DiscoveryPhase::PassiveListen])?;
        self.enter(DiscoveryPhase::ActiveProbe);

        let range = self.config.probe_first..=self.config.probe_last;
        let conflicted: BTreeSet<(ChannelId, u8)> = self
            .conflicts
            .iter()
            .map(|c| (c.channel.clone(), c.esc_id))
            .collect();
        self.candidates = self
            .channels
            .iter()
            .map(|entry| {
                let id = entry.channel.id().clone();
                let ids = range
                    .clone()
                    .filter(|esc| {
                        let key = MotorKey::new(id.clone(), *esc);
                        !self.registry.contains(&key)
                            && self.registry.lookup_master(&id, master_id_for(*esc)).is_none()
                            && !conflicted.contains(&(id.clone(), *esc))
                    })
                    .collect();
                (id, ids)
            })
            .collect();
        self.publish_status();

        let mut found = Vec::new();
        for index in 0..self.channels.len() {
            let channel_id = self.channels[index].channel.id().clone();
            let ids: Vec<u8> = self
                .candidates
                .get(&channel_id)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();

            for esc_id in ids {
                if let Some(reason) = self.interruption() {
                    self.abort(reason);
                    return Ok(found);
                }

                match self.probe_one(index, esc_id) {
                    Ok(Some(motor)) => found.push(motor),
                    Ok(None) => {},
                    Err(DriverError::Bus(e)) if e.is_fatal() => {
                        self.abort(AbortReason::BusFailure(e.to_string()));
                        return Ok(found);
                    },
                    Err(e) => debug!("Probe of ESC 0x{:02X} on {} failed: {}", esc_id, channel_id, e),
                }
                if let Some(set) = self.candidates.get_mut(&channel_id) {
                    set.remove(&esc_id);
                }
                self.publish_status();
            }
        }

        info!("Active probe found {} motor(s)", found.len());
        self.discovered.extend(found.iter().cloned());
        self.publish_status();
        Ok(found)
    }

    fn probe_one(&self, index: usize, esc_id: u8) -> Result<Option<DiscoveredMotor>, DriverError> {
        let entry = &self.channels[index];
        let master_id = master_id_for(esc_id);
        // 0 rad/s：探测不得产生运动
        let probe = encode_velocity(esc_id, 0.0)?;
        entry.stream.drain();
        entry.channel.send(probe)?;

        let deadline = Instant::now() + self.config.probe_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let Some(frame) = entry.stream.recv_timeout(remaining) else {
                return Ok(None);
            };
            if frame.id != master_id {
                continue;
            }
            let Ok(feedback) = decode_feedback(&frame, &FeedbackLimits::default()) else {
                continue;
            };
            if feedback.esc_nibble != esc_id & 0x0F {
                continue;
            }
            let key = MotorKey::new(entry.channel.id().clone(), esc_id);
            if !self.register(&key, master_id, &frame, Instant::now()) {
                return Ok(None);
            }
            return Ok(Some(DiscoveredMotor {
                key,
                master_id,
                status: feedback.status,
                source: DiscoverySource::Probe,
            }));
        }
    }

    /// 执行 ID 分配，返回每个请求的结果
    ///
    /// 结束后会话进入终止阶段：所有请求都已保存为 `Complete`，否则为 `Aborted`。
    pub fn assign(&mut self, requests: Vec<AssignmentRequest>) -> Result<Vec<AssignmentResult>, DriverError> {
        self.require_phase(
            "assign ids",
            &[
                DiscoveryPhase::Idle,
                DiscoveryPhase::PassiveListen,
                DiscoveryPhase::ActiveProbe,
            ],
        )?;

        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let outcome = if self.aborted_reason.is_some() {
                AssignmentOutcome::Aborted(AssignmentError::Cancelled)
            } else if let Err(e) = self.check_interrupted() {
                AssignmentOutcome::Aborted(e)
            } else {
                self.assign_one(&request)
            };
            if let AssignmentOutcome::Aborted(e) = &outcome {
                warn!("Assignment of {} aborted: {}", request.key, e);
            }
            results.push(AssignmentResult { request, outcome });
        }
        self.assignments.extend(results.iter().cloned());

        match self.aborted_reason.clone() {
            Some(reason) => self.abort(reason),
            None if self.assignments.iter().all(|r| r.outcome.is_saved()) => {
                self.enter(DiscoveryPhase::Complete)
            },
            None => self.abort(AbortReason::AssignmentsIncomplete),
        }
        Ok(results)
    }

    fn assign_one(&mut self, request: &AssignmentRequest) -> AssignmentOutcome {
        match self.try_assign(request) {
            Ok(outcome) => outcome,
            Err(e) => AssignmentOutcome::Aborted(e),
        }
    }

    fn try_assign(&mut self, request: &AssignmentRequest) -> Result<AssignmentOutcome, AssignmentError> {
        let key = &request.key;
        let esc_id = key.esc_id;
        if !self.registry.contains(key) {
            return Err(AssignmentError::UnknownMotor(key.clone()));
        }
        validate_esc_id(request.new_esc_id).map_err(|_| AssignmentError::InvalidTarget(request.new_esc_id))?;
        let mode_value = request
            .mode
            .register_value()
            .ok_or(AssignmentError::UnwritableMode(request.mode))?;

        let new_key = MotorKey::new(key.channel.clone(), request.new_esc_id);
        if &new_key != key && self.registry.contains(&new_key) {
            return Err(AssignmentError::IdentityInUse(new_key));
        }
        if let Some(owner) = self.registry.lookup_master(&key.channel, request.new_master_id)
            && &owner != key
        {
            return Err(AssignmentError::IdentityInUse(owner));
        }
        let channel = self
            .channels
            .iter()
            .find(|entry| entry.channel.id() == &key.channel)
            .map(|entry| entry.channel.clone())
            .ok_or_else(|| AssignmentError::UnknownMotor(key.clone()))?;

        self.enter(DiscoveryPhase::Assigning);
        info!(
            "Assigning {} -> ESC 0x{:02X}, master 0x{:03X}, {} mode",
            key, request.new_esc_id, request.new_master_id, request.mode
        );

        // 写 ID 前先失能
        let disable = encode_disable(esc_id).map_err(|e| AssignmentError::DisableFailed {
            esc_id,
            message: e.to_string(),
        })?;
        if let Err(e) = channel.send(disable) {
            self.note_bus_failure(&e);
            return Err(AssignmentError::DisableFailed {
                esc_id,
                message: e.to_string(),
            });
        }
        if let Err(e) = self.registry.set_enabled(key, false) {
            debug!("Could not clear enable latch of {}: {}", key, e);
        }

        let timeout = self.config.rid_timeout();
        let writes = [
            (Rid::EscId, request.new_esc_id as u32),
            (Rid::MasterId, request.new_master_id as u32),
            (Rid::ControlMode, mode_value),
        ];
        for (rid, value) in writes {
            // E-STOP 可能在两次写之间锁存，已写入的 RID 不回滚
            self.check_interrupted()?;
            match management::write_rid(&channel, esc_id, rid, value, timeout) {
                Ok(_) => debug!("RID {:?} = {} acknowledged by {}", rid, value, key),
                Err(DriverError::Timeout) => {
                    return Err(AssignmentError::NotAcknowledged { esc_id, rid, timeout });
                },
                Err(e) => {
                    self.note_bus_failure(&e);
                    return Err(AssignmentError::WriteFailed {
                        esc_id,
                        rid,
                        message: e.to_string(),
                    });
                },
            }
        }

        self.check_interrupted()?;
        self.enter(DiscoveryPhase::Saving);
        let saved = self.save(&channel, esc_id, timeout);
        if !saved {
            warn!("Save not confirmed for {}; ids are lost on power cycle", key);
        }

        let new_key = self
            .registry
            .reassign(key, request.new_esc_id, request.new_master_id, request.mode, !saved)
            .map_err(|_| AssignmentError::IdentityInUse(new_key))?;
        Ok(if saved {
            AssignmentOutcome::Saved(new_key)
        } else {
            AssignmentOutcome::Unsaved(new_key)
        })
    }

    fn save(&mut self, channel: &Channel, esc_id: u8, timeout: Duration) -> bool {
        let result = if self.config.require_save_ack {
            management::save(channel, esc_id, timeout)
        } else {
            encode_rid_save(esc_id)
                .map_err(DriverError::from)
                .and_then(|frame| channel.send(frame))
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                self.note_bus_failure(&e);
                debug!("Save on ESC 0x{:02X} failed: {}", esc_id, e);
                false
            },
        }
    }

    /// 当前是否应中止，E-STOP 优先于普通取消
    fn interruption(&self) -> Option<AbortReason> {
        if self.registry.estop_latched() {
            Some(AbortReason::EStop)
        } else if self.cancel.is_cancelled() {
            Some(AbortReason::Cancelled)
        } else {
            None
        }
    }

    fn check_interrupted(&mut self) -> Result<(), AssignmentError> {
        match self.interruption() {
            Some(reason) => {
                self.aborted_reason.get_or_insert(reason);
                Err(AssignmentError::Cancelled)
            },
            None => Ok(()),
        }
    }

    fn note_bus_failure(&mut self, error: &DriverError) {
        if let DriverError::Bus(e) = error
            && e.is_fatal()
            && self.aborted_reason.is_none()
        {
            self.aborted_reason = Some(AbortReason::BusFailure(e.to_string()));
        }
    }

    /// 结束会话并返回汇总
    ///
    /// 未进入终止阶段的会话：已取消或 E-STOP 锁存为 `Aborted`，否则为 `Complete`。
    pub fn finish(mut self) -> DiscoveryReport {
        if !self.phase.is_terminal() {
            match self.interruption() {
                Some(reason) => self.abort(reason),
                None => self.enter(DiscoveryPhase::Complete),
            }
        }
        self.registration.take();
        DiscoveryReport {
            phase: self.phase,
            aborted_reason: self.aborted_reason,
            discovered: self.discovered,
            pending: self.pending,
            conflicts: self.conflicts,
            assignments: self.assignments,
        }
    }
}

/// 只有反馈 ID 才参与推断：命令帧（0x100 起）与管理帧不算
fn is_feedback_candidate(frame: &DmFrame) -> bool {
    frame.id < ID_POS_VEL_BASE && frame.id != ID_MANAGEMENT && frame.len == 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use dm_can::MockBus;
    use dm_protocol::Feedback;

    fn feedback(master_id: u16, nibble: u8, status: MotorStatus) -> DmFrame {
        Feedback {
            master_id,
            esc_nibble: nibble,
            status,
            position: 0.0,
            velocity: 0.0,
            torque: 0.0,
            temp_mos: 25,
            temp_rotor: 25,
            timestamp_us: 0,
        }
        .to_frame(&FeedbackLimits::default())
    }

    fn setup(config: DiscoveryConfig) -> (MockBus, Arc<Registry>, Arc<EventBus>, DiscoverySession) {
        let bus = MockBus::new();
        let channel = Arc::new(Channel::open("can0", bus.adapter(), &ChannelConfig::default()).unwrap());
        let registry = Arc::new(Registry::new());
        let events = Arc::new(EventBus::default());
        let session = DiscoverySession::new(vec![channel], registry.clone(), events.clone(), config).unwrap();
        (bus, registry, events, session)
    }

    fn quick() -> DiscoveryConfig {
        DiscoveryConfig {
            passive_duration_ms: 80,
            probe_first: 1,
            probe_last: 4,
            probe_timeout_ms: 20,
            rid_timeout_ms: 40,
            require_save_ack: true,
        }
    }

    #[test]
    fn test_duplicate_hardware_is_a_conflict() {
        let (bus, registry, events, mut session) = setup(quick());
        let rx = events.subscribe();
        bus.inject(feedback(0x12, 0x2, MotorStatus::Disabled));
        bus.inject(feedback(0x12, 0x5, MotorStatus::Disabled));

        let found = session.passive_listen().unwrap();
        assert!(found.is_empty());
        assert!(registry.is_empty());
        assert_eq!(session.conflicts().len(), 1);
        assert_eq!(session.conflicts()[0].esc_id, 2);
        assert!(
            rx.try_iter()
                .any(|e| matches!(e, CoreEvent::DiscoveryConflict { esc_id: 2, .. }))
        );
    }

    #[test]
    fn test_conflict_with_registered_identity() {
        let (bus, registry, _events, mut session) = setup(quick());
        registry.insert(MotorKey::new("can0", 3), 0x40).unwrap();
        bus.inject(feedback(0x13, 0x3, MotorStatus::Disabled));

        session.passive_listen().unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(session.conflicts()[0].master_ids, vec![0x40, 0x13]);
    }

    #[test]
    fn test_ambiguous_feedback_is_pending() {
        let (bus, registry, _events, mut session) = setup(quick());
        // 低 4 位与推断的 ESC_ID 不一致
        bus.inject(feedback(0x11, 0x7, MotorStatus::Disabled));
        // 不符合 esc + 0x10 约定
        bus.inject(feedback(0x05, 0x5, MotorStatus::Disabled));

        session.passive_listen().unwrap();
        assert!(registry.is_empty());
        assert_eq!(session.pending().len(), 2);
    }

    #[test]
    fn test_probe_sends_only_zero_velocity() {
        let (bus, registry, _events, mut session) = setup(quick());
        bus.set_responder(|frame| {
            if frame.id == 0x203 {
                vec![feedback(0x13, 0x3, MotorStatus::Disabled)]
            } else {
                Vec::new()
            }
        });

        let found = session.active_probe().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, MotorKey::new("can0", 3));
        assert_eq!(found[0].source, DiscoverySource::Probe);
        assert!(registry.contains(&MotorKey::new("can0", 3)));

        let probes = bus.sent_frames();
        assert_eq!(probes.len(), 4);
        for frame in probes {
            let (_, velocity) = dm_protocol::decode_velocity(&frame).unwrap();
            assert_eq!(velocity, 0.0);
        }
        assert_eq!(session.status_handle().load().candidates_remaining, 0);
    }

    #[test]
    fn test_probe_aborts_on_estop() {
        let (bus, registry, _events, mut session) = setup(quick());
        registry.latch_estop();
        session.active_probe().unwrap();
        assert_eq!(session.phase(), DiscoveryPhase::Aborted);
        assert_eq!(session.aborted_reason(), Some(&AbortReason::EStop));
        assert!(bus.sent_frames().is_empty());
    }

    #[test]
    fn test_cancelled_passive_listen_aborts() {
        let (bus, registry, _events, mut session) = setup(quick());
        bus.inject(feedback(0x11, 0x1, MotorStatus::Disabled));
        session.cancel();
        session.passive_listen().unwrap();
        assert_eq!(session.phase(), DiscoveryPhase::Aborted);
        assert!(registry.is_empty());
        assert!(matches!(
            session.active_probe(),
            Err(DriverError::InvalidPhase { .. })
        ));
    }

    #[test]
    fn test_unwritable_mode_rejected() {
        let (_bus, registry, _events, mut session) = setup(quick());
        let key = MotorKey::new("can0", 1);
        registry.insert(key.clone(), 0x11).unwrap();
        let results = session
            .assign(vec![AssignmentRequest::new(key, 2, ControlMode::Disabled)])
            .unwrap();
        assert_eq!(
            results[0].outcome,
            AssignmentOutcome::Aborted(AssignmentError::UnwritableMode(ControlMode::Disabled))
        );
        assert_eq!(session.phase(), DiscoveryPhase::Aborted);
    }

    #[test]
    fn test_finish_without_assignments_completes() {
        let (_bus, _registry, _events, session) = setup(quick());
        let report = session.finish();
        assert_eq!(report.phase, DiscoveryPhase::Complete);
        assert!(report.aborted_reason.is_none());
    }
}

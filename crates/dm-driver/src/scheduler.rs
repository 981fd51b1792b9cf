//! 多电机编排调度
//!
//! 每个编排为编组中的每台电机登记一个周期发送，再由一个节拍线程
//! 按固定节拍重新计算负载并原地替换（`update_periodic`），发送节拍不受影响。
//!
//! 启动前检查整组电机的控制模式，任何一台不符合都返回 `GroupNotReady`，
//! 不会启动任何周期发送。启动在 E-STOP 登记锁内完成，E-STOP 可以无条件停止所有编排。

use crate::channel::{Channel, ChannelMap, JoinTimeout, PeriodicHandle};
use crate::discovery::CancelToken;
use crate::error::DriverError;
use crate::estop::EStop;
use crate::events::{CoreEvent, EventBus, StopReason};
use crate::registry::{MotorKey, Registry};
use dm_protocol::{ControlMode, DmFrame, ProtocolError, encode_position_velocity, encode_velocity};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::f32::consts::{PI, TAU};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 编排类型
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Choreography {
    /// 相位错开的正弦速度：`v_i = A · sin(2πft + i·phase_step)`
    Sine {
        /// rad/s
        amplitude: f32,
        frequency_hz: f32,
        /// 相邻电机的相位差（rad）
        phase_step: f32,
    },
    /// 接力：依次由一台电机做一段平滑的速度脉冲，每轮方向反转
    Duet {
        /// 峰值速度 rad/s
        speed: f32,
        /// 每台电机持有接力棒的时间（秒）
        hold_s: f32,
    },
    /// 8 字轨迹（位置-速度模式）：偶数序号电机跑 x，奇数序号跑 y
    FigureEight {
        /// rad
        amplitude: f32,
        frequency_hz: f32,
        /// 位置-速度帧中的速度上限 rad/s
        max_velocity: f32,
    },
}

impl Choreography {
    /// 编组中每台电机必须处于的控制模式
    pub fn required_mode(&self) -> ControlMode {
        match self {
            Choreography::Sine { .. } | Choreography::Duet { .. } => ControlMode::Velocity,
            Choreography::FigureEight { .. } => ControlMode::PositionVelocity,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Choreography::Sine { .. } => "sine",
            Choreography::Duet { .. } => "duet",
            Choreography::FigureEight { .. } => "figure-eight",
        }
    }

    fn min_group_size(&self) -> usize {
        match self {
            Choreography::Duet { .. } => 2,
            _ => 1,
        }
    }

    fn validate(&self) -> Result<(), DriverError> {
        let (magnitudes, rate) = match *self {
            Choreography::Sine {
                amplitude,
                frequency_hz,
                phase_step,
            } => ([amplitude, phase_step], frequency_hz),
            Choreography::Duet { speed, hold_s } => ([speed, 0.0], hold_s),
            Choreography::FigureEight {
                amplitude,
                frequency_hz,
                max_velocity,
            } => ([amplitude, max_velocity], frequency_hz),
        };
        if magnitudes.iter().any(|v| !v.is_finite()) || !rate.is_finite() || rate <= 0.0 {
            return Err(DriverError::InvalidInput(format!(
                "invalid {} parameters: {:?}",
                self.name(),
                self
            )));
        }
        Ok(())
    }

    /// 第 `index` 台电机（共 `count` 台）在时刻 `t` 秒的命令帧
    pub fn frame(&self, esc_id: u8, index: usize, count: usize, t: f32) -> Result<DmFrame, ProtocolError> {
        match *self {
            Choreography::Sine {
                amplitude,
                frequency_hz,
                phase_step,
            } => {
                let phase = TAU * frequency_hz * t + index as f32 * phase_step;
                encode_velocity(esc_id, amplitude * phase.sin())
            },
            Choreography::Duet { speed, hold_s } => {
                let count = count.max(1);
                let slot = (t / hold_s).floor() as usize;
                let active = slot % count;
                let round = slot / count;
                let velocity = if active == index {
                    let tau = (t - slot as f32 * hold_s) / hold_s;
                    let sign = if round % 2 == 0 { 1.0 } else { -1.0 };
                    sign * speed * (PI * tau).sin().powi(2)
                } else {
                    0.0
                };
                encode_velocity(esc_id, velocity)
            },
            Choreography::FigureEight {
                amplitude,
                frequency_hz,
                max_velocity,
            } => {
                let omega = TAU * frequency_hz;
                let position = if index % 2 == 0 {
                    amplitude * (omega * t).sin()
                } else {
                    amplitude * (2.0 * omega * t).sin() / 2.0
                };
                encode_position_velocity(esc_id, position, max_velocity)
            },
        }
    }

    /// 正常停止后发给电机的收尾帧（速度类编排刹停到 0）
    fn rest_frame(&self, esc_id: u8) -> Option<Result<DmFrame, ProtocolError>> {
        match self {
            Choreography::Sine { .. } | Choreography::Duet { .. } => Some(encode_velocity(esc_id, 0.0)),
            Choreography::FigureEight { .. } => None,
        }
    }
}

/// 调度参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleParams {
    /// 负载重新计算的节拍
    pub tick: Duration,
    /// 周期发送的周期
    pub period: Duration,
}

impl Default for ScheduleParams {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(20),
            period: Duration::from_millis(10),
        }
    }
}

/// 编排句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChoreographyHandle {
    id: u64,
}

impl ChoreographyHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct Slot {
    channel: Arc<Channel>,
    handle: PeriodicHandle,
    esc_id: u8,
    index: usize,
}

struct Running {
    token: CancelToken,
    thread: Option<JoinHandle<()>>,
}

/// 编排调度器
pub struct Scheduler {
    registry: Arc<Registry>,
    channels: Arc<ChannelMap>,
    estop: Arc<EStop>,
    events: Arc<EventBus>,
    running: Mutex<HashMap<u64, Running>>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<Registry>,
        channels: Arc<ChannelMap>,
        estop: Arc<EStop>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            channels,
            estop,
            events,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// 启动编排
    ///
    /// 所有检查都在登记任何周期发送之前完成；启动中途失败会回滚已登记的发送。
    pub fn start(
        &self,
        choreography: Choreography,
        group: &[MotorKey],
        params: ScheduleParams,
    ) -> Result<ChoreographyHandle, DriverError> {
        choreography.validate()?;
        if params.tick.is_zero() || params.period.is_zero() {
            return Err(DriverError::InvalidInput("tick and period must be > 0".into()));
        }
        let unique: BTreeSet<&MotorKey> = group.iter().collect();
        if unique.len() != group.len() {
            return Err(DriverError::InvalidInput("group contains duplicate motors".into()));
        }
        if group.len() < choreography.min_group_size() {
            return Err(DriverError::InvalidInput(format!(
                "{} needs at least {} motor(s), got {}",
                choreography.name(),
                choreography.min_group_size(),
                group.len()
            )));
        }
        self.registry.ensure_not_estopped()?;

        let required = choreography.required_mode();
        let mut not_ready = Vec::new();
        for key in group {
            if self.registry.mode(key)? != required {
                not_ready.push(key.clone());
            }
        }
        if !not_ready.is_empty() {
            return Err(DriverError::GroupNotReady { required, not_ready });
        }

        let count = group.len();
        let mut plan = Vec::with_capacity(count);
        for (index, key) in group.iter().enumerate() {
            let channel = self
                .channels
                .get(&key.channel)
                .cloned()
                .ok_or_else(|| DriverError::UnknownChannel(key.channel.clone()))?;
            let frame = choreography.frame(key.esc_id, index, count, 0.0)?;
            plan.push((channel, key.esc_id, index, frame));
        }

        let id = self.estop.allocate_id();
        let token = CancelToken::new();
        let slots = self.estop.register_with(id, token.clone(), || {
            let mut slots: Vec<Slot> = Vec::with_capacity(plan.len());
            for (channel, esc_id, index, frame) in &plan {
                match channel.start_periodic(*frame, params.period) {
                    Ok(handle) => slots.push(Slot {
                        channel: channel.clone(),
                        handle,
                        esc_id: *esc_id,
                        index: *index,
                    }),
                    Err(e) => {
                        for slot in &slots {
                            slot.channel.stop_periodic(&slot.handle);
                        }
                        return Err(e);
                    },
                }
            }
            Ok(slots)
        })?;

        let started: Vec<(Arc<Channel>, PeriodicHandle)> = slots
            .iter()
            .map(|slot| (slot.channel.clone(), slot.handle))
            .collect();
        let context = TickContext {
            id,
            choreography,
            count,
            tick: params.tick,
            slots,
            token: token.clone(),
            estop: self.estop.clone(),
            events: self.events.clone(),
        };
        let thread = std::thread::Builder::new()
            .name(format!("dm-choreo-{}", id))
            .spawn(move || context.run());
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                token.cancel();
                self.estop.deregister(id);
                for (channel, handle) in &started {
                    channel.stop_periodic(handle);
                }
                return Err(DriverError::Bus(dm_can::CanError::Io(e)));
            },
        };

        info!(
            "Choreography {} ({}) started on {} motor(s)",
            id,
            choreography.name(),
            count
        );
        self.running.lock().insert(
            id,
            Running {
                token,
                thread: Some(thread),
            },
        );
        Ok(ChoreographyHandle { id })
    }

    /// 停止编排并回收其周期发送（幂等）
    pub fn stop(&self, handle: &ChoreographyHandle) -> bool {
        let Some(mut running) = self.running.lock().remove(&handle.id) else {
            return false;
        };
        running.token.cancel();
        if let Some(thread) = running.thread.take()
            && thread.join_timeout(Duration::from_secs(2)).is_err()
        {
            warn!("Choreography {} thread did not exit cleanly", handle.id);
        }
        true
    }

    pub fn stop_all(&self) -> usize {
        let ids: Vec<u64> = self.running.lock().keys().copied().collect();
        ids.into_iter()
            .filter(|id| self.stop(&ChoreographyHandle { id: *id }))
            .count()
    }

    pub fn is_active(&self, handle: &ChoreographyHandle) -> bool {
        self.running
            .lock()
            .get(&handle.id)
            .is_some_and(|r| r.thread.as_ref().is_some_and(|t| !t.is_finished()))
    }

    /// 仍在运行的编排数（已自行结束的会被回收）
    pub fn active_count(&self) -> usize {
        let mut running = self.running.lock();
        running.retain(|_, r| r.thread.as_ref().is_some_and(|t| !t.is_finished()));
        running.len()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

struct TickContext {
    id: u64,
    choreography: Choreography,
    count: usize,
    tick: Duration,
    slots: Vec<Slot>,
    token: CancelToken,
    estop: Arc<EStop>,
    events: Arc<EventBus>,
}

impl TickContext {
    fn cancel_reason(&self) -> StopReason {
        if self.estop.is_latched() {
            StopReason::EStop
        } else {
            StopReason::Requested
        }
    }

    fn run(self) {
        let start = Instant::now();
        let mut next = start + self.tick;
        let reason = 'ticks: loop {
            let now = Instant::now();
            if next > now {
                spin_sleep::sleep(next - now);
            }
            next += self.tick;
            if next <= Instant::now() {
                next = Instant::now() + self.tick;
            }
            if self.token.is_cancelled() {
                break self.cancel_reason();
            }

            let t = start.elapsed().as_secs_f32();
            for slot in &self.slots {
                let frame = match self.choreography.frame(slot.esc_id, slot.index, self.count, t) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Choreography {} payload for ESC 0x{:02X}: {}", self.id, slot.esc_id, e);
                        continue;
                    },
                };
                match slot.channel.update_periodic(&slot.handle, frame) {
                    Ok(()) => {},
                    Err(DriverError::UnknownSchedule { id }) => {
                        if self.token.is_cancelled() {
                            break 'ticks self.cancel_reason();
                        }
                        warn!("Choreography {} lost schedule 0x{:03X}", self.id, id);
                        break 'ticks StopReason::ScheduleLost;
                    },
                    Err(e) => warn!("Choreography {} update failed: {}", self.id, e),
                }
            }
        };

        for slot in &self.slots {
            slot.channel.stop_periodic(&slot.handle);
        }
        if reason == StopReason::Requested {
            for slot in &self.slots {
                if let Some(frame) = self.choreography.rest_frame(slot.esc_id) {
                    let result = frame.map_err(DriverError::from).and_then(|f| slot.channel.send(f));
                    if let Err(e) = result {
                        warn!("Failed to stop ESC 0x{:02X} after choreography: {}", slot.esc_id, e);
                    }
                }
            }
        }
        self.estop.deregister(self.id);
        debug!("Choreography {} stopped: {:?}", self.id, reason);
        self.events.publish(CoreEvent::ChoreographyStopped {
            id: self.id,
            reason,
        });
    }
}

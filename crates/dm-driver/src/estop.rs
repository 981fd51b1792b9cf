//! 全局 E-STOP
//!
//! `engage()` 同步执行，优先级高于任何进行中的编排或发现：
//!
//! 1. 锁存 E-STOP 标志并取消所有已登记的活动（编排 / 发现会话）
//! 2. 清空每个通道的周期调度表。返回后不会再有周期帧发出，
//!    因此随后的失能帧不会排在旧负载之后
//! 3. 向所有锁存为使能的电机发送失能帧
//!
//! 失能帧发送失败是唯一必须以高优先级上报的错误：硬件可能仍在运动。

use crate::channel::ChannelMap;
use crate::discovery::CancelToken;
use crate::error::DriverError;
use crate::events::{CoreEvent, EventBus};
use crate::registry::{MotorKey, Registry};
use dm_protocol::encode_disable;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

/// 一次 E-STOP 的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EStopReport {
    /// 被取消的登记活动数
    pub cancelled_activities: usize,
    /// 被停止的周期调度数（所有通道合计）
    pub stopped_schedules: usize,
    /// 已成功发出失能帧的电机
    pub disabled: Vec<MotorKey>,
    /// 失能帧发送失败的电机
    pub failures: Vec<(MotorKey, String)>,
}

impl EStopReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct EStop {
    registry: Arc<Registry>,
    channels: Arc<ChannelMap>,
    events: Arc<EventBus>,
    registrations: Mutex<HashMap<u64, CancelToken>>,
    next_id: AtomicU64,
}

impl EStop {
    pub fn new(registry: Arc<Registry>, channels: Arc<ChannelMap>, events: Arc<EventBus>) -> Self {
        Self {
            registry,
            channels,
            events,
            registrations: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn is_latched(&self) -> bool {
        self.registry.estop_latched()
    }

    pub(crate) fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// 在登记锁内检查锁存并执行启动动作，成功后登记取消令牌
    ///
    /// 与 `engage()` 互斥：启动要么在 E-STOP 之前完整完成（随后被 E-STOP 停止），
    /// 要么看到锁存而失败。
    pub(crate) fn register_with<R>(
        &self,
        id: u64,
        token: CancelToken,
        start: impl FnOnce() -> Result<R, DriverError>,
    ) -> Result<R, DriverError> {
        let mut registrations = self.registrations.lock();
        self.registry.ensure_not_estopped()?;
        let result = start()?;
        registrations.insert(id, token);
        Ok(result)
    }

    pub(crate) fn register(&self, id: u64, token: CancelToken) -> Result<(), DriverError> {
        self.register_with(id, token, || Ok(()))
    }

    pub(crate) fn deregister(&self, id: u64) -> bool {
        self.registrations.lock().remove(&id).is_some()
    }

    pub fn registered_count(&self) -> usize {
        self.registrations.lock().len()
    }

    /// 触发 E-STOP
    pub fn engage(&self) -> EStopReport {
        let cancelled_activities = {
            let mut registrations = self.registrations.lock();
            self.registry.latch_estop();
            let tokens: Vec<CancelToken> = registrations.drain().map(|(_, token)| token).collect();
            for token in &tokens {
                token.cancel();
            }
            tokens.len()
        };

        let stopped_schedules = self
            .channels
            .values()
            .map(|channel| channel.stop_all_periodic())
            .sum();

        let mut report = EStopReport {
            cancelled_activities,
            stopped_schedules,
            ..EStopReport::default()
        };

        for key in self.registry.enabled_motors() {
            match self.disable(&key) {
                Ok(()) => {
                    if let Err(e) = self.registry.set_enabled(&key, false) {
                        debug!("E-STOP could not clear enable latch of {}: {}", key, e);
                    }
                    report.disabled.push(key);
                },
                Err(e) => {
                    error!("E-STOP disable for {} failed, motor may still be moving: {}", key, e);
                    self.events.publish(CoreEvent::EStopFailure {
                        key: key.clone(),
                        error: e.clone(),
                    });
                    report.failures.push((key, e));
                },
            }
        }

        warn!(
            "E-STOP engaged: {} activity(ies) cancelled, {} schedule(s) stopped, {} motor(s) disabled",
            report.cancelled_activities,
            report.stopped_schedules,
            report.disabled.len()
        );
        self.events.publish(CoreEvent::EStopEngaged {
            stopped_schedules: report.stopped_schedules,
            disabled: report.disabled.clone(),
        });
        report
    }

    fn disable(&self, key: &MotorKey) -> Result<(), String> {
        let channel = self
            .channels
            .get(&key.channel)
            .ok_or_else(|| format!("unknown channel {}", key.channel))?;
        let frame = encode_disable(key.esc_id).map_err(|e| e.to_string())?;
        channel.send(frame).map_err(|e| e.to_string())
    }

    /// 解除锁存，返回之前是否处于锁存状态
    pub fn clear(&self) -> bool {
        let was_latched = self.registry.release_estop();
        if was_latched {
            info!("E-STOP cleared");
            self.events.publish(CoreEvent::EStopCleared);
        }
        was_latched
    }
}

/// 登记守卫，析构时从 E-STOP 注销
pub(crate) struct EStopRegistration {
    estop: Arc<EStop>,
    id: u64,
}

impl EStopRegistration {
    /// 锁存时返回 `EStopLatched`
    pub(crate) fn new(estop: Arc<EStop>, token: CancelToken) -> Result<Self, DriverError> {
        let id = estop.allocate_id();
        estop.register(id, token)?;
        Ok(Self { estop, id })
    }
}

impl Drop for EStopRegistration {
    fn drop(&mut self) {
        self.estop.deregister(self.id);
    }
}

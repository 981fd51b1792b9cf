//! 反馈超时看门狗
//!
//! 固定间隔扫描注册表中的所有电机：锁存为使能、且最近一次活动
//! （反馈或使能时刻）距今超过阈值的电机会收到一帧失能命令。
//!
//! 冷却窗口内同一电机最多失能一次。失能后锁存保持使能，
//! 直到电机反馈报告 `Disabled`，因此持续静默的总线每个冷却窗口只收到一帧失能。
//! 介入只作为事件上报，不影响其他电机。

use crate::channel::{ChannelMap, JoinTimeout};
use crate::config::WatchdogConfig;
use crate::events::{CoreEvent, EventBus};
use crate::registry::{MotorKey, Registry};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use dm_protocol::encode_disable;
use smallvec::SmallVec;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// 一次介入
#[derive(Debug, Clone, PartialEq)]
pub struct Intervention {
    pub key: MotorKey,
    pub stale_for: Duration,
    /// 失能帧发送失败时的错误信息
    pub send_error: Option<String>,
}

/// 看门狗
pub struct Watchdog {
    registry: Arc<Registry>,
    channels: Arc<ChannelMap>,
    events: Arc<EventBus>,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(
        registry: Arc<Registry>,
        channels: Arc<ChannelMap>,
        events: Arc<EventBus>,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            registry,
            channels,
            events,
            config,
        }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// 以当前时间扫描一次
    pub fn scan(&self) -> SmallVec<[Intervention; 4]> {
        self.scan_at(Instant::now())
    }

    /// 以给定时间扫描一次，返回本次介入
    pub fn scan_at(&self, now: Instant) -> SmallVec<[Intervention; 4]> {
        let threshold = self.config.threshold();
        let cooldown = self.config.cooldown();
        let mut interventions = SmallVec::new();

        for key in self.registry.keys() {
            // 判定与记录在同一把电机锁内完成，发送在锁外
            let stale_for = self
                .registry
                .with_motor(&key, |motor| {
                    if !motor.enabled {
                        return None;
                    }
                    let stale_for = now.saturating_duration_since(motor.last_activity()?);
                    if stale_for <= threshold {
                        return None;
                    }
                    if let Some(previous) = motor.watchdog.last_intervention
                        && now.saturating_duration_since(previous) < cooldown
                    {
                        return None;
                    }
                    motor.watchdog.last_intervention = Some(now);
                    Some(stale_for)
                })
                .ok()
                .flatten();
            let Some(stale_for) = stale_for else {
                continue;
            };

            let send_error = self.send_disable(&key).err();
            match &send_error {
                None => {
                    warn!("Watchdog disabled {}: no feedback for {:?}", key, stale_for);
                    self.events.publish(CoreEvent::WatchdogDisabled {
                        key: key.clone(),
                        stale_for,
                    });
                },
                Some(e) => {
                    warn!("Watchdog could not disable {}: {}", key, e);
                    self.events.publish(CoreEvent::WatchdogSendFailed {
                        key: key.clone(),
                        error: e.clone(),
                    });
                },
            }
            interventions.push(Intervention {
                key,
                stale_for,
                send_error,
            });
        }
        interventions
    }

    fn send_disable(&self, key: &MotorKey) -> Result<(), String> {
        let channel = self
            .channels
            .get(&key.channel)
            .ok_or_else(|| format!("unknown channel {}", key.channel))?;
        let frame = encode_disable(key.esc_id).map_err(|e| e.to_string())?;
        channel.send(frame).map_err(|e| e.to_string())
    }

    /// 在后台线程中按配置间隔扫描
    pub fn spawn(self) -> WatchdogHandle {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let interval = self.config.interval();
        let thread = std::thread::Builder::new()
            .name("dm-watchdog".into())
            .spawn(move || {
                debug!("Watchdog running every {:?}", interval);
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let found = self.scan();
                            trace!("Watchdog scan: {} intervention(s)", found.len());
                        },
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Watchdog stopped");
            });
        match thread {
            Ok(thread) => WatchdogHandle {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            },
            Err(e) => {
                error!("Failed to spawn watchdog thread: {}", e);
                WatchdogHandle {
                    stop_tx: None,
                    thread: None,
                }
            },
        }
    }
}

/// 后台看门狗句柄；drop 时停止
pub struct WatchdogHandle {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl WatchdogHandle {
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn stop(&mut self) {
        // 断开发送端即可唤醒线程
        self.stop_tx.take();
        if let Some(thread) = self.thread.take()
            && thread.join_timeout(Duration::from_secs(2)).is_err()
        {
            error!("Watchdog thread panicked or failed to shut down");
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

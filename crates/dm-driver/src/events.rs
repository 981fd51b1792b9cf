//! 核心事件
//!
//! 面向 UI / 观测侧，尽力投递：每个订阅者一个有界队列，
//! 消费过慢时丢弃事件，不阻塞看门狗与 E-STOP 路径。

use crate::discovery::DiscoveryPhase;
use crate::registry::{ChannelId, MotorKey};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// 反馈超时，看门狗已失能该电机
    WatchdogDisabled { key: MotorKey, stale_for: Duration },
    /// 看门狗的失能帧未能发出
    WatchdogSendFailed { key: MotorKey, error: String },
    EStopEngaged {
        stopped_schedules: usize,
        disabled: Vec<MotorKey>,
    },
    /// 高优先级：硬件可能仍在运动
    EStopFailure { key: MotorKey, error: String },
    EStopCleared,
    DiscoveryPhaseChanged { phase: DiscoveryPhase },
    /// 多个反馈源推断出同一 ESC ID
    DiscoveryConflict {
        channel: ChannelId,
        esc_id: u8,
        master_ids: Vec<u16>,
    },
    ChoreographyStopped { id: u64, reason: StopReason },
}

/// 编排停止原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    EStop,
    ScheduleLost,
}

impl CoreEvent {
    pub fn is_high_priority(&self) -> bool {
        matches!(self, CoreEvent::EStopFailure { .. })
    }
}

/// 事件总线，订阅者断开后在下次发布时移除
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<CoreEvent>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        let (tx, rx) = bounded(self.capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: CoreEvent) {
        self.subscribers
            .lock()
            .retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) | Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Disconnected(_)) => false,
            });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

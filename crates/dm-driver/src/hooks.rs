//! 帧回调
//!
//! RX 线程在分发给订阅者之前依次调用已注册的回调。
//! 回调运行在接收路径上，必须非阻塞：只允许短暂的锁或 `try_send`。

use crate::metrics::ChannelMetrics;
use crate::registry::{ChannelId, Registry};
use dm_protocol::DmFrame;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::trace;

/// 帧回调 Trait
pub trait FrameCallback: Send + Sync {
    /// 接收到帧时调用
    fn on_frame_received(&self, frame: &DmFrame);

    /// 帧成功发送后调用（可选）
    fn on_frame_sent(&self, frame: &DmFrame) {
        let _ = frame;
    }
}

/// 回调列表
///
/// 本身不是线程安全的，由通道通过 `RwLock<HookManager>` 保护。
#[derive(Default)]
pub struct HookManager {
    callbacks: Vec<Arc<dyn FrameCallback>>,
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_callback(&mut self, callback: Arc<dyn FrameCallback>) {
        self.callbacks.push(callback);
    }

    pub fn trigger_all(&self, frame: &DmFrame) {
        for callback in self.callbacks.iter() {
            callback.on_frame_received(frame);
        }
    }

    pub fn trigger_all_sent(&self, frame: &DmFrame) {
        for callback in self.callbacks.iter() {
            callback.on_frame_sent(frame);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn clear(&mut self) {
        self.callbacks.clear();
    }
}

/// 把反馈帧写入注册表的回调（Channel receive → decode → Registry update）
pub struct RegistryFeedbackHook {
    channel: ChannelId,
    registry: Arc<Registry>,
    metrics: Arc<ChannelMetrics>,
}

impl RegistryFeedbackHook {
    pub fn new(channel: ChannelId, registry: Arc<Registry>, metrics: Arc<ChannelMetrics>) -> Self {
        Self {
            channel,
            registry,
            metrics,
        }
    }
}

impl FrameCallback for RegistryFeedbackHook {
    fn on_frame_received(&self, frame: &DmFrame) {
        if let Err(e) = self
            .registry
            .record_feedback(&self.channel, frame, Instant::now())
        {
            // 单帧错误只影响这一帧
            self.metrics.decode_errors.fetch_add(1, Ordering::Relaxed);
            trace!("Dropping undecodable feedback 0x{:03X}: {}", frame.id, e);
        }
    }
}

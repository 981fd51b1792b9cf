//! 通道指标
//!
//! 原子计数器，可在任意线程读取，不引入锁竞争。

use std::sync::atomic::{AtomicU64, Ordering};

/// 单个通道的实时指标
///
/// ```rust
/// use dm_driver::ChannelMetrics;
/// use std::sync::atomic::Ordering;
///
/// let metrics = ChannelMetrics::default();
/// metrics.rx_frames_total.fetch_add(1, Ordering::Relaxed);
/// assert_eq!(metrics.snapshot().rx_frames_total, 1);
/// ```
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    /// RX 接收的总帧数
    pub rx_frames_total: AtomicU64,

    /// 因订阅者处理过慢而丢弃的帧（按订阅者累计）
    pub rx_dropped: AtomicU64,

    /// RX 设备错误次数（不含超时）
    pub rx_errors: AtomicU64,

    /// TX 成功发送的总帧数（一次性 + 周期）
    pub tx_frames_total: AtomicU64,

    /// TX 失败次数
    pub tx_errors: AtomicU64,

    /// 周期发送的触发次数
    pub periodic_ticks: AtomicU64,

    /// 反馈解码失败次数
    pub decode_errors: AtomicU64,
}

impl ChannelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rx_frames_total: self.rx_frames_total.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            rx_errors: self.rx_errors.load(Ordering::Relaxed),
            tx_frames_total: self.tx_frames_total.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
            periodic_ticks: self.periodic_ticks.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

/// 指标快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub rx_frames_total: u64,
    pub rx_dropped: u64,
    pub rx_errors: u64,
    pub tx_frames_total: u64,
    pub tx_errors: u64,
    pub periodic_ticks: u64,
    pub decode_errors: u64,
}

impl MetricsSnapshot {
    /// TX 失败率（%）
    pub fn tx_error_rate(&self) -> f64 {
        let attempts = self.tx_frames_total + self.tx_errors;
        if attempts == 0 {
            return 0.0;
        }
        self.tx_errors as f64 / attempts as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reads_counters() {
        let metrics = ChannelMetrics::new();
        metrics.tx_frames_total.fetch_add(3, Ordering::Relaxed);
        metrics.tx_errors.fetch_add(1, Ordering::Relaxed);
        metrics.rx_dropped.fetch_add(2, Ordering::Relaxed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tx_frames_total, 3);
        assert_eq!(snapshot.rx_dropped, 2);
        assert!((snapshot.tx_error_rate() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_error_rate_without_traffic() {
        assert_eq!(MetricsSnapshot::default().tx_error_rate(), 0.0);
    }
}

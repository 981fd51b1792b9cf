//! CAN 通道
//!
//! 每个通道独占一个已打开的接口，内部有两个线程：
//!
//! - **RX 线程**：读取适配器 → 触发回调（注册表更新）→ 分发给接收订阅者。
//!   订阅者队列有界，满了就丢帧并计数，从不阻塞读取路径。
//! - **周期发送线程**：按到期时间遍历调度表，固定节拍发送。
//!
//! # 调度表
//!
//! 以帧 ID 为键，同一 ID 最多一个周期发送。`update_periodic` 只替换负载，
//! 不改变 `next_due`，因此不会产生节拍空洞。
//!
//! 周期线程在持有调度表锁的情况下发送（锁顺序：调度表 → TX），
//! 所以 `stop_all_periodic()` 返回后不会再有任何周期帧发出，
//! 之后发送的失能帧不会排在旧负载后面。

use crate::config::ChannelConfig;
use crate::error::DriverError;
use crate::hooks::{FrameCallback, HookManager};
use crate::metrics::{ChannelMetrics, MetricsSnapshot};
use crate::registry::ChannelId;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError, bounded};
use dm_can::{CanError, RxAdapter, SplittableAdapter, TxAdapter};
use dm_protocol::DmFrame;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// 进程内所有通道，构建后不再增减
pub type ChannelMap = BTreeMap<ChannelId, Arc<Channel>>;

/// 剩余等待时间小于该值时改用 `spin_sleep` 精确等待
const SPIN_THRESHOLD: Duration = Duration::from_millis(2);

/// 调度表为空时的唤醒周期
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// 关闭时等待线程退出的上限
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// 带超时的线程回收
pub(crate) trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()>;
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()> {
        let (tx, rx) = bounded(1);
        // 由辅助线程阻塞 join，超时后它会在目标线程结束时自行退出
        std::thread::spawn(move || {
            let _ = tx.send(self.join().map(|_| ()));
        });
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Thread join timeout",
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "Thread panicked during join",
            ))),
        }
    }
}

/// 周期发送句柄
///
/// 带代号（generation）：同一 ID 停止后重新启动会得到新的句柄，
/// 旧句柄的更新与停止都不会影响新的调度。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeriodicHandle {
    arbitration_id: u16,
    generation: u64,
}

impl PeriodicHandle {
    pub fn arbitration_id(&self) -> u16 {
        self.arbitration_id
    }
}

struct Slot {
    generation: u64,
    frame: DmFrame,
    period: Duration,
    next_due: Instant,
    failing: bool,
}

#[derive(Default)]
struct ScheduleTable {
    slots: BTreeMap<u16, Slot>,
    next_generation: u64,
}

impl ScheduleTable {
    fn earliest_due(&self) -> Option<Instant> {
        self.slots.values().map(|s| s.next_due).min()
    }

    fn slot_mut(&mut self, handle: &PeriodicHandle) -> Option<&mut Slot> {
        self.slots
            .get_mut(&handle.arbitration_id)
            .filter(|slot| slot.generation == handle.generation)
    }
}

struct Subscriber {
    tx: Sender<DmFrame>,
    dropped: Arc<AtomicU64>,
}

struct ChannelShared {
    id: ChannelId,
    tx: Mutex<Box<dyn TxAdapter + Send>>,
    table: Mutex<ScheduleTable>,
    wake_tx: Sender<()>,
    subscribers: Mutex<Vec<Subscriber>>,
    hooks: RwLock<HookManager>,
    metrics: Arc<ChannelMetrics>,
    is_running: AtomicBool,
    rx_alive: AtomicBool,
    stream_capacity: usize,
}

impl ChannelShared {
    fn transmit(&self, frame: &DmFrame) -> Result<(), CanError> {
        let result = self.tx.lock().send(*frame);
        match &result {
            Ok(()) => {
                self.metrics.tx_frames_total.fetch_add(1, Ordering::Relaxed);
                self.hooks.read().trigger_all_sent(frame);
            },
            Err(_) => {
                self.metrics.tx_errors.fetch_add(1, Ordering::Relaxed);
            },
        }
        result
    }

    fn dispatch(&self, frame: DmFrame) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| match sub.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                sub.dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics.rx_dropped.fetch_add(1, Ordering::Relaxed);
                true
            },
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    fn wake_scheduler(&self) {
        // 容量为 1：已有未处理的唤醒时忽略
        let _ = self.wake_tx.try_send(());
    }
}

/// 接收流
///
/// 按到达顺序产出帧；订阅者处理过慢时丢弃的帧数由 [`FrameStream::dropped`] 给出。
/// 通道关闭后迭代结束。
pub struct FrameStream {
    rx: Receiver<DmFrame>,
    dropped: Arc<AtomicU64>,
}

impl FrameStream {
    pub fn recv_timeout(&self, timeout: Duration) -> Option<DmFrame> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<DmFrame> {
        match self.rx.try_recv() {
            Ok(frame) => Some(frame),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// 丢弃所有已缓冲的帧
    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }

    /// 因处理过慢丢失的帧数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn receiver(&self) -> &Receiver<DmFrame> {
        &self.rx
    }
}

impl Iterator for FrameStream {
    type Item = DmFrame;

    fn next(&mut self) -> Option<DmFrame> {
        self.rx.recv().ok()
    }
}

/// CAN 通道
pub struct Channel {
    shared: Arc<ChannelShared>,
    rx_thread: Mutex<Option<JoinHandle<()>>>,
    periodic_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// 用已打开的适配器创建通道
    pub fn open<A>(id: impl Into<ChannelId>, mut adapter: A, config: &ChannelConfig) -> Result<Self, DriverError>
    where
        A: SplittableAdapter,
    {
        let id = id.into();
        adapter.set_receive_timeout(Duration::from_millis(config.receive_timeout_ms));
        let (rx, tx) = adapter.split()?;
        let (wake_tx, wake_rx) = bounded(1);

        let shared = Arc::new(ChannelShared {
            id: id.clone(),
            tx: Mutex::new(Box::new(tx)),
            table: Mutex::new(ScheduleTable::default()),
            wake_tx,
            subscribers: Mutex::new(Vec::new()),
            hooks: RwLock::new(HookManager::new()),
            metrics: Arc::new(ChannelMetrics::new()),
            is_running: AtomicBool::new(true),
            rx_alive: AtomicBool::new(true),
            stream_capacity: config.stream_capacity.max(1),
        });

        let rx_shared = shared.clone();
        let rx_thread = std::thread::Builder::new()
            .name(format!("dm-rx-{}", id))
            .spawn(move || rx_loop(rx, rx_shared))
            .map_err(|e| DriverError::Bus(CanError::Io(e)))?;

        let periodic_shared = shared.clone();
        let periodic_thread = std::thread::Builder::new()
            .name(format!("dm-periodic-{}", id))
            .spawn(move || periodic_loop(periodic_shared, wake_rx))
            .map_err(|e| DriverError::Bus(CanError::Io(e)))?;

        debug!("Channel {} opened", id);
        Ok(Self {
            shared,
            rx_thread: Mutex::new(Some(rx_thread)),
            periodic_thread: Mutex::new(Some(periodic_thread)),
        })
    }

    pub fn id(&self) -> &ChannelId {
        &self.shared.id
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_running.load(Ordering::Acquire)
    }

    /// RX 线程是否仍在运行（致命设备错误后会退出）
    pub fn is_receiving(&self) -> bool {
        self.shared.rx_alive.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> Arc<ChannelMetrics> {
        self.shared.metrics.clone()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn add_callback(&self, callback: Arc<dyn FrameCallback>) {
        self.shared.hooks.write().add_callback(callback);
    }

    /// 一次性发送
    ///
    /// 不足 8 字节的帧在到达适配器前被拒绝；总线错误直接返回，不重试。
    pub fn send(&self, frame: DmFrame) -> Result<(), DriverError> {
        if !self.is_open() {
            return Err(DriverError::ChannelClosed);
        }
        frame.ensure_full()?;
        self.shared.transmit(&frame).map_err(|e| {
            debug!("Send 0x{:03X} on {} failed: {}", frame.id, self.shared.id, e);
            DriverError::Bus(e)
        })?;
        trace!("Sent 0x{:03X} on {}", frame.id, self.shared.id);
        Ok(())
    }

    /// 订阅接收流（从订阅时刻开始的帧）
    pub fn receive_stream(&self) -> FrameStream {
        let (tx, rx) = bounded(self.shared.stream_capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        if self.is_open() {
            self.shared.subscribers.lock().push(Subscriber {
                tx,
                dropped: dropped.clone(),
            });
        }
        FrameStream { rx, dropped }
    }

    /// 开始周期发送，首帧立即发出
    pub fn start_periodic(&self, frame: DmFrame, period: Duration) -> Result<PeriodicHandle, DriverError> {
        if !self.is_open() {
            return Err(DriverError::ChannelClosed);
        }
        frame.ensure_full()?;
        if period.is_zero() {
            return Err(DriverError::InvalidInput("periodic period must be > 0".into()));
        }
        let mut table = self.shared.table.lock();
        if table.slots.contains_key(&frame.id) {
            return Err(DriverError::DuplicateSchedule { id: frame.id });
        }
        table.next_generation += 1;
        let generation = table.next_generation;
        table.slots.insert(
            frame.id,
            Slot {
                generation,
                frame,
                period,
                next_due: Instant::now(),
                failing: false,
            },
        );
        drop(table);
        self.shared.wake_scheduler();
        debug!(
            "Periodic 0x{:03X} started on {} every {:?}",
            frame.id, self.shared.id, period
        );
        Ok(PeriodicHandle {
            arbitration_id: frame.id,
            generation,
        })
    }

    /// 替换周期负载，不改变节拍
    pub fn update_periodic(&self, handle: &PeriodicHandle, frame: DmFrame) -> Result<(), DriverError> {
        frame.ensure_full()?;
        if frame.id != handle.arbitration_id {
            return Err(DriverError::InvalidInput(format!(
                "payload id 0x{:03X} does not match schedule 0x{:03X}",
                frame.id, handle.arbitration_id
            )));
        }
        let mut table = self.shared.table.lock();
        let slot = table
            .slot_mut(handle)
            .ok_or(DriverError::UnknownSchedule {
                id: handle.arbitration_id,
            })?;
        slot.frame = frame;
        Ok(())
    }

    /// 停止周期发送（幂等），返回本次是否真正移除了调度
    pub fn stop_periodic(&self, handle: &PeriodicHandle) -> bool {
        let mut table = self.shared.table.lock();
        if table.slot_mut(handle).is_none() {
            return false;
        }
        table.slots.remove(&handle.arbitration_id);
        debug!(
            "Periodic 0x{:03X} stopped on {}",
            handle.arbitration_id, self.shared.id
        );
        true
    }

    /// 停止所有周期发送，返回被停止的数量
    ///
    /// 返回后不会再有周期帧发出。
    pub fn stop_all_periodic(&self) -> usize {
        let mut table = self.shared.table.lock();
        let count = table.slots.len();
        table.slots.clear();
        if count > 0 {
            debug!("Stopped {} periodic schedule(s) on {}", count, self.shared.id);
        }
        count
    }

    pub fn active_periodic_count(&self) -> usize {
        self.shared.table.lock().slots.len()
    }

    pub fn is_periodic_active(&self, handle: &PeriodicHandle) -> bool {
        self.shared.table.lock().slot_mut(handle).is_some()
    }

    /// 关闭通道：停止所有周期发送、结束接收流并回收线程（幂等）
    pub fn close(&self) {
        self.stop_all_periodic();
        self.shared.is_running.store(false, Ordering::Release);
        self.shared.wake_scheduler();
        // 断开所有订阅者，迭代器随之结束
        self.shared.subscribers.lock().clear();

        for (name, slot) in [("RX", &self.rx_thread), ("periodic", &self.periodic_thread)] {
            if let Some(handle) = slot.lock().take()
                && handle.join_timeout(JOIN_TIMEOUT).is_err()
            {
                error!(
                    "{} thread of channel {} panicked or failed to shut down within {:?}",
                    name, self.shared.id, JOIN_TIMEOUT
                );
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

fn rx_loop(mut rx: impl RxAdapter, shared: Arc<ChannelShared>) {
    loop {
        if !shared.is_running.load(Ordering::Acquire) {
            trace!("RX thread of {}: exiting", shared.id);
            break;
        }

        let frame = match rx.receive() {
            Ok(frame) => frame,
            Err(CanError::Timeout) => continue,
            Err(e) if e.is_fatal() => {
                shared.metrics.rx_errors.fetch_add(1, Ordering::Relaxed);
                error!("RX on {} stopped: {}", shared.id, e);
                break;
            },
            Err(e) => {
                shared.metrics.rx_errors.fetch_add(1, Ordering::Relaxed);
                warn!("RX error on {}: {}", shared.id, e);
                continue;
            },
        };

        shared.metrics.rx_frames_total.fetch_add(1, Ordering::Relaxed);
        shared.hooks.read().trigger_all(&frame);
        shared.dispatch(frame);
    }
    shared.rx_alive.store(false, Ordering::Release);
}

fn periodic_loop(shared: Arc<ChannelShared>, wake_rx: Receiver<()>) {
    loop {
        if !shared.is_running.load(Ordering::Acquire) {
            break;
        }

        let next_due = {
            let mut table = shared.table.lock();
            let now = Instant::now();
            for (id, slot) in table.slots.iter_mut() {
                if slot.next_due > now {
                    continue;
                }
                match shared.transmit(&slot.frame) {
                    Ok(()) => {
                        shared.metrics.periodic_ticks.fetch_add(1, Ordering::Relaxed);
                        if slot.failing {
                            debug!("Periodic 0x{:03X} on {} recovered", id, shared.id);
                            slot.failing = false;
                        }
                    },
                    Err(e) => {
                        // 每次进入失败状态只报一次
                        if !slot.failing {
                            warn!("Periodic 0x{:03X} on {} failed: {}", id, shared.id, e);
                            slot.failing = true;
                        }
                    },
                }
                slot.next_due += slot.period;
                if slot.next_due <= now {
                    // 落后超过一个周期才重新对齐
                    slot.next_due = now + slot.period;
                }
            }
            table.earliest_due()
        };

        let wait = match next_due {
            Some(due) => due.saturating_duration_since(Instant::now()),
            None => IDLE_WAIT,
        };
        if wait.is_zero() {
            continue;
        }
        if wait > SPIN_THRESHOLD {
            match wake_rx.recv_timeout(wait - SPIN_THRESHOLD) {
                Ok(()) => continue,
                Err(RecvTimeoutError::Timeout) => {},
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if let Some(due) = next_due {
                spin_sleep::sleep(due.saturating_duration_since(Instant::now()));
            }
        } else {
            spin_sleep::sleep(wait);
        }
    }
    trace!("Periodic thread of {}: exiting", shared.id);
}

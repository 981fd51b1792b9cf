//! 内存 CAN 总线（无硬件依赖）
//!
//! `MockBus` 记录所有发出的帧，并可挂载一个响应器模拟总线上的电机：
//! 每发送一帧，响应器返回的帧会被注入到接收端。

use crate::{CanAdapter, CanError, DmFrame, RxAdapter, SplittableAdapter, TxAdapter};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

type Responder = Box<dyn FnMut(&DmFrame) -> Vec<DmFrame> + Send>;

/// 模拟的发送失败
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    NoBufferSpace,
    DeviceDown,
    FrameRejected,
}

impl MockFailure {
    fn to_error(self) -> CanError {
        match self {
            MockFailure::NoBufferSpace => CanError::NoBufferSpace,
            MockFailure::DeviceDown => CanError::DeviceDown,
            MockFailure::FrameRejected => CanError::FrameRejected("mock".into()),
        }
    }
}

struct MockBusInner {
    inject_tx: Sender<DmFrame>,
    inject_rx: Receiver<DmFrame>,
    sent: Mutex<Vec<DmFrame>>,
    responder: Mutex<Option<Responder>>,
    failure: Mutex<Option<MockFailure>>,
}

/// 共享的内存总线句柄
#[derive(Clone)]
pub struct MockBus {
    inner: Arc<MockBusInner>,
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBus {
    pub fn new() -> Self {
        let (inject_tx, inject_rx) = unbounded();
        Self {
            inner: Arc::new(MockBusInner {
                inject_tx,
                inject_rx,
                sent: Mutex::new(Vec::new()),
                responder: Mutex::new(None),
                failure: Mutex::new(None),
            }),
        }
    }

    /// 创建挂在该总线上的适配器
    pub fn adapter(&self) -> MockCanAdapter {
        MockCanAdapter {
            bus: self.clone(),
            timeout: Duration::from_millis(2),
        }
    }

    /// 模拟一帧从总线到达
    pub fn inject(&self, frame: DmFrame) {
        let _ = self.inner.inject_tx.send(frame);
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&DmFrame) -> Vec<DmFrame> + Send + 'static,
    {
        *self.inner.responder.lock() = Some(Box::new(responder));
    }

    pub fn clear_responder(&self) {
        *self.inner.responder.lock() = None;
    }

    /// 之后的发送都返回给定错误；`None` 恢复正常
    pub fn fail_sends(&self, failure: Option<MockFailure>) {
        *self.inner.failure.lock() = failure;
    }

    /// 已成功发出的帧（按发送顺序）
    pub fn sent_frames(&self) -> Vec<DmFrame> {
        self.inner.sent.lock().clone()
    }

    pub fn sent_with_id(&self, id: u16) -> Vec<DmFrame> {
        self.inner
            .sent
            .lock()
            .iter()
            .filter(|f| f.id == id)
            .copied()
            .collect()
    }

    pub fn clear_sent(&self) {
        self.inner.sent.lock().clear();
    }

    fn transmit(&self, frame: DmFrame) -> Result<(), CanError> {
        if let Some(failure) = *self.inner.failure.lock() {
            return Err(failure.to_error());
        }
        self.inner.sent.lock().push(frame);
        let replies = match self.inner.responder.lock().as_mut() {
            Some(responder) => responder(&frame),
            None => Vec::new(),
        };
        for reply in replies {
            self.inject(reply);
        }
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<DmFrame, CanError> {
        match self.inner.inject_rx.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(CanError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(CanError::DeviceDown),
        }
    }
}

/// 未拆分的 mock 适配器
pub struct MockCanAdapter {
    bus: MockBus,
    timeout: Duration,
}

impl CanAdapter for MockCanAdapter {
    fn send(&mut self, frame: DmFrame) -> Result<(), CanError> {
        self.bus.transmit(frame)
    }

    fn receive(&mut self) -> Result<DmFrame, CanError> {
        self.bus.receive(self.timeout)
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

impl SplittableAdapter for MockCanAdapter {
    type RxAdapter = MockRxAdapter;
    type TxAdapter = MockTxAdapter;

    fn split(self) -> Result<(Self::RxAdapter, Self::TxAdapter), CanError> {
        Ok((
            MockRxAdapter {
                bus: self.bus.clone(),
                timeout: self.timeout,
            },
            MockTxAdapter { bus: self.bus },
        ))
    }
}

pub struct MockRxAdapter {
    bus: MockBus,
    timeout: Duration,
}

impl RxAdapter for MockRxAdapter {
    fn receive(&mut self) -> Result<DmFrame, CanError> {
        self.bus.receive(self.timeout)
    }
}

pub struct MockTxAdapter {
    bus: MockBus,
}

impl TxAdapter for MockTxAdapter {
    fn send(&mut self, frame: DmFrame) -> Result<(), CanError> {
        self.bus.transmit(frame)
    }
}

//! # DM CAN Adapter Layer
//!
//! CAN 硬件抽象层：`CanAdapter` / `SplittableAdapter` trait、
//! Linux SocketCAN 后端，以及用于测试的内存总线（`mock` feature）。

use std::time::Duration;
use thiserror::Error;

pub use dm_protocol::DmFrame;

#[cfg(target_os = "linux")]
pub mod socketcan;

#[cfg(target_os = "linux")]
pub use socketcan::SocketCanAdapter;

#[cfg(target_os = "linux")]
pub use socketcan::split::{SocketCanRxAdapter, SocketCanTxAdapter};

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockBus, MockCanAdapter, MockFailure, MockRxAdapter, MockTxAdapter};

/// CAN 适配层统一错误类型
///
/// `NoBufferSpace` / `DeviceDown` / `FrameRejected` 是总线层面的发送失败，
/// 由调用方决定是否重试，适配层不做静默重试。
#[derive(Error, Debug)]
pub enum CanError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Device Error: {0}")]
    Device(#[from] CanDeviceError),
    #[error("Read timeout")]
    Timeout,
    /// 发送队列已满或无 ACK（总线未连接时常见）
    #[error("No buffer space (TX queue saturated or frame not acknowledged)")]
    NoBufferSpace,
    #[error("CAN device is down")]
    DeviceDown,
    #[error("Frame rejected: {0}")]
    FrameRejected(String),
    #[error("Device not started")]
    NotStarted,
}

impl CanError {
    /// 是否属于总线发送失败（调用方可按策略重试）
    pub fn is_bus_error(&self) -> bool {
        matches!(
            self,
            CanError::NoBufferSpace | CanError::DeviceDown | CanError::FrameRejected(_)
        )
    }

    /// 是否为不可恢复错误（需要重新打开接口）
    pub fn is_fatal(&self) -> bool {
        match self {
            CanError::DeviceDown | CanError::NotStarted => true,
            CanError::Device(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// 将发送路径上的系统错误映射到总线错误类别
    pub fn from_send_io(err: std::io::Error) -> Self {
        #[cfg(target_os = "linux")]
        {
            match err.raw_os_error() {
                Some(libc::ENOBUFS) | Some(libc::EAGAIN) => return CanError::NoBufferSpace,
                Some(libc::ENETDOWN) | Some(libc::ENODEV) | Some(libc::ENXIO) => {
                    return CanError::DeviceDown;
                },
                Some(libc::EINVAL) | Some(libc::EMSGSIZE) => {
                    return CanError::FrameRejected(err.to_string());
                },
                _ => {},
            }
        }
        CanError::Io(err)
    }
}

/// 设备/后端错误的结构化分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanDeviceErrorKind {
    Unknown,
    NotFound,
    NoDevice,
    AccessDenied,
    InvalidFrame,
    Backend,
}

/// 结构化设备错误
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct CanDeviceError {
    pub kind: CanDeviceErrorKind,
    pub message: String,
}

impl CanDeviceError {
    pub fn new(kind: CanDeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            CanDeviceErrorKind::NoDevice
                | CanDeviceErrorKind::AccessDenied
                | CanDeviceErrorKind::NotFound
        )
    }
}

impl From<String> for CanDeviceError {
    fn from(message: String) -> Self {
        Self::new(CanDeviceErrorKind::Unknown, message)
    }
}

impl From<&str> for CanDeviceError {
    fn from(message: &str) -> Self {
        Self::new(CanDeviceErrorKind::Unknown, message)
    }
}

pub trait CanAdapter {
    fn send(&mut self, frame: DmFrame) -> Result<(), CanError>;
    fn receive(&mut self) -> Result<DmFrame, CanError>;
    fn set_receive_timeout(&mut self, _timeout: Duration) {}
    fn receive_timeout(&mut self, timeout: Duration) -> Result<DmFrame, CanError> {
        self.set_receive_timeout(timeout);
        self.receive()
    }
    fn try_receive(&mut self) -> Result<Option<DmFrame>, CanError> {
        match self.receive_timeout(Duration::ZERO) {
            Ok(frame) => Ok(Some(frame)),
            Err(CanError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// 只读半边（RX 线程持有）
///
/// `receive` 必须在读超时后返回 `CanError::Timeout`，以便线程检查退出标志。
pub trait RxAdapter {
    fn receive(&mut self) -> Result<DmFrame, CanError>;
}

/// 只写半边（TX 路径持有）
pub trait TxAdapter {
    fn send(&mut self, frame: DmFrame) -> Result<(), CanError>;
}

pub trait SplittableAdapter: CanAdapter {
    type RxAdapter: RxAdapter + Send + 'static;
    type TxAdapter: TxAdapter + Send + 'static;
    fn split(self) -> Result<(Self::RxAdapter, Self::TxAdapter), CanError>;
}

//! SocketCAN CAN 适配器实现
//!
//! ## 特性
//!
//! - 基于 Linux SocketCAN 子系统
//! - 仅处理 11-bit 标准帧（达妙电机只使用标准帧），扩展帧与错误帧被丢弃
//! - 禁用 loopback：本机发出的 0x7FF 管理帧不会回环到接收端，
//!   否则会被误认为电机的写入应答
//! - 可选硬件过滤器（MST_ID 列表 + 0x7FF）
//!
//! ## 限制
//!
//! - **仅限 Linux 平台**
//! - **接口配置**：波特率等由 `ip link` 完成，不在应用层设置

use crate::{CanAdapter, CanDeviceError, CanDeviceErrorKind, CanError, DmFrame, SplittableAdapter};
use dm_protocol::ID_MANAGEMENT;
use socketcan::{
    CanFilter, CanFrame, CanSocket, EmbeddedFrame, Frame, Socket, SocketOptions, StandardId,
};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{trace, warn};

mod interface_check;
pub mod split;

use interface_check::{InterfaceState, interface_state};
pub use split::{SocketCanRxAdapter, SocketCanTxAdapter};

/// 默认读超时，与 RX 线程的退出检查周期一致
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(2);

/// SocketCAN 适配器
pub struct SocketCanAdapter {
    socket: CanSocket,
    interface: String,
    read_timeout: Duration,
}

impl SocketCanAdapter {
    /// 打开已启动（UP）的 CAN 接口
    ///
    /// ```no_run
    /// use dm_can::SocketCanAdapter;
    ///
    /// let adapter = SocketCanAdapter::new("can0").unwrap();
    /// ```
    pub fn new(interface: impl Into<String>) -> Result<Self, CanError> {
        let interface = interface.into();

        // 只检查，不自动配置
        if interface_state(&interface)? == InterfaceState::Down {
            return Err(CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::NoDevice,
                format!(
                    "CAN interface '{}' exists but is not UP. Please start it first:\n  sudo ip link set up {}",
                    interface, interface
                ),
            )));
        }

        let socket = CanSocket::open(&interface).map_err(|e| {
            CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::Backend,
                format!("Failed to open CAN interface '{}': {}", interface, e),
            ))
        })?;

        let loopback_enabled: libc::c_int = 0;
        let loopback_result = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_CAN_RAW,
                libc::CAN_RAW_LOOPBACK,
                &loopback_enabled as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if loopback_result < 0 {
            // 某些虚拟接口不支持该选项，不阻塞初始化
            warn!(
                "Failed to disable CAN_RAW_LOOPBACK on '{}': {}",
                interface,
                std::io::Error::last_os_error()
            );
        } else {
            trace!("SocketCAN interface '{}' loopback disabled", interface);
        }

        socket.set_read_timeout(DEFAULT_READ_TIMEOUT).map_err(CanError::Io)?;

        Ok(Self {
            socket,
            interface,
            read_timeout: DEFAULT_READ_TIMEOUT,
        })
    }

    /// 只接收给定 MST_ID 与 0x7FF 管理应答
    pub fn with_feedback_filters(self, master_ids: &[u16]) -> Result<Self, CanError> {
        let filters = build_filters(master_ids);
        self.socket.set_filters(&filters).map_err(|e| {
            CanError::Io(std::io::Error::other(format!(
                "Failed to set hardware filters: {}",
                e
            )))
        })?;
        trace!(
            "SocketCAN '{}' hardware filters configured: {} IDs",
            self.interface,
            filters.len()
        );
        Ok(self)
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), CanError> {
        self.socket.set_read_timeout(timeout).map_err(CanError::Io)?;
        self.read_timeout = timeout;
        Ok(())
    }
}

/// 精确匹配过滤器：每个 MST_ID 一条，外加 0x7FF
pub fn build_filters(master_ids: &[u16]) -> Vec<CanFilter> {
    let mut ids: Vec<u16> = master_ids.to_vec();
    ids.push(ID_MANAGEMENT);
    ids.sort_unstable();
    ids.dedup();
    ids.into_iter()
        .map(|id| CanFilter::new(id as u32, 0x7FF))
        .collect()
}

pub(crate) fn to_can_frame(frame: &DmFrame) -> Result<CanFrame, CanError> {
    StandardId::new(frame.id)
        .and_then(|id| CanFrame::new(id, frame.data_slice()))
        .ok_or_else(|| CanError::FrameRejected(format!("invalid standard frame ID 0x{:X}", frame.id)))
}

/// 转换接收帧；扩展帧与错误帧返回 `None`
pub(crate) fn from_can_frame(frame: &CanFrame) -> Option<DmFrame> {
    if frame.is_error_frame() {
        warn!("CAN error frame received: raw_id=0x{:X}", frame.raw_id());
        return None;
    }
    if frame.is_extended() {
        trace!("Ignoring extended frame 0x{:X}", frame.raw_id());
        return None;
    }
    let timestamp_us = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    let mut dm_frame = DmFrame::new_standard(frame.raw_id() as u16, frame.data());
    dm_frame.len = frame.dlc().min(8) as u8;
    Some(dm_frame.with_timestamp(timestamp_us))
}

pub(crate) fn map_receive_error(err: std::io::Error) -> CanError {
    match err.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => CanError::Timeout,
        _ => match err.raw_os_error() {
            Some(libc::ENETDOWN) | Some(libc::ENODEV) => CanError::DeviceDown,
            _ => CanError::Io(err),
        },
    }
}

pub(crate) fn receive_frame(socket: &CanSocket) -> Result<DmFrame, CanError> {
    let frame = socket.read_frame().map_err(map_receive_error)?;
    // 被丢弃的帧按超时处理，由调用方重新读取
    from_can_frame(&frame).ok_or(CanError::Timeout)
}

pub(crate) fn send_frame(socket: &CanSocket, frame: &DmFrame) -> Result<(), CanError> {
    let can_frame = to_can_frame(frame)?;
    socket.write_frame(&can_frame).map_err(CanError::from_send_io)?;
    trace!("Sent CAN frame: ID=0x{:03X}, len={}", frame.id, frame.len);
    Ok(())
}

impl CanAdapter for SocketCanAdapter {
    fn send(&mut self, frame: DmFrame) -> Result<(), CanError> {
        send_frame(&self.socket, &frame)
    }

    fn receive(&mut self) -> Result<DmFrame, CanError> {
        receive_frame(&self.socket)
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        if let Err(e) = self.set_read_timeout(timeout) {
            warn!("Failed to set receive timeout on '{}': {}", self.interface, e);
        }
    }
}

impl SplittableAdapter for SocketCanAdapter {
    type RxAdapter = SocketCanRxAdapter;
    type TxAdapter = SocketCanTxAdapter;

    /// 通过 `try_clone()`（dup）拆分为独立的 RX / TX 半边
    fn split(self) -> Result<(Self::RxAdapter, Self::TxAdapter), CanError> {
        let rx = SocketCanRxAdapter::new(&self.socket, self.read_timeout)?;
        let tx = SocketCanTxAdapter::new(&self.socket)?;
        trace!("SocketCanAdapter split into RX and TX adapters ({})", self.interface);
        Ok((rx, tx))
    }
}

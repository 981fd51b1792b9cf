//! SocketCAN 读写分离适配器
//!
//! RX / TX 半边各持有一份 `dup()` 出来的 socket。过滤器作用在底层打开的
//! socket 上，因此在拆分前设置一次即可；RX 的读超时通过 `SO_RCVTIMEO` 设置。

use super::{receive_frame, send_frame};
use crate::{CanError, DmFrame, RxAdapter, TxAdapter};
use socketcan::{CanSocket, Socket};
use std::os::fd::AsFd;
use std::time::Duration;

fn dup_socket(socket: &CanSocket, half: &str) -> Result<CanSocket, CanError> {
    socket.as_fd().try_clone_to_owned().map(CanSocket::from).map_err(|e| {
        CanError::Io(std::io::Error::new(
            e.kind(),
            format!("dup() of CAN socket for {} half failed: {}", half, e),
        ))
    })
}

/// 接收半边，由通道的 RX 线程独占
pub struct SocketCanRxAdapter {
    socket: CanSocket,
    read_timeout: Duration,
}

impl SocketCanRxAdapter {
    pub(super) fn new(socket: &CanSocket, read_timeout: Duration) -> Result<Self, CanError> {
        let socket = dup_socket(socket, "RX")?;
        socket.set_read_timeout(read_timeout)?;
        Ok(Self { socket, read_timeout })
    }

    /// 单次 `receive()` 的最长阻塞时间
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }
}

impl RxAdapter for SocketCanRxAdapter {
    fn receive(&mut self) -> Result<DmFrame, CanError> {
        receive_frame(&self.socket)
    }
}

/// 发送半边，由通道的发送锁保护
pub struct SocketCanTxAdapter {
    socket: CanSocket,
}

impl SocketCanTxAdapter {
    pub(super) fn new(socket: &CanSocket) -> Result<Self, CanError> {
        Ok(Self {
            socket: dup_socket(socket, "TX")?,
        })
    }
}

impl TxAdapter for SocketCanTxAdapter {
    fn send(&mut self, frame: DmFrame) -> Result<(), CanError> {
        send_frame(&self.socket, &frame)
    }
}

//! 参数管理事务（0x7FF 请求 / 应答）
//!
//! 电机在 0x7FF 上以与请求相同的布局应答。先订阅接收流再发送请求，
//! 保证应答不会在订阅之前到达而丢失。

use crate::channel::{Channel, FrameStream};
use crate::error::DriverError;
use dm_protocol::{
    DmFrame, ID_MANAGEMENT, ManagementResponse, Rid, encode_rid_read, encode_rid_refresh,
    encode_rid_save, encode_rid_write, encode_rid_write_f32,
};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// 在已订阅的流上等待与请求匹配的应答
pub(crate) fn await_response(
    stream: &FrameStream,
    expected: &ManagementResponse,
    timeout: Duration,
) -> Result<ManagementResponse, DriverError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DriverError::Timeout);
        }
        let Some(frame) = stream.recv_timeout(remaining) else {
            return Err(DriverError::Timeout);
        };
        if frame.id != ID_MANAGEMENT {
            continue;
        }
        match ManagementResponse::try_from(frame) {
            Ok(response) if response.acknowledges(expected) => return Ok(response),
            Ok(other) => trace!("Ignoring management frame {:?}", other),
            Err(e) => trace!("Ignoring malformed management frame: {}", e),
        }
    }
}

/// 发送管理请求并等待应答
pub fn transact(
    channel: &Channel,
    request: DmFrame,
    timeout: Duration,
) -> Result<ManagementResponse, DriverError> {
    let expected = ManagementResponse::try_from(request)?;
    let stream = channel.receive_stream();
    channel.send(request)?;
    let response = await_response(&stream, &expected, timeout)?;
    debug!(
        "Management {:?} {:?} on ESC 0x{:02X} answered: 0x{:08X}",
        response.command, response.rid, response.esc_id, response.value
    );
    Ok(response)
}

/// 读整型寄存器
pub fn read_rid(channel: &Channel, esc_id: u8, rid: Rid, timeout: Duration) -> Result<u32, DriverError> {
    transact(channel, encode_rid_read(esc_id, rid)?, timeout).map(|r| r.value)
}

/// 读浮点寄存器
pub fn read_rid_f32(channel: &Channel, esc_id: u8, rid: Rid, timeout: Duration) -> Result<f32, DriverError> {
    transact(channel, encode_rid_read(esc_id, rid)?, timeout).map(|r| r.value_f32())
}

/// 写寄存器并等待回显
pub fn write_rid(
    channel: &Channel,
    esc_id: u8,
    rid: Rid,
    value: u32,
    timeout: Duration,
) -> Result<ManagementResponse, DriverError> {
    transact(channel, encode_rid_write(esc_id, rid, value)?, timeout)
}

pub fn write_rid_f32(
    channel: &Channel,
    esc_id: u8,
    rid: Rid,
    value: f32,
    timeout: Duration,
) -> Result<ManagementResponse, DriverError> {
    transact(channel, encode_rid_write_f32(esc_id, rid, value)?, timeout)
}

/// 保存参数并等待应答
pub fn save(channel: &Channel, esc_id: u8, timeout: Duration) -> Result<(), DriverError> {
    transact(channel, encode_rid_save(esc_id)?, timeout).map(|_| ())
}

/// 请求刷新（电机回一帧反馈，不等待）
pub fn refresh(channel: &Channel, esc_id: u8) -> Result<(), DriverError> {
    channel.send(encode_rid_refresh(esc_id)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use dm_can::MockBus;

    fn echo_bus() -> MockBus {
        let bus = MockBus::new();
        bus.set_responder(|frame| {
            if frame.id != ID_MANAGEMENT {
                return Vec::new();
            }
            let mut reply = *frame;
            if frame.data[2] == 0x33 {
                // 读应答：CTRL_MODE = 3（速度）
                reply.data[4..8].copy_from_slice(&3u32.to_le_bytes());
            }
            vec![reply]
        });
        bus
    }

    #[test]
    fn test_read_rid_returns_value() {
        let bus = echo_bus();
        let channel = Channel::open("can0", bus.adapter(), &ChannelConfig::default()).unwrap();
        let value = read_rid(&channel, 1, Rid::ControlMode, Duration::from_millis(200)).unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn test_write_rid_acknowledged() {
        let bus = echo_bus();
        let channel = Channel::open("can0", bus.adapter(), &ChannelConfig::default()).unwrap();
        let ack = write_rid(&channel, 1, Rid::EscId, 2, Duration::from_millis(200)).unwrap();
        assert_eq!(ack.rid, Some(Rid::EscId));
        assert_eq!(ack.value, 2);
    }

    #[test]
    fn test_transact_times_out_without_reply() {
        let bus = MockBus::new();
        let channel = Channel::open("can0", bus.adapter(), &ChannelConfig::default()).unwrap();
        assert!(matches!(
            save(&channel, 1, Duration::from_millis(20)),
            Err(DriverError::Timeout)
        ));
        assert_eq!(bus.sent_with_id(ID_MANAGEMENT).len(), 1);
    }

    #[test]
    fn test_mismatched_reply_is_ignored() {
        let bus = MockBus::new();
        bus.set_responder(|frame| {
            let mut reply = *frame;
            reply.data[0] = 0x05; // 其他电机
            vec![reply]
        });
        let channel = Channel::open("can0", bus.adapter(), &ChannelConfig::default()).unwrap();
        assert!(matches!(
            write_rid(&channel, 1, Rid::MasterId, 0x11, Duration::from_millis(20)),
            Err(DriverError::Timeout)
        ));
    }
}

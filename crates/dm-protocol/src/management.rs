//! 参数管理帧（0x7FF）
//!
//! 请求与应答共用同一布局：
//!
//! ```text
//! Byte 0-1: ESC_ID（小端）
//! Byte 2:   命令（0x33 读 / 0x55 写 / 0xAA 保存 / 0xCC 刷新）
//! Byte 3:   RID
//! Byte 4-7: 值（小端 u32，浮点寄存器为 f32 位模式）
//! ```
//!
//! 电机收到读/写请求后在 0x7FF 上以相同布局应答，应答即为写入确认。

use crate::ids::{ID_MANAGEMENT, validate_esc_id};
use crate::{DmFrame, ProtocolError};

/// 管理命令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum ManagementCommand {
    Read = 0x33,
    Write = 0x55,
    Save = 0xAA,
    Refresh = 0xCC,
}

/// 核心使用的寄存器编号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Rid {
    /// 反馈 ID（MST_ID）
    MasterId = 0x07,
    /// 接收 ID（ESC_ID）
    EscId = 0x08,
    /// 控制模式
    ControlMode = 0x0A,
    /// 位置映射范围
    PMax = 0x15,
    /// 速度映射范围
    VMax = 0x16,
    /// 力矩映射范围
    TMax = 0x17,
}

impl Rid {
    /// 该寄存器是否以 f32 存储
    pub fn is_float(self) -> bool {
        matches!(self, Rid::PMax | Rid::VMax | Rid::TMax)
    }
}

fn management_frame(
    esc_id: u8,
    command: ManagementCommand,
    rid: u8,
    value: u32,
) -> Result<DmFrame, ProtocolError> {
    let esc = validate_esc_id(esc_id)? as u16;
    let [esc_lo, esc_hi] = esc.to_le_bytes();
    let [v0, v1, v2, v3] = value.to_le_bytes();
    Ok(DmFrame::full(
        ID_MANAGEMENT,
        [esc_lo, esc_hi, command as u8, rid, v0, v1, v2, v3],
    ))
}

/// 读寄存器
pub fn encode_rid_read(esc_id: u8, rid: Rid) -> Result<DmFrame, ProtocolError> {
    management_frame(esc_id, ManagementCommand::Read, rid as u8, 0)
}

/// 写寄存器（整型）
pub fn encode_rid_write(esc_id: u8, rid: Rid, value: u32) -> Result<DmFrame, ProtocolError> {
    management_frame(esc_id, ManagementCommand::Write, rid as u8, value)
}

/// 写寄存器（浮点）
pub fn encode_rid_write_f32(esc_id: u8, rid: Rid, value: f32) -> Result<DmFrame, ProtocolError> {
    if !value.is_finite() {
        return Err(ProtocolError::OutOfRange {
            field: "rid value",
            value,
            min: f32::MIN,
            max: f32::MAX,
        });
    }
    encode_rid_write(esc_id, rid, value.to_bits())
}

/// 保存参数到电机 Flash（命令字 0xAA）
pub fn encode_rid_save(esc_id: u8) -> Result<DmFrame, ProtocolError> {
    management_frame(esc_id, ManagementCommand::Save, 0, 0)
}

/// 刷新电机状态（触发一帧反馈）
pub fn encode_rid_refresh(esc_id: u8) -> Result<DmFrame, ProtocolError> {
    management_frame(esc_id, ManagementCommand::Refresh, 0, 0)
}

/// 0x7FF 上的应答
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagementResponse {
    pub esc_id: u16,
    pub command: ManagementCommand,
    /// 保存 / 刷新应答不携带 RID
    pub rid: Option<Rid>,
    pub value: u32,
}

impl ManagementResponse {
    pub fn value_f32(&self) -> f32 {
        f32::from_bits(self.value)
    }

    /// 判断该应答是否对应给定请求（同一 ESC_ID、命令与 RID）
    pub fn acknowledges(&self, request: &ManagementResponse) -> bool {
        self.esc_id == request.esc_id && self.command == request.command && self.rid == request.rid
    }
}

impl TryFrom<DmFrame> for ManagementResponse {
    type Error = ProtocolError;

    fn try_from(frame: DmFrame) -> Result<Self, Self::Error> {
        if frame.id != ID_MANAGEMENT {
            return Err(ProtocolError::UnexpectedId { id: frame.id });
        }
        if frame.len != 8 {
            return Err(ProtocolError::UnknownLayout { dlc: frame.len });
        }
        let d = frame.data;
        let command = ManagementCommand::try_from(d[2]).map_err(|_| ProtocolError::InvalidValue {
            field: "management command",
            value: d[2] as u32,
        })?;
        let rid = match command {
            ManagementCommand::Read | ManagementCommand::Write => {
                Some(Rid::try_from(d[3]).map_err(|_| ProtocolError::UnknownRid(d[3]))?)
            },
            ManagementCommand::Save | ManagementCommand::Refresh => None,
        };
        Ok(Self {
            esc_id: u16::from_le_bytes([d[0], d[1]]),
            command,
            rid,
            value: u32::from_le_bytes([d[4], d[5], d[6], d[7]]),
        })
    }
}

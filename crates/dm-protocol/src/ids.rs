//! CAN ID 常量定义
//!
//! 达妙电机的命令 ID 由“基址 + ESC_ID”组成，反馈帧使用电机的 MST_ID。

use crate::ProtocolError;

/// 位置速度模式命令基址
pub const ID_POS_VEL_BASE: u16 = 0x100;

/// 速度模式命令基址（使能/失能/置零哨兵帧也使用该基址）
pub const ID_VELOCITY_BASE: u16 = 0x200;

/// MIT 模式命令基址
pub const ID_MIT_BASE: u16 = 0x300;

/// 参数管理帧（RID 读/写/保存/刷新）
pub const ID_MANAGEMENT: u16 = 0x7FF;

/// 约定：MST_ID = ESC_ID + 0x10
pub const MASTER_ID_OFFSET: u16 = 0x10;

/// 最大 ESC_ID
pub const MAX_ESC_ID: u8 = 127;

/// 校验 ESC_ID（0..=127）
pub fn validate_esc_id(esc_id: u8) -> Result<u8, ProtocolError> {
    if esc_id > MAX_ESC_ID {
        return Err(ProtocolError::InvalidIdentity {
            esc_id: esc_id as u16,
        });
    }
    Ok(esc_id)
}

/// 按约定由 ESC_ID 推算 MST_ID
pub fn master_id_for(esc_id: u8) -> u16 {
    esc_id as u16 + MASTER_ID_OFFSET
}

/// 按约定由 MST_ID 反推 ESC_ID；不符合约定时返回 `None`
pub fn esc_id_from_master(master_id: u16) -> Option<u8> {
    let esc = master_id.checked_sub(MASTER_ID_OFFSET)?;
    if esc > MAX_ESC_ID as u16 {
        return None;
    }
    Some(esc as u8)
}

/// 命令帧 ID = 基址 + ESC_ID
pub fn command_id(base: u16, esc_id: u8) -> Result<u16, ProtocolError> {
    Ok(base + validate_esc_id(esc_id)? as u16)
}

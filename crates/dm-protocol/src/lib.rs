//! # DM Protocol
//!
//! 达妙（DM）关节电机 CAN 总线协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `ids`: CAN ID 常量与 ESC_ID / MST_ID 换算
//! - `control`: 控制帧构建（使能/失能/置零、速度、位置速度、MIT）
//! - `feedback`: 反馈帧解析
//! - `management`: 0x7FF 参数（RID）读写帧
//!
//! ## 字节序
//!
//! 浮点型命令（速度、位置速度、RID 浮点值）为小端 IEEE-754；
//! MIT 位域与反馈帧为高位在前的紧凑位打包。

pub mod control;
pub mod feedback;
pub mod ids;
pub mod management;

// 重新导出常用类型
pub use control::*;
pub use feedback::*;
pub use ids::*;
pub use management::*;

use thiserror::Error;

/// CAN 2.0 标准帧
///
/// 协议层与硬件层之间的中间抽象：协议层只构建/解析 `DmFrame`，
/// 具体的 SocketCAN 或 mock 转换在 `dm-can` 中实现。
///
/// - **Copy**：固定 8 字节，无堆分配
/// - **`len`**：有效数据长度。电机会静默丢弃短于 8 字节的命令帧，
///   因此发送路径会拒绝 `len < 8` 的帧（见 [`DmFrame::ensure_full`]）
/// - **`timestamp_us`**：接收时间戳（微秒），0 表示不可用
///
/// ```rust
/// use dm_protocol::DmFrame;
///
/// let frame = DmFrame::new_standard(0x201, &[0xFF; 8]);
/// assert_eq!(frame.id(), 0x201);
/// assert!(frame.ensure_full().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DmFrame {
    /// 11-bit 标准帧 ID
    pub id: u16,

    /// 帧数据（固定 8 字节，未使用部分为 0）
    pub data: [u8; 8],

    /// 有效数据长度 (0-8)
    pub len: u8,

    /// 时间戳（微秒），0 表示不可用
    pub timestamp_us: u64,
}

impl DmFrame {
    /// 创建标准帧，超过 8 字节的部分被截断
    pub fn new_standard(id: u16, data: &[u8]) -> Self {
        let mut fixed_data = [0u8; 8];
        let len = data.len().min(8);
        fixed_data[..len].copy_from_slice(&data[..len]);

        Self {
            id: id & STANDARD_ID_MASK,
            data: fixed_data,
            len: len as u8,
            timestamp_us: 0,
        }
    }

    /// 创建 8 字节满长度帧（所有命令帧都通过此构造器生成）
    pub fn full(id: u16, data: [u8; 8]) -> Self {
        Self {
            id: id & STANDARD_ID_MASK,
            data,
            len: 8,
            timestamp_us: 0,
        }
    }

    /// 附加接收时间戳
    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    /// 获取数据切片（只包含有效数据）
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// 获取 CAN ID
    pub fn id(&self) -> u16 {
        self.id
    }

    /// 命令帧必须是 8 字节
    pub fn ensure_full(&self) -> Result<(), ProtocolError> {
        if self.len < 8 {
            return Err(ProtocolError::ShortFrame { len: self.len });
        }
        Ok(())
    }
}

/// 11-bit 标准帧 ID 掩码
pub const STANDARD_ID_MASK: u16 = 0x7FF;

/// 协议错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// 命令帧不足 8 字节（硬件会静默忽略）
    #[error("Short frame: command frames need 8 data bytes, got {len}")]
    ShortFrame { len: u8 },

    /// 反馈帧 DLC 不是 8
    #[error("Unknown frame layout: DLC {dlc}, expected 8")]
    UnknownLayout { dlc: u8 },

    #[error("Invalid motor identity: esc_id {esc_id} (valid range 0..={max})", max = ids::MAX_ESC_ID)]
    InvalidIdentity { esc_id: u16 },

    /// 数值超出物理范围（不做截断）
    #[error("{field} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },

    #[error("Unknown RID: 0x{0:02X}")]
    UnknownRid(u8),

    #[error("Unexpected CAN ID: 0x{id:03X}")]
    UnexpectedId { id: u16 },

    #[error("Invalid value for field {field}: {value}")]
    InvalidValue { field: &'static str, value: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_standard_truncates_and_pads() {
        let frame = DmFrame::new_standard(0x123, &[1, 2, 3]);
        assert_eq!(frame.len, 3);
        assert_eq!(frame.data, [1, 2, 3, 0, 0, 0, 0, 0]);
        assert_eq!(frame.data_slice(), &[1, 2, 3]);

        let long = DmFrame::new_standard(0x123, &[9; 12]);
        assert_eq!(long.len, 8);
    }

    #[test]
    fn test_id_is_masked_to_11_bits() {
        let frame = DmFrame::new_standard(0xFFFF, &[]);
        assert_eq!(frame.id(), 0x7FF);
    }

    #[test]
    fn test_ensure_full_rejects_short_frames() {
        let short = DmFrame::new_standard(0x201, &[0xFF; 7]);
        assert_eq!(
            short.ensure_full(),
            Err(ProtocolError::ShortFrame { len: 7 })
        );
        assert!(DmFrame::full(0x201, [0; 8]).ensure_full().is_ok());
    }
}

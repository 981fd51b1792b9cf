//! 反馈帧解析
//!
//! 电机以 MST_ID 为帧 ID 回传状态：
//!
//! ```text
//! Byte 0:   [7:4] 状态码 | [3:0] ESC_ID 低 4 位
//! Byte 1-2: 位置 (有符号 16 位)
//! Byte 3:   速度 [11:4]
//! Byte 4:   速度 [3:0] | 力矩 [11:8]
//! Byte 5:   力矩 [7:0]
//! Byte 6:   MOS 温度 (°C)
//! Byte 7:   转子温度 (°C)
//! ```
//!
//! 原始值到物理量的换算依赖电机配置的 PMAX / VMAX / TMAX，
//! 这些范围来自注册表而不是帧本身。

use crate::{DmFrame, ProtocolError};
use bilge::prelude::*;

/// 反馈帧 Byte 0 位域
#[bitsize(8)]
#[derive(FromBits, DebugBits, Clone, Copy, Default)]
pub struct FeedbackHeader {
    pub esc_id: u4, // Bit 0-3: ESC_ID 低 4 位
    pub status: u4, // Bit 4-7: 状态码
}

/// 故障类型（状态码 0x8 ~ 0xE）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum FaultKind {
    Overvoltage = 0x8,
    Undervoltage = 0x9,
    Overcurrent = 0xA,
    MosOverTemp = 0xB,
    MotorOverTemp = 0xC,
    CommunicationLoss = 0xD,
    Overload = 0xE,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FaultKind::Overvoltage => "overvoltage",
            FaultKind::Undervoltage => "undervoltage",
            FaultKind::Overcurrent => "overcurrent",
            FaultKind::MosOverTemp => "MOSFET over-temperature",
            FaultKind::MotorOverTemp => "motor over-temperature",
            FaultKind::CommunicationLoss => "communication loss",
            FaultKind::Overload => "overload",
        };
        f.write_str(name)
    }
}

/// 电机状态（由状态码映射）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MotorStatus {
    Disabled,
    Enabled,
    Fault(FaultKind),
    /// 未定义的状态码，不视为解析错误
    Unknown(u8),
}

impl MotorStatus {
    pub fn from_nibble(nibble: u8) -> Self {
        match nibble & 0x0F {
            0x0 => MotorStatus::Disabled,
            0x1 => MotorStatus::Enabled,
            n => FaultKind::try_from(n)
                .map(MotorStatus::Fault)
                .unwrap_or(MotorStatus::Unknown(n)),
        }
    }

    pub fn to_nibble(self) -> u8 {
        match self {
            MotorStatus::Disabled => 0x0,
            MotorStatus::Enabled => 0x1,
            MotorStatus::Fault(kind) => kind as u8,
            MotorStatus::Unknown(n) => n & 0x0F,
        }
    }

    pub fn fault(self) -> Option<FaultKind> {
        match self {
            MotorStatus::Fault(kind) => Some(kind),
            _ => None,
        }
    }
}

/// 反馈换算范围（对应电机的 PMAX / VMAX / TMAX 寄存器）
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FeedbackLimits {
    pub p_max: f32,
    pub v_max: f32,
    pub t_max: f32,
}

impl Default for FeedbackLimits {
    fn default() -> Self {
        Self {
            p_max: 12.5,
            v_max: 30.0,
            t_max: 10.0,
        }
    }
}

const POSITION_FULL_SCALE: f32 = 32767.0;
const VELOCITY_FULL_SCALE: f32 = 2047.0;
const TORQUE_FULL_SCALE: f32 = 2047.0;

/// 反馈帧原始字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawFeedback {
    /// ESC_ID 低 4 位
    pub esc_nibble: u8,
    pub status_nibble: u8,
    pub position: i16,
    /// 有符号 12 位
    pub velocity: i16,
    /// 有符号 12 位
    pub torque: i16,
    pub temp_mos: u8,
    pub temp_rotor: u8,
}

fn sign_extend_12(raw: u16) -> i16 {
    ((raw << 4) as i16) >> 4
}

impl RawFeedback {
    pub fn from_data(data: &[u8; 8]) -> Self {
        let header = FeedbackHeader::from(u8::new(data[0]));
        let d = data.map(u16::from);
        Self {
            esc_nibble: header.esc_id().value(),
            status_nibble: header.status().value(),
            position: i16::from_be_bytes([data[1], data[2]]),
            velocity: sign_extend_12((d[3] << 4) | (d[4] >> 4)),
            torque: sign_extend_12(((d[4] & 0x0F) << 8) | d[5]),
            temp_mos: data[6],
            temp_rotor: data[7],
        }
    }

    /// 打包为 8 字节（用于 mock 电机与测试）
    pub fn to_data(&self) -> [u8; 8] {
        let header = FeedbackHeader::new(
            u4::new(self.esc_nibble & 0x0F),
            u4::new(self.status_nibble & 0x0F),
        );
        let [p_hi, p_lo] = self.position.to_be_bytes();
        let v = (self.velocity as u16) & 0x0FFF;
        let t = (self.torque as u16) & 0x0FFF;
        [
            u8::from(header).value(),
            p_hi,
            p_lo,
            (v >> 4) as u8,
            (((v & 0x0F) << 4) | (t >> 8)) as u8,
            (t & 0xFF) as u8,
            self.temp_mos,
            self.temp_rotor,
        ]
    }
}

/// 解析后的反馈（物理单位）
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Feedback {
    /// 帧 ID（即 MST_ID）
    pub master_id: u16,
    /// 帧内携带的 ESC_ID 低 4 位
    pub esc_nibble: u8,
    pub status: MotorStatus,
    /// rad
    pub position: f32,
    /// rad/s
    pub velocity: f32,
    /// N·m
    pub torque: f32,
    /// MOS 温度 (°C)
    pub temp_mos: u8,
    /// 转子温度 (°C)
    pub temp_rotor: u8,
    pub timestamp_us: u64,
}

impl Feedback {
    /// 按给定范围生成反馈帧（仅用于 mock 电机与测试，超出范围的值会饱和）
    pub fn to_frame(&self, limits: &FeedbackLimits) -> DmFrame {
        let quantize = |value: f32, max: f32, full: f32| -> i16 {
            if max <= 0.0 {
                return 0;
            }
            (value / max * full).round().clamp(-full, full) as i16
        };
        let raw = RawFeedback {
            esc_nibble: self.esc_nibble,
            status_nibble: self.status.to_nibble(),
            position: quantize(self.position, limits.p_max, POSITION_FULL_SCALE),
            velocity: quantize(self.velocity, limits.v_max, VELOCITY_FULL_SCALE),
            torque: quantize(self.torque, limits.t_max, TORQUE_FULL_SCALE),
            temp_mos: self.temp_mos,
            temp_rotor: self.temp_rotor,
        };
        DmFrame::full(self.master_id, raw.to_data()).with_timestamp(self.timestamp_us)
    }
}

/// 解析反馈帧
///
/// DLC 不为 8 时返回 `UnknownLayout`；未知状态码不会导致解析失败。
pub fn decode_feedback(frame: &DmFrame, limits: &FeedbackLimits) -> Result<Feedback, ProtocolError> {
    if frame.len != 8 {
        return Err(ProtocolError::UnknownLayout { dlc: frame.len });
    }
    let raw = RawFeedback::from_data(&frame.data);
    Ok(Feedback {
        master_id: frame.id,
        esc_nibble: raw.esc_nibble,
        status: MotorStatus::from_nibble(raw.status_nibble),
        position: raw.position as f32 / POSITION_FULL_SCALE * limits.p_max,
        velocity: raw.velocity as f32 / VELOCITY_FULL_SCALE * limits.v_max,
        torque: raw.torque as f32 / TORQUE_FULL_SCALE * limits.t_max,
        temp_mos: raw.temp_mos,
        temp_rotor: raw.temp_rotor,
        timestamp_us: frame.timestamp_us,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_bit_order() {
        let header = FeedbackHeader::from(u8::new(0x13));
        assert_eq!(header.esc_id().value(), 0x3);
        assert_eq!(header.status().value(), 0x1);
    }

    #[test]
    fn test_decode_feedback_fields() {
        // esc 1, enabled; pos = 0x4000; vel = 0x7FF; torque = 0x801 (-2047)
        let data = [0x11, 0x40, 0x00, 0x7F, 0xF8, 0x01, 35, 40];
        let frame = DmFrame::full(0x11, data);
        let limits = FeedbackLimits::default();
        let fb = decode_feedback(&frame, &limits).unwrap();

        assert_eq!(fb.master_id, 0x11);
        assert_eq!(fb.esc_nibble, 1);
        assert_eq!(fb.status, MotorStatus::Enabled);
        assert!((fb.position - 16384.0 / 32767.0 * 12.5).abs() < 1e-5);
        assert!((fb.velocity - 30.0).abs() < 1e-5);
        assert!((fb.torque + 10.0).abs() < 1e-5);
        assert_eq!(fb.temp_mos, 35);
        assert_eq!(fb.temp_rotor, 40);
    }

    #[test]
    fn test_decode_feedback_rejects_wrong_dlc() {
        let frame = DmFrame::new_standard(0x11, &[0x11, 0, 0, 0, 0, 0]);
        assert_eq!(
            decode_feedback(&frame, &FeedbackLimits::default()),
            Err(ProtocolError::UnknownLayout { dlc: 6 })
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(MotorStatus::from_nibble(0x0), MotorStatus::Disabled);
        assert_eq!(
            MotorStatus::from_nibble(0xA),
            MotorStatus::Fault(FaultKind::Overcurrent)
        );
        assert_eq!(
            MotorStatus::from_nibble(0xD),
            MotorStatus::Fault(FaultKind::CommunicationLoss)
        );
        assert_eq!(MotorStatus::from_nibble(0x5), MotorStatus::Unknown(0x5));

        let frame = DmFrame::full(0x12, [0xF2, 0, 0, 0, 0, 0, 0, 0]);
        let fb = decode_feedback(&frame, &FeedbackLimits::default()).unwrap();
        assert_eq!(fb.status, MotorStatus::Unknown(0xF));
    }

    #[test]
    fn test_raw_roundtrip_negative_values() {
        let raw = RawFeedback {
            esc_nibble: 0x7,
            status_nibble: 0xB,
            position: -12345,
            velocity: -1,
            torque: -2048,
            temp_mos: 60,
            temp_rotor: 70,
        };
        assert_eq!(RawFeedback::from_data(&raw.to_data()), raw);
    }

    #[test]
    fn test_feedback_to_frame_roundtrip() {
        let limits = FeedbackLimits::default();
        let fb = Feedback {
            master_id: 0x13,
            esc_nibble: 3,
            status: MotorStatus::Enabled,
            position: 1.0,
            velocity: -2.5,
            torque: 0.5,
            temp_mos: 30,
            temp_rotor: 31,
            timestamp_us: 0,
        };
        let decoded = decode_feedback(&fb.to_frame(&limits), &limits).unwrap();
        assert!((decoded.position - 1.0).abs() <= limits.p_max / 32767.0);
        assert!((decoded.velocity + 2.5).abs() <= limits.v_max / 2047.0);
        assert!((decoded.torque - 0.5).abs() <= limits.t_max / 2047.0);
        assert_eq!(decoded.status, MotorStatus::Enabled);
    }
}

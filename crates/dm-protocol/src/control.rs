//! 控制帧构建
//!
//! 包含使能/失能/置零哨兵帧、速度模式、位置速度模式与 MIT 模式命令。
//! 所有编码函数只生成 8 字节满长度帧；超出物理范围的输入直接报错，不做截断。

use crate::ids::{ID_MIT_BASE, ID_POS_VEL_BASE, ID_VELOCITY_BASE, command_id, validate_esc_id};
use crate::{DmFrame, ProtocolError};

// ============================================================================
// 控制模式
// ============================================================================

/// 电机控制模式（CTRL_MODE 寄存器）
///
/// `Disabled` 只存在于注册表中，表示模式未知或仅用于配置，
/// 没有对应的寄存器值。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, num_enum::TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ControlMode {
    /// 未知 / 仅配置
    #[default]
    Disabled = 0,
    /// 阻抗控制（MIT）
    Mit = 1,
    /// 位置速度模式
    PositionVelocity = 2,
    /// 速度模式
    Velocity = 3,
}

impl ControlMode {
    /// CTRL_MODE 寄存器值，`Disabled` 无法写入
    pub fn register_value(self) -> Option<u32> {
        match self {
            ControlMode::Disabled => None,
            other => Some(other as u32),
        }
    }

    /// 由寄存器值解析
    pub fn from_register(value: u32) -> Result<Self, ProtocolError> {
        u8::try_from(value)
            .ok()
            .and_then(|v| ControlMode::try_from(v).ok())
            .filter(|mode| *mode != ControlMode::Disabled)
            .ok_or(ProtocolError::InvalidValue {
                field: "ctrl_mode",
                value,
            })
    }
}

impl std::fmt::Display for ControlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ControlMode::Disabled => "disabled",
            ControlMode::Mit => "mit",
            ControlMode::PositionVelocity => "pos-vel",
            ControlMode::Velocity => "velocity",
        };
        f.write_str(name)
    }
}

// ============================================================================
// 使能 / 失能 / 置零
// ============================================================================

const SENTINEL_ENABLE: u8 = 0xFC;
const SENTINEL_DISABLE: u8 = 0xFD;
const SENTINEL_ZERO: u8 = 0xFE;

fn sentinel_frame(esc_id: u8, tail: u8) -> Result<DmFrame, ProtocolError> {
    let id = command_id(ID_VELOCITY_BASE, esc_id)?;
    let mut data = [0xFF; 8];
    data[7] = tail;
    Ok(DmFrame::full(id, data))
}

/// 使能帧：`FF FF FF FF FF FF FF FC`
pub fn encode_enable(esc_id: u8) -> Result<DmFrame, ProtocolError> {
    sentinel_frame(esc_id, SENTINEL_ENABLE)
}

/// 失能帧：`FF FF FF FF FF FF FF FD`
pub fn encode_disable(esc_id: u8) -> Result<DmFrame, ProtocolError> {
    sentinel_frame(esc_id, SENTINEL_DISABLE)
}

/// 置零帧（将当前位置设为零点）：`FF FF FF FF FF FF FF FE`
pub fn encode_zero(esc_id: u8) -> Result<DmFrame, ProtocolError> {
    sentinel_frame(esc_id, SENTINEL_ZERO)
}

/// 哨兵帧类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    Enable,
    Disable,
    Zero,
}

/// 识别哨兵帧，非哨兵帧返回 `None`
pub fn decode_sentinel(frame: &DmFrame) -> Option<(u8, Sentinel)> {
    if frame.len != 8 || frame.data[..7] != [0xFF; 7] {
        return None;
    }
    let esc_id = frame.id.checked_sub(ID_VELOCITY_BASE)?;
    if esc_id > 0xFF {
        return None;
    }
    let kind = match frame.data[7] {
        SENTINEL_ENABLE => Sentinel::Enable,
        SENTINEL_DISABLE => Sentinel::Disable,
        SENTINEL_ZERO => Sentinel::Zero,
        _ => return None,
    };
    Some((esc_id as u8, kind))
}

// ============================================================================
// 速度 / 位置速度
// ============================================================================

fn ensure_finite(field: &'static str, value: f32) -> Result<f32, ProtocolError> {
    if !value.is_finite() {
        return Err(ProtocolError::OutOfRange {
            field,
            value,
            min: f32::MIN,
            max: f32::MAX,
        });
    }
    Ok(value)
}

/// 速度模式命令（0x200 + ESC_ID）
///
/// Byte 0-3: 目标速度 rad/s（小端 f32），Byte 4-7: 0。
///
/// 调用方必须先通过注册表确认电机处于 `Velocity` 模式，
/// 编码器本身不检查模式。
pub fn encode_velocity(esc_id: u8, rad_per_s: f32) -> Result<DmFrame, ProtocolError> {
    let id = command_id(ID_VELOCITY_BASE, esc_id)?;
    let velocity = ensure_finite("velocity", rad_per_s)?;
    let mut data = [0u8; 8];
    data[..4].copy_from_slice(&velocity.to_le_bytes());
    Ok(DmFrame::full(id, data))
}

/// 解析速度命令帧，返回 `(esc_id, rad/s)`
pub fn decode_velocity(frame: &DmFrame) -> Result<(u8, f32), ProtocolError> {
    let esc_id = esc_from_command(frame, ID_VELOCITY_BASE)?;
    let velocity = f32::from_le_bytes([frame.data[0], frame.data[1], frame.data[2], frame.data[3]]);
    Ok((esc_id, velocity))
}

/// 位置速度模式命令（0x100 + ESC_ID）
///
/// Byte 0-3: 目标位置 rad（小端 f32），Byte 4-7: 速度上限 rad/s（小端 f32）。
pub fn encode_position_velocity(
    esc_id: u8,
    position: f32,
    velocity: f32,
) -> Result<DmFrame, ProtocolError> {
    let id = command_id(ID_POS_VEL_BASE, esc_id)?;
    let position = ensure_finite("position", position)?;
    let velocity = ensure_finite("velocity", velocity)?;
    let mut data = [0u8; 8];
    data[..4].copy_from_slice(&position.to_le_bytes());
    data[4..].copy_from_slice(&velocity.to_le_bytes());
    Ok(DmFrame::full(id, data))
}

/// 解析位置速度命令帧，返回 `(esc_id, position, velocity)`
pub fn decode_position_velocity(frame: &DmFrame) -> Result<(u8, f32, f32), ProtocolError> {
    let esc_id = esc_from_command(frame, ID_POS_VEL_BASE)?;
    let position = f32::from_le_bytes([frame.data[0], frame.data[1], frame.data[2], frame.data[3]]);
    let velocity = f32::from_le_bytes([frame.data[4], frame.data[5], frame.data[6], frame.data[7]]);
    Ok((esc_id, position, velocity))
}

fn esc_from_command(frame: &DmFrame, base: u16) -> Result<u8, ProtocolError> {
    if frame.len != 8 {
        return Err(ProtocolError::UnknownLayout { dlc: frame.len });
    }
    frame
        .id
        .checked_sub(base)
        .filter(|esc| *esc < 0x100)
        .map(|esc| esc as u8)
        .and_then(|esc| validate_esc_id(esc).ok())
        .ok_or(ProtocolError::UnexpectedId { id: frame.id })
}

// ============================================================================
// MIT 模式
// ============================================================================

/// MIT 模式物理范围
///
/// 与电机固件中的 PMAX / VMAX / TMAX 配置一致时才能得到正确的物理量。
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MitLimits {
    pub p_min: f32,
    pub p_max: f32,
    pub v_min: f32,
    pub v_max: f32,
    pub kp_min: f32,
    pub kp_max: f32,
    pub kd_min: f32,
    pub kd_max: f32,
    pub t_min: f32,
    pub t_max: f32,
}

impl Default for MitLimits {
    fn default() -> Self {
        Self {
            p_min: -12.0,
            p_max: 12.0,
            v_min: -30.0,
            v_max: 30.0,
            kp_min: 0.0,
            kp_max: 400.0,
            kd_min: 0.0,
            kd_max: 10.0,
            t_min: -20.0,
            t_max: 20.0,
        }
    }
}

const MIT_POSITION_BITS: u32 = 16;
const MIT_VELOCITY_BITS: u32 = 12;
const MIT_KP_BITS: u32 = 12;
const MIT_KD_BITS: u32 = 12;
const MIT_TORQUE_BITS: u32 = 12;

/// 浮点数 → 无符号定点数
///
/// 公式：`round((x - x_min) / (x_max - x_min) * ((1 << bits) - 1))`
///
/// 超出 `[x_min, x_max]` 或非有限值返回 `OutOfRange`。
pub fn float_to_uint(
    field: &'static str,
    x: f32,
    x_min: f32,
    x_max: f32,
    bits: u32,
) -> Result<u32, ProtocolError> {
    if !x.is_finite() || x < x_min || x > x_max {
        return Err(ProtocolError::OutOfRange {
            field,
            value: x,
            min: x_min,
            max: x_max,
        });
    }
    let span = x_max - x_min;
    if span <= 0.0 {
        return Ok(0);
    }
    let max_int = ((1u32 << bits) - 1) as f32;
    let scaled = ((x - x_min) / span * max_int).round() as u32;
    Ok(scaled.min((1u32 << bits) - 1))
}

/// 无符号定点数 → 浮点数
///
/// 公式：`x_int * (x_max - x_min) / ((1 << bits) - 1) + x_min`
pub fn uint_to_float(x_int: u32, x_min: f32, x_max: f32, bits: u32) -> f32 {
    let span = x_max - x_min;
    (x_int as f32) * span / ((1u32 << bits) - 1) as f32 + x_min
}

/// MIT 控制指令（0x300 + ESC_ID）
///
/// 位域布局（高位在前）：
///
/// ```text
/// Byte 0-1: position[15:0]
/// Byte 2:   velocity[11:4]
/// Byte 3:   velocity[3:0] | kp[11:8]
/// Byte 4:   kp[7:0]
/// Byte 5:   kd[11:4]
/// Byte 6:   kd[3:0] | torque[11:8]
/// Byte 7:   torque[7:0]
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MitCommand {
    pub esc_id: u8,
    pub position: f32,
    pub velocity: f32,
    pub kp: f32,
    pub kd: f32,
    pub torque: f32,
}

/// MIT 位域原始值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MitFields {
    pub position: u16,
    pub velocity: u16,
    pub kp: u16,
    pub kd: u16,
    pub torque: u16,
}

impl MitFields {
    pub fn pack(&self) -> [u8; 8] {
        let p = self.position;
        let v = self.velocity & 0x0FFF;
        let kp = self.kp & 0x0FFF;
        let kd = self.kd & 0x0FFF;
        let t = self.torque & 0x0FFF;
        [
            (p >> 8) as u8,
            (p & 0xFF) as u8,
            (v >> 4) as u8,
            (((v & 0x0F) << 4) | ((kp >> 8) & 0x0F)) as u8,
            (kp & 0xFF) as u8,
            (kd >> 4) as u8,
            (((kd & 0x0F) << 4) | ((t >> 8) & 0x0F)) as u8,
            (t & 0xFF) as u8,
        ]
    }

    pub fn unpack(data: &[u8; 8]) -> Self {
        let d = data.map(u16::from);
        Self {
            position: (d[0] << 8) | d[1],
            velocity: (d[2] << 4) | (d[3] >> 4),
            kp: ((d[3] & 0x0F) << 8) | d[4],
            kd: (d[5] << 4) | (d[6] >> 4),
            torque: ((d[6] & 0x0F) << 8) | d[7],
        }
    }
}

impl MitCommand {
    pub fn new(esc_id: u8, position: f32, velocity: f32, kp: f32, kd: f32, torque: f32) -> Self {
        Self {
            esc_id,
            position,
            velocity,
            kp,
            kd,
            torque,
        }
    }

    /// 量化为位域原始值
    pub fn quantize(&self, limits: &MitLimits) -> Result<MitFields, ProtocolError> {
        Ok(MitFields {
            position: float_to_uint(
                "position",
                self.position,
                limits.p_min,
                limits.p_max,
                MIT_POSITION_BITS,
            )? as u16,
            velocity: float_to_uint(
                "velocity",
                self.velocity,
                limits.v_min,
                limits.v_max,
                MIT_VELOCITY_BITS,
            )? as u16,
            kp: float_to_uint("kp", self.kp, limits.kp_min, limits.kp_max, MIT_KP_BITS)? as u16,
            kd: float_to_uint("kd", self.kd, limits.kd_min, limits.kd_max, MIT_KD_BITS)? as u16,
            torque: float_to_uint(
                "torque",
                self.torque,
                limits.t_min,
                limits.t_max,
                MIT_TORQUE_BITS,
            )? as u16,
        })
    }

    /// 转换为 CAN 帧
    pub fn to_frame(&self, limits: &MitLimits) -> Result<DmFrame, ProtocolError> {
        let id = command_id(ID_MIT_BASE, self.esc_id)?;
        let fields = self.quantize(limits)?;
        Ok(DmFrame::full(id, fields.pack()))
    }

    /// 从 CAN 帧还原（用于校验与 mock 电机）
    pub fn from_frame(frame: &DmFrame, limits: &MitLimits) -> Result<Self, ProtocolError> {
        let esc_id = esc_from_command(frame, ID_MIT_BASE)?;
        let f = MitFields::unpack(&frame.data);
        Ok(Self {
            esc_id,
            position: uint_to_float(f.position as u32, limits.p_min, limits.p_max, MIT_POSITION_BITS),
            velocity: uint_to_float(f.velocity as u32, limits.v_min, limits.v_max, MIT_VELOCITY_BITS),
            kp: uint_to_float(f.kp as u32, limits.kp_min, limits.kp_max, MIT_KP_BITS),
            kd: uint_to_float(f.kd as u32, limits.kd_min, limits.kd_max, MIT_KD_BITS),
            torque: uint_to_float(f.torque as u32, limits.t_min, limits.t_max, MIT_TORQUE_BITS),
        })
    }

    /// 各字段的量化步长 `(position, velocity, kp, kd, torque)`
    pub fn quantization_steps(limits: &MitLimits) -> [f32; 5] {
        let step = |min: f32, max: f32, bits: u32| (max - min) / ((1u32 << bits) - 1) as f32;
        [
            step(limits.p_min, limits.p_max, MIT_POSITION_BITS),
            step(limits.v_min, limits.v_max, MIT_VELOCITY_BITS),
            step(limits.kp_min, limits.kp_max, MIT_KP_BITS),
            step(limits.kd_min, limits.kd_max, MIT_KD_BITS),
            step(limits.t_min, limits.t_max, MIT_TORQUE_BITS),
        ]
    }
}

/// 使用默认 MIT 范围编码
pub fn encode_mit(
    esc_id: u8,
    position: f32,
    velocity: f32,
    kp: f32,
    kd: f32,
    torque: f32,
) -> Result<DmFrame, ProtocolError> {
    MitCommand::new(esc_id, position, velocity, kp, kd, torque).to_frame(&MitLimits::default())
}

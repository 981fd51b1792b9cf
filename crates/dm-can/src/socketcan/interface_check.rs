//! CAN 接口状态检查
//!
//! 打开 socket 之前先确认接口存在且已 UP，给出比 `ENODEV` / `ENETDOWN` 更直接的提示。
//! 只读查询（`if_nametoindex` + `SIOCGIFFLAGS`），不需要 CAP_NET_ADMIN。

use crate::{CanDeviceError, CanDeviceErrorKind, CanError};
use std::ffi::CString;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use tracing::trace;

/// IFNAMSIZ 去掉结尾的 NUL
const MAX_IFACE_NAME_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    Up,
    Down,
}

fn not_found(message: String) -> CanError {
    CanError::Device(CanDeviceError::new(CanDeviceErrorKind::NotFound, message))
}

/// 查询接口状态；接口不存在或名称非法时返回 `CanError::Device(NotFound)`
pub fn interface_state(interface: &str) -> Result<InterfaceState, CanError> {
    if interface.is_empty() || interface.len() > MAX_IFACE_NAME_LEN {
        return Err(not_found(format!(
            "Invalid interface name '{}' (1..={} characters)",
            interface, MAX_IFACE_NAME_LEN
        )));
    }
    let c_name = CString::new(interface)
        .map_err(|e| not_found(format!("Invalid interface name '{}': {}", interface, e)))?;

    // SAFETY: c_name 是以 NUL 结尾的合法 C 字符串
    if unsafe { libc::if_nametoindex(c_name.as_ptr()) } == 0 {
        return Err(not_found(format!(
            "CAN interface '{}' does not exist ({})",
            interface,
            io::Error::last_os_error()
        )));
    }

    // SAFETY: ifreq 为 POD，全零是合法初值；名称长度已检查，不会越界
    let mut request: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in request.ifr_name.iter_mut().zip(interface.bytes()) {
        *dst = src as libc::c_char;
    }

    // SAFETY: 仅创建一个用于 ioctl 的 datagram socket，返回值已检查
    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if raw < 0 {
        return Err(CanError::Io(io::Error::last_os_error()));
    }
    // SAFETY: raw 是刚创建且未被其它地方持有的 fd
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: SIOCGIFFLAGS 读取 ifreq.ifr_flags，request 在调用期间有效
    let result = unsafe {
        libc::ioctl(
            std::os::fd::AsRawFd::as_raw_fd(&fd),
            libc::SIOCGIFFLAGS,
            &mut request as *mut libc::ifreq,
        )
    };
    if result < 0 {
        return Err(CanError::Io(io::Error::last_os_error()));
    }

    // SAFETY: SIOCGIFFLAGS 成功后 union 中有效的是 ifru_flags
    let flags = unsafe { request.ifr_ifru.ifru_flags };
    let state = if i32::from(flags) & libc::IFF_UP != 0 {
        InterfaceState::Up
    } else {
        InterfaceState::Down
    };
    trace!("Interface '{}' is {:?}", interface, state);
    Ok(state)
}

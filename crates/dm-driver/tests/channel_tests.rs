//! 通道周期发送集成测试
//!
//! 通过 mock 应答器记录每一帧的发出时刻，检查更新负载不会打乱节奏。

use dm_can::MockBus;
use dm_driver::{Channel, ChannelConfig, DriverError};
use dm_protocol::{DmFrame, decode_velocity, encode_velocity};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// 辅助函数：记录发出时刻的通道
fn recording_channel() -> (MockBus, Channel, Arc<Mutex<Vec<(Instant, DmFrame)>>>) {
    let bus = MockBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    bus.set_responder(move |frame| {
        sink.lock().unwrap().push((Instant::now(), *frame));
        Vec::new()
    });
    let channel = Channel::open("can0", bus.adapter(), &ChannelConfig::default()).unwrap();
    (bus, channel, log)
}

#[test]
fn test_updates_do_not_disturb_cadence() {
    let (_bus, channel, log) = recording_channel();
    let period = Duration::from_millis(20);
    let handle = channel
        .start_periodic(encode_velocity(1, 0.0).unwrap(), period)
        .unwrap();

    // 远快于周期的负载更新
    let started = Instant::now();
    let mut step = 0u32;
    while started.elapsed() < Duration::from_millis(300) {
        step += 1;
        channel
            .update_periodic(&handle, encode_velocity(1, step as f32 * 0.01).unwrap())
            .unwrap();
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(channel.stop_periodic(&handle));

    let log = log.lock().unwrap();
    let times: Vec<Instant> = log.iter().map(|(t, _)| *t).collect();
    // 300ms / 20ms 约 15 帧（含启动时的首帧）
    assert!(
        (11..=18).contains(&times.len()),
        "unexpected frame count {}",
        times.len()
    );
    let too_fast = times
        .windows(2)
        .filter(|w| w[1].duration_since(w[0]) < Duration::from_millis(10))
        .count();
    assert!(too_fast <= 1, "{too_fast} intervals shorter than half a period");

    // 发出的总是当时的最新负载
    let velocities: Vec<f32> = log
        .iter()
        .map(|(_, f)| decode_velocity(f).unwrap().1)
        .collect();
    assert!(velocities.windows(2).all(|w| w[1] >= w[0]));
    assert!(velocities.last().copied().unwrap_or_default() > 0.0);
}

#[test]
fn test_no_frames_after_stop() {
    let (_bus, channel, log) = recording_channel();
    let handle = channel
        .start_periodic(encode_velocity(2, 1.0).unwrap(), Duration::from_millis(5))
        .unwrap();
    std::thread::sleep(Duration::from_millis(40));
    channel.stop_periodic(&handle);
    let count = log.lock().unwrap().len();
    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(log.lock().unwrap().len(), count);
    assert!(!channel.is_periodic_active(&handle));
}

#[test]
fn test_one_schedule_per_arbitration_id() {
    let (_bus, channel, _log) = recording_channel();
    let period = Duration::from_millis(50);
    let first = channel
        .start_periodic(encode_velocity(1, 1.0).unwrap(), period)
        .unwrap();
    assert!(matches!(
        channel.start_periodic(encode_velocity(1, 2.0).unwrap(), period),
        Err(DriverError::DuplicateSchedule { id: 0x201 })
    ));
    // 其它 ID 不受影响
    channel
        .start_periodic(encode_velocity(2, 1.0).unwrap(), period)
        .unwrap();
    assert_eq!(channel.active_periodic_count(), 2);

    // 旧句柄在停止后失效，新登记拿到新的代数
    channel.stop_periodic(&first);
    let second = channel
        .start_periodic(encode_velocity(1, 3.0).unwrap(), period)
        .unwrap();
    assert!(matches!(
        channel.update_periodic(&first, encode_velocity(1, 0.0).unwrap()),
        Err(DriverError::UnknownSchedule { id: 0x201 })
    ));
    assert!(channel.is_periodic_active(&second));
    assert_eq!(channel.stop_all_periodic(), 2);
}

#[test]
fn test_closed_channel_rejects_work() {
    let (_bus, channel, _log) = recording_channel();
    channel.close();
    assert!(!channel.is_open());
    assert!(matches!(
        channel.send(encode_velocity(1, 0.0).unwrap()),
        Err(DriverError::ChannelClosed)
    ));
    assert!(matches!(
        channel.start_periodic(encode_velocity(1, 0.0).unwrap(), Duration::from_millis(10)),
        Err(DriverError::ChannelClosed)
    ));
}

//! 监控命令
//!
//! 运行看门狗并周期打印注册表快照，Ctrl-C 触发 E-STOP 后退出。

use crate::session::{ConnectArgs, Session};
use anyhow::Result;
use clap::Args;
use dm_driver::{CoreEvent, MotorSnapshot};
use std::time::Duration;

/// 监控命令参数
#[derive(Args, Debug)]
pub struct MonitorCommand {
    /// 更新频率（Hz）
    #[arg(short, long, default_value_t = 2)]
    pub frequency: u32,
}

impl MonitorCommand {
    pub fn execute(&self, connect: &ConnectArgs) -> Result<()> {
        let session = Session::open(connect)?;
        session.install_estop_handler()?;
        let controller = &session.controller;
        let events = controller.subscribe_events();
        let _watchdog = controller.spawn_watchdog();
        let interval = Duration::from_secs_f64(1.0 / f64::from(self.frequency.max(1)));

        println!("⏳ 监控中（Ctrl-C 急停并退出）");
        while !session.is_interrupted() {
            for event in events.try_iter() {
                print_event(&event);
            }
            for snapshot in controller.snapshot() {
                println!("{}", format_snapshot(&snapshot));
            }
            for id in controller.channel_ids() {
                if let Ok(channel) = controller.channel(&id) {
                    let m = channel.metrics_snapshot();
                    println!(
                        "  [{}] rx={} dropped={} tx={} tx_err={}",
                        id, m.rx_frames_total, m.rx_dropped, m.tx_frames_total, m.tx_errors
                    );
                }
            }
            println!();
            std::thread::sleep(interval);
        }
        for event in events.try_iter() {
            print_event(&event);
        }
        Ok(())
    }
}

fn print_event(event: &CoreEvent) {
    if event.is_high_priority() {
        println!("🚨 {:?}", event);
    } else {
        println!("• {:?}", event);
    }
}

fn format_snapshot(s: &MotorSnapshot) -> String {
    let mut line = format!(
        "{:<12} {:<8} {:<3}",
        s.key.to_string(),
        s.mode.to_string(),
        if s.enabled { "ON" } else { "off" }
    );
    match &s.telemetry {
        Some(t) => line.push_str(&format!(
            " p={:+8.3} v={:+8.3} t={:+7.3} mos={}°C rotor={}°C {:?}",
            t.position, t.velocity, t.torque, t.temp_mos, t.temp_rotor, t.status
        )),
        None => line.push_str(" (no feedback)"),
    }
    if let Some(age) = s.last_seen {
        line.push_str(&format!(" age={}ms", age.as_millis()));
    }
    if s.watchdog_intervened {
        line.push_str(" [watchdog]");
    }
    if s.unsaved {
        line.push_str(" [unsaved]");
    }
    line
}

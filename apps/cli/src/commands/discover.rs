//! 发现命令
//!
//! 被动监听反馈，可选地主动探测未知 ESC_ID，然后写回电机记录。

use crate::session::{ConnectArgs, Session};
use anyhow::Result;
use clap::Args;
use dm_driver::{DiscoveryPhase, DiscoveryReport};

/// 发现命令参数
#[derive(Args, Debug)]
pub struct DiscoverCommand {
    /// 被动监听后主动探测（对候选 ID 发送零速度）
    #[arg(long)]
    pub probe: bool,

    /// 只打印结果，不写回电机记录
    #[arg(long)]
    pub dry_run: bool,
}

impl DiscoverCommand {
    pub fn execute(&self, connect: &ConnectArgs) -> Result<()> {
        let session = Session::open(connect)?;
        session.install_estop_handler()?;

        // Ctrl-C 触发 E-STOP，发现流程随之中止
        let mut discovery = session.controller.start_discovery(&connect.channel_ids())?;

        println!("⏳ 监听反馈...");
        discovery.passive_listen()?;
        if self.probe && !discovery.phase().is_terminal() {
            println!("⏳ 探测候选 ID...");
            discovery.active_probe()?;
        }
        let report = discovery.finish();
        print_report(&report);

        if report.phase == DiscoveryPhase::Complete && !self.dry_run {
            session.persist()?;
        }
        Ok(())
    }
}

fn print_report(report: &DiscoveryReport) {
    match &report.aborted_reason {
        Some(reason) => println!("❌ 发现中止: {:?}", reason),
        None => println!("✅ 发现完成: {} 台新电机", report.discovered.len()),
    }
    for motor in &report.discovered {
        println!(
            "  {}  master=0x{:03X}  {:?}  ({:?})",
            motor.key, motor.master_id, motor.status, motor.source
        );
    }
    for pending in &report.pending {
        println!(
            "  ? {} master=0x{:03X} nibble=0x{:X}：无法推断 ESC_ID，请手动分配",
            pending.channel, pending.master_id, pending.esc_nibble
        );
    }
    for conflict in &report.conflicts {
        println!(
            "  ⚠️  {} ESC 0x{:02X} 冲突: master {:03X?}",
            conflict.channel, conflict.esc_id, conflict.master_ids
        );
    }
}

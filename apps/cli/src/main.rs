//! # DM CLI
//!
//! Command-line interface for DM gear motors on SocketCAN.
//!
//! 每个命令独立执行：读取配置与电机记录 -> 打开通道 -> 执行 -> 写回记录。
//!
//! ```bash
//! # 扫描 can0 上的电机并保存身份
//! dm-cli discover --probe
//!
//! # 把 ESC 1 改为 ESC 3，速度模式
//! dm-cli assign can0:1 3 --mode velocity
//!
//! # 双电机正弦演示，Ctrl-C 触发 E-STOP
//! dm-cli demo sine --motors can0:1,can0:2
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod session;
mod store;

use commands::{
    AssignCommand, ConfigCommand, DemoCommand, DiscoverCommand, MonitorCommand, MotorArgs,
    VelocityCommand,
};
use session::ConnectArgs;

/// DM CLI - 达妙电机命令行工具
#[derive(Parser, Debug)]
#[command(name = "dm-cli")]
#[command(about = "Command-line interface for DM motor discovery and control", long_about = None)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    connect: ConnectArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 配置管理
    #[command(subcommand)]
    Config(ConfigCommand),

    /// 发现总线上的电机
    Discover {
        #[command(flatten)]
        args: DiscoverCommand,
    },

    /// 修改电机 ID 与控制模式
    Assign {
        #[command(flatten)]
        args: AssignCommand,
    },

    /// 使能电机
    Enable {
        #[command(flatten)]
        args: MotorArgs,
    },

    /// 失能电机
    Disable {
        #[command(flatten)]
        args: MotorArgs,
    },

    /// 将当前位置设为零点
    Zero {
        #[command(flatten)]
        args: MotorArgs,
    },

    /// 速度命令
    Velocity {
        #[command(flatten)]
        args: VelocityCommand,
    },

    /// 监控电机状态（同时运行看门狗）
    Monitor {
        #[command(flatten)]
        args: MonitorCommand,
    },

    /// 多电机演示
    #[command(subcommand)]
    Demo(DemoCommand),
}

fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dm_cli=info,dm_driver=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config(cmd) => cmd.execute(&cli.connect),
        Commands::Discover { args } => args.execute(&cli.connect),
        Commands::Assign { args } => args.execute(&cli.connect),
        Commands::Enable { args } => args.enable(&cli.connect),
        Commands::Disable { args } => args.disable(&cli.connect),
        Commands::Zero { args } => args.zero(&cli.connect),
        Commands::Velocity { args } => args.execute(&cli.connect),
        Commands::Monitor { args } => args.execute(&cli.connect),
        Commands::Demo(cmd) => cmd.execute(&cli.connect),
    }
}

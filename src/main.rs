use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use testfleet::app::{AppMode, Application};
use testfleet::shutdown::ShutdownManager;
use testfleet_core::AppConfig;

fn cli() -> Command {
    Command::new("testfleet")
        .version(env!("CARGO_PKG_VERSION"))
        .about("变更感知的分布式Go测试调度系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时查找 config/testfleet.toml"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["server", "worker", "all"])
                .default_value("server"),
        )
        .arg(
            Arg::new("worker-id")
                .long("worker-id")
                .value_name("ID")
                .help("Worker 在组内的序号 (worker/all 模式)")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("worker-group")
                .long("worker-group")
                .value_name("GROUP")
                .help("Worker 分组"),
        )
        .arg(
            Arg::new("server")
                .long("server")
                .value_name("URL")
                .help("调度服务地址 (worker 模式)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
}

/// 命令行参数覆盖配置文件中的值
fn apply_overrides(config: &mut AppConfig, matches: &ArgMatches) -> Result<()> {
    if let Some(id) = matches.get_one::<u32>("worker-id") {
        config.worker.worker_id = *id;
    }
    if let Some(group) = matches.get_one::<String>("worker-group") {
        config.worker.group = group.clone();
    }
    if let Some(server) = matches.get_one::<String>("server") {
        config.worker.server_url = server.clone();
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.clone();
    }
    config.validate().context("命令行参数无效")
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mode_str = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("server");

    let mut config = AppConfig::load(config_path)
        .with_context(|| format!("加载配置失败: {}", config_path.unwrap_or("默认配置")))?;
    apply_overrides(&mut config, &matches)?;

    init_logging(&config.observability.log_level, &config.observability.log_format)?;

    info!("启动 testfleet");
    info!("运行模式: {mode_str}");
    if let Some(path) = config_path {
        info!("配置文件: {path}");
    }

    let app_mode = AppMode::parse(mode_str)?;
    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout_seconds);
    let app = Arc::new(Application::new(config, app_mode));

    let shutdown_manager = ShutdownManager::new();

    let mut app_handle = {
        let shutdown = shutdown_manager.clone();
        let app = Arc::clone(&app);

        tokio::spawn(async move { app.run(shutdown).await })
    };

    // 应用自行退出（例如端口被占用）时不再等待信号
    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
        }
        result = &mut app_handle => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!("应用运行失败: {e:#}");
                    Err(e)
                }
                Err(e) => Err(anyhow::anyhow!("应用任务异常: {e}")),
            };
        }
    }

    shutdown_manager.shutdown();

    // 调度服务在 Worker 池销毁后才释放，Worker 在退出拉取循环后释放
    match shutdown_manager.wait_drained(shutdown_timeout).await {
        Ok(()) => match app_handle.await {
            Ok(Ok(())) => info!("应用已优雅关闭"),
            Ok(Err(e)) => error!("应用关闭时发生错误: {e:#}"),
            Err(e) => error!("应用任务异常: {e}"),
        },
        Err(pending) => warn!(
            "关闭超时 ({:?})，以下组件仍未退出: {:?}，强制退出",
            shutdown_timeout, pending
        ),
    }

    info!("testfleet 已退出");
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}

// src/bin/kline_sync_service.rs

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use kline_sync::klcommon::{init_logging, SqliteCandleStore, SyncConfig};
use kline_sync::klserver::start_web_server;
use kline_sync::klsync::run_engine;

/// K线同步服务：订阅交易所成交，聚合成多周期K线并对外提供查询
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// 配置文件路径，默认读取 CONFIG_PATH 或 config/KlineSyncConfig.toml
    #[arg(short, long)]
    config: Option<String>,

    /// 打开请求追踪日志
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. 配置
    let mut config = SyncConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if args.debug {
        config.app.debug = true;
    }

    // 2. 日志，guard 必须活到进程结束
    let _log_guard = init_logging(&config.logging).context("Failed to initialize logging")?;

    let main_span = tracing::info_span!("kline_sync_app", version = env!("CARGO_PKG_VERSION"));
    let _enter = main_span.enter();

    info!(
        event_name = "ConfigurationLoaded",
        engines = config.engines.len(),
        db_path = %config.database.database_path,
        port = config.app.port,
        "Application configuration loaded."
    );

    // 3. 存储
    let store = Arc::new(
        SqliteCandleStore::open(&config.database).context("Failed to open candle store")?,
    );
    info!(event_name = "ModuleCreated", module = "SqliteCandleStore");

    // 4. 每个交易所一条独立的管道，一个失败不影响其他
    for engine_config in config.engines.clone() {
        let store = store.clone();
        let platform = engine_config.platform;
        tokio::spawn(async move {
            match run_engine(engine_config, store).await {
                Ok(()) => warn!(event_name = "EngineStopped", %platform, "engine stopped"),
                Err(e) => error!(
                    event_name = "EngineFailed",
                    %platform,
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "engine terminated"
                ),
            }
        });
    }
    info!(event_name = "ServicesStarted", "All engines have been started.");

    // 5. Web 服务，收到关闭信号后退出
    let web_store = store.clone();
    let app_config = config.app.clone();
    tokio::select! {
        result = start_web_server(web_store, &app_config) => {
            result.context("Web server exited")?;
        }
        _ = wait_for_shutdown_signal() => {
            info!(event_name = "ShutdownSignalReceived", "Shutdown initiated.");
        }
    }

    info!(event_name = "ApplicationShutdownComplete");
    Ok(())
}

/// 等待 Ctrl+C 或 SIGTERM 信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

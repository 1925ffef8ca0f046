//! 统一日志系统初始化模块
//!
//! 控制台输出人类可读格式，文件按天滚动写 JSON，便于后续检索。

use crate::klcommon::{AppError, LoggingConfig, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// 日志文件名前缀
pub const LOG_FILE_PREFIX: &str = "kline_sync.log";

/// 构造过滤器字符串，RUST_LOG 优先于配置文件
pub fn build_filter_directive(config: &LoggingConfig) -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| {
        format!(
            "{},hyper=warn,reqwest=warn,rusqlite=warn,tungstenite=warn,tokio_tungstenite=warn",
            config.log_level
        )
    })
}

/// 初始化日志系统
///
/// 返回的 guard 必须由 main 持有到进程退出，否则文件日志会丢失尾部。
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(build_filter_directive(config))
        .map_err(|e| AppError::ConfigError(format!("无效的日志过滤器: {}", e)))?;

    let console_layer = config
        .console_output
        .then(|| fmt::layer().with_target(true).with_thread_ids(true));

    let (file_layer, guard) = if config.json_file {
        std::fs::create_dir_all(&config.log_dir)?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    Registry::default()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("日志系统初始化失败: {}", e)))?;

    Ok(guard)
}

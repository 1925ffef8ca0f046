use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    /// 网络层失败：websocket 拨号/读写、HTTP 请求
    #[error("Transport error: {0}")]
    TransportError(String),

    /// 报文或响应的结构不符合预期
    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Unsupported period: {0}")]
    UnsupportedPeriod(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Channel error: {0}")]
    ChannelError(String),

    /// 重连次数耗尽，该交易所的数据管道终止
    #[error("Reconnect attempts exhausted after {0} retries")]
    ReconnectExhausted(usize),

    #[error("Web server error: {0}")]
    WebServerError(String),
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        // 响应体解码失败归为 DecodeError，其余都是网络问题
        if e.is_decode() {
            AppError::DecodeError(e.to_string())
        } else {
            AppError::TransportError(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::TransportError(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::DecodeError(e.to_string())
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(e: rust_decimal::Error) -> Self {
        AppError::DecodeError(e.to_string())
    }
}

impl From<url::ParseError> for AppError {
    fn from(e: url::ParseError) -> Self {
        AppError::ConfigError(format!("invalid url: {}", e))
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::StorageError(e.to_string())
    }
}

impl From<r2d2::Error> for AppError {
    fn from(e: r2d2::Error) -> Self {
        AppError::StorageError(format!("获取数据库连接失败: {}", e))
    }
}

impl AppError {
    /// 获取错误类型的简洁摘要，用于日志里的 error.summary 字段
    ///
    /// 返回稳定的类别字符串，便于按类别聚合告警
    pub fn get_error_type_summary(&self) -> &'static str {
        match self {
            AppError::TransportError(_) => "market_data_connection_failed",
            AppError::DecodeError(_) => "market_data_format_invalid",
            AppError::UnsupportedPeriod(_) => "kline_period_unsupported",
            AppError::StorageError(_) => "kline_storage_operation_failed",
            AppError::ConfigError(_) => "kline_service_configuration_invalid",
            AppError::IoError(_) => "kline_file_operation_failed",
            AppError::ChannelError(_) => "kline_processing_pipeline_failed",
            AppError::ReconnectExhausted(_) => "realtime_market_data_lost",
            AppError::WebServerError(_) => "kline_api_server_failed",
        }
    }

    /// 检查错误是否为可重试类型
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::TransportError(_) | AppError::IoError(_) => true,

            // SQLite 锁争用可以重试
            AppError::StorageError(msg) => {
                msg.contains("locked") || msg.contains("busy") || msg.contains("timeout")
            }

            AppError::DecodeError(_)
            | AppError::UnsupportedPeriod(_)
            | AppError::ConfigError(_)
            | AppError::ChannelError(_)
            | AppError::ReconnectExhausted(_)
            | AppError::WebServerError(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

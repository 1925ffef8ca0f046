//! K线同步服务配置模块

use crate::klcommon::websocket::parse_proxy_url;
use crate::klcommon::{AppError, Period, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/KlineSyncConfig.toml";

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_true() -> bool {
    true
}

/// K线同步服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// 每个交易所一份引擎配置
    pub engines: Vec<EngineConfig>,
}

/// Web 接口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// 调试模式下开启请求追踪日志
    #[serde(default)]
    pub debug: bool,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// 数据库文件路径
    pub database_path: String,

    /// 连接池大小
    pub pool_size: u32,

    /// 是否启用WAL模式
    pub enable_wal: bool,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别 (trace, debug, info, warn, error)，RUST_LOG 优先
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// 日志文件目录
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// 是否输出到控制台
    #[serde(default = "default_true")]
    pub console_output: bool,

    /// 是否写 JSON 格式的滚动日志文件
    #[serde(default = "default_true")]
    pub json_file: bool,
}

/// 交易所平台
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Huobi,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Huobi => f.write_str("huobi"),
        }
    }
}

/// 单个交易所的引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 平台
    pub platform: Platform,

    /// 代理，空字符串表示直连
    #[serde(default)]
    pub proxy_url: String,

    /// websocket 地址
    pub ws_url: String,

    /// REST 地址
    pub http_url: String,

    /// 交易对
    pub symbols: Vec<String>,

    /// 需要回补历史的周期
    pub periods: Vec<Period>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            debug: false,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_path: "data/kline_sync.db".to_string(),
            pool_size: 8,
            enable_wal: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            console_output: true,
            json_file: true,
        }
    }
}

impl EngineConfig {
    /// 代理地址，未配置时返回 None
    pub fn proxy(&self) -> Option<&str> {
        let proxy = self.proxy_url.trim();
        if proxy.is_empty() {
            None
        } else {
            Some(proxy)
        }
    }

    pub fn validate(&self) -> Result<()> {
        let ws = Url::parse(&self.ws_url)?;
        if ws.scheme() != "ws" && ws.scheme() != "wss" {
            return Err(AppError::ConfigError(format!("ws_url 必须是 ws/wss 地址: {}", self.ws_url)));
        }

        let http = Url::parse(&self.http_url)?;
        if http.scheme() != "http" && http.scheme() != "https" {
            return Err(AppError::ConfigError(format!("http_url 必须是 http/https 地址: {}", self.http_url)));
        }

        if let Some(proxy) = self.proxy() {
            parse_proxy_url(proxy)?;
        }

        if self.symbols.is_empty() {
            return Err(AppError::ConfigError(format!("{} 的交易对列表不能为空", self.platform)));
        }

        // 交易对会拼进集合名（表名），只允许字母数字
        for symbol in &self.symbols {
            if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(AppError::ConfigError(format!("无效的交易对: {:?}", symbol)));
            }
        }

        Ok(())
    }
}

impl SyncConfig {
    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// 从 TOML 文本解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::ConfigError(format!("解析配置文件失败: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// 按优先级加载：命令行参数 > CONFIG_PATH 环境变量 > 默认路径
    pub fn load(cli_path: Option<&str>) -> Result<Self> {
        let path = match cli_path {
            Some(p) => p.to_string(),
            None => std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
        };

        if !Path::new(&path).exists() {
            return Err(AppError::ConfigError(format!("配置文件不存在: {}", path)));
        }

        Self::from_file(&path)
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.engines.is_empty() {
            return Err(AppError::ConfigError("至少需要配置一个交易所引擎".to_string()));
        }

        if self.database.pool_size == 0 {
            return Err(AppError::ConfigError("数据库连接池大小必须大于0".to_string()));
        }

        for engine in &self.engines {
            engine.validate()?;
        }

        Ok(())
    }
}

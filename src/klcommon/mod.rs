// 导出共享模块
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod logging_setup;
pub mod models;
pub mod period;
pub mod websocket;

// 重新导出常用类型，方便使用
pub use api::HttpClient;
pub use config::{AppConfig, DatabaseConfig, EngineConfig, LoggingConfig, Platform, SyncConfig};
pub use db::{collection_name, with_store, CandleStore, MemoryCandleStore, SqliteCandleStore};
pub use error::{AppError, Result};
pub use logging_setup::init_logging;
pub use models::{Candle, TradeEvent};
pub use period::{bucket, prev_bucket, Period};
pub use websocket::{FrameSocket, SocketConnector, TungsteniteConnector, WsFrame};

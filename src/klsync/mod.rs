//! 交易所行情同步：worker 产生逐笔成交，引擎聚合成多周期K线并落库

pub mod engine;
pub mod huobi;
pub mod merge;

pub use engine::{kline_periods, load_history, KlineSyncEngine};
pub use huobi::HuobiWorker;
pub use merge::merge_trade;

use crate::klcommon::{Candle, CandleStore, EngineConfig, Period, Platform, Result, TradeEvent, TungsteniteConnector};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

/// 引擎日志目标
pub const SYNC_TARGET: &str = "kline_sync";

/// worker 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Disconnected,
    Connecting,
    Subscribed,
    Reading,
    Reconnecting,
    /// 重连耗尽，终态
    Failed,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerState::Disconnected => "Disconnected",
            WorkerState::Connecting => "Connecting",
            WorkerState::Subscribed => "Subscribed",
            WorkerState::Reading => "Reading",
            WorkerState::Reconnecting => "Reconnecting",
            WorkerState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// 重连策略：最多重连 `max_attempts` 次，间隔指数退避
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// 不等待的策略，测试用
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// 第 `attempt` 次重连前的等待时间（attempt 从 1 开始）
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as u32;
        self.initial_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay)
    }
}

/// 交易所 worker 的能力
pub trait ExchangeWorker: Send + Sync + 'static {
    fn platform(&self) -> Platform;

    /// 订阅全部交易对并持续读取，成交写入 `tx`
    ///
    /// 正常关闭时返回 `Ok(())`，重连耗尽时返回 `ReconnectExhausted`。
    fn run(&self, tx: mpsc::Sender<TradeEvent>) -> impl Future<Output = Result<()>> + Send;

    /// 拉取一页历史K线，按时间倒序
    fn fetch_history(&self, symbol: &str, period: Period) -> impl Future<Output = Result<Vec<Candle>>> + Send;

    /// 释放连接，可重复调用
    fn close(&self) -> impl Future<Output = Result<()>> + Send;

    fn state(&self) -> watch::Receiver<WorkerState>;
}

/// 按平台创建 worker 并运行引擎，直到 worker 终止
pub async fn run_engine<S: CandleStore>(config: EngineConfig, store: Arc<S>) -> Result<()> {
    config.validate()?;

    match config.platform {
        Platform::Huobi => {
            let worker = HuobiWorker::<TungsteniteConnector>::connect(&config).await.map_err(|e| {
                error!(
                    target: SYNC_TARGET,
                    log_type = "module",
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "{} worker 创建失败",
                    config.platform
                );
                e
            })?;
            info!(target: SYNC_TARGET, log_type = "module", "{} worker 已连接", config.platform);
            KlineSyncEngine::new(worker, store, config).run().await
        }
    }
}

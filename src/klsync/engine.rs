use super::merge::merge_trade;
use super::{ExchangeWorker, SYNC_TARGET};
use crate::klcommon::{
    bucket, collection_name, with_store, AppError, Candle, CandleStore, EngineConfig, Period, Result, TradeEvent,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

/// worker 到聚合引擎的队列容量
pub const TRADE_QUEUE_CAPACITY: usize = 4096;

/// 对外可查询的周期列表
pub fn kline_periods() -> Vec<&'static str> {
    Period::ALL.iter().map(|p| p.name()).collect()
}

/// 按时间倒序分页读取某个交易对、某个周期的K线
///
/// `last_time` 为 Some 时只返回比它更早的K线。
pub async fn load_history<S: CandleStore>(
    store: Arc<S>,
    symbol: &str,
    period: Period,
    last_time: Option<i64>,
    page: u32,
    limit: u32,
) -> Result<Vec<Candle>> {
    let collection = collection_name(symbol, period);
    with_store(store, move |s| s.find_page(&collection, last_time, page, limit)).await
}

/// K线聚合引擎
///
/// 启动时为空集合回补历史，之后消费 worker 推送的成交，
/// 对每个周期计算所在K线桶并原子地合并写回。
pub struct KlineSyncEngine<W: ExchangeWorker, S: CandleStore> {
    worker: Arc<W>,
    store: Arc<S>,
    config: EngineConfig,
}

impl<W: ExchangeWorker, S: CandleStore> KlineSyncEngine<W, S> {
    pub fn new(worker: W, store: Arc<S>, config: EngineConfig) -> Self {
        Self {
            worker: Arc::new(worker),
            store,
            config,
        }
    }

    pub fn worker(&self) -> &Arc<W> {
        &self.worker
    }

    /// 为配置中每个还没有任何数据的 (交易对, 周期) 集合写入一页历史K线
    ///
    /// 单个组合失败只跳过该组合。返回实际回补的组合数。
    #[instrument(target = "kline_sync", skip(self), fields(platform = %self.config.platform))]
    pub async fn backfill(&self) -> usize {
        let start = Instant::now();
        let mut filled = 0;

        for symbol in &self.config.symbols {
            for &period in &self.config.periods {
                match self.backfill_one(symbol, period).await {
                    Ok(Some(count)) => {
                        filled += 1;
                        info!(target: SYNC_TARGET, log_type = "module", "{} {} 回补历史K线 {} 根", symbol, period, count);
                    }
                    Ok(None) => {
                        debug!(target: SYNC_TARGET, "{} {} 已有数据，跳过回补", symbol, period);
                    }
                    Err(e) => {
                        warn!(
                            target: SYNC_TARGET,
                            log_type = "module",
                            error.summary = e.get_error_type_summary(),
                            error.details = %e,
                            "{} {} 回补失败",
                            symbol,
                            period
                        );
                    }
                }
            }
        }

        info!(
            target: SYNC_TARGET,
            log_type = "low_freq",
            "历史回补完成: {} 个集合，耗时 {:?}",
            filled,
            start.elapsed()
        );
        filled
    }

    /// 集合已有数据时返回 `Ok(None)`
    async fn backfill_one(&self, symbol: &str, period: Period) -> Result<Option<usize>> {
        let collection = collection_name(symbol, period);

        let lookup = collection.clone();
        if with_store(self.store.clone(), move |s| s.has_any(&lookup)).await? {
            return Ok(None);
        }

        let candles = self.worker.fetch_history(symbol, period).await?;
        let count = with_store(self.store.clone(), move |s| s.insert_many(&collection, &candles)).await?;
        Ok(Some(count))
    }

    /// 把一笔成交合并进所有周期的K线，返回成功写入的周期数
    pub async fn apply_trade(&self, trade: TradeEvent) -> usize {
        let store = self.store.clone();
        let result = with_store(store, move |s| Ok(merge_into_all_periods(s, &trade))).await;

        match result {
            Ok(updated) => updated,
            Err(e) => {
                error!(target: SYNC_TARGET, { error.summary = e.get_error_type_summary() }, "合并成交失败: {}", e);
                0
            }
        }
    }

    /// 回补历史、启动 worker 并持续消费成交，直到 worker 终止
    pub async fn run(self) -> Result<()> {
        let platform = self.config.platform;
        self.backfill().await;

        let (tx, mut rx) = mpsc::channel::<TradeEvent>(TRADE_QUEUE_CAPACITY);
        let worker = self.worker.clone();
        let worker_task = tokio::spawn(async move { worker.run(tx).await });

        info!(target: SYNC_TARGET, log_type = "low_freq", "{} 引擎开始消费成交", platform);

        // worker 退出后发送端被丢弃，队列里剩余的成交仍会被处理完
        while let Some(trade) = rx.recv().await {
            self.apply_trade(trade).await;
        }

        let outcome = worker_task
            .await
            .map_err(|e| AppError::ChannelError(format!("{} worker 任务异常退出: {}", platform, e)))?;

        if let Err(e) = &outcome {
            error!(
                target: SYNC_TARGET,
                log_type = "module",
                error.summary = e.get_error_type_summary(),
                error.details = %e,
                "{} 数据管道终止",
                platform
            );
        }
        outcome
    }
}

/// 在阻塞线程上依次处理全部周期，单个周期失败只丢弃该周期
fn merge_into_all_periods<S: CandleStore>(store: &S, trade: &TradeEvent) -> usize {
    let mut updated = 0;

    for period in Period::ALL {
        let start = match bucket(trade.timestamp, period) {
            Ok(start) => start,
            Err(e) => {
                warn!(target: SYNC_TARGET, "成交时间 {} 无法分桶 ({}): {}", trade.timestamp, period, e);
                continue;
            }
        };

        let collection = collection_name(&trade.symbol, period);
        let result = store.upsert_with(&collection, start, |existing| {
            merge_trade(existing.unwrap_or_else(|| Candle::empty(start)), trade.price, trade.amount)
        });

        match result {
            Ok(_) => updated += 1,
            Err(e) => {
                error!(
                    target: SYNC_TARGET,
                    log_type = "module",
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "写入 {} time={} 失败",
                    collection,
                    start
                );
            }
        }
    }

    updated
}

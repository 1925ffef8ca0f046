use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 归一化后的逐笔成交，由交易所 worker 产生，聚合引擎消费一次
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeEvent {
    pub symbol: String,
    /// 成交时间（秒）
    pub timestamp: i64,
    pub price: Decimal,
    pub amount: Decimal,
}

/// K线 - 数据库存储格式
///
/// 唯一键是 `(symbol, period, time)`，symbol 和 period 由所在集合决定。
/// `open/low/high <= 0` 表示尚未设置，第一次合并时由成交价填充。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    /// 桶起始时间（秒）
    pub time: i64,
    pub open: Decimal,
    pub close: Decimal,
    pub low: Decimal,
    pub high: Decimal,
    /// 成交量（基础币）
    pub amount: Decimal,
    /// 成交额（计价币）
    pub vol: Decimal,
    /// 成交笔数
    pub count: i64,
}

impl Candle {
    /// 创建一根空K线，价格字段为未设置的哨兵值 0
    pub fn empty(time: i64) -> Self {
        Self {
            time,
            open: Decimal::ZERO,
            close: Decimal::ZERO,
            low: Decimal::ZERO,
            high: Decimal::ZERO,
            amount: Decimal::ZERO,
            vol: Decimal::ZERO,
            count: 0,
        }
    }
}

/// 价格字段是否仍是哨兵值
pub fn is_unset(value: Decimal) -> bool {
    value <= Decimal::ZERO
}

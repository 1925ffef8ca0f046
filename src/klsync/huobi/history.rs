// 火币历史K线接口
use super::message::decimal_from_json;
use crate::klcommon::{AppError, Candle, HttpClient, Period, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

pub const HISTORY_KLINE_PATH: &str = "/market/history/kline";

/// 单次拉取的K线数量，接口上限
pub const HISTORY_PAGE_SIZE: usize = 2000;

/// 火币接口使用的周期代码
pub fn huobi_period_code(period: Period) -> &'static str {
    match period {
        Period::Hour1 => "60min",
        Period::Month1 => "1mon",
        other => other.name(),
    }
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct HistoryResponse {
    #[serde(default)]
    ch: String,
    #[serde(default)]
    ts: i64,
    #[serde(default)]
    status: String,
    data: Option<Value>,
    #[serde(rename = "err-msg")]
    err_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryBar {
    id: i64,
    #[serde(deserialize_with = "decimal_from_json")]
    open: Decimal,
    #[serde(deserialize_with = "decimal_from_json")]
    close: Decimal,
    #[serde(deserialize_with = "decimal_from_json")]
    low: Decimal,
    #[serde(deserialize_with = "decimal_from_json")]
    high: Decimal,
    #[serde(deserialize_with = "decimal_from_json")]
    amount: Decimal,
    #[serde(deserialize_with = "decimal_from_json")]
    vol: Decimal,
    #[serde(default)]
    count: i64,
}

impl From<HistoryBar> for Candle {
    fn from(bar: HistoryBar) -> Self {
        Candle {
            time: bar.id,
            open: bar.open,
            close: bar.close,
            low: bar.low,
            high: bar.high,
            amount: bar.amount,
            vol: bar.vol,
            count: bar.count,
        }
    }
}

/// 拉取一页历史K线（最新的在前），不做翻页
#[instrument(target = "huobi", skip(http), err)]
pub async fn fetch_history(http: &HttpClient, symbol: &str, period: Period) -> Result<Vec<Candle>> {
    let params = [
        ("symbol", symbol.to_string()),
        ("period", huobi_period_code(period).to_string()),
        ("size", HISTORY_PAGE_SIZE.to_string()),
    ];

    let response: HistoryResponse = http.get(HISTORY_KLINE_PATH, &params).await?;
    let candles = decode_history(response)?;
    debug!(target: "huobi", "{} {} 历史K线 {} 根", symbol, period, candles.len());
    Ok(candles)
}

fn decode_history(response: HistoryResponse) -> Result<Vec<Candle>> {
    if response.status != "ok" {
        return Err(AppError::DecodeError(format!(
            "历史K线接口返回状态 {:?}: {}",
            response.status,
            response.err_msg.unwrap_or_default()
        )));
    }

    let data = response
        .data
        .ok_or_else(|| AppError::DecodeError("历史K线响应缺少 data".to_string()))?;
    let bars: Vec<HistoryBar> = serde_json::from_value(data)
        .map_err(|e| AppError::DecodeError(format!("历史K线 data 格式不符: {}", e)))?;

    Ok(bars.into_iter().map(Candle::from).collect())
}

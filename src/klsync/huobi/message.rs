// 火币 websocket 报文：解压、分类、解码成交
use crate::klcommon::{AppError, Result, TradeEvent};
use flate2::read::GzDecoder;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::io::Read;
use std::str::FromStr;

/// gzip 解压
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 4);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| AppError::DecodeError(format!("gzip解压失败: {}", e)))?;
    Ok(out)
}

/// 把 JSON 数字按其文本精确解析成 Decimal，也接受字符串形式的数字
pub fn decimal_from_json<'de, D>(deserializer: D) -> std::result::Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let text = match Value::deserialize(deserializer)? {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s,
        other => return Err(serde::de::Error::custom(format!("期望数字，实际为 {}", other))),
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| serde::de::Error::custom(format!("无法解析数字 {}: {}", text, e)))
}

/// 订阅成交明细的请求帧
pub fn subscribe_frame(symbol: &str, now_secs: i64) -> String {
    json!({
        "sub": trade_channel(symbol),
        "id": now_secs.to_string(),
    })
    .to_string()
}

/// 心跳回复帧
pub fn pong_frame(now_ms: i64) -> String {
    json!({ "pong": now_ms }).to_string()
}

pub fn trade_channel(symbol: &str) -> String {
    format!("market.{}.trade.detail", symbol)
}

/// 从 `market.<symbol>.trade.detail` 中取出交易对
fn trade_channel_symbol(ch: &str) -> Option<&str> {
    let mut parts = ch.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("market"), Some(symbol), Some("trade"), Some("detail"), None) if !symbol.is_empty() => Some(symbol),
        _ => None,
    }
}

/// 服务端推送的外层结构
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    ping: i64,
    ch: Option<String>,
    tick: Option<Value>,
    status: Option<String>,
    subbed: Option<String>,
    #[serde(rename = "err-code")]
    err_code: Option<String>,
    #[serde(rename = "err-msg")]
    err_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TradeTick {
    #[serde(default)]
    ts: i64,
    data: Vec<TradeItem>,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct TradeItem {
    #[serde(default)]
    ts: i64,
    #[serde(rename = "tradeId", default)]
    trade_id: i64,
    #[serde(deserialize_with = "decimal_from_json")]
    amount: Decimal,
    #[serde(deserialize_with = "decimal_from_json")]
    price: Decimal,
    #[serde(default)]
    direction: String,
}

/// 分类后的服务端消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HuobiMessage {
    /// 应用层心跳，需要回 pong
    Ping(i64),
    Trades(Vec<TradeEvent>),
    /// 订阅确认
    Subscribed(String),
    /// 服务端返回的错误
    ServerError { code: String, message: String },
    /// 其他频道或无法识别的消息
    Ignored,
}

/// 解析一条已解压的消息
pub fn classify(payload: &[u8]) -> Result<HuobiMessage> {
    let envelope: Envelope = serde_json::from_slice(payload)?;

    if envelope.ping > 0 {
        return Ok(HuobiMessage::Ping(envelope.ping));
    }

    if let Some(ch) = envelope.ch.as_deref() {
        let Some(symbol) = trade_channel_symbol(ch) else {
            return Ok(HuobiMessage::Ignored);
        };
        let tick = envelope
            .tick
            .ok_or_else(|| AppError::DecodeError(format!("{} 的消息缺少 tick", ch)))?;
        return decode_trades(symbol, tick).map(HuobiMessage::Trades);
    }

    match envelope.status.as_deref() {
        Some("ok") => Ok(envelope
            .subbed
            .map_or(HuobiMessage::Ignored, HuobiMessage::Subscribed)),
        Some("error") => Ok(HuobiMessage::ServerError {
            code: envelope.err_code.unwrap_or_default(),
            message: envelope.err_msg.unwrap_or_default(),
        }),
        _ => Ok(HuobiMessage::Ignored),
    }
}

fn decode_trades(symbol: &str, tick: Value) -> Result<Vec<TradeEvent>> {
    let tick: TradeTick = serde_json::from_value(tick)
        .map_err(|e| AppError::DecodeError(format!("解析 {} 的成交明细失败: {}", symbol, e)))?;

    Ok(tick
        .data
        .into_iter()
        .map(|item| {
            // 毫秒转秒，tick 自身没有时间时退回到单笔成交的时间
            let ts_ms = if tick.ts > 0 { tick.ts } else { item.ts };
            TradeEvent {
                symbol: symbol.to_string(),
                timestamp: ts_ms / 1000,
                price: item.price,
                amount: item.amount,
            }
        })
        .collect())
}

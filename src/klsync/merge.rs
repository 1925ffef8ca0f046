use crate::klcommon::models::{is_unset, Candle};
use crate::klcommon::{AppError, Result};
use rust_decimal::Decimal;

/// 把一笔成交合并进K线
///
/// 价格字段未设置（<= 0）时直接取成交价；成交量、成交额累加，笔数加一。
/// 全程十进制精确运算，溢出时返回 `DecodeError`，调用方丢弃该笔成交。
pub fn merge_trade(mut candle: Candle, price: Decimal, amount: Decimal) -> Result<Candle> {
    let turnover = amount
        .checked_mul(price)
        .ok_or_else(|| AppError::DecodeError(format!("成交额溢出: {} x {}", amount, price)))?;
    let total_amount = candle
        .amount
        .checked_add(amount)
        .ok_or_else(|| AppError::DecodeError(format!("成交量溢出: {} + {}", candle.amount, amount)))?;
    let total_vol = candle
        .vol
        .checked_add(turnover)
        .ok_or_else(|| AppError::DecodeError(format!("成交额溢出: {} + {}", candle.vol, turnover)))?;

    if is_unset(candle.open) {
        candle.open = price;
    }
    candle.close = price;

    candle.low = if is_unset(candle.low) { price } else { candle.low.min(price) };
    candle.high = if is_unset(candle.high) { price } else { candle.high.max(price) };

    candle.amount = total_amount;
    candle.vol = total_vol;
    candle.count += 1;

    Ok(candle)
}

//! K线周期表与时间分桶
//!
//! 周期表是进程级的只读数据，第一次访问时初始化，之后无需任何同步。
//! 固定周期按秒取模对齐；`1day` / `1week` 需要按交易所的 UTC+8 边界校正；
//! `1month` / `1year` 没有固定时长，按交易所本地（UTC+8）日历拆解计算，
//! 因此月线、年线的起点总是某根日线的起点。

use crate::klcommon::{AppError, Result};
use chrono::{DateTime, Datelike, FixedOffset, Months, TimeZone, Utc};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub const MINUTE_SECS: i64 = 60;
pub const HOUR_SECS: i64 = 60 * MINUTE_SECS;
pub const DAY_SECS: i64 = 24 * HOUR_SECS;
pub const WEEK_SECS: i64 = 7 * DAY_SECS;

/// 交易所的交易日从 UTC+8 的零点开始
pub const EXCHANGE_UTC_OFFSET_SECS: i64 = 8 * HOUR_SECS;

/// 日线对齐锚点：UTC+8 零点 = 前一天 UTC 16:00
pub const DAY_ANCHOR_SECS: i64 = -EXCHANGE_UTC_OFFSET_SECS;

/// 周线对齐锚点：纪元是周四，往后 4 天是周一，再减去 8 小时
pub const WEEK_ANCHOR_SECS: i64 = 4 * DAY_SECS - EXCHANGE_UTC_OFFSET_SECS;

/// 支持的K线周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Period {
    Min1,
    Min5,
    Min15,
    Min30,
    Hour1,
    Hour4,
    Day1,
    Week1,
    Month1,
    Year1,
}

struct PeriodSpec {
    period: Period,
    name: &'static str,
    aliases: &'static [&'static str],
    /// 固定时长（秒），日历周期为 0
    seconds: i64,
    /// 对齐锚点（秒），桶起点满足 (start - anchor) % seconds == 0
    anchor: i64,
}

static PERIOD_TABLE: [PeriodSpec; 10] = [
    PeriodSpec { period: Period::Min1, name: "1min", aliases: &["1m"], seconds: MINUTE_SECS, anchor: 0 },
    PeriodSpec { period: Period::Min5, name: "5min", aliases: &["5m"], seconds: 5 * MINUTE_SECS, anchor: 0 },
    PeriodSpec { period: Period::Min15, name: "15min", aliases: &["15m"], seconds: 15 * MINUTE_SECS, anchor: 0 },
    PeriodSpec { period: Period::Min30, name: "30min", aliases: &["30m"], seconds: 30 * MINUTE_SECS, anchor: 0 },
    PeriodSpec { period: Period::Hour1, name: "1hour", aliases: &["60min", "1h"], seconds: HOUR_SECS, anchor: 0 },
    PeriodSpec { period: Period::Hour4, name: "4hour", aliases: &["4h"], seconds: 4 * HOUR_SECS, anchor: 0 },
    PeriodSpec { period: Period::Day1, name: "1day", aliases: &["1d"], seconds: DAY_SECS, anchor: DAY_ANCHOR_SECS },
    PeriodSpec { period: Period::Week1, name: "1week", aliases: &["1w"], seconds: WEEK_SECS, anchor: WEEK_ANCHOR_SECS },
    PeriodSpec { period: Period::Month1, name: "1month", aliases: &["1mon", "1M"], seconds: 0, anchor: 0 },
    PeriodSpec { period: Period::Year1, name: "1year", aliases: &["1y"], seconds: 0, anchor: 0 },
];

/// 名称和别名到周期的索引（区分大小写，`1m` 是分钟，`1M` 是月）
static PERIOD_LOOKUP: Lazy<HashMap<&'static str, Period>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for spec in PERIOD_TABLE.iter() {
        map.insert(spec.name, spec.period);
        for alias in spec.aliases {
            map.insert(*alias, spec.period);
        }
    }
    map
});

impl Period {
    pub const ALL: [Period; 10] = [
        Period::Min1,
        Period::Min5,
        Period::Min15,
        Period::Min30,
        Period::Hour1,
        Period::Hour4,
        Period::Day1,
        Period::Week1,
        Period::Month1,
        Period::Year1,
    ];

    fn spec(self) -> &'static PeriodSpec {
        // 表的顺序和枚举声明顺序一致
        &PERIOD_TABLE[self as usize]
    }

    /// 规范名称，用于集合名和对外展示
    pub fn name(self) -> &'static str {
        self.spec().name
    }

    pub fn aliases(self) -> &'static [&'static str] {
        self.spec().aliases
    }

    /// 固定时长（秒），月线和年线返回 0
    pub fn seconds(self) -> i64 {
        self.spec().seconds
    }

    pub fn is_calendar(self) -> bool {
        self.spec().seconds == 0
    }

    /// 时区校正锚点（秒）
    pub fn anchor(self) -> i64 {
        self.spec().anchor
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Period {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        PERIOD_LOOKUP
            .get(s)
            .copied()
            .ok_or_else(|| AppError::UnsupportedPeriod(s.to_string()))
    }
}

impl TryFrom<String> for Period {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Period> for String {
    fn from(p: Period) -> Self {
        p.name().to_string()
    }
}

fn exchange_offset() -> Result<FixedOffset> {
    i32::try_from(EXCHANGE_UTC_OFFSET_SECS)
        .ok()
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| AppError::ConfigError(format!("无效的交易所时区偏移: {}", EXCHANGE_UTC_OFFSET_SECS)))
}

/// 把时间戳换算成交易所本地时间
fn to_exchange_local(ts: i64) -> Result<DateTime<FixedOffset>> {
    let offset = exchange_offset()?;
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.with_timezone(&offset))
        .ok_or_else(|| AppError::DecodeError(format!("时间戳超出范围: {}", ts)))
}

/// 交易所本地日历某月 1 日零点对应的时间戳
fn local_month_start(year: i32, month: u32) -> Result<i64> {
    exchange_offset()?
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(|dt| dt.timestamp())
        .ok_or_else(|| AppError::DecodeError(format!("无效日期: {}-{}", year, month)))
}

/// 计算时间戳所在K线桶的起始时间（秒）
///
/// 固定周期取满足 `(start - anchor) % seconds == 0` 且不大于 `ts` 的最大值，
/// 锚点参与取模，因此 `bucket(bucket(ts)) == bucket(ts)`。
pub fn bucket(ts: i64, period: Period) -> Result<i64> {
    match period {
        Period::Month1 => {
            let dt = to_exchange_local(ts)?;
            local_month_start(dt.year(), dt.month())
        }
        Period::Year1 => {
            let dt = to_exchange_local(ts)?;
            local_month_start(dt.year(), 1)
        }
        _ => {
            let seconds = period.seconds();
            Ok(ts - (ts - period.anchor()).rem_euclid(seconds))
        }
    }
}

/// 按名称分桶，未知周期返回 `UnsupportedPeriod`
pub fn bucket_by_name(ts: i64, period: &str) -> Result<i64> {
    bucket(ts, period.parse()?)
}

/// 计算 `bucket_start` 往前第 `n` 个桶的起始时间
///
/// 月线、年线按日历减法，其余按固定时长减法。
pub fn prev_bucket(bucket_start: i64, period: Period, n: u32) -> Result<i64> {
    let months = match period {
        Period::Month1 => n,
        Period::Year1 => n.checked_mul(12).ok_or_else(|| {
            AppError::DecodeError(format!("回溯年数过大: {}", n))
        })?,
        _ => return Ok(bucket_start - i64::from(n) * period.seconds()),
    };

    to_exchange_local(bucket_start)?
        .checked_sub_months(Months::new(months))
        .map(|dt| dt.timestamp())
        .ok_or_else(|| AppError::DecodeError(format!("日历回溯越界: {} - {} 个月", bucket_start, months)))
}

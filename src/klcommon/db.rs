use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::Candle;
use crate::klcommon::{DatabaseConfig, Period};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument};

// 数据库连接池类型
pub type DbPool = Pool<SqliteConnectionManager>;

/// 集合名：`<symbol>_<规范周期名>`，统一小写
pub fn collection_name(symbol: &str, period: Period) -> String {
    format!("{}_{}", symbol, period.name()).to_lowercase()
}

/// 集合名会被拼进 SQL，只允许小写字母、数字和下划线
fn validate_collection_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AppError::StorageError(format!("非法的集合名: {:?}", name)))
    }
}

/// K线存储能力
///
/// 每个 `(symbol, period)` 对应一个集合，集合内以 `time` 为键。
pub trait CandleStore: Send + Sync + 'static {
    /// 集合中是否已有任意文档
    fn has_any(&self, collection: &str) -> Result<bool>;

    fn find_one(&self, collection: &str, time: i64) -> Result<Option<Candle>>;

    fn insert_one(&self, collection: &str, candle: &Candle) -> Result<()>;

    /// 批量写入，同一 `time` 已存在时以本次写入为准
    fn insert_many(&self, collection: &str, candles: &[Candle]) -> Result<usize>;

    /// 按 `time` 整体替换，返回是否命中
    fn update_one(&self, collection: &str, candle: &Candle) -> Result<bool>;

    /// 按时间倒序分页读取，`before` 为 Some 时只取更早的K线；`page` 从 1 开始
    fn find_page(&self, collection: &str, before: Option<i64>, page: u32, limit: u32) -> Result<Vec<Candle>>;

    /// 原子的读-改-写：读出 `time` 对应的K线（可能不存在），交给 `f` 计算新值后写回
    ///
    /// `f` 返回错误时不写入任何数据。
    fn upsert_with<F>(&self, collection: &str, time: i64, f: F) -> Result<Candle>
    where
        F: FnOnce(Option<Candle>) -> Result<Candle>;
}

/// 在阻塞线程池上执行存储操作
pub async fn with_store<S, T, F>(store: Arc<S>, f: F) -> Result<T>
where
    S: CandleStore,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| AppError::StorageError(format!("存储任务异常退出: {}", e)))?
}

fn page_offset(page: u32, limit: u32) -> Result<(i64, i64)> {
    if page == 0 || limit == 0 {
        return Err(AppError::StorageError(format!("无效的分页参数: page={}, limit={}", page, limit)));
    }
    Ok((i64::from(limit), i64::from(page - 1) * i64::from(limit)))
}

//=============================================================================
// SQLite 实现
//=============================================================================

/// 从数据库读出的原始行，价格以文本保存
struct CandleRow {
    time: i64,
    open: String,
    close: String,
    low: String,
    high: String,
    amount: String,
    vol: String,
    count: i64,
}

impl CandleRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            time: row.get(0)?,
            open: row.get(1)?,
            close: row.get(2)?,
            low: row.get(3)?,
            high: row.get(4)?,
            amount: row.get(5)?,
            vol: row.get(6)?,
            count: row.get(7)?,
        })
    }

    fn into_candle(self) -> Result<Candle> {
        let parse = |field: &str, value: &str| {
            Decimal::from_str(value)
                .map_err(|e| AppError::StorageError(format!("字段 {} 的值 {:?} 不是合法数字: {}", field, value, e)))
        };
        Ok(Candle {
            time: self.time,
            open: parse("open", &self.open)?,
            close: parse("close", &self.close)?,
            low: parse("low", &self.low)?,
            high: parse("high", &self.high)?,
            amount: parse("amount", &self.amount)?,
            vol: parse("vol", &self.vol)?,
            count: self.count,
        })
    }
}

const SELECT_COLUMNS: &str = "time, open, close, low, high, amount, vol, count";

/// 基于 SQLite 的K线存储，一个集合一张表
pub struct SqliteCandleStore {
    pool: DbPool,
    /// 已确认存在的表，避免每次写入都执行建表语句
    ensured_tables: Mutex<HashSet<String>>,
}

impl SqliteCandleStore {
    /// 打开数据库（不存在时创建）
    #[instrument(skip(config), fields(db_path = %config.database_path), err)]
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let db_path = Path::new(&config.database_path);

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let enable_wal = config.enable_wal;
        let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
            if enable_wal {
                conn.execute_batch(
                    "PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;",
                )?;
            }
            conn.execute_batch(
                "PRAGMA temp_store = MEMORY;
                 PRAGMA busy_timeout = 5000;",
            )
        });

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .build(manager)
            .map_err(|e| AppError::StorageError(format!("创建连接池失败: {}", e)))?;

        info!(target: "db", log_type = "module", "SQLite数据库已打开: {} (WAL={})", db_path.display(), enable_wal);

        Ok(Self {
            pool,
            ensured_tables: Mutex::new(HashSet::new()),
        })
    }

    fn ensure_table(&self, conn: &Connection, collection: &str) -> Result<()> {
        validate_collection_name(collection)?;

        {
            let ensured = self
                .ensured_tables
                .lock()
                .map_err(|_| AppError::StorageError("表缓存锁已中毒".to_string()))?;
            if ensured.contains(collection) {
                return Ok(());
            }
        }

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (
                    time INTEGER PRIMARY KEY,
                    open TEXT NOT NULL,
                    close TEXT NOT NULL,
                    low TEXT NOT NULL,
                    high TEXT NOT NULL,
                    amount TEXT NOT NULL,
                    vol TEXT NOT NULL,
                    count INTEGER NOT NULL
                )",
                collection
            ),
            [],
        )?;

        debug!(target: "db", "集合 {} 已确认存在", collection);
        self.ensured_tables
            .lock()
            .map_err(|_| AppError::StorageError("表缓存锁已中毒".to_string()))?
            .insert(collection.to_string());
        Ok(())
    }

    fn select_one(conn: &Connection, collection: &str, time: i64) -> Result<Option<Candle>> {
        let row = conn
            .query_row(
                &format!("SELECT {} FROM \"{}\" WHERE time = ?1", SELECT_COLUMNS, collection),
                params![time],
                CandleRow::from_row,
            )
            .optional()?;
        row.map(CandleRow::into_candle).transpose()
    }

    fn write_candle(conn: &Connection, collection: &str, candle: &Candle, on_conflict_replace: bool) -> Result<()> {
        let verb = if on_conflict_replace { "INSERT OR REPLACE" } else { "INSERT" };
        conn.execute(
            &format!(
                "{} INTO \"{}\" (time, open, close, low, high, amount, vol, count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                verb, collection
            ),
            params![
                candle.time,
                candle.open.to_string(),
                candle.close.to_string(),
                candle.low.to_string(),
                candle.high.to_string(),
                candle.amount.to_string(),
                candle.vol.to_string(),
                candle.count,
            ],
        )?;
        Ok(())
    }
}

impl CandleStore for SqliteCandleStore {
    fn has_any(&self, collection: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        self.ensure_table(&conn, collection)?;
        let found = conn
            .query_row(&format!("SELECT 1 FROM \"{}\" LIMIT 1", collection), [], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    fn find_one(&self, collection: &str, time: i64) -> Result<Option<Candle>> {
        let conn = self.pool.get()?;
        self.ensure_table(&conn, collection)?;
        Self::select_one(&conn, collection, time)
    }

    fn insert_one(&self, collection: &str, candle: &Candle) -> Result<()> {
        let conn = self.pool.get()?;
        self.ensure_table(&conn, collection)?;
        Self::write_candle(&conn, collection, candle, false)
    }

    #[instrument(target = "db", skip(self, candles), fields(count = candles.len()), err)]
    fn insert_many(&self, collection: &str, candles: &[Candle]) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }

        let mut conn = self.pool.get()?;
        self.ensure_table(&conn, collection)?;

        let tx = conn.transaction()?;
        for candle in candles {
            Self::write_candle(&tx, collection, candle, true)?;
        }
        tx.commit()?;

        Ok(candles.len())
    }

    fn update_one(&self, collection: &str, candle: &Candle) -> Result<bool> {
        let conn = self.pool.get()?;
        self.ensure_table(&conn, collection)?;
        let changed = conn.execute(
            &format!(
                "UPDATE \"{}\" SET open = ?2, close = ?3, low = ?4, high = ?5, amount = ?6, vol = ?7, count = ?8
                 WHERE time = ?1",
                collection
            ),
            params![
                candle.time,
                candle.open.to_string(),
                candle.close.to_string(),
                candle.low.to_string(),
                candle.high.to_string(),
                candle.amount.to_string(),
                candle.vol.to_string(),
                candle.count,
            ],
        )?;
        Ok(changed > 0)
    }

    fn find_page(&self, collection: &str, before: Option<i64>, page: u32, limit: u32) -> Result<Vec<Candle>> {
        let (limit, offset) = page_offset(page, limit)?;
        let conn = self.pool.get()?;
        self.ensure_table(&conn, collection)?;

        let rows = match before {
            Some(before) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM \"{}\" WHERE time < ?1 ORDER BY time DESC LIMIT ?2 OFFSET ?3",
                    SELECT_COLUMNS, collection
                ))?;
                let rows = stmt
                    .query_map(params![before, limit, offset], CandleRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM \"{}\" ORDER BY time DESC LIMIT ?1 OFFSET ?2",
                    SELECT_COLUMNS, collection
                ))?;
                let rows = stmt
                    .query_map(params![limit, offset], CandleRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };

        rows.into_iter().map(CandleRow::into_candle).collect()
    }

    fn upsert_with<F>(&self, collection: &str, time: i64, f: F) -> Result<Candle>
    where
        F: FnOnce(Option<Candle>) -> Result<Candle>,
    {
        let mut conn = self.pool.get()?;
        self.ensure_table(&conn, collection)?;

        // IMMEDIATE 事务在读之前就拿到写锁，读-改-写整体原子
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing = Self::select_one(&tx, collection, time)?;
        // 出错时事务随 tx 一起回滚
        let updated = f(existing)?;
        Self::write_candle(&tx, collection, &updated, true)?;
        tx.commit()?;

        Ok(updated)
    }
}

//=============================================================================
// 内存实现
//=============================================================================

/// 进程内K线存储，用于测试和不落盘的试运行
#[derive(Debug, Default)]
pub struct MemoryCandleStore {
    collections: Mutex<HashMap<String, BTreeMap<i64, Candle>>>,
}

impl MemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, BTreeMap<i64, Candle>>>> {
        self.collections
            .lock()
            .map_err(|_| AppError::StorageError("内存存储锁已中毒".to_string()))
    }

    /// 集合内K线数量
    pub fn len(&self, collection: &str) -> usize {
        self.lock()
            .map(|c| c.get(collection).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

impl CandleStore for MemoryCandleStore {
    fn has_any(&self, collection: &str) -> Result<bool> {
        Ok(self.lock()?.get(collection).is_some_and(|c| !c.is_empty()))
    }

    fn find_one(&self, collection: &str, time: i64) -> Result<Option<Candle>> {
        Ok(self.lock()?.get(collection).and_then(|c| c.get(&time)).cloned())
    }

    fn insert_one(&self, collection: &str, candle: &Candle) -> Result<()> {
        let mut guard = self.lock()?;
        let docs = guard.entry(collection.to_string()).or_default();
        if docs.contains_key(&candle.time) {
            return Err(AppError::StorageError(format!("{} 中已存在 time={} 的K线", collection, candle.time)));
        }
        docs.insert(candle.time, candle.clone());
        Ok(())
    }

    fn insert_many(&self, collection: &str, candles: &[Candle]) -> Result<usize> {
        let mut guard = self.lock()?;
        let docs = guard.entry(collection.to_string()).or_default();
        for candle in candles {
            docs.insert(candle.time, candle.clone());
        }
        Ok(candles.len())
    }

    fn update_one(&self, collection: &str, candle: &Candle) -> Result<bool> {
        let mut guard = self.lock()?;
        match guard.get_mut(collection).and_then(|c| c.get_mut(&candle.time)) {
            Some(existing) => {
                *existing = candle.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn find_page(&self, collection: &str, before: Option<i64>, page: u32, limit: u32) -> Result<Vec<Candle>> {
        let (limit, offset) = page_offset(page, limit)?;
        let guard = self.lock()?;
        let Some(docs) = guard.get(collection) else {
            return Ok(Vec::new());
        };

        let upper = before.unwrap_or(i64::MAX);
        Ok(docs
            .range(..upper)
            .rev()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|(_, c)| c.clone())
            .collect())
    }

    fn upsert_with<F>(&self, collection: &str, time: i64, f: F) -> Result<Candle>
    where
        F: FnOnce(Option<Candle>) -> Result<Candle>,
    {
        let mut guard = self.lock()?;
        let existing = guard.get(collection).and_then(|docs| docs.get(&time)).cloned();
        let updated = f(existing)?;
        guard.entry(collection.to_string()).or_default().insert(time, updated.clone());
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::path::PathBuf;

    fn candle(time: i64, close: i64) -> Candle {
        Candle {
            time,
            open: Decimal::from(close),
            close: Decimal::from(close),
            low: Decimal::from(close),
            high: Decimal::from(close),
            amount: Decimal::new(15, 1),
            vol: Decimal::from(close) * Decimal::new(15, 1),
            count: 1,
        }
    }

    fn temp_db_path(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        std::env::temp_dir().join(format!("kline_sync_{}_{}_{}.db", name, std::process::id(), nanos))
    }

    fn sqlite_store(name: &str) -> SqliteCandleStore {
        let config = DatabaseConfig {
            database_path: temp_db_path(name).to_string_lossy().into_owned(),
            pool_size: 2,
            enable_wal: true,
        };
        SqliteCandleStore::open(&config).unwrap()
    }

    fn exercise_store<S: CandleStore>(store: &S) {
        let coll = collection_name("ETHUSDT", Period::Min1);
        assert_eq!(coll, "ethusdt_1min");

        assert!(!store.has_any(&coll).unwrap());
        assert!(store.find_one(&coll, 60).unwrap().is_none());

        store.insert_one(&coll, &candle(60, 10)).unwrap();
        assert!(store.has_any(&coll).unwrap());
        assert!(store.insert_one(&coll, &candle(60, 11)).is_err());

        let inserted = store
            .insert_many(&coll, &[candle(120, 12), candle(180, 13), candle(240, 14)])
            .unwrap();
        assert_eq!(inserted, 3);

        assert!(store.update_one(&coll, &candle(120, 20)).unwrap());
        assert!(!store.update_one(&coll, &candle(999, 20)).unwrap());
        assert_eq!(store.find_one(&coll, 120).unwrap().unwrap().close, Decimal::from(20));

        let page1 = store.find_page(&coll, None, 1, 2).unwrap();
        assert_eq!(page1.iter().map(|c| c.time).collect::<Vec<_>>(), vec![240, 180]);
        let page2 = store.find_page(&coll, None, 2, 2).unwrap();
        assert_eq!(page2.iter().map(|c| c.time).collect::<Vec<_>>(), vec![120, 60]);
        let before = store.find_page(&coll, Some(180), 1, 10).unwrap();
        assert_eq!(before.iter().map(|c| c.time).collect::<Vec<_>>(), vec![120, 60]);
        assert!(store.find_page(&coll, None, 0, 10).is_err());

        let created = store
            .upsert_with(&coll, 300, |existing| {
                assert!(existing.is_none());
                Ok(candle(300, 30))
            })
            .unwrap();
        assert_eq!(created.time, 300);
        let replaced = store
            .upsert_with(&coll, 300, |existing| {
                let mut c = existing.unwrap();
                c.count += 1;
                Ok(c)
            })
            .unwrap();
        assert_eq!(replaced.count, 2);
        assert_eq!(store.find_one(&coll, 300).unwrap().unwrap().count, 2);

        // 计算失败时原值保持不变，新集合也不会被创建
        let failed = store.upsert_with(&coll, 300, |_| Err(AppError::DecodeError("overflow".to_string())));
        assert!(matches!(failed, Err(AppError::DecodeError(_))));
        assert_eq!(store.find_one(&coll, 300).unwrap().unwrap().count, 2);
        assert!(store
            .upsert_with("ethusdt_5min", 300, |_| Err(AppError::DecodeError("overflow".to_string())))
            .is_err());
        assert!(!store.has_any("ethusdt_5min").unwrap());
    }

    #[test]
    fn test_memory_store_operations() {
        let store = MemoryCandleStore::new();
        exercise_store(&store);
        assert_eq!(store.len("ethusdt_1min"), 5);
    }

    #[test]
    fn test_sqlite_store_operations() {
        let store = sqlite_store("ops");
        exercise_store(&store);
    }

    #[test]
    fn test_sqlite_keeps_decimal_text_exact() {
        let store = sqlite_store("exact");
        let coll = collection_name("btcusdt", Period::Day1);
        let mut c = Candle::empty(1_699_977_600);
        c.amount = Decimal::from_str("0.30000000").unwrap();
        c.vol = Decimal::from_str("12345.678901234567").unwrap();
        store.insert_one(&coll, &c).unwrap();

        let back = store.find_one(&coll, c.time).unwrap().unwrap();
        assert_eq!(back, c);
        assert_eq!(back.vol.to_string(), "12345.678901234567");
    }

    #[test]
    fn test_rejects_unsafe_collection_name() {
        let store = MemoryCandleStore::new();
        assert!(store.has_any("ok_name").is_ok());
        let sqlite = sqlite_store("unsafe");
        assert!(matches!(sqlite.has_any("x\"; DROP TABLE y; --"), Err(AppError::StorageError(_))));
    }
}

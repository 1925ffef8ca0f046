//! SQLite 存储：并发合并不丢更新、重开后数据仍在

use kline_sync::klcommon::{
    bucket, collection_name, with_store, Candle, CandleStore, DatabaseConfig, Period, SqliteCandleStore,
};
use kline_sync::klsync::merge_trade;
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;

fn temp_config(name: &str) -> DatabaseConfig {
    let path: PathBuf = std::env::temp_dir().join(format!("kline_sync_store_{}_{}.db", name, std::process::id()));
    let _ = std::fs::remove_file(&path);
    DatabaseConfig {
        database_path: path.to_string_lossy().into_owned(),
        pool_size: 8,
        enable_wal: true,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_upserts_do_not_lose_updates() {
    let store = Arc::new(SqliteCandleStore::open(&temp_config("concurrent")).unwrap());
    let start = bucket(1_700_000_000, Period::Min1).unwrap();
    let collection = collection_name("ETHUSDT", Period::Min1);

    let mut tasks = Vec::new();
    for i in 0..40 {
        let store = store.clone();
        let collection = collection.clone();
        tasks.push(tokio::spawn(with_store(store, move |s| {
            s.upsert_with(&collection, start, |existing| {
                merge_trade(
                    existing.unwrap_or_else(|| Candle::empty(start)),
                    Decimal::from(100 + i % 7),
                    Decimal::new(1, 1),
                )
            })
        })));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let candle = store.find_one(&collection, start).unwrap().unwrap();
    assert_eq!(candle.count, 40);
    assert_eq!(candle.amount, Decimal::from(4));
    assert_eq!(candle.low, Decimal::from(100));
    assert_eq!(candle.high, Decimal::from(106));
}

#[test]
fn test_data_survives_reopen() {
    let config = temp_config("reopen");
    let collection = collection_name("btcusdt", Period::Month1);
    let start = bucket(1_700_000_000, Period::Month1).unwrap();

    {
        let store = SqliteCandleStore::open(&config).unwrap();
        let candle = merge_trade(Candle::empty(start), Decimal::new(3650012, 2), Decimal::new(5, 3)).unwrap();
        store.insert_one(&collection, &candle).unwrap();
    }

    let store = SqliteCandleStore::open(&config).unwrap();
    assert!(store.has_any(&collection).unwrap());
    let candle = store.find_one(&collection, start).unwrap().unwrap();
    assert_eq!(candle.open.to_string(), "36500.12");
    assert_eq!(candle.vol, Decimal::new(3650012, 2) * Decimal::new(5, 3));
}

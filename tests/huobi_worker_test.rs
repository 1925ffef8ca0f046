//! 火币 worker：心跳、成交解码、订阅、重连上限、历史接口

mod common;

use common::{gz_frame, spawn_history_server, unused_http_url, Dial, ScriptedConnector, Step};
use kline_sync::klcommon::{AppError, HttpClient, Period, TradeEvent, WsFrame};
use kline_sync::klsync::huobi::HuobiWorker;
use kline_sync::klsync::{ExchangeWorker, ReconnectPolicy, WorkerState};
use rust_decimal::Decimal;
use serde_json::json;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn worker_with(
    connector: ScriptedConnector,
    symbols: &[&str],
    policy: ReconnectPolicy,
) -> kline_sync::klcommon::Result<HuobiWorker<ScriptedConnector>> {
    let http = HttpClient::new(&unused_http_url(), None).unwrap();
    let symbols = symbols.iter().map(|s| s.to_string()).collect();
    Ok(HuobiWorker::with_connector(connector, http, symbols).await?.with_policy(policy))
}

/// 运行 worker 直到结束，返回结果和收到的全部成交
async fn run_to_end(worker: &HuobiWorker<ScriptedConnector>) -> (kline_sync::klcommon::Result<()>, Vec<TradeEvent>) {
    let (tx, mut rx) = mpsc::channel(1024);
    let result = tokio::time::timeout(TEST_TIMEOUT, worker.run(tx))
        .await
        .expect("worker did not finish in time");
    let mut trades = Vec::new();
    while let Ok(trade) = rx.try_recv() {
        trades.push(trade);
    }
    (result, trades)
}

fn trade_frame(symbol: &str, tick_ts: i64, items: &[(&str, &str)]) -> Step {
    let data: Vec<_> = items
        .iter()
        .enumerate()
        .map(|(i, (price, amount))| {
            json!({
                "id": i,
                "ts": tick_ts,
                "tradeId": 1000 + i,
                "amount": serde_json::Number::from_str(amount).unwrap(),
                "price": serde_json::Number::from_str(price).unwrap(),
                "direction": "buy",
            })
        })
        .collect();
    gz_frame(json!({
        "ch": format!("market.{}.trade.detail", symbol),
        "ts": tick_ts + 5,
        "tick": { "id": 1, "ts": tick_ts, "data": data },
    }))
}

#[tokio::test]
async fn test_ping_pong_and_trade_decoding() {
    let connector = ScriptedConnector::new(vec![Dial::Connect(vec![
        gz_frame(json!({"id": "1", "status": "ok", "subbed": "market.ethusdt.trade.detail", "ts": 1})),
        gz_frame(json!({"ping": 1_700_000_000_000i64})),
        Step::Frame(WsFrame::Ping(vec![7, 7])),
        Step::Frame(WsFrame::Binary(b"definitely not gzip".to_vec())),
        trade_frame("ethusdt", 1_700_000_040_123, &[("2012.34", "0.1"), ("2012.3", "1.5")]),
        gz_frame(json!({"ch": "market.ethusdt.kline.1min", "tick": {"id": 1}})),
        Step::Fail,
    ])]);
    let recorder = connector.recorder.clone();
    let dials = connector.dial_count.clone();

    let worker = worker_with(connector, &["ethusdt", "btcusdt"], ReconnectPolicy::immediate(0))
        .await
        .unwrap();
    let (result, trades) = run_to_end(&worker).await;

    assert!(matches!(result, Err(AppError::ReconnectExhausted(0))));
    assert_eq!(dials.load(Ordering::SeqCst), 1);

    assert_eq!(
        recorder.subscriptions(),
        vec!["market.ethusdt.trade.detail".to_string(), "market.btcusdt.trade.detail".to_string()]
    );
    let sent = recorder.json_texts();
    assert!(sent.iter().any(|v| v.get("pong").and_then(|p| p.as_i64()).is_some_and(|p| p > 0)));
    assert_eq!(*recorder.pongs.lock().unwrap(), vec![vec![7, 7]]);

    assert_eq!(trades.len(), 2);
    assert_eq!(trades[0].symbol, "ethusdt");
    assert_eq!(trades[0].timestamp, 1_700_000_040);
    assert_eq!(trades[0].price, Decimal::from_str("2012.34").unwrap());
    assert_eq!(trades[0].amount, Decimal::from_str("0.1").unwrap());
    assert_eq!(trades[1].amount, Decimal::from_str("1.5").unwrap());
}

#[tokio::test]
async fn test_reconnect_ceiling_is_ten_retries() {
    // 首条连接立刻失败，之后所有拨号都被拒绝
    let connector = ScriptedConnector::new(vec![Dial::Connect(vec![Step::Fail])]);
    let dials = connector.dial_count.clone();

    let worker = worker_with(connector, &["ethusdt"], ReconnectPolicy::immediate(10))
        .await
        .unwrap();
    let state = worker.state();
    let (result, trades) = run_to_end(&worker).await;

    assert!(matches!(result, Err(AppError::ReconnectExhausted(10))));
    assert!(trades.is_empty());
    // 1 次初始拨号 + 10 次重连
    assert_eq!(dials.load(Ordering::SeqCst), 11);
    assert_eq!(*state.borrow(), WorkerState::Failed);
}

#[tokio::test]
async fn test_successful_frame_resets_failure_counter() {
    let ack = || gz_frame(json!({"status": "ok", "subbed": "market.ethusdt.trade.detail"}));
    let connector = ScriptedConnector::new(vec![
        Dial::Connect(vec![ack(), Step::Fail]),
        Dial::Refuse,
        Dial::Connect(vec![ack(), Step::Fail]),
        Dial::Refuse,
        Dial::Refuse,
    ]);
    let recorder = connector.recorder.clone();
    let dials = connector.dial_count.clone();

    let worker = worker_with(connector, &["ethusdt"], ReconnectPolicy::immediate(2))
        .await
        .unwrap();
    let (result, _) = run_to_end(&worker).await;

    assert!(matches!(result, Err(AppError::ReconnectExhausted(2))));
    assert_eq!(dials.load(Ordering::SeqCst), 5);
    // 每次重连成功后都会重新订阅
    assert_eq!(recorder.subscriptions().len(), 2);
}

#[tokio::test]
async fn test_initial_dial_failure_is_returned() {
    let connector = ScriptedConnector::new(vec![Dial::Refuse]);
    let err = worker_with(connector, &["ethusdt"], ReconnectPolicy::default())
        .await
        .err()
        .expect("initial dial must fail");
    assert!(matches!(err, AppError::TransportError(_)));
}

#[tokio::test]
async fn test_close_is_idempotent_and_stops_run() {
    let connector = ScriptedConnector::new(vec![Dial::Connect(vec![])]);
    let recorder = connector.recorder.clone();
    let worker = worker_with(connector, &["ethusdt"], ReconnectPolicy::default())
        .await
        .unwrap();

    worker.close().await.unwrap();
    worker.close().await.unwrap();
    assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    assert_eq!(*worker.state().borrow(), WorkerState::Disconnected);

    let (result, trades) = run_to_end(&worker).await;
    assert!(result.is_ok());
    assert!(trades.is_empty());
    assert!(recorder.subscriptions().is_empty());
}

#[tokio::test]
async fn test_queue_closed_stops_worker() {
    let connector = ScriptedConnector::new(vec![Dial::Connect(vec![trade_frame(
        "ethusdt",
        1_700_000_000_000,
        &[("1", "1")],
    )])]);
    let worker = Arc::new(
        worker_with(connector, &["ethusdt"], ReconnectPolicy::immediate(10))
            .await
            .unwrap(),
    );

    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let result = tokio::time::timeout(TEST_TIMEOUT, worker.run(tx)).await.unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_fetch_history_uses_huobi_period_code() {
    let server = spawn_history_server(|params| {
        if params.get("symbol").map(String::as_str) == Some("nosuchcoin") {
            return json!({"status": "error", "err-code": "invalid-parameter", "err-msg": "invalid symbol"});
        }
        json!({
            "ch": "market.btcusdt.kline.60min",
            "status": "ok",
            "ts": 1,
            "data": [
                {"id": 1700003600, "open": 36500.1, "close": 36510, "low": 36400.5, "high": 36600, "amount": 12.5, "vol": 456000.75, "count": 42},
                {"id": 1700000000, "open": 36400, "close": 36500.1, "low": 36390, "high": 36550, "amount": 3, "vol": 109200, "count": 9}
            ]
        })
    })
    .await;

    let connector = ScriptedConnector::new(vec![Dial::Connect(vec![])]);
    let http = HttpClient::new(&server.base_url, None).unwrap();
    let worker = HuobiWorker::with_connector(connector, http, vec!["btcusdt".to_string()])
        .await
        .unwrap();

    let candles = worker.fetch_history("btcusdt", Period::Hour1).await.unwrap();
    assert_eq!(candles.len(), 2);
    assert_eq!(candles[0].time, 1_700_003_600);
    assert_eq!(candles[0].open, Decimal::from_str("36500.1").unwrap());
    assert_eq!(candles[0].vol, Decimal::from_str("456000.75").unwrap());
    assert_eq!(candles[1].count, 9);

    {
        let requests = server.requests.lock().unwrap();
        assert_eq!(requests[0].get("period").map(String::as_str), Some("60min"));
        assert_eq!(requests[0].get("size").map(String::as_str), Some("2000"));
        assert_eq!(requests[0].get("symbol").map(String::as_str), Some("btcusdt"));
    }

    let err = worker.fetch_history("nosuchcoin", Period::Month1).await.unwrap_err();
    assert!(matches!(err, AppError::DecodeError(_)));
    let requests = server.requests.lock().unwrap();
    assert_eq!(requests[1].get("period").map(String::as_str), Some("1mon"));
}

#[tokio::test]
async fn test_fetch_history_transport_failure() {
    let connector = ScriptedConnector::new(vec![Dial::Connect(vec![])]);
    let http = HttpClient::new(&unused_http_url(), None).unwrap();
    let worker = HuobiWorker::with_connector(connector, http, vec![]).await.unwrap();

    let err = worker.fetch_history("btcusdt", Period::Min1).await.unwrap_err();
    assert!(matches!(err, AppError::TransportError(_)));
}

//! 火币 worker
//!
//! 持有一条 websocket 连接，订阅 `market.<symbol>.trade.detail`，把推送的成交明细
//! 解码成 [`TradeEvent`] 写入队列。连接断开后按 [`ReconnectPolicy`] 重连并重新订阅，
//! 连续失败超过上限后进入 `Failed`。

pub mod history;
pub mod message;

use self::message::{classify, gunzip, pong_frame, subscribe_frame, HuobiMessage};
use super::{ExchangeWorker, ReconnectPolicy, WorkerState};
use crate::klcommon::{
    AppError, Candle, EngineConfig, FrameSocket, HttpClient, Period, Platform, Result, SocketConnector, TradeEvent,
    TungsteniteConnector, WsFrame,
};
use std::future::Future;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

const HUOBI_TARGET: &str = "huobi";

/// 一次会话（一条连接）结束的原因
enum SessionEnd {
    /// 读失败或远端关闭，需要重连
    Transport(AppError),
    /// 本地主动关闭
    Closed,
    /// 消费端已退出，继续读取没有意义
    QueueClosed,
}

pub struct HuobiWorker<C: SocketConnector = TungsteniteConnector> {
    connector: C,
    http: HttpClient,
    symbols: Vec<String>,
    policy: ReconnectPolicy,
    /// 构造时建立的连接，`run` 启动时取走
    socket: Mutex<Option<C::Socket>>,
    state_tx: watch::Sender<WorkerState>,
    closed_tx: watch::Sender<bool>,
}

impl HuobiWorker<TungsteniteConnector> {
    /// 按配置建立连接，拨号失败直接返回，不重试
    pub async fn connect(config: &EngineConfig) -> Result<Self> {
        let connector = TungsteniteConnector::new(&config.ws_url, config.proxy())?;
        let http = HttpClient::new(&config.http_url, config.proxy())?;
        Self::with_connector(connector, http, config.symbols.clone()).await
    }
}

impl<C: SocketConnector> HuobiWorker<C> {
    /// 用指定的连接器建立首条连接
    pub async fn with_connector(connector: C, http: HttpClient, symbols: Vec<String>) -> Result<Self> {
        let (state_tx, _) = watch::channel(WorkerState::Disconnected);
        let (closed_tx, _) = watch::channel(false);

        state_tx.send_replace(WorkerState::Connecting);
        let socket = match connector.connect().await {
            Ok(socket) => socket,
            Err(e) => {
                state_tx.send_replace(WorkerState::Disconnected);
                return Err(e);
            }
        };

        Ok(Self {
            connector,
            http,
            symbols,
            policy: ReconnectPolicy::default(),
            socket: Mutex::new(Some(socket)),
            state_tx,
            closed_tx,
        })
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn set_state(&self, state: WorkerState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(target: HUOBI_TARGET, "worker 状态 {} -> {}", previous, state);
        }
    }

    /// 逐个发送订阅请求，写失败只记录日志
    async fn subscribe_all(&self, socket: &mut C::Socket) {
        for symbol in &self.symbols {
            let frame = subscribe_frame(symbol, chrono::Utc::now().timestamp());
            if let Err(e) = socket.send_text(frame).await {
                warn!(
                    target: HUOBI_TARGET,
                    log_type = "module",
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "订阅 {} 失败",
                    symbol
                );
            }
        }
        self.set_state(WorkerState::Subscribed);
        info!(target: HUOBI_TARGET, log_type = "low_freq", "已发送 {} 个交易对的成交订阅", self.symbols.len());
    }

    /// 在一条连接上持续读取，直到连接失败、主动关闭或队列关闭
    async fn read_session(
        &self,
        socket: &mut C::Socket,
        tx: &mpsc::Sender<TradeEvent>,
        closed_rx: &mut watch::Receiver<bool>,
        failures: &mut usize,
    ) -> SessionEnd {
        loop {
            let received = tokio::select! {
                _ = closed_rx.changed() => return SessionEnd::Closed,
                received = socket.recv() => received,
            };

            let frame = match received {
                Ok(Some(WsFrame::Close)) | Ok(None) => {
                    return SessionEnd::Transport(AppError::TransportError("连接被远端关闭".to_string()));
                }
                Ok(Some(frame)) => frame,
                Err(e) => return SessionEnd::Transport(e),
            };

            // 新连接上成功收到帧，连续失败计数清零
            *failures = 0;
            self.set_state(WorkerState::Reading);

            let payload = match frame {
                WsFrame::Ping(data) => {
                    if let Err(e) = socket.send_pong(data).await {
                        warn!(target: HUOBI_TARGET, "回复协议层 ping 失败: {}", e);
                    }
                    continue;
                }
                WsFrame::Pong(_) | WsFrame::Close => continue,
                WsFrame::Text(text) => text.into_bytes(),
                WsFrame::Binary(data) => match gunzip(&data) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(target: HUOBI_TARGET, "丢弃无法解压的帧: {}", e);
                        continue;
                    }
                },
            };

            match classify(&payload) {
                Ok(HuobiMessage::Ping(_)) => {
                    let pong = pong_frame(chrono::Utc::now().timestamp_millis());
                    if let Err(e) = socket.send_text(pong).await {
                        warn!(target: HUOBI_TARGET, "回复 pong 失败: {}", e);
                    }
                }
                Ok(HuobiMessage::Trades(trades)) => {
                    for trade in trades {
                        if tx.send(trade).await.is_err() {
                            return SessionEnd::QueueClosed;
                        }
                    }
                }
                Ok(HuobiMessage::Subscribed(channel)) => {
                    info!(target: HUOBI_TARGET, log_type = "low_freq", "订阅成功: {}", channel);
                }
                Ok(HuobiMessage::ServerError { code, message }) => {
                    warn!(target: HUOBI_TARGET, log_type = "module", "服务端返回错误 {}: {}", code, message);
                }
                Ok(HuobiMessage::Ignored) => {}
                Err(e) => {
                    warn!(
                        target: HUOBI_TARGET,
                        { error.summary = e.get_error_type_summary() },
                        "丢弃无法解析的消息: {}",
                        e
                    );
                }
            }
        }
    }

    async fn read_loop(&self, tx: mpsc::Sender<TradeEvent>) -> Result<()> {
        let mut closed_rx = self.closed_tx.subscribe();
        if *closed_rx.borrow() {
            return Ok(());
        }

        let initial = self.socket.lock().await.take();
        let mut socket = match initial {
            Some(socket) => Some(socket),
            None => {
                self.set_state(WorkerState::Connecting);
                Some(self.connector.connect().await?)
            }
        };
        if let Some(s) = socket.as_mut() {
            self.subscribe_all(s).await;
        }

        let mut failures = 0usize;
        let mut dial_error: Option<AppError> = None;
        loop {
            let end = match socket.as_mut() {
                Some(s) => self.read_session(s, &tx, &mut closed_rx, &mut failures).await,
                // 重连拨号失败同样计为一次连续失败
                None => SessionEnd::Transport(
                    dial_error
                        .take()
                        .unwrap_or_else(|| AppError::TransportError("重连失败".to_string())),
                ),
            };

            let cause = match end {
                SessionEnd::Transport(e) => e,
                SessionEnd::Closed | SessionEnd::QueueClosed => {
                    if let Some(mut s) = socket.take() {
                        let _ = s.close().await;
                    }
                    self.set_state(WorkerState::Disconnected);
                    info!(target: HUOBI_TARGET, log_type = "low_freq", "worker 已停止读取");
                    return Ok(());
                }
            };

            if let Some(mut s) = socket.take() {
                let _ = s.close().await;
            }
            self.set_state(WorkerState::Reconnecting);

            if failures >= self.policy.max_attempts {
                self.set_state(WorkerState::Failed);
                error!(
                    target: HUOBI_TARGET,
                    log_type = "module",
                    error.summary = cause.get_error_type_summary(),
                    error.details = %cause,
                    "连续 {} 次重连失败，worker 终止",
                    failures
                );
                return Err(AppError::ReconnectExhausted(failures));
            }

            failures += 1;
            let delay = self.policy.delay_for(failures);
            warn!(
                target: HUOBI_TARGET,
                log_type = "low_freq",
                error.details = %cause,
                "连接中断，{}ms 后进行第 {}/{} 次重连",
                delay.as_millis(),
                failures,
                self.policy.max_attempts
            );

            tokio::select! {
                _ = closed_rx.changed() => {
                    self.set_state(WorkerState::Disconnected);
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }

            self.set_state(WorkerState::Connecting);
            match self.connector.connect().await {
                Ok(mut s) => {
                    info!(target: HUOBI_TARGET, log_type = "low_freq", "第 {} 次重连成功", failures);
                    self.subscribe_all(&mut s).await;
                    socket = Some(s);
                }
                Err(e) => {
                    warn!(target: HUOBI_TARGET, "第 {} 次重连拨号失败: {}", failures, e);
                    dial_error = Some(e);
                }
            }
        }
    }
}

impl<C: SocketConnector> ExchangeWorker for HuobiWorker<C> {
    fn platform(&self) -> Platform {
        Platform::Huobi
    }

    fn run(&self, tx: mpsc::Sender<TradeEvent>) -> impl Future<Output = Result<()>> + Send {
        self.read_loop(tx)
    }

    fn fetch_history(&self, symbol: &str, period: Period) -> impl Future<Output = Result<Vec<Candle>>> + Send {
        let symbol = symbol.to_string();
        async move { history::fetch_history(&self.http, &symbol, period).await }
    }

    fn close(&self) -> impl Future<Output = Result<()>> + Send {
        async move {
            self.closed_tx.send_replace(true);
            // 还没被 run 取走的连接在这里释放
            if let Some(mut socket) = self.socket.lock().await.take() {
                socket.close().await?;
            }
            self.set_state(WorkerState::Disconnected);
            Ok(())
        }
    }

    fn state(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }
}

// WebSocket传输层 - 建立连接（直连、SOCKS5 代理或 HTTP CONNECT 代理）并以帧为单位收发
use crate::klcommon::{AppError, Result};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

/// 单次建连（TCP + 代理握手 + TLS + WebSocket握手）的超时
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// SOCKS5 代理未写端口时使用的默认端口
const DEFAULT_SOCKS_PORT: u16 = 1080;

/// HTTP 代理 CONNECT 响应头的最大长度
const MAX_CONNECT_RESPONSE_LEN: usize = 8 * 1024;

/// 支持的代理协议
pub const SUPPORTED_PROXY_SCHEMES: [&str; 3] = ["socks5", "socks5h", "http"];

/// 检查代理地址的协议，返回解析后的地址
pub fn parse_proxy_url(proxy: &str) -> Result<Url> {
    let url = Url::parse(proxy)?;
    if !SUPPORTED_PROXY_SCHEMES.contains(&url.scheme()) {
        return Err(AppError::ConfigError(format!(
            "不支持的代理协议 {}，可用: {}",
            proxy,
            SUPPORTED_PROXY_SCHEMES.join(", ")
        )));
    }
    if url.host_str().is_none() {
        return Err(AppError::ConfigError(format!("代理地址缺少主机名: {}", proxy)));
    }
    Ok(url)
}

/// WebSocket连接日志目标
pub const WEBSOCKET_CONNECTION_TARGET: &str = "websocket连接";

/// 从连接上读到的一帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// 已建立的 WebSocket 连接
pub trait FrameSocket: Send + 'static {
    /// 读取下一帧，连接正常结束时返回 `Ok(None)`
    fn recv(&mut self) -> impl Future<Output = Result<Option<WsFrame>>> + Send;

    fn send_text(&mut self, text: String) -> impl Future<Output = Result<()>> + Send;

    /// 回复协议层的 ping
    fn send_pong(&mut self, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// 负责拨号的连接器，每次调用都产生一条新连接
pub trait SocketConnector: Send + Sync + 'static {
    type Socket: FrameSocket;

    fn connect(&self) -> impl Future<Output = Result<Self::Socket>> + Send;
}

//=============================================================================
// tokio-tungstenite 实现
//=============================================================================

/// 基于 tokio-tungstenite 的连接器
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    url: Url,
    proxy: Option<Url>,
    connect_timeout: Duration,
}

impl TungsteniteConnector {
    /// `proxy` 接受 socks5/socks5h/http 地址
    pub fn new(ws_url: &str, proxy: Option<&str>) -> Result<Self> {
        let url = Url::parse(ws_url)?;
        if url.host_str().is_none() {
            return Err(AppError::ConfigError(format!("ws 地址缺少主机名: {}", ws_url)));
        }

        let proxy = proxy.map(parse_proxy_url).transpose()?;

        Ok(Self {
            url,
            proxy,
            connect_timeout: CONNECT_TIMEOUT,
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn open_tcp(&self) -> Result<TcpStream> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| AppError::ConfigError(format!("ws 地址缺少主机名: {}", self.url)))?;
        let port = self.url.port_or_known_default().unwrap_or(443);

        let Some(proxy) = &self.proxy else {
            return TcpStream::connect((host, port))
                .await
                .map_err(|e| AppError::TransportError(format!("连接 {}:{} 失败: {}", host, port, e)));
        };

        let proxy_host = proxy
            .host_str()
            .ok_or_else(|| AppError::ConfigError(format!("代理地址缺少主机名: {}", proxy)))?;

        if proxy.scheme() == "http" {
            let proxy_port = proxy.port_or_known_default().unwrap_or(80);
            debug!(target: WEBSOCKET_CONNECTION_TARGET, log_type = "module", "🌐 通过HTTP代理 {}:{} 连接", proxy_host, proxy_port);
            let stream = TcpStream::connect((proxy_host, proxy_port))
                .await
                .map_err(|e| AppError::TransportError(format!("连接代理 {}:{} 失败: {}", proxy_host, proxy_port, e)))?;
            return http_connect(stream, proxy, host, port).await;
        }

        let proxy_port = proxy.port().unwrap_or(DEFAULT_SOCKS_PORT);
        debug!(target: WEBSOCKET_CONNECTION_TARGET, log_type = "module", "🌐 通过代理 {}:{} 连接", proxy_host, proxy_port);

        let socks_stream = if proxy.username().is_empty() {
            Socks5Stream::connect((proxy_host, proxy_port), (host, port)).await
        } else {
            Socks5Stream::connect_with_password(
                (proxy_host, proxy_port),
                (host, port),
                proxy.username(),
                proxy.password().unwrap_or(""),
            )
            .await
        }
        .map_err(|e| AppError::TransportError(format!("代理连接失败: {}", e)))?;

        Ok(socks_stream.into_inner())
    }

    async fn connect_once(&self) -> Result<TungsteniteSocket> {
        let tcp_stream = self.open_tcp().await?;
        debug!(target: WEBSOCKET_CONNECTION_TARGET, log_type = "module", "✅ TCP连接已建立");

        let (inner, _response) =
            tokio_tungstenite::client_async_tls_with_config(self.url.as_str(), tcp_stream, None, None).await?;
        debug!(target: WEBSOCKET_CONNECTION_TARGET, "WebSocket握手成功");

        Ok(TungsteniteSocket { inner })
    }
}

/// 在到 HTTP 代理的连接上发 CONNECT，建立到 `host:port` 的隧道
async fn http_connect(mut stream: TcpStream, proxy: &Url, host: &str, port: u16) -> Result<TcpStream> {
    let authority = format!("{}:{}", host, port);
    let mut request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n", authority);
    if !proxy.username().is_empty() {
        let credentials = format!("{}:{}", proxy.username(), proxy.password().unwrap_or(""));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", base64::encode(credentials)));
    }
    request.push_str("\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| AppError::TransportError(format!("发送 CONNECT 请求失败: {}", e)))?;

    // 逐字节读到空行为止，隧道里的后续数据留给 TLS/WebSocket 握手
    let mut head = Vec::with_capacity(256);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE_LEN {
            return Err(AppError::TransportError("HTTP代理响应头过长".to_string()));
        }
        let byte = stream
            .read_u8()
            .await
            .map_err(|e| AppError::TransportError(format!("读取HTTP代理响应失败: {}", e)))?;
        head.push(byte);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if !status.starts_with('2') {
        return Err(AppError::TransportError(format!("HTTP代理拒绝 CONNECT {}: {}", authority, status_line)));
    }

    Ok(stream)
}

impl SocketConnector for TungsteniteConnector {
    type Socket = TungsteniteSocket;

    fn connect(&self) -> impl Future<Output = Result<Self::Socket>> + Send {
        async move {
            info!(
                target: WEBSOCKET_CONNECTION_TARGET,
                log_type = "low_freq",
                "🔗 连接 {} (代理: {})",
                self.url,
                self.proxy.as_ref().map_or("无".to_string(), |p| p.to_string())
            );

            match tokio::time::timeout(self.connect_timeout, self.connect_once()).await {
                Ok(result) => result,
                Err(_) => Err(AppError::TransportError(format!(
                    "连接尝试超过 {} 秒未响应，已超时",
                    self.connect_timeout.as_secs()
                ))),
            }
        }
    }
}

/// tokio-tungstenite 连接
pub struct TungsteniteSocket {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl FrameSocket for TungsteniteSocket {
    fn recv(&mut self) -> impl Future<Output = Result<Option<WsFrame>>> + Send {
        async move {
            loop {
                let Some(message) = self.inner.next().await else {
                    return Ok(None);
                };
                let frame = match message? {
                    Message::Text(text) => WsFrame::Text(text),
                    Message::Binary(data) => WsFrame::Binary(data),
                    Message::Ping(data) => WsFrame::Ping(data),
                    Message::Pong(data) => WsFrame::Pong(data),
                    Message::Close(_) => WsFrame::Close,
                    // 原始帧只在写入时出现
                    Message::Frame(_) => continue,
                };
                return Ok(Some(frame));
            }
        }
    }

    fn send_text(&mut self, text: String) -> impl Future<Output = Result<()>> + Send {
        async move { Ok(self.inner.send(Message::Text(text)).await?) }
    }

    fn send_pong(&mut self, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send {
        async move { Ok(self.inner.send(Message::Pong(payload)).await?) }
    }

    fn close(&mut self) -> impl Future<Output = Result<()>> + Send {
        async move {
            match self.inner.close(None).await {
                Ok(()) => Ok(()),
                // 对端已经关闭的连接再关一次不算错误
                Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
                | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
    }
}

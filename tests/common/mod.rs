//! 集成测试共用的脚本化连接和本地 HTTP 服务
#![allow(dead_code)]

use axum::extract::Query;
use axum::routing::get;
use axum::{Json, Router};
use flate2::write::GzEncoder;
use flate2::Compression;
use kline_sync::klcommon::{AppError, FrameSocket, Result, SocketConnector, WsFrame};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn gzip(text: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

/// 压缩后的服务端 JSON 帧
pub fn gz_frame(value: Value) -> Step {
    Step::Frame(WsFrame::Binary(gzip(&value.to_string())))
}

/// 脚本中的一步
#[derive(Debug, Clone)]
pub enum Step {
    Frame(WsFrame),
    /// 读失败
    Fail,
}

/// 连接器被拨号时的结果
#[derive(Debug, Clone)]
pub enum Dial {
    Connect(Vec<Step>),
    Refuse,
}

#[derive(Debug, Default)]
pub struct Recorder {
    pub texts: Mutex<Vec<String>>,
    pub pongs: Mutex<Vec<Vec<u8>>>,
    pub closes: AtomicUsize,
}

impl Recorder {
    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    pub fn json_texts(&self) -> Vec<Value> {
        self.texts()
            .iter()
            .map(|t| serde_json::from_str(t).unwrap())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.json_texts()
            .into_iter()
            .filter_map(|v| v.get("sub").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

pub struct ScriptedSocket {
    steps: VecDeque<Step>,
    recorder: Arc<Recorder>,
}

impl FrameSocket for ScriptedSocket {
    fn recv(&mut self) -> impl Future<Output = Result<Option<WsFrame>>> + Send {
        let step = self.steps.pop_front();
        async move {
            match step {
                Some(Step::Frame(frame)) => Ok(Some(frame)),
                Some(Step::Fail) | None => Err(AppError::TransportError("scripted read failure".to_string())),
            }
        }
    }

    fn send_text(&mut self, text: String) -> impl Future<Output = Result<()>> + Send {
        self.recorder.texts.lock().unwrap().push(text);
        async { Ok(()) }
    }

    fn send_pong(&mut self, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send {
        self.recorder.pongs.lock().unwrap().push(payload);
        async { Ok(()) }
    }

    fn close(&mut self) -> impl Future<Output = Result<()>> + Send {
        self.recorder.closes.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    }
}

/// 按顺序返回预设连接的连接器，脚本用完后拒绝拨号
pub struct ScriptedConnector {
    dials: Mutex<VecDeque<Dial>>,
    pub dial_count: Arc<AtomicUsize>,
    pub recorder: Arc<Recorder>,
}

impl ScriptedConnector {
    pub fn new(dials: Vec<Dial>) -> Self {
        Self {
            dials: Mutex::new(dials.into()),
            dial_count: Arc::new(AtomicUsize::new(0)),
            recorder: Arc::new(Recorder::default()),
        }
    }
}

impl SocketConnector for ScriptedConnector {
    type Socket = ScriptedSocket;

    fn connect(&self) -> impl Future<Output = Result<Self::Socket>> + Send {
        self.dial_count.fetch_add(1, Ordering::SeqCst);
        let next = self.dials.lock().unwrap().pop_front();
        let recorder = self.recorder.clone();
        async move {
            match next {
                Some(Dial::Connect(steps)) => Ok(ScriptedSocket {
                    steps: steps.into(),
                    recorder,
                }),
                Some(Dial::Refuse) | None => Err(AppError::TransportError("scripted dial refused".to_string())),
            }
        }
    }
}

/// 本地历史K线服务，记录每次请求的查询参数
pub struct HistoryServer {
    pub base_url: String,
    pub requests: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

/// 启动一个只响应 `/market/history/kline` 的本地服务，`respond` 根据查询参数生成响应体
pub async fn spawn_history_server<F>(respond: F) -> HistoryServer
where
    F: Fn(&HashMap<String, String>) -> Value + Clone + Send + Sync + 'static,
{
    let requests: Arc<Mutex<Vec<HashMap<String, String>>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = requests.clone();

    let app = Router::new().route(
        "/market/history/kline",
        get(move |Query(params): Query<HashMap<String, String>>| {
            let respond = respond.clone();
            let recorded = recorded.clone();
            async move {
                let body = respond(&params);
                recorded.lock().unwrap().push(params);
                Json(body)
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    HistoryServer {
        base_url: format!("http://{}", addr),
        requests,
    }
}

/// 一个未监听的本地地址，用于不会发起 HTTP 请求的测试
pub fn unused_http_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    format!("http://127.0.0.1:{}", port)
}

use crate::klcommon::{AppError, Result};
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, error, instrument};

/// HTTP 请求整体超时
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// 连接建立超时
pub const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// 日志中响应预览的最大长度
const RESPONSE_PREVIEW_LEN: usize = 500;

fn preview(text: &str) -> &str {
    let mut end = text.len().min(RESPONSE_PREVIEW_LEN);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// 通用 REST 客户端：发 GET/POST，把响应体解码成 JSON
#[derive(Clone, Debug)]
pub struct HttpClient {
    client: Client,
    base_url: String,
}

impl HttpClient {
    /// 创建客户端，`proxy` 为 None 时直连
    pub fn new(base_url: &str, proxy: Option<&str>) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(HTTP_CONNECT_TIMEOUT);

        if let Some(proxy_url) = proxy {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| AppError::ConfigError(format!("无效的代理地址 {}: {}", proxy_url, e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| AppError::TransportError(format!("创建HTTP客户端失败: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET 请求，`params` 会被 URL 编码进查询串
    #[instrument(target = "api", skip(self, params), err)]
    pub async fn get<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!(target: "api", "发送GET请求: {} {:?}", url, params);

        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|e| Self::log_send_error(&url, e))?;

        Self::decode_response(&url, response).await
    }

    /// POST 请求，请求体按 JSON 发送
    #[instrument(target = "api", skip(self, body), err)]
    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!(target: "api", "发送POST请求: {}", url);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Self::log_send_error(&url, e))?;

        Self::decode_response(&url, response).await
    }

    fn log_send_error(url: &str, e: reqwest::Error) -> AppError {
        let err = AppError::from(e);
        error!(
            target: "api",
            log_type = "module",
            url = %url,
            error.summary = err.get_error_type_summary(),
            error.details = %err,
            "HTTP请求失败"
        );
        err
    }

    async fn decode_response<T: DeserializeOwned>(url: &str, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            error!(target: "api", log_type = "module", "请求 {} 返回状态 {}: {}", url, status, preview(&text));
            return Err(AppError::TransportError(format!("{} 返回状态 {}", url, status)));
        }

        serde_json::from_str::<T>(&text).map_err(|e| {
            error!(
                target: "api",
                log_type = "module",
                "解析响应JSON失败: {}, 响应预览: {}",
                e,
                preview(&text)
            );
            AppError::DecodeError(format!("解析 {} 的响应失败: {}", url, e))
        })
    }
}

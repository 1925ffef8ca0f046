use super::response::{api_error, api_ok, ERR_NOT_DATA, ERR_PARAM, INTERNAL_SERVER_ERROR};
use crate::klcommon::{CandleStore, Period};
use crate::klsync::{kline_periods, load_history};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// 单页最多返回的K线数量
pub const MAX_PAGE_LIMIT: u32 = 200;

/// POST /kline 的请求体，字段都必须非空
#[derive(Debug, Deserialize)]
pub struct CreateWalletReq {
    pub appid: String,
    pub sign: String,
    pub network_name: String,
    pub coin_symbol: String,
    pub member_id: String,
    pub call_url: String,
}

impl CreateWalletReq {
    /// 返回第一个为空的字段名
    fn first_missing(&self) -> Option<&'static str> {
        [
            ("appid", &self.appid),
            ("sign", &self.sign),
            ("network_name", &self.network_name),
            ("coin_symbol", &self.coin_symbol),
            ("member_id", &self.member_id),
            ("call_url", &self.call_url),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
    }
}

#[derive(Debug, Default, Serialize)]
pub struct CreateWalletRes {}

/// GET /kline/history 的查询参数
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub symbol: String,
    pub period: String,
    pub page: u32,
    pub limit: u32,
    /// 只返回早于该时间的K线
    pub last_time: Option<i64>,
}

pub async fn create_kline(payload: Result<Json<CreateWalletReq>, JsonRejection>) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => return api_error(ERR_PARAM, Some(rejection.body_text())).into_response(),
    };

    if let Some(field) = req.first_missing() {
        return api_error(ERR_PARAM, Some(format!("{} 不能为空", field))).into_response();
    }

    info!(target: "web", "收到 /kline 请求: appid={}, coin_symbol={}", req.appid, req.coin_symbol);
    api_ok(CreateWalletRes::default()).into_response()
}

pub async fn history_handler<S: CandleStore>(
    State(store): State<Arc<S>>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Response {
    let query = match query {
        Ok(Query(query)) => query,
        Err(rejection) => return api_error(ERR_PARAM, Some(rejection.body_text())).into_response(),
    };

    let period: Period = match query.period.parse() {
        Ok(period) => period,
        Err(e) => return api_error(ERR_PARAM, Some(e.to_string())).into_response(),
    };
    if query.page < 1 || query.limit < 1 || query.limit > MAX_PAGE_LIMIT {
        return api_error(
            ERR_PARAM,
            Some(format!("page 必须 >= 1，limit 必须在 1..={} 之间", MAX_PAGE_LIMIT)),
        )
        .into_response();
    }
    if query.symbol.is_empty() || !query.symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return api_error(ERR_PARAM, Some(format!("无效的交易对: {}", query.symbol))).into_response();
    }

    let last_time = query.last_time.filter(|t| *t > 0);
    match load_history(store, &query.symbol, period, last_time, query.page, query.limit).await {
        Ok(candles) if candles.is_empty() => api_error(ERR_NOT_DATA, None).into_response(),
        Ok(candles) => api_ok(candles).into_response(),
        Err(e) => {
            error!(
                target: "web",
                { error.summary = e.get_error_type_summary(), error.details = %e },
                "查询历史K线失败"
            );
            api_error(INTERNAL_SERVER_ERROR, None).into_response()
        }
    }
}

pub async fn periods_handler() -> Response {
    api_ok(kline_periods()).into_response()
}

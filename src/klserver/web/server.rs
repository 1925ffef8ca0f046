// Web服务器实现
use super::handlers;
use crate::klcommon::{AppConfig, AppError, CandleStore, Result};
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// 构造路由，`debug` 为 true 时记录每个请求
pub fn build_router<S: CandleStore>(store: Arc<S>, debug: bool) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let router = Router::new()
        .route("/kline", post(handlers::create_kline))
        .route("/kline/history", get(handlers::history_handler::<S>))
        .route("/kline/periods", get(handlers::periods_handler))
        .with_state(store)
        .layer(cors);

    if debug {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

/// 在已绑定的监听器上提供服务，直到出错
pub async fn serve<S: CandleStore>(listener: TcpListener, store: Arc<S>, debug: bool) -> Result<()> {
    let app = build_router(store, debug);
    axum::serve(listener, app).await.map_err(|e| {
        error!(target: "web", log_type = "module", "Web服务器错误: {}", e);
        AppError::WebServerError(format!("Web服务器错误: {}", e))
    })
}

/// 启动Web服务器
pub async fn start_web_server<S: CandleStore>(store: Arc<S>, config: &AppConfig) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::WebServerError(format!("绑定地址 {} 失败: {}", addr, e)))?;

    info!(target: "web", log_type = "low_freq", "Web服务器启动在 http://{}", addr);
    serve(listener, store, config.debug).await
}

// 对外 HTTP 接口
pub mod web;

pub use self::web::{build_router, serve, start_web_server};

// 接口统一响应格式 {code, message, data}
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

/// 业务错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno {
    pub code: i32,
    pub message: &'static str,
}

pub const OK: Errno = Errno { code: 0, message: "OK" };
pub const INTERNAL_SERVER_ERROR: Errno = Errno { code: 1, message: "Internal server error" };
pub const ERR_TOKEN: Errno = Errno { code: 10001, message: "token错误" };
pub const ERR_PARAM: Errno = Errno { code: 10002, message: "参数有误" };
pub const ERR_NOT_DATA: Errno = Errno { code: 10003, message: "没有数据" };
pub const ERR_NOT_CHANGE_DATA: Errno = Errno { code: 10004, message: "数据没有更改" };
pub const ERR_NOT_REPEAT_DATA: Errno = Errno { code: 10005, message: "数据已存在" };
pub const ERR_ENGINE: Errno = Errno { code: 10006, message: "Engine Not" };
pub const ERR_CREATE_WALLET: Errno = Errno { code: 10007, message: "创建钱包失败" };
pub const ERR_SIGN: Errno = Errno { code: 10008, message: "签名错误" };

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub code: i32,
    pub message: String,
    pub data: T,
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// 成功响应
pub fn api_ok<T: Serialize>(data: T) -> ApiResponse<T> {
    ApiResponse {
        code: OK.code,
        message: OK.message.to_string(),
        data,
    }
}

/// 错误响应，`detail` 非空时附在错误信息后面
pub fn api_error(errno: Errno, detail: Option<String>) -> ApiResponse<Value> {
    let message = match detail {
        Some(detail) if !detail.is_empty() => format!("{}: {}", errno.message, detail),
        _ => errno.message.to_string(),
    };
    ApiResponse {
        code: errno.code,
        message,
        data: json!({}),
    }
}

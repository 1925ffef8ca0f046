// 导出模块
pub mod klcommon;
pub mod klserver;
pub mod klsync;

// Re-export error types
pub use klcommon::error::AppError;

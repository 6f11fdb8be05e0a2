//! 编排层错误类型与符号化错误码
//!
//! 所有失败路径最终都落到 `ErrorCode`，调用方按错误码分支，无需解析文本。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::remote::RemoteError;

/// 对外暴露的符号化错误码（与传输层无关）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NoDates,
    NoContext,
    NotFound,
    SearchFailed,
    RateLimit,
    InvalidParams,
    NetworkError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NoDates => "NO_DATES",
            ErrorCode::NoContext => "NO_CONTEXT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::SearchFailed => "SEARCH_FAILED",
            ErrorCode::RateLimit => "RATE_LIMIT",
            ErrorCode::InvalidParams => "INVALID_PARAMS",
            ErrorCode::NetworkError => "NETWORK_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 编排过程中可能出现的错误
///
/// 需要 `Clone`：同一指纹的并发调用方共享同一个结果（包括同一个错误）。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("Check-in and check-out dates are required")]
    MissingDates,

    #[error("No page context available for session: {0}")]
    NoContext(String),

    #[error("Session id is required")]
    MissingSession,

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Hotel not found: {0}")]
    NotFound(String),

    #[error("Rate limited by comparison service")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Search failed: {0}")]
    SearchFailed(String),
}

impl OrchestratorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OrchestratorError::MissingDates => ErrorCode::NoDates,
            OrchestratorError::NoContext(_) | OrchestratorError::MissingSession => {
                ErrorCode::NoContext
            }
            OrchestratorError::InvalidParams(_) => ErrorCode::InvalidParams,
            OrchestratorError::NotFound(_) => ErrorCode::NotFound,
            OrchestratorError::RateLimited { .. } => ErrorCode::RateLimit,
            OrchestratorError::Network(_) => ErrorCode::NetworkError,
            OrchestratorError::SearchFailed(_) => ErrorCode::SearchFailed,
        }
    }
}

impl From<RemoteError> for OrchestratorError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::InvalidParams(msg) => OrchestratorError::InvalidParams(msg),
            RemoteError::NotFound(msg) => OrchestratorError::NotFound(msg),
            RemoteError::RateLimited { retry_after_ms } => {
                OrchestratorError::RateLimited { retry_after_ms }
            }
            RemoteError::Transient(msg) | RemoteError::Network(msg) => {
                OrchestratorError::Network(msg)
            }
            RemoteError::Failed(msg) => OrchestratorError::SearchFailed(msg),
        }
    }
}

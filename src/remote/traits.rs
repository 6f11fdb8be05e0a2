//! 远端比价客户端抽象
//!
//! 所有实现（HTTP / 重试包装 / Mock）实现 RemoteClient：prefetch（换取上下文令牌）、compare（比价）。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::itinerary::ItineraryParams;

/// 远端调用错误；`is_retryable` 的错误由边界层负责重试，编排层不重试
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Transient network error: {0}")]
    Transient(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote call failed: {0}")]
    Failed(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::RateLimited { .. } | RemoteError::Transient(_))
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            RemoteError::RateLimited { retry_after_ms } => *retry_after_ms,
            _ => None,
        }
    }
}

/// prefetch 成功结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefetchResult {
    pub token: String,
    #[serde(default)]
    pub count: usize,
    pub cache_status: Option<String>,
    /// 远端附带的其它元数据，原样回传给调用方
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// 比价请求：归一化参数 + 可选上下文令牌
#[derive(Debug, Clone, PartialEq)]
pub struct CompareRequest {
    pub params: ItineraryParams,
    pub context_token: Option<String>,
}

/// 单条报价（排序与展示由远端/UI 负责，这里原样透传）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub source: String,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub url: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// 远端对酒店匹配质量的判断
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchInfo {
    pub confidence: Option<f64>,
    #[serde(default)]
    pub match_uncertain: bool,
}

/// compare 成功结果（即缓存的 payload）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparePayload {
    pub offers_count: usize,
    #[serde(default)]
    pub offers: Vec<Offer>,
    #[serde(default)]
    pub match_info: MatchInfo,
    pub cache_status: Option<String>,
}

/// 远端比价客户端
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// 以查询参数换取上下文令牌
    async fn prefetch(&self, params: &ItineraryParams) -> Result<PrefetchResult, RemoteError>;

    /// 比价
    async fn compare(&self, request: &CompareRequest) -> Result<ComparePayload, RemoteError>;
}

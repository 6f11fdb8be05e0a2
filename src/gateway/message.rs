//! 网关消息协议定义
//!
//! 请求/响应与具体传输无关；`GatewayMessage` 是 stdio 等传输层使用的带元信息信封。

use serde::{Deserialize, Serialize};

use crate::core::{ErrorCode, OrchestratorError};
use crate::itinerary::{ItineraryOverrides, ItineraryParams};
use crate::recovery::ResponseDisposition;
use crate::remote::ComparePayload;
use crate::store::PageContext;
use crate::throttle::RefreshReason;

/// 会话发来的请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// 记录当前页面的行程上下文
    RecordContext { context: ItineraryParams },

    /// 预取上下文令牌
    PrefetchContext { params: ItineraryParams },

    /// 官方网站 URL hint
    SetHint { official_url: String },

    /// 获取比价结果（默认走缓存）
    GetCompareData {
        #[serde(default)]
        overrides: Option<ItineraryOverrides>,
        #[serde(default)]
        force_refresh: bool,
    },

    /// 刷新比价（受冷却限制）
    RefreshCompare {
        #[serde(default)]
        overrides: Option<ItineraryOverrides>,
        #[serde(default)]
        reason: RefreshReason,
    },

    /// 读取已记录的上下文
    GetContext,

    /// 会话对 request-context-resend 的应答
    ContextResponse {
        payload: ItineraryParams,
        correlation_id: String,
    },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::RecordContext { .. } => "record_context",
            Request::PrefetchContext { .. } => "prefetch_context",
            Request::SetHint { .. } => "set_hint",
            Request::GetCompareData { .. } => "get_compare_data",
            Request::RefreshCompare { .. } => "refresh_compare",
            Request::GetContext => "get_context",
            Request::ContextResponse { .. } => "context_response",
        }
    }
}

/// 比价应答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompareReply {
    /// 节流且无缓存时为空
    pub payload: Option<ComparePayload>,
    pub cache_hit: bool,
    pub throttled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// 对请求的应答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ack,

    Prefetched {
        token: String,
        count: usize,
        cache_status: Option<String>,
        metadata: Option<serde_json::Value>,
    },

    HintApplied {
        /// 该会话此前没有 hint
        first_hint: bool,
        /// 是否发起了带 hint 的重试
        retried: bool,
    },

    Compare(CompareReply),

    Context { context: Option<PageContext> },

    ContextAccepted { disposition: ResponseDisposition },

    Error { code: ErrorCode, message: String },
}

impl Response {
    pub fn error(err: &OrchestratorError) -> Self {
        Response::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Response::Error { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// 信封内的消息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageType {
    /// 会话 → 编排层
    Request { request: Request },

    /// 编排层 → 会话
    Response { response: Response },

    /// 宿主通知：从 parent 派生出 child 会话
    SessionSpawned { parent_id: String, child_id: String },

    /// 宿主通知：会话结束
    SessionClosed,

    /// 编排层 → 会话：请重新发送页面上下文
    RequestContextResend { correlation_id: String },
}

/// 网关消息（带元信息的完整消息）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMessage {
    /// 消息 ID
    #[serde(default)]
    pub id: String,
    /// 会话 ID
    #[serde(default)]
    pub session_id: Option<String>,
    /// 应答所对应的请求消息 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub message: MessageType,
    /// 时间戳（毫秒）
    #[serde(default)]
    pub timestamp: u64,
}

impl GatewayMessage {
    pub fn new(session_id: Option<String>, message: MessageType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id,
            reply_to: None,
            message,
            timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
        }
    }

    pub fn reply(request: &GatewayMessage, response: Response) -> Self {
        Self {
            reply_to: Some(request.id.clone()),
            ..Self::new(request.session_id.clone(), MessageType::Response { response })
        }
    }

    pub fn context_resend(session_id: &str, correlation_id: &str) -> Self {
        Self::new(
            Some(session_id.to_string()),
            MessageType::RequestContextResend {
                correlation_id: correlation_id.to_string(),
            },
        )
    }

    pub fn error(err: &OrchestratorError) -> Self {
        Self::new(
            None,
            MessageType::Response {
                response: Response::error(err),
            },
        )
    }
}

//! 会话上下文恢复
//!
//! 单次恢复的状态机：`CheckMemory → CheckDurable → AwaitHandshake → {Resolved, TimedOut, Failed}`
//!
//! 1. 内存中有上下文且未过时 → Resolved
//! 2. 调用方给出的参考 URL 与记录不一致时视为过时，继续下一步而不是冒险用错行程
//! 3. 持久层有未过时的上下文 → Resolved
//! 4. 向会话所有者发送带关联 ID 的 resend 请求，等待至多 3 秒
//!
//! 握手返回的上下文不会被本模块写回存储，是否持久化由调用方决定。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};

use crate::itinerary::SessionId;
use crate::store::{ContextStore, DurableStore, PageContext, StoreError};

/// 默认握手超时：3 秒
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// 恢复状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    CheckMemory,
    CheckDurable,
    AwaitHandshake,
    Resolved,
    TimedOut,
    Failed,
}

/// 上下文来自哪一步
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoverySource {
    Memory,
    Durable,
    Handshake,
}

#[derive(Debug, Clone)]
pub struct RecoveredContext {
    pub context: PageContext,
    pub source: RecoverySource,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecoveryError {
    #[error("Context handshake timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Failed to reach session owner: {0}")]
    DeliveryFailed(String),

    #[error("Context handshake cancelled")]
    Cancelled,
}

impl RecoveryError {
    pub fn state(&self) -> RecoveryState {
        match self {
            RecoveryError::TimedOut(_) => RecoveryState::TimedOut,
            RecoveryError::DeliveryFailed(_) | RecoveryError::Cancelled => RecoveryState::Failed,
        }
    }
}

/// 握手响应的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseDisposition {
    /// 匹配并交付给等待方
    Accepted,
    /// 会话 ID 与握手发起时不一致，继续等待
    SessionMismatch,
    /// 关联 ID 未知（已超时、已完成或从未发起），忽略
    UnknownCorrelation,
}

/// 会话所有者（如页面脚本），负责接收 request-context-resend
#[async_trait]
pub trait SessionOwner: Send + Sync {
    async fn request_context_resend(
        &self,
        session_id: &str,
        correlation_id: &str,
    ) -> Result<(), String>;
}

/// 持久层上下文来源
#[async_trait]
pub trait DurableContextSource: Send + Sync {
    async fn load_context(&self, session_id: &str) -> Option<PageContext>;
}

/// 以 `context:{sessionId}` 为键把页面上下文存进持久 KV
pub struct DurablePageContexts {
    durable: Arc<dyn DurableStore>,
}

impl DurablePageContexts {
    pub fn new(durable: Arc<dyn DurableStore>) -> Self {
        Self { durable }
    }

    fn key(session_id: &str) -> String {
        format!("context:{session_id}")
    }

    pub async fn save(&self, session_id: &str, context: &PageContext) -> Result<(), StoreError> {
        self.durable
            .set(&Self::key(session_id), serde_json::to_value(context)?)
            .await
    }

    pub async fn remove(&self, session_id: &str) -> Result<(), StoreError> {
        self.durable.remove(&Self::key(session_id)).await
    }
}

#[async_trait]
impl DurableContextSource for DurablePageContexts {
    async fn load_context(&self, session_id: &str) -> Option<PageContext> {
        match self.durable.get(&Self::key(session_id)).await {
            Ok(Some(value)) => serde_json::from_value(value)
                .map_err(|e| tracing::warn!("Discarding malformed context for {}: {}", session_id, e))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Failed to read durable context for {}: {}", session_id, e);
                None
            }
        }
    }
}

struct PendingHandshake {
    session_id: SessionId,
    reply: oneshot::Sender<PageContext>,
}

/// 上下文恢复器
pub struct ContextRecovery {
    contexts: Arc<ContextStore>,
    durable: Arc<dyn DurableContextSource>,
    owner: Arc<dyn SessionOwner>,
    /// correlation_id -> 等待中的握手
    pending: Mutex<HashMap<String, PendingHandshake>>,
    timeout: Duration,
}

impl ContextRecovery {
    pub fn new(
        contexts: Arc<ContextStore>,
        durable: Arc<dyn DurableContextSource>,
        owner: Arc<dyn SessionOwner>,
        timeout: Duration,
    ) -> Self {
        Self {
            contexts,
            durable,
            owner,
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// 解析会话的可用上下文；`reference_url` 为当前页面的 booking URL（用于过时检测）
    pub async fn recover(
        &self,
        session_id: &str,
        reference_url: Option<&str>,
    ) -> Result<RecoveredContext, RecoveryError> {
        let is_fresh = |ctx: &PageContext| reference_url.map_or(true, |r| ctx.matches_reference(r));

        tracing::debug!("Context recovery for {}: {:?}", session_id, RecoveryState::CheckMemory);
        if let Some(context) = self.contexts.get(session_id).await {
            if is_fresh(&context) {
                return Ok(RecoveredContext {
                    context,
                    source: RecoverySource::Memory,
                });
            }
            tracing::info!("Stored context for {} is stale, re-acquiring", session_id);
        }

        tracing::debug!("Context recovery for {}: {:?}", session_id, RecoveryState::CheckDurable);
        if let Some(context) = self.durable.load_context(session_id).await {
            if is_fresh(&context) {
                return Ok(RecoveredContext {
                    context,
                    source: RecoverySource::Durable,
                });
            }
        }

        tracing::debug!("Context recovery for {}: {:?}", session_id, RecoveryState::AwaitHandshake);
        let context = self.handshake(session_id).await?;
        Ok(RecoveredContext {
            context,
            source: RecoverySource::Handshake,
        })
    }

    async fn handshake(&self, session_id: &str) -> Result<PageContext, RecoveryError> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            correlation_id.clone(),
            PendingHandshake {
                session_id: session_id.to_string(),
                reply: tx,
            },
        );

        if let Err(e) = self
            .owner
            .request_context_resend(session_id, &correlation_id)
            .await
        {
            self.pending.lock().await.remove(&correlation_id);
            tracing::warn!("Context resend to {} not delivered: {}", session_id, e);
            return Err(RecoveryError::DeliveryFailed(e));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(context)) => {
                tracing::info!("Recovered context for {} via handshake", session_id);
                Ok(context)
            }
            Ok(Err(_)) => Err(RecoveryError::Cancelled),
            Err(_) => {
                self.pending.lock().await.remove(&correlation_id);
                tracing::warn!(
                    "Context handshake {} for {} timed out",
                    correlation_id,
                    session_id
                );
                Err(RecoveryError::TimedOut(self.timeout))
            }
        }
    }

    /// 处理会话所有者的 context-response
    pub async fn handle_page_context_response(
        &self,
        session_id: &str,
        payload: PageContext,
        correlation_id: &str,
    ) -> ResponseDisposition {
        let mut pending = self.pending.lock().await;
        let issued_for = pending.get(correlation_id).map(|p| p.session_id.clone());
        match issued_for {
            None => {
                tracing::debug!("Ignoring context response with unknown id {}", correlation_id);
                ResponseDisposition::UnknownCorrelation
            }
            Some(expected) if expected != session_id => {
                tracing::warn!(
                    "Context response {} came from {} but was issued for {}",
                    correlation_id,
                    session_id,
                    expected
                );
                ResponseDisposition::SessionMismatch
            }
            Some(_) => {
                if let Some(p) = pending.remove(correlation_id) {
                    // 等待方可能恰好超时退出，此时丢弃
                    let _ = p.reply.send(payload);
                }
                ResponseDisposition::Accepted
            }
        }
    }

    /// 会话结束：丢弃其所有等待中的握手，等待方以 Failed 结束
    pub async fn cancel_for_session(&self, session_id: &str) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, p| p.session_id != session_id);
        before - pending.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

//! 上下文令牌存储（双键查找）
//!
//! 持久层两类键：
//! - 行程键 `{checkIn}:{checkOut}:{adults}:{currency}:{geo}:{hostLocale}`：新开会话仍可命中同一行程
//! - 会话键 `session:{sessionId}`：同一会话内导航更精确
//!
//! 另有 session → token 的内存映射，用于低延迟读取与新会话继承。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::durable::{DurableStore, StoreError};
use crate::itinerary::{ItineraryKey, ItineraryParams, SessionId};

/// 远端为某个行程签发的不透明令牌
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextToken {
    pub token: String,
    /// 签发时间（毫秒时间戳）
    pub issued_at: i64,
    pub check_in: Option<NaiveDate>,
    pub check_out: Option<NaiveDate>,
}

impl ContextToken {
    pub fn new(token: impl Into<String>, params: &ItineraryParams) -> Self {
        Self {
            token: token.into(),
            issued_at: chrono::Utc::now().timestamp_millis(),
            check_in: params.check_in,
            check_out: params.check_out,
        }
    }

    /// 令牌回显的入住/离店日期与当前参数一致才可使用
    pub fn matches_dates(&self, params: &ItineraryParams) -> bool {
        self.check_in == params.check_in && self.check_out == params.check_out
    }
}

pub(crate) fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

/// 令牌存储
pub struct TokenStore {
    durable: Arc<dyn DurableStore>,
    session_tokens: RwLock<HashMap<SessionId, ContextToken>>,
}

impl TokenStore {
    pub fn new(durable: Arc<dyn DurableStore>) -> Self {
        Self {
            durable,
            session_tokens: RwLock::new(HashMap::new()),
        }
    }

    /// 同时写入行程键与会话键；两条写入互为后备，一条失败不影响另一条
    ///
    /// 仅当所有尝试的持久化写入都失败时返回错误（内存映射总会更新）。
    pub async fn store(
        &self,
        params: &ItineraryParams,
        token: &str,
        session_id: Option<&str>,
    ) -> Result<ContextToken, StoreError> {
        let record = ContextToken::new(token, params);
        let value = serde_json::to_value(&record)?;
        let itinerary_key = ItineraryKey::from_params(params);

        let mut last_error = None;
        let mut any_written = false;

        if let Some(sid) = session_id {
            self.session_tokens
                .write()
                .await
                .insert(sid.to_string(), record.clone());

            match self.durable.set(&session_key(sid), value.clone()).await {
                Ok(()) => any_written = true,
                Err(e) => {
                    tracing::warn!("Failed to persist session token for {}: {}", sid, e);
                    last_error = Some(e);
                }
            }
        }

        match self.durable.set(itinerary_key.as_str(), value).await {
            Ok(()) => any_written = true,
            Err(e) => {
                tracing::warn!("Failed to persist itinerary token for {}: {}", itinerary_key, e);
                last_error = Some(e);
            }
        }

        match (any_written, last_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(record),
        }
    }

    /// 优先会话键（且日期匹配），否则回落到行程键
    pub async fn load(
        &self,
        params: &ItineraryParams,
        session_id: Option<&str>,
    ) -> Option<ContextToken> {
        if let Some(sid) = session_id {
            if let Some(token) = self.session_tokens.read().await.get(sid) {
                if token.matches_dates(params) {
                    return Some(token.clone());
                }
            }

            if let Some(token) = self.read_durable(&session_key(sid)).await {
                if token.matches_dates(params) {
                    self.session_tokens
                        .write()
                        .await
                        .insert(sid.to_string(), token.clone());
                    return Some(token);
                }
                tracing::debug!("Session token for {} has stale dates, falling back", sid);
            }
        }

        let itinerary_key = ItineraryKey::from_params(params);
        self.read_durable(itinerary_key.as_str())
            .await
            .filter(|token| token.matches_dates(params))
    }

    /// 新会话由旧会话派生时复制令牌：先查内存映射，再查持久层
    ///
    /// 返回是否复制成功（来源会话无令牌时为 false）。
    pub async fn propagate(&self, from_session: &str, to_session: &str) -> Result<bool, StoreError> {
        let cached = self.session_tokens.read().await.get(from_session).cloned();
        let token = match cached {
            Some(t) => Some(t),
            None => match self.durable.get(&session_key(from_session)).await? {
                Some(value) => Some(serde_json::from_value::<ContextToken>(value)?),
                None => None,
            },
        };

        let Some(token) = token else {
            return Ok(false);
        };

        self.session_tokens
            .write()
            .await
            .insert(to_session.to_string(), token.clone());
        self.durable
            .set(&session_key(to_session), serde_json::to_value(&token)?)
            .await?;
        Ok(true)
    }

    /// 会话结束：只清内存映射，持久层按设计跨重启保留
    pub async fn forget_session(&self, session_id: &str) {
        self.session_tokens.write().await.remove(session_id);
    }

    async fn read_durable(&self, key: &str) -> Option<ContextToken> {
        match self.durable.get(key).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(token) => Some(token),
                Err(e) => {
                    tracing::warn!("Discarding malformed token under {}: {}", key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Failed to read token under {}: {}", key, e);
                None
            }
        }
    }
}

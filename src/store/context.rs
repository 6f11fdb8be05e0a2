//! 页面上下文存储（纯内存，按会话 ID）
//!
//! 无 TTL：上下文在被替换或会话结束前一直有效。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::itinerary::{ItineraryParams, SessionId};

/// 一个会话当前的行程/页面上下文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageContext {
    #[serde(flatten)]
    pub params: ItineraryParams,
    /// 记录时间（毫秒时间戳）
    #[serde(default)]
    pub recorded_at: i64,
}

impl PageContext {
    pub fn new(params: ItineraryParams) -> Self {
        Self {
            params,
            recorded_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 调用方给出的当前页面 URL 是否与记录时的 booking URL 一致（忽略 fragment 与末尾斜杠）
    ///
    /// 记录时没有 booking URL 的上下文无从比较，视为一致。
    pub fn matches_reference(&self, reference_url: &str) -> bool {
        match self.params.booking_url.as_deref() {
            Some(recorded) => canonical_url(recorded) == canonical_url(reference_url),
            None => true,
        }
    }
}

fn canonical_url(raw: &str) -> String {
    let raw = raw.trim();
    match reqwest::Url::parse(raw) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string().trim_end_matches('/').to_string()
        }
        Err(_) => raw.trim_end_matches('/').to_string(),
    }
}

/// 上下文存储
#[derive(Debug, Default)]
pub struct ContextStore {
    contexts: RwLock<HashMap<SessionId, PageContext>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, session_id: &str, context: PageContext) {
        self.contexts
            .write()
            .await
            .insert(session_id.to_string(), context);
    }

    pub async fn get(&self, session_id: &str) -> Option<PageContext> {
        self.contexts.read().await.get(session_id).cloned()
    }

    pub async fn delete(&self, session_id: &str) -> Option<PageContext> {
        self.contexts.write().await.remove(session_id)
    }

    /// 在写锁内原地修改上下文；会话无上下文时返回 None
    pub async fn with_context<F, R>(&self, session_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut PageContext) -> R,
    {
        let mut contexts = self.contexts.write().await;
        contexts.get_mut(session_id).map(f)
    }

    pub async fn len(&self) -> usize {
        self.contexts.read().await.len()
    }
}

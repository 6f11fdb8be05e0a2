//! 比价结果缓存（TTL）
//!
//! 以请求指纹为键；读时惰性清除过期条目。无容量上限：键都属于活跃会话，会话结束时整体清理。

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::itinerary::RequestFingerprint;

/// 默认 TTL：5 分钟
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct CachedResult<T> {
    payload: T,
    stored_at: Instant,
}

/// 结果缓存
#[derive(Debug)]
pub struct ResultCache<T> {
    entries: RwLock<HashMap<RequestFingerprint, CachedResult<T>>>,
    ttl: Duration,
}

impl<T: Clone> ResultCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// `now - stored_at > ttl` 时清除并返回 None
    pub async fn get(&self, fingerprint: &RequestFingerprint) -> Option<T> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.get(fingerprint) {
            Some(entry) if now.duration_since(entry.stored_at) > self.ttl => {
                entries.remove(fingerprint);
                None
            }
            Some(entry) => Some(entry.payload.clone()),
            None => None,
        }
    }

    pub async fn set(&self, fingerprint: RequestFingerprint, payload: T) {
        self.entries.write().await.insert(
            fingerprint,
            CachedResult {
                payload,
                stored_at: Instant::now(),
            },
        );
    }

    /// 删除属于该会话的所有条目，返回删除数量
    pub async fn delete_all_for_session(&self, session_id: &str) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|fp, _| !fp.belongs_to(session_id));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl<T: Clone> Default for ResultCache<T> {
    fn default() -> Self {
        Self::new(DEFAULT_RESULT_TTL)
    }
}

//! 手动刷新冷却
//!
//! 用户触发的强制刷新在冷却期内被节流；系统触发的刷新（更好的 hint 到达）既不受节流，也不设置/延长冷却。

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::itinerary::SessionId;

/// 默认冷却：60 秒
pub const DEFAULT_REFRESH_COOLDOWN: Duration = Duration::from_secs(60);

/// 刷新原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RefreshReason {
    /// 用户手动刷新
    #[default]
    #[serde(alias = "user")]
    Manual,
    /// 官方 URL hint 到达后由系统发起
    #[serde(alias = "official_url_hint")]
    HintArrived,
}

impl RefreshReason {
    pub fn is_system_triggered(&self) -> bool {
        matches!(self, RefreshReason::HintArrived)
    }
}

#[derive(Debug, Clone)]
struct ThrottleEntry {
    cooldown_until: Instant,
    /// 写入该条目的会话，会话结束时一并清理
    session_id: Option<SessionId>,
}

/// 刷新节流器
#[derive(Debug)]
pub struct RefreshThrottle {
    entries: RwLock<HashMap<String, ThrottleEntry>>,
    cooldown: Duration,
}

impl RefreshThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            cooldown,
        }
    }

    pub async fn should_throttle(&self, key: &str, now: Instant, reason: RefreshReason) -> bool {
        if reason.is_system_triggered() {
            return false;
        }
        self.entries
            .read()
            .await
            .get(key)
            .is_some_and(|e| now < e.cooldown_until)
    }

    /// 仅用户触发的刷新会写入 `cooldown_until = now + cooldown`
    pub async fn set_cooldown(
        &self,
        key: &str,
        now: Instant,
        reason: RefreshReason,
        session_id: Option<&str>,
    ) {
        if reason.is_system_triggered() {
            return;
        }
        self.entries.write().await.insert(
            key.to_string(),
            ThrottleEntry {
                cooldown_until: now + self.cooldown,
                session_id: session_id.map(str::to_string),
            },
        );
    }

    /// `max(0, cooldown_until - now)`，毫秒
    pub async fn retry_after_ms(&self, key: &str, now: Instant) -> u64 {
        self.entries
            .read()
            .await
            .get(key)
            .map(|e| e.cooldown_until.saturating_duration_since(now).as_millis() as u64)
            .unwrap_or(0)
    }

    /// 原子地检查并设置冷却；返回 Some(retry_after_ms) 表示被节流
    pub async fn check_and_arm(
        &self,
        key: &str,
        now: Instant,
        reason: RefreshReason,
        session_id: Option<&str>,
    ) -> Option<u64> {
        if reason.is_system_triggered() {
            return None;
        }
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(key) {
            if now < entry.cooldown_until {
                return Some(entry.cooldown_until.saturating_duration_since(now).as_millis() as u64);
            }
        }
        entries.insert(
            key.to_string(),
            ThrottleEntry {
                cooldown_until: now + self.cooldown,
                session_id: session_id.map(str::to_string),
            },
        );
        None
    }

    pub async fn delete_all_for_session(&self, session_id: &str) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.session_id.as_deref() != Some(session_id));
        before - entries.len()
    }
}

impl Default for RefreshThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_COOLDOWN)
    }
}

//! 在途请求去重
//!
//! 同一指纹同时只有一个远端调用；后到的调用方拿到同一个结果（包括同一个错误）。
//! 调用在独立任务中运行到结束，即使所有等待方都已放弃；结束时先从注册表移除自身，再交付结果。
//! 槽位被移除（会话关闭）或被 force refresh 顶替后，调用的结果仍交付给等待方，但 `CallSlot::commit_if_current` 不再执行副作用。

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;

use crate::core::OrchestratorError;
use crate::itinerary::RequestFingerprint;

type SharedCall<T> = Shared<BoxFuture<'static, Result<T, OrchestratorError>>>;

type CallMap<T> = Arc<Mutex<HashMap<RequestFingerprint, InFlightCall<T>>>>;

struct InFlightCall<T> {
    /// 区分同一指纹上被 force refresh 顶替的旧调用
    id: u64,
    call: SharedCall<T>,
}

/// 交给调用本身的槽位句柄
pub struct CallSlot<T> {
    calls: CallMap<T>,
    fingerprint: RequestFingerprint,
    id: u64,
}

impl<T> CallSlot<T> {
    /// 调用仍占有其指纹的槽位时执行 `commit` 并返回 true
    ///
    /// `commit` 执行期间持有注册表锁，与 `delete_all_for_session` 互斥。
    pub async fn commit_if_current<Fut>(&self, commit: Fut) -> bool
    where
        Fut: Future<Output = ()>,
    {
        let calls = self.calls.lock().await;
        if calls.get(&self.fingerprint).map(|c| c.id) != Some(self.id) {
            tracing::debug!("Call for {} no longer registered, skipping commit", self.fingerprint);
            return false;
        }
        commit.await;
        drop(calls);
        true
    }
}

/// 在途调用注册表
pub struct InFlightRegistry<T> {
    calls: CallMap<T>,
    next_id: AtomicU64,
}

impl<T> InFlightRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// 去重执行
    ///
    /// - `force_refresh = false` 且已有在途调用：等待该调用的结果，`work` 被丢弃
    /// - `force_refresh = true`：总是发起新调用并占用该指纹的槽位，旧调用独立完成
    ///
    /// `work` 收到本次调用的 `CallSlot`，只在真正发起调用时被执行。
    pub async fn run_deduped<W, F>(
        &self,
        fingerprint: &RequestFingerprint,
        force_refresh: bool,
        work: W,
    ) -> Result<T, OrchestratorError>
    where
        W: FnOnce(CallSlot<T>) -> F,
        F: Future<Output = Result<T, OrchestratorError>> + Send + 'static,
    {
        let call = {
            let mut calls = self.calls.lock().await;
            let existing = if force_refresh {
                None
            } else {
                calls.get(fingerprint).map(|c| c.call.clone())
            };

            match existing {
                Some(call) => {
                    tracing::debug!("Joining in-flight call for {}", fingerprint);
                    call
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let slot = CallSlot {
                        calls: Arc::clone(&self.calls),
                        fingerprint: fingerprint.clone(),
                        id,
                    };
                    let call = self.spawn_call(fingerprint.clone(), id, work(slot));
                    calls.insert(
                        fingerprint.clone(),
                        InFlightCall {
                            id,
                            call: call.clone(),
                        },
                    );
                    call
                }
            }
        };

        call.await
    }

    fn spawn_call<F>(&self, fingerprint: RequestFingerprint, id: u64, work: F) -> SharedCall<T>
    where
        F: Future<Output = Result<T, OrchestratorError>> + Send + 'static,
    {
        let calls = Arc::clone(&self.calls);
        // 调用方持有注册表锁直到插入完成，这里的移除一定发生在插入之后
        let handle = tokio::spawn(async move {
            let result = work.await;
            let mut calls = calls.lock().await;
            if calls.get(&fingerprint).map(|c| c.id) == Some(id) {
                calls.remove(&fingerprint);
            }
            result
        });

        async move {
            handle.await.unwrap_or_else(|e| {
                Err(OrchestratorError::SearchFailed(format!(
                    "comparison task aborted: {e}"
                )))
            })
        }
        .boxed()
        .shared()
    }

    /// 移除属于该会话的在途条目（已发起的调用继续运行，只是不再被新调用方复用）
    pub async fn delete_all_for_session(&self, session_id: &str) -> usize {
        let mut calls = self.calls.lock().await;
        let before = calls.len();
        calls.retain(|fp, _| !fp.belongs_to(session_id));
        before - calls.len()
    }

    pub async fn len(&self) -> usize {
        self.calls.lock().await.len()
    }
}

impl<T> Default for InFlightRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

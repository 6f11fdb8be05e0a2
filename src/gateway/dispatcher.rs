//! Dispatcher - 请求编排核心
//!
//! 把会话请求路由到各存储与远端客户端：
//! - **record / prefetch**：写上下文与令牌
//! - **compare**：恢复上下文 → 合并覆盖 → 查缓存 → 去重调用远端 → 写缓存与结果质量
//! - **refresh**：手动刷新先过冷却，系统刷新直接放行
//! - **hint**：首次 hint 到达且上次结果质量差时，带 hint 重试恰好一次
//!
//! 会话生命周期事件（派生 / 关闭）由宿主单独通知，不走请求通道。

use std::sync::Arc;

use tokio::time::Instant;

use super::builder::DispatcherBuilder;
use super::message::{CompareReply, Request, Response};
use crate::cache::ResultCache;
use crate::config::OrchestratorSection;
use crate::core::OrchestratorError;
use crate::inflight::{CallSlot, InFlightRegistry};
use crate::itinerary::{throttle_key, ItineraryOverrides, ItineraryParams, RequestFingerprint};
use crate::outcome::{CallOutcome, OutcomeTracker};
use crate::recovery::{ContextRecovery, DurablePageContexts, RecoverySource, SessionOwner};
use crate::remote::{CompareRequest, ComparePayload, RemoteClient};
use crate::store::{ContextStore, DurableStore, PageContext, TokenStore};
use crate::throttle::{RefreshReason, RefreshThrottle};

/// 各存储当前的条目数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub contexts: usize,
    pub cached_results: usize,
    pub outcomes: usize,
    pub in_flight: usize,
    pub pending_handshakes: usize,
}

/// 请求编排器
pub struct Dispatcher {
    pub(super) contexts: Arc<ContextStore>,
    pub(super) durable_contexts: Arc<DurablePageContexts>,
    pub(super) tokens: Arc<TokenStore>,
    pub(super) results: Arc<ResultCache<ComparePayload>>,
    pub(super) inflight: InFlightRegistry<ComparePayload>,
    pub(super) outcomes: Arc<OutcomeTracker>,
    pub(super) throttle: Arc<RefreshThrottle>,
    pub(super) recovery: ContextRecovery,
    pub(super) remote: Arc<dyn RemoteClient>,
}

impl Dispatcher {
    /// 以给定持久 KV 创建，其余存储按配置新建；需要共享存储句柄时用 `DispatcherBuilder`
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        durable: Arc<dyn DurableStore>,
        owner: Arc<dyn SessionOwner>,
        config: &OrchestratorSection,
    ) -> Self {
        DispatcherBuilder::new(remote, owner)
            .with_config(config)
            .with_durable(durable)
            .build()
    }

    pub fn builder(remote: Arc<dyn RemoteClient>, owner: Arc<dyn SessionOwner>) -> DispatcherBuilder {
        DispatcherBuilder::new(remote, owner)
    }

    /// 处理一个请求；所有失败都以 `Response::Error` 返回
    pub async fn dispatch(&self, session_id: Option<&str>, request: Request) -> Response {
        let kind = request.kind();
        let result = match session_id.filter(|s| !s.is_empty()) {
            None => Err(OrchestratorError::MissingSession),
            Some(sid) => self.route(sid, request).await,
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    "{} for session {:?} failed: {} ({})",
                    kind,
                    session_id,
                    e,
                    e.code()
                );
                Response::error(&e)
            }
        }
    }

    async fn route(&self, sid: &str, request: Request) -> Result<Response, OrchestratorError> {
        match request {
            Request::RecordContext { context } => self.record_context(sid, context).await,
            Request::PrefetchContext { params } => self.prefetch_context(sid, params).await,
            Request::SetHint { official_url } => self.set_hint(sid, &official_url).await,
            Request::GetCompareData {
                overrides,
                force_refresh,
            } => {
                self.get_compare_data(sid, overrides.unwrap_or_default(), force_refresh)
                    .await
            }
            Request::RefreshCompare { overrides, reason } => {
                self.refresh_compare(sid, overrides.unwrap_or_default(), reason)
                    .await
            }
            Request::GetContext => Ok(Response::Context {
                context: self.contexts.get(sid).await,
            }),
            Request::ContextResponse {
                payload,
                correlation_id,
            } => {
                let disposition = self
                    .recovery
                    .handle_page_context_response(sid, PageContext::new(payload), &correlation_id)
                    .await;
                Ok(Response::ContextAccepted { disposition })
            }
        }
    }

    async fn record_context(
        &self,
        sid: &str,
        params: ItineraryParams,
    ) -> Result<Response, OrchestratorError> {
        let context = PageContext::new(params.normalized());
        self.persist_context(sid, &context).await;
        self.contexts.set(sid, context).await;
        tracing::debug!("Recorded context for {}", sid);
        Ok(Response::Ack)
    }

    async fn prefetch_context(
        &self,
        sid: &str,
        params: ItineraryParams,
    ) -> Result<Response, OrchestratorError> {
        let params = params.normalized();
        validate(&params)?;

        let result = self.remote.prefetch(&params).await?;
        if let Err(e) = self.tokens.store(&params, &result.token, Some(sid)).await {
            tracing::warn!("Prefetched token for {} not persisted: {}", sid, e);
        }
        tracing::info!("Prefetched context token for {} ({} results)", sid, result.count);

        Ok(Response::Prefetched {
            token: result.token,
            count: result.count,
            cache_status: result.cache_status,
            metadata: result.metadata,
        })
    }

    async fn set_hint(&self, sid: &str, official_url: &str) -> Result<Response, OrchestratorError> {
        let official_url = official_url.trim();
        if official_url.is_empty() {
            return Err(OrchestratorError::InvalidParams("empty official url".to_string()));
        }

        let merged = self
            .contexts
            .with_context(sid, |ctx| {
                let previous = ctx.params.official_url.replace(official_url.to_string());
                (previous.is_none(), ctx.clone())
            })
            .await;
        let (first_hint, context) =
            merged.ok_or_else(|| OrchestratorError::NoContext(sid.to_string()))?;
        self.persist_context(sid, &context).await;

        if !first_hint {
            return Ok(Response::HintApplied {
                first_hint,
                retried: false,
            });
        }

        let params = context.params.normalized();
        if !params.has_dates() {
            return Ok(Response::HintApplied {
                first_hint,
                retried: false,
            });
        }

        let family = RequestFingerprint::family(sid, &params);
        let retried = self.outcomes.try_claim_retry(&family, Some(official_url)).await;
        if retried {
            tracing::info!("Retrying {} with official url hint", family);
            let fingerprint = RequestFingerprint::new(sid, &params);
            if let Err(e) = self.run_compare(sid, params, fingerprint, false).await {
                tracing::warn!("Hint retry for {} failed: {}", sid, e);
            }
        }

        Ok(Response::HintApplied {
            first_hint,
            retried,
        })
    }

    async fn get_compare_data(
        &self,
        sid: &str,
        overrides: ItineraryOverrides,
        force_refresh: bool,
    ) -> Result<Response, OrchestratorError> {
        let params = self.resolve_params(sid, &overrides).await?;
        let fingerprint = RequestFingerprint::new(sid, &params);

        if !force_refresh {
            if let Some(payload) = self.results.get(&fingerprint).await {
                tracing::debug!("Cache hit for {}", fingerprint);
                return Ok(compare_reply(Some(payload), true, false, None));
            }
        }

        let payload = self
            .run_compare(sid, params, fingerprint, force_refresh)
            .await?;
        Ok(compare_reply(Some(payload), false, false, None))
    }

    async fn refresh_compare(
        &self,
        sid: &str,
        overrides: ItineraryOverrides,
        reason: RefreshReason,
    ) -> Result<Response, OrchestratorError> {
        let params = self.resolve_params(sid, &overrides).await?;
        let fingerprint = RequestFingerprint::new(sid, &params);
        let key = throttle_key(&params);

        if let Some(retry_after_ms) = self
            .throttle
            .check_and_arm(&key, Instant::now(), reason, Some(sid))
            .await
        {
            tracing::info!("Refresh for {} throttled, retry after {}ms", sid, retry_after_ms);
            let cached = self.results.get(&fingerprint).await;
            let cache_hit = cached.is_some();
            return Ok(compare_reply(cached, cache_hit, true, Some(retry_after_ms)));
        }

        let payload = self.run_compare(sid, params, fingerprint, true).await?;
        Ok(compare_reply(Some(payload), false, false, None))
    }

    /// 恢复上下文并合并覆盖，得到可用于比价的归一化参数
    async fn resolve_params(
        &self,
        sid: &str,
        overrides: &ItineraryOverrides,
    ) -> Result<ItineraryParams, OrchestratorError> {
        let recovered = self
            .recovery
            .recover(sid, overrides.booking_url.as_deref())
            .await
            .map_err(|e| {
                tracing::warn!("No usable context for {} ({:?}): {}", sid, e.state(), e);
                OrchestratorError::NoContext(sid.to_string())
            })?;

        if recovered.source == RecoverySource::Handshake {
            self.persist_context(sid, &recovered.context).await;
            self.contexts.set(sid, recovered.context.clone()).await;
        }

        let params = overrides.apply(&recovered.context.params).normalized();
        validate(&params)?;
        Ok(params)
    }

    /// 经 in-flight 去重调用远端；成功且调用仍占有槽位时写结果缓存与结果质量
    async fn run_compare(
        &self,
        sid: &str,
        params: ItineraryParams,
        fingerprint: RequestFingerprint,
        force_refresh: bool,
    ) -> Result<ComparePayload, OrchestratorError> {
        let family = RequestFingerprint::family(sid, &params);
        let remote = Arc::clone(&self.remote);
        let tokens = Arc::clone(&self.tokens);
        let results = Arc::clone(&self.results);
        let outcomes = Arc::clone(&self.outcomes);
        let session_id = sid.to_string();
        let cache_key = fingerprint.clone();

        let work = move |slot: CallSlot<ComparePayload>| async move {
            let context_token = tokens
                .load(&params, Some(session_id.as_str()))
                .await
                .map(|t| t.token);
            let had_hint = params.official_url.is_some();
            let request = CompareRequest {
                params,
                context_token,
            };

            tracing::info!("Comparing {}", cache_key);
            let payload = remote
                .compare(&request)
                .await
                .map_err(OrchestratorError::from)?;

            let outcome = CallOutcome {
                offers_count: payload.offers_count,
                had_hint,
                match_uncertain: payload.match_info.match_uncertain,
                confidence: payload.match_info.confidence,
            };
            // 会话已关闭或被 force refresh 顶替时不写回
            slot.commit_if_current(async {
                results.set(cache_key, payload.clone()).await;
                outcomes.record(&family, outcome).await;
            })
            .await;
            Ok::<_, OrchestratorError>(payload)
        };

        self.inflight
            .run_deduped(&fingerprint, force_refresh, work)
            .await
    }

    async fn persist_context(&self, sid: &str, context: &PageContext) {
        if let Err(e) = self.durable_contexts.save(sid, context).await {
            tracing::warn!("Failed to persist context for {}: {}", sid, e);
        }
    }

    /// 宿主通知：从 parent 派生出 child 会话（如在新标签页打开详情页）
    pub async fn on_session_spawned(&self, parent_id: &str, child_id: &str) {
        match self.tokens.propagate(parent_id, child_id).await {
            Ok(true) => tracing::info!("Propagated context token {} -> {}", parent_id, child_id),
            Ok(false) => tracing::debug!("No context token to propagate from {}", parent_id),
            Err(e) => tracing::warn!(
                "Failed to propagate context token {} -> {}: {}",
                parent_id,
                child_id,
                e
            ),
        }
    }

    /// 宿主通知：会话结束，清理该会话的全部状态
    pub async fn on_session_closed(&self, session_id: &str) {
        self.contexts.delete(session_id).await;
        if let Err(e) = self.durable_contexts.remove(session_id).await {
            tracing::warn!("Failed to remove durable context for {}: {}", session_id, e);
        }
        self.tokens.forget_session(session_id).await;
        // 先摘除在途槽位，之后完成的调用不再写回缓存与结果质量
        let calls = self.inflight.delete_all_for_session(session_id).await;
        let results = self.results.delete_all_for_session(session_id).await;
        let outcomes = self.outcomes.delete_all_for_session(session_id).await;
        let throttles = self.throttle.delete_all_for_session(session_id).await;
        let handshakes = self.recovery.cancel_for_session(session_id).await;
        tracing::info!(
            "Session {} closed: dropped {} results, {} calls, {} outcomes, {} cooldowns, {} handshakes",
            session_id,
            results,
            calls,
            outcomes,
            throttles,
            handshakes
        );
    }

    pub async fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            contexts: self.contexts.len().await,
            cached_results: self.results.len().await,
            outcomes: self.outcomes.len().await,
            in_flight: self.inflight.len().await,
            pending_handshakes: self.recovery.pending_count().await,
        }
    }
}

fn validate(params: &ItineraryParams) -> Result<(), OrchestratorError> {
    if !params.has_dates() {
        return Err(OrchestratorError::MissingDates);
    }
    if params.hotel_name.is_empty() {
        return Err(OrchestratorError::InvalidParams("empty hotel name".to_string()));
    }
    Ok(())
}

fn compare_reply(
    payload: Option<ComparePayload>,
    cache_hit: bool,
    throttled: bool,
    retry_after_ms: Option<u64>,
) -> Response {
    Response::Compare(CompareReply {
        payload,
        cache_hit,
        throttled,
        retry_after_ms,
    })
}

//! Dispatcher 构建器
//!
//! 各存储句柄由宿主注入并共享所有权；未注入的按 `[orchestrator]` 配置创建。

use std::sync::Arc;

use super::dispatcher::Dispatcher;
use crate::cache::ResultCache;
use crate::config::OrchestratorSection;
use crate::inflight::InFlightRegistry;
use crate::outcome::OutcomeTracker;
use crate::recovery::{ContextRecovery, DurablePageContexts, SessionOwner};
use crate::remote::{ComparePayload, RemoteClient};
use crate::store::{ContextStore, DurableStore, MemoryDurableStore, TokenStore};
use crate::throttle::RefreshThrottle;

/// Dispatcher 构建器
pub struct DispatcherBuilder {
    remote: Arc<dyn RemoteClient>,
    owner: Arc<dyn SessionOwner>,
    config: OrchestratorSection,
    durable: Option<Arc<dyn DurableStore>>,
    contexts: Option<Arc<ContextStore>>,
    tokens: Option<Arc<TokenStore>>,
    results: Option<Arc<ResultCache<ComparePayload>>>,
    outcomes: Option<Arc<OutcomeTracker>>,
    throttle: Option<Arc<RefreshThrottle>>,
}

impl DispatcherBuilder {
    pub fn new(remote: Arc<dyn RemoteClient>, owner: Arc<dyn SessionOwner>) -> Self {
        Self {
            remote,
            owner,
            config: OrchestratorSection::default(),
            durable: None,
            contexts: None,
            tokens: None,
            results: None,
            outcomes: None,
            throttle: None,
        }
    }

    /// TTL、冷却、握手超时、低置信阈值
    pub fn with_config(mut self, config: &OrchestratorSection) -> Self {
        self.config = config.clone();
        self
    }

    /// 持久 KV（令牌与页面上下文后备）；未设置时用内存版
    pub fn with_durable(mut self, durable: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn with_contexts(mut self, contexts: Arc<ContextStore>) -> Self {
        self.contexts = Some(contexts);
        self
    }

    pub fn with_tokens(mut self, tokens: Arc<TokenStore>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_results(mut self, results: Arc<ResultCache<ComparePayload>>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn with_outcomes(mut self, outcomes: Arc<OutcomeTracker>) -> Self {
        self.outcomes = Some(outcomes);
        self
    }

    pub fn with_throttle(mut self, throttle: Arc<RefreshThrottle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn build(self) -> Dispatcher {
        let config = self.config;
        let durable = self
            .durable
            .unwrap_or_else(|| Arc::new(MemoryDurableStore::new()));
        let contexts = self.contexts.unwrap_or_default();
        let durable_contexts = Arc::new(DurablePageContexts::new(Arc::clone(&durable)));
        let recovery = ContextRecovery::new(
            Arc::clone(&contexts),
            durable_contexts.clone(),
            self.owner,
            config.handshake_timeout(),
        );

        Dispatcher {
            contexts,
            durable_contexts,
            tokens: self
                .tokens
                .unwrap_or_else(|| Arc::new(TokenStore::new(durable))),
            results: self
                .results
                .unwrap_or_else(|| Arc::new(ResultCache::new(config.result_ttl()))),
            inflight: InFlightRegistry::new(),
            outcomes: self
                .outcomes
                .unwrap_or_else(|| Arc::new(OutcomeTracker::new(config.low_confidence_threshold))),
            throttle: self
                .throttle
                .unwrap_or_else(|| Arc::new(RefreshThrottle::new(config.refresh_cooldown()))),
            recovery,
            remote: self.remote,
        }
    }
}

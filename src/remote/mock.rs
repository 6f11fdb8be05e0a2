//! Mock 远端客户端（用于测试，无需真实服务）
//!
//! 按脚本依次返回预置结果，脚本耗尽后返回默认结果；记录调用次数与最近的请求。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::traits::{
    CompareRequest, ComparePayload, MatchInfo, Offer, PrefetchResult, RemoteClient, RemoteError,
};
use crate::itinerary::ItineraryParams;

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockRemoteClient {
    compare_script: Mutex<VecDeque<Result<ComparePayload, RemoteError>>>,
    prefetch_script: Mutex<VecDeque<Result<PrefetchResult, RemoteError>>>,
    compare_calls: AtomicUsize,
    prefetch_calls: AtomicUsize,
    compare_requests: Mutex<Vec<CompareRequest>>,
    latency: Duration,
}

impl MockRemoteClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次调用前等待的时间（用于制造并发重叠）
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn push_compare(&self, result: Result<ComparePayload, RemoteError>) {
        if let Ok(mut script) = self.compare_script.lock() {
            script.push_back(result);
        }
    }

    pub fn push_prefetch(&self, result: Result<PrefetchResult, RemoteError>) {
        if let Ok(mut script) = self.prefetch_script.lock() {
            script.push_back(result);
        }
    }

    pub fn compare_calls(&self) -> usize {
        self.compare_calls.load(Ordering::SeqCst)
    }

    pub fn prefetch_calls(&self) -> usize {
        self.prefetch_calls.load(Ordering::SeqCst)
    }

    /// 已收到的 compare 请求（按到达顺序）
    pub fn compare_requests(&self) -> Vec<CompareRequest> {
        self.compare_requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// 构造一个含 n 条报价的结果
    pub fn payload(offers_count: usize, confidence: Option<f64>, match_uncertain: bool) -> ComparePayload {
        ComparePayload {
            offers_count,
            offers: (0..offers_count)
                .map(|i| Offer {
                    source: format!("provider-{i}"),
                    price: Some(100.0 + i as f64),
                    currency: Some("USD".to_string()),
                    url: None,
                    extra: Default::default(),
                })
                .collect(),
            match_info: MatchInfo {
                confidence,
                match_uncertain,
            },
            cache_status: Some("miss".to_string()),
        }
    }
}

#[async_trait]
impl RemoteClient for MockRemoteClient {
    async fn prefetch(&self, params: &ItineraryParams) -> Result<PrefetchResult, RemoteError> {
        let n = self.prefetch_calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let scripted = self.prefetch_script.lock().ok().and_then(|mut s| s.pop_front());
        scripted.unwrap_or_else(|| {
            Ok(PrefetchResult {
                token: format!("mock-token-{}-{}", params.hotel_name.trim().to_lowercase(), n),
                count: 1,
                cache_status: Some("miss".to_string()),
                metadata: None,
            })
        })
    }

    async fn compare(&self, request: &CompareRequest) -> Result<ComparePayload, RemoteError> {
        self.compare_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.compare_requests.lock() {
            requests.push(request.clone());
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let scripted = self.compare_script.lock().ok().and_then(|mut s| s.pop_front());
        scripted.unwrap_or_else(|| Ok(Self::payload(2, Some(0.95), false)))
    }
}

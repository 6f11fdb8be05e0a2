//! 边界层重试：对限流与瞬时网络错误做有限次指数退避 + 随机抖动
//!
//! 永久错误（参数错误、未找到）原样返回，不重试。

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use super::traits::{CompareRequest, ComparePayload, PrefetchResult, RemoteClient, RemoteError};
use crate::itinerary::ItineraryParams;

/// 重试配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 首次调用之外的最大重试次数
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(3),
        }
    }
}

impl RetryConfig {
    /// 第 attempt 次重试（从 0 开始）前的等待：min(max, base * 2^attempt) 加上至多一半的抖动；
    /// 远端给出 Retry-After 时不少于该值
    pub fn delay_for(&self, attempt: u32, retry_after_ms: Option<u64>) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter_ceiling = (exp.as_millis() as u64) / 2;
        let jitter = if jitter_ceiling > 0 {
            rand::thread_rng().gen_range(0..=jitter_ceiling)
        } else {
            0
        };
        let delay = exp + Duration::from_millis(jitter);
        match retry_after_ms {
            Some(ms) => delay.max(Duration::from_millis(ms)),
            None => delay,
        }
    }
}

/// 带重试的远端客户端包装
pub struct RetryingRemoteClient<C> {
    inner: C,
    config: RetryConfig,
}

impl<C: RemoteClient> RetryingRemoteClient<C> {
    pub fn new(inner: C, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = Result<T, RemoteError>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.delay_for(attempt, err.retry_after_ms());
                    tracing::warn!(
                        "Remote {} failed ({}), retrying in {:?} (attempt {}/{})",
                        op,
                        err,
                        delay,
                        attempt + 1,
                        self.config.max_retries
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl<C: RemoteClient> RemoteClient for RetryingRemoteClient<C> {
    async fn prefetch(&self, params: &ItineraryParams) -> Result<PrefetchResult, RemoteError> {
        self.with_retry("prefetch", || self.inner.prefetch(params)).await
    }

    async fn compare(&self, request: &CompareRequest) -> Result<ComparePayload, RemoteError> {
        self.with_retry("compare", || self.inner.compare(request)).await
    }
}

//! HTTP 实现：JSON POST 到 `{base_url}/prefetch` 与 `{base_url}/compare`
//!
//! 状态码映射：400 → InvalidParams，404 → NotFound，429 → RateLimited（读取 Retry-After），
//! 5xx / 连接失败 / 超时 → Transient；200 但 `ok: false` 时按 errorCode 映射。

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::traits::{
    CompareRequest, ComparePayload, MatchInfo, Offer, PrefetchResult, RemoteClient, RemoteError,
};
use crate::itinerary::ItineraryParams;

/// 请求体（远端使用 camelCase）
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireQuery<'a> {
    hotel_name: &'a str,
    check_in: Option<NaiveDate>,
    check_out: Option<NaiveDate>,
    adults: u32,
    currency: String,
    gl: String,
    hl: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    official_url: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    smart: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    context_token: Option<&'a str>,
}

impl<'a> WireQuery<'a> {
    fn new(params: &'a ItineraryParams, context_token: Option<&'a str>) -> Self {
        Self {
            hotel_name: params.hotel_name.trim(),
            check_in: params.check_in,
            check_out: params.check_out,
            adults: params.adults_or_default(),
            currency: params.normalized_currency(),
            gl: params.normalized_geo_locale(),
            hl: params.normalized_host_locale(),
            official_url: params.official_url.as_deref(),
            smart: params.smart_mode,
            context_token,
        }
    }
}

/// 响应信封
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default = "default_ok")]
    ok: bool,
    error_code: Option<String>,
    error: Option<String>,
    token: Option<String>,
    count: Option<usize>,
    cache_status: Option<String>,
    metadata: Option<serde_json::Value>,
    offers_count: Option<usize>,
    #[serde(default)]
    offers: Vec<Offer>,
    match_info: Option<WireMatchInfo>,
}

fn default_ok() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMatchInfo {
    confidence: Option<f64>,
    #[serde(default)]
    match_uncertain: bool,
}

/// 基于 reqwest 的远端客户端
#[derive(Debug, Clone)]
pub struct HttpRemoteClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemoteClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Network(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, path: &str, body: &WireQuery<'_>) -> Result<WireResponse, RemoteError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_ms = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let text = response.text().await.unwrap_or_default();
            return Err(map_status(status, retry_after_ms, text));
        }

        let envelope: WireResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Failed(format!("malformed response from {path}: {e}")))?;

        if !envelope.ok {
            return Err(map_error_code(
                envelope.error_code.as_deref(),
                envelope.error.unwrap_or_default(),
            ));
        }
        Ok(envelope)
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn prefetch(&self, params: &ItineraryParams) -> Result<PrefetchResult, RemoteError> {
        let envelope = self.post("prefetch", &WireQuery::new(params, None)).await?;
        let token = envelope
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RemoteError::Failed("prefetch response carried no token".into()))?;
        Ok(PrefetchResult {
            token,
            count: envelope.count.unwrap_or(0),
            cache_status: envelope.cache_status,
            metadata: envelope.metadata,
        })
    }

    async fn compare(&self, request: &CompareRequest) -> Result<ComparePayload, RemoteError> {
        let body = WireQuery::new(&request.params, request.context_token.as_deref());
        let envelope = self.post("compare", &body).await?;
        let match_info = envelope
            .match_info
            .map(|m| MatchInfo {
                confidence: m.confidence,
                match_uncertain: m.match_uncertain,
            })
            .unwrap_or_default();
        Ok(ComparePayload {
            offers_count: envelope.offers_count.unwrap_or(envelope.offers.len()),
            offers: envelope.offers,
            match_info,
            cache_status: envelope.cache_status,
        })
    }
}

fn map_transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() || err.is_connect() {
        RemoteError::Transient(err.to_string())
    } else {
        RemoteError::Network(err.to_string())
    }
}

/// Retry-After（秒）→ 毫秒；超大值饱和而不溢出
fn parse_retry_after(value: &str) -> Option<u64> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| secs.saturating_mul(1000))
}

fn map_status(status: StatusCode, retry_after_ms: Option<u64>, body: String) -> RemoteError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => RemoteError::InvalidParams(body),
        StatusCode::NOT_FOUND => RemoteError::NotFound(body),
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited { retry_after_ms },
        s if s.is_server_error() => RemoteError::Transient(format!("{s}: {body}")),
        s => RemoteError::Network(format!("{s}: {body}")),
    }
}

fn map_error_code(code: Option<&str>, message: String) -> RemoteError {
    match code {
        Some("INVALID_PARAMS") => RemoteError::InvalidParams(message),
        Some("NOT_FOUND") => RemoteError::NotFound(message),
        Some("RATE_LIMIT") => RemoteError::RateLimited { retry_after_ms: None },
        Some("NETWORK_ERROR") => RemoteError::Network(message),
        _ => RemoteError::Failed(message),
    }
}

//! Dispatcher 集成测试（Mock 远端，内存持久层）

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::mpsc;

use staylens::config::OrchestratorSection;
use staylens::cache::ResultCache;
use staylens::gateway::{CompareReply, Dispatcher, DispatcherStats, Request, Response};
use staylens::itinerary::{ItineraryOverrides, ItineraryParams};
use staylens::recovery::SessionOwner;
use staylens::remote::{ComparePayload, MockRemoteClient, PrefetchResult, RemoteError};
use staylens::store::{ContextStore, MemoryDurableStore, PageContext};
use staylens::throttle::RefreshReason;
use staylens::ErrorCode;

struct ChannelOwner {
    tx: mpsc::UnboundedSender<(String, String)>,
}

#[async_trait]
impl SessionOwner for ChannelOwner {
    async fn request_context_resend(
        &self,
        session_id: &str,
        correlation_id: &str,
    ) -> Result<(), String> {
        self.tx
            .send((session_id.to_string(), correlation_id.to_string()))
            .map_err(|e| e.to_string())
    }
}

struct Harness {
    dispatcher: Arc<Dispatcher>,
    remote: Arc<MockRemoteClient>,
    resends: mpsc::UnboundedReceiver<(String, String)>,
}

fn harness_with(remote: MockRemoteClient) -> Harness {
    let (tx, resends) = mpsc::unbounded_channel();
    let remote = Arc::new(remote);
    let dispatcher = Arc::new(Dispatcher::new(
        remote.clone(),
        Arc::new(MemoryDurableStore::new()),
        Arc::new(ChannelOwner { tx }),
        &OrchestratorSection::default(),
    ));
    Harness {
        dispatcher,
        remote,
        resends,
    }
}

fn harness() -> Harness {
    harness_with(MockRemoteClient::new())
}

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, day).unwrap()
}

fn aurora() -> ItineraryParams {
    ItineraryParams {
        hotel_name: "Hotel Aurora".into(),
        check_in: Some(date(1)),
        check_out: Some(date(3)),
        adults: Some(2),
        currency: Some("usd".into()),
        booking_url: Some("https://booking.example/hotel/aurora.html".into()),
        ..Default::default()
    }
}

fn get_compare() -> Request {
    Request::GetCompareData {
        overrides: None,
        force_refresh: false,
    }
}

fn refresh(reason: RefreshReason) -> Request {
    Request::RefreshCompare {
        overrides: None,
        reason,
    }
}

fn expect_compare(response: Response) -> CompareReply {
    match response {
        Response::Compare(reply) => reply,
        other => panic!("expected compare reply, got {:?}", other),
    }
}

async fn record(h: &Harness, sid: &str, params: ItineraryParams) {
    let ack = h
        .dispatcher
        .dispatch(Some(sid), Request::RecordContext { context: params })
        .await;
    assert_eq!(ack, Response::Ack);
}

#[tokio::test]
async fn test_second_compare_is_served_from_cache() {
    let h = harness();
    record(&h, "tab-1", aurora()).await;

    let first = expect_compare(h.dispatcher.dispatch(Some("tab-1"), get_compare()).await);
    assert!(!first.cache_hit);
    assert_eq!(first.payload.as_ref().unwrap().offers_count, 2);

    let second = expect_compare(h.dispatcher.dispatch(Some("tab-1"), get_compare()).await);
    assert!(second.cache_hit);
    assert_eq!(second.payload, first.payload);
    assert_eq!(h.remote.compare_calls(), 1);

    // 强制刷新绕过缓存
    let forced = expect_compare(
        h.dispatcher
            .dispatch(
                Some("tab-1"),
                Request::GetCompareData {
                    overrides: None,
                    force_refresh: true,
                },
            )
            .await,
    );
    assert!(!forced.cache_hit);
    assert_eq!(h.remote.compare_calls(), 2);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_remote_call() {
    let h = harness_with(MockRemoteClient::new().with_latency(Duration::from_millis(50)));
    record(&h, "tab-1", aurora()).await;

    let mut handles = Vec::new();
    for _ in 0..5 {
        let dispatcher = Arc::clone(&h.dispatcher);
        handles.push(tokio::spawn(async move {
            dispatcher.dispatch(Some("tab-1"), get_compare()).await
        }));
    }

    let mut payloads = Vec::new();
    for handle in handles {
        payloads.push(expect_compare(handle.await.unwrap()).payload.unwrap());
    }
    assert_eq!(h.remote.compare_calls(), 1);
    assert!(payloads.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(h.dispatcher.stats().await.in_flight, 0);
}

#[tokio::test]
async fn test_overrides_change_the_fingerprint() {
    let h = harness();
    record(&h, "tab-1", aurora()).await;
    h.dispatcher.dispatch(Some("tab-1"), get_compare()).await;

    let eur = Request::GetCompareData {
        overrides: Some(ItineraryOverrides {
            currency: Some("EUR".into()),
            ..Default::default()
        }),
        force_refresh: false,
    };
    let reply = expect_compare(h.dispatcher.dispatch(Some("tab-1"), eur).await);
    assert!(!reply.cache_hit);
    assert_eq!(h.remote.compare_calls(), 2);
    let last = h.remote.compare_requests().pop().unwrap();
    assert_eq!(last.params.currency.as_deref(), Some("EUR"));
}

#[tokio::test]
async fn test_weak_result_is_retried_once_with_hint() {
    let h = harness();
    h.remote
        .push_compare(Ok(MockRemoteClient::payload(0, None, true)));
    record(&h, "tab-1", aurora()).await;

    let first = expect_compare(h.dispatcher.dispatch(Some("tab-1"), get_compare()).await);
    assert_eq!(first.payload.unwrap().offers_count, 0);

    let hint = Request::SetHint {
        official_url: "https://www.hotelaurora.com".into(),
    };
    let applied = h.dispatcher.dispatch(Some("tab-1"), hint.clone()).await;
    assert_eq!(
        applied,
        Response::HintApplied {
            first_hint: true,
            retried: true
        }
    );
    assert_eq!(h.remote.compare_calls(), 2);
    let retry = h.remote.compare_requests().pop().unwrap();
    assert_eq!(
        retry.params.official_url.as_deref(),
        Some("https://www.hotelaurora.com")
    );

    // 带 hint 的结果已缓存
    let cached = expect_compare(h.dispatcher.dispatch(Some("tab-1"), get_compare()).await);
    assert!(cached.cache_hit);
    assert_eq!(cached.payload.unwrap().offers_count, 2);

    // 页面重置上下文后 hint 再次到达，也不会再重试
    record(&h, "tab-1", aurora()).await;
    let again = h.dispatcher.dispatch(Some("tab-1"), hint).await;
    assert_eq!(
        again,
        Response::HintApplied {
            first_hint: true,
            retried: false
        }
    );
    assert_eq!(h.remote.compare_calls(), 2);
}

#[tokio::test]
async fn test_confident_result_is_not_retried() {
    let h = harness();
    record(&h, "tab-1", aurora()).await;
    h.dispatcher.dispatch(Some("tab-1"), get_compare()).await;

    let applied = h
        .dispatcher
        .dispatch(
            Some("tab-1"),
            Request::SetHint {
                official_url: "https://hotelaurora.com".into(),
            },
        )
        .await;
    assert_eq!(
        applied,
        Response::HintApplied {
            first_hint: true,
            retried: false
        }
    );
    assert_eq!(h.remote.compare_calls(), 1);
}

#[tokio::test]
async fn test_hint_without_context_is_rejected() {
    let h = harness();
    let response = h
        .dispatcher
        .dispatch(
            Some("tab-1"),
            Request::SetHint {
                official_url: "https://hotelaurora.com".into(),
            },
        )
        .await;
    assert_eq!(response.error_code(), Some(ErrorCode::NoContext));
}

#[tokio::test]
async fn test_manual_refresh_is_throttled_within_cooldown() {
    let h = harness();
    record(&h, "tab-1", aurora()).await;

    let first = expect_compare(
        h.dispatcher
            .dispatch(Some("tab-1"), refresh(RefreshReason::Manual))
            .await,
    );
    assert!(!first.throttled);
    assert_eq!(h.remote.compare_calls(), 1);

    let second = expect_compare(
        h.dispatcher
            .dispatch(Some("tab-1"), refresh(RefreshReason::Manual))
            .await,
    );
    assert!(second.throttled);
    assert!(second.cache_hit);
    assert_eq!(second.payload, first.payload);
    let retry_after = second.retry_after_ms.unwrap();
    assert!(retry_after > 0 && retry_after <= 60_000);
    assert_eq!(h.remote.compare_calls(), 1);

    // 系统刷新不受冷却限制
    let system = expect_compare(
        h.dispatcher
            .dispatch(Some("tab-1"), refresh(RefreshReason::HintArrived))
            .await,
    );
    assert!(!system.throttled);
    assert_eq!(h.remote.compare_calls(), 2);
}

#[tokio::test]
async fn test_system_refresh_does_not_arm_cooldown() {
    let h = harness();
    record(&h, "tab-1", aurora()).await;

    h.dispatcher
        .dispatch(Some("tab-1"), refresh(RefreshReason::HintArrived))
        .await;
    let manual = expect_compare(
        h.dispatcher
            .dispatch(Some("tab-1"), refresh(RefreshReason::Manual))
            .await,
    );
    assert!(!manual.throttled);
    assert_eq!(h.remote.compare_calls(), 2);
}

#[tokio::test]
async fn test_missing_checkout_fails_without_remote_call() {
    let h = harness();
    record(
        &h,
        "tab-1",
        ItineraryParams {
            check_out: None,
            ..aurora()
        },
    )
    .await;

    let response = h.dispatcher.dispatch(Some("tab-1"), get_compare()).await;
    assert_eq!(response.error_code(), Some(ErrorCode::NoDates));
    assert_eq!(h.remote.compare_calls(), 0);
}

#[tokio::test]
async fn test_missing_session_id_is_rejected() {
    let h = harness();
    let response = h.dispatcher.dispatch(None, get_compare()).await;
    assert_eq!(response.error_code(), Some(ErrorCode::NoContext));
}

#[tokio::test]
async fn test_remote_errors_map_to_codes() {
    let h = harness();
    h.remote.push_compare(Err(RemoteError::NotFound(
        "no such hotel".into(),
    )));
    record(&h, "tab-1", aurora()).await;

    let response = h.dispatcher.dispatch(Some("tab-1"), get_compare()).await;
    assert_eq!(response.error_code(), Some(ErrorCode::NotFound));
    // 失败结果不缓存
    let retry = expect_compare(h.dispatcher.dispatch(Some("tab-1"), get_compare()).await);
    assert!(!retry.cache_hit);
    assert_eq!(h.remote.compare_calls(), 2);
}

#[tokio::test]
async fn test_session_close_drops_all_session_state() {
    let h = harness();
    record(&h, "tab-1", aurora()).await;
    record(&h, "tab-2", aurora()).await;
    h.dispatcher.dispatch(Some("tab-1"), get_compare()).await;
    h.dispatcher.dispatch(Some("tab-2"), get_compare()).await;
    h.dispatcher
        .dispatch(Some("tab-1"), refresh(RefreshReason::Manual))
        .await;

    h.dispatcher.on_session_closed("tab-1").await;

    assert_eq!(
        h.dispatcher.stats().await,
        DispatcherStats {
            contexts: 1,
            cached_results: 1,
            outcomes: 1,
            in_flight: 0,
            pending_handshakes: 0,
        }
    );
    let context = h.dispatcher.dispatch(Some("tab-1"), Request::GetContext).await;
    assert_eq!(context, Response::Context { context: None });

    // 新会话复用同一 ID 时冷却已清除
    record(&h, "tab-1", aurora()).await;
    let manual = expect_compare(
        h.dispatcher
            .dispatch(Some("tab-1"), refresh(RefreshReason::Manual))
            .await,
    );
    assert!(!manual.throttled);
}

#[tokio::test(start_paused = true)]
async fn test_call_finishing_after_session_close_is_not_cached() {
    let h = harness_with(MockRemoteClient::new().with_latency(Duration::from_millis(100)));
    record(&h, "tab-1", aurora()).await;

    let dispatcher = Arc::clone(&h.dispatcher);
    let waiter = tokio::spawn(async move { dispatcher.dispatch(Some("tab-1"), get_compare()).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.dispatcher.stats().await.in_flight, 1);

    h.dispatcher.on_session_closed("tab-1").await;

    // 等待方仍拿到结果，但不写回缓存与结果质量
    let reply = expect_compare(waiter.await.unwrap());
    assert_eq!(reply.payload.unwrap().offers_count, 2);
    let stats = h.dispatcher.stats().await;
    assert_eq!(stats.cached_results, 0);
    assert_eq!(stats.outcomes, 0);
    assert_eq!(stats.in_flight, 0);

    record(&h, "tab-1", aurora()).await;
    let fresh = expect_compare(h.dispatcher.dispatch(Some("tab-1"), get_compare()).await);
    assert!(!fresh.cache_hit);
    assert_eq!(h.remote.compare_calls(), 2);
}

#[tokio::test]
async fn test_failed_prefetch_stores_no_token() {
    let h = harness();
    h.remote
        .push_prefetch(Err(RemoteError::RateLimited { retry_after_ms: Some(500) }));

    let response = h
        .dispatcher
        .dispatch(Some("tab-1"), Request::PrefetchContext { params: aurora() })
        .await;
    assert_eq!(response.error_code(), Some(ErrorCode::RateLimit));
    assert_eq!(h.remote.prefetch_calls(), 1);

    record(&h, "tab-1", aurora()).await;
    h.dispatcher.dispatch(Some("tab-1"), get_compare()).await;
    let request = h.remote.compare_requests().pop().unwrap();
    assert_eq!(request.context_token, None);
}

#[tokio::test]
async fn test_prefetch_not_found_maps_to_code() {
    let h = harness();
    h.remote
        .push_prefetch(Err(RemoteError::NotFound("no such hotel".into())));

    let response = h
        .dispatcher
        .dispatch(Some("tab-1"), Request::PrefetchContext { params: aurora() })
        .await;
    assert_eq!(response.error_code(), Some(ErrorCode::NotFound));
}

#[tokio::test]
async fn test_prefetch_without_dates_skips_remote() {
    let h = harness();
    let response = h
        .dispatcher
        .dispatch(
            Some("tab-1"),
            Request::PrefetchContext {
                params: ItineraryParams {
                    check_out: None,
                    ..aurora()
                },
            },
        )
        .await;
    assert_eq!(response.error_code(), Some(ErrorCode::NoDates));
    assert_eq!(h.remote.prefetch_calls(), 0);
}

#[tokio::test]
async fn test_builder_shares_injected_stores() {
    let (tx, _resends) = mpsc::unbounded_channel();
    let remote = Arc::new(MockRemoteClient::new());
    let contexts = Arc::new(ContextStore::new());
    let results = Arc::new(ResultCache::<ComparePayload>::new(Duration::from_secs(300)));
    contexts.set("tab-1", PageContext::new(aurora())).await;

    let dispatcher = Dispatcher::builder(remote.clone(), Arc::new(ChannelOwner { tx }))
        .with_config(&OrchestratorSection::default())
        .with_durable(Arc::new(MemoryDurableStore::new()))
        .with_contexts(Arc::clone(&contexts))
        .with_results(Arc::clone(&results))
        .build();

    // 预先写入的上下文直接可用，无需握手
    let reply = expect_compare(dispatcher.dispatch(Some("tab-1"), get_compare()).await);
    assert!(!reply.cache_hit);
    assert_eq!(remote.compare_calls(), 1);
    assert_eq!(results.len().await, 1);

    dispatcher.on_session_closed("tab-1").await;
    assert_eq!(contexts.len().await, 0);
    assert_eq!(results.len().await, 0);
}

#[tokio::test]
async fn test_spawned_session_inherits_context_token() {
    let h = harness();
    h.remote.push_prefetch(Ok(PrefetchResult {
        token: "tok-aurora".into(),
        count: 12,
        cache_status: Some("miss".into()),
        metadata: None,
    }));

    let prefetched = h
        .dispatcher
        .dispatch(Some("tab-1"), Request::PrefetchContext { params: aurora() })
        .await;
    assert!(matches!(prefetched, Response::Prefetched { ref token, count: 12, .. } if token == "tok-aurora"));

    h.dispatcher.on_session_spawned("tab-1", "tab-2").await;
    record(&h, "tab-2", aurora()).await;
    h.dispatcher.dispatch(Some("tab-2"), get_compare()).await;

    let request = h.remote.compare_requests().pop().unwrap();
    assert_eq!(request.context_token.as_deref(), Some("tok-aurora"));
}

#[tokio::test]
async fn test_missing_context_is_recovered_by_handshake() {
    let mut h = harness();
    let dispatcher = Arc::clone(&h.dispatcher);
    let waiter = tokio::spawn(async move { dispatcher.dispatch(Some("tab-1"), get_compare()).await });

    let (session, correlation_id) = h.resends.recv().await.unwrap();
    assert_eq!(session, "tab-1");
    let response = h
        .dispatcher
        .dispatch(
            Some("tab-1"),
            Request::ContextResponse {
                payload: aurora(),
                correlation_id,
            },
        )
        .await;
    assert!(matches!(response, Response::ContextAccepted { .. }));

    let reply = expect_compare(waiter.await.unwrap());
    assert_eq!(reply.payload.unwrap().offers_count, 2);

    // 握手得到的上下文已写回
    let context = h.dispatcher.dispatch(Some("tab-1"), Request::GetContext).await;
    match context {
        Response::Context { context: Some(ctx) } => {
            assert_eq!(ctx.params.hotel_name, "Hotel Aurora")
        }
        other => panic!("expected stored context, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_handshake_fails_with_no_context() {
    let h = harness();
    let response = h.dispatcher.dispatch(Some("tab-1"), get_compare()).await;
    assert_eq!(response.error_code(), Some(ErrorCode::NoContext));
    assert_eq!(h.remote.compare_calls(), 0);
    assert_eq!(h.dispatcher.stats().await.pending_handshakes, 0);
}

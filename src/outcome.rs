//! 结果质量追踪：决定官方 URL hint 到达后是否值得带 hint 重试一次
//!
//! 记录按「指纹族」存放（不含 hint 的指纹），hint 到达后仍能找到之前的结果。
//! 每个指纹族最多重试一次，避免 hint 反复到达或抖动时形成重试风暴。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::itinerary::RequestFingerprint;

/// 置信度低于该值视为低置信
pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.65;

/// 一次调用结束后的结果摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub offers_count: usize,
    pub had_official_url_hint: bool,
    pub was_retried_with_hint: bool,
    pub match_uncertain: bool,
    pub confidence: Option<f64>,
}

/// record() 的输入（不含 was_retried_with_hint，该字段只由 mark_retried 设置）
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub offers_count: usize,
    pub had_hint: bool,
    pub match_uncertain: bool,
    pub confidence: Option<f64>,
}

/// 结果质量追踪器
#[derive(Debug)]
pub struct OutcomeTracker {
    records: RwLock<HashMap<RequestFingerprint, OutcomeRecord>>,
    low_confidence_threshold: f64,
}

impl OutcomeTracker {
    pub fn new(low_confidence_threshold: f64) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            low_confidence_threshold,
        }
    }

    /// 写入/覆盖记录，保留已有的 was_retried_with_hint
    pub async fn record(&self, family: &RequestFingerprint, outcome: CallOutcome) {
        let mut records = self.records.write().await;
        let was_retried = records
            .get(family)
            .map(|r| r.was_retried_with_hint)
            .unwrap_or(false);
        records.insert(
            family.clone(),
            OutcomeRecord {
                offers_count: outcome.offers_count,
                had_official_url_hint: outcome.had_hint,
                was_retried_with_hint: was_retried,
                match_uncertain: outcome.match_uncertain,
                confidence: outcome.confidence,
            },
        );
    }

    /// 无 hint / 无记录 / 已带 hint / 已重试过 → false；
    /// 否则任一弱信号（匹配不确定、低置信、零报价）即为 true
    pub async fn should_retry_with_hint(
        &self,
        family: &RequestFingerprint,
        new_hint: Option<&str>,
    ) -> bool {
        self.records
            .read()
            .await
            .get(family)
            .is_some_and(|prior| self.is_eligible(prior, new_hint))
    }

    /// 幂等；没有记录时不创建记录
    pub async fn mark_retried(&self, family: &RequestFingerprint) {
        if let Some(record) = self.records.write().await.get_mut(family) {
            record.was_retried_with_hint = true;
        }
    }

    /// 原子地检查并占用唯一一次重试机会
    pub async fn try_claim_retry(&self, family: &RequestFingerprint, new_hint: Option<&str>) -> bool {
        let mut records = self.records.write().await;
        let eligible = match records.get(family) {
            Some(prior) => self.is_eligible(prior, new_hint),
            None => false,
        };
        if eligible {
            if let Some(record) = records.get_mut(family) {
                record.was_retried_with_hint = true;
            }
        }
        eligible
    }

    fn is_eligible(&self, prior: &OutcomeRecord, new_hint: Option<&str>) -> bool {
        if new_hint.map(str::trim).map_or(true, str::is_empty) {
            return false;
        }
        if prior.had_official_url_hint || prior.was_retried_with_hint {
            return false;
        }
        let low_confidence = prior
            .confidence
            .is_some_and(|c| c < self.low_confidence_threshold);
        prior.match_uncertain || low_confidence || prior.offers_count == 0
    }

    pub async fn get(&self, family: &RequestFingerprint) -> Option<OutcomeRecord> {
        self.records.read().await.get(family).cloned()
    }

    pub async fn delete_all_for_session(&self, session_id: &str) -> usize {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|fp, _| !fp.belongs_to(session_id));
        before - records.len()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

impl Default for OutcomeTracker {
    fn default() -> Self {
        Self::new(LOW_CONFIDENCE_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::itinerary::ItineraryParams;

    const HINT: Option<&str> = Some("https://aurora-hotels.com");

    fn family() -> RequestFingerprint {
        RequestFingerprint::family(
            "tab-1",
            &ItineraryParams {
                hotel_name: "Hotel Aurora".to_string(),
                ..Default::default()
            },
        )
    }

    fn outcome(offers: usize, uncertain: bool, confidence: Option<f64>) -> CallOutcome {
        CallOutcome {
            offers_count: offers,
            had_hint: false,
            match_uncertain: uncertain,
            confidence,
        }
    }

    #[tokio::test]
    async fn test_no_retry_without_prior_record_or_hint() {
        let tracker = OutcomeTracker::default();
        assert!(!tracker.should_retry_with_hint(&family(), HINT).await);

        tracker.record(&family(), outcome(0, false, None)).await;
        assert!(!tracker.should_retry_with_hint(&family(), None).await);
        assert!(!tracker.should_retry_with_hint(&family(), Some("  ")).await);
    }

    #[tokio::test]
    async fn test_any_weak_signal_triggers_retry() {
        let tracker = OutcomeTracker::default();

        tracker.record(&family(), outcome(0, false, Some(0.99))).await;
        assert!(tracker.should_retry_with_hint(&family(), HINT).await);

        tracker.record(&family(), outcome(4, true, Some(0.99))).await;
        assert!(tracker.should_retry_with_hint(&family(), HINT).await);

        tracker.record(&family(), outcome(4, false, Some(0.5))).await;
        assert!(tracker.should_retry_with_hint(&family(), HINT).await);

        tracker.record(&family(), outcome(4, false, Some(0.65))).await;
        assert!(!tracker.should_retry_with_hint(&family(), HINT).await);

        tracker.record(&family(), outcome(4, false, None)).await;
        assert!(!tracker.should_retry_with_hint(&family(), HINT).await);
    }

    #[tokio::test]
    async fn test_prior_hint_blocks_retry() {
        let tracker = OutcomeTracker::default();
        tracker
            .record(
                &family(),
                CallOutcome {
                    had_hint: true,
                    ..outcome(0, true, Some(0.1))
                },
            )
            .await;
        assert!(!tracker.should_retry_with_hint(&family(), HINT).await);
    }

    #[tokio::test]
    async fn test_retry_flag_survives_new_records() {
        let tracker = OutcomeTracker::default();
        tracker.record(&family(), outcome(0, false, None)).await;

        tracker.mark_retried(&family()).await;
        tracker.mark_retried(&family()).await;
        assert!(!tracker.should_retry_with_hint(&family(), HINT).await);

        tracker.record(&family(), outcome(0, true, Some(0.1))).await;
        let record = tracker.get(&family()).await.unwrap();
        assert!(record.was_retried_with_hint);
        assert!(!tracker.should_retry_with_hint(&family(), HINT).await);
    }

    #[tokio::test]
    async fn test_mark_retried_does_not_create_records() {
        let tracker = OutcomeTracker::default();
        tracker.mark_retried(&family()).await;
        assert!(tracker.get(&family()).await.is_none());
    }

    #[tokio::test]
    async fn test_claim_retry_only_once() {
        let tracker = OutcomeTracker::default();
        tracker.record(&family(), outcome(0, false, None)).await;

        assert!(tracker.try_claim_retry(&family(), HINT).await);
        assert!(!tracker.try_claim_retry(&family(), HINT).await);
    }

    #[tokio::test]
    async fn test_delete_all_for_session() {
        let tracker = OutcomeTracker::default();
        tracker.record(&family(), outcome(0, false, None)).await;
        assert_eq!(tracker.delete_all_for_session("tab-1").await, 1);
        assert!(tracker.get(&family()).await.is_none());
    }
}

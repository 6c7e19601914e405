//! 通知处理器
//!
//! 把一批通知事件映射为具体通知并投递：
//!
//! ```text
//! NotificationEvent ──> MapperRegistry ──> 远程开关 ──> AppNotification::process
//!                          │ 未注册              │ 关闭             │
//!                          └──> Skipped         └──> Skipped       ├─ RequiresRetry ─> 重试队列
//!                                                                  ├─ 其他错误 ──────> Errored
//!                                                                  └─ Ok ────────────> Processed
//! ```
//!
//! 渠道开关在批次开始时读取一次，按值传给每条通知。

use std::sync::Arc;
use std::time::Instant;

use fanout_shared::observability::metrics;
use futures::future::join_all;
use tracing::{error, info, instrument, warn};

use crate::error::Result;
use crate::event::{DeliveryOutcome, NotificationEvent, SkipReason};
use crate::mapping::{DeliveryContext, DeliveryFlags, MapperRegistry};
use crate::remote_config::FeatureFlags;
use crate::retry_queue::RetryQueue;

/// 需要重试的通知如何处理
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// 写入重试队列
    Enqueue,
    /// 只记录日志，重新处理时使用
    Drop,
}

/// 一批通知的处理汇总
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    pub errored: usize,
    pub needs_retry: usize,
    pub duration_ms: u64,
    /// 批次中最大的区块高度
    pub blocknumber: Option<i64>,
}

impl BatchSummary {
    fn record(&mut self, outcome: &DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Processed => self.processed += 1,
            DeliveryOutcome::Skipped(_) => self.skipped += 1,
            DeliveryOutcome::Errored(_) => self.errored += 1,
            DeliveryOutcome::NeedsRetry => self.needs_retry += 1,
        }
    }

    pub fn is_balanced(&self) -> bool {
        self.processed + self.skipped + self.errored + self.needs_retry == self.total
    }
}

pub struct Processor {
    registry: MapperRegistry,
    flags: FeatureFlags,
    ctx: DeliveryContext,
    retry_queue: Arc<dyn RetryQueue>,
    batch_size: usize,
}

impl Processor {
    pub fn new(
        registry: MapperRegistry,
        flags: FeatureFlags,
        ctx: DeliveryContext,
        retry_queue: Arc<dyn RetryQueue>,
        batch_size: usize,
    ) -> Self {
        Self {
            registry,
            flags,
            ctx,
            retry_queue,
            batch_size: batch_size.max(1),
        }
    }

    /// 当前的渠道开关
    pub fn delivery_flags(&self) -> DeliveryFlags {
        DeliveryFlags {
            is_live_email_enabled: self.flags.live_email_enabled(),
            is_browser_push_enabled: self.flags.browser_push_enabled(),
        }
    }

    /// 处理一批通知，每 `batch_size` 条并发执行
    #[instrument(skip(self, events), fields(count = events.len(), ?mode))]
    pub async fn process(&self, events: Vec<NotificationEvent>, mode: RetryMode) -> BatchSummary {
        let started = Instant::now();
        let flags = self.delivery_flags();
        let mut summary = BatchSummary {
            total: events.len(),
            blocknumber: events.iter().filter_map(|e| e.blocknumber).max(),
            ..Default::default()
        };

        for chunk in events.chunks(self.batch_size) {
            let outcomes = join_all(chunk.iter().map(|e| self.process_one(e, flags))).await;
            for (event, outcome) in chunk.iter().zip(outcomes) {
                if outcome == DeliveryOutcome::NeedsRetry {
                    self.handle_retry(event, mode).await;
                }
                summary.record(&outcome);
            }
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        metrics::record_batch(
            summary.processed as u64,
            summary.skipped as u64,
            summary.errored as u64,
            summary.needs_retry as u64,
            started.elapsed().as_secs_f64(),
        );
        info!(
            total = summary.total,
            processed = summary.processed,
            skipped = summary.skipped,
            errored = summary.errored,
            needs_retry = summary.needs_retry,
            duration_ms = summary.duration_ms,
            blocknumber = ?summary.blocknumber,
            "通知批次处理完成"
        );
        summary
    }

    /// 重新处理重试队列中的全部通知
    ///
    /// 再次失败的通知不会重新入队。
    pub async fn reprocess(&self) -> Result<BatchSummary> {
        let batch = self.retry_queue.snapshot().await?;
        if batch.raw_len == 0 {
            return Ok(BatchSummary::default());
        }

        info!(count = batch.events.len(), raw = batch.raw_len, "重新处理重试队列");
        let summary = self.process(batch.events, RetryMode::Drop).await;
        self.retry_queue.remove_first(batch.raw_len).await?;
        Ok(summary)
    }

    async fn process_one(&self, event: &NotificationEvent, flags: DeliveryFlags) -> DeliveryOutcome {
        // 开关关闭的类型不解析载荷
        if !self.flags.is_type_enabled(&event.notification_type) {
            return DeliveryOutcome::Skipped(SkipReason::Disabled);
        }

        let notification = match self.registry.map(event) {
            None => return DeliveryOutcome::Skipped(SkipReason::UnknownType),
            Some(Err(e)) => {
                error!(notification_id = event.id, error = %e, "通知载荷无效");
                return DeliveryOutcome::Errored(e.to_string());
            }
            Some(Ok(n)) => n,
        };

        match notification.process(&self.ctx, flags).await {
            Ok(()) => DeliveryOutcome::Processed,
            Err(e) if e.is_requires_retry() => {
                warn!(notification_id = event.id, error = %e, "通知需要重试");
                DeliveryOutcome::NeedsRetry
            }
            Err(e) => {
                error!(
                    notification_id = event.id,
                    notification_type = %event.notification_type,
                    error = %e,
                    "通知投递失败"
                );
                DeliveryOutcome::Errored(e.to_string())
            }
        }
    }

    async fn handle_retry(&self, event: &NotificationEvent, mode: RetryMode) {
        match mode {
            RetryMode::Enqueue => match self.retry_queue.push(event).await {
                Ok(()) => metrics::record_retry_enqueued(),
                Err(e) => error!(notification_id = event.id, error = %e, "写入重试队列失败"),
            },
            RetryMode::Drop => {
                warn!(notification_id = event.id, "重试后仍失败，丢弃");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::badge::{MockBadgeCounter, UserLocks};
    use crate::error::NotificationError;
    use crate::remote_config::{MockRemoteConfigClient, features};
    use crate::retry_queue::{MockRetryQueue, RetryBatch};
    use crate::sender::{MockBrowserPushGateway, MockEmailGateway, MockPushGateway, PushResult};
    use crate::settings::{Device, DeviceType, MockEntityLookup, MockUserSettingsStore, UserSettings};
    use chrono::{TimeZone, Utc};
    use mockall::predicate::eq;
    use std::collections::HashMap;

    fn follow(id: i64) -> NotificationEvent {
        NotificationEvent {
            id,
            specifier: "2".into(),
            group_id: "follow:1".into(),
            notification_type: "follow".into(),
            timestamp: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            data: serde_json::json!({"follower_user_id": 2, "followee_user_id": 1}),
            user_ids: vec![1],
            blocknumber: Some(id * 10),
        }
    }

    fn flags_with(enabled: &'static [&'static str]) -> FeatureFlags {
        let mut client = MockRemoteConfigClient::new();
        client
            .expect_feature_variable_enabled()
            .returning(move |feature, variable| {
                (feature == features::NOTIFICATION_MAPPING && enabled.iter().any(|t| *t == variable))
                    .then_some(true)
            });
        client.expect_feature_variable_value().returning(|_, _| None);
        FeatureFlags::new(Arc::new(client))
    }

    fn ctx(push: MockPushGateway) -> DeliveryContext {
        let mut settings = MockUserSettingsStore::new();
        settings.expect_get_settings().returning(|_| {
            let mut s = UserSettings::new(1);
            s.devices.push(Device {
                device_type: DeviceType::Android,
                target_arn: "arn:1".into(),
            });
            Ok(HashMap::from([(1, s)]))
        });
        let mut entities = MockEntityLookup::new();
        entities
            .expect_user_names()
            .returning(|_| Ok(HashMap::from([(2, "user_2".to_string())])));
        let mut badges = MockBadgeCounter::new();
        badges.expect_current().returning(|_| Ok(0));
        badges.expect_increment().returning(|_| Ok(1));

        DeliveryContext {
            settings: Arc::new(settings),
            entities: Arc::new(entities),
            badges: Arc::new(badges),
            locks: Arc::new(UserLocks::new()),
            push: Arc::new(push),
            browser_push: Arc::new(MockBrowserPushGateway::new()),
            email: Arc::new(MockEmailGateway::new()),
            email_from: "n@example.com".into(),
        }
    }

    #[tokio::test]
    async fn test_unconfigured_type_is_skipped_without_sends() {
        let mut push = MockPushGateway::new();
        push.expect_send().never();
        let mut queue = MockRetryQueue::new();
        queue.expect_push().never();
        let processor = Processor::new(
            MapperRegistry::with_defaults(),
            flags_with(&[]),
            ctx(push),
            Arc::new(queue),
            20,
        );

        let summary = processor
            .process(vec![follow(1), follow(2)], RetryMode::Enqueue)
            .await;
        assert_eq!(summary.skipped, 2);
        assert!(summary.is_balanced());
        assert_eq!(summary.blocknumber, Some(20));
    }

    #[tokio::test]
    async fn test_disabled_type_with_bad_payload_is_skipped() {
        let mut push = MockPushGateway::new();
        push.expect_send().never();
        let processor = Processor::new(
            MapperRegistry::with_defaults(),
            flags_with(&[]),
            ctx(push),
            Arc::new(MockRetryQueue::new()),
            20,
        );

        let mut bad = follow(1);
        bad.data = serde_json::json!({});
        let summary = processor.process(vec![bad], RetryMode::Enqueue).await;
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.errored, 0);
        assert!(summary.is_balanced());
    }

    #[tokio::test]
    async fn test_counts_sum_to_input() {
        let mut push = MockPushGateway::new();
        push.expect_send().returning(|_, _| {
            Ok(PushResult {
                endpoint_disabled: false,
                message_id: "m".into(),
            })
        });
        let processor = Processor::new(
            MapperRegistry::with_defaults(),
            flags_with(&["follow"]),
            ctx(push),
            Arc::new(MockRetryQueue::new()),
            2,
        );

        let mut bad = follow(3);
        bad.data = serde_json::json!({});
        let mut unknown = follow(4);
        unknown.notification_type = "announcement".into();

        let summary = processor
            .process(vec![follow(1), follow(2), bad, unknown], RetryMode::Enqueue)
            .await;
        assert_eq!(summary.total, 4);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.errored, 1);
        assert_eq!(summary.skipped, 1);
        assert!(summary.is_balanced());
    }

    #[tokio::test]
    async fn test_requires_retry_is_enqueued_once() {
        let mut push = MockPushGateway::new();
        push.expect_send()
            .returning(|_, _| Err(NotificationError::gateway("push", "unavailable")));
        let mut queue = MockRetryQueue::new();
        queue
            .expect_push()
            .withf(|e| e.id == 1)
            .times(1)
            .returning(|_| Ok(()));
        let processor = Processor::new(
            MapperRegistry::with_defaults(),
            flags_with(&["follow"]),
            ctx(push),
            Arc::new(queue),
            20,
        );

        let summary = processor.process(vec![follow(1)], RetryMode::Enqueue).await;
        assert_eq!(summary.needs_retry, 1);
    }

    #[tokio::test]
    async fn test_reprocess_does_not_reenqueue() {
        let mut push = MockPushGateway::new();
        push.expect_send()
            .returning(|_, _| Err(NotificationError::gateway("push", "unavailable")));
        let mut queue = MockRetryQueue::new();
        queue.expect_snapshot().times(1).returning(|| {
            Ok(RetryBatch {
                events: vec![follow(1)],
                raw_len: 2,
            })
        });
        queue.expect_push().never();
        queue
            .expect_remove_first()
            .with(eq(2))
            .times(1)
            .returning(|_| Ok(()));
        let processor = Processor::new(
            MapperRegistry::with_defaults(),
            flags_with(&["follow"]),
            ctx(push),
            Arc::new(queue),
            20,
        );

        let summary = processor.reprocess().await.unwrap();
        assert_eq!(summary.needs_retry, 1);
    }

    #[tokio::test]
    async fn test_empty_retry_queue_is_noop() {
        let mut queue = MockRetryQueue::new();
        queue.expect_snapshot().returning(|| Ok(RetryBatch::default()));
        queue.expect_remove_first().never();
        let processor = Processor::new(
            MapperRegistry::with_defaults(),
            flags_with(&[]),
            ctx(MockPushGateway::new()),
            Arc::new(queue),
            20,
        );
        assert_eq!(processor.reprocess().await.unwrap(), BatchSummary::default());
    }
}

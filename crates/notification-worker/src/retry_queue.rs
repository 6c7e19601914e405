//! 重试队列
//!
//! 需要重试的通知以 JSON 追加到 Redis 列表尾部。重新处理时先读取整个列表快照，
//! 处理结束后再裁掉快照长度的前缀；进程在两者之间崩溃时条目仍在，下次启动会再处理一次。

use async_trait::async_trait;
use fanout_shared::kv::KvStore;
use tracing::{instrument, warn};

use crate::error::Result;
use crate::event::NotificationEvent;

/// 一次快照读取的结果
#[derive(Debug, Default)]
pub struct RetryBatch {
    pub events: Vec<NotificationEvent>,
    /// 列表中被读取的条目数，包含无法解析的条目
    pub raw_len: usize,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RetryQueue: Send + Sync {
    async fn push(&self, event: &NotificationEvent) -> Result<()>;

    async fn snapshot(&self) -> Result<RetryBatch>;

    /// 删除列表头部 `count` 个条目
    async fn remove_first(&self, count: usize) -> Result<()>;
}

pub struct RedisRetryQueue {
    kv: KvStore,
    key: String,
}

impl RedisRetryQueue {
    pub fn new(kv: KvStore, key: impl Into<String>) -> Self {
        Self {
            kv,
            key: key.into(),
        }
    }
}

/// 解析快照条目，跳过损坏的记录
pub fn decode_records(raw: &[String]) -> Vec<NotificationEvent> {
    raw.iter()
        .filter_map(|r| match serde_json::from_str::<NotificationEvent>(r) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(error = %e, "重试记录无法解析，丢弃");
                None
            }
        })
        .collect()
}

#[async_trait]
impl RetryQueue for RedisRetryQueue {
    #[instrument(skip(self, event), fields(notification_id = event.id))]
    async fn push(&self, event: &NotificationEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        self.kv.rpush(&self.key, &payload).await?;
        Ok(())
    }

    async fn snapshot(&self) -> Result<RetryBatch> {
        let raw = self.kv.lrange(&self.key, 0, -1).await?;
        Ok(RetryBatch {
            events: decode_records(&raw),
            raw_len: raw.len(),
        })
    }

    async fn remove_first(&self, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        self.kv.ltrim(&self.key, count as isize, -1).await?;
        Ok(())
    }
}

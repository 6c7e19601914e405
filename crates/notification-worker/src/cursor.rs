//! 私信游标
//!
//! 游标以字符串形式保存在 Redis：消息与回应游标为 RFC 3339 时间戳，
//! 群发游标为群发 id 加已处理的最大接收者 id。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fanout_shared::config::CursorKeysConfig;
use fanout_shared::kv::KvStore;
use tracing::warn;

use crate::error::Result;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

pub struct RedisCursorStore {
    kv: KvStore,
}

impl RedisCursorStore {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl CursorStore for RedisCursorStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.kv.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        Ok(self.kv.set(key, value).await?)
    }
}

/// 群发扇出的断点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlastCursor {
    pub blast_id: Option<String>,
    /// 当前群发已处理的最大接收者 id，新群发为 -1
    pub user_id: i64,
}

impl Default for BlastCursor {
    fn default() -> Self {
        Self {
            blast_id: None,
            user_id: -1,
        }
    }
}

/// 私信引擎使用的四个游标
#[derive(Clone)]
pub struct DmCursors {
    store: Arc<dyn CursorStore>,
    keys: CursorKeysConfig,
}

impl DmCursors {
    pub fn new(store: Arc<dyn CursorStore>, keys: CursorKeysConfig) -> Self {
        Self { store, keys }
    }

    pub async fn message(&self) -> Result<Option<DateTime<Utc>>> {
        self.timestamp(&self.keys.last_indexed_message).await
    }

    pub async fn set_message(&self, ts: DateTime<Utc>) -> Result<()> {
        self.store
            .set(&self.keys.last_indexed_message, &ts.to_rfc3339())
            .await
    }

    pub async fn reaction(&self) -> Result<Option<DateTime<Utc>>> {
        self.timestamp(&self.keys.last_indexed_reaction).await
    }

    pub async fn set_reaction(&self, ts: DateTime<Utc>) -> Result<()> {
        self.store
            .set(&self.keys.last_indexed_reaction, &ts.to_rfc3339())
            .await
    }

    pub async fn blast(&self) -> Result<BlastCursor> {
        let blast_id = self
            .store
            .get(&self.keys.last_indexed_blast_id)
            .await?
            .filter(|s| !s.is_empty());
        let user_id = match self.store.get(&self.keys.last_indexed_blast_user_id).await? {
            Some(raw) => raw.parse::<i64>().unwrap_or_else(|_| {
                warn!(value = %raw, "群发接收者游标无法解析，从头开始");
                -1
            }),
            None => -1,
        };
        Ok(BlastCursor { blast_id, user_id })
    }

    pub async fn set_blast(&self, cursor: &BlastCursor) -> Result<()> {
        if let Some(blast_id) = &cursor.blast_id {
            self.store
                .set(&self.keys.last_indexed_blast_id, blast_id)
                .await?;
        }
        self.store
            .set(
                &self.keys.last_indexed_blast_user_id,
                &cursor.user_id.to_string(),
            )
            .await
    }

    async fn timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(ts) => Ok(Some(ts.with_timezone(&Utc))),
            Err(e) => {
                warn!(key, value = %raw, error = %e, "游标时间戳无法解析，视为未设置");
                Ok(None)
            }
        }
    }
}

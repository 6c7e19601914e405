//! 角标计数
//!
//! 计数存放在身份库，每个用户一行。递增使用单条 upsert 完成，
//! 同一用户的并发递增不会丢失更新；"已读"信号到达时清零。

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::PgPool;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument};

use crate::error::Result;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BadgeCounter: Send + Sync {
    /// 当前计数，无记录时为 0
    async fn current(&self, user_id: i64) -> Result<i64>;

    /// 原子加一，返回新值
    async fn increment(&self, user_id: i64) -> Result<i64>;

    async fn reset(&self, user_id: i64) -> Result<()>;
}

pub struct PgBadgeCounter {
    pool: PgPool,
}

impl PgBadgeCounter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BadgeCounter for PgBadgeCounter {
    async fn current(&self, user_id: i64) -> Result<i64> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT "iosBadgeCount"::bigint
            FROM "PushNotificationBadgeCounts"
            WHERE "userId" = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.unwrap_or(0))
    }

    #[instrument(skip(self))]
    async fn increment(&self, user_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO "PushNotificationBadgeCounts"
                ("userId", "iosBadgeCount", "createdAt", "updatedAt")
            VALUES ($1, 1, NOW(), NOW())
            ON CONFLICT ("userId") DO UPDATE
            SET "iosBadgeCount" = "PushNotificationBadgeCounts"."iosBadgeCount" + 1,
                "updatedAt" = NOW()
            RETURNING "iosBadgeCount"::bigint
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        debug!(user_id, count, "角标计数已递增");
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn reset(&self, user_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO "PushNotificationBadgeCounts"
                ("userId", "iosBadgeCount", "createdAt", "updatedAt")
            VALUES ($1, 0, NOW(), NOW())
            ON CONFLICT ("userId") DO UPDATE
            SET "iosBadgeCount" = 0, "updatedAt" = NOW()
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// 按用户串行化投递
///
/// 同一批次里发往同一用户的通知依次读取计数、发送、递增，
/// 设备上看到的角标与到达顺序一致。
#[derive(Default)]
pub struct UserLocks {
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, user_id: i64) -> OwnedMutexGuard<()> {
        let mutex = self.locks.entry(user_id).or_default().clone();
        mutex.lock_owned().await
    }

    /// 清理没有持有者的锁
    pub fn prune_idle(&self) {
        self.locks.retain(|_, m| Arc::strong_count(m) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

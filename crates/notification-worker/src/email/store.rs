//! 摘要邮件的数据查询与发送记录

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::instrument;

use super::digest::DigestMessage;
use crate::error::Result;
use crate::event::NotificationEvent;
use crate::settings::EmailFrequency;

/// 摘要收件人
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestRecipient {
    pub user_id: i64,
    pub email: String,
    pub frequency: EmailFrequency,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DigestStore: Send + Sync {
    /// 频率匹配、邮箱可投递、且 `window_start` 之后没收过摘要的用户，按 id 升序分页
    async fn recipients(
        &self,
        frequencies: &[EmailFrequency],
        window_start: DateTime<Utc>,
        after_user_id: i64,
        limit: i64,
    ) -> Result<Vec<DigestRecipient>>;

    /// 窗口内用户未读的应用通知，按时间倒序
    async fn unseen_notifications(
        &self,
        user_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<NotificationEvent>>;

    /// 窗口内的私信与回应，用户在 `inactive_since` 之后没有打开过对应会话
    async fn unread_messages(
        &self,
        user_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        inactive_since: DateTime<Utc>,
    ) -> Result<Vec<DigestMessage>>;

    /// 写入发送记录
    async fn record_sent(
        &self,
        user_id: i64,
        frequency: EmailFrequency,
        sent_at: DateTime<Utc>,
    ) -> Result<()>;
}

pub struct PgDigestStore {
    discovery: PgPool,
    identity: PgPool,
}

impl PgDigestStore {
    pub fn new(discovery: PgPool, identity: PgPool) -> Self {
        Self {
            discovery,
            identity,
        }
    }
}

#[async_trait]
impl DigestStore for PgDigestStore {
    #[instrument(skip(self, frequencies))]
    async fn recipients(
        &self,
        frequencies: &[EmailFrequency],
        window_start: DateTime<Utc>,
        after_user_id: i64,
        limit: i64,
    ) -> Result<Vec<DigestRecipient>> {
        let names: Vec<&str> = frequencies.iter().map(|f| f.as_str()).collect();
        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            r#"
            SELECT u."blockchainUserId"::bigint AS user_id,
                   u.email,
                   COALESCE(s."emailFrequency"::text, 'live') AS frequency
            FROM "Users" u
            LEFT JOIN "UserNotificationSettings" s ON s."userId" = u."blockchainUserId"
            WHERE u."isEmailDeliverable" = true
              AND u.email IS NOT NULL
              AND u."blockchainUserId" > $3
              AND COALESCE(s."emailFrequency"::text, 'live') = ANY($1)
              AND NOT EXISTS (
                  SELECT 1 FROM "NotificationEmails" e
                  WHERE e."userId" = u."blockchainUserId"
                    AND e."timestamp" >= $2
              )
            ORDER BY u."blockchainUserId" ASC
            LIMIT $4
            "#,
        )
        .bind(&names)
        .bind(window_start)
        .bind(after_user_id)
        .bind(limit)
        .fetch_all(&self.identity)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, email, frequency)| DigestRecipient {
                user_id,
                email,
                frequency: EmailFrequency::parse(&frequency),
            })
            .collect())
    }

    async fn unseen_notifications(
        &self,
        user_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<NotificationEvent>> {
        let rows = sqlx::query_as::<_, NotificationEvent>(
            r#"
            SELECT n.id::bigint AS id,
                   n.specifier,
                   n.group_id,
                   n.type,
                   n.timestamp::timestamptz AS timestamp,
                   n.data,
                   n.user_ids::bigint[] AS user_ids,
                   n.blocknumber::bigint AS blocknumber
            FROM notification n
            WHERE $1 = ANY(n.user_ids)
              AND n.timestamp > $2
              AND n.timestamp <= $3
              AND NOT EXISTS (
                  SELECT 1 FROM notification_seen s
                  WHERE s.user_id = $1 AND s.seen_at >= n.timestamp
              )
            ORDER BY n.timestamp DESC
            "#,
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.discovery)
        .await?;
        Ok(rows)
    }

    async fn unread_messages(
        &self,
        user_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        inactive_since: DateTime<Utc>,
    ) -> Result<Vec<DigestMessage>> {
        let rows: Vec<(i64, bool, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT sender_user_id, is_reaction, created_at FROM (
                SELECT m.user_id::bigint AS sender_user_id,
                       false AS is_reaction,
                       m.created_at::timestamptz AS created_at
                FROM chat_message m
                JOIN chat_member cm ON cm.chat_id = m.chat_id
                WHERE cm.user_id = $1
                  AND m.user_id != $1
                  AND m.created_at > $2 AND m.created_at <= $3
                  AND (cm.last_active_at IS NULL OR cm.last_active_at < $4)
                UNION ALL
                SELECT r.user_id::bigint AS sender_user_id,
                       true AS is_reaction,
                       r.updated_at::timestamptz AS created_at
                FROM chat_message_reactions r
                JOIN chat_message m ON m.message_id = r.message_id
                JOIN chat_member cm ON cm.chat_id = m.chat_id AND cm.user_id = m.user_id
                WHERE m.user_id = $1
                  AND r.user_id != $1
                  AND r.updated_at > $2 AND r.updated_at <= $3
                  AND (cm.last_active_at IS NULL OR cm.last_active_at < $4)
            ) dm
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .bind(inactive_since)
        .fetch_all(&self.discovery)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(sender_user_id, is_reaction, created_at)| DigestMessage {
                sender_user_id,
                is_reaction,
                created_at,
            })
            .collect())
    }

    async fn record_sent(
        &self,
        user_id: i64,
        frequency: EmailFrequency,
        sent_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO "NotificationEmails" ("userId", "emailFrequency", "timestamp", "createdAt", "updatedAt")
            VALUES ($1, $2, $3, $3, $3)
            "#,
        )
        .bind(user_id)
        .bind(frequency.as_str())
        .bind(sent_at)
        .execute(&self.identity)
        .await?;
        Ok(())
    }
}

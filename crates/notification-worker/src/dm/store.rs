//! 私信引擎的数据查询

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::instrument;

use super::audience::PermissionFacts;
use crate::cursor::BlastCursor;
use crate::error::Result;

/// 接收者未读的一条私信
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct UnreadMessage {
    pub message_id: String,
    pub chat_id: String,
    pub sender_user_id: i64,
    pub receiver_user_id: i64,
    pub created_at: DateTime<Utc>,
}

/// 消息作者未读的一条表情回应
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct UnreadReaction {
    pub message_id: String,
    pub chat_id: String,
    /// 回应者
    pub sender_user_id: i64,
    /// 消息作者
    pub receiver_user_id: i64,
    pub reaction: String,
    pub created_at: DateTime<Utc>,
}

/// 群发的一个候选接收者
#[derive(Debug, Clone, PartialEq)]
pub struct BlastCandidate {
    pub blast_id: String,
    pub audience: String,
    pub sender_user_id: i64,
    pub receiver_user_id: i64,
    pub created_at: DateTime<Utc>,
    pub facts: PermissionFacts,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DmStore: Send + Sync {
    /// `(max(接收者最后活跃时间, min), max]` 区间内、发送者不是接收者的消息
    async fn unread_messages(
        &self,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    ) -> Result<Vec<UnreadMessage>>;

    /// 同一区间内、回应者不是消息作者的回应
    async fn unread_reactions(
        &self,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    ) -> Result<Vec<UnreadReaction>>;

    /// 游标之后的群发候选接收者，按 `(blast_id, receiver_user_id)` 升序，最多 `limit` 个
    async fn blast_candidates(
        &self,
        cursor: &BlastCursor,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<BlastCandidate>>;

    /// `created_before` 之前最新的群发 id
    async fn latest_blast_id(&self, created_before: DateTime<Utc>) -> Result<Option<String>>;
}

pub struct PgDmStore {
    pool: PgPool,
}

impl PgDmStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct BlastCandidateRow {
    blast_id: String,
    audience: String,
    sender_user_id: i64,
    receiver_user_id: i64,
    created_at: DateTime<Utc>,
    permits: Vec<String>,
    recipient_follows_sender: bool,
    sender_tipped_recipient: bool,
    sender_verified: bool,
    blocked: bool,
}

impl From<BlastCandidateRow> for BlastCandidate {
    fn from(row: BlastCandidateRow) -> Self {
        Self {
            blast_id: row.blast_id,
            audience: row.audience,
            sender_user_id: row.sender_user_id,
            receiver_user_id: row.receiver_user_id,
            created_at: row.created_at,
            facts: PermissionFacts {
                permits: row.permits,
                recipient_follows_sender: row.recipient_follows_sender,
                sender_tipped_recipient: row.sender_tipped_recipient,
                sender_verified: row.sender_verified,
                blocked: row.blocked,
            },
        }
    }
}

#[async_trait]
impl DmStore for PgDmStore {
    #[instrument(skip(self))]
    async fn unread_messages(
        &self,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    ) -> Result<Vec<UnreadMessage>> {
        let rows = sqlx::query_as::<_, UnreadMessage>(
            r#"
            SELECT m.message_id,
                   m.chat_id,
                   m.user_id::bigint AS sender_user_id,
                   cm.user_id::bigint AS receiver_user_id,
                   m.created_at::timestamptz AS created_at
            FROM chat_message m
            JOIN chat_member cm ON cm.chat_id = m.chat_id
            WHERE m.user_id != cm.user_id
              AND cm.is_hidden = false
              AND m.created_at > GREATEST(cm.last_active_at, $1)
              AND m.created_at <= $2
            ORDER BY m.created_at ASC
            "#,
        )
        .bind(min)
        .bind(max)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn unread_reactions(
        &self,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    ) -> Result<Vec<UnreadReaction>> {
        let rows = sqlx::query_as::<_, UnreadReaction>(
            r#"
            SELECT r.message_id,
                   m.chat_id,
                   r.user_id::bigint AS sender_user_id,
                   m.user_id::bigint AS receiver_user_id,
                   r.reaction,
                   r.updated_at::timestamptz AS created_at
            FROM chat_message_reactions r
            JOIN chat_message m ON m.message_id = r.message_id
            JOIN chat_member cm ON cm.chat_id = m.chat_id AND cm.user_id = m.user_id
            WHERE r.user_id != m.user_id
              AND r.updated_at > GREATEST(cm.last_active_at, $1)
              AND r.updated_at <= $2
            ORDER BY r.updated_at ASC
            "#,
        )
        .bind(min)
        .bind(max)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn blast_candidates(
        &self,
        cursor: &BlastCursor,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<BlastCandidate>> {
        let rows = sqlx::query_as::<_, BlastCandidateRow>(
            r#"
            WITH blasts AS (
                SELECT blast_id, from_user_id, audience, audience_content_type,
                       audience_content_id, created_at
                FROM chat_blast
                WHERE created_at <= $3
                  AND ($1::text IS NULL OR blast_id >= $1)
            ),
            targets AS (
                SELECT b.blast_id, b.audience, b.from_user_id, b.created_at,
                       f.follower_user_id AS to_user_id
                FROM blasts b
                JOIN follows f ON f.followee_user_id = b.from_user_id
                WHERE b.audience = 'follower_audience'
                  AND f.is_current AND NOT f.is_delete
                  AND f.created_at < b.created_at
                UNION
                SELECT b.blast_id, b.audience, b.from_user_id, b.created_at,
                       t.sender_user_id AS to_user_id
                FROM blasts b
                JOIN user_tips t ON t.receiver_user_id = b.from_user_id
                WHERE b.audience = 'tipper_audience'
                  AND t.created_at < b.created_at
                UNION
                SELECT b.blast_id, b.audience, b.from_user_id, b.created_at,
                       remix.owner_id AS to_user_id
                FROM blasts b
                JOIN tracks parent ON parent.owner_id = b.from_user_id AND parent.is_current
                JOIN tracks remix
                  ON (remix.remix_of -> 'tracks' -> 0 ->> 'parent_track_id')::int = parent.track_id
                WHERE b.audience = 'remixer_audience'
                  AND remix.is_current AND NOT remix.is_delete
                  AND remix.created_at < b.created_at
                  AND (b.audience_content_id IS NULL OR parent.track_id = b.audience_content_id)
                UNION
                SELECT b.blast_id, b.audience, b.from_user_id, b.created_at,
                       p.buyer_user_id AS to_user_id
                FROM blasts b
                JOIN usdc_purchases p ON p.seller_user_id = b.from_user_id
                WHERE b.audience = 'customer_audience'
                  AND p.created_at < b.created_at
                  AND (b.audience_content_id IS NULL
                       OR (p.content_type::text = b.audience_content_type
                           AND p.content_id = b.audience_content_id))
            )
            SELECT t.blast_id,
                   t.audience,
                   t.from_user_id::bigint AS sender_user_id,
                   t.to_user_id::bigint AS receiver_user_id,
                   t.created_at::timestamptz AS created_at,
                   COALESCE(
                       (SELECT array_agg(cp.permits::text) FROM chat_permissions cp
                        WHERE cp.user_id = t.to_user_id AND cp.allowed),
                       ARRAY[]::text[]
                   ) AS permits,
                   EXISTS (
                       SELECT 1 FROM follows f
                       WHERE f.follower_user_id = t.to_user_id
                         AND f.followee_user_id = t.from_user_id
                         AND f.is_current AND NOT f.is_delete
                   ) AS recipient_follows_sender,
                   EXISTS (
                       SELECT 1 FROM user_tips ut
                       WHERE ut.sender_user_id = t.from_user_id
                         AND ut.receiver_user_id = t.to_user_id
                   ) AS sender_tipped_recipient,
                   COALESCE(
                       (SELECT u.is_verified FROM users u
                        WHERE u.user_id = t.from_user_id AND u.is_current),
                       false
                   ) AS sender_verified,
                   EXISTS (
                       SELECT 1 FROM chat_blocked_users bu
                       WHERE (bu.blocker_user_id = t.to_user_id AND bu.blockee_user_id = t.from_user_id)
                          OR (bu.blocker_user_id = t.from_user_id AND bu.blockee_user_id = t.to_user_id)
                   ) AS blocked
            FROM targets t
            WHERE t.to_user_id != t.from_user_id
              AND ($1::text IS NULL
                   OR t.blast_id > $1
                   OR (t.blast_id = $1 AND t.to_user_id > $2))
            ORDER BY t.blast_id ASC, t.to_user_id ASC
            LIMIT $4
            "#,
        )
        .bind(cursor.blast_id.as_deref())
        .bind(cursor.user_id)
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(BlastCandidate::from).collect())
    }

    async fn latest_blast_id(&self, created_before: DateTime<Utc>) -> Result<Option<String>> {
        let id: Option<String> = sqlx::query_scalar(
            "SELECT MAX(blast_id) FROM chat_blast WHERE created_at <= $1",
        )
        .bind(created_before)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }
}

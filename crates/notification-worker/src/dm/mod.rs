//! 私信通知引擎
//!
//! 按游标轮询而不是监听事件。每一轮：
//!
//! 1. `max = now - delay`，消息和回应游标缺失时取 `max`
//! 2. 查询窗口内未读的消息与回应
//! 3. 查询游标之后的群发候选接收者，按批次大小截断，并检查私信权限
//! 4. 三路结果合并后按时间稳定排序（同一时间：消息、回应、群发）
//! 5. 依次投递
//! 6. 推进游标：有结果取本路最大时间，没有结果直接推进到 `max`；群发游标取最后处理的 `(blast_id, user_id)`

pub mod audience;
pub mod store;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use fanout_shared::observability::metrics;
use tracing::{debug, info, instrument, warn};

use self::audience::AudienceRule;
use self::store::{BlastCandidate, DmStore, UnreadMessage, UnreadReaction};
use crate::cursor::{BlastCursor, DmCursors};
use crate::error::Result;
use crate::hash_id::HashIds;
use crate::mapping::{
    AppNotification, DeliveryContext, DeliveryFlags, MessageNotification, ReactionNotification,
};
use crate::remote_config::FeatureFlags;

/// 私信引擎参数
#[derive(Debug, Clone)]
pub struct DmEngineSettings {
    /// 消息与回应的通知延迟
    pub notification_delay: Duration,
    /// 群发创建后的等待时间
    pub blast_delay: Duration,
    /// 每轮最多处理的群发接收者数
    pub blast_batch_size: i64,
    /// 群发通知拼会话 id 用的编码
    pub hash_ids: HashIds,
}

/// 一轮扫描的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DmCycleSummary {
    pub messages: usize,
    pub reactions: usize,
    pub blasts: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// 合并排序用的来源顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Source {
    Message,
    Reaction,
    Blast,
}

impl Source {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Reaction => "reaction",
            Self::Blast => "blast",
        }
    }
}

struct Pending {
    timestamp: DateTime<Utc>,
    source: Source,
    notification: AppNotification,
}

pub struct DmEngine {
    store: Arc<dyn DmStore>,
    cursors: DmCursors,
    ctx: DeliveryContext,
    flags: FeatureFlags,
    settings: DmEngineSettings,
}

impl DmEngine {
    pub fn new(
        store: Arc<dyn DmStore>,
        cursors: DmCursors,
        ctx: DeliveryContext,
        flags: FeatureFlags,
        settings: DmEngineSettings,
    ) -> Self {
        Self {
            store,
            cursors,
            ctx,
            flags,
            settings,
        }
    }

    #[instrument(skip(self))]
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<DmCycleSummary> {
        let started = Instant::now();
        let max_timestamp = now - self.settings.notification_delay;

        let min_message = self.cursors.message().await?.unwrap_or(max_timestamp);
        let min_reaction = self.cursors.reaction().await?.unwrap_or(max_timestamp);

        let messages: Vec<UnreadMessage> = self
            .store
            .unread_messages(min_message, max_timestamp)
            .await?
            .into_iter()
            .filter(|m| m.sender_user_id != m.receiver_user_id && m.created_at <= max_timestamp)
            .collect();
        let reactions: Vec<UnreadReaction> = self
            .store
            .unread_reactions(min_reaction, max_timestamp)
            .await?
            .into_iter()
            .filter(|r| r.sender_user_id != r.receiver_user_id && r.created_at <= max_timestamp)
            .collect();

        let blast_cursor = self.cursors.blast().await?;
        let blast_cutoff = now - self.settings.blast_delay;
        let candidates = self
            .store
            .blast_candidates(&blast_cursor, blast_cutoff, self.settings.blast_batch_size)
            .await?;
        let next_blast_cursor = self.next_blast_cursor(&blast_cursor, &candidates, blast_cutoff).await?;

        let mut pending = Vec::with_capacity(messages.len() + reactions.len() + candidates.len());
        pending.extend(messages.iter().map(message_notification));
        pending.extend(reactions.iter().map(reaction_notification));
        pending.extend(
            candidates
                .iter()
                .filter_map(|c| blast_notification(c, &self.settings.hash_ids)),
        );
        // 稳定排序，同一时间保持来源顺序
        pending.sort_by_key(|p| (p.timestamp, p.source));

        let mut summary = DmCycleSummary {
            messages: messages.len(),
            reactions: reactions.len(),
            blasts: pending.iter().filter(|p| p.source == Source::Blast).count(),
            ..Default::default()
        };

        let flags = DeliveryFlags {
            is_live_email_enabled: false,
            is_browser_push_enabled: self.flags.browser_push_enabled(),
        };
        for item in &pending {
            match item.notification.process(&self.ctx, flags).await {
                Ok(()) => {
                    summary.delivered += 1;
                    metrics::record_dm_notification(item.source.as_str());
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(kind = item.source.as_str(), error = %e, "私信通知投递失败");
                }
            }
        }

        let message_cursor = messages
            .iter()
            .map(|m| m.created_at)
            .max()
            .unwrap_or(max_timestamp)
            .max(min_message);
        let reaction_cursor = reactions
            .iter()
            .map(|r| r.created_at)
            .max()
            .unwrap_or(max_timestamp)
            .max(min_reaction);
        self.cursors.set_message(message_cursor).await?;
        self.cursors.set_reaction(reaction_cursor).await?;
        if next_blast_cursor != blast_cursor {
            self.cursors.set_blast(&next_blast_cursor).await?;
        }

        metrics::record_dm_cycle(started.elapsed().as_secs_f64());
        if !pending.is_empty() {
            info!(
                messages = summary.messages,
                reactions = summary.reactions,
                blasts = summary.blasts,
                delivered = summary.delivered,
                failed = summary.failed,
                "私信通知本轮完成"
            );
        }
        Ok(summary)
    }

    /// 有候选时取最后一个，否则跳到截止时间前最新的群发
    async fn next_blast_cursor(
        &self,
        current: &BlastCursor,
        candidates: &[BlastCandidate],
        cutoff: DateTime<Utc>,
    ) -> Result<BlastCursor> {
        if let Some(last) = candidates.last() {
            return Ok(BlastCursor {
                blast_id: Some(last.blast_id.clone()),
                user_id: last.receiver_user_id,
            });
        }

        let latest = self.store.latest_blast_id(cutoff).await?;
        match latest {
            Some(id) if current.blast_id.as_deref().is_none_or(|cur| id.as_str() > cur) => {
                debug!(blast_id = %id, "没有待处理的群发接收者，游标前移");
                Ok(BlastCursor {
                    blast_id: Some(id),
                    user_id: -1,
                })
            }
            _ => Ok(current.clone()),
        }
    }
}

fn message_notification(m: &UnreadMessage) -> Pending {
    Pending {
        timestamp: m.created_at,
        source: Source::Message,
        notification: AppNotification::Message(MessageNotification {
            sender_user_id: m.sender_user_id,
            receiver_user_id: m.receiver_user_id,
            chat_id: m.chat_id.clone(),
            message_id: m.message_id.clone(),
            timestamp: m.created_at,
            is_blast: false,
        }),
    }
}

fn reaction_notification(r: &UnreadReaction) -> Pending {
    Pending {
        timestamp: r.created_at,
        source: Source::Reaction,
        notification: AppNotification::Reaction(ReactionNotification {
            sender_user_id: r.sender_user_id,
            receiver_user_id: r.receiver_user_id,
            chat_id: r.chat_id.clone(),
            message_id: r.message_id.clone(),
            reaction: r.reaction.clone(),
            timestamp: r.created_at,
        }),
    }
}

/// 无权限、自发自收或未知受众的候选不生成通知，但仍计入游标
fn blast_notification(c: &BlastCandidate, hash_ids: &HashIds) -> Option<Pending> {
    if c.sender_user_id == c.receiver_user_id {
        return None;
    }
    if AudienceRule::parse(&c.audience).is_none() {
        warn!(blast_id = %c.blast_id, audience = %c.audience, "未知的群发受众");
        return None;
    }
    if !c.facts.is_permitted() {
        debug!(
            blast_id = %c.blast_id,
            receiver = c.receiver_user_id,
            "接收者不允许该发送者私信"
        );
        return None;
    }
    Some(Pending {
        timestamp: c.created_at,
        source: Source::Blast,
        notification: AppNotification::Message(MessageNotification {
            sender_user_id: c.sender_user_id,
            receiver_user_id: c.receiver_user_id,
            chat_id: hash_ids.chat_id(c.sender_user_id, c.receiver_user_id),
            message_id: c.blast_id.clone(),
            timestamp: c.created_at,
            is_blast: true,
        }),
    })
}

//! 摘要内容组装
//!
//! 私信按发送者合并，应用通知按 `group_id` 合并。整封邮件最多展示
//! [`MAX_ENTRIES`] 条；已展示分组的后续通知附加到该分组，不占新的条目。

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::event::NotificationEvent;

pub const MAX_ENTRIES: usize = 6;

/// 摘要中的一条私信记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestMessage {
    pub sender_user_id: i64,
    pub is_reaction: bool,
    pub created_at: DateTime<Utc>,
}

/// 合并后的私信条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEntry {
    pub sender_user_id: i64,
    pub is_reaction: bool,
    /// 同一发送者有多条
    pub multiple: bool,
}

/// 合并后的应用通知分组
#[derive(Debug, Clone, PartialEq)]
pub struct GroupEntry {
    /// 分组中最新的一条
    pub event: NotificationEvent,
    /// 附加到该分组的其余条数
    pub additional: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Digest {
    pub messages: Vec<MessageEntry>,
    pub groups: Vec<GroupEntry>,
    /// 窗口内的通知总数，包含未展示的
    pub total: usize,
}

impl Digest {
    /// `events` 与 `messages` 都按时间倒序
    pub fn build(events: Vec<NotificationEvent>, messages: &[DigestMessage]) -> Self {
        let total = events.len() + messages.len();

        let mut message_entries: Vec<MessageEntry> = Vec::new();
        let mut by_sender: HashMap<(i64, bool), usize> = HashMap::new();
        for m in messages {
            let key = (m.sender_user_id, m.is_reaction);
            if let Some(idx) = by_sender.get(&key) {
                message_entries[*idx].multiple = true;
                continue;
            }
            if message_entries.len() >= MAX_ENTRIES {
                continue;
            }
            by_sender.insert(key, message_entries.len());
            message_entries.push(MessageEntry {
                sender_user_id: m.sender_user_id,
                is_reaction: m.is_reaction,
                multiple: false,
            });
        }

        let slots = MAX_ENTRIES - message_entries.len();
        let mut groups: Vec<GroupEntry> = Vec::new();
        let mut by_group: HashMap<String, usize> = HashMap::new();
        for event in events {
            if let Some(idx) = by_group.get(&event.group_id) {
                groups[*idx].additional += 1;
                continue;
            }
            if groups.len() >= slots {
                continue;
            }
            by_group.insert(event.group_id.clone(), groups.len());
            groups.push(GroupEntry {
                event,
                additional: 0,
            });
        }

        Self {
            messages: message_entries,
            groups,
            total,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// 渲染需要查询名称的用户
    pub fn actor_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .messages
            .iter()
            .map(|m| m.sender_user_id)
            .chain(self.groups.iter().filter_map(|g| actor_id(&g.event)))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// 通知载荷中的触发者
pub fn actor_id(event: &NotificationEvent) -> Option<i64> {
    const ACTOR_FIELDS: [&str; 5] = [
        "follower_user_id",
        "user_id",
        "sender_user_id",
        "comment_user_id",
        "buyer_user_id",
    ];
    ACTOR_FIELDS
        .iter()
        .find_map(|field| event.data.get(*field).and_then(|v| v.as_i64()))
}

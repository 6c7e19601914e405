//! 私信与私信表情回应
//!
//! 这两类通知不来自通知表，由私信引擎从聊天表直接构造。群发消息复用
//! `MessageNotification`，以 `is_blast` 区分。

use chrono::{DateTime, Utc};
use serde_json::json;

use super::push::{RenderedPush, deliver_to_recipients};
use super::{DeliveryContext, DeliveryFlags, require_name};
use crate::error::Result;
use crate::event::push_id;
use crate::settings::NotificationCategory;

/// 两个用户之间的会话 id：两个 id 按字典序排列后拼接
pub fn chat_id(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageNotification {
    pub sender_user_id: i64,
    pub receiver_user_id: i64,
    pub chat_id: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub is_blast: bool,
}

impl MessageNotification {
    /// 客户端去重用的 id
    pub fn push_id(&self) -> String {
        let group = format!("message:{}:{}", self.chat_id, self.receiver_user_id);
        push_id(self.timestamp, &group, Some(&self.message_id))
    }

    pub async fn process(&self, ctx: &DeliveryContext, flags: DeliveryFlags) -> Result<()> {
        let names = ctx.entities.user_names(&[self.sender_user_id]).await?;
        let sender = require_name(&names, self.sender_user_id, "message", "user")?;
        let push = RenderedPush::new(
            NotificationCategory::Messages,
            "Message",
            format!("New message from {sender}"),
            json!({
                "id": self.push_id(),
                "type": "Message",
                "chatId": self.chat_id,
                "isBlast": self.is_blast,
            }),
        )
        .without_live_email();
        deliver_to_recipients(ctx, flags, &[self.receiver_user_id], &push).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReactionNotification {
    pub sender_user_id: i64,
    pub receiver_user_id: i64,
    pub chat_id: String,
    pub message_id: String,
    pub reaction: String,
    pub timestamp: DateTime<Utc>,
}

impl ReactionNotification {
    pub fn push_id(&self) -> String {
        let group = format!("reaction:{}:{}", self.message_id, self.sender_user_id);
        push_id(self.timestamp, &group, Some(&self.reaction))
    }

    /// 回应值到表情，未知值原样显示
    pub fn emoji(&self) -> &str {
        match self.reaction.as_str() {
            "heart" => "❤️",
            "fire" => "🔥",
            "party" => "🥳",
            "explode" => "🤯",
            other => other,
        }
    }

    pub async fn process(&self, ctx: &DeliveryContext, flags: DeliveryFlags) -> Result<()> {
        let names = ctx.entities.user_names(&[self.sender_user_id]).await?;
        let sender = require_name(&names, self.sender_user_id, "reaction", "user")?;
        let push = RenderedPush::new(
            NotificationCategory::Messages,
            "Reaction",
            format!("{sender} reacted {}", self.emoji()),
            json!({
                "id": self.push_id(),
                "type": "MessageReaction",
                "chatId": self.chat_id,
                "messageId": self.message_id,
            }),
        )
        .without_live_email();
        deliver_to_recipients(ctx, flags, &[self.receiver_user_id], &push).await?;
        Ok(())
    }
}

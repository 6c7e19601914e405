//! 关注、转发、收藏、评论

use serde::Deserialize;
use serde_json::json;

use super::push::{RenderedPush, deliver_to_recipients};
use super::{DeliveryContext, DeliveryFlags, EventMeta, parse_data, require_name};
use crate::error::Result;
use crate::event::NotificationEvent;
use crate::settings::NotificationCategory;

/// 被转发、收藏、评论的内容类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Track,
    Playlist,
    Album,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Track => "track",
            Self::Playlist => "playlist",
            Self::Album => "album",
        }
    }

    /// 推送数据中使用的实体类型名
    fn data_name(&self) -> &'static str {
        match self {
            Self::Track => "Track",
            Self::Playlist => "Playlist",
            Self::Album => "Album",
        }
    }
}

/// 查询实体名称
async fn entity_name(
    ctx: &DeliveryContext,
    kind: EntityKind,
    id: i64,
    notification_type: &str,
) -> Result<String> {
    let names = match kind {
        EntityKind::Track => ctx.entities.track_titles(&[id]).await?,
        EntityKind::Playlist | EntityKind::Album => ctx.entities.collection_names(&[id]).await?,
    };
    require_name(&names, id, notification_type, kind.as_str())
}

async fn user_name(ctx: &DeliveryContext, user_id: i64, notification_type: &str) -> Result<String> {
    let names = ctx.entities.user_names(&[user_id]).await?;
    require_name(&names, user_id, notification_type, "user")
}

// ---------------------------------------------------------------------------
// follow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct FollowData {
    follower_user_id: i64,
    followee_user_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Follow {
    pub meta: EventMeta,
    pub follower_user_id: i64,
    pub followee_user_id: i64,
}

impl Follow {
    pub fn from_event(event: &NotificationEvent) -> Result<Self> {
        let data: FollowData = parse_data(event)?;
        Ok(Self {
            meta: EventMeta::from_event(event),
            follower_user_id: data.follower_user_id,
            followee_user_id: data.followee_user_id,
        })
    }

    pub async fn process(&self, ctx: &DeliveryContext, flags: DeliveryFlags) -> Result<()> {
        let follower = user_name(ctx, self.follower_user_id, "follow").await?;
        let push = RenderedPush::new(
            NotificationCategory::Followers,
            "New Follow",
            format!("{follower} followed you"),
            json!({
                "id": self.meta.push_id(),
                "type": "Follow",
                "userIds": [self.follower_user_id],
            }),
        );
        deliver_to_recipients(ctx, flags, &self.meta.user_ids, &push).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// repost / save
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct RepostData {
    #[serde(rename = "type")]
    kind: EntityKind,
    user_id: i64,
    repost_item_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Repost {
    pub meta: EventMeta,
    pub kind: EntityKind,
    pub reposter_user_id: i64,
    pub item_id: i64,
}

impl Repost {
    pub fn from_event(event: &NotificationEvent) -> Result<Self> {
        let data: RepostData = parse_data(event)?;
        Ok(Self {
            meta: EventMeta::from_event(event),
            kind: data.kind,
            reposter_user_id: data.user_id,
            item_id: data.repost_item_id,
        })
    }

    pub async fn process(&self, ctx: &DeliveryContext, flags: DeliveryFlags) -> Result<()> {
        let reposter = user_name(ctx, self.reposter_user_id, "repost").await?;
        let title = entity_name(ctx, self.kind, self.item_id, "repost").await?;
        let push = RenderedPush::new(
            NotificationCategory::Reposts,
            "New Repost",
            format!("{reposter} reposted your {} {title}", self.kind.as_str()),
            json!({
                "id": self.meta.push_id(),
                "type": "Repost",
                "entityType": self.kind.data_name(),
                "entityId": self.item_id,
                "userIds": [self.reposter_user_id],
            }),
        );
        deliver_to_recipients(ctx, flags, &self.meta.user_ids, &push).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct SaveData {
    #[serde(rename = "type")]
    kind: EntityKind,
    user_id: i64,
    save_item_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Save {
    pub meta: EventMeta,
    pub kind: EntityKind,
    pub saver_user_id: i64,
    pub item_id: i64,
}

impl Save {
    pub fn from_event(event: &NotificationEvent) -> Result<Self> {
        let data: SaveData = parse_data(event)?;
        Ok(Self {
            meta: EventMeta::from_event(event),
            kind: data.kind,
            saver_user_id: data.user_id,
            item_id: data.save_item_id,
        })
    }

    pub async fn process(&self, ctx: &DeliveryContext, flags: DeliveryFlags) -> Result<()> {
        let saver = user_name(ctx, self.saver_user_id, "save").await?;
        let title = entity_name(ctx, self.kind, self.item_id, "save").await?;
        let push = RenderedPush::new(
            NotificationCategory::Favorites,
            "New Favorite",
            format!("{saver} favorited your {} {title}", self.kind.as_str()),
            json!({
                "id": self.meta.push_id(),
                "type": "Favorite",
                "entityType": self.kind.data_name(),
                "entityId": self.item_id,
                "userIds": [self.saver_user_id],
            }),
        );
        deliver_to_recipients(ctx, flags, &self.meta.user_ids, &push).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// comment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct CommentData {
    #[serde(rename = "type", default = "default_track")]
    kind: EntityKind,
    comment_user_id: i64,
    entity_id: i64,
}

fn default_track() -> EntityKind {
    EntityKind::Track
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comment {
    pub meta: EventMeta,
    pub kind: EntityKind,
    pub commenter_user_id: i64,
    pub entity_id: i64,
}

impl Comment {
    pub fn from_event(event: &NotificationEvent) -> Result<Self> {
        let data: CommentData = parse_data(event)?;
        Ok(Self {
            meta: EventMeta::from_event(event),
            kind: data.kind,
            commenter_user_id: data.comment_user_id,
            entity_id: data.entity_id,
        })
    }

    pub async fn process(&self, ctx: &DeliveryContext, flags: DeliveryFlags) -> Result<()> {
        let commenter = user_name(ctx, self.commenter_user_id, "comment").await?;
        let title = entity_name(ctx, self.kind, self.entity_id, "comment").await?;
        let push = RenderedPush::new(
            NotificationCategory::Comments,
            "New Comment",
            format!("{commenter} commented on your {} {title}", self.kind.as_str()),
            json!({
                "id": self.meta.push_id(),
                "type": "Comment",
                "entityType": self.kind.data_name(),
                "entityId": self.entity_id,
                "userIds": [self.commenter_user_id],
            }),
        );
        deliver_to_recipients(ctx, flags, &self.meta.user_ids, &push).await?;
        Ok(())
    }
}

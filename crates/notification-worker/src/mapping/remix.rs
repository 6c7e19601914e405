use serde::Deserialize;
use serde_json::json;

use super::push::{RenderedPush, deliver_to_recipients};
use super::{DeliveryContext, DeliveryFlags, EventMeta, parse_data, require_name};
use crate::error::Result;
use crate::event::NotificationEvent;
use crate::settings::NotificationCategory;

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct RemixData {
    track_id: i64,
    parent_track_id: i64,
}

/// 自己的曲目被他人翻混
#[derive(Debug, Clone, PartialEq)]
pub struct Remix {
    pub meta: EventMeta,
    pub track_id: i64,
    pub parent_track_id: i64,
}

impl Remix {
    pub fn from_event(event: &NotificationEvent) -> Result<Self> {
        let data: RemixData = parse_data(event)?;
        Ok(Self {
            meta: EventMeta::from_event(event),
            track_id: data.track_id,
            parent_track_id: data.parent_track_id,
        })
    }

    pub async fn process(&self, ctx: &DeliveryContext, flags: DeliveryFlags) -> Result<()> {
        let titles = ctx
            .entities
            .track_titles(&[self.track_id, self.parent_track_id])
            .await?;
        let remix_title = require_name(&titles, self.track_id, "remix", "track")?;
        let parent_title = require_name(&titles, self.parent_track_id, "remix", "track")?;

        let push = RenderedPush::new(
            NotificationCategory::Remixes,
            "New Remix",
            format!("New remix of your track {parent_title}: {remix_title}"),
            json!({
                "id": self.meta.push_id(),
                "type": "RemixCreate",
                "childTrackId": self.track_id,
                "parentTrackId": self.parent_track_id,
            }),
        );
        deliver_to_recipients(ctx, flags, &self.meta.user_ids, &push).await?;
        Ok(())
    }
}

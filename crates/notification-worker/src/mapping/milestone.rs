//! 里程碑：曲目收藏、转发、播放数，或粉丝数达到阈值

use serde::Deserialize;
use serde_json::json;

use super::push::{RenderedPush, deliver_to_recipients};
use super::{DeliveryContext, DeliveryFlags, EventMeta, parse_data, require_name};
use crate::error::{NotificationError, Result};
use crate::event::NotificationEvent;
use crate::settings::NotificationCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MilestoneKind {
    TrackSaveCount,
    TrackRepostCount,
    TrackPlayCount,
    FollowerCount,
}

impl MilestoneKind {
    fn unit(&self) -> &'static str {
        match self {
            Self::TrackSaveCount => "favorites",
            Self::TrackRepostCount => "reposts",
            Self::TrackPlayCount => "plays",
            Self::FollowerCount => "followers",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct MilestoneData {
    #[serde(rename = "type")]
    kind: MilestoneKind,
    #[serde(default)]
    track_id: Option<i64>,
    threshold: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Milestone {
    pub meta: EventMeta,
    pub kind: MilestoneKind,
    pub track_id: Option<i64>,
    pub threshold: i64,
}

impl Milestone {
    pub fn from_event(event: &NotificationEvent) -> Result<Self> {
        let data: MilestoneData = parse_data(event)?;
        if data.kind != MilestoneKind::FollowerCount && data.track_id.is_none() {
            return Err(NotificationError::mapping("milestone", "曲目里程碑缺少 track_id"));
        }
        Ok(Self {
            meta: EventMeta::from_event(event),
            kind: data.kind,
            track_id: data.track_id,
            threshold: data.threshold,
        })
    }

    async fn body(&self, ctx: &DeliveryContext) -> Result<String> {
        let unit = self.kind.unit();
        match (self.kind, self.track_id) {
            (MilestoneKind::FollowerCount, _) | (_, None) => {
                Ok(format!("You have reached over {} {unit}", self.threshold))
            }
            (_, Some(track_id)) => {
                let titles = ctx.entities.track_titles(&[track_id]).await?;
                let title = require_name(&titles, track_id, "milestone", "track")?;
                Ok(format!(
                    "Your track {title} has reached over {} {unit}",
                    self.threshold
                ))
            }
        }
    }

    pub async fn process(&self, ctx: &DeliveryContext, flags: DeliveryFlags) -> Result<()> {
        let body = self.body(ctx).await?;
        let push = RenderedPush::new(
            NotificationCategory::Milestones,
            "Congratulations! 🎉",
            body,
            json!({
                "id": self.meta.push_id(),
                "type": "Milestone",
                "trackId": self.track_id,
                "threshold": self.threshold,
            }),
        );
        deliver_to_recipients(ctx, flags, &self.meta.user_ids, &push).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn event(data: serde_json::Value) -> NotificationEvent {
        NotificationEvent {
            id: 1,
            specifier: "1".into(),
            group_id: "milestone:TRACK_SAVE_COUNT:id:2:threshold:10".into(),
            notification_type: "milestone".into(),
            timestamp: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            data,
            user_ids: vec![1],
            blocknumber: None,
        }
    }

    #[test]
    fn test_track_milestone_requires_track() {
        assert!(Milestone::from_event(&event(json!({"type": "TRACK_SAVE_COUNT", "threshold": 10}))).is_err());
        let m = Milestone::from_event(&event(
            json!({"type": "TRACK_SAVE_COUNT", "track_id": 2, "threshold": 10}),
        ))
        .unwrap();
        assert_eq!(m.kind, MilestoneKind::TrackSaveCount);
        assert_eq!(m.track_id, Some(2));
    }

    #[test]
    fn test_follower_milestone_without_track() {
        let m = Milestone::from_event(&event(
            json!({"type": "FOLLOWER_COUNT", "user_id": 1, "threshold": 100}),
        ))
        .unwrap();
        assert_eq!(m.kind.unit(), "followers");
    }
}

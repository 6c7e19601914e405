use serde::Deserialize;
use serde_json::json;

use super::push::{RenderedPush, deliver_to_recipients};
use super::{
    DeliveryContext, DeliveryFlags, EventMeta, de_amount, format_units, parse_data, require_name,
};
use crate::error::Result;
use crate::event::NotificationEvent;
use crate::settings::NotificationCategory;

/// $AUDIO 精度
const AUDIO_DECIMALS: u32 = 18;

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct TipReceiveData {
    #[serde(deserialize_with = "de_amount")]
    amount: u128,
    sender_user_id: i64,
    receiver_user_id: i64,
}

/// 收到打赏
#[derive(Debug, Clone, PartialEq)]
pub struct TipReceive {
    pub meta: EventMeta,
    /// 最小单位 (wei)
    pub amount: u128,
    pub sender_user_id: i64,
    pub receiver_user_id: i64,
}

impl TipReceive {
    pub fn from_event(event: &NotificationEvent) -> Result<Self> {
        let data: TipReceiveData = parse_data(event)?;
        Ok(Self {
            meta: EventMeta::from_event(event),
            amount: data.amount,
            sender_user_id: data.sender_user_id,
            receiver_user_id: data.receiver_user_id,
        })
    }

    pub fn display_amount(&self) -> String {
        format_units(self.amount, AUDIO_DECIMALS, 2)
    }

    pub async fn process(&self, ctx: &DeliveryContext, flags: DeliveryFlags) -> Result<()> {
        let names = ctx.entities.user_names(&[self.sender_user_id]).await?;
        let sender = require_name(&names, self.sender_user_id, "tip_receive", "user")?;
        let push = RenderedPush::new(
            NotificationCategory::Tips,
            "You Received a Tip!",
            format!("{sender} sent you a tip of {} $AUDIO", self.display_amount()),
            json!({
                "id": self.meta.push_id(),
                "type": "TipReceive",
                "userIds": [self.sender_user_id],
            }),
        );
        deliver_to_recipients(ctx, flags, &self.meta.user_ids, &push).await?;
        Ok(())
    }
}

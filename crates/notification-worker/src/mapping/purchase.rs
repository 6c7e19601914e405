use serde::Deserialize;
use serde_json::json;

use super::push::{RenderedPush, deliver_to_recipients};
use super::{DeliveryContext, DeliveryFlags, EventMeta, de_amount, parse_data, require_name};
use crate::error::Result;
use crate::event::NotificationEvent;
use crate::settings::NotificationCategory;

/// USDC 精度
const USDC_DECIMALS: u32 = 6;

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct UsdcPurchaseSellerData {
    buyer_user_id: i64,
    seller_user_id: i64,
    #[serde(deserialize_with = "de_amount")]
    amount: u128,
    #[serde(default = "default_content_type")]
    content_type: String,
    content_id: i64,
}

fn default_content_type() -> String {
    "track".to_string()
}

/// 卖家收到一笔 USDC 购买
#[derive(Debug, Clone, PartialEq)]
pub struct UsdcPurchaseSeller {
    pub meta: EventMeta,
    pub buyer_user_id: i64,
    pub seller_user_id: i64,
    pub amount: u128,
    pub content_type: String,
    pub content_id: i64,
}

impl UsdcPurchaseSeller {
    pub fn from_event(event: &NotificationEvent) -> Result<Self> {
        let data: UsdcPurchaseSellerData = parse_data(event)?;
        Ok(Self {
            meta: EventMeta::from_event(event),
            buyer_user_id: data.buyer_user_id,
            seller_user_id: data.seller_user_id,
            amount: data.amount,
            content_type: data.content_type,
            content_id: data.content_id,
        })
    }

    /// 美元金额，固定两位小数
    pub fn display_price(&self) -> String {
        let scale = 10u128.pow(USDC_DECIMALS);
        let cents = (self.amount % scale) / 10u128.pow(USDC_DECIMALS - 2);
        format!("{}.{cents:02}", self.amount / scale)
    }

    pub async fn process(&self, ctx: &DeliveryContext, flags: DeliveryFlags) -> Result<()> {
        let names = ctx.entities.user_names(&[self.buyer_user_id]).await?;
        let buyer = require_name(&names, self.buyer_user_id, "usdc_purchase_seller", "user")?;
        let titles = if self.content_type == "track" {
            ctx.entities.track_titles(&[self.content_id]).await?
        } else {
            ctx.entities.collection_names(&[self.content_id]).await?
        };
        let title = require_name(
            &titles,
            self.content_id,
            "usdc_purchase_seller",
            &self.content_type,
        )?;

        let push = RenderedPush::new(
            NotificationCategory::Purchases,
            format!(
                "{} Sold",
                if self.content_type == "track" { "Track" } else { "Album" }
            ),
            format!(
                "Congrats, {buyer} just bought your {} {title} for ${}!",
                self.content_type,
                self.display_price()
            ),
            json!({
                "id": self.meta.push_id(),
                "type": "USDCPurchaseSeller",
                "entityId": self.content_id,
            }),
        );
        deliver_to_recipients(ctx, flags, &self.meta.user_ids, &push).await?;
        Ok(())
    }
}

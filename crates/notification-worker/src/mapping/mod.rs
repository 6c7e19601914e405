//! 通知映射
//!
//! 通知行按 `type` 判别映射为 `AppNotification` 的一个变体，
//! 每个变体解析自己的载荷、查询关联数据、渲染文案，然后交给统一的推送投递流程。
//!
//! ## 注册表
//!
//! `MapperRegistry` 保存"类型 → 构造函数"，未注册的类型由处理器视为关闭。
//!
//! ```ignore
//! let registry = MapperRegistry::with_defaults();
//! match registry.map(&event) {
//!     Some(Ok(notification)) => notification.process(&ctx, flags).await?,
//!     Some(Err(e)) => { /* 载荷无效 */ }
//!     None => { /* 未知类型 */ }
//! }
//! ```

mod message;
mod milestone;
mod purchase;
pub mod push;
mod remix;
mod social;
mod tip;

pub use message::{MessageNotification, ReactionNotification, chat_id};
pub use milestone::{Milestone, MilestoneKind};
pub use purchase::UsdcPurchaseSeller;
pub use remix::Remix;
pub use social::{Comment, EntityKind, Follow, Repost, Save};
pub use tip::TipReceive;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use tracing::{debug, info};

use crate::badge::{BadgeCounter, UserLocks};
use crate::error::{NotificationError, Result};
use crate::event::NotificationEvent;
use crate::sender::{BrowserPushGateway, EmailGateway, PushGateway};
use crate::settings::{EntityLookup, UserSettingsStore};

/// 投递所需的全部协作者
#[derive(Clone)]
pub struct DeliveryContext {
    pub settings: Arc<dyn UserSettingsStore>,
    pub entities: Arc<dyn EntityLookup>,
    pub badges: Arc<dyn BadgeCounter>,
    pub locks: Arc<UserLocks>,
    pub push: Arc<dyn PushGateway>,
    pub browser_push: Arc<dyn BrowserPushGateway>,
    pub email: Arc<dyn EmailGateway>,
    /// 即时邮件的发件地址
    pub email_from: String,
}

/// 一批通知共用的渠道开关，按值传入，批内不再重新读取
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryFlags {
    pub is_live_email_enabled: bool,
    pub is_browser_push_enabled: bool,
}

/// 通知行中与渲染无关的公共字段
#[derive(Debug, Clone, PartialEq)]
pub struct EventMeta {
    pub id: i64,
    pub group_id: String,
    pub timestamp: DateTime<Utc>,
    pub user_ids: Vec<i64>,
}

impl EventMeta {
    fn from_event(event: &NotificationEvent) -> Self {
        Self {
            id: event.id,
            group_id: event.group_id.clone(),
            timestamp: event.timestamp,
            user_ids: event.user_ids.clone(),
        }
    }

    pub fn push_id(&self) -> String {
        crate::event::push_id(self.timestamp, &self.group_id, None)
    }
}

/// 解析通知载荷
fn parse_data<T: DeserializeOwned>(event: &NotificationEvent) -> Result<T> {
    serde_json::from_value(event.data.clone())
        .map_err(|e| NotificationError::mapping(&event.notification_type, e.to_string()))
}

/// 从查询结果中取名称，缺失视为映射失败
fn require_name(
    names: &HashMap<i64, String>,
    id: i64,
    notification_type: &str,
    what: &str,
) -> Result<String> {
    names
        .get(&id)
        .cloned()
        .ok_or_else(|| NotificationError::mapping(notification_type, format!("{what} {id} 不存在")))
}

/// 载荷中的链上金额，可能是数字或十进制字符串
fn de_amount<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u128, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawAmount {
        Number(u64),
        Text(String),
    }

    match RawAmount::deserialize(deserializer)? {
        RawAmount::Number(n) => Ok(u128::from(n)),
        RawAmount::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// 按精度格式化最小单位金额，小数部分截断到 `shown` 位并去掉末尾的 0
fn format_units(value: u128, decimals: u32, shown: u32) -> String {
    let scale = 10u128.pow(decimals);
    let whole = value / scale;
    let cut = 10u128.pow(decimals.saturating_sub(shown));
    let fraction = (value % scale) / cut;
    if fraction == 0 {
        return whole.to_string();
    }
    let digits = format!("{fraction:0width$}", width = shown as usize);
    format!("{whole}.{}", digits.trim_end_matches('0'))
}

/// 所有通知变体
#[derive(Debug, Clone, PartialEq)]
pub enum AppNotification {
    Follow(Follow),
    Repost(Repost),
    Save(Save),
    Milestone(Milestone),
    TipReceive(TipReceive),
    Comment(Comment),
    UsdcPurchaseSeller(UsdcPurchaseSeller),
    Remix(Remix),
    Message(MessageNotification),
    Reaction(ReactionNotification),
}

impl AppNotification {
    /// 类型判别值，同时也是远程开关的变量名
    pub fn notification_type(&self) -> &'static str {
        match self {
            Self::Follow(_) => "follow",
            Self::Repost(_) => "repost",
            Self::Save(_) => "save",
            Self::Milestone(_) => "milestone",
            Self::TipReceive(_) => "tip_receive",
            Self::Comment(_) => "comment",
            Self::UsdcPurchaseSeller(_) => "usdc_purchase_seller",
            Self::Remix(_) => "remix",
            Self::Message(_) => "message",
            Self::Reaction(_) => "reaction",
        }
    }

    pub async fn process(&self, ctx: &DeliveryContext, flags: DeliveryFlags) -> Result<()> {
        match self {
            Self::Follow(n) => n.process(ctx, flags).await,
            Self::Repost(n) => n.process(ctx, flags).await,
            Self::Save(n) => n.process(ctx, flags).await,
            Self::Milestone(n) => n.process(ctx, flags).await,
            Self::TipReceive(n) => n.process(ctx, flags).await,
            Self::Comment(n) => n.process(ctx, flags).await,
            Self::UsdcPurchaseSeller(n) => n.process(ctx, flags).await,
            Self::Remix(n) => n.process(ctx, flags).await,
            Self::Message(n) => n.process(ctx, flags).await,
            Self::Reaction(n) => n.process(ctx, flags).await,
        }
    }
}

type Constructor = fn(&NotificationEvent) -> Result<AppNotification>;

/// 类型判别值到构造函数的注册表
pub struct MapperRegistry {
    constructors: HashMap<&'static str, Constructor>,
}

impl MapperRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// 注册一个类型，已存在时替换
    pub fn register(&mut self, notification_type: &'static str, ctor: Constructor) -> &mut Self {
        debug!(notification_type, "注册通知映射");
        self.constructors.insert(notification_type, ctor);
        self
    }

    /// 未注册的类型返回 `None`
    pub fn map(&self, event: &NotificationEvent) -> Option<Result<AppNotification>> {
        self.constructors
            .get(event.notification_type.as_str())
            .map(|ctor| ctor(event))
    }

    pub fn contains(&self, notification_type: &str) -> bool {
        self.constructors.contains_key(notification_type)
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.constructors.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }

    /// 包含全部通知行类型的注册表
    ///
    /// 私信类通知由私信引擎直接构造，不经过注册表。
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register("follow", |e| Follow::from_event(e).map(AppNotification::Follow))
            .register("repost", |e| Repost::from_event(e).map(AppNotification::Repost))
            .register("save", |e| Save::from_event(e).map(AppNotification::Save))
            .register("milestone", |e| {
                Milestone::from_event(e).map(AppNotification::Milestone)
            })
            .register("tip_receive", |e| {
                TipReceive::from_event(e).map(AppNotification::TipReceive)
            })
            .register("comment", |e| Comment::from_event(e).map(AppNotification::Comment))
            .register("usdc_purchase_seller", |e| {
                UsdcPurchaseSeller::from_event(e).map(AppNotification::UsdcPurchaseSeller)
            })
            .register("remix", |e| Remix::from_event(e).map(AppNotification::Remix));

        info!(
            count = registry.len(),
            types = ?registry.registered_types(),
            "通知映射注册完成"
        );
        registry
    }
}

impl Default for MapperRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(notification_type: &str, data: serde_json::Value) -> NotificationEvent {
        NotificationEvent {
            id: 1,
            specifier: "2".into(),
            group_id: "g".into(),
            notification_type: notification_type.into(),
            timestamp: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            data,
            user_ids: vec![1],
            blocknumber: None,
        }
    }

    #[test]
    fn test_default_registry_types() {
        let registry = MapperRegistry::with_defaults();
        assert_eq!(
            registry.registered_types(),
            vec![
                "comment",
                "follow",
                "milestone",
                "remix",
                "repost",
                "save",
                "tip_receive",
                "usdc_purchase_seller"
            ]
        );
        assert!(!registry.contains("message"));
    }

    #[test]
    fn test_unknown_type_maps_to_none() {
        let registry = MapperRegistry::with_defaults();
        assert!(registry.map(&event("announcement", serde_json::json!({}))).is_none());
    }

    #[test]
    fn test_mapped_variant_reports_its_type() {
        let registry = MapperRegistry::with_defaults();
        let mapped = registry
            .map(&event(
                "follow",
                serde_json::json!({"follower_user_id": 2, "followee_user_id": 1}),
            ))
            .unwrap()
            .unwrap();
        assert_eq!(mapped.notification_type(), "follow");
    }

    #[test]
    fn test_format_units() {
        assert_eq!(format_units(5_000_000_000_000_000_000, 18, 2), "5");
        assert_eq!(format_units(1_250_000_000_000_000_000, 18, 2), "1.25");
        assert_eq!(format_units(1_999_999, 6, 2), "1.99");
        assert_eq!(format_units(500_000, 6, 2), "0.5");
    }

    #[test]
    fn test_invalid_payload_is_mapping_error() {
        let registry = MapperRegistry::with_defaults();
        let err = registry
            .map(&event("follow", serde_json::json!({"oops": true})))
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, NotificationError::Mapping { .. }));
    }
}

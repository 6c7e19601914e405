//! 通知事件与投递结果

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 通知表中的一行
///
/// `(type, group_id, specifier)` 是客户端去重使用的自然键。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationEvent {
    pub id: i64,
    pub specifier: String,
    pub group_id: String,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub notification_type: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
    pub user_ids: Vec<i64>,
    #[serde(default)]
    pub blocknumber: Option<i64>,
}

impl NotificationEvent {
    /// 推送载荷中的 `data.id`，重复投递时保持不变
    pub fn push_id(&self) -> String {
        push_id(self.timestamp, &self.group_id, None)
    }
}

/// 由时间戳和分组标识派生稳定的推送 id
///
/// 格式：`timestamp:<秒>:group_id:<group_id>[:specifier:<specifier>]`
pub fn push_id(timestamp: DateTime<Utc>, group_id: &str, specifier: Option<&str>) -> String {
    let base = format!("timestamp:{}:group_id:{}", timestamp.timestamp(), group_id);
    match specifier {
        Some(s) => format!("{base}:specifier:{s}"),
        None => base,
    }
}

/// 单条通知的投递结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Processed,
    Skipped(SkipReason),
    Errored(String),
    NeedsRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// 没有注册对应的类型
    UnknownType,
    /// 远程开关未开启
    Disabled,
}

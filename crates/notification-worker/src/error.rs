//! 通知服务错误类型
//!
//! `RequiresRetry` 是处理器唯一会写入重试队列的错误类别，
//! 其余错误一律记录后丢弃，不阻塞同批次的其他通知。

use fanout_shared::error::FanoutError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotificationError {
    /// 下游暂时不可用，下一轮重新投递
    #[error("通知需要重试: {0}")]
    RequiresRetry(String),

    #[error("通知映射失败: type={notification_type}, 原因={reason}")]
    Mapping {
        notification_type: String,
        reason: String,
    },

    #[error("网关调用失败: 渠道={channel}, 原因={reason}")]
    Gateway { channel: String, reason: String },

    #[error("变更监听失败: {0}")]
    Listener(String),

    #[error(transparent)]
    Shared(#[from] FanoutError),
}

pub type Result<T> = std::result::Result<T, NotificationError>;

impl NotificationError {
    pub fn is_requires_retry(&self) -> bool {
        matches!(self, Self::RequiresRetry(_))
    }

    pub fn mapping(notification_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Mapping {
            notification_type: notification_type.into(),
            reason: reason.into(),
        }
    }

    pub fn gateway(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Gateway {
            channel: channel.into(),
            reason: reason.into(),
        }
    }
}

impl From<sqlx::Error> for NotificationError {
    fn from(e: sqlx::Error) -> Self {
        Self::Shared(FanoutError::from(e))
    }
}

impl From<serde_json::Error> for NotificationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Shared(FanoutError::from(e))
    }
}

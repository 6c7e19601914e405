//! 数据库变更监听
//!
//! 触发器在插入时通过 `pg_notify` 只发送新行的 id，监听器自行查询整行。
//! 两个频道共用同一套订阅循环：
//! - `notification`：新通知行进入待处理缓冲区
//! - `notification_seen`：用户已读，清零角标
//!
//! 连接断开不自动重连，订阅任务以错误结束，由主循环让进程退出。

mod buffer;
mod seen;

pub use buffer::PendingBuffer;
pub use seen::SeenListener;

use std::sync::Arc;

use async_trait::async_trait;
use fanout_shared::observability::metrics;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{NotificationError, Result};
use crate::event::NotificationEvent;

/// 收到频道消息后的处理逻辑
#[async_trait]
pub trait SignalHandler: Send + Sync {
    async fn handle_signal(&self, payload: &str);
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationRowFetcher: Send + Sync {
    async fn fetch_notification(&self, id: i64) -> Result<Option<NotificationEvent>>;
}

pub struct PgNotificationFetcher {
    pool: PgPool,
}

impl PgNotificationFetcher {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationRowFetcher for PgNotificationFetcher {
    async fn fetch_notification(&self, id: i64) -> Result<Option<NotificationEvent>> {
        let row = sqlx::query_as::<_, NotificationEvent>(
            r#"
            SELECT id::bigint AS id,
                   COALESCE(specifier, '') AS specifier,
                   COALESCE(group_id, '') AS group_id,
                   type,
                   "timestamp"::timestamptz AS "timestamp",
                   COALESCE(data, '{}'::jsonb) AS data,
                   COALESCE(user_ids, '{}')::bigint[] AS user_ids,
                   blocknumber::bigint AS blocknumber
            FROM notification
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

/// 从触发器载荷中解析行 id
///
/// 支持纯数字，或包含 `notification_id` / `id` 字段的 JSON 对象。
pub fn parse_row_id(payload: &str) -> Option<i64> {
    let trimmed = payload.trim();
    if let Ok(id) = trimmed.parse::<i64>() {
        return Some(id);
    }
    let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
    ["notification_id", "id"]
        .iter()
        .find_map(|k| value.get(*k))
        .and_then(|v| v.as_i64().or_else(|| v.as_str()?.parse().ok()))
}

/// 新通知监听器
pub struct ChangeListener {
    fetcher: Arc<dyn NotificationRowFetcher>,
    buffer: PendingBuffer,
}

impl ChangeListener {
    pub fn new(fetcher: Arc<dyn NotificationRowFetcher>) -> Self {
        Self {
            fetcher,
            buffer: PendingBuffer::new(),
        }
    }

    pub fn take_pending(&self) -> Option<Vec<NotificationEvent>> {
        self.buffer.take_pending()
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

#[async_trait]
impl SignalHandler for ChangeListener {
    async fn handle_signal(&self, payload: &str) {
        let Some(id) = parse_row_id(payload) else {
            warn!(payload, "无法解析通知 id，忽略");
            return;
        };

        match self.fetcher.fetch_notification(id).await {
            Ok(Some(event)) => {
                debug!(notification_id = id, notification_type = %event.notification_type, "通知已缓冲");
                self.buffer.append(event);
            }
            Ok(None) => {
                warn!(notification_id = id, "通知行不存在，丢弃");
                metrics::record_listener_fetch_failure("notification");
            }
            Err(e) => {
                error!(notification_id = id, error = %e, "读取通知行失败，丢弃");
                metrics::record_listener_fetch_failure("notification");
            }
        }
    }
}

/// 订阅任务句柄
pub struct ListenerHandle {
    channel: String,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl ListenerHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// 订阅任务已退出（连接断开或已关闭）
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// 释放订阅
    pub async fn close(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(NotificationError::Listener(e.to_string())),
        }
    }
}

/// 在独立任务上订阅频道
///
/// 订阅建立失败直接返回错误；建立后每条消息依次交给 `handler`。
pub async fn start(
    pool: &PgPool,
    channel: &str,
    handler: Arc<dyn SignalHandler>,
) -> Result<ListenerHandle> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(channel).await?;
    info!(channel, "已订阅数据库变更频道");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let channel_name = channel.to_string();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                received = listener.try_recv() => match received {
                    Ok(Some(notification)) => {
                        handler.handle_signal(notification.payload()).await;
                    }
                    Ok(None) => {
                        error!(channel = %channel_name, "变更订阅连接断开");
                        return Err(NotificationError::Listener(format!(
                            "频道 {channel_name} 连接断开"
                        )));
                    }
                    Err(e) => {
                        error!(channel = %channel_name, error = %e, "变更订阅出错");
                        return Err(NotificationError::Listener(e.to_string()));
                    }
                },
                _ = shutdown_rx.changed() => {
                    info!(channel = %channel_name, "变更订阅已关闭");
                    return Ok(());
                }
            }
        }
    });

    Ok(ListenerHandle {
        channel: channel.to_string(),
        shutdown_tx,
        task,
    })
}

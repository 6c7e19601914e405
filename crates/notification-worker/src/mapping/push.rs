//! 统一推送投递
//!
//! 对每个接收者：
//! 1. 设置缺失或账户已停用时跳过
//! 2. 用户退订了该分类时跳过
//! 3. 按用户加锁，读取当前角标，以 `当前值 + 1` 发送到所有设备
//! 4. 推送服务报告端点失效的设备被停用
//! 5. 至少一台设备发送成功时角标原子加一
//! 6. 浏览器推送开启且用户有订阅时发送浏览器推送
//! 7. 即时邮件开启且用户频率为 live 时发送单条通知邮件
//!
//! 所有设备都因网关故障失败时返回 `RequiresRetry`。

use fanout_shared::observability::metrics;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{DeliveryContext, DeliveryFlags};
use crate::error::{NotificationError, Result};
use crate::sender::{EmailMessage, PushDevice, PushMessage};
use crate::settings::{EmailFrequency, NotificationCategory, UserSettings};
use crate::templates;

/// 渲染完成的推送内容
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPush {
    pub category: NotificationCategory,
    pub title: String,
    pub body: String,
    pub data: Value,
    /// 私信类通知不发即时邮件
    pub allow_live_email: bool,
}

impl RenderedPush {
    pub fn new(
        category: NotificationCategory,
        title: impl Into<String>,
        body: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            category,
            title: title.into(),
            body: body.into(),
            data,
            allow_live_email: true,
        }
    }

    pub fn without_live_email(mut self) -> Self {
        self.allow_live_email = false;
        self
    }

    fn message(&self) -> PushMessage {
        PushMessage {
            title: self.title.clone(),
            body: self.body.clone(),
            data: self.data.clone(),
        }
    }
}

/// 单个接收者的投递结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientOutcome {
    Delivered { devices: usize },
    NoDevices,
    Skipped,
}

/// 向多个接收者投递同一条内容
///
/// 某个接收者需要重试时，其余接收者照常投递，最后统一返回 `RequiresRetry`。
pub async fn deliver_to_recipients(
    ctx: &DeliveryContext,
    flags: DeliveryFlags,
    user_ids: &[i64],
    push: &RenderedPush,
) -> Result<Vec<RecipientOutcome>> {
    let settings = ctx.settings.get_settings(user_ids).await?;
    let mut outcomes = Vec::with_capacity(user_ids.len());
    let mut retry: Option<NotificationError> = None;

    for user_id in user_ids {
        match deliver_to_user(ctx, flags, *user_id, settings.get(user_id), push).await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) if e.is_requires_retry() => {
                warn!(user_id, error = %e, "接收者投递需要重试");
                retry.get_or_insert(e);
            }
            Err(e) => return Err(e),
        }
    }

    match retry {
        Some(e) => Err(e),
        None => Ok(outcomes),
    }
}

pub async fn deliver_to_user(
    ctx: &DeliveryContext,
    flags: DeliveryFlags,
    user_id: i64,
    settings: Option<&UserSettings>,
    push: &RenderedPush,
) -> Result<RecipientOutcome> {
    let Some(settings) = settings else {
        debug!(user_id, "接收者无设置记录，跳过");
        return Ok(RecipientOutcome::Skipped);
    };
    if settings.is_deactivated {
        debug!(user_id, "接收者已停用，跳过");
        return Ok(RecipientOutcome::Skipped);
    }
    if !settings.allows(push.category) {
        debug!(user_id, category = push.category.as_str(), "接收者退订了该分类，跳过");
        return Ok(RecipientOutcome::Skipped);
    }

    let delivered = {
        let _guard = ctx.locks.lock(user_id).await;
        send_to_devices(ctx, settings, push).await?
    };

    if flags.is_browser_push_enabled && !settings.browser_subscriptions.is_empty() {
        let message = push.message();
        for subscription in &settings.browser_subscriptions {
            let result = ctx.browser_push.send(subscription, &message).await;
            metrics::record_send("browser", result.is_ok());
            if let Err(e) = result {
                warn!(user_id, error = %e, "浏览器推送失败");
            }
        }
    }

    if flags.is_live_email_enabled
        && push.allow_live_email
        && settings.email_frequency == EmailFrequency::Live
    {
        if let Some(to) = &settings.email {
            let email = EmailMessage {
                to: to.clone(),
                from: ctx.email_from.clone(),
                subject: push.title.clone(),
                html: templates::render_live_email(&push.title, &push.body),
            };
            let result = ctx.email.send(&email).await;
            metrics::record_send("email", result.is_ok());
            if let Err(e) = result {
                warn!(user_id, error = %e, "即时邮件发送失败");
            }
        }
    }

    Ok(delivered)
}

/// 在用户锁内发送移动推送并维护角标
async fn send_to_devices(
    ctx: &DeliveryContext,
    settings: &UserSettings,
    push: &RenderedPush,
) -> Result<RecipientOutcome> {
    let user_id = settings.user_id;
    if settings.devices.is_empty() {
        return Ok(RecipientOutcome::NoDevices);
    }

    let current = ctx.badges.current(user_id).await?;
    let message = push.message();
    let mut succeeded = 0usize;
    let mut failed = 0usize;
    let mut last_error = None;

    for device in &settings.devices {
        let target = PushDevice {
            device_type: device.device_type,
            target_arn: device.target_arn.clone(),
            badge_count: current + 1,
        };
        match ctx.push.send(&target, &message).await {
            Ok(result) if result.endpoint_disabled => {
                metrics::record_send(device.device_type.as_str(), false);
                if let Err(e) = ctx
                    .settings
                    .deactivate_device(user_id, &device.target_arn)
                    .await
                {
                    warn!(user_id, error = %e, "停用失效设备失败");
                }
            }
            Ok(_) => {
                metrics::record_send(device.device_type.as_str(), true);
                succeeded += 1;
            }
            Err(e) => {
                metrics::record_send(device.device_type.as_str(), false);
                warn!(user_id, device = ?device.device_type, error = %e, "移动推送失败");
                failed += 1;
                last_error = Some(e);
            }
        }
    }

    if succeeded > 0 {
        ctx.badges.increment(user_id).await?;
        info!(user_id, devices = succeeded, title = %push.title, "推送已送达");
        return Ok(RecipientOutcome::Delivered { devices: succeeded });
    }

    if failed == settings.devices.len() {
        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "所有设备发送失败".to_string());
        return Err(NotificationError::RequiresRetry(reason));
    }

    // 剩余设备均已失效
    Ok(RecipientOutcome::NoDevices)
}

//! 投递网关
//!
//! 移动推送、浏览器推送和邮件三类网关各自一个 trait，生产实现通过 HTTP 调用外部服务。
//! 单次调用内的连接抖动由 `with_backoff` 吸收，跨轮次的重试由处理器决定。

use async_trait::async_trait;
use fanout_shared::config::GatewayConfig;
use fanout_shared::error::FanoutError;
use fanout_shared::retry::{Backoff, with_backoff};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::settings::{BrowserSubscription, DeviceType};

/// 推送目标设备
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushDevice {
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    #[serde(rename = "targetARN")]
    pub target_arn: String,
    #[serde(rename = "badgeCount")]
    pub badge_count: i64,
}

/// 推送内容
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}

/// 移动推送网关的响应
#[derive(Debug, Clone, PartialEq)]
pub struct PushResult {
    /// 设备端点已失效，调用方需要停用该设备
    pub endpoint_disabled: bool,
    pub message_id: String,
}

/// 邮件内容
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailMessage {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub html: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send(&self, device: &PushDevice, message: &PushMessage) -> Result<PushResult>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrowserPushGateway: Send + Sync {
    async fn send(&self, subscription: &BrowserSubscription, message: &PushMessage) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailGateway: Send + Sync {
    async fn send(&self, email: &EmailMessage) -> Result<()>;
}

// ---------------------------------------------------------------------------
// HTTP 实现
// ---------------------------------------------------------------------------

/// 三类网关共用的 HTTP 客户端
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    api_key: Option<String>,
    backoff: Backoff,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig) -> std::result::Result<Self, FanoutError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            backoff: Backoff::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// POST JSON，返回状态码与响应体
    async fn post_json<B: Serialize + Sync>(
        &self,
        service: &str,
        url: &str,
        body: &B,
    ) -> std::result::Result<(reqwest::StatusCode, String), FanoutError> {
        let http = &self.http;
        let api_key = self.api_key.as_deref();
        with_backoff(&self.backoff, service, move || async move {
            let mut req = http.post(url).json(body);
            if let Some(key) = api_key {
                req = req.bearer_auth(key);
            }
            let resp = req.send().await.map_err(|e| {
                if e.is_timeout() {
                    FanoutError::ExternalServiceTimeout {
                        service: service.to_string(),
                    }
                } else {
                    FanoutError::from(e)
                }
            })?;
            let status = resp.status();
            let text = resp.text().await?;
            Ok::<_, FanoutError>((status, text))
        })
        .await
    }
}

fn status_error(service: &str, status: reqwest::StatusCode, body: &str) -> FanoutError {
    FanoutError::external(service, format!("HTTP {status}: {body}"))
}

/// 移动推送网关
pub struct HttpPushGateway {
    client: GatewayClient,
    url: String,
}

impl HttpPushGateway {
    pub fn new(client: GatewayClient, config: &GatewayConfig) -> Self {
        Self {
            client,
            url: config.push_url.clone(),
        }
    }
}

#[derive(Serialize)]
struct PushRequest<'a> {
    message_id: String,
    device: &'a PushDevice,
    message: &'a PushMessage,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PushResponse {
    #[serde(default)]
    endpoint_disabled: bool,
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn send(&self, device: &PushDevice, message: &PushMessage) -> Result<PushResult> {
        let message_id = Uuid::now_v7().to_string();
        let request = PushRequest {
            message_id: message_id.clone(),
            device,
            message,
        };
        let (status, body) = self.client.post_json("push", &self.url, &request).await?;

        // 410 表示端点已被推送服务注销
        if status == reqwest::StatusCode::GONE {
            return Ok(PushResult {
                endpoint_disabled: true,
                message_id,
            });
        }
        if !status.is_success() {
            return Err(status_error("push", status, &body).into());
        }

        let parsed: PushResponse = serde_json::from_str(&body).unwrap_or_default();
        debug!(
            channel = ?device.device_type,
            message_id = %message_id,
            badge = device.badge_count,
            "移动推送已发送"
        );
        Ok(PushResult {
            endpoint_disabled: parsed.endpoint_disabled,
            message_id,
        })
    }
}

/// 浏览器推送网关
pub struct HttpBrowserPushGateway {
    client: GatewayClient,
    url: String,
}

impl HttpBrowserPushGateway {
    pub fn new(client: GatewayClient, config: &GatewayConfig) -> Self {
        Self {
            client,
            url: config.browser_push_url.clone(),
        }
    }
}

#[derive(Serialize)]
struct BrowserPushRequest<'a> {
    message_id: String,
    subscription: &'a BrowserSubscription,
    message: &'a PushMessage,
}

#[async_trait]
impl BrowserPushGateway for HttpBrowserPushGateway {
    async fn send(&self, subscription: &BrowserSubscription, message: &PushMessage) -> Result<()> {
        let request = BrowserPushRequest {
            message_id: Uuid::now_v7().to_string(),
            subscription,
            message,
        };
        let (status, body) = self
            .client
            .post_json("browser_push", &self.url, &request)
            .await?;
        if !status.is_success() {
            return Err(status_error("browser_push", status, &body).into());
        }
        Ok(())
    }
}

/// 邮件网关
pub struct HttpEmailGateway {
    client: GatewayClient,
    url: String,
}

impl HttpEmailGateway {
    pub fn new(client: GatewayClient, config: &GatewayConfig) -> Self {
        Self {
            client,
            url: config.email_url.clone(),
        }
    }
}

#[async_trait]
impl EmailGateway for HttpEmailGateway {
    async fn send(&self, email: &EmailMessage) -> Result<()> {
        let (status, body) = self.client.post_json("email", &self.url, email).await?;
        if !status.is_success() {
            return Err(status_error("email", status, &body).into());
        }
        info!(to = %email.to, subject = %email.subject, "邮件已发送");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_device_wire_names() {
        let device = PushDevice {
            device_type: DeviceType::Ios,
            target_arn: "arn:aws:sns:endpoint/1".into(),
            badge_count: 3,
        };
        let value = serde_json::to_value(&device).unwrap();
        assert_eq!(value["type"], "ios");
        assert_eq!(value["targetARN"], "arn:aws:sns:endpoint/1");
        assert_eq!(value["badgeCount"], 3);
    }

    #[test]
    fn test_push_response_decodes_camel_case() {
        let parsed: PushResponse = serde_json::from_str(r#"{"endpointDisabled":true}"#).unwrap();
        assert!(parsed.endpoint_disabled);
        let parsed: PushResponse = serde_json::from_str("{}").unwrap();
        assert!(!parsed.endpoint_disabled);
    }

    #[test]
    fn test_status_error_is_not_retryable() {
        let err = status_error("push", reqwest::StatusCode::BAD_REQUEST, "bad token");
        assert!(!err.is_retryable());
        assert_eq!(err.code(), "EXTERNAL_SERVICE_ERROR");
    }

    #[tokio::test]
    async fn test_unreachable_gateway_fails() {
        let config = GatewayConfig {
            push_url: "http://127.0.0.1:9/push".into(),
            timeout_ms: 200,
            ..GatewayConfig::default()
        };
        let client = GatewayClient::new(&config).unwrap().with_backoff(Backoff::none());
        let gateway = HttpPushGateway::new(client, &config);
        let device = PushDevice {
            device_type: DeviceType::Android,
            target_arn: "arn".into(),
            badge_count: 1,
        };
        let message = PushMessage {
            title: "t".into(),
            body: "b".into(),
            data: serde_json::json!({}),
        };
        assert!(gateway.send(&device, &message).await.is_err());
    }
}

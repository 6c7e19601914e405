//! 远程功能开关
//!
//! ```text
//! RemoteConfigClient trait
//!  ├── PolledRemoteConfig：定时拉取 JSON 数据文件，ArcSwap 保存快照
//!  └── StaticRemoteConfig：固定数据文件，本地开发和测试使用
//! ```
//!
//! 上层通过 `FeatureFlags` 读取开关，客户端返回 `None` 时落到默认值表。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use fanout_shared::config::RemoteConfigSettings;
use fanout_shared::error::FanoutError;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// 功能开关与变量名
pub mod features {
    /// 推送映射总开关，变量名即通知类型
    pub const NOTIFICATION_MAPPING: &str = "discovery_notification_mapping";
    pub const SCHEDULED_EMAILS: &str = "notification_scheduled_emails";
    pub const BROWSER_PUSH: &str = "browser_push_notifications";
    pub const LIVE_EMAIL: &str = "live_email_notifications";

    pub const ENABLED: &str = "enabled";
    pub const PAGE_COUNT: &str = "page_count";
}

/// 远程配置客户端
#[cfg_attr(test, mockall::automock)]
pub trait RemoteConfigClient: Send + Sync {
    /// 功能未定义或变量不存在时返回 `None`
    fn feature_variable_enabled(&self, feature: &str, variable: &str) -> Option<bool>;

    fn feature_variable_value(&self, feature: &str, variable: &str) -> Option<Value>;
}

/// 远程配置数据文件
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Datafile {
    #[serde(default)]
    pub features: HashMap<String, FeatureEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeatureEntry {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

impl Datafile {
    fn variable_enabled(&self, feature: &str, variable: &str) -> Option<bool> {
        let entry = self.features.get(feature)?;
        if !entry.enabled {
            return Some(false);
        }
        entry.variables.get(variable)?.as_bool()
    }

    fn variable_value(&self, feature: &str, variable: &str) -> Option<Value> {
        let entry = self.features.get(feature)?;
        entry.variables.get(variable).cloned()
    }
}

// ============================================================================
// StaticRemoteConfig
// ============================================================================

/// 固定内容的远程配置
#[derive(Debug, Clone, Default)]
pub struct StaticRemoteConfig {
    datafile: Datafile,
}

impl StaticRemoteConfig {
    pub fn new(datafile: Datafile) -> Self {
        Self { datafile }
    }

    /// 打开功能并设置变量
    pub fn with_variable(mut self, feature: &str, variable: &str, value: Value) -> Self {
        let entry = self.datafile.features.entry(feature.to_string()).or_default();
        entry.enabled = true;
        entry.variables.insert(variable.to_string(), value);
        self
    }

    pub fn enable(self, feature: &str, variable: &str) -> Self {
        self.with_variable(feature, variable, Value::Bool(true))
    }
}

impl RemoteConfigClient for StaticRemoteConfig {
    fn feature_variable_enabled(&self, feature: &str, variable: &str) -> Option<bool> {
        self.datafile.variable_enabled(feature, variable)
    }

    fn feature_variable_value(&self, feature: &str, variable: &str) -> Option<Value> {
        self.datafile.variable_value(feature, variable)
    }
}

// ============================================================================
// PolledRemoteConfig
// ============================================================================

/// 定时拉取的远程配置
///
/// 读取端只做一次原子 load；拉取失败时保留上一份快照。
pub struct PolledRemoteConfig {
    current: Arc<ArcSwap<Datafile>>,
    shutdown_tx: watch::Sender<bool>,
}

impl PolledRemoteConfig {
    /// 首次拉取并启动后台轮询
    ///
    /// 未配置数据文件地址时只使用默认值表，不启动轮询。
    pub async fn init(settings: &RemoteConfigSettings) -> Result<Arc<Self>, FanoutError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let current = Arc::new(ArcSwap::from_pointee(Datafile::default()));
        let this = Arc::new(Self {
            current: current.clone(),
            shutdown_tx,
        });

        let Some(url) = settings.datafile_url.clone() else {
            info!("未配置远程开关地址，使用默认值表");
            return Ok(this);
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        match fetch_datafile(&http, &url).await {
            Ok(datafile) => {
                info!(features = datafile.features.len(), "远程开关已加载");
                current.store(Arc::new(datafile));
            }
            Err(e) => warn!(error = %e, url = %url, "首次拉取远程开关失败，使用默认值表"),
        }

        let interval = Duration::from_secs(settings.poll_interval_secs.max(1));
        tokio::spawn(poll_loop(http, url, interval, current, shutdown_rx));

        Ok(this)
    }

    /// 停止后台轮询
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl RemoteConfigClient for PolledRemoteConfig {
    fn feature_variable_enabled(&self, feature: &str, variable: &str) -> Option<bool> {
        self.current.load().variable_enabled(feature, variable)
    }

    fn feature_variable_value(&self, feature: &str, variable: &str) -> Option<Value> {
        self.current.load().variable_value(feature, variable)
    }
}

async fn fetch_datafile(http: &reqwest::Client, url: &str) -> Result<Datafile, FanoutError> {
    let resp = http.get(url).send().await?.error_for_status()?;
    Ok(resp.json::<Datafile>().await?)
}

async fn poll_loop(
    http: reqwest::Client,
    url: String,
    interval: Duration,
    current: Arc<ArcSwap<Datafile>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match fetch_datafile(&http, &url).await {
                    Ok(datafile) => {
                        debug!(features = datafile.features.len(), "远程开关已刷新");
                        current.store(Arc::new(datafile));
                    }
                    Err(e) => warn!(error = %e, "刷新远程开关失败，保留旧快照"),
                }
            }
            _ = shutdown_rx.changed() => {
                info!("远程开关轮询已停止");
                break;
            }
        }
    }
}

// ============================================================================
// FeatureFlags
// ============================================================================

/// 带默认值表的开关读取
#[derive(Clone)]
pub struct FeatureFlags {
    client: Arc<dyn RemoteConfigClient>,
    defaults: HashMap<(String, String), bool>,
}

impl FeatureFlags {
    /// 默认值：定时邮件开启，浏览器推送与即时邮件关闭，单类型推送开关一律关闭
    pub fn new(client: Arc<dyn RemoteConfigClient>) -> Self {
        let mut defaults = HashMap::new();
        defaults.insert(
            (features::SCHEDULED_EMAILS.into(), features::ENABLED.into()),
            true,
        );
        defaults.insert((features::BROWSER_PUSH.into(), features::ENABLED.into()), false);
        defaults.insert((features::LIVE_EMAIL.into(), features::ENABLED.into()), false);
        Self { client, defaults }
    }

    /// 覆盖某个开关的默认值
    pub fn with_default(mut self, feature: &str, variable: &str, enabled: bool) -> Self {
        self.defaults
            .insert((feature.to_string(), variable.to_string()), enabled);
        self
    }

    pub fn is_enabled(&self, feature: &str, variable: &str) -> bool {
        self.client
            .feature_variable_enabled(feature, variable)
            .or_else(|| {
                self.defaults
                    .get(&(feature.to_string(), variable.to_string()))
                    .copied()
            })
            .unwrap_or(false)
    }

    /// 通知类型的推送开关，未配置即关闭
    pub fn is_type_enabled(&self, notification_type: &str) -> bool {
        self.is_enabled(features::NOTIFICATION_MAPPING, notification_type)
    }

    pub fn scheduled_emails_enabled(&self) -> bool {
        self.is_enabled(features::SCHEDULED_EMAILS, features::ENABLED)
    }

    pub fn browser_push_enabled(&self) -> bool {
        self.is_enabled(features::BROWSER_PUSH, features::ENABLED)
    }

    pub fn live_email_enabled(&self) -> bool {
        self.is_enabled(features::LIVE_EMAIL, features::ENABLED)
    }

    /// 摘要邮件每页用户数
    pub fn email_page_count(&self) -> i64 {
        self.client
            .feature_variable_value(features::SCHEDULED_EMAILS, features::PAGE_COUNT)
            .and_then(|v| v.as_i64())
            .filter(|n| *n > 0)
            .unwrap_or(1000)
    }
}

//! 用户设置与实体查询
//!
//! 通知处理只读取两类外部数据：接收者的设备与偏好（身份库），
//! 以及渲染文案需要的用户名、曲目名（业务库）。

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{info, instrument};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Ios,
    Android,
}

impl DeviceType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "ios" => Some(Self::Ios),
            "android" => Some(Self::Android),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ios => "ios",
            Self::Android => "android",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub device_type: DeviceType,
    pub target_arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrowserSubscription {
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
}

/// 邮件频率
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailFrequency {
    Live,
    Daily,
    Weekly,
    Off,
}

impl EmailFrequency {
    /// 未知取值按 `live` 处理，与账户默认值一致
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "daily" => Self::Daily,
            "weekly" => Self::Weekly,
            "off" => Self::Off,
            _ => Self::Live,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Off => "off",
        }
    }
}

/// 推送偏好分类，用户可按分类退订
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationCategory {
    Messages,
    Followers,
    Reposts,
    Favorites,
    Milestones,
    Remixes,
    Tips,
    Comments,
    Purchases,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Followers => "followers",
            Self::Reposts => "reposts",
            Self::Favorites => "favorites",
            Self::Milestones => "milestones",
            Self::Remixes => "remixes",
            Self::Tips => "tips",
            Self::Comments => "comments",
            Self::Purchases => "purchases",
        }
    }
}

/// 单个用户的投递设置
#[derive(Debug, Clone, PartialEq)]
pub struct UserSettings {
    pub user_id: i64,
    pub is_deactivated: bool,
    pub email: Option<String>,
    pub email_frequency: EmailFrequency,
    pub devices: Vec<Device>,
    pub browser_subscriptions: Vec<BrowserSubscription>,
    pub disabled_categories: HashSet<NotificationCategory>,
}

impl UserSettings {
    /// 新账户的默认设置：所有分类开启，即时邮件
    pub fn new(user_id: i64) -> Self {
        Self {
            user_id,
            is_deactivated: false,
            email: None,
            email_frequency: EmailFrequency::Live,
            devices: Vec::new(),
            browser_subscriptions: Vec::new(),
            disabled_categories: HashSet::new(),
        }
    }

    pub fn allows(&self, category: NotificationCategory) -> bool {
        !self.disabled_categories.contains(&category)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserSettingsStore: Send + Sync {
    /// 批量读取，缺失的用户不出现在结果中
    async fn get_settings(&self, user_ids: &[i64]) -> Result<HashMap<i64, UserSettings>>;

    /// 停用推送服务报告失效的设备
    async fn deactivate_device(&self, user_id: i64, target_arn: &str) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EntityLookup: Send + Sync {
    async fn user_names(&self, user_ids: &[i64]) -> Result<HashMap<i64, String>>;

    async fn track_titles(&self, track_ids: &[i64]) -> Result<HashMap<i64, String>>;

    /// 歌单与专辑名称
    async fn collection_names(&self, playlist_ids: &[i64]) -> Result<HashMap<i64, String>>;
}

// ---------------------------------------------------------------------------
// Postgres 实现
// ---------------------------------------------------------------------------

/// 设置存储：停用状态来自业务库，其余来自身份库
pub struct PgUserSettingsStore {
    discovery: PgPool,
    identity: PgPool,
}

impl PgUserSettingsStore {
    pub fn new(discovery: PgPool, identity: PgPool) -> Self {
        Self {
            discovery,
            identity,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    user_id: i64,
    email: Option<String>,
    email_frequency: Option<String>,
}

#[derive(sqlx::FromRow)]
struct MobileSettingsRow {
    user_id: i64,
    favorites: bool,
    milestones: bool,
    reposts: bool,
    followers: bool,
    remixes: bool,
    messages: bool,
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    user_id: i64,
    device_type: String,
    target_arn: String,
}

#[derive(sqlx::FromRow)]
struct BrowserRow {
    user_id: i64,
    endpoint: String,
    p256dh: String,
    auth: String,
}

#[async_trait]
impl UserSettingsStore for PgUserSettingsStore {
    #[instrument(skip(self, user_ids), fields(count = user_ids.len()))]
    async fn get_settings(&self, user_ids: &[i64]) -> Result<HashMap<i64, UserSettings>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let deactivated: Vec<(i64, bool)> = sqlx::query_as(
            r#"
            SELECT user_id::bigint, COALESCE(is_deactivated, false)
            FROM users
            WHERE is_current = true AND user_id = ANY($1::int[])
            "#,
        )
        .bind(user_ids)
        .fetch_all(&self.discovery)
        .await?;

        let mut settings: HashMap<i64, UserSettings> = deactivated
            .into_iter()
            .map(|(user_id, is_deactivated)| {
                let mut s = UserSettings::new(user_id);
                s.is_deactivated = is_deactivated;
                (user_id, s)
            })
            .collect();

        let accounts: Vec<AccountRow> = sqlx::query_as(
            r#"
            SELECT u."blockchainUserId"::bigint AS user_id,
                   CASE WHEN u."isEmailDeliverable" THEN u.email END AS email,
                   s."emailFrequency" AS email_frequency
            FROM "Users" u
            LEFT JOIN "UserNotificationSettings" s ON s."userId" = u."blockchainUserId"
            WHERE u."blockchainUserId" = ANY($1::int[])
            "#,
        )
        .bind(user_ids)
        .fetch_all(&self.identity)
        .await?;
        for row in accounts {
            if let Some(s) = settings.get_mut(&row.user_id) {
                s.email = row.email;
                if let Some(freq) = row.email_frequency.as_deref() {
                    s.email_frequency = EmailFrequency::parse(freq);
                }
            }
        }

        let mobile: Vec<MobileSettingsRow> = sqlx::query_as(
            r#"
            SELECT "userId"::bigint AS user_id,
                   COALESCE(favorites, true) AS favorites,
                   COALESCE("milestonesAndAchievements", true) AS milestones,
                   COALESCE(reposts, true) AS reposts,
                   COALESCE(followers, true) AS followers,
                   COALESCE(remixes, true) AS remixes,
                   COALESCE(messages, true) AS messages
            FROM "UserNotificationMobileSettings"
            WHERE "userId" = ANY($1::int[])
            "#,
        )
        .bind(user_ids)
        .fetch_all(&self.identity)
        .await?;
        for row in mobile {
            if let Some(s) = settings.get_mut(&row.user_id) {
                for (enabled, category) in [
                    (row.favorites, NotificationCategory::Favorites),
                    (row.milestones, NotificationCategory::Milestones),
                    (row.reposts, NotificationCategory::Reposts),
                    (row.followers, NotificationCategory::Followers),
                    (row.remixes, NotificationCategory::Remixes),
                    (row.messages, NotificationCategory::Messages),
                ] {
                    if !enabled {
                        s.disabled_categories.insert(category);
                    }
                }
            }
        }

        let devices: Vec<DeviceRow> = sqlx::query_as(
            r#"
            SELECT "userId"::bigint AS user_id,
                   "deviceType" AS device_type,
                   "awsARN" AS target_arn
            FROM "NotificationDeviceTokens"
            WHERE enabled = true AND "awsARN" IS NOT NULL AND "userId" = ANY($1::int[])
            "#,
        )
        .bind(user_ids)
        .fetch_all(&self.identity)
        .await?;
        for row in devices {
            let Some(device_type) = DeviceType::parse(&row.device_type) else {
                continue;
            };
            if let Some(s) = settings.get_mut(&row.user_id) {
                s.devices.push(Device {
                    device_type,
                    target_arn: row.target_arn,
                });
            }
        }

        let browsers: Vec<BrowserRow> = sqlx::query_as(
            r#"
            SELECT "userId"::bigint AS user_id,
                   endpoint,
                   "p256dhKey" AS p256dh,
                   "authKey" AS auth
            FROM "NotificationBrowserSubscriptions"
            WHERE enabled = true AND "userId" = ANY($1::int[])
            "#,
        )
        .bind(user_ids)
        .fetch_all(&self.identity)
        .await?;
        for row in browsers {
            if let Some(s) = settings.get_mut(&row.user_id) {
                s.browser_subscriptions.push(BrowserSubscription {
                    endpoint: row.endpoint,
                    p256dh: row.p256dh,
                    auth: row.auth,
                });
            }
        }

        Ok(settings)
    }

    async fn deactivate_device(&self, user_id: i64, target_arn: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE "NotificationDeviceTokens"
            SET enabled = false, "updatedAt" = NOW()
            WHERE "userId" = $1 AND "awsARN" = $2
            "#,
        )
        .bind(user_id)
        .bind(target_arn)
        .execute(&self.identity)
        .await?;

        info!(user_id, target_arn, "推送端点失效，设备已停用");
        Ok(())
    }
}

/// 实体查询：用户名、曲目名
pub struct PgEntityLookup {
    pool: PgPool,
}

impl PgEntityLookup {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntityLookup for PgEntityLookup {
    async fn user_names(&self, user_ids: &[i64]) -> Result<HashMap<i64, String>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(i64, Option<String>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT user_id::bigint, name, handle
            FROM users
            WHERE is_current = true AND user_id = ANY($1::int[])
            "#,
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, name, handle)| name.or(handle).map(|n| (id, n)))
            .collect())
    }

    async fn track_titles(&self, track_ids: &[i64]) -> Result<HashMap<i64, String>> {
        if track_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(i64, Option<String>)> = sqlx::query_as(
            r#"
            SELECT track_id::bigint, title
            FROM tracks
            WHERE is_current = true AND track_id = ANY($1::int[])
            "#,
        )
        .bind(track_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, title)| title.map(|t| (id, t)))
            .collect())
    }

    async fn collection_names(&self, playlist_ids: &[i64]) -> Result<HashMap<i64, String>> {
        if playlist_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(i64, Option<String>)> = sqlx::query_as(
            r#"
            SELECT playlist_id::bigint, playlist_name
            FROM playlists
            WHERE is_current = true AND playlist_id = ANY($1::int[])
            "#,
        )
        .bind(playlist_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, name)| name.map(|n| (id, n)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_frequency_parse() {
        assert_eq!(EmailFrequency::parse("daily"), EmailFrequency::Daily);
        assert_eq!(EmailFrequency::parse("WEEKLY"), EmailFrequency::Weekly);
        assert_eq!(EmailFrequency::parse("off"), EmailFrequency::Off);
        assert_eq!(EmailFrequency::parse("garbage"), EmailFrequency::Live);
    }

    #[test]
    fn test_device_type_parse() {
        assert_eq!(DeviceType::parse("ios"), Some(DeviceType::Ios));
        assert_eq!(DeviceType::parse("Android"), Some(DeviceType::Android));
        assert_eq!(DeviceType::parse("safari"), None);
    }

    #[test]
    fn test_category_opt_out() {
        let mut settings = UserSettings::new(1);
        assert!(settings.allows(NotificationCategory::Messages));
        settings
            .disabled_categories
            .insert(NotificationCategory::Messages);
        assert!(!settings.allows(NotificationCategory::Messages));
        assert!(settings.allows(NotificationCategory::Followers));
    }

    #[tokio::test]
    async fn test_empty_lookup_skips_query() {
        // connect_lazy 不会真正建立连接，空输入必须直接返回
        let pool = PgPool::connect_lazy("postgres://localhost/unused").unwrap();
        let lookup = PgEntityLookup::new(pool.clone());
        assert!(lookup.user_names(&[]).await.unwrap().is_empty());
        assert!(lookup.track_titles(&[]).await.unwrap().is_empty());
        assert!(lookup.collection_names(&[]).await.unwrap().is_empty());

        let store = PgUserSettingsStore::new(pool.clone(), pool);
        assert!(store.get_settings(&[]).await.unwrap().is_empty());
    }
}

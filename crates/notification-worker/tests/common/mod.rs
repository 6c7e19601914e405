//! 集成测试共用的内存实现
//!
//! 每个协作者 trait 一个内存版本，记录调用以便断言。

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use notification_worker::badge::{BadgeCounter, UserLocks};
use notification_worker::cursor::{BlastCursor, CursorStore};
use notification_worker::dm::store::{BlastCandidate, DmStore, UnreadMessage, UnreadReaction};
use notification_worker::email::digest::DigestMessage;
use notification_worker::email::store::{DigestRecipient, DigestStore};
use notification_worker::error::{NotificationError, Result};
use notification_worker::event::NotificationEvent;
use notification_worker::listener::NotificationRowFetcher;
use notification_worker::mapping::DeliveryContext;
use notification_worker::remote_config::{FeatureFlags, StaticRemoteConfig, features};
use notification_worker::retry_queue::{RetryBatch, RetryQueue};
use notification_worker::sender::{
    BrowserPushGateway, EmailGateway, EmailMessage, PushDevice, PushGateway, PushMessage,
    PushResult,
};
use notification_worker::settings::{
    BrowserSubscription, Device, DeviceType, EmailFrequency, EntityLookup, UserSettings,
    UserSettingsStore,
};

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn event(id: i64, notification_type: &str, group_id: &str, user_ids: Vec<i64>, data: Value) -> NotificationEvent {
    NotificationEvent {
        id,
        specifier: id.to_string(),
        group_id: group_id.to_string(),
        notification_type: notification_type.to_string(),
        timestamp: ts(id),
        data,
        user_ids,
        blocknumber: Some(100 + id),
    }
}

/// 一台 iOS 设备的用户
pub fn user_with_device(user_id: i64) -> UserSettings {
    let mut settings = UserSettings::new(user_id);
    settings.devices.push(Device {
        device_type: DeviceType::Ios,
        target_arn: format!("arn:device:{user_id}"),
    });
    settings
}

// ---------------------------------------------------------------------------
// 设置与名称
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemorySettings {
    pub users: Mutex<HashMap<i64, UserSettings>>,
    pub deactivated: Mutex<Vec<(i64, String)>>,
}

impl MemorySettings {
    pub fn with_users(users: impl IntoIterator<Item = UserSettings>) -> Self {
        let store = Self::default();
        store
            .users
            .lock()
            .extend(users.into_iter().map(|u| (u.user_id, u)));
        store
    }
}

#[async_trait]
impl UserSettingsStore for MemorySettings {
    async fn get_settings(&self, user_ids: &[i64]) -> Result<HashMap<i64, UserSettings>> {
        let users = self.users.lock();
        Ok(user_ids
            .iter()
            .filter_map(|id| users.get(id).map(|u| (*id, u.clone())))
            .collect())
    }

    async fn deactivate_device(&self, user_id: i64, target_arn: &str) -> Result<()> {
        self.deactivated.lock().push((user_id, target_arn.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryEntities {
    pub users: HashMap<i64, String>,
    pub tracks: HashMap<i64, String>,
    pub collections: HashMap<i64, String>,
}

impl MemoryEntities {
    /// `user_<id>` 形式的用户名
    pub fn with_users(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            users: ids.into_iter().map(|id| (id, format!("user_{id}"))).collect(),
            ..Default::default()
        }
    }

    pub fn track(mut self, id: i64, title: &str) -> Self {
        self.tracks.insert(id, title.to_string());
        self
    }
}

fn pick(source: &HashMap<i64, String>, ids: &[i64]) -> HashMap<i64, String> {
    ids.iter()
        .filter_map(|id| source.get(id).map(|v| (*id, v.clone())))
        .collect()
}

#[async_trait]
impl EntityLookup for MemoryEntities {
    async fn user_names(&self, user_ids: &[i64]) -> Result<HashMap<i64, String>> {
        Ok(pick(&self.users, user_ids))
    }

    async fn track_titles(&self, track_ids: &[i64]) -> Result<HashMap<i64, String>> {
        Ok(pick(&self.tracks, track_ids))
    }

    async fn collection_names(&self, playlist_ids: &[i64]) -> Result<HashMap<i64, String>> {
        Ok(pick(&self.collections, playlist_ids))
    }
}

// ---------------------------------------------------------------------------
// 角标
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryBadges {
    pub counts: Mutex<HashMap<i64, i64>>,
}

impl MemoryBadges {
    pub fn count(&self, user_id: i64) -> i64 {
        self.counts.lock().get(&user_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl BadgeCounter for MemoryBadges {
    async fn current(&self, user_id: i64) -> Result<i64> {
        Ok(self.count(user_id))
    }

    async fn increment(&self, user_id: i64) -> Result<i64> {
        let mut counts = self.counts.lock();
        let value = counts.entry(user_id).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn reset(&self, user_id: i64) -> Result<()> {
        self.counts.lock().insert(user_id, 0);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 网关
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingPush {
    pub sent: Mutex<Vec<(PushDevice, PushMessage)>>,
    pub failing: AtomicBool,
}

impl RecordingPush {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(PushDevice, PushMessage)> {
        self.sent.lock().clone()
    }

    pub fn messages(&self) -> Vec<PushMessage> {
        self.sent.lock().iter().map(|(_, m)| m.clone()).collect()
    }
}

#[async_trait]
impl PushGateway for RecordingPush {
    async fn send(&self, device: &PushDevice, message: &PushMessage) -> Result<PushResult> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotificationError::Gateway {
                channel: "push".into(),
                reason: "unavailable".into(),
            });
        }
        let mut sent = self.sent.lock();
        sent.push((device.clone(), message.clone()));
        Ok(PushResult {
            endpoint_disabled: false,
            message_id: format!("msg-{}", sent.len()),
        })
    }
}

#[derive(Default)]
pub struct RecordingBrowserPush {
    pub sent: Mutex<Vec<(BrowserSubscription, PushMessage)>>,
}

#[async_trait]
impl BrowserPushGateway for RecordingBrowserPush {
    async fn send(&self, subscription: &BrowserSubscription, message: &PushMessage) -> Result<()> {
        self.sent.lock().push((subscription.clone(), message.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingEmail {
    pub sent: Mutex<Vec<EmailMessage>>,
}

#[async_trait]
impl EmailGateway for RecordingEmail {
    async fn send(&self, email: &EmailMessage) -> Result<()> {
        self.sent.lock().push(email.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 重试队列、游标、通知行
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryRetryQueue {
    pub items: Mutex<Vec<NotificationEvent>>,
}

impl MemoryRetryQueue {
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }
}

#[async_trait]
impl RetryQueue for MemoryRetryQueue {
    async fn push(&self, event: &NotificationEvent) -> Result<()> {
        self.items.lock().push(event.clone());
        Ok(())
    }

    async fn snapshot(&self) -> Result<RetryBatch> {
        let items = self.items.lock().clone();
        Ok(RetryBatch {
            raw_len: items.len(),
            events: items,
        })
    }

    async fn remove_first(&self, count: usize) -> Result<()> {
        let mut items = self.items.lock();
        let count = count.min(items.len());
        items.drain(..count);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCursors {
    pub values: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl CursorStore for MemoryCursors {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRows {
    pub rows: Mutex<HashMap<i64, NotificationEvent>>,
}

impl MemoryRows {
    pub fn insert(&self, event: NotificationEvent) {
        self.rows.lock().insert(event.id, event);
    }
}

#[async_trait]
impl NotificationRowFetcher for MemoryRows {
    async fn fetch_notification(&self, id: i64) -> Result<Option<NotificationEvent>> {
        Ok(self.rows.lock().get(&id).cloned())
    }
}

// ---------------------------------------------------------------------------
// 私信表
// ---------------------------------------------------------------------------

/// 按查询语义过滤的私信表
#[derive(Default)]
pub struct MemoryDmStore {
    pub messages: Mutex<Vec<UnreadMessage>>,
    pub reactions: Mutex<Vec<UnreadReaction>>,
    pub blasts: Mutex<Vec<BlastCandidate>>,
    /// 没有任何候选接收者的群发
    pub empty_blasts: Mutex<Vec<(String, DateTime<Utc>)>>,
    /// 用户最后一次打开会话的时间
    pub last_active: Mutex<HashMap<i64, DateTime<Utc>>>,
}

impl MemoryDmStore {
    fn lower_bound(&self, user_id: i64, min: DateTime<Utc>) -> DateTime<Utc> {
        self.last_active
            .lock()
            .get(&user_id)
            .map_or(min, |active| (*active).max(min))
    }
}

#[async_trait]
impl DmStore for MemoryDmStore {
    async fn unread_messages(
        &self,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    ) -> Result<Vec<UnreadMessage>> {
        let messages = self.messages.lock().clone();
        Ok(messages
            .into_iter()
            .filter(|m| m.sender_user_id != m.receiver_user_id)
            .filter(|m| {
                m.created_at > self.lower_bound(m.receiver_user_id, min) && m.created_at <= max
            })
            .collect())
    }

    async fn unread_reactions(
        &self,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    ) -> Result<Vec<UnreadReaction>> {
        let reactions = self.reactions.lock().clone();
        Ok(reactions
            .into_iter()
            .filter(|r| r.sender_user_id != r.receiver_user_id)
            .filter(|r| {
                r.created_at > self.lower_bound(r.receiver_user_id, min) && r.created_at <= max
            })
            .collect())
    }

    async fn blast_candidates(
        &self,
        cursor: &BlastCursor,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<BlastCandidate>> {
        let after = (cursor.blast_id.clone().unwrap_or_default(), cursor.user_id);
        let mut candidates: Vec<BlastCandidate> = self
            .blasts
            .lock()
            .iter()
            .filter(|c| c.created_at <= created_before)
            .filter(|c| (c.blast_id.clone(), c.receiver_user_id) > after)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            (a.blast_id.as_str(), a.receiver_user_id).cmp(&(b.blast_id.as_str(), b.receiver_user_id))
        });
        candidates.truncate(limit.max(0) as usize);
        Ok(candidates)
    }

    async fn latest_blast_id(&self, created_before: DateTime<Utc>) -> Result<Option<String>> {
        let with_audience: Vec<(String, DateTime<Utc>)> = self
            .blasts
            .lock()
            .iter()
            .map(|c| (c.blast_id.clone(), c.created_at))
            .collect();
        let empty = self.empty_blasts.lock().clone();
        Ok(with_audience
            .into_iter()
            .chain(empty)
            .filter(|(_, created_at)| *created_at <= created_before)
            .map(|(id, _)| id)
            .max())
    }
}

// ---------------------------------------------------------------------------
// 摘要邮件
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryDigestStore {
    pub recipients: Vec<DigestRecipient>,
    pub notifications: HashMap<i64, Vec<NotificationEvent>>,
    pub messages: HashMap<i64, Vec<DigestMessage>>,
    pub sent: Mutex<Vec<(i64, EmailFrequency, DateTime<Utc>)>>,
}

impl MemoryDigestStore {
    pub fn sent(&self) -> Vec<(i64, EmailFrequency, DateTime<Utc>)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DigestStore for MemoryDigestStore {
    async fn recipients(
        &self,
        frequencies: &[EmailFrequency],
        window_start: DateTime<Utc>,
        after_user_id: i64,
        limit: i64,
    ) -> Result<Vec<DigestRecipient>> {
        let sent = self.sent.lock().clone();
        let mut page: Vec<DigestRecipient> = self
            .recipients
            .iter()
            .filter(|r| frequencies.contains(&r.frequency) && r.user_id > after_user_id)
            .filter(|r| {
                !sent
                    .iter()
                    .any(|(user_id, _, at)| *user_id == r.user_id && *at >= window_start)
            })
            .cloned()
            .collect();
        page.sort_by_key(|r| r.user_id);
        page.truncate(limit.max(0) as usize);
        Ok(page)
    }

    async fn unseen_notifications(
        &self,
        user_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<NotificationEvent>> {
        let mut events: Vec<NotificationEvent> = self
            .notifications
            .get(&user_id)
            .into_iter()
            .flatten()
            .filter(|e| e.timestamp > start && e.timestamp <= end)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(events)
    }

    async fn unread_messages(
        &self,
        user_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _inactive_since: DateTime<Utc>,
    ) -> Result<Vec<DigestMessage>> {
        Ok(self
            .messages
            .get(&user_id)
            .into_iter()
            .flatten()
            .filter(|m| m.created_at > start && m.created_at <= end)
            .cloned()
            .collect())
    }

    async fn record_sent(
        &self,
        user_id: i64,
        frequency: EmailFrequency,
        sent_at: DateTime<Utc>,
    ) -> Result<()> {
        self.sent.lock().push((user_id, frequency, sent_at));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 组装
// ---------------------------------------------------------------------------

/// 投递上下文及其内存协作者
pub struct Harness {
    pub settings: Arc<MemorySettings>,
    pub badges: Arc<MemoryBadges>,
    pub push: Arc<RecordingPush>,
    pub browser: Arc<RecordingBrowserPush>,
    pub email: Arc<RecordingEmail>,
    pub locks: Arc<UserLocks>,
    pub ctx: DeliveryContext,
}

impl Harness {
    pub fn new(users: impl IntoIterator<Item = UserSettings>, entities: MemoryEntities) -> Self {
        let settings = Arc::new(MemorySettings::with_users(users));
        let badges = Arc::new(MemoryBadges::default());
        let push = Arc::new(RecordingPush::default());
        let browser = Arc::new(RecordingBrowserPush::default());
        let email = Arc::new(RecordingEmail::default());
        let locks = Arc::new(UserLocks::new());
        let ctx = DeliveryContext {
            settings: settings.clone(),
            entities: Arc::new(entities),
            badges: badges.clone(),
            locks: locks.clone(),
            push: push.clone(),
            browser_push: browser.clone(),
            email: email.clone(),
            email_from: "notify@test".to_string(),
        };
        Self {
            settings,
            badges,
            push,
            browser,
            email,
            locks,
            ctx,
        }
    }
}

/// 打开指定通知类型推送的开关
pub fn flags_for(types: &[&str]) -> FeatureFlags {
    let config = types.iter().fold(StaticRemoteConfig::default(), |config, t| {
        config.enable(features::NOTIFICATION_MAPPING, t)
    });
    FeatureFlags::new(Arc::new(config))
}

//! 摘要邮件调度
//!
//! 每日与每周两档，各自记录上次执行时间（仅内存），超过周期才执行。
//! 同一用户在窗口内是否已收到摘要以发送记录表为准，进程重启不会重复发送。

pub mod digest;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use fanout_shared::observability::metrics;
use parking_lot::Mutex;
use tracing::{error, info, instrument, warn};

use self::digest::Digest;
use self::store::{DigestRecipient, DigestStore};
use crate::error::Result;
use crate::remote_config::FeatureFlags;
use crate::sender::{EmailGateway, EmailMessage};
use crate::settings::{EmailFrequency, EntityLookup};
use crate::templates::{self, DigestLine};

/// 单次执行的时间上限
pub const PASS_BUDGET: std::time::Duration = std::time::Duration::from_secs(4 * 60 * 60);

/// 一次执行的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestPassSummary {
    pub recipients: usize,
    pub sent: usize,
    pub empty: usize,
    pub failed: usize,
    /// 超出时间上限提前结束
    pub aborted: bool,
}

pub struct DigestScheduler {
    store: Arc<dyn DigestStore>,
    entities: Arc<dyn EntityLookup>,
    email: Arc<dyn EmailGateway>,
    flags: FeatureFlags,
    email_from: String,
    dm_delay: Duration,
    budget: std::time::Duration,
    last_run: Mutex<HashMap<EmailFrequency, DateTime<Utc>>>,
}

impl DigestScheduler {
    pub fn new(
        store: Arc<dyn DigestStore>,
        entities: Arc<dyn EntityLookup>,
        email: Arc<dyn EmailGateway>,
        flags: FeatureFlags,
        email_from: impl Into<String>,
        dm_delay: Duration,
    ) -> Self {
        Self {
            store,
            entities,
            email,
            flags,
            email_from: email_from.into(),
            dm_delay,
            budget: PASS_BUDGET,
            last_run: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_budget(mut self, budget: std::time::Duration) -> Self {
        self.budget = budget;
        self
    }

    fn period(frequency: EmailFrequency) -> Option<Duration> {
        match frequency {
            EmailFrequency::Daily => Some(Duration::days(1)),
            EmailFrequency::Weekly => Some(Duration::days(7)),
            EmailFrequency::Live | EmailFrequency::Off => None,
        }
    }

    pub fn is_due(&self, frequency: EmailFrequency, now: DateTime<Utc>) -> bool {
        let Some(period) = Self::period(frequency) else {
            return false;
        };
        match self.last_run.lock().get(&frequency) {
            Some(last) => *last <= now - period,
            None => true,
        }
    }

    /// 执行所有到期的摘要
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<Vec<(EmailFrequency, DigestPassSummary)>> {
        if !self.flags.scheduled_emails_enabled() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        for frequency in [EmailFrequency::Daily, EmailFrequency::Weekly] {
            if !self.is_due(frequency, now) {
                continue;
            }
            let summary = self.run_pass(frequency, now).await?;
            self.last_run.lock().insert(frequency, now);
            results.push((frequency, summary));
        }
        Ok(results)
    }

    /// 对一个频率执行一次完整的分页发送
    #[instrument(skip(self), fields(frequency = frequency.as_str()))]
    pub async fn run_pass(
        &self,
        frequency: EmailFrequency,
        now: DateTime<Utc>,
    ) -> Result<DigestPassSummary> {
        let Some(period) = Self::period(frequency) else {
            return Ok(DigestPassSummary::default());
        };
        let started = Instant::now();
        let window_start = now - period;
        let page_size = self.flags.email_page_count();
        let frequencies = match frequency {
            EmailFrequency::Daily => vec![EmailFrequency::Daily, EmailFrequency::Live],
            _ => vec![frequency],
        };

        let mut summary = DigestPassSummary::default();
        let mut after_user_id = -1;
        loop {
            if started.elapsed() > self.budget {
                warn!(sent = summary.sent, "摘要发送超出时间上限，提前结束");
                summary.aborted = true;
                break;
            }

            let page = self
                .store
                .recipients(&frequencies, window_start, after_user_id, page_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after_user_id = last.user_id;
            let page_len = page.len();

            for recipient in page {
                summary.recipients += 1;
                match self.send_one(&recipient, frequency, window_start, now).await {
                    Ok(true) => summary.sent += 1,
                    Ok(false) => summary.empty += 1,
                    Err(e) => {
                        summary.failed += 1;
                        metrics::record_digest_email(frequency.as_str(), "failure");
                        error!(user_id = recipient.user_id, error = %e, "摘要邮件发送失败");
                    }
                }
            }

            if (page_len as i64) < page_size {
                break;
            }
        }

        info!(
            recipients = summary.recipients,
            sent = summary.sent,
            empty = summary.empty,
            failed = summary.failed,
            aborted = summary.aborted,
            elapsed_secs = started.elapsed().as_secs(),
            "摘要邮件本次执行完成"
        );
        Ok(summary)
    }

    /// 返回是否实际发送
    async fn send_one(
        &self,
        recipient: &DigestRecipient,
        frequency: EmailFrequency,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        // 即时用户的应用通知已经逐条发过邮件，只补私信
        let events = if recipient.frequency == EmailFrequency::Live {
            Vec::new()
        } else {
            self.store
                .unseen_notifications(recipient.user_id, window_start, now)
                .await?
                .into_iter()
                .filter(|e| self.flags.is_type_enabled(&e.notification_type))
                .collect()
        };
        let messages = self
            .store
            .unread_messages(
                recipient.user_id,
                window_start - self.dm_delay,
                now - self.dm_delay,
                window_start,
            )
            .await?;

        let digest = Digest::build(events, &messages);
        if digest.is_empty() {
            return Ok(false);
        }

        let names = self.entities.user_names(&digest.actor_ids()).await?;
        let lines = render_lines(&digest, &names);
        let email = EmailMessage {
            to: recipient.email.clone(),
            from: self.email_from.clone(),
            subject: templates::digest_subject(frequency, digest.total, now),
            html: templates::render_digest(&lines, digest.total),
        };
        self.email.send(&email).await?;
        self.store
            .record_sent(recipient.user_id, frequency, now)
            .await?;
        metrics::record_digest_email(frequency.as_str(), "success");
        Ok(true)
    }
}

fn render_lines(digest: &Digest, names: &HashMap<i64, String>) -> Vec<DigestLine> {
    let name_of = |id: Option<i64>| {
        id.and_then(|id| names.get(&id).cloned())
            .unwrap_or_else(|| "Someone".to_string())
    };

    let messages = digest.messages.iter().map(|m| DigestLine {
        text: templates::describe_message(
            &name_of(Some(m.sender_user_id)),
            m.is_reaction,
            m.multiple,
        ),
        additional: 0,
    });
    let groups = digest.groups.iter().map(|g| DigestLine {
        text: templates::describe_notification(
            &g.event.notification_type,
            &name_of(digest::actor_id(&g.event)),
            &g.event.data,
        ),
        additional: g.additional,
    });
    messages.chain(groups).collect()
}

#[cfg(test)]
mod tests {
    use super::digest::DigestMessage;
    use super::store::MockDigestStore;
    use super::*;
    use crate::remote_config::{MockRemoteConfigClient, features};
    use crate::sender::MockEmailGateway;
    use crate::settings::MockEntityLookup;
    use chrono::TimeZone;
    use mockall::predicate::eq;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 8, 10, 0, 0).unwrap()
    }

    fn flags(scheduled: bool, page_count: i64) -> FeatureFlags {
        let mut client = MockRemoteConfigClient::new();
        client
            .expect_feature_variable_enabled()
            .returning(move |feature, _| {
                if feature == features::SCHEDULED_EMAILS {
                    Some(scheduled)
                } else {
                    Some(true)
                }
            });
        client
            .expect_feature_variable_value()
            .returning(move |_, _| Some(serde_json::json!(page_count)));
        FeatureFlags::new(Arc::new(client))
    }

    fn recipient(user_id: i64, frequency: EmailFrequency) -> DigestRecipient {
        DigestRecipient {
            user_id,
            email: format!("u{user_id}@example.com"),
            frequency,
        }
    }

    fn entities() -> MockEntityLookup {
        let mut entities = MockEntityLookup::new();
        entities
            .expect_user_names()
            .returning(|ids| Ok(ids.iter().map(|id| (*id, format!("user_{id}"))).collect()));
        entities
    }

    #[tokio::test]
    async fn test_disabled_scheduled_emails_do_nothing() {
        let mut store = MockDigestStore::new();
        store.expect_recipients().never();
        let scheduler = DigestScheduler::new(
            Arc::new(store),
            Arc::new(MockEntityLookup::new()),
            Arc::new(MockEmailGateway::new()),
            flags(false, 1000),
            "n@example.com",
            Duration::seconds(60),
        );
        assert!(scheduler.run_due(now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_daily_pass_pages_and_records() {
        let mut store = MockDigestStore::new();
        store
            .expect_recipients()
            .withf(|freqs, _, after, limit| {
                freqs == [EmailFrequency::Daily, EmailFrequency::Live] && *after == -1 && *limit == 2
            })
            .times(1)
            .returning(|_, _, _, _| {
                Ok(vec![
                    recipient(1, EmailFrequency::Daily),
                    recipient(2, EmailFrequency::Live),
                ])
            });
        store
            .expect_recipients()
            .withf(|_, _, after, _| *after == 2)
            .times(1)
            .returning(|_, _, _, _| Ok(vec![]));
        store
            .expect_unseen_notifications()
            .with(eq(1), mockall::predicate::always(), mockall::predicate::always())
            .times(1)
            .returning(|_, _, _| Ok(vec![]));
        store.expect_unread_messages().returning(|user_id, _, _, _| {
            Ok(if user_id == 1 {
                vec![DigestMessage {
                    sender_user_id: 5,
                    is_reaction: false,
                    created_at: now(),
                }]
            } else {
                vec![]
            })
        });
        store
            .expect_record_sent()
            .with(eq(1), eq(EmailFrequency::Daily), eq(now()))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut email = MockEmailGateway::new();
        email
            .expect_send()
            .withf(|e| {
                e.to == "u1@example.com"
                    && e.subject == "1 unread notification from January 7th 2024"
                    && e.html.contains("user_5 sent you a new message")
            })
            .times(1)
            .returning(|_| Ok(()));

        let scheduler = DigestScheduler::new(
            Arc::new(store),
            Arc::new(entities()),
            Arc::new(email),
            flags(true, 2),
            "n@example.com",
            Duration::seconds(60),
        );
        let summary = scheduler.run_pass(EmailFrequency::Daily, now()).await.unwrap();
        assert_eq!(summary.recipients, 2);
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.empty, 1);
    }

    #[tokio::test]
    async fn test_due_tracking() {
        let mut store = MockDigestStore::new();
        store.expect_recipients().returning(|_, _, _, _| Ok(vec![]));
        let scheduler = DigestScheduler::new(
            Arc::new(store),
            Arc::new(MockEntityLookup::new()),
            Arc::new(MockEmailGateway::new()),
            flags(true, 1000),
            "n@example.com",
            Duration::seconds(60),
        );
        assert!(scheduler.is_due(EmailFrequency::Daily, now()));
        let ran = scheduler.run_due(now()).await.unwrap();
        assert_eq!(ran.len(), 2);
        assert!(!scheduler.is_due(EmailFrequency::Daily, now() + Duration::hours(23)));
        assert!(scheduler.is_due(EmailFrequency::Daily, now() + Duration::days(1)));
        assert!(!scheduler.is_due(EmailFrequency::Weekly, now() + Duration::days(6)));
        assert!(!scheduler.is_due(EmailFrequency::Live, now()));
    }

    #[tokio::test]
    async fn test_exhausted_budget_aborts() {
        let mut store = MockDigestStore::new();
        store.expect_recipients().never();
        let scheduler = DigestScheduler::new(
            Arc::new(store),
            Arc::new(MockEntityLookup::new()),
            Arc::new(MockEmailGateway::new()),
            flags(true, 1000),
            "n@example.com",
            Duration::seconds(60),
        )
        .with_budget(std::time::Duration::ZERO);
        let summary = scheduler.run_pass(EmailFrequency::Weekly, now()).await.unwrap();
        assert!(summary.aborted);
    }
}

//! 主循环
//!
//! 每个轮询周期依次执行：重试队列、新通知、私信引擎、到期的摘要邮件。
//! 同一任务不会与自身重叠；停止标志在每轮开始前检查，进行中的投递总是执行完。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fanout_shared::observability::metrics;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::badge::UserLocks;
use crate::dm::{DmCycleSummary, DmEngine};
use crate::email::{DigestPassSummary, DigestScheduler};
use crate::error::{NotificationError, Result};
use crate::listener::{ChangeListener, ListenerHandle};
use crate::processor::{BatchSummary, Processor, RetryMode};
use crate::settings::EmailFrequency;

/// 一轮执行的结果
#[derive(Debug, Default)]
pub struct CycleReport {
    pub batch: Option<BatchSummary>,
    pub retried: Option<BatchSummary>,
    pub dm: Option<DmCycleSummary>,
    pub digests: Vec<(EmailFrequency, DigestPassSummary)>,
}

pub struct Orchestrator {
    source: Arc<ChangeListener>,
    processor: Processor,
    dm: DmEngine,
    digest: Option<DigestScheduler>,
    locks: Arc<UserLocks>,
    listeners: Vec<ListenerHandle>,
    poll_interval: Duration,
    digest_interval: Duration,
    last_digest_check: Option<Instant>,
}

impl Orchestrator {
    pub fn new(
        source: Arc<ChangeListener>,
        processor: Processor,
        dm: DmEngine,
        locks: Arc<UserLocks>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            processor,
            dm,
            digest: None,
            locks,
            listeners: Vec::new(),
            poll_interval,
            digest_interval: Duration::from_secs(3600),
            last_digest_check: None,
        }
    }

    pub fn with_digest(mut self, digest: DigestScheduler, check_interval: Duration) -> Self {
        self.digest = Some(digest);
        self.digest_interval = check_interval;
        self
    }

    /// 由主循环监视的订阅任务，任何一个结束都会让主循环返回错误
    pub fn with_listeners(mut self, listeners: Vec<ListenerHandle>) -> Self {
        self.listeners = listeners;
        self
    }

    /// 运行直到停止标志置位
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<()> {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            listeners = self.listeners.len(),
            "通知主循环启动"
        );

        let result = loop {
            if *stop.borrow() {
                break Ok(());
            }
            if let Err(e) = self.run_cycle(Utc::now()).await {
                break Err(e);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
            }
        };

        for listener in std::mem::take(&mut self.listeners) {
            let channel = listener.channel().to_string();
            if let Err(e) = listener.close().await {
                warn!(channel = %channel, error = %e, "关闭订阅时出错");
            }
        }
        info!("通知主循环已停止");
        result
    }

    /// 执行一轮，订阅任务结束时返回错误
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleReport> {
        if let Some(dead) = self.listeners.iter().find(|l| l.is_finished()) {
            error!(channel = dead.channel(), "变更订阅已停止");
            return Err(NotificationError::Listener(format!(
                "频道 {} 的订阅已停止",
                dead.channel()
            )));
        }

        let mut report = CycleReport::default();

        // 先处理上一轮留下的重试，本轮新入队的要等到下一轮
        match self.processor.reprocess().await {
            Ok(summary) if summary.total > 0 => report.retried = Some(summary),
            Ok(_) => {}
            Err(e) => error!(error = %e, "重新处理重试队列失败"),
        }

        if let Some(events) = self.source.take_pending() {
            report.batch = Some(self.processor.process(events, RetryMode::Enqueue).await);
        }

        match self.dm.run_cycle(now).await {
            Ok(summary) => report.dm = Some(summary),
            Err(e) => error!(error = %e, "私信通知扫描失败"),
        }

        if let Some(digest) = &self.digest {
            let due = self
                .last_digest_check
                .is_none_or(|last| last.elapsed() >= self.digest_interval);
            if due {
                self.last_digest_check = Some(Instant::now());
                match digest.run_due(now).await {
                    Ok(ran) => report.digests = ran,
                    Err(e) => error!(error = %e, "摘要邮件执行失败"),
                }
            }
        }

        self.locks.prune_idle();
        metrics::set_last_cycle(now.timestamp() as f64);
        Ok(report)
    }
}

//! 网关调用退避
//!
//! 推送、邮件网关的单次 HTTP 调用在连接失败或超时时，在同一轮内做有限次数的指数退避重试。
//! 跨轮次的重试由通知重试队列负责，这里只处理毫秒到秒级的抖动。

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::FanoutError;

/// 指数退避参数
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// 首次调用之外的最大尝试次数
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// 不重试，只调用一次
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// 第 `attempt` 次重试（从 0 开始）前的等待时间，不超过 `max_delay`
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let scaled = base_ms * self.multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// 按退避参数执行异步调用
///
/// 只有 [`FanoutError::is_retryable`] 为真的错误才会再次尝试，其余错误原样返回。
pub async fn with_backoff<F, Fut, T>(
    backoff: &Backoff,
    target: &str,
    mut call: F,
) -> Result<T, FanoutError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FanoutError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match call().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(target_service = target, attempt, "重试后调用成功");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < backoff.max_retries => {
                let delay = backoff.delay(attempt);
                warn!(
                    target_service = target,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "调用失败，退避后重试"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> Backoff {
        Backoff {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_millis(200));
        assert_eq!(backoff.delay(1), Duration::from_millis(400));
        assert_eq!(backoff.delay(10), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = with_backoff(&fast(), "push", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(FanoutError::ExternalServiceTimeout {
                        service: "push".into(),
                    })
                } else {
                    Ok("sent")
                }
            }
        })
        .await;

        assert_eq!(tokio_test::assert_ok!(result), "sent");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = with_backoff(&fast(), "email", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(FanoutError::external("email", "400 bad request"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = with_backoff(&fast(), "push", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(FanoutError::ExternalServiceTimeout {
                    service: "push".into(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

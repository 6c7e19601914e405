//! 日志初始化模块
//!
//! 基于 tracing-subscriber 组合环境过滤器和格式化层，
//! 支持 JSON（结构化）与 pretty（人类可读）两种输出。

use crate::error::{FanoutError, Result};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// 构建环境过滤器
///
/// `RUST_LOG` 优先，其次使用配置中的日志级别，均无效时回退到 info。
pub fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 初始化 tracing（日志）
pub fn init(log_level: &str, json_logs: bool) -> Result<()> {
    let fmt_layer = if json_logs {
        fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_ansi(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter(log_level))
        .with(fmt_layer)
        .try_init()
        .map_err(|e| FanoutError::Internal(format!("日志初始化失败: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_falls_back_on_invalid_level() {
        // 非法的过滤表达式不应 panic
        let filter = env_filter("[[[not-a-filter");
        let _ = filter.to_string();
    }

    #[test]
    fn test_second_init_returns_error() {
        let _ = init("info", false);
        let err = init("info", false).unwrap_err();
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }
}

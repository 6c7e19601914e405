//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use crate::error::{FanoutError, Result};
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(service_name: &str, port: u16) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| FanoutError::Internal(format!("指标 recorder 安装失败: {e}")))?;

    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_common_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册通知管道的指标描述
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "notifications_processed_total",
        "Notifications handled by the processor, by outcome"
    );
    metrics::describe_histogram!(
        "notification_batch_duration_seconds",
        "Wall-clock duration of one processor batch"
    );
    metrics::describe_counter!("push_sends_total", "Gateway sends by channel and result");
    metrics::describe_counter!(
        "retry_queue_enqueued_total",
        "Notifications appended to the retry queue"
    );
    metrics::describe_counter!("dm_notifications_total", "DM notifications delivered, by kind");
    metrics::describe_histogram!("dm_cycle_duration_seconds", "Duration of one DM engine cycle");
    metrics::describe_counter!("digest_emails_total", "Digest emails by frequency and result");
    metrics::describe_counter!(
        "listener_fetch_failures_total",
        "Change signals whose row could not be fetched"
    );
    metrics::describe_gauge!(
        "worker_last_cycle_timestamp",
        "Unix timestamp of the last completed orchestrator cycle"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| FanoutError::Internal(format!("指标端口 {addr} 绑定失败: {e}")))?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一批通知的处理结果
#[inline]
pub fn record_batch(
    processed: u64,
    skipped: u64,
    errored: u64,
    needs_retry: u64,
    duration_secs: f64,
) {
    for (outcome, count) in [
        ("processed", processed),
        ("skipped", skipped),
        ("errored", errored),
        ("needs_retry", needs_retry),
    ] {
        if count > 0 {
            metrics::counter!("notifications_processed_total", "outcome" => outcome)
                .increment(count);
        }
    }
    metrics::histogram!("notification_batch_duration_seconds").record(duration_secs);
}

/// 记录一次渠道投递
#[inline]
pub fn record_send(channel: &str, success: bool) {
    metrics::counter!(
        "push_sends_total",
        "channel" => channel.to_string(),
        "result" => if success { "success" } else { "failure" }
    )
    .increment(1);
}

/// 记录进入重试队列的通知
#[inline]
pub fn record_retry_enqueued() {
    metrics::counter!("retry_queue_enqueued_total").increment(1);
}

/// 记录私信通知
#[inline]
pub fn record_dm_notification(kind: &str) {
    metrics::counter!("dm_notifications_total", "kind" => kind.to_string()).increment(1);
}

/// 记录一轮私信扫描耗时
#[inline]
pub fn record_dm_cycle(duration_secs: f64) {
    metrics::histogram!("dm_cycle_duration_seconds").record(duration_secs);
}

/// 记录摘要邮件发送
#[inline]
pub fn record_digest_email(frequency: &str, result: &str) {
    metrics::counter!(
        "digest_emails_total",
        "frequency" => frequency.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// 记录监听器取行失败
#[inline]
pub fn record_listener_fetch_failure(channel: &str) {
    metrics::counter!("listener_fetch_failures_total", "channel" => channel.to_string())
        .increment(1);
}

/// 记录主循环完成一轮
#[inline]
pub fn set_last_cycle(timestamp_secs: f64) {
    metrics::gauge!("worker_last_cycle_timestamp").set(timestamp_secs);
}

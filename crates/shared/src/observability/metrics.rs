//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册通用指标描述，出现在 /metrics 端点的 HELP 注释中
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!("http_requests_total", "Total number of HTTP requests");
    metrics::describe_histogram!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds"
    );

    metrics::describe_counter!(
        "points_exchanges_total",
        "Total number of points exchanges by direction and outcome"
    );
    metrics::describe_histogram!(
        "points_exchange_duration_seconds",
        "Points exchange duration in seconds"
    );
    metrics::describe_counter!(
        "points_reconciliations_total",
        "Total number of exchanges recorded for operator reconciliation"
    );
    metrics::describe_counter!(
        "remote_balance_calls_total",
        "Total number of calls to the remote balance center"
    );
    metrics::describe_histogram!(
        "remote_balance_call_duration_seconds",
        "Remote balance center call duration in seconds"
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

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 指标记录函数
// ============================================================================

/// 记录 HTTP 请求
#[inline]
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status_str.clone()
    )
    .increment(1);

    metrics::histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status_str
    )
    .record(duration_secs);
}

/// 记录一次兑换（direction: exchange_in / exchange_out，outcome 为结果码）
#[inline]
pub fn record_exchange(direction: &str, outcome: &str, duration_secs: f64) {
    metrics::counter!(
        "points_exchanges_total",
        "direction" => direction.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "points_exchange_duration_seconds",
        "direction" => direction.to_string()
    )
    .record(duration_secs);
}

/// 记录一次进入对账的兑换
#[inline]
pub fn record_reconciliation(direction: &str, kind: &str) {
    metrics::counter!(
        "points_reconciliations_total",
        "direction" => direction.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// 记录远程余额服务调用
#[inline]
pub fn record_remote_call(operation: &str, status: &str, duration_secs: f64) {
    metrics::counter!(
        "remote_balance_calls_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "remote_balance_call_duration_seconds",
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}

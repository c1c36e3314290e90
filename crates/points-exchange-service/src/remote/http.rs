//! 基于 reqwest 的余额中心 HTTP 客户端
//!
//! - `GET  {api_url}/api/external/user?user_id=..`
//! - `POST {api_url}/api/external/balance`，body `{user_id, amount, reason}`
//!
//! 响应信封为 `{success, data, message}`，使用 `X-API-Key` 认证。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use points_shared::config::BalanceCenterConfig;
use points_shared::observability::metrics;
use reqwest::{Client, Response};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{BalanceMutation, BalanceMutationResult, RemoteAccount, RemoteBalanceClient};
use crate::error::{ExchangeError, Result};

const API_KEY_HEADER: &str = "X-API-Key";
const IDEMPOTENCY_KEY_HEADER: &str = "X-Idempotency-Key";

/// 余额中心响应信封
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct MutateBalanceBody<'a> {
    user_id: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
    reason: &'a str,
}

/// 余额中心 HTTP 客户端
#[derive(Clone)]
pub struct HttpBalanceClient {
    client: Client,
    api_url: String,
    api_key: String,
    timeout: Duration,
}

impl HttpBalanceClient {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExchangeError::Internal(format!("创建 HTTP 客户端失败: {e}")))?;

        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout,
        })
    }

    pub fn from_config(config: &BalanceCenterConfig) -> Result<Self> {
        Self::new(&config.api_url, &config.api_key, config.request_timeout())
    }

    /// 发送请求并解析信封；整体受 tokio 超时约束
    async fn execute<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let start = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, self.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::RemoteUnavailable(format!(
                "请求超时 ({}ms)",
                self.timeout.as_millis()
            ))),
        };

        let status = match &outcome {
            Ok(_) => "ok",
            Err(ExchangeError::RemoteRejected(_)) => "rejected",
            Err(_) => "unavailable",
        };
        metrics::record_remote_call(operation, status, start.elapsed().as_secs_f64());

        if let Err(e) = &outcome {
            warn!(operation, error = %e, "余额中心调用失败");
        }
        outcome
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(classify_transport_error)?;
        Self::parse_response(response).await
    }

    async fn parse_response<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        let body = response.text().await.map_err(classify_transport_error)?;

        if status.is_server_error() {
            return Err(ExchangeError::RemoteUnavailable(format!(
                "余额中心返回 {status}"
            )));
        }

        if !status.is_success() {
            // 4xx 尽量取出信封中的 message
            let message = serde_json::from_str::<Envelope<serde_json::Value>>(&body)
                .ok()
                .and_then(|e| e.message)
                .unwrap_or_else(|| format!("余额中心返回 {status}"));
            return Err(ExchangeError::RemoteRejected(message));
        }

        let envelope: Envelope<T> = serde_json::from_str(&body).map_err(|e| {
            ExchangeError::RemoteUnavailable(format!("无法解析余额中心响应: {e}"))
        })?;

        if !envelope.success {
            return Err(ExchangeError::RemoteRejected(
                envelope
                    .message
                    .unwrap_or_else(|| "余额不足或操作失败".to_string()),
            ));
        }

        envelope
            .data
            .ok_or_else(|| ExchangeError::RemoteUnavailable("余额中心响应缺少 data".to_string()))
    }
}

/// 发送阶段的错误都无法确认远程是否已处理
fn classify_transport_error(err: reqwest::Error) -> ExchangeError {
    if err.is_timeout() {
        ExchangeError::RemoteUnavailable(format!("请求超时: {err}"))
    } else {
        ExchangeError::RemoteUnavailable(err.to_string())
    }
}

#[async_trait]
impl RemoteBalanceClient for HttpBalanceClient {
    #[instrument(skip(self))]
    async fn query_account(&self, external_id: &str) -> Result<RemoteAccount> {
        let url = format!("{}/api/external/user", self.api_url);
        let request = self.client.get(url).query(&[("user_id", external_id)]);
        let account: RemoteAccount = self.execute("query_account", request).await?;
        debug!(balance = %account.balance, "余额中心账户查询成功");
        Ok(account)
    }

    #[instrument(skip(self, mutation), fields(
        external_id = %mutation.external_id,
        amount = %mutation.amount,
        request_id = %mutation.request_id,
    ))]
    async fn mutate_balance(&self, mutation: &BalanceMutation) -> Result<BalanceMutationResult> {
        let url = format!("{}/api/external/balance", self.api_url);
        let request = self
            .client
            .post(url)
            .header(IDEMPOTENCY_KEY_HEADER, &mutation.request_id)
            .json(&MutateBalanceBody {
                user_id: &mutation.external_id,
                amount: mutation.amount,
                reason: &mutation.reason,
            });
        let result: BalanceMutationResult = self.execute("mutate_balance", request).await?;
        debug!(balance = %result.balance, "余额中心余额变更成功");
        Ok(result)
    }
}

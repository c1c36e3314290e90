//! Mock 余额中心
//!
//! 模拟外部余额中心的 REST API，用于本地开发与集成测试。
//!
//! - `GET  /api/external/user?user_id=..`：查询账户
//! - `POST /api/external/balance`：变更余额，body `{user_id, amount, reason}`
//!
//! 请求需携带 `X-API-Key`；变更请求的 `X-Idempotency-Key` 相同时只生效一次。
//! 通过 [`FailureMode`] 注入远程拒绝、服务端错误、慢响应等故障。

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";

/// 外部账户
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MockAccount {
    #[serde(with = "rust_decimal::serde::float")]
    pub balance: Decimal,
    pub vip_level: i32,
    pub username: String,
}

/// 故障注入模式，只影响余额变更接口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    #[default]
    None,
    /// 返回 `success: false`，余额不变
    Reject,
    /// 返回 500，余额不变
    ServerError,
    /// 先等待再正常处理
    Delay(Duration),
    /// 余额已变更，但返回 500
    ApplyThenFail,
}

/// 余额中心状态
pub struct BalanceCenterState {
    api_key: String,
    accounts: DashMap<String, MockAccount>,
    /// 幂等键 -> 变更后余额
    applied: DashMap<String, Decimal>,
    failure: Mutex<FailureMode>,
    mutation_calls: AtomicU32,
}

impl BalanceCenterState {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            accounts: DashMap::new(),
            applied: DashMap::new(),
            failure: Mutex::new(FailureMode::None),
            mutation_calls: AtomicU32::new(0),
        }
    }

    pub fn add_account(&self, user_id: &str, balance: Decimal) {
        self.accounts.insert(
            user_id.to_string(),
            MockAccount {
                balance,
                vip_level: 1,
                username: format!("user_{user_id}"),
            },
        );
    }

    pub fn balance_of(&self, user_id: &str) -> Option<Decimal> {
        self.accounts.get(user_id).map(|a| a.balance)
    }

    pub fn set_failure(&self, mode: FailureMode) {
        *self.failure.lock() = mode;
    }

    /// 收到的余额变更请求数（含被拒绝的）
    pub fn mutation_calls(&self) -> u32 {
        self.mutation_calls.load(Ordering::SeqCst)
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|key| key == self.api_key)
    }
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct MutateBalanceRequest {
    pub user_id: String,
    pub amount: Decimal,
    #[serde(default)]
    pub reason: String,
}

type ApiReply = (StatusCode, Json<Value>);

fn ok(data: Value) -> ApiReply {
    (StatusCode::OK, Json(json!({ "success": true, "data": data })))
}

fn fail(status: StatusCode, message: &str) -> ApiReply {
    (status, Json(json!({ "success": false, "message": message })))
}

fn balance_data(balance: Decimal) -> Value {
    #[derive(Serialize)]
    struct Data {
        #[serde(with = "rust_decimal::serde::float")]
        balance: Decimal,
    }
    serde_json::to_value(Data { balance }).unwrap_or(Value::Null)
}

pub fn router(state: Arc<BalanceCenterState>) -> Router {
    Router::new()
        .route("/api/external/user", get(get_user))
        .route("/api/external/balance", post(mutate_balance))
        .with_state(state)
}

/// 在随机端口启动服务，返回监听地址
pub async fn serve_ephemeral(
    state: Arc<BalanceCenterState>,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = router(state);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Mock 余额中心退出");
        }
    });
    Ok((addr, handle))
}

async fn get_user(
    State(state): State<Arc<BalanceCenterState>>,
    headers: HeaderMap,
    Query(query): Query<UserQuery>,
) -> ApiReply {
    if !state.authorized(&headers) {
        return fail(StatusCode::UNAUTHORIZED, "API Key 无效");
    }

    match state.accounts.get(&query.user_id) {
        Some(account) => ok(serde_json::to_value(account.value()).unwrap_or(Value::Null)),
        None => {
            tracing::warn!(user_id = %query.user_id, "外部账户不存在");
            fail(StatusCode::NOT_FOUND, "用户不存在")
        }
    }
}

async fn mutate_balance(
    State(state): State<Arc<BalanceCenterState>>,
    headers: HeaderMap,
    Json(request): Json<MutateBalanceRequest>,
) -> ApiReply {
    state.mutation_calls.fetch_add(1, Ordering::SeqCst);

    if !state.authorized(&headers) {
        return fail(StatusCode::UNAUTHORIZED, "API Key 无效");
    }

    let mode = *state.failure.lock();
    match mode {
        FailureMode::Reject => return fail(StatusCode::OK, "余额中心拒绝操作"),
        FailureMode::ServerError => {
            return fail(StatusCode::INTERNAL_SERVER_ERROR, "服务内部错误");
        }
        FailureMode::Delay(delay) => tokio::time::sleep(delay).await,
        FailureMode::None | FailureMode::ApplyThenFail => {}
    }

    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let Some(mut account) = state.accounts.get_mut(&request.user_id) else {
        return fail(StatusCode::NOT_FOUND, "用户不存在");
    };

    // 账户分片锁持有期间检查幂等键，同一键的并发请求只会生效一次
    if let Some(key) = &idempotency_key {
        if let Some(balance) = state.applied.get(key) {
            tracing::info!(idempotency_key = %key, "重复请求，返回首次结果");
            return ok(balance_data(*balance));
        }
    }

    let new_balance = account.balance + request.amount;
    if new_balance < Decimal::ZERO {
        return fail(StatusCode::OK, "余额不足");
    }
    account.balance = new_balance;
    if let Some(key) = idempotency_key {
        state.applied.insert(key, new_balance);
    }
    drop(account);

    tracing::info!(
        user_id = %request.user_id,
        amount = %request.amount,
        reason = %request.reason,
        balance = %new_balance,
        "外部余额已变更"
    );

    if mode == FailureMode::ApplyThenFail {
        return fail(StatusCode::INTERNAL_SERVER_ERROR, "服务内部错误");
    }
    ok(balance_data(new_balance))
}

//! 余额中心 API 处理器

use axum::extract::{Path, Query, State};
use serde::Deserialize;
use tracing::info;

use super::extract::{CurrentUser, JsonBody};
use super::{response::ApiResponse, state::AppState};
use crate::error::Result;
use crate::models::{PointsLogEntry, ReconciliationRecord};
use crate::service::exchange_service::parse_amount;
use crate::service::{
    ConfigView, ExchangeInResult, ExchangeOutResult, ExchangeRequest, LocalPointsDto,
    ResolveReconciliationRequest, UserBalanceDto,
};

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}

pub async fn health_check() -> &'static str {
    "OK"
}

/// GET /api/balance/config
pub async fn get_config(State(state): State<AppState>) -> ApiResponse<ConfigView> {
    ApiResponse::success(state.coordinator.get_config())
}

/// GET /api/balance/local-points
pub async fn get_local_points(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<ApiResponse<LocalPointsDto>> {
    let points = state.coordinator.get_balance(&user.user_id).await?;
    Ok(ApiResponse::success(LocalPointsDto { points }))
}

/// GET /api/balance/user-balance
pub async fn get_user_balance(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<ApiResponse<UserBalanceDto>> {
    let balance = state.coordinator.get_user_balance(&user.user_id).await?;
    Ok(ApiResponse::success(balance))
}

/// GET /api/balance/logs?limit=20
pub async fn list_logs(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(params): Query<LimitParams>,
) -> Result<ApiResponse<Vec<PointsLogEntry>>> {
    let logs = state.coordinator.list_logs(&user.user_id, params.limit).await?;
    Ok(ApiResponse::success(logs))
}

/// POST /api/balance/exchange-in
pub async fn exchange_in(
    State(state): State<AppState>,
    user: CurrentUser,
    JsonBody(request): JsonBody<ExchangeRequest>,
) -> Result<ApiResponse<ExchangeInResult>> {
    let amount = parse_amount(&request.amount)?;
    let result = state.coordinator.exchange_in(&user.user_id, amount).await?;
    Ok(ApiResponse::success_with_message(result, "兑入成功"))
}

/// POST /api/balance/exchange-out
pub async fn exchange_out(
    State(state): State<AppState>,
    user: CurrentUser,
    JsonBody(request): JsonBody<ExchangeRequest>,
) -> Result<ApiResponse<ExchangeOutResult>> {
    let amount = parse_amount(&request.amount)?;
    let result = state.coordinator.exchange_out(&user.user_id, amount).await?;
    Ok(ApiResponse::success_with_message(result, "兑出成功"))
}

/// GET /api/admin/reconciliations?limit=50
pub async fn list_reconciliations(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Result<ApiResponse<Vec<ReconciliationRecord>>> {
    let records = state.reconciliations.list_pending(params.limit).await?;
    Ok(ApiResponse::success(records))
}

/// POST /api/admin/reconciliations/{id}/resolve
pub async fn resolve_reconciliation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    JsonBody(request): JsonBody<ResolveReconciliationRequest>,
) -> Result<ApiResponse<ReconciliationRecord>> {
    let record = state.reconciliations.resolve(id, &request.note).await?;
    info!(reconciliation_id = id, "运营已处理对账记录");
    Ok(ApiResponse::success_with_message(record, "处理成功"))
}

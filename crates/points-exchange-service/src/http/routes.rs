//! 路由配置

use axum::{
    Router, middleware,
    routing::{get, post},
};
use points_shared::observability::middleware as obs_middleware;

use super::{handlers, state::AppState};

/// 余额中心路由（用户侧）
fn balance_routes() -> Router<AppState> {
    Router::new()
        .route("/config", get(handlers::get_config))
        .route("/local-points", get(handlers::get_local_points))
        .route("/user-balance", get(handlers::get_user_balance))
        .route("/logs", get(handlers::list_logs))
        .route("/exchange-in", post(handlers::exchange_in))
        .route("/exchange-out", post(handlers::exchange_out))
}

/// 对账管理路由（运营侧，访问控制由网关负责）
fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/reconciliations", get(handlers::list_reconciliations))
        .route(
            "/reconciliations/{id}/resolve",
            post(handlers::resolve_reconciliation),
        )
}

/// 全部业务路由
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/api/balance", balance_routes())
        .nest("/api/admin", admin_routes())
        .route("/health", get(handlers::health_check))
}

/// 带可观测性中间件的完整路由
pub fn build_router(state: AppState) -> Router {
    api_routes()
        .layer(middleware::from_fn(obs_middleware::http_tracing))
        .layer(middleware::from_fn(obs_middleware::request_id))
        .with_state(state)
}

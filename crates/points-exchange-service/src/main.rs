//! 积分兑换服务
//!
//! 提供本地石榴点与外部余额中心双向兑换的 REST API。

use std::sync::Arc;

use axum::{Json, http::HeaderValue, routing::get};
use points_exchange::{
    ConfigGate, CoordinatorOptions, ExchangeCoordinator, HttpBalanceClient, LockBackendKind,
    LockConfig, ReconciliationService, UserLockManager,
    http::{AppState, build_router},
    repository::{LinkageRepository, PointsLedgerRepository, ReconciliationRepository},
};
use points_shared::{
    config::AppConfig,
    config_watcher::{ConfigWatcher, DynamicConfig, FileConfigWatcher},
    database::Database,
    observability,
};
use sqlx::migrate::Migrator;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "points-exchange-service";

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 兑换比例非法时拒绝启动
    let config = AppConfig::load_validated(SERVICE_NAME)?;

    let obs_config = config.observability.clone().with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    info!("Starting {} on {}", SERVICE_NAME, config.server_addr());

    let db = Database::connect(&config.database).await?;
    if config.database.run_migrations {
        db.run_migrations(&MIGRATOR).await?;
    }

    let pool = db.pool().clone();
    let ledger = Arc::new(PointsLedgerRepository::new(pool.clone()));
    let linkage = Arc::new(LinkageRepository::new(pool.clone()));
    let reconciliation_repo = Arc::new(ReconciliationRepository::new(pool));

    let remote = Arc::new(HttpBalanceClient::from_config(&config.balance_center)?);
    let gate = Arc::new(ConfigGate::new(&config.balance_center)?);

    let lock_config = LockConfig::from_exchange(&config.exchange);
    let locks = match LockBackendKind::parse(&config.exchange.lock_backend) {
        LockBackendKind::Redis => {
            let client = redis::Client::open(config.redis.url.as_str())?;
            info!(url = %config.redis.url, "用户锁使用 Redis 后端");
            UserLockManager::redis(client, lock_config)
        }
        LockBackendKind::Local => {
            info!("用户锁使用进程内后端，仅适用于单实例部署");
            UserLockManager::local(lock_config)
        }
    };

    let coordinator = ExchangeCoordinator::new(
        ledger,
        linkage,
        reconciliation_repo.clone(),
        remote,
        gate.clone(),
        Arc::new(locks),
        CoordinatorOptions::from_config(&config.balance_center, &config.exchange),
    );
    let reconciliations = Arc::new(ReconciliationService::new(reconciliation_repo));

    // 配置热更新：监听配置目录，兑换开关与比例变更后替换快照
    let watcher = if config.config_center.enabled {
        let dynamic = DynamicConfig::new(config.clone());
        let _follow = gate.clone().follow(dynamic.subscribe());
        let watcher = FileConfigWatcher::from_config(SERVICE_NAME, &config, dynamic);
        match watcher.start().await {
            Ok(()) => info!(dir = %AppConfig::config_dir(), "配置热更新已启用"),
            Err(e) => warn!(error = %e, "配置监听启动失败，兑换配置将保持启动时的值"),
        }
        Some(watcher)
    } else {
        None
    };

    // CORS：通过 POINTS_CORS_ORIGINS 控制允许的来源
    let allowed_origins = std::env::var("POINTS_CORS_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000,http://localhost:5173".to_string());

    let cors = if allowed_origins == "*" {
        if config.is_production() {
            warn!("POINTS_CORS_ORIGINS=\"*\" 在生产环境中不安全，请设置为具体域名");
        }
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        info!("CORS allowed_origins: {}", allowed_origins);
        let origins: Vec<_> = allowed_origins
            .split(',')
            .filter_map(|s| s.trim().parse::<HeaderValue>().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let state = AppState::new(coordinator, reconciliations);
    let app = build_router(state)
        .route(
            "/ready",
            get({
                let db_for_ready = db.clone();
                move || readiness_check(db_for_ready.clone())
            }),
        )
        .layer(cors);

    let listener = TcpListener::bind(config.server_addr()).await?;
    info!("Listening on {}", config.server_addr());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(watcher) = watcher {
        if let Err(e) = watcher.stop().await {
            error!(error = %e, "停止配置监听失败");
        }
    }
    db.close().await;

    info!("Server shutdown complete");
    Ok(())
}

/// 监听关闭信号
///
/// 收到 SIGTERM 或 Ctrl+C 后返回，进行中的兑换请求会执行完毕。
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}

/// 就绪探针：检查数据库连接
async fn readiness_check(db: Database) -> Json<serde_json::Value> {
    let db_ok = db.health_check().await.is_ok();

    Json(serde_json::json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "service": SERVICE_NAME,
        "checks": {
            "database": if db_ok { "ok" } else { "fail" }
        }
    }))
}

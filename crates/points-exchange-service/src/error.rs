//! 积分兑换服务错误类型
//!
//! 区分三类错误：
//! - 校验拒绝：无副作用，直接返回给调用方
//! - 远程失败：远程拒绝或远程状态未知
//! - 对账错误：两侧账本可能不一致，需要人工介入

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;

use crate::models::ExchangeDirection;

/// 积分兑换服务错误类型
#[derive(Debug, Error)]
pub enum ExchangeError {
    // === 校验错误 ===
    #[error("余额中心功能未启用")]
    ConfigDisabled,

    #[error("请输入有效的兑换金额: {0}")]
    InvalidAmount(String),

    #[error("兑换配置无效: {0}")]
    InvalidConfig(String),

    #[error("请求参数无效: {0}")]
    InvalidArgument(String),

    // === 用户相关错误 ===
    #[error("未登录或登录已失效")]
    Unauthorized,

    #[error("用户不存在: {0}")]
    UserNotFound(String),

    #[error("用户未绑定外部账号，无法使用余额中心: {0}")]
    NoLinkage(String),

    #[error("石榴点不足: 需要 {required}, 当前 {available}")]
    InsufficientLocalBalance {
        required: Decimal,
        available: Decimal,
    },

    // === 远程余额服务错误 ===
    #[error("余额中心拒绝操作: {0}")]
    RemoteRejected(String),

    #[error("余额中心不可用，操作结果未知: {0}")]
    RemoteUnavailable(String),

    // === 对账错误 ===
    #[error(
        "兑换结果未知，已记录待对账: reconciliation_id={reconciliation_id}, request_id={request_id}"
    )]
    PendingReconciliation {
        reconciliation_id: i64,
        request_id: String,
    },

    #[error(
        "账本不一致，需人工对账: user_id={user_id}, direction={direction}, amount={amount}, at={occurred_at}: {detail}"
    )]
    ReconciliationFailure {
        user_id: String,
        direction: ExchangeDirection,
        amount: Decimal,
        occurred_at: DateTime<Utc>,
        detail: String,
    },

    #[error("对账记录不存在: {0}")]
    ReconciliationNotFound(i64),

    // === 系统错误 ===
    #[error("获取用户锁超时: {key}")]
    LockTimeout { key: String },

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis 错误: {0}")]
    Redis(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 积分兑换服务 Result 类型别名
pub type Result<T> = std::result::Result<T, ExchangeError>;

impl ExchangeError {
    /// 是否为可重试错误
    ///
    /// 远程不可用不可重试：重试可能导致重复扣减或入账。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Redis(_) | Self::LockTimeout { .. }
        )
    }

    /// 是否为业务拒绝（无副作用）
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::ConfigDisabled
                | Self::InvalidAmount(_)
                | Self::InvalidArgument(_)
                | Self::UserNotFound(_)
                | Self::NoLinkage(_)
                | Self::InsufficientLocalBalance { .. }
        )
    }

    /// 是否需要人工对账
    pub fn requires_reconciliation(&self) -> bool {
        matches!(
            self,
            Self::PendingReconciliation { .. } | Self::ReconciliationFailure { .. }
        )
    }

    /// 获取错误码（用于 API 响应和指标标签）
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigDisabled => "CONFIG_DISABLED",
            Self::InvalidAmount(_) => "INVALID_AMOUNT",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::UserNotFound(_) => "USER_NOT_FOUND",
            Self::NoLinkage(_) => "NO_LINKAGE",
            Self::InsufficientLocalBalance { .. } => "INSUFFICIENT_LOCAL_BALANCE",
            Self::RemoteRejected(_) => "REMOTE_REJECTED",
            Self::RemoteUnavailable(_) => "REMOTE_UNAVAILABLE",
            Self::PendingReconciliation { .. } => "RECONCILIATION_PENDING",
            Self::ReconciliationFailure { .. } => "RECONCILIATION_FAILURE",
            Self::ReconciliationNotFound(_) => "RECONCILIATION_NOT_FOUND",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Redis(_) => "REDIS_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 返回对应的 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ConfigDisabled
            | Self::InvalidAmount(_)
            | Self::InvalidArgument(_)
            | Self::NoLinkage(_)
            | Self::InsufficientLocalBalance { .. }
            | Self::RemoteRejected(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::UserNotFound(_) | Self::ReconciliationNotFound(_) => StatusCode::NOT_FOUND,
            Self::LockTimeout { .. } => StatusCode::CONFLICT,
            Self::PendingReconciliation { .. } => StatusCode::ACCEPTED,
            Self::RemoteUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::InvalidConfig(_)
            | Self::ReconciliationFailure { .. }
            | Self::Database(_)
            | Self::Redis(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<redis::RedisError> for ExchangeError {
    fn from(err: redis::RedisError) -> Self {
        Self::Redis(err.to_string())
    }
}

impl IntoResponse for ExchangeError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // 系统级错误只返回通用提示，详细信息仅记录日志
        let message = match &self {
            Self::Database(e) => {
                tracing::error!(error = %e, "数据库操作失败");
                "服务内部错误，请稍后重试".to_string()
            }
            Self::Redis(e) => {
                tracing::error!(error = %e, "Redis 操作失败");
                "服务内部错误，请稍后重试".to_string()
            }
            Self::Internal(e) | Self::InvalidConfig(e) => {
                tracing::error!(error = %e, "内部错误");
                "服务内部错误，请稍后重试".to_string()
            }
            Self::ReconciliationFailure { .. } => {
                "兑换处理异常，已记录并转人工处理，请勿重复提交".to_string()
            }
            other => other.to_string(),
        };

        let data = match &self {
            Self::PendingReconciliation {
                reconciliation_id,
                request_id,
            } => json!({
                "reconciliationId": reconciliation_id,
                "requestId": request_id,
            }),
            _ => serde_json::Value::Null,
        };

        let body = json!({
            "success": false,
            "code": self.error_code(),
            "message": message,
            "data": data,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn all_error_variants() -> Vec<(ExchangeError, StatusCode, &'static str)> {
        vec![
            (ExchangeError::ConfigDisabled, StatusCode::BAD_REQUEST, "CONFIG_DISABLED"),
            (ExchangeError::InvalidAmount("-1".into()), StatusCode::BAD_REQUEST, "INVALID_AMOUNT"),
            (ExchangeError::InvalidArgument("note".into()), StatusCode::BAD_REQUEST, "INVALID_ARGUMENT"),
            (ExchangeError::NoLinkage("u1".into()), StatusCode::BAD_REQUEST, "NO_LINKAGE"),
            (ExchangeError::Unauthorized, StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            (ExchangeError::UserNotFound("u1".into()), StatusCode::NOT_FOUND, "USER_NOT_FOUND"),
            (
                ExchangeError::InsufficientLocalBalance { required: dec!(10), available: dec!(5) },
                StatusCode::BAD_REQUEST,
                "INSUFFICIENT_LOCAL_BALANCE",
            ),
            (ExchangeError::RemoteRejected("余额不足".into()), StatusCode::BAD_REQUEST, "REMOTE_REJECTED"),
            (ExchangeError::RemoteUnavailable("timeout".into()), StatusCode::BAD_GATEWAY, "REMOTE_UNAVAILABLE"),
            (
                ExchangeError::PendingReconciliation { reconciliation_id: 7, request_id: "req".into() },
                StatusCode::ACCEPTED,
                "RECONCILIATION_PENDING",
            ),
            (
                ExchangeError::ReconciliationFailure {
                    user_id: "u1".into(),
                    direction: ExchangeDirection::ExchangeOut,
                    amount: dec!(40),
                    occurred_at: Utc::now(),
                    detail: "db down".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
                "RECONCILIATION_FAILURE",
            ),
            (ExchangeError::LockTimeout { key: "k".into() }, StatusCode::CONFLICT, "LOCK_TIMEOUT"),
            (ExchangeError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        ]
    }

    #[test]
    fn test_all_variants_status_and_code() {
        for (error, expected_status, expected_code) in all_error_variants() {
            assert_eq!(error.status_code(), expected_status, "variant={expected_code}");
            assert_eq!(error.error_code(), expected_code);
        }
    }

    #[test]
    fn test_rejections_have_no_reconciliation() {
        for (error, _, code) in all_error_variants() {
            assert!(
                !(error.is_rejection() && error.requires_reconciliation()),
                "variant={code}"
            );
        }
        assert!(ExchangeError::ConfigDisabled.is_rejection());
        assert!(!ExchangeError::RemoteRejected("x".into()).is_rejection());
    }

    #[test]
    fn test_remote_unavailable_is_not_retryable() {
        assert!(!ExchangeError::RemoteUnavailable("timeout".into()).is_retryable());
        assert!(ExchangeError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(ExchangeError::LockTimeout { key: "k".into() }.is_retryable());
    }

    #[test]
    fn test_reconciliation_failure_display_has_context() {
        let err = ExchangeError::ReconciliationFailure {
            user_id: "user-42".into(),
            direction: ExchangeDirection::ExchangeOut,
            amount: dec!(40.00),
            occurred_at: Utc::now(),
            detail: "补偿失败".into(),
        };
        let text = err.to_string();
        assert!(text.contains("user-42"));
        assert!(text.contains("exchange_out"));
        assert!(text.contains("40.00"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_insufficient_balance_display() {
        let err = ExchangeError::InsufficientLocalBalance {
            required: dec!(40),
            available: dec!(12.50),
        };
        assert!(err.to_string().contains("12.50"));
    }
}

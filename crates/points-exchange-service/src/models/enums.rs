//! 积分兑换枚举类型定义
//!
//! 所有枚举都支持数据库（sqlx）和 JSON（serde）序列化，取值统一为 snake_case。

use std::fmt;

use serde::{Deserialize, Serialize};

/// 积分流水变动类型
///
/// 新增变动类型时只追加，不修改已有取值（历史流水依赖这些字符串）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum PointsChangeType {
    /// 外部余额兑入石榴点
    ExchangeIn,
    /// 石榴点兑出到外部余额
    ExchangeOut,
    /// 兑出失败后的补偿退回
    ExchangeOutReversal,
}

impl PointsChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExchangeIn => "exchange_in",
            Self::ExchangeOut => "exchange_out",
            Self::ExchangeOutReversal => "exchange_out_reversal",
        }
    }
}

impl fmt::Display for PointsChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 兑换方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum ExchangeDirection {
    /// 外部余额 -> 石榴点
    ExchangeIn,
    /// 石榴点 -> 外部余额
    ExchangeOut,
}

impl ExchangeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExchangeIn => "exchange_in",
            Self::ExchangeOut => "exchange_out",
        }
    }
}

impl fmt::Display for ExchangeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 对账记录类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum ReconciliationKind {
    /// 远程变更结果未知（超时、连接中断、5xx）
    RemoteOutcomeUnknown,
    /// 远程拒绝后本地补偿入账失败
    CompensationFailed,
    /// 远程已扣减，本地入账失败
    LocalApplyFailed,
}

impl ReconciliationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RemoteOutcomeUnknown => "remote_outcome_unknown",
            Self::CompensationFailed => "compensation_failed",
            Self::LocalApplyFailed => "local_apply_failed",
        }
    }
}

/// 对账记录状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum ReconciliationStatus {
    #[default]
    Pending,
    Resolved,
}

/// 兑换流程阶段
///
/// 仅用于日志字段和追踪，不持久化。
/// `Validating -> RemoteMutating -> LocalApplying -> Committed`，
/// 中止路径为 `Rejected`、`Failed` 与 `Reconciliation`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePhase {
    Validating,
    RemoteMutating,
    LocalApplying,
    Compensating,
    Committed,
    Rejected,
    Failed,
    Reconciliation,
}

impl ExchangePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::RemoteMutating => "remote_mutating",
            Self::LocalApplying => "local_applying",
            Self::Compensating => "compensating",
            Self::Committed => "committed",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::Reconciliation => "reconciliation",
        }
    }
}

impl fmt::Display for ExchangePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

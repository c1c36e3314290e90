//! 石榴点账户与流水

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::PointsChangeType;

/// 积分与金额统一保留两位小数
pub const POINTS_SCALE: u32 = 2;

/// 按两位小数、四舍五入（中点远离零）规整金额
pub fn round_points(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(POINTS_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// 用户石榴点账户
///
/// 首次访问时以 0 余额惰性创建，永不删除。
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserPointsAccount {
    pub user_id: String,
    pub points: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 石榴点流水（只追加）
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PointsLogEntry {
    pub id: i64,
    pub user_id: String,
    /// 有符号变动量
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub change_type: PointsChangeType,
    /// 同一请求同一类型的变更只记一次；历史流水可能为空
    pub request_id: Option<String>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// 流水回放结果不一致
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogReplayMismatch {
    pub entry_id: i64,
    pub expected: Decimal,
    pub recorded: Decimal,
}

/// 按创建顺序回放流水，校验每一条 balance_after
///
/// `entries` 必须按时间正序排列；成功时返回回放得到的最终余额。
pub fn replay_log(entries: &[PointsLogEntry]) -> Result<Decimal, LogReplayMismatch> {
    let mut balance = Decimal::ZERO;
    for entry in entries {
        balance += entry.amount;
        if balance != entry.balance_after {
            return Err(LogReplayMismatch {
                entry_id: entry.id,
                expected: balance,
                recorded: entry.balance_after,
            });
        }
    }
    Ok(balance)
}

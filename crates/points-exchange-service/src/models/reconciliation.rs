//! 对账记录
//!
//! 两侧账本可能不一致的兑换都会落一条对账记录，供运营人工处理。

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{ExchangeDirection, ReconciliationKind, ReconciliationStatus};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationRecord {
    pub id: i64,
    pub user_id: String,
    pub external_id: String,
    pub direction: ExchangeDirection,
    /// 本地侧金额（石榴点或外部余额，取决于方向）
    pub amount: Decimal,
    /// 换算后发往远程的金额
    pub external_amount: Decimal,
    pub kind: ReconciliationKind,
    /// 发送给余额中心的幂等键
    pub request_id: String,
    pub detail: String,
    pub status: ReconciliationStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
}

/// 新建对账记录
#[derive(Debug, Clone)]
pub struct NewReconciliation {
    pub user_id: String,
    pub external_id: String,
    pub direction: ExchangeDirection,
    pub amount: Decimal,
    pub external_amount: Decimal,
    pub kind: ReconciliationKind,
    pub request_id: String,
    pub detail: String,
}

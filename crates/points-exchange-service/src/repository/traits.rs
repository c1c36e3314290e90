//! 仓储 Trait 定义
//!
//! 服务层依赖抽象而非具体实现，支持 mock 测试

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::Result;
use crate::models::{
    LinkageLookup, NewReconciliation, PointsChangeType, PointsLogEntry, ReconciliationRecord,
};

/// 石榴点账本仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PointsLedgerRepositoryTrait: Send + Sync {
    /// 查询余额，账户不存在时以 0 余额创建（幂等）
    async fn get_or_create(&self, user_id: &str) -> Result<Decimal>;

    /// 原子地变更余额并追加一条流水，返回变更后余额
    ///
    /// 变更后余额为负时返回 `InsufficientLocalBalance`，不产生任何写入。
    /// 以 `(request_id, change_type)` 去重：已记账时不再变更，直接返回当时的变更后余额。
    async fn apply_delta(
        &self,
        user_id: &str,
        amount: Decimal,
        change_type: PointsChangeType,
        request_id: &str,
        reason: &str,
    ) -> Result<Decimal>;

    /// 按时间倒序列出用户流水
    async fn list_logs(&self, user_id: &str, limit: i64) -> Result<Vec<PointsLogEntry>>;
}

/// 用户绑定关系查询接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LinkageRepositoryTrait: Send + Sync {
    async fn find_linkage(&self, user_id: &str) -> Result<LinkageLookup>;
}

/// 对账记录仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReconciliationRepositoryTrait: Send + Sync {
    /// 写入待处理记录；同一 `(request_id, kind)` 已存在时返回已有记录的 id
    async fn create(&self, record: &NewReconciliation) -> Result<i64>;
    async fn get(&self, id: i64) -> Result<Option<ReconciliationRecord>>;
    async fn list_pending(&self, limit: i64) -> Result<Vec<ReconciliationRecord>>;

    /// 标记为已处理；记录不存在或已处理时返回 false
    async fn resolve(&self, id: i64, note: &str) -> Result<bool>;
}

//! 对账记录服务
//!
//! 运营人员查看待处理的对账记录，核对两侧账本后手动标记为已处理。
//! 处理结果（补记账、远程冲正等）在系统外完成，这里只记录结论。

use std::sync::Arc;

use tracing::{info, instrument};

use crate::error::{ExchangeError, Result};
use crate::models::ReconciliationRecord;
use crate::repository::ReconciliationRepositoryTrait;

/// 列表查询条数上限
const MAX_LIST_LIMIT: i64 = 200;

pub struct ReconciliationService {
    repo: Arc<dyn ReconciliationRepositoryTrait>,
}

impl ReconciliationService {
    pub fn new(repo: Arc<dyn ReconciliationRepositoryTrait>) -> Self {
        Self { repo }
    }

    /// 待处理记录，按创建时间正序
    #[instrument(skip(self))]
    pub async fn list_pending(&self, limit: i64) -> Result<Vec<ReconciliationRecord>> {
        self.repo.list_pending(limit.clamp(1, MAX_LIST_LIMIT)).await
    }

    /// 标记记录为已处理
    ///
    /// 已处理的记录再次提交时原样返回，不覆盖首次处理结论。
    #[instrument(skip(self, note))]
    pub async fn resolve(&self, id: i64, note: &str) -> Result<ReconciliationRecord> {
        let note = note.trim();
        if note.is_empty() {
            return Err(ExchangeError::InvalidArgument("处理说明不能为空".to_string()));
        }

        let updated = self.repo.resolve(id, note).await?;
        let record = self
            .repo
            .get(id)
            .await?
            .ok_or(ExchangeError::ReconciliationNotFound(id))?;

        if updated {
            info!(
                reconciliation_id = id,
                user_id = %record.user_id,
                request_id = %record.request_id,
                "对账记录已处理"
            );
        }
        Ok(record)
    }
}

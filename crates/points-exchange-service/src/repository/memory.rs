//! 内存仓储实现
//!
//! 基于 DashMap 的账本、绑定关系与对账记录存储，适用于本地开发和测试。
//! 每个账户由独立的异步互斥锁保护，不同用户之间互不阻塞。

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use super::traits::{
    LinkageRepositoryTrait, PointsLedgerRepositoryTrait, ReconciliationRepositoryTrait,
};
use crate::error::{ExchangeError, Result};
use crate::models::{
    ExchangeLinkage, LinkageLookup, NewReconciliation, PointsChangeType, PointsLogEntry,
    ReconciliationKind, ReconciliationRecord, ReconciliationStatus, UserPointsAccount,
    round_points,
};

#[derive(Debug)]
struct AccountState {
    account: UserPointsAccount,
    /// 按时间正序
    logs: Vec<PointsLogEntry>,
}

impl AccountState {
    fn new(user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            account: UserPointsAccount {
                user_id: user_id.to_string(),
                points: Decimal::ZERO,
                created_at: now,
                updated_at: now,
            },
            logs: Vec::new(),
        }
    }

    /// 同一请求同一类型已记账时的变更后余额
    fn applied_balance(&self, request_id: &str, change_type: PointsChangeType) -> Option<Decimal> {
        self.logs
            .iter()
            .rev()
            .find(|log| {
                log.change_type == change_type && log.request_id.as_deref() == Some(request_id)
            })
            .map(|log| log.balance_after)
    }

    /// 同一用户的流水时间不回退
    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.logs.last() {
            Some(last) if last.created_at > now => last.created_at,
            _ => now,
        }
    }
}

/// 内存石榴点账本
#[derive(Debug, Default)]
pub struct MemoryPointsLedger {
    accounts: DashMap<String, Arc<Mutex<AccountState>>>,
    next_log_id: AtomicI64,
}

impl MemoryPointsLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取账户句柄，不存在时创建
    ///
    /// DashMap 的分片锁在返回前释放，不跨 await 持有。
    fn account(&self, user_id: &str) -> Arc<Mutex<AccountState>> {
        self.accounts
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(AccountState::new(user_id))))
            .value()
            .clone()
    }

    /// 账户数量
    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    /// 按时间正序返回用户全部流水，用于回放校验
    pub async fn logs_in_order(&self, user_id: &str) -> Vec<PointsLogEntry> {
        let Some(account) = self.accounts.get(user_id).map(|a| a.value().clone()) else {
            return Vec::new();
        };
        let state = account.lock().await;
        state.logs.clone()
    }
}

#[async_trait]
impl PointsLedgerRepositoryTrait for MemoryPointsLedger {
    async fn get_or_create(&self, user_id: &str) -> Result<Decimal> {
        let account = self.account(user_id);
        let state = account.lock().await;
        Ok(state.account.points)
    }

    async fn apply_delta(
        &self,
        user_id: &str,
        amount: Decimal,
        change_type: PointsChangeType,
        request_id: &str,
        reason: &str,
    ) -> Result<Decimal> {
        let amount = round_points(amount);
        let account = self.account(user_id);
        let mut state = account.lock().await;

        if let Some(balance_after) = state.applied_balance(request_id, change_type) {
            return Ok(balance_after);
        }

        let current = state.account.points;
        let new_balance = current + amount;
        if new_balance < Decimal::ZERO {
            return Err(ExchangeError::InsufficientLocalBalance {
                required: -amount,
                available: current,
            });
        }

        let created_at = state.next_timestamp();
        let id = self.next_log_id.fetch_add(1, Ordering::SeqCst) + 1;
        state.logs.push(PointsLogEntry {
            id,
            user_id: user_id.to_string(),
            amount,
            balance_after: new_balance,
            change_type,
            request_id: Some(request_id.to_string()),
            reason: reason.to_string(),
            created_at,
        });
        state.account.points = new_balance;
        state.account.updated_at = created_at;

        Ok(new_balance)
    }

    async fn list_logs(&self, user_id: &str, limit: i64) -> Result<Vec<PointsLogEntry>> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(0);
        let logs = self.logs_in_order(user_id).await;
        Ok(logs.into_iter().rev().take(limit).collect())
    }
}

/// 内存绑定关系存储
#[derive(Debug, Default)]
pub struct MemoryLinkageStore {
    /// user_id -> external_id（None 表示用户存在但未绑定）
    users: DashMap<String, Option<String>>,
}

impl MemoryLinkageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记已绑定外部账号的用户
    pub fn link(&self, user_id: &str, external_id: &str) {
        self.users
            .insert(user_id.to_string(), Some(external_id.to_string()));
    }

    /// 登记未绑定外部账号的用户
    pub fn add_unlinked(&self, user_id: &str) {
        self.users.insert(user_id.to_string(), None);
    }
}

#[async_trait]
impl LinkageRepositoryTrait for MemoryLinkageStore {
    async fn find_linkage(&self, user_id: &str) -> Result<LinkageLookup> {
        Ok(match self.users.get(user_id).map(|v| v.value().clone()) {
            None => LinkageLookup::UserMissing,
            Some(None) => LinkageLookup::Unlinked,
            Some(Some(external_id)) => LinkageLookup::Linked(ExchangeLinkage {
                user_id: user_id.to_string(),
                external_id,
            }),
        })
    }
}

/// 内存对账记录存储
#[derive(Debug, Default)]
pub struct MemoryReconciliationStore {
    records: DashMap<i64, ReconciliationRecord>,
    /// (request_id, kind) -> id
    by_request: DashMap<(String, ReconciliationKind), i64>,
    next_id: AtomicI64,
}

impl MemoryReconciliationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 全部记录（按 id 升序）
    pub fn all(&self) -> Vec<ReconciliationRecord> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.id);
        records
    }
}

#[async_trait]
impl ReconciliationRepositoryTrait for MemoryReconciliationStore {
    async fn create(&self, record: &NewReconciliation) -> Result<i64> {
        let key = (record.request_id.clone(), record.kind);
        let id = *self
            .by_request
            .entry(key)
            .or_insert_with(|| self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        if self.records.contains_key(&id) {
            return Ok(id);
        }
        self.records.insert(
            id,
            ReconciliationRecord {
                id,
                user_id: record.user_id.clone(),
                external_id: record.external_id.clone(),
                direction: record.direction,
                amount: record.amount,
                external_amount: record.external_amount,
                kind: record.kind,
                request_id: record.request_id.clone(),
                detail: record.detail.clone(),
                status: ReconciliationStatus::Pending,
                created_at: Utc::now(),
                resolved_at: None,
                resolution_note: None,
            },
        );
        Ok(id)
    }

    async fn get(&self, id: i64) -> Result<Option<ReconciliationRecord>> {
        Ok(self.records.get(&id).map(|r| r.value().clone()))
    }

    async fn list_pending(&self, limit: i64) -> Result<Vec<ReconciliationRecord>> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(0);
        Ok(self
            .all()
            .into_iter()
            .filter(|r| r.status == ReconciliationStatus::Pending)
            .take(limit)
            .collect())
    }

    async fn resolve(&self, id: i64, note: &str) -> Result<bool> {
        let Some(mut record) = self.records.get_mut(&id) else {
            return Ok(false);
        };
        if record.status == ReconciliationStatus::Resolved {
            return Ok(false);
        }
        record.status = ReconciliationStatus::Resolved;
        record.resolved_at = Some(Utc::now());
        record.resolution_note = Some(note.to_string());
        Ok(true)
    }
}

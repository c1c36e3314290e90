//! 集成测试公共设施：内存仓储 + 可编排的远程余额中心

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use points_exchange::error::{ExchangeError, Result};
use points_exchange::models::{PointsChangeType, PointsLogEntry};
use points_exchange::remote::{
    BalanceMutation, BalanceMutationResult, RemoteAccount, RemoteBalanceClient,
};
use points_exchange::repository::{
    MemoryLinkageStore, MemoryPointsLedger, MemoryReconciliationStore, PointsLedgerRepositoryTrait,
};
use points_exchange::{
    ConfigGate, CoordinatorOptions, ExchangeCoordinator, LockConfig, ReconciliationService,
    UserLockManager,
};
use points_shared::config::BalanceCenterConfig;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

/// 远程余额中心的行为
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteBehavior {
    Normal,
    Reject,
    Unavailable,
    /// 正常处理前等待
    Delay(Duration),
}

/// 内存版余额中心
pub struct FakeRemote {
    balances: Mutex<HashMap<String, Decimal>>,
    behavior: Mutex<RemoteBehavior>,
    mutations: Mutex<Vec<BalanceMutation>>,
    pub query_calls: AtomicU32,
    pub mutate_calls: AtomicU32,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self {
            balances: Mutex::new(HashMap::new()),
            behavior: Mutex::new(RemoteBehavior::Normal),
            mutations: Mutex::new(Vec::new()),
            query_calls: AtomicU32::new(0),
            mutate_calls: AtomicU32::new(0),
        }
    }

    pub async fn set_balance(&self, external_id: &str, balance: Decimal) {
        self.balances
            .lock()
            .await
            .insert(external_id.to_string(), balance);
    }

    pub async fn balance(&self, external_id: &str) -> Decimal {
        self.balances
            .lock()
            .await
            .get(external_id)
            .copied()
            .unwrap_or_default()
    }

    pub async fn set_behavior(&self, behavior: RemoteBehavior) {
        *self.behavior.lock().await = behavior;
    }

    pub async fn mutations(&self) -> Vec<BalanceMutation> {
        self.mutations.lock().await.clone()
    }

    pub fn mutate_calls(&self) -> u32 {
        self.mutate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteBalanceClient for FakeRemote {
    async fn query_account(&self, external_id: &str) -> Result<RemoteAccount> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        match self.balances.lock().await.get(external_id) {
            Some(balance) => Ok(RemoteAccount {
                balance: *balance,
                vip_level: 3,
                username: format!("name-{external_id}"),
            }),
            None => Err(ExchangeError::RemoteRejected("用户不存在".to_string())),
        }
    }

    async fn mutate_balance(&self, mutation: &BalanceMutation) -> Result<BalanceMutationResult> {
        self.mutate_calls.fetch_add(1, Ordering::SeqCst);
        self.mutations.lock().await.push(mutation.clone());

        let behavior = *self.behavior.lock().await;
        match behavior {
            RemoteBehavior::Reject => {
                return Err(ExchangeError::RemoteRejected("余额中心拒绝操作".to_string()));
            }
            RemoteBehavior::Unavailable => {
                return Err(ExchangeError::RemoteUnavailable("connection reset".to_string()));
            }
            RemoteBehavior::Delay(delay) => tokio::time::sleep(delay).await,
            RemoteBehavior::Normal => {}
        }

        let mut balances = self.balances.lock().await;
        let balance = balances.entry(mutation.external_id.clone()).or_default();
        let next = *balance + mutation.amount;
        if next < Decimal::ZERO {
            return Err(ExchangeError::RemoteRejected("余额不足".to_string()));
        }
        *balance = next;
        Ok(BalanceMutationResult { balance: next })
    }
}

/// 对指定流水类型注入可重试故障的账本
pub struct FlakyLedger {
    inner: Arc<MemoryPointsLedger>,
    target: PointsChangeType,
    remaining_failures: AtomicU32,
    /// 为 true 时先写入底层账本再报错，模拟提交后连接中断
    fail_after_apply: bool,
    pub attempts: AtomicU32,
}

impl FlakyLedger {
    pub fn new(inner: Arc<MemoryPointsLedger>, target: PointsChangeType, failures: u32) -> Self {
        Self {
            inner,
            target,
            remaining_failures: AtomicU32::new(failures),
            fail_after_apply: false,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn after_apply(mut self) -> Self {
        self.fail_after_apply = true;
        self
    }

    fn take_failure(&self) -> bool {
        self.remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PointsLedgerRepositoryTrait for FlakyLedger {
    async fn get_or_create(&self, user_id: &str) -> Result<Decimal> {
        self.inner.get_or_create(user_id).await
    }

    async fn apply_delta(
        &self,
        user_id: &str,
        amount: Decimal,
        change_type: PointsChangeType,
        request_id: &str,
        reason: &str,
    ) -> Result<Decimal> {
        if change_type != self.target {
            return self
                .inner
                .apply_delta(user_id, amount, change_type, request_id, reason)
                .await;
        }

        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_after_apply {
            let balance = self
                .inner
                .apply_delta(user_id, amount, change_type, request_id, reason)
                .await?;
            if self.take_failure() {
                return Err(ExchangeError::Database(sqlx::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset after commit",
                ))));
            }
            return Ok(balance);
        }

        if self.take_failure() {
            return Err(ExchangeError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner
            .apply_delta(user_id, amount, change_type, request_id, reason)
            .await
    }

    async fn list_logs(&self, user_id: &str, limit: i64) -> Result<Vec<PointsLogEntry>> {
        self.inner.list_logs(user_id, limit).await
    }
}

pub fn balance_config(enabled: bool, rate_in: Decimal, rate_out: Decimal) -> BalanceCenterConfig {
    BalanceCenterConfig {
        enabled,
        exchange_rate_in: rate_in,
        exchange_rate_out: rate_out,
        ..BalanceCenterConfig::default()
    }
}

/// 组装好的协调器及其依赖
pub struct Harness {
    pub ledger: Arc<MemoryPointsLedger>,
    pub linkage: Arc<MemoryLinkageStore>,
    pub reconciliations: Arc<MemoryReconciliationStore>,
    pub remote: Arc<FakeRemote>,
    pub gate: Arc<ConfigGate>,
    pub coordinator: ExchangeCoordinator,
    pub reconciliation_service: Arc<ReconciliationService>,
}

pub struct HarnessBuilder {
    config: BalanceCenterConfig,
    ledger_override: Option<Arc<dyn PointsLedgerRepositoryTrait>>,
    ledger: Arc<MemoryPointsLedger>,
    options: CoordinatorOptions,
}

impl HarnessBuilder {
    pub fn new(rate_in: Decimal, rate_out: Decimal) -> Self {
        Self {
            config: balance_config(true, rate_in, rate_out),
            ledger_override: None,
            ledger: Arc::new(MemoryPointsLedger::new()),
            options: CoordinatorOptions {
                remote_timeout: Duration::from_secs(2),
                compensation_retries: 2,
            },
        }
    }

    pub fn disabled(mut self) -> Self {
        self.config.enabled = false;
        self
    }

    pub fn remote_timeout(mut self, timeout: Duration) -> Self {
        self.options.remote_timeout = timeout;
        self
    }

    /// 用包装过的账本替换协调器看到的账本，底层仍是同一个内存账本
    pub fn flaky(mut self, target: PointsChangeType, failures: u32) -> (Self, Arc<FlakyLedger>) {
        let flaky = Arc::new(FlakyLedger::new(self.ledger.clone(), target, failures));
        self.ledger_override = Some(flaky.clone());
        (self, flaky)
    }

    /// 记账已落库、结果却以错误返回的账本
    pub fn lost_ack(
        mut self,
        target: PointsChangeType,
        failures: u32,
    ) -> (Self, Arc<FlakyLedger>) {
        let flaky =
            Arc::new(FlakyLedger::new(self.ledger.clone(), target, failures).after_apply());
        self.ledger_override = Some(flaky.clone());
        (self, flaky)
    }

    pub fn build(self) -> Harness {
        let linkage = Arc::new(MemoryLinkageStore::new());
        let reconciliations = Arc::new(MemoryReconciliationStore::new());
        let remote = Arc::new(FakeRemote::new());
        let gate = Arc::new(ConfigGate::new(&self.config).expect("valid config"));
        let locks = Arc::new(UserLockManager::local(LockConfig::default()));

        let ledger: Arc<dyn PointsLedgerRepositoryTrait> = match self.ledger_override {
            Some(ledger) => ledger,
            None => self.ledger.clone() as Arc<dyn PointsLedgerRepositoryTrait>,
        };

        let coordinator = ExchangeCoordinator::new(
            ledger,
            linkage.clone(),
            reconciliations.clone(),
            remote.clone(),
            gate.clone(),
            locks,
            self.options,
        );
        let reconciliation_service = Arc::new(ReconciliationService::new(reconciliations.clone()));

        Harness {
            ledger: self.ledger,
            linkage,
            reconciliations,
            remote,
            gate,
            coordinator,
            reconciliation_service,
        }
    }
}

impl Harness {
    /// 已绑定外部账号 `ext-{user_id}` 的用户
    pub async fn linked_user(&self, user_id: &str, remote_balance: Decimal) -> String {
        let external_id = format!("ext-{user_id}");
        self.linkage.link(user_id, &external_id);
        self.remote.set_balance(&external_id, remote_balance).await;
        external_id
    }

    /// 直接在本地账本入账，用于准备余额
    pub async fn seed_local(&self, user_id: &str, points: Decimal) {
        self.ledger
            .apply_delta(
                user_id,
                points,
                PointsChangeType::ExchangeIn,
                &format!("seed-{}", uuid::Uuid::new_v4()),
                "测试初始化",
            )
            .await
            .expect("seed local points");
    }
}

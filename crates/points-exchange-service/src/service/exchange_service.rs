//! 积分兑换协调器
//!
//! 在本地石榴点账本与外部余额中心之间执行兑入/兑出。两侧没有共享事务，
//! 每个方向都先执行本方可补偿的一步，再执行外部可见的一步：
//!
//! - 兑入: 校验 -> 远程扣减外部余额 -> 本地增加石榴点
//! - 兑出: 校验 -> 本地扣减石榴点 -> 远程增加外部余额
//!
//! ## 失败处理
//!
//! - 远程明确拒绝兑出：写入退回流水补偿本地扣减
//! - 远程结果未知：不补偿，写入待对账记录，返回 `PendingReconciliation`
//! - 补偿或本地入账失败：写入对账记录并返回 `ReconciliationFailure`
//!
//! 获取用户锁后的步骤在独立任务中执行，调用方中途放弃请求不会中断已开始的两阶段流程。

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use points_shared::config::{BalanceCenterConfig, ExchangeConfig};
use points_shared::observability::metrics;
use points_shared::retry::{RetryPolicy, retry_with_policy};
use rust_decimal::Decimal;
use tracing::{Instrument, Span, debug, error, info, instrument, warn};
use uuid::Uuid;

use super::dto::{ConfigView, ExchangeInResult, ExchangeOutResult, UserBalanceDto};
use crate::config_gate::{ConfigGate, ExchangeConfigSnapshot};
use crate::error::{ExchangeError, Result};
use crate::lock::{UserLockGuard, UserLockManager};
use crate::models::{
    ExchangeDirection, ExchangeLinkage, ExchangePhase, LinkageLookup, NewReconciliation,
    POINTS_SCALE, PointsChangeType, PointsLogEntry, ReconciliationKind, round_points,
};
use crate::remote::{BalanceMutation, BalanceMutationResult, RemoteBalanceClient};
use crate::repository::{
    LinkageRepositoryTrait, PointsLedgerRepositoryTrait, ReconciliationRepositoryTrait,
};

/// 单次兑换金额上限
const MAX_EXCHANGE_AMOUNT: i64 = 1_000_000_000;
/// 流水查询条数上限
pub const MAX_LOG_LIMIT: i64 = 100;

const REMOTE_REASON_IN: &str = "石榴点兑入";
const REMOTE_REASON_OUT: &str = "石榴点兑出";
const REVERSAL_REASON: &str = "兑出失败退回";

/// 协调器运行参数
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// 单次远程调用的超时上限，超时视为结果未知
    pub remote_timeout: Duration,
    /// 补偿入账与对账记录写入的重试次数
    pub compensation_retries: u32,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            remote_timeout: Duration::from_secs(5),
            compensation_retries: 3,
        }
    }
}

impl CoordinatorOptions {
    pub fn from_config(balance_center: &BalanceCenterConfig, exchange: &ExchangeConfig) -> Self {
        Self {
            remote_timeout: balance_center.request_timeout(),
            compensation_retries: exchange.compensation_retries,
        }
    }
}

/// 校验通过后的兑换计划
#[derive(Debug, Clone)]
struct ExchangePlan {
    user_id: String,
    external_id: String,
    direction: ExchangeDirection,
    /// 用户提交的金额（兑入为外部余额，兑出为石榴点）
    amount: Decimal,
    /// 按快照比例换算后的金额
    converted: Decimal,
    request_id: String,
    config_version: u64,
}

/// 解析请求中的金额
///
/// 接受 JSON 数字或数字字符串，其余形式均视为无效金额。
pub fn parse_amount(value: &serde_json::Value) -> Result<Decimal> {
    let text = match value {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.trim().to_string(),
        other => return Err(ExchangeError::InvalidAmount(other.to_string())),
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| ExchangeError::InvalidAmount(text))
}

/// 校验兑换金额：必须为正数，最多两位小数
pub fn validate_amount(amount: Decimal) -> Result<Decimal> {
    if amount <= Decimal::ZERO {
        return Err(ExchangeError::InvalidAmount(format!("金额必须大于 0: {amount}")));
    }
    let normalized = amount.normalize();
    if normalized.scale() > POINTS_SCALE {
        return Err(ExchangeError::InvalidAmount(format!(
            "金额最多保留两位小数: {amount}"
        )));
    }
    if normalized > Decimal::from(MAX_EXCHANGE_AMOUNT) {
        return Err(ExchangeError::InvalidAmount(format!("单次兑换金额过大: {amount}")));
    }
    Ok(normalized)
}

fn enter_phase(phase: ExchangePhase) {
    Span::current().record("phase", phase.as_str());
    debug!(phase = %phase, "兑换阶段切换");
}

fn record_outcome<T>(direction: ExchangeDirection, result: &Result<T>, start: Instant) {
    let outcome = match result {
        Ok(_) => "committed",
        Err(e) => e.error_code(),
    };
    metrics::record_exchange(direction.as_str(), outcome, start.elapsed().as_secs_f64());
}

/// 在独立任务中执行持锁流程，任务结束时释放锁
async fn run_detached<T, F>(guard: UserLockGuard, work: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let task = tokio::spawn(
        async move {
            let result = work.await;
            if let Err(e) = guard.release().await {
                warn!(error = %e, "释放用户锁失败");
            }
            result
        }
        .instrument(Span::current()),
    );

    match task.await {
        Ok(result) => result,
        Err(e) => Err(ExchangeError::Internal(format!("兑换任务异常终止: {e}"))),
    }
}

/// 积分兑换协调器
#[derive(Clone)]
pub struct ExchangeCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    ledger: Arc<dyn PointsLedgerRepositoryTrait>,
    linkage: Arc<dyn LinkageRepositoryTrait>,
    reconciliations: Arc<dyn ReconciliationRepositoryTrait>,
    remote: Arc<dyn RemoteBalanceClient>,
    gate: Arc<ConfigGate>,
    locks: Arc<UserLockManager>,
    options: CoordinatorOptions,
}

impl ExchangeCoordinator {
    pub fn new(
        ledger: Arc<dyn PointsLedgerRepositoryTrait>,
        linkage: Arc<dyn LinkageRepositoryTrait>,
        reconciliations: Arc<dyn ReconciliationRepositoryTrait>,
        remote: Arc<dyn RemoteBalanceClient>,
        gate: Arc<ConfigGate>,
        locks: Arc<UserLockManager>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                linkage,
                reconciliations,
                remote,
                gate,
                locks,
                options,
            }),
        }
    }

    /// 当前兑换配置
    pub fn get_config(&self) -> ConfigView {
        ConfigView::from(self.inner.gate.current().as_ref())
    }

    /// 本地石榴点余额，账户不存在时创建
    #[instrument(skip(self))]
    pub async fn get_balance(&self, user_id: &str) -> Result<Decimal> {
        self.inner.ledger.get_or_create(user_id).await
    }

    /// 最近的石榴点流水，limit 限制在 1..=100
    #[instrument(skip(self))]
    pub async fn list_logs(&self, user_id: &str, limit: i64) -> Result<Vec<PointsLogEntry>> {
        let limit = limit.clamp(1, MAX_LOG_LIMIT);
        self.inner.ledger.list_logs(user_id, limit).await
    }

    /// 外部余额与本地石榴点聚合查询
    #[instrument(skip(self))]
    pub async fn get_user_balance(&self, user_id: &str) -> Result<UserBalanceDto> {
        let snapshot = self.inner.gate.current();
        if !snapshot.enabled {
            return Err(ExchangeError::ConfigDisabled);
        }

        let linkage = self.inner.resolve_linkage(user_id).await?;
        let local_points = self.inner.ledger.get_or_create(user_id).await?;

        let query = self.inner.remote.query_account(&linkage.external_id);
        let account = match tokio::time::timeout(self.inner.options.remote_timeout, query).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ExchangeError::RemoteUnavailable(
                    "查询外部余额超时".to_string(),
                ));
            }
        };

        Ok(UserBalanceDto {
            balance: account.balance,
            vip_level: account.vip_level,
            username: account.username,
            local_points,
        })
    }

    /// 兑入：外部余额 -> 石榴点
    #[instrument(
        skip(self),
        fields(
            direction = "exchange_in",
            phase = tracing::field::Empty,
            request_id = tracing::field::Empty,
        )
    )]
    pub async fn exchange_in(&self, user_id: &str, amount: Decimal) -> Result<ExchangeInResult> {
        let start = Instant::now();
        let result = self.run_exchange_in(user_id, amount).await;
        record_outcome(ExchangeDirection::ExchangeIn, &result, start);
        result
    }

    /// 兑出：石榴点 -> 外部余额
    #[instrument(
        skip(self),
        fields(
            direction = "exchange_out",
            phase = tracing::field::Empty,
            request_id = tracing::field::Empty,
        )
    )]
    pub async fn exchange_out(&self, user_id: &str, amount: Decimal) -> Result<ExchangeOutResult> {
        let start = Instant::now();
        let result = self.run_exchange_out(user_id, amount).await;
        record_outcome(ExchangeDirection::ExchangeOut, &result, start);
        result
    }

    async fn run_exchange_in(&self, user_id: &str, amount: Decimal) -> Result<ExchangeInResult> {
        // 整个流程只使用这一份快照
        let snapshot = self.inner.gate.current();
        let plan = self
            .inner
            .prepare(&snapshot, user_id, amount, ExchangeDirection::ExchangeIn)
            .await?;

        let guard = self.inner.locks.acquire(user_id).await?;
        let inner = self.inner.clone();
        run_detached(guard, async move { inner.exchange_in_locked(plan).await }).await
    }

    async fn run_exchange_out(&self, user_id: &str, amount: Decimal) -> Result<ExchangeOutResult> {
        let snapshot = self.inner.gate.current();
        let plan = self
            .inner
            .prepare(&snapshot, user_id, amount, ExchangeDirection::ExchangeOut)
            .await?;

        let guard = self.inner.locks.acquire(user_id).await?;
        let inner = self.inner.clone();
        run_detached(guard, async move { inner.exchange_out_locked(plan).await }).await
    }
}

impl Inner {
    /// 校验阶段：配置开关、金额、绑定关系，均无副作用
    async fn prepare(
        &self,
        snapshot: &ExchangeConfigSnapshot,
        user_id: &str,
        amount: Decimal,
        direction: ExchangeDirection,
    ) -> Result<ExchangePlan> {
        enter_phase(ExchangePhase::Validating);

        let result = self.build_plan(snapshot, user_id, amount, direction).await;

        if let Err(e) = &result {
            enter_phase(ExchangePhase::Rejected);
            info!(user_id = %user_id, %amount, reason = %e, "兑换请求被拒绝");
        }
        result
    }

    async fn build_plan(
        &self,
        snapshot: &ExchangeConfigSnapshot,
        user_id: &str,
        amount: Decimal,
        direction: ExchangeDirection,
    ) -> Result<ExchangePlan> {
        if !snapshot.enabled {
            return Err(ExchangeError::ConfigDisabled);
        }

        let amount = validate_amount(amount)?;
        let rate = match direction {
            ExchangeDirection::ExchangeIn => snapshot.rate_in,
            ExchangeDirection::ExchangeOut => snapshot.rate_out,
        };
        let converted = round_points(amount * rate);
        if converted <= Decimal::ZERO {
            return Err(ExchangeError::InvalidAmount(format!(
                "按当前比例换算后金额为 0: {amount}"
            )));
        }

        let linkage = self.resolve_linkage(user_id).await?;
        let request_id = Uuid::now_v7().to_string();
        Span::current().record("request_id", request_id.as_str());

        Ok(ExchangePlan {
            user_id: user_id.to_string(),
            external_id: linkage.external_id,
            direction,
            amount,
            converted,
            request_id,
            config_version: snapshot.version,
        })
    }

    async fn resolve_linkage(&self, user_id: &str) -> Result<ExchangeLinkage> {
        match self.linkage.find_linkage(user_id).await? {
            LinkageLookup::Linked(linkage) => Ok(linkage),
            LinkageLookup::Unlinked => Err(ExchangeError::NoLinkage(user_id.to_string())),
            LinkageLookup::UserMissing => Err(ExchangeError::UserNotFound(user_id.to_string())),
        }
    }

    async fn exchange_in_locked(&self, plan: ExchangePlan) -> Result<ExchangeInResult> {
        enter_phase(ExchangePhase::RemoteMutating);
        let remote = match self.mutate_remote(&plan, -plan.amount, REMOTE_REASON_IN).await {
            Ok(remote) => remote,
            Err(ExchangeError::RemoteUnavailable(detail)) => {
                enter_phase(ExchangePhase::Failed);
                // 本地未变更；外部扣减是否生效未知，留痕供核对
                match self
                    .journal(&plan, ReconciliationKind::RemoteOutcomeUnknown, &detail)
                    .await
                {
                    Ok(id) => warn!(
                        user_id = %plan.user_id,
                        request_id = %plan.request_id,
                        reconciliation_id = id,
                        "兑入时余额中心结果未知，已记录待核对"
                    ),
                    Err(e) => error!(
                        user_id = %plan.user_id,
                        request_id = %plan.request_id,
                        error = %e,
                        "兑入结果未知且对账记录写入失败"
                    ),
                }
                return Err(ExchangeError::RemoteUnavailable(detail));
            }
            Err(e) => {
                enter_phase(ExchangePhase::Failed);
                return Err(e);
            }
        };

        enter_phase(ExchangePhase::LocalApplying);
        let reason = format!("兑入 {} 外部余额", plan.amount);
        match self
            .apply_with_retry(&plan, plan.converted, PointsChangeType::ExchangeIn, &reason)
            .await
        {
            Ok(new_local_points) => {
                enter_phase(ExchangePhase::Committed);
                info!(
                    user_id = %plan.user_id,
                    amount = %plan.amount,
                    received_points = %plan.converted,
                    config_version = plan.config_version,
                    "兑入成功"
                );
                Ok(ExchangeInResult {
                    exchanged_amount: plan.amount,
                    received_points: plan.converted,
                    new_balance: remote.balance,
                    new_local_points,
                })
            }
            Err(e) => {
                enter_phase(ExchangePhase::Reconciliation);
                Err(self
                    .reconciliation_failure(
                        &plan,
                        ReconciliationKind::LocalApplyFailed,
                        format!("外部余额已扣减，本地入账失败: {e}"),
                    )
                    .await)
            }
        }
    }

    async fn exchange_out_locked(&self, plan: ExchangePlan) -> Result<ExchangeOutResult> {
        // 预检查，最终以原子扣减为准
        let available = self.ledger.get_or_create(&plan.user_id).await?;
        if available < plan.amount {
            enter_phase(ExchangePhase::Rejected);
            return Err(ExchangeError::InsufficientLocalBalance {
                required: plan.amount,
                available,
            });
        }

        enter_phase(ExchangePhase::LocalApplying);
        let reason = format!("兑出 {} 到外部余额", plan.converted);
        let new_local_points = self
            .ledger
            .apply_delta(
                &plan.user_id,
                -plan.amount,
                PointsChangeType::ExchangeOut,
                &plan.request_id,
                &reason,
            )
            .await
            .inspect_err(|_| enter_phase(ExchangePhase::Rejected))?;

        enter_phase(ExchangePhase::RemoteMutating);
        match self.mutate_remote(&plan, plan.converted, REMOTE_REASON_OUT).await {
            Ok(remote) => {
                enter_phase(ExchangePhase::Committed);
                info!(
                    user_id = %plan.user_id,
                    amount = %plan.amount,
                    received_balance = %plan.converted,
                    config_version = plan.config_version,
                    "兑出成功"
                );
                Ok(ExchangeOutResult {
                    exchanged_points: plan.amount,
                    received_balance: plan.converted,
                    new_balance: remote.balance,
                    new_local_points,
                })
            }
            Err(ExchangeError::RemoteRejected(message)) => {
                self.compensate_exchange_out(&plan, message).await
            }
            Err(e) => {
                // 远程可能已入账，不能直接退回
                enter_phase(ExchangePhase::Reconciliation);
                let detail = e.to_string();
                match self
                    .journal(&plan, ReconciliationKind::RemoteOutcomeUnknown, &detail)
                    .await
                {
                    Ok(reconciliation_id) => {
                        warn!(
                            user_id = %plan.user_id,
                            amount = %plan.amount,
                            request_id = %plan.request_id,
                            reconciliation_id,
                            "兑出时余额中心结果未知，已扣减石榴点并记录待对账"
                        );
                        Err(ExchangeError::PendingReconciliation {
                            reconciliation_id,
                            request_id: plan.request_id.clone(),
                        })
                    }
                    Err(journal_err) => Err(self
                        .reconciliation_failure(
                            &plan,
                            ReconciliationKind::RemoteOutcomeUnknown,
                            format!("{detail}; 对账记录写入失败: {journal_err}"),
                        )
                        .await),
                }
            }
        }
    }

    /// 远程拒绝兑出后退回石榴点
    async fn compensate_exchange_out(
        &self,
        plan: &ExchangePlan,
        message: String,
    ) -> Result<ExchangeOutResult> {
        enter_phase(ExchangePhase::Compensating);
        match self
            .apply_with_retry(
                plan,
                plan.amount,
                PointsChangeType::ExchangeOutReversal,
                REVERSAL_REASON,
            )
            .await
        {
            Ok(restored) => {
                enter_phase(ExchangePhase::Failed);
                warn!(
                    user_id = %plan.user_id,
                    amount = %plan.amount,
                    restored_points = %restored,
                    remote_message = %message,
                    "余额中心拒绝兑出，已退回石榴点"
                );
                Err(ExchangeError::RemoteRejected(message))
            }
            Err(e) => {
                enter_phase(ExchangePhase::Reconciliation);
                Err(self
                    .reconciliation_failure(
                        plan,
                        ReconciliationKind::CompensationFailed,
                        format!("余额中心拒绝兑出 ({message})，退回石榴点失败: {e}"),
                    )
                    .await)
            }
        }
    }

    /// 调用余额中心变更余额
    ///
    /// 除明确拒绝外的所有失败都归为结果未知。
    async fn mutate_remote(
        &self,
        plan: &ExchangePlan,
        amount: Decimal,
        reason: &str,
    ) -> Result<BalanceMutationResult> {
        let mutation = BalanceMutation {
            external_id: plan.external_id.clone(),
            amount,
            reason: reason.to_string(),
            request_id: plan.request_id.clone(),
        };

        let call = self.remote.mutate_balance(&mutation);
        match tokio::time::timeout(self.options.remote_timeout, call).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(ExchangeError::RemoteRejected(message))) => {
                Err(ExchangeError::RemoteRejected(message))
            }
            Ok(Err(ExchangeError::RemoteUnavailable(detail))) => {
                Err(ExchangeError::RemoteUnavailable(detail))
            }
            Ok(Err(other)) => Err(ExchangeError::RemoteUnavailable(other.to_string())),
            Err(_) => Err(ExchangeError::RemoteUnavailable(format!(
                "余额中心调用超时 ({}ms)",
                self.options.remote_timeout.as_millis()
            ))),
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::compensation(self.options.compensation_retries)
    }

    /// 必须完成的本地记账，瞬时故障时重试
    ///
    /// 账本按 request_id 去重，提交后才报错的那次重试不会重复入账。
    async fn apply_with_retry(
        &self,
        plan: &ExchangePlan,
        amount: Decimal,
        change_type: PointsChangeType,
        reason: &str,
    ) -> Result<Decimal> {
        retry_with_policy(
            &self.retry_policy(),
            change_type.as_str(),
            ExchangeError::is_retryable,
            || {
                self.ledger
                    .apply_delta(&plan.user_id, amount, change_type, &plan.request_id, reason)
            },
        )
        .await
    }

    /// 写入对账记录
    async fn journal(
        &self,
        plan: &ExchangePlan,
        kind: ReconciliationKind,
        detail: &str,
    ) -> Result<i64> {
        let record = NewReconciliation {
            user_id: plan.user_id.clone(),
            external_id: plan.external_id.clone(),
            direction: plan.direction,
            amount: plan.amount,
            external_amount: plan.converted,
            kind,
            request_id: plan.request_id.clone(),
            detail: detail.to_string(),
        };

        let id = retry_with_policy(
            &self.retry_policy(),
            "reconciliation_journal",
            ExchangeError::is_retryable,
            || self.reconciliations.create(&record),
        )
        .await?;

        metrics::record_reconciliation(plan.direction.as_str(), kind.as_str());
        Ok(id)
    }

    /// 两侧账本已不一致：落对账记录，记录 error 日志，返回不可重试的错误
    async fn reconciliation_failure(
        &self,
        plan: &ExchangePlan,
        kind: ReconciliationKind,
        detail: String,
    ) -> ExchangeError {
        let occurred_at = Utc::now();
        let journal = self.journal(plan, kind, &detail).await;

        error!(
            user_id = %plan.user_id,
            external_id = %plan.external_id,
            direction = %plan.direction,
            amount = %plan.amount,
            external_amount = %plan.converted,
            request_id = %plan.request_id,
            kind = kind.as_str(),
            occurred_at = %occurred_at,
            reconciliation_id = ?journal.as_ref().ok(),
            detail = %detail,
            "兑换出现账本不一致，需人工对账"
        );
        if let Err(e) = &journal {
            error!(
                user_id = %plan.user_id,
                request_id = %plan.request_id,
                error = %e,
                "对账记录写入失败，仅保留日志"
            );
        }

        ExchangeError::ReconciliationFailure {
            user_id: plan.user_id.clone(),
            direction: plan.direction,
            amount: plan.amount,
            occurred_at,
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockConfig;
    use crate::models::ExchangeLinkage;
    use crate::remote::MockRemoteBalanceClient;
    use crate::repository::{
        MockLinkageRepositoryTrait, MockPointsLedgerRepositoryTrait,
        MockReconciliationRepositoryTrait,
    };
    use rust_decimal_macros::dec;
    use serde_json::json;

    struct Mocks {
        ledger: MockPointsLedgerRepositoryTrait,
        linkage: MockLinkageRepositoryTrait,
        reconciliations: MockReconciliationRepositoryTrait,
        remote: MockRemoteBalanceClient,
    }

    impl Mocks {
        fn new() -> Self {
            Self {
                ledger: MockPointsLedgerRepositoryTrait::new(),
                linkage: MockLinkageRepositoryTrait::new(),
                reconciliations: MockReconciliationRepositoryTrait::new(),
                remote: MockRemoteBalanceClient::new(),
            }
        }

        fn linked(mut self) -> Self {
            self.linkage.expect_find_linkage().returning(|user_id| {
                Ok(LinkageLookup::Linked(ExchangeLinkage {
                    user_id: user_id.to_string(),
                    external_id: format!("ext-{user_id}"),
                }))
            });
            self
        }

        fn build(self, enabled: bool, rate_in: Decimal, rate_out: Decimal) -> ExchangeCoordinator {
            let gate = ConfigGate::new(&BalanceCenterConfig {
                enabled,
                exchange_rate_in: rate_in,
                exchange_rate_out: rate_out,
                ..BalanceCenterConfig::default()
            })
            .unwrap();

            ExchangeCoordinator::new(
                Arc::new(self.ledger),
                Arc::new(self.linkage),
                Arc::new(self.reconciliations),
                Arc::new(self.remote),
                Arc::new(gate),
                Arc::new(UserLockManager::local(LockConfig::default())),
                CoordinatorOptions {
                    remote_timeout: Duration::from_secs(1),
                    compensation_retries: 1,
                },
            )
        }
    }

    #[test]
    fn test_parse_amount_accepts_number_and_string() {
        assert_eq!(parse_amount(&json!(10)).unwrap(), dec!(10));
        assert_eq!(parse_amount(&json!(10.5)).unwrap(), dec!(10.5));
        assert_eq!(parse_amount(&json!(" 3.25 ")).unwrap(), dec!(3.25));
        assert!(matches!(parse_amount(&json!("abc")), Err(ExchangeError::InvalidAmount(_))));
        assert!(matches!(parse_amount(&json!(null)), Err(ExchangeError::InvalidAmount(_))));
        assert!(matches!(parse_amount(&json!(true)), Err(ExchangeError::InvalidAmount(_))));
    }

    #[test]
    fn test_validate_amount() {
        assert_eq!(validate_amount(dec!(10.50)).unwrap(), dec!(10.5));
        assert!(validate_amount(dec!(0)).is_err());
        assert!(validate_amount(dec!(-1)).is_err());
        assert!(validate_amount(dec!(1.001)).is_err());
        assert!(validate_amount(dec!(2000000000)).is_err());
    }

    #[tokio::test]
    async fn test_config_disabled_makes_no_calls() {
        let mut mocks = Mocks::new();
        mocks.ledger.expect_get_or_create().times(0);
        mocks.ledger.expect_apply_delta().times(0);
        mocks.linkage.expect_find_linkage().times(0);
        mocks.reconciliations.expect_create().times(0);
        mocks.remote.expect_mutate_balance().times(0);
        mocks.remote.expect_query_account().times(0);
        let coordinator = mocks.build(false, dec!(1), dec!(1));

        let err = coordinator.exchange_in("u1", dec!(10)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::ConfigDisabled));
        let err = coordinator.exchange_out("u1", dec!(10)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::ConfigDisabled));
        let err = coordinator.get_user_balance("u1").await.unwrap_err();
        assert!(matches!(err, ExchangeError::ConfigDisabled));
    }

    #[tokio::test]
    async fn test_invalid_amount_makes_no_calls() {
        let mut mocks = Mocks::new();
        mocks.linkage.expect_find_linkage().times(0);
        mocks.remote.expect_mutate_balance().times(0);
        mocks.ledger.expect_apply_delta().times(0);
        let coordinator = mocks.build(true, dec!(1), dec!(1));

        for amount in [dec!(0), dec!(-5), dec!(0.001)] {
            let err = coordinator.exchange_in("u1", amount).await.unwrap_err();
            assert!(matches!(err, ExchangeError::InvalidAmount(_)), "amount={amount}");
        }
    }

    #[tokio::test]
    async fn test_unlinked_and_missing_users_rejected() {
        let mut mocks = Mocks::new();
        mocks.linkage.expect_find_linkage().returning(|user_id| {
            Ok(if user_id == "unbound" {
                LinkageLookup::Unlinked
            } else {
                LinkageLookup::UserMissing
            })
        });
        mocks.remote.expect_mutate_balance().times(0);
        mocks.ledger.expect_apply_delta().times(0);
        let coordinator = mocks.build(true, dec!(1), dec!(1));

        let err = coordinator.exchange_in("unbound", dec!(1)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::NoLinkage(_)));
        let err = coordinator.exchange_out("ghost", dec!(1)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::UserNotFound(_)));
    }

    #[tokio::test]
    async fn test_exchange_in_applies_rate() {
        let mut mocks = Mocks::new().linked();
        mocks
            .remote
            .expect_mutate_balance()
            .withf(|m| m.amount == dec!(-10) && m.external_id == "ext-u1" && !m.request_id.is_empty())
            .times(1)
            .returning(|_| Ok(BalanceMutationResult { balance: dec!(90) }));
        mocks
            .ledger
            .expect_apply_delta()
            .withf(|_, amount, change_type, request_id, reason| {
                *amount == dec!(20.00)
                    && *change_type == PointsChangeType::ExchangeIn
                    && !request_id.is_empty()
                    && reason.contains("兑入")
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(dec!(20.00)));
        let coordinator = mocks.build(true, dec!(2.0), dec!(1));

        let result = coordinator.exchange_in("u1", dec!(10)).await.unwrap();
        assert_eq!(result.exchanged_amount, dec!(10));
        assert_eq!(result.received_points, dec!(20.00));
        assert_eq!(result.new_balance, dec!(90));
        assert_eq!(result.new_local_points, dec!(20.00));
    }

    #[tokio::test]
    async fn test_exchange_in_remote_rejected_no_local_change() {
        let mut mocks = Mocks::new().linked();
        mocks
            .remote
            .expect_mutate_balance()
            .returning(|_| Err(ExchangeError::RemoteRejected("余额不足".into())));
        mocks.ledger.expect_apply_delta().times(0);
        mocks.reconciliations.expect_create().times(0);
        let coordinator = mocks.build(true, dec!(2), dec!(1));

        let err = coordinator.exchange_in("u1", dec!(10)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::RemoteRejected(m) if m == "余额不足"));
    }

    #[tokio::test]
    async fn test_exchange_in_local_failure_is_reconciliation_failure() {
        let mut mocks = Mocks::new().linked();
        mocks
            .remote
            .expect_mutate_balance()
            .returning(|_| Ok(BalanceMutationResult { balance: dec!(90) }));
        mocks
            .ledger
            .expect_apply_delta()
            .returning(|_, _, _, _, _| Err(ExchangeError::Internal("磁盘已满".into())));
        mocks
            .reconciliations
            .expect_create()
            .withf(|r| {
                r.kind == ReconciliationKind::LocalApplyFailed
                    && r.direction == ExchangeDirection::ExchangeIn
                    && r.amount == dec!(10)
                    && r.external_amount == dec!(20)
            })
            .times(1)
            .returning(|_| Ok(1));
        let coordinator = mocks.build(true, dec!(2), dec!(1));

        let err = coordinator.exchange_in("u1", dec!(10)).await.unwrap_err();
        match err {
            ExchangeError::ReconciliationFailure { user_id, amount, direction, .. } => {
                assert_eq!(user_id, "u1");
                assert_eq!(amount, dec!(10));
                assert_eq!(direction, ExchangeDirection::ExchangeIn);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exchange_out_applies_rate() {
        let mut mocks = Mocks::new().linked();
        mocks.ledger.expect_get_or_create().returning(|_| Ok(dec!(100)));
        mocks
            .ledger
            .expect_apply_delta()
            .withf(|_, amount, change_type, _, _| {
                *amount == dec!(-40) && *change_type == PointsChangeType::ExchangeOut
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(dec!(60.00)));
        mocks
            .remote
            .expect_mutate_balance()
            .withf(|m| m.amount == dec!(20.00))
            .times(1)
            .returning(|_| Ok(BalanceMutationResult { balance: dec!(120) }));
        let coordinator = mocks.build(true, dec!(1), dec!(0.5));

        let result = coordinator.exchange_out("u1", dec!(40)).await.unwrap();
        assert_eq!(result.exchanged_points, dec!(40));
        assert_eq!(result.received_balance, dec!(20.00));
        assert_eq!(result.new_local_points, dec!(60.00));
        assert_eq!(result.new_balance, dec!(120));
    }

    #[tokio::test]
    async fn test_exchange_out_insufficient_balance_no_side_effects() {
        let mut mocks = Mocks::new().linked();
        mocks.ledger.expect_get_or_create().returning(|_| Ok(dec!(30)));
        mocks.ledger.expect_apply_delta().times(0);
        mocks.remote.expect_mutate_balance().times(0);
        let coordinator = mocks.build(true, dec!(1), dec!(0.5));

        let err = coordinator.exchange_out("u1", dec!(40)).await.unwrap_err();
        match err {
            ExchangeError::InsufficientLocalBalance { required, available } => {
                assert_eq!(required, dec!(40));
                assert_eq!(available, dec!(30));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exchange_out_remote_rejected_compensates() {
        let mut mocks = Mocks::new().linked();
        mocks.ledger.expect_get_or_create().returning(|_| Ok(dec!(100)));
        mocks
            .ledger
            .expect_apply_delta()
            .withf(|_, amount, change_type, _, _| {
                *amount == dec!(-40) && *change_type == PointsChangeType::ExchangeOut
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(dec!(60)));
        mocks
            .ledger
            .expect_apply_delta()
            .withf(|_, amount, change_type, _, reason| {
                *amount == dec!(40)
                    && *change_type == PointsChangeType::ExchangeOutReversal
                    && reason == REVERSAL_REASON
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(dec!(100)));
        mocks
            .remote
            .expect_mutate_balance()
            .returning(|_| Err(ExchangeError::RemoteRejected("账户已冻结".into())));
        mocks.reconciliations.expect_create().times(0);
        let coordinator = mocks.build(true, dec!(1), dec!(0.5));

        let err = coordinator.exchange_out("u1", dec!(40)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::RemoteRejected(_)));
    }

    #[tokio::test]
    async fn test_exchange_out_remote_unavailable_records_pending() {
        let mut mocks = Mocks::new().linked();
        mocks.ledger.expect_get_or_create().returning(|_| Ok(dec!(100)));
        mocks
            .ledger
            .expect_apply_delta()
            .withf(|_, _, change_type, _, _| *change_type == PointsChangeType::ExchangeOut)
            .times(1)
            .returning(|_, _, _, _, _| Ok(dec!(60)));
        mocks
            .ledger
            .expect_apply_delta()
            .withf(|_, _, change_type, _, _| *change_type == PointsChangeType::ExchangeOutReversal)
            .times(0);
        mocks
            .remote
            .expect_mutate_balance()
            .returning(|_| Err(ExchangeError::RemoteUnavailable("connection reset".into())));
        mocks
            .reconciliations
            .expect_create()
            .withf(|r| {
                r.kind == ReconciliationKind::RemoteOutcomeUnknown
                    && r.direction == ExchangeDirection::ExchangeOut
                    && r.external_amount == dec!(20)
            })
            .times(1)
            .returning(|_| Ok(42));
        let coordinator = mocks.build(true, dec!(1), dec!(0.5));

        let err = coordinator.exchange_out("u1", dec!(40)).await.unwrap_err();
        match err {
            ExchangeError::PendingReconciliation { reconciliation_id, request_id } => {
                assert_eq!(reconciliation_id, 42);
                assert!(!request_id.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exchange_out_compensation_failure() {
        let mut mocks = Mocks::new().linked();
        mocks.ledger.expect_get_or_create().returning(|_| Ok(dec!(100)));
        mocks
            .ledger
            .expect_apply_delta()
            .withf(|_, _, change_type, _, _| *change_type == PointsChangeType::ExchangeOut)
            .times(1)
            .returning(|_, _, _, _, _| Ok(dec!(60)));
        // 首次执行加一次重试
        mocks
            .ledger
            .expect_apply_delta()
            .withf(|_, _, change_type, _, _| *change_type == PointsChangeType::ExchangeOutReversal)
            .times(2)
            .returning(|_, _, _, _, _| Err(ExchangeError::Database(sqlx::Error::PoolTimedOut)));
        mocks
            .remote
            .expect_mutate_balance()
            .returning(|_| Err(ExchangeError::RemoteRejected("拒绝".into())));
        mocks
            .reconciliations
            .expect_create()
            .withf(|r| r.kind == ReconciliationKind::CompensationFailed)
            .times(1)
            .returning(|_| Ok(7));
        let coordinator = mocks.build(true, dec!(1), dec!(0.5));

        let err = coordinator.exchange_out("u1", dec!(40)).await.unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::ReconciliationFailure { direction: ExchangeDirection::ExchangeOut, .. }
        ));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_converted_amount_rounding_to_zero_rejected() {
        let mut mocks = Mocks::new();
        mocks.linkage.expect_find_linkage().times(0);
        mocks.remote.expect_mutate_balance().times(0);
        let coordinator = mocks.build(true, dec!(0.1), dec!(1));

        let err = coordinator.exchange_in("u1", dec!(0.01)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidAmount(_)));
    }

    #[tokio::test]
    async fn test_list_logs_clamps_limit() {
        let mut mocks = Mocks::new();
        mocks
            .ledger
            .expect_list_logs()
            .withf(|_, limit| *limit == MAX_LOG_LIMIT)
            .times(1)
            .returning(|_, _| Ok(Vec::new()));
        let coordinator = mocks.build(true, dec!(1), dec!(1));

        assert!(coordinator.list_logs("u1", 10_000).await.unwrap().is_empty());
    }
}

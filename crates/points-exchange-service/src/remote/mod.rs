//! 余额中心客户端
//!
//! 余额中心是外部系统，与本地账本不共享事务。客户端只做两件事：
//! 查询账户、变更余额。失败被划分为两类：
//!
//! - `RemoteRejected`: 远程明确拒绝，状态未变
//! - `RemoteUnavailable`: 请求可能已到达远程，结果未知

mod http;

pub use http::HttpBalanceClient;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// 余额中心账户信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteAccount {
    pub balance: Decimal,
    #[serde(default)]
    pub vip_level: i32,
    #[serde(default)]
    pub username: String,
}

/// 余额变更请求
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceMutation {
    pub external_id: String,
    /// 正数增加，负数扣减
    pub amount: Decimal,
    pub reason: String,
    /// 幂等键，随 `X-Idempotency-Key` 头发送
    pub request_id: String,
}

/// 余额变更结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceMutationResult {
    /// 远程变更后的余额
    pub balance: Decimal,
}

/// 余额中心客户端接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteBalanceClient: Send + Sync {
    /// 查询外部账户（只读）
    async fn query_account(&self, external_id: &str) -> Result<RemoteAccount>;

    /// 变更外部余额，返回成功即表示远程状态已改变
    async fn mutate_balance(&self, mutation: &BalanceMutation) -> Result<BalanceMutationResult>;
}

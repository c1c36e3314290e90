//! 服务层数据传输对象
//!
//! 金额字段以 JSON 数字输出，与前端既有约定一致。

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config_gate::ExchangeConfigSnapshot;

/// 兑换配置视图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigView {
    pub enabled: bool,
    #[serde(with = "rust_decimal::serde::float")]
    pub exchange_rate_in: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub exchange_rate_out: Decimal,
}

impl From<&ExchangeConfigSnapshot> for ConfigView {
    fn from(snapshot: &ExchangeConfigSnapshot) -> Self {
        Self {
            enabled: snapshot.enabled,
            exchange_rate_in: snapshot.rate_in,
            exchange_rate_out: snapshot.rate_out,
        }
    }
}

/// 本地石榴点余额
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalPointsDto {
    #[serde(with = "rust_decimal::serde::float")]
    pub points: Decimal,
}

/// 外部余额与本地石榴点聚合视图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBalanceDto {
    #[serde(with = "rust_decimal::serde::float")]
    pub balance: Decimal,
    pub vip_level: i32,
    pub username: String,
    #[serde(rename = "localPoints", with = "rust_decimal::serde::float")]
    pub local_points: Decimal,
}

/// 兑入结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeInResult {
    /// 扣减的外部余额
    #[serde(with = "rust_decimal::serde::float")]
    pub exchanged_amount: Decimal,
    /// 获得的石榴点
    #[serde(with = "rust_decimal::serde::float")]
    pub received_points: Decimal,
    /// 远程确认的外部余额
    #[serde(with = "rust_decimal::serde::float")]
    pub new_balance: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub new_local_points: Decimal,
}

/// 兑出结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeOutResult {
    /// 扣减的石榴点
    #[serde(with = "rust_decimal::serde::float")]
    pub exchanged_points: Decimal,
    /// 获得的外部余额
    #[serde(with = "rust_decimal::serde::float")]
    pub received_balance: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub new_balance: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub new_local_points: Decimal,
}

/// 兑换请求体，金额原样接收后再解析
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeRequest {
    #[serde(default)]
    pub amount: serde_json::Value,
}

/// 对账处理请求
#[derive(Debug, Clone, Deserialize)]
pub struct ResolveReconciliationRequest {
    pub note: String,
}

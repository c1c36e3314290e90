//! 兑换配置闸门
//!
//! 每次兑换只读取一次配置快照，整个流程使用同一组开关与比例。
//! 热更新时整体替换快照，非法比例被拒绝并保留旧快照。

use std::sync::Arc;

use arc_swap::ArcSwap;
use points_shared::config::{AppConfig, BalanceCenterConfig};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::{ExchangeError, Result};

/// 不可变的兑换配置快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeConfigSnapshot {
    pub enabled: bool,
    pub rate_in: Decimal,
    pub rate_out: Decimal,
    /// 每次成功重载递增
    pub version: u64,
}

pub struct ConfigGate {
    current: ArcSwap<ExchangeConfigSnapshot>,
}

impl ConfigGate {
    /// 以初始配置创建闸门，比例非法时返回错误
    pub fn new(config: &BalanceCenterConfig) -> Result<Self> {
        validate(config)?;
        Ok(Self {
            current: ArcSwap::from_pointee(ExchangeConfigSnapshot {
                enabled: config.enabled,
                rate_in: config.exchange_rate_in,
                rate_out: config.exchange_rate_out,
                version: 1,
            }),
        })
    }

    /// 当前快照
    pub fn current(&self) -> Arc<ExchangeConfigSnapshot> {
        self.current.load_full()
    }

    /// 替换快照，返回新快照
    ///
    /// 校验失败时旧快照保持生效。
    pub fn reload(&self, config: &BalanceCenterConfig) -> Result<Arc<ExchangeConfigSnapshot>> {
        validate(config)?;

        self.current.rcu(|old| ExchangeConfigSnapshot {
            enabled: config.enabled,
            rate_in: config.exchange_rate_in,
            rate_out: config.exchange_rate_out,
            version: old.version + 1,
        });

        let snapshot = self.current();
        info!(
            enabled = snapshot.enabled,
            rate_in = %snapshot.rate_in,
            rate_out = %snapshot.rate_out,
            version = snapshot.version,
            "兑换配置已更新"
        );
        Ok(snapshot)
    }

    /// 跟随动态配置变更
    ///
    /// 发送端关闭（服务退出）时任务结束。
    pub fn follow(self: Arc<Self>, mut rx: watch::Receiver<Arc<AppConfig>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let config = rx.borrow_and_update().clone();
                if let Err(e) = self.reload(&config.balance_center) {
                    error!(error = %e, "兑换配置重载被拒绝，保留当前配置");
                }
            }
        })
    }
}

fn validate(config: &BalanceCenterConfig) -> Result<()> {
    config
        .validate()
        .map_err(|e| ExchangeError::InvalidConfig(e.to_string()))
}

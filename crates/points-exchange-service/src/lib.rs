//! 积分兑换服务
//!
//! 在本地石榴点账本与外部余额中心之间做双向兑换。
//!
//! ## 核心流程
//!
//! - **兑入**：先扣外部余额，成功后给本地账户入账
//! - **兑出**：先扣本地石榴点，再给外部余额入账；远程明确拒绝时退回本地，
//!   远程结果未知时登记待对账记录
//!
//! 同一用户的兑换由用户锁串行化，本地余额永不为负。
//!
//! ## 模块结构
//!
//! - `config_gate`: 兑换开关与比例快照，支持热更新
//! - `error`: 错误类型定义
//! - `http`: REST 路由与处理器
//! - `lock`: 用户级互斥锁（进程内 / Redis）
//! - `models`: 账本、绑定关系与对账记录模型
//! - `remote`: 外部余额中心客户端
//! - `repository`: 数据访问层（PostgreSQL 与内存实现）
//! - `service`: 兑换协调器与对账服务

pub mod config_gate;
pub mod error;
pub mod http;
pub mod lock;
pub mod models;
pub mod remote;
pub mod repository;
pub mod service;

pub use config_gate::{ConfigGate, ExchangeConfigSnapshot};
pub use error::{ExchangeError, Result};
pub use lock::{LockBackendKind, LockConfig, UserLockManager};
pub use remote::{HttpBalanceClient, RemoteBalanceClient};
pub use service::{CoordinatorOptions, ExchangeCoordinator, ReconciliationService};

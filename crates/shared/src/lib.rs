//! 共享库
//!
//! 包含积分兑换相关服务共用的配置、配置热更新、错误处理、数据库连接、重试与可观测性等基础设施代码。

pub mod config;
pub mod config_watcher;
pub mod database;
pub mod error;
pub mod observability;
pub mod retry;

//! 服务层
//!
//! - `exchange_service`: 兑入/兑出协调器及余额查询
//! - `reconciliation_service`: 对账记录查询与人工处理
//! - `dto`: 对外返回的数据结构

pub mod dto;
pub mod exchange_service;
pub mod reconciliation_service;

pub use dto::*;
pub use exchange_service::{CoordinatorOptions, ExchangeCoordinator};
pub use reconciliation_service::ReconciliationService;

//! 数据仓储层
//!
//! 提供石榴点账本、用户绑定与对账记录的数据访问。
//!
//! - PostgreSQL 实现用于生产部署
//! - 内存实现用于本地开发和测试，语义与 PostgreSQL 实现一致
//! - 服务层只依赖 trait，便于 mock 测试

mod linkage_repo;
mod memory;
mod points_repo;
mod reconciliation_repo;
mod traits;

pub use linkage_repo::LinkageRepository;
pub use memory::{MemoryLinkageStore, MemoryPointsLedger, MemoryReconciliationStore};
pub use points_repo::PointsLedgerRepository;
pub use reconciliation_repo::ReconciliationRepository;
pub use traits::*;

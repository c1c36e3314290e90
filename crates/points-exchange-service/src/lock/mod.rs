//! 用户级兑换锁
//!
//! 同一用户的兑换在整个两阶段流程内串行执行，不同用户互不阻塞。
//!
//! - **本地后端**（默认）: 进程内按 key 分配的异步互斥锁
//! - **Redis 后端**: `SET NX PX` + owner 校验释放，用于多实例部署
//!
//! ```ignore
//! let guard = lock_manager.acquire("user-1").await?;
//! // 执行兑换流程
//! guard.release().await?;
//! ```

mod lock_manager;

pub use lock_manager::{LockBackendKind, LockConfig, UserLockGuard, UserLockManager};

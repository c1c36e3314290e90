//! 本地用户与外部账号的绑定关系

use serde::{Deserialize, Serialize};

/// 用户绑定关系（只读）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeLinkage {
    pub user_id: String,
    pub external_id: String,
}

/// 绑定查询结果
///
/// 区分“用户不存在”与“用户存在但未绑定”。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkageLookup {
    Linked(ExchangeLinkage),
    Unlinked,
    UserMissing,
}

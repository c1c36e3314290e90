//! 用户绑定关系仓储（PostgreSQL）
//!
//! 外部账号 ID 存放在 users.oauth2_id。

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;

use super::traits::LinkageRepositoryTrait;
use crate::error::Result;
use crate::models::{ExchangeLinkage, LinkageLookup};

pub struct LinkageRepository {
    pool: PgPool,
}

impl LinkageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LinkageRepositoryTrait for LinkageRepository {
    #[instrument(skip(self))]
    async fn find_linkage(&self, user_id: &str) -> Result<LinkageLookup> {
        // 外层 Option 区分行是否存在，内层区分是否绑定
        let row: Option<Option<String>> =
            sqlx::query_scalar("SELECT oauth2_id FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(match row {
            None => LinkageLookup::UserMissing,
            Some(None) => LinkageLookup::Unlinked,
            Some(Some(external_id)) if external_id.trim().is_empty() => LinkageLookup::Unlinked,
            Some(Some(external_id)) => LinkageLookup::Linked(ExchangeLinkage {
                user_id: user_id.to_string(),
                external_id,
            }),
        })
    }
}

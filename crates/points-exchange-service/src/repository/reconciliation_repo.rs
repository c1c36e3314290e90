//! 对账记录仓储（PostgreSQL）

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;

use super::traits::ReconciliationRepositoryTrait;
use crate::error::Result;
use crate::models::{NewReconciliation, ReconciliationRecord, ReconciliationStatus};

pub struct ReconciliationRepository {
    pool: PgPool,
}

impl ReconciliationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, user_id, external_id, direction, amount, external_amount, kind,
           request_id, detail, status, created_at, resolved_at, resolution_note
    FROM points_reconciliations
"#;

#[async_trait]
impl ReconciliationRepositoryTrait for ReconciliationRepository {
    #[instrument(skip(self, record), fields(user_id = %record.user_id, kind = record.kind.as_str()))]
    async fn create(&self, record: &NewReconciliation) -> Result<i64> {
        // 冲突时空更新一次，使 RETURNING 带回已有记录的 id
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO points_reconciliations
                (user_id, external_id, direction, amount, external_amount, kind,
                 request_id, detail, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (request_id, kind) DO UPDATE SET request_id = EXCLUDED.request_id
            RETURNING id
            "#,
        )
        .bind(&record.user_id)
        .bind(&record.external_id)
        .bind(record.direction)
        .bind(record.amount)
        .bind(record.external_amount)
        .bind(record.kind)
        .bind(&record.request_id)
        .bind(&record.detail)
        .bind(ReconciliationStatus::Pending)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn get(&self, id: i64) -> Result<Option<ReconciliationRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = $1");
        let record = sqlx::query_as::<_, ReconciliationRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn list_pending(&self, limit: i64) -> Result<Vec<ReconciliationRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE status = $1 ORDER BY created_at ASC, id ASC LIMIT $2");
        let records = sqlx::query_as::<_, ReconciliationRecord>(&sql)
            .bind(ReconciliationStatus::Pending)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    #[instrument(skip(self, note))]
    async fn resolve(&self, id: i64, note: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE points_reconciliations
            SET status = $2, resolved_at = NOW(), resolution_note = $3
            WHERE id = $1 AND status = $4
            "#,
        )
        .bind(id)
        .bind(ReconciliationStatus::Resolved)
        .bind(note)
        .bind(ReconciliationStatus::Pending)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

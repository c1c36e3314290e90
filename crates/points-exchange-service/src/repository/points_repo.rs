//! 石榴点账本仓储（PostgreSQL）
//!
//! 余额行与流水在同一事务内写入，通过 `SELECT .. FOR UPDATE` 对单个用户串行化。

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, instrument};

use super::traits::PointsLedgerRepositoryTrait;
use crate::error::{ExchangeError, Result};
use crate::models::{PointsChangeType, PointsLogEntry, round_points};

pub struct PointsLedgerRepository {
    pool: PgPool,
}

impl PointsLedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 确保账户存在，并发创建只会成功一次
    async fn ensure_account(conn: &mut PgConnection, user_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_points (user_id, points, created_at, updated_at)
            VALUES ($1, 0, NOW(), NOW())
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// 在事务中追加流水
    ///
    /// created_at 取 clock_timestamp()：行锁获取之后的真实时间，保证同一用户的流水时间单调。
    async fn create_log_in_tx(
        conn: &mut PgConnection,
        user_id: &str,
        amount: Decimal,
        balance_after: Decimal,
        change_type: PointsChangeType,
        request_id: &str,
        reason: &str,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO points_log
                (user_id, amount, balance_after, change_type, request_id, reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, clock_timestamp())
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(balance_after)
        .bind(change_type)
        .bind(request_id)
        .bind(reason)
        .fetch_one(conn)
        .await?;
        Ok(id)
    }

    /// 查找已提交的同请求流水，调用方须已持有该用户的行锁
    async fn find_applied_in_tx(
        conn: &mut PgConnection,
        user_id: &str,
        change_type: PointsChangeType,
        request_id: &str,
    ) -> Result<Option<Decimal>> {
        let balance_after: Option<Decimal> = sqlx::query_scalar(
            r#"
            SELECT balance_after FROM points_log
            WHERE user_id = $1 AND change_type = $2 AND request_id = $3
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(change_type)
        .bind(request_id)
        .fetch_optional(conn)
        .await?;
        Ok(balance_after)
    }
}

#[async_trait]
impl PointsLedgerRepositoryTrait for PointsLedgerRepository {
    #[instrument(skip(self))]
    async fn get_or_create(&self, user_id: &str) -> Result<Decimal> {
        let mut conn = self.pool.acquire().await?;
        Self::ensure_account(&mut conn, user_id).await?;

        let points: Decimal =
            sqlx::query_scalar("SELECT points FROM user_points WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&mut *conn)
                .await?;
        Ok(points)
    }

    #[instrument(skip(self, reason), fields(change_type = %change_type))]
    async fn apply_delta(
        &self,
        user_id: &str,
        amount: Decimal,
        change_type: PointsChangeType,
        request_id: &str,
        reason: &str,
    ) -> Result<Decimal> {
        let amount = round_points(amount);
        let mut tx = self.pool.begin().await?;

        Self::ensure_account(&mut tx, user_id).await?;

        let current: Decimal = sqlx::query_scalar(
            "SELECT points FROM user_points WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

        // 上次提交已落库但调用方未收到结果时，重试走这里
        if let Some(balance_after) =
            Self::find_applied_in_tx(&mut tx, user_id, change_type, request_id).await?
        {
            tx.rollback().await?;
            debug!(request_id, %balance_after, "石榴点变更已记账，跳过重复请求");
            return Ok(balance_after);
        }

        let new_balance = current + amount;
        if new_balance < Decimal::ZERO {
            tx.rollback().await?;
            return Err(ExchangeError::InsufficientLocalBalance {
                required: -amount,
                available: current,
            });
        }

        sqlx::query(
            "UPDATE user_points SET points = $2, updated_at = clock_timestamp() WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(new_balance)
        .execute(&mut *tx)
        .await?;

        let log_id = Self::create_log_in_tx(
            &mut tx,
            user_id,
            amount,
            new_balance,
            change_type,
            request_id,
            reason,
        )
        .await?;

        tx.commit().await?;

        debug!(log_id, %amount, %new_balance, "石榴点变更已提交");
        Ok(new_balance)
    }

    #[instrument(skip(self))]
    async fn list_logs(&self, user_id: &str, limit: i64) -> Result<Vec<PointsLogEntry>> {
        let logs = sqlx::query_as::<_, PointsLogEntry>(
            r#"
            SELECT id, user_id, amount, balance_after, change_type, request_id, reason, created_at
            FROM points_log
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }
}

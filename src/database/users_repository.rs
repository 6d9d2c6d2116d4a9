use crate::database::error::{DatabaseError, DatabaseErrorKind, DbResult};
use crate::database::job_flags;
use crate::database::models::{
    CoinLedgerEntry, CoinLot, IssuanceStatus, JobEntity, JobState, LedgerStatus, PendingIssuance,
    UserProfile,
};
use crate::database::store::{UsersStore, UsersTx};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

const LOT_COLUMNS: &str = "id, user_id, amount, remaining, source_type, expires_at, created_at";

const LEDGER_COLUMNS: &str =
    "id, user_id, direction, status, reference_id, coins, reason, metadata, created_at";

const ISSUANCE_COLUMNS: &str = "id, user_id, source_type, source_id, source_user_id, \
     coins_to_issue, issue_at, issue, status, created_at";

/// PostgreSQL users scope
#[derive(Clone)]
pub struct PgUsersStore {
    pool: PgPool,
}

impl PgUsersStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsersStore for PgUsersStore {
    async fn begin(&self) -> DbResult<Box<dyn UsersTx>> {
        let tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;
        Ok(Box::new(PgUsersTx { tx }))
    }
}

pub struct PgUsersTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UsersTx for PgUsersTx {
    async fn lock_wallet(&mut self, user_id: Uuid) -> DbResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(user_id.to_string())
            .execute(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }

    async fn lots_for_user(&mut self, user_id: Uuid) -> DbResult<Vec<CoinLot>> {
        let sql = format!(
            "SELECT {} FROM coin_lots WHERE user_id = $1
             ORDER BY expires_at, created_at, id
             FOR UPDATE",
            LOT_COLUMNS
        );
        sqlx::query_as::<_, CoinLot>(&sql)
            .bind(user_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn update_lot_remaining(&mut self, lot_id: Uuid, remaining: i64) -> DbResult<()> {
        let result = sqlx::query("UPDATE coin_lots SET remaining = $2 WHERE id = $1")
            .bind(lot_id)
            .bind(remaining)
            .execute(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::not_found("coin_lot", lot_id));
        }
        Ok(())
    }

    async fn insert_lot(&mut self, lot: &CoinLot) -> DbResult<()> {
        let sql = format!(
            "INSERT INTO coin_lots ({}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            LOT_COLUMNS
        );
        sqlx::query(&sql)
            .bind(lot.id)
            .bind(lot.user_id)
            .bind(lot.amount)
            .bind(lot.remaining)
            .bind(lot.source_type.as_str())
            .bind(lot.expires_at)
            .bind(lot.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }

    async fn insert_ledger_entry(&mut self, entry: &CoinLedgerEntry) -> DbResult<()> {
        let sql = format!(
            "INSERT INTO coin_ledger_entries ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            LEDGER_COLUMNS
        );
        sqlx::query(&sql)
            .bind(entry.id)
            .bind(entry.user_id)
            .bind(entry.direction.as_str())
            .bind(entry.status.as_str())
            .bind(entry.reference_id)
            .bind(entry.coins)
            .bind(&entry.reason)
            .bind(&entry.metadata)
            .bind(entry.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }

    async fn ledger_entries_for_reference(
        &mut self,
        user_id: Uuid,
        reference_id: Uuid,
    ) -> DbResult<Vec<CoinLedgerEntry>> {
        let sql = format!(
            "SELECT {} FROM coin_ledger_entries
             WHERE user_id = $1 AND reference_id = $2
             ORDER BY created_at, id
             FOR UPDATE",
            LEDGER_COLUMNS
        );
        sqlx::query_as::<_, CoinLedgerEntry>(&sql)
            .bind(user_id)
            .bind(reference_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn set_ledger_status(&mut self, entry_id: Uuid, status: LedgerStatus) -> DbResult<()> {
        sqlx::query("UPDATE coin_ledger_entries SET status = $2 WHERE id = $1")
            .bind(entry_id)
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }

    async fn coins_used_since(
        &mut self,
        user_id: Uuid,
        since: DateTime<Utc>,
        category: Option<&str>,
    ) -> DbResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(GREATEST(u.coins - COALESCE(r.coins, 0), 0)), 0)::BIGINT
             FROM coin_ledger_entries u
             LEFT JOIN (
                 SELECT reference_id, SUM(coins) AS coins FROM coin_ledger_entries
                 WHERE user_id = $1 AND direction = 'refund' AND status = 'issued'
                 GROUP BY reference_id
             ) r ON r.reference_id = u.reference_id
             WHERE u.user_id = $1
               AND u.direction = 'used'
               AND u.status IN ('pending', 'issued')
               AND u.created_at >= $2
               AND ($3::TEXT IS NULL OR u.metadata->>'category' = $3)",
        )
        .bind(user_id)
        .bind(since)
        .bind(category)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn find_profile(&mut self, user_id: Uuid) -> DbResult<Option<UserProfile>> {
        sqlx::query_as::<_, UserProfile>("SELECT id, referred_by FROM user_profiles WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn insert_pending_issuance(&mut self, issuance: &PendingIssuance) -> DbResult<()> {
        let sql = format!(
            "INSERT INTO pending_issuances ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            ISSUANCE_COLUMNS
        );
        sqlx::query(&sql)
            .bind(issuance.id)
            .bind(issuance.user_id)
            .bind(issuance.source_type.as_str())
            .bind(issuance.source_id)
            .bind(issuance.source_user_id)
            .bind(issuance.coins_to_issue)
            .bind(issuance.issue_at)
            .bind(issuance.issue)
            .bind(issuance.status.as_str())
            .bind(issuance.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }

    async fn referral_issuance_exists(&mut self, source_user_id: Uuid) -> DbResult<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (
                SELECT 1 FROM pending_issuances
                WHERE source_user_id = $1 AND source_type = 'referral' AND status <> 'cancelled'
             )",
        )
        .bind(source_user_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn issuances_for_source(&mut self, source_id: Uuid) -> DbResult<Vec<PendingIssuance>> {
        let sql = format!(
            "SELECT {} FROM pending_issuances WHERE source_id = $1 FOR UPDATE",
            ISSUANCE_COLUMNS
        );
        sqlx::query_as::<_, PendingIssuance>(&sql)
            .bind(source_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn set_issuance_state(
        &mut self,
        issuance_id: Uuid,
        issue: bool,
        status: IssuanceStatus,
    ) -> DbResult<()> {
        sqlx::query("UPDATE pending_issuances SET issue = $2, status = $3 WHERE id = $1")
            .bind(issuance_id)
            .bind(issue)
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }

    async fn lock_due_issuances(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<PendingIssuance>> {
        let sql = format!(
            "SELECT {} FROM pending_issuances
             WHERE issue = TRUE AND status = 'pending' AND issue_at <= $1
             ORDER BY issue_at
             LIMIT $2
             FOR UPDATE SKIP LOCKED",
            ISSUANCE_COLUMNS
        );
        sqlx::query_as::<_, PendingIssuance>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn count_armed_issuances(&mut self) -> DbResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*)::BIGINT FROM pending_issuances
             WHERE issue = TRUE AND status = 'pending'",
        )
        .fetch_one(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn job_state(&mut self, entity: JobEntity) -> DbResult<JobState> {
        let state = sqlx::query_as::<_, JobState>(
            "SELECT entity, active, last_run FROM job_state WHERE entity = $1",
        )
        .bind(entity.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(state.unwrap_or_else(|| JobState::inactive(entity)))
    }

    async fn mark_job_active(&mut self, entity: JobEntity) -> DbResult<()> {
        job_flags::mark_active(&mut self.tx, entity).await
    }

    async fn lock_job(&mut self, entity: JobEntity) -> DbResult<JobState> {
        job_flags::lock(&mut self.tx, entity).await
    }

    async fn finish_job_run(
        &mut self,
        entity: JobEntity,
        ran_at: DateTime<Utc>,
        still_active: bool,
    ) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO job_state (entity, active, last_run) VALUES ($1, $2, $3)
             ON CONFLICT (entity) DO UPDATE SET active = $2, last_run = $3",
        )
        .bind(entity.as_str())
        .bind(still_active)
        .bind(ran_at)
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        self.tx.commit().await.map_err(|e| {
            DatabaseError::new(DatabaseErrorKind::CommitFailed {
                message: e.to_string(),
            })
        })
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        self.tx.rollback().await.map_err(DatabaseError::from_sqlx)
    }
}

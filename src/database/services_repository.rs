use crate::database::error::{DatabaseError, DatabaseErrorKind, DbResult};
use crate::database::job_flags;
use crate::database::models::{
    HoldStatus, InventoryHold, InventoryUnit, JobEntity, JobState, Offer, RateOverride,
    Reservation,
};
use crate::database::store::{ServicesStore, ServicesTx};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

const UNIT_COLUMNS: &str = "id, product_id, product_type, capacity, base_rate, extra_adult_rate, \
     child_rate, included_occupants, cancellation_policy";

const HOLD_COLUMNS: &str =
    "id, product_id, unit_id, start_date, end_date, quantity, status, reservation_id, created_at";

const RESERVATION_COLUMNS: &str = "id, user_id, product_type, product_id, unit_id, start_date, \
     end_date, quantity, adults, children, base, extras, discount, coins_applied, \
     coins_discount_value, service_fee, gst_amount, total_payable, offer_code, payment_status, \
     booking_status, gateway_order_id, transaction_ref, refund_amount, refund_ref, refund_pct, \
     created_at, updated_at";

/// PostgreSQL services scope
#[derive(Clone)]
pub struct PgServicesStore {
    pool: PgPool,
}

impl PgServicesStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ServicesStore for PgServicesStore {
    async fn begin(&self) -> DbResult<Box<dyn ServicesTx>> {
        let tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;
        Ok(Box::new(PgServicesTx { tx }))
    }
}

pub struct PgServicesTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ServicesTx for PgServicesTx {
    async fn lock_unit(&mut self, unit_id: Uuid) -> DbResult<Option<InventoryUnit>> {
        let sql = format!(
            "SELECT {} FROM inventory_units WHERE id = $1 FOR UPDATE",
            UNIT_COLUMNS
        );
        sqlx::query_as::<_, InventoryUnit>(&sql)
            .bind(unit_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn held_quantity(
        &mut self,
        unit_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
        exclude_hold: Option<Uuid>,
    ) -> DbResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(quantity), 0)::BIGINT FROM inventory_holds
             WHERE unit_id = $1
               AND status IN ('pending', 'confirmed')
               AND start_date < $3
               AND end_date > $2
               AND ($4::UUID IS NULL OR id <> $4)",
        )
        .bind(unit_id)
        .bind(start)
        .bind(end)
        .bind(exclude_hold)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn insert_hold(&mut self, hold: &InventoryHold) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO inventory_holds
             (id, product_id, unit_id, start_date, end_date, quantity, status, reservation_id, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(hold.id)
        .bind(hold.product_id)
        .bind(hold.unit_id)
        .bind(hold.start_date)
        .bind(hold.end_date)
        .bind(hold.quantity)
        .bind(hold.status.as_str())
        .bind(hold.reservation_id)
        .bind(hold.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }

    async fn find_hold_by_reservation(
        &mut self,
        reservation_id: Uuid,
    ) -> DbResult<Option<InventoryHold>> {
        let sql = format!(
            "SELECT {} FROM inventory_holds WHERE reservation_id = $1 FOR UPDATE",
            HOLD_COLUMNS
        );
        sqlx::query_as::<_, InventoryHold>(&sql)
            .bind(reservation_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn set_hold_status(&mut self, hold_id: Uuid, status: HoldStatus) -> DbResult<()> {
        let result = sqlx::query("UPDATE inventory_holds SET status = $2 WHERE id = $1")
            .bind(hold_id)
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::not_found("inventory_hold", hold_id));
        }
        Ok(())
    }

    async fn lock_stale_reservations(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Reservation>> {
        let sql = format!(
            "SELECT {} FROM reservations
             WHERE id IN (
                 SELECT reservation_id FROM inventory_holds
                 WHERE status = 'pending' AND created_at < $1
                 ORDER BY created_at
                 LIMIT $2
             )
             ORDER BY unit_id, id
             FOR UPDATE SKIP LOCKED",
            RESERVATION_COLUMNS
        );
        sqlx::query_as::<_, Reservation>(&sql)
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn count_pending_holds(&mut self) -> DbResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*)::BIGINT FROM inventory_holds WHERE status = 'pending'",
        )
        .fetch_one(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn rate_overrides(
        &mut self,
        unit_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> DbResult<Vec<RateOverride>> {
        sqlx::query_as::<_, RateOverride>(
            "SELECT unit_id, date, rate FROM rate_overrides
             WHERE unit_id = $1 AND date >= $2 AND date < $3
             ORDER BY date",
        )
        .bind(unit_id)
        .bind(from)
        .bind(to)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn find_offer(&mut self, code: &str) -> DbResult<Option<Offer>> {
        sqlx::query_as::<_, Offer>(
            "SELECT id, code, status, discount_pct, booking_window_start, booking_window_end,
                    stay_start, stay_end, entity_ids
             FROM offers WHERE LOWER(code) = LOWER($1)",
        )
        .bind(code.trim())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn insert_reservation(&mut self, r: &Reservation) -> DbResult<()> {
        let sql = format!(
            "INSERT INTO reservations ({}) VALUES
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
              $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28)",
            RESERVATION_COLUMNS
        );
        sqlx::query(&sql)
            .bind(r.id)
            .bind(r.user_id)
            .bind(r.product_type.as_str())
            .bind(r.product_id)
            .bind(r.unit_id)
            .bind(r.start_date)
            .bind(r.end_date)
            .bind(r.quantity)
            .bind(r.adults)
            .bind(r.children)
            .bind(r.amount.base)
            .bind(r.amount.extras)
            .bind(r.amount.discount)
            .bind(r.amount.coins_applied)
            .bind(r.amount.coins_discount_value)
            .bind(r.amount.service_fee)
            .bind(r.amount.gst_amount)
            .bind(r.amount.total_payable)
            .bind(r.offer_code.as_deref())
            .bind(r.payment_status.as_str())
            .bind(r.booking_status.as_str())
            .bind(r.gateway_order_id.as_deref())
            .bind(r.transaction_ref.as_deref())
            .bind(r.refund_amount)
            .bind(r.refund_ref.as_deref())
            .bind(r.refund_pct)
            .bind(r.created_at)
            .bind(r.updated_at)
            .execute(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }

    async fn lock_reservation(&mut self, reservation_id: Uuid) -> DbResult<Option<Reservation>> {
        let sql = format!(
            "SELECT {} FROM reservations WHERE id = $1 FOR UPDATE",
            RESERVATION_COLUMNS
        );
        sqlx::query_as::<_, Reservation>(&sql)
            .bind(reservation_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn lock_reservation_by_order(
        &mut self,
        order_id: &str,
    ) -> DbResult<Option<Reservation>> {
        let sql = format!(
            "SELECT {} FROM reservations WHERE gateway_order_id = $1 FOR UPDATE",
            RESERVATION_COLUMNS
        );
        sqlx::query_as::<_, Reservation>(&sql)
            .bind(order_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn update_reservation(&mut self, r: &Reservation) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE reservations
             SET payment_status = $2, booking_status = $3, gateway_order_id = $4,
                 transaction_ref = $5, refund_amount = $6, refund_ref = $7, refund_pct = $8,
                 updated_at = $9
             WHERE id = $1",
        )
        .bind(r.id)
        .bind(r.payment_status.as_str())
        .bind(r.booking_status.as_str())
        .bind(r.gateway_order_id.as_deref())
        .bind(r.transaction_ref.as_deref())
        .bind(r.refund_amount)
        .bind(r.refund_ref.as_deref())
        .bind(r.refund_pct)
        .bind(r.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::not_found("reservation", r.id));
        }
        Ok(())
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

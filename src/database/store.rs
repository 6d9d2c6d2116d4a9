//! Transactional scope seams
//!
//! The engine talks to two independently transactional stores. Each store
//! hands out a transaction object; dropping it without `commit` rolls back.
//! Coordinators always open the services scope before the users scope.
//!
//! Within the services scope rows are locked reservation first, then unit,
//! then hold.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use super::error::DbResult;
use super::models::{
    CoinLedgerEntry, CoinLot, HoldStatus, InventoryHold, InventoryUnit, IssuanceStatus, JobEntity,
    JobState, LedgerStatus, Offer, PendingIssuance, RateOverride, Reservation, UserProfile,
};

/// Services scope: reservations, inventory and offers
#[async_trait]
pub trait ServicesStore: Send + Sync {
    async fn begin(&self) -> DbResult<Box<dyn ServicesTx>>;
}

#[async_trait]
pub trait ServicesTx: Send {
    /// Lock the unit row for the rest of the transaction
    async fn lock_unit(&mut self, unit_id: Uuid) -> DbResult<Option<InventoryUnit>>;

    /// Sum of quantities of pending or confirmed holds on `unit_id` that
    /// overlap `[start, end)`, optionally ignoring one hold
    async fn held_quantity(
        &mut self,
        unit_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
        exclude_hold: Option<Uuid>,
    ) -> DbResult<i64>;

    async fn insert_hold(&mut self, hold: &InventoryHold) -> DbResult<()>;

    async fn find_hold_by_reservation(
        &mut self,
        reservation_id: Uuid,
    ) -> DbResult<Option<InventoryHold>>;

    async fn set_hold_status(&mut self, hold_id: Uuid, status: HoldStatus) -> DbResult<()>;

    /// Reservations owning a pending hold created before `cutoff`, locked in
    /// unit order and skipping rows other transactions hold. Their holds are
    /// not locked.
    async fn lock_stale_reservations(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Reservation>>;

    async fn count_pending_holds(&mut self) -> DbResult<i64>;

    /// Overrides for dates in `[from, to)`
    async fn rate_overrides(
        &mut self,
        unit_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> DbResult<Vec<RateOverride>>;

    /// Case-insensitive lookup by code
    async fn find_offer(&mut self, code: &str) -> DbResult<Option<Offer>>;

    async fn insert_reservation(&mut self, reservation: &Reservation) -> DbResult<()>;

    async fn lock_reservation(&mut self, reservation_id: Uuid) -> DbResult<Option<Reservation>>;

    async fn lock_reservation_by_order(&mut self, order_id: &str)
        -> DbResult<Option<Reservation>>;

    async fn update_reservation(&mut self, reservation: &Reservation) -> DbResult<()>;

    async fn job_state(&mut self, entity: JobEntity) -> DbResult<JobState>;

    /// Raise the flag. Writes only when it is down; otherwise takes a shared
    /// lock so a sweep cannot lower it before this transaction ends.
    async fn mark_job_active(&mut self, entity: JobEntity) -> DbResult<()>;

    /// Exclusive lock on the flag row; sweeps take it before counting what is left
    async fn lock_job(&mut self, entity: JobEntity) -> DbResult<JobState>;

    async fn finish_job_run(
        &mut self,
        entity: JobEntity,
        ran_at: DateTime<Utc>,
        still_active: bool,
    ) -> DbResult<()>;

    async fn commit(self: Box<Self>) -> DbResult<()>;

    async fn rollback(self: Box<Self>) -> DbResult<()>;
}

/// Users scope: coin wallet, ledger, deferred rewards and profiles
#[async_trait]
pub trait UsersStore: Send + Sync {
    async fn begin(&self) -> DbResult<Box<dyn UsersTx>>;
}

#[async_trait]
pub trait UsersTx: Send {
    /// Serialize wallet mutations for one user until the transaction ends
    async fn lock_wallet(&mut self, user_id: Uuid) -> DbResult<()>;

    /// Every lot of the user ordered by expiry, then creation, then id
    async fn lots_for_user(&mut self, user_id: Uuid) -> DbResult<Vec<CoinLot>>;

    async fn update_lot_remaining(&mut self, lot_id: Uuid, remaining: i64) -> DbResult<()>;

    async fn insert_lot(&mut self, lot: &CoinLot) -> DbResult<()>;

    async fn insert_ledger_entry(&mut self, entry: &CoinLedgerEntry) -> DbResult<()>;

    async fn ledger_entries_for_reference(
        &mut self,
        user_id: Uuid,
        reference_id: Uuid,
    ) -> DbResult<Vec<CoinLedgerEntry>>;

    async fn set_ledger_status(&mut self, entry_id: Uuid, status: LedgerStatus) -> DbResult<()>;

    /// Coins in `used` entries (pending or issued) created at or after `since`,
    /// restricted to one category when given, net of issued `refund` entries
    /// referencing the same reservation
    async fn coins_used_since(
        &mut self,
        user_id: Uuid,
        since: DateTime<Utc>,
        category: Option<&str>,
    ) -> DbResult<i64>;

    async fn find_profile(&mut self, user_id: Uuid) -> DbResult<Option<UserProfile>>;

    async fn insert_pending_issuance(&mut self, issuance: &PendingIssuance) -> DbResult<()>;

    /// Whether a non-cancelled referral reward already exists for the referred user
    async fn referral_issuance_exists(&mut self, source_user_id: Uuid) -> DbResult<bool>;

    async fn issuances_for_source(&mut self, source_id: Uuid) -> DbResult<Vec<PendingIssuance>>;

    async fn set_issuance_state(
        &mut self,
        issuance_id: Uuid,
        issue: bool,
        status: IssuanceStatus,
    ) -> DbResult<()>;

    /// Armed pending rows with `issue_at <= now`, locked and skipping rows
    /// other transactions hold
    async fn lock_due_issuances(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<PendingIssuance>>;

    /// Armed rows still waiting for promotion
    async fn count_armed_issuances(&mut self) -> DbResult<i64>;

    async fn job_state(&mut self, entity: JobEntity) -> DbResult<JobState>;

    /// Raise the flag. Writes only when it is down; otherwise takes a shared
    /// lock so a sweep cannot lower it before this transaction ends.
    async fn mark_job_active(&mut self, entity: JobEntity) -> DbResult<()>;

    /// Exclusive lock on the flag row; sweeps take it before counting what is left
    async fn lock_job(&mut self, entity: JobEntity) -> DbResult<JobState>;

    async fn finish_job_run(
        &mut self,
        entity: JobEntity,
        ran_at: DateTime<Utc>,
        still_active: bool,
    ) -> DbResult<()>;

    async fn commit(self: Box<Self>) -> DbResult<()>;

    async fn rollback(self: Box<Self>) -> DbResult<()>;
}

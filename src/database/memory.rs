//! In-process stores
//!
//! A transaction holds the scope's mutex for its whole lifetime and works on a
//! private copy of the state; `commit` writes the copy back and dropping the
//! transaction discards it. Transactions within one scope are therefore
//! serializable, which stands in for the row locks the PostgreSQL stores take.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::error::{DatabaseError, DatabaseErrorKind, DbResult};
use super::models::{
    CoinLedgerEntry, CoinLot, HoldStatus, InventoryHold, InventoryUnit, IssuanceStatus, JobEntity,
    JobState, LedgerDirection, LedgerStatus, Offer, PendingIssuance, RateOverride, Reservation,
    UserProfile,
};
use super::store::{ServicesStore, ServicesTx, UsersStore, UsersTx};

fn commit_failure() -> DatabaseError {
    DatabaseError::new(DatabaseErrorKind::CommitFailed {
        message: "injected commit failure".to_string(),
    })
}

/// Counts commits down to an injected failure; zero means disarmed
#[derive(Clone, Default)]
struct CommitFault(Arc<AtomicUsize>);

impl CommitFault {
    fn arm(&self, nth: usize) {
        self.0.store(nth, Ordering::SeqCst);
    }

    /// Whether this commit is the one that fails
    fn trips(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|before| before == 1)
            .unwrap_or(false)
    }
}

// =============================================================================
// Services scope
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct ServicesState {
    pub units: HashMap<Uuid, InventoryUnit>,
    pub rate_overrides: Vec<RateOverride>,
    pub offers: Vec<Offer>,
    pub holds: Vec<InventoryHold>,
    pub reservations: HashMap<Uuid, Reservation>,
    pub jobs: HashMap<JobEntity, JobState>,
}

#[derive(Clone, Default)]
pub struct MemoryServicesStore {
    state: Arc<Mutex<ServicesState>>,
    commit_fault: CommitFault,
}

impl MemoryServicesStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_unit(&self, unit: InventoryUnit) {
        self.state.lock().await.units.insert(unit.id, unit);
    }

    pub async fn seed_rate_override(&self, rate: RateOverride) {
        self.state.lock().await.rate_overrides.push(rate);
    }

    pub async fn seed_offer(&self, offer: Offer) {
        self.state.lock().await.offers.push(offer);
    }

    /// Make the next commit in this scope fail
    pub fn fail_next_commit(&self) {
        self.fail_commit_in(1);
    }

    /// Make the `nth` commit from now fail, counting only commits
    pub fn fail_commit_in(&self, nth: usize) {
        self.commit_fault.arm(nth);
    }

    pub async fn snapshot(&self) -> ServicesState {
        self.state.lock().await.clone()
    }

    pub async fn reservation(&self, reservation_id: Uuid) -> Option<Reservation> {
        self.state
            .lock()
            .await
            .reservations
            .get(&reservation_id)
            .cloned()
    }

    pub async fn hold_for(&self, reservation_id: Uuid) -> Option<InventoryHold> {
        self.state
            .lock()
            .await
            .holds
            .iter()
            .find(|h| h.reservation_id == reservation_id)
            .cloned()
    }

    pub async fn job(&self, entity: JobEntity) -> JobState {
        self.state
            .lock()
            .await
            .jobs
            .get(&entity)
            .cloned()
            .unwrap_or_else(|| JobState::inactive(entity))
    }
}

#[async_trait]
impl ServicesStore for MemoryServicesStore {
    async fn begin(&self) -> DbResult<Box<dyn ServicesTx>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryServicesTx {
            guard,
            working,
            fail_commit: self.commit_fault.clone(),
        }))
    }
}

pub struct MemoryServicesTx {
    guard: OwnedMutexGuard<ServicesState>,
    working: ServicesState,
    fail_commit: CommitFault,
}

#[async_trait]
impl ServicesTx for MemoryServicesTx {
    async fn lock_unit(&mut self, unit_id: Uuid) -> DbResult<Option<InventoryUnit>> {
        Ok(self.working.units.get(&unit_id).cloned())
    }

    async fn held_quantity(
        &mut self,
        unit_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
        exclude_hold: Option<Uuid>,
    ) -> DbResult<i64> {
        Ok(self
            .working
            .holds
            .iter()
            .filter(|h| h.unit_id == unit_id && h.is_live())
            .filter(|h| Some(h.id) != exclude_hold)
            .filter(|h| h.start_date < end && h.end_date > start)
            .map(|h| i64::from(h.quantity))
            .sum())
    }

    async fn insert_hold(&mut self, hold: &InventoryHold) -> DbResult<()> {
        self.working.holds.push(hold.clone());
        Ok(())
    }

    async fn find_hold_by_reservation(
        &mut self,
        reservation_id: Uuid,
    ) -> DbResult<Option<InventoryHold>> {
        Ok(self
            .working
            .holds
            .iter()
            .find(|h| h.reservation_id == reservation_id)
            .cloned())
    }

    async fn set_hold_status(&mut self, hold_id: Uuid, status: HoldStatus) -> DbResult<()> {
        let hold = self
            .working
            .holds
            .iter_mut()
            .find(|h| h.id == hold_id)
            .ok_or_else(|| DatabaseError::not_found("inventory_hold", hold_id))?;
        hold.status = status;
        Ok(())
    }

    async fn lock_stale_reservations(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Reservation>> {
        let mut stale: Vec<&InventoryHold> = self
            .working
            .holds
            .iter()
            .filter(|h| h.status == HoldStatus::Pending && h.created_at < cutoff)
            .collect();
        stale.sort_by_key(|h| h.created_at);
        stale.truncate(limit.max(0) as usize);

        let mut reservations: Vec<Reservation> = stale
            .into_iter()
            .filter_map(|h| self.working.reservations.get(&h.reservation_id).cloned())
            .collect();
        reservations.sort_by_key(|r| (r.unit_id, r.id));
        Ok(reservations)
    }

    async fn count_pending_holds(&mut self) -> DbResult<i64> {
        Ok(self
            .working
            .holds
            .iter()
            .filter(|h| h.status == HoldStatus::Pending)
            .count() as i64)
    }

    async fn rate_overrides(
        &mut self,
        unit_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> DbResult<Vec<RateOverride>> {
        Ok(self
            .working
            .rate_overrides
            .iter()
            .filter(|r| r.unit_id == unit_id && r.date >= from && r.date < to)
            .cloned()
            .collect())
    }

    async fn find_offer(&mut self, code: &str) -> DbResult<Option<Offer>> {
        Ok(self
            .working
            .offers
            .iter()
            .find(|o| o.code.eq_ignore_ascii_case(code.trim()))
            .cloned())
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> DbResult<()> {
        self.working
            .reservations
            .insert(reservation.id, reservation.clone());
        Ok(())
    }

    async fn lock_reservation(&mut self, reservation_id: Uuid) -> DbResult<Option<Reservation>> {
        Ok(self.working.reservations.get(&reservation_id).cloned())
    }

    async fn lock_reservation_by_order(
        &mut self,
        order_id: &str,
    ) -> DbResult<Option<Reservation>> {
        Ok(self
            .working
            .reservations
            .values()
            .find(|r| r.gateway_order_id.as_deref() == Some(order_id))
            .cloned())
    }

    async fn update_reservation(&mut self, reservation: &Reservation) -> DbResult<()> {
        match self.working.reservations.get_mut(&reservation.id) {
            Some(existing) => {
                *existing = reservation.clone();
                Ok(())
            }
            None => Err(DatabaseError::not_found("reservation", reservation.id)),
        }
    }

    async fn job_state(&mut self, entity: JobEntity) -> DbResult<JobState> {
        Ok(self
            .working
            .jobs
            .get(&entity)
            .cloned()
            .unwrap_or_else(|| JobState::inactive(entity)))
    }

    async fn mark_job_active(&mut self, entity: JobEntity) -> DbResult<()> {
        self.working
            .jobs
            .entry(entity)
            .or_insert_with(|| JobState::inactive(entity))
            .active = true;
        Ok(())
    }

    async fn lock_job(&mut self, entity: JobEntity) -> DbResult<JobState> {
        self.job_state(entity).await
    }

    async fn finish_job_run(
        &mut self,
        entity: JobEntity,
        ran_at: DateTime<Utc>,
        still_active: bool,
    ) -> DbResult<()> {
        let job = self
            .working
            .jobs
            .entry(entity)
            .or_insert_with(|| JobState::inactive(entity));
        job.active = still_active;
        job.last_run = Some(ran_at);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        if self.fail_commit.trips() {
            return Err(commit_failure());
        }
        let MemoryServicesTx {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        Ok(())
    }
}

// =============================================================================
// Users scope
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct UsersState {
    pub lots: Vec<CoinLot>,
    pub ledger: Vec<CoinLedgerEntry>,
    pub issuances: Vec<PendingIssuance>,
    pub profiles: HashMap<Uuid, UserProfile>,
    pub jobs: HashMap<JobEntity, JobState>,
}

#[derive(Clone, Default)]
pub struct MemoryUsersStore {
    state: Arc<Mutex<UsersState>>,
    commit_fault: CommitFault,
}

impl MemoryUsersStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_lot(&self, lot: CoinLot) {
        self.state.lock().await.lots.push(lot);
    }

    pub async fn seed_profile(&self, profile: UserProfile) {
        self.state.lock().await.profiles.insert(profile.id, profile);
    }

    /// Make the next commit in this scope fail
    pub fn fail_next_commit(&self) {
        self.fail_commit_in(1);
    }

    /// Make the `nth` commit from now fail, counting only commits
    pub fn fail_commit_in(&self, nth: usize) {
        self.commit_fault.arm(nth);
    }

    pub async fn snapshot(&self) -> UsersState {
        self.state.lock().await.clone()
    }

    pub async fn lots_of(&self, user_id: Uuid) -> Vec<CoinLot> {
        let mut lots: Vec<CoinLot> = self
            .state
            .lock()
            .await
            .lots
            .iter()
            .filter(|l| l.user_id == user_id)
            .cloned()
            .collect();
        lots.sort_by(|a, b| {
            (a.expires_at, a.created_at, a.id).cmp(&(b.expires_at, b.created_at, b.id))
        });
        lots
    }

    pub async fn ledger_of(&self, user_id: Uuid) -> Vec<CoinLedgerEntry> {
        self.state
            .lock()
            .await
            .ledger
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn issuances(&self) -> Vec<PendingIssuance> {
        self.state.lock().await.issuances.clone()
    }

    pub async fn job(&self, entity: JobEntity) -> JobState {
        self.state
            .lock()
            .await
            .jobs
            .get(&entity)
            .cloned()
            .unwrap_or_else(|| JobState::inactive(entity))
    }
}

#[async_trait]
impl UsersStore for MemoryUsersStore {
    async fn begin(&self) -> DbResult<Box<dyn UsersTx>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryUsersTx {
            guard,
            working,
            fail_commit: self.commit_fault.clone(),
        }))
    }
}

pub struct MemoryUsersTx {
    guard: OwnedMutexGuard<UsersState>,
    working: UsersState,
    fail_commit: CommitFault,
}

#[async_trait]
impl UsersTx for MemoryUsersTx {
    async fn lock_wallet(&mut self, _user_id: Uuid) -> DbResult<()> {
        Ok(())
    }

    async fn lots_for_user(&mut self, user_id: Uuid) -> DbResult<Vec<CoinLot>> {
        let mut lots: Vec<CoinLot> = self
            .working
            .lots
            .iter()
            .filter(|l| l.user_id == user_id)
            .cloned()
            .collect();
        lots.sort_by(|a, b| {
            (a.expires_at, a.created_at, a.id).cmp(&(b.expires_at, b.created_at, b.id))
        });
        Ok(lots)
    }

    async fn update_lot_remaining(&mut self, lot_id: Uuid, remaining: i64) -> DbResult<()> {
        let lot = self
            .working
            .lots
            .iter_mut()
            .find(|l| l.id == lot_id)
            .ok_or_else(|| DatabaseError::not_found("coin_lot", lot_id))?;
        lot.remaining = remaining;
        Ok(())
    }

    async fn insert_lot(&mut self, lot: &CoinLot) -> DbResult<()> {
        self.working.lots.push(lot.clone());
        Ok(())
    }

    async fn insert_ledger_entry(&mut self, entry: &CoinLedgerEntry) -> DbResult<()> {
        self.working.ledger.push(entry.clone());
        Ok(())
    }

    async fn ledger_entries_for_reference(
        &mut self,
        user_id: Uuid,
        reference_id: Uuid,
    ) -> DbResult<Vec<CoinLedgerEntry>> {
        Ok(self
            .working
            .ledger
            .iter()
            .filter(|e| e.user_id == user_id && e.reference_id == reference_id)
            .cloned()
            .collect())
    }

    async fn set_ledger_status(&mut self, entry_id: Uuid, status: LedgerStatus) -> DbResult<()> {
        let entry = self
            .working
            .ledger
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| DatabaseError::not_found("coin_ledger_entry", entry_id))?;
        entry.status = status;
        Ok(())
    }

    async fn coins_used_since(
        &mut self,
        user_id: Uuid,
        since: DateTime<Utc>,
        category: Option<&str>,
    ) -> DbResult<i64> {
        Ok(self
            .working
            .ledger
            .iter()
            .filter(|e| e.user_id == user_id && e.direction == LedgerDirection::Used)
            .filter(|e| matches!(e.status, LedgerStatus::Pending | LedgerStatus::Issued))
            .filter(|e| e.created_at >= since)
            .filter(|e| match category {
                Some(category) => e.used_metadata().category == category,
                None => true,
            })
            .map(|spend| {
                let refunded: i64 = self
                    .working
                    .ledger
                    .iter()
                    .filter(|e| e.user_id == user_id && e.reference_id == spend.reference_id)
                    .filter(|e| {
                        e.direction == LedgerDirection::Refund && e.status == LedgerStatus::Issued
                    })
                    .map(|e| e.coins)
                    .sum();
                (spend.coins - refunded).max(0)
            })
            .sum())
    }

    async fn find_profile(&mut self, user_id: Uuid) -> DbResult<Option<UserProfile>> {
        Ok(self.working.profiles.get(&user_id).cloned())
    }

    async fn insert_pending_issuance(&mut self, issuance: &PendingIssuance) -> DbResult<()> {
        self.working.issuances.push(issuance.clone());
        Ok(())
    }

    async fn referral_issuance_exists(&mut self, source_user_id: Uuid) -> DbResult<bool> {
        Ok(self.working.issuances.iter().any(|i| {
            i.source_user_id == source_user_id
                && i.source_type == super::models::LotSource::Referral
                && i.status != IssuanceStatus::Cancelled
        }))
    }

    async fn issuances_for_source(&mut self, source_id: Uuid) -> DbResult<Vec<PendingIssuance>> {
        Ok(self
            .working
            .issuances
            .iter()
            .filter(|i| i.source_id == source_id)
            .cloned()
            .collect())
    }

    async fn set_issuance_state(
        &mut self,
        issuance_id: Uuid,
        issue: bool,
        status: IssuanceStatus,
    ) -> DbResult<()> {
        let issuance = self
            .working
            .issuances
            .iter_mut()
            .find(|i| i.id == issuance_id)
            .ok_or_else(|| DatabaseError::not_found("pending_issuance", issuance_id))?;
        issuance.issue = issue;
        issuance.status = status;
        Ok(())
    }

    async fn lock_due_issuances(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<PendingIssuance>> {
        let mut due: Vec<PendingIssuance> = self
            .working
            .issuances
            .iter()
            .filter(|i| i.issue && i.status == IssuanceStatus::Pending && i.issue_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|i| i.issue_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn count_armed_issuances(&mut self) -> DbResult<i64> {
        Ok(self
            .working
            .issuances
            .iter()
            .filter(|i| i.issue && i.status == IssuanceStatus::Pending)
            .count() as i64)
    }

    async fn job_state(&mut self, entity: JobEntity) -> DbResult<JobState> {
        Ok(self
            .working
            .jobs
            .get(&entity)
            .cloned()
            .unwrap_or_else(|| JobState::inactive(entity)))
    }

    async fn mark_job_active(&mut self, entity: JobEntity) -> DbResult<()> {
        self.working
            .jobs
            .entry(entity)
            .or_insert_with(|| JobState::inactive(entity))
            .active = true;
        Ok(())
    }

    async fn lock_job(&mut self, entity: JobEntity) -> DbResult<JobState> {
        self.job_state(entity).await
    }

    async fn finish_job_run(
        &mut self,
        entity: JobEntity,
        ran_at: DateTime<Utc>,
        still_active: bool,
    ) -> DbResult<()> {
        let job = self
            .working
            .jobs
            .entry(entity)
            .or_insert_with(|| JobState::inactive(entity));
        job.active = still_active;
        job.last_run = Some(ran_at);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        if self.fail_commit.trips() {
            return Err(commit_failure());
        }
        let MemoryUsersTx {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{AmountBreakdown, BookingStatus, PaymentStatus, ProductType};

    fn reservation(id: Uuid, unit_id: Uuid, created_at: DateTime<Utc>) -> Reservation {
        Reservation {
            id,
            user_id: Uuid::new_v4(),
            product_type: ProductType::Lodging,
            product_id: Uuid::new_v4(),
            unit_id,
            start_date: created_at.date_naive(),
            end_date: created_at.date_naive().succ_opt().unwrap(),
            quantity: 1,
            adults: 2,
            children: 0,
            amount: AmountBreakdown::default(),
            offer_code: None,
            payment_status: PaymentStatus::Pending,
            booking_status: BookingStatus::Pending,
            gateway_order_id: None,
            transaction_ref: None,
            refund_amount: None,
            refund_ref: None,
            refund_pct: None,
            created_at,
            updated_at: created_at,
        }
    }

    fn unit() -> InventoryUnit {
        InventoryUnit {
            id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            product_type: ProductType::Lodging,
            capacity: 2,
            base_rate: 1000.into(),
            extra_adult_rate: 0.into(),
            child_rate: 0.into(),
            included_occupants: 2,
            cancellation_policy: "Flexible".to_string(),
        }
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = MemoryServicesStore::new();
        let unit = unit();
        store.seed_unit(unit.clone()).await;

        {
            let mut tx = store.begin().await.unwrap();
            tx.mark_job_active(JobEntity::HoldExpiry).await.unwrap();
        }

        assert!(!store.job(JobEntity::HoldExpiry).await.active);

        let mut tx = store.begin().await.unwrap();
        tx.mark_job_active(JobEntity::HoldExpiry).await.unwrap();
        tx.commit().await.unwrap();
        assert!(store.job(JobEntity::HoldExpiry).await.active);
    }

    #[tokio::test]
    async fn injected_commit_failure_discards_writes_once() {
        let store = MemoryUsersStore::new();
        store.fail_next_commit();

        let mut tx = store.begin().await.unwrap();
        tx.mark_job_active(JobEntity::IssuancePromotion)
            .await
            .unwrap();
        assert!(tx.commit().await.is_err());
        assert!(!store.job(JobEntity::IssuancePromotion).await.active);

        let mut tx = store.begin().await.unwrap();
        tx.mark_job_active(JobEntity::IssuancePromotion)
            .await
            .unwrap();
        assert!(tx.commit().await.is_ok());
        assert!(store.job(JobEntity::IssuancePromotion).await.active);
    }

    #[tokio::test]
    async fn commit_failure_can_target_a_later_commit() {
        let store = MemoryServicesStore::new();
        store.fail_commit_in(2);

        let tx = store.begin().await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.mark_job_active(JobEntity::HoldExpiry).await.unwrap();
        assert!(tx.commit().await.is_ok());

        let mut tx = store.begin().await.unwrap();
        tx.finish_job_run(JobEntity::HoldExpiry, Utc::now(), false)
            .await
            .unwrap();
        assert!(tx.commit().await.is_err());
        assert!(store.job(JobEntity::HoldExpiry).await.active);

        let tx = store.begin().await.unwrap();
        assert!(tx.commit().await.is_ok());
    }

    #[tokio::test]
    async fn stale_reservations_come_back_in_unit_order() {
        let store = MemoryServicesStore::new();
        let now = Utc::now();
        let mut tx = store.begin().await.unwrap();
        let mut unit_ids = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];

        for (age, unit_id) in unit_ids.iter().enumerate() {
            let reservation_id = Uuid::new_v4();
            let created_at = now - chrono::Duration::minutes(30 + age as i64);
            tx.insert_hold(&InventoryHold {
                id: Uuid::new_v4(),
                product_id: Uuid::new_v4(),
                unit_id: *unit_id,
                start_date: now.date_naive(),
                end_date: now.date_naive().succ_opt().unwrap(),
                quantity: 1,
                status: HoldStatus::Pending,
                reservation_id,
                created_at,
            })
            .await
            .unwrap();
            tx.insert_reservation(&reservation(reservation_id, *unit_id, created_at))
                .await
                .unwrap();
        }

        let stale = tx
            .lock_stale_reservations(now - chrono::Duration::minutes(15), 10)
            .await
            .unwrap();
        unit_ids.sort();
        assert_eq!(stale.iter().map(|r| r.unit_id).collect::<Vec<_>>(), unit_ids);

        let oldest_two = tx
            .lock_stale_reservations(now - chrono::Duration::minutes(15), 2)
            .await
            .unwrap();
        assert_eq!(oldest_two.len(), 2);
    }
}

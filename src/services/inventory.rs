//! Inventory holds against finite unit capacity
//!
//! Availability is derived from holds: `capacity - Σ quantity` of pending or
//! confirmed holds overlapping the requested half-open window. Every check
//! locks the unit row first, so the check and the insert that follows it see
//! the same state. Holds are only ever locked after their unit.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::database::models::{
    DateWindow, HoldStatus, InventoryHold, InventoryUnit, JobEntity, Reservation,
};
use crate::database::store::ServicesTx;
use crate::error::{AppError, AppResult, DomainError};

/// Locked unit with its remaining capacity for a window
#[derive(Debug, Clone)]
pub struct Availability {
    pub unit: InventoryUnit,
    pub remaining: i32,
}

#[derive(Debug, Clone)]
pub struct InventoryManager {
    hold_ttl: Duration,
}

impl Default for InventoryManager {
    fn default() -> Self {
        Self::new(Duration::minutes(15))
    }
}

impl InventoryManager {
    pub fn new(hold_ttl: Duration) -> Self {
        Self { hold_ttl }
    }

    /// How long a pending hold may wait for payment
    pub fn hold_ttl(&self) -> Duration {
        self.hold_ttl
    }

    pub async fn check_availability(
        &self,
        tx: &mut dyn ServicesTx,
        product_id: Uuid,
        unit_id: Uuid,
        window: DateWindow,
    ) -> AppResult<Availability> {
        let unit = tx
            .lock_unit(unit_id)
            .await?
            .filter(|unit| unit.product_id == product_id)
            .ok_or_else(|| AppError::domain(DomainError::UnitNotFound { unit_id }))?;

        let held = tx
            .held_quantity(unit_id, window.start, window.end, None)
            .await?;
        let remaining = remaining_capacity(unit.capacity, held);

        debug!(
            unit_id = %unit_id,
            capacity = unit.capacity,
            held,
            remaining,
            "availability checked"
        );

        Ok(Availability { unit, remaining })
    }

    /// Insert a pending hold if `quantity` still fits, re-checked under the unit lock
    #[allow(clippy::too_many_arguments)]
    pub async fn create_hold(
        &self,
        tx: &mut dyn ServicesTx,
        product_id: Uuid,
        unit_id: Uuid,
        window: DateWindow,
        quantity: i32,
        reservation_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<InventoryHold> {
        let availability = self
            .check_availability(tx, product_id, unit_id, window)
            .await?;
        if availability.remaining < quantity {
            return Err(AppError::domain(DomainError::InsufficientInventory {
                requested: quantity,
                remaining: availability.remaining,
            }));
        }

        let hold = InventoryHold {
            id: Uuid::new_v4(),
            product_id,
            unit_id,
            start_date: window.start,
            end_date: window.end,
            quantity,
            status: HoldStatus::Pending,
            reservation_id,
            created_at: now,
        };
        tx.insert_hold(&hold).await?;
        tx.mark_job_active(JobEntity::HoldExpiry).await?;

        info!(
            hold_id = %hold.id,
            reservation_id = %reservation_id,
            unit_id = %unit_id,
            quantity,
            "inventory hold created"
        );

        Ok(hold)
    }

    /// Capacity left for `hold` if it were confirmed now, not counting itself
    pub async fn recheck_for_confirmation(
        &self,
        tx: &mut dyn ServicesTx,
        hold: &InventoryHold,
    ) -> AppResult<i32> {
        let unit = tx.lock_unit(hold.unit_id).await?.ok_or_else(|| {
            AppError::domain(DomainError::UnitNotFound {
                unit_id: hold.unit_id,
            })
        })?;
        let held_by_others = tx
            .held_quantity(hold.unit_id, hold.start_date, hold.end_date, Some(hold.id))
            .await?;

        Ok(remaining_capacity(unit.capacity, held_by_others))
    }

    /// Pending hold → confirmed; other states are left alone
    pub async fn confirm_hold(
        &self,
        tx: &mut dyn ServicesTx,
        reservation_id: Uuid,
    ) -> AppResult<Option<InventoryHold>> {
        let Some(mut hold) = tx.find_hold_by_reservation(reservation_id).await? else {
            return Ok(None);
        };
        if hold.status == HoldStatus::Pending {
            tx.set_hold_status(hold.id, HoldStatus::Confirmed).await?;
            hold.status = HoldStatus::Confirmed;
        }
        Ok(Some(hold))
    }

    /// Lock the reservation's unit, then its hold
    pub async fn lock_hold(
        &self,
        tx: &mut dyn ServicesTx,
        reservation: &Reservation,
    ) -> AppResult<Option<InventoryHold>> {
        tx.lock_unit(reservation.unit_id).await?;
        Ok(tx.find_hold_by_reservation(reservation.id).await?)
    }

    /// Cancel the reservation's hold, returning its quantity to capacity.
    ///
    /// Returns false when there was no live hold.
    pub async fn release_hold(
        &self,
        tx: &mut dyn ServicesTx,
        reservation: &Reservation,
    ) -> AppResult<bool> {
        match self.lock_hold(tx, reservation).await? {
            Some(hold) if hold.is_live() => {
                tx.set_hold_status(hold.id, HoldStatus::Cancelled).await?;
                debug!(hold_id = %hold.id, reservation_id = %reservation.id, "hold released");
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn remaining_capacity(capacity: i32, held: i64) -> i32 {
    let remaining = i64::from(capacity) - held;
    remaining.clamp(0, i64::from(i32::MAX)) as i32
}

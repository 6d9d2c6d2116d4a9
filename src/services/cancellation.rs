//! User-initiated cancellation with tiered refunds

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::pricing::round_currency;
use super::{start_of_day, EngineContext};
use crate::database::models::{BookingStatus, PaymentStatus, Reservation};
use crate::error::{AppError, AppResult, DomainError};

const SECONDS_PER_DAY: i64 = 86_400;

/// Refund tiers: `(min_days_before_start, refund_pct)`, most generous first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationPolicy {
    pub name: String,
    pub tiers: Vec<(i64, u32)>,
}

impl CancellationPolicy {
    pub fn flexible() -> Self {
        Self::new("Flexible", vec![(1, 100)])
    }

    pub fn moderate() -> Self {
        Self::new("Moderate", vec![(5, 100), (1, 50)])
    }

    pub fn strict() -> Self {
        Self::new("Strict", vec![(14, 100), (7, 50)])
    }

    pub fn non_refundable() -> Self {
        Self::new("Non Refundable", Vec::new())
    }

    fn new(name: &str, tiers: Vec<(i64, u32)>) -> Self {
        Self {
            name: name.to_string(),
            tiers,
        }
    }

    /// Preset by name; unknown names get no refund
    pub fn named(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "flexible" => Self::flexible(),
            "moderate" => Self::moderate(),
            "strict" => Self::strict(),
            other => {
                if other != "non refundable" && other != "non_refundable" {
                    warn!(policy = %name, "unknown cancellation policy, treating as non refundable");
                }
                Self::non_refundable()
            }
        }
    }

    /// First tier whose threshold is met, else 0
    pub fn refund_pct(&self, days_before_start: i64) -> u32 {
        self.tiers
            .iter()
            .find(|(min_days, _)| days_before_start >= *min_days)
            .map(|(_, pct)| (*pct).min(100))
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancellationOutcome {
    pub reservation_id: Uuid,
    pub refund_pct: u32,
    pub refund_amount: Decimal,
    pub coins_restored: i64,
    pub refund_ref: Option<String>,
}

/// Whole days between `now` and midnight UTC of the start date, floored
pub fn days_before_start(reservation: &Reservation, now: DateTime<Utc>) -> i64 {
    (start_of_day(reservation.start_date) - now)
        .num_seconds()
        .div_euclid(SECONDS_PER_DAY)
}

/// `round((total_payable - service_fee) × pct / 100)`, never negative
pub fn refund_amount(reservation: &Reservation, refund_pct: u32) -> Decimal {
    let refundable = (reservation.amount.total_payable - reservation.amount.service_fee)
        .max(Decimal::ZERO);
    round_currency(refundable * Decimal::from(refund_pct) / Decimal::ONE_HUNDRED)
}

pub struct CancellationEngine {
    ctx: Arc<EngineContext>,
}

impl CancellationEngine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Cancel a confirmed, paid reservation. The cancellation commits before
    /// the gateway refund is filed; calling again resumes a refund left
    /// `refund_pending`.
    pub async fn cancel(
        &self,
        reservation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<CancellationOutcome> {
        let now = self.ctx.clock.now();
        let mut tx = self.ctx.services.begin().await?;

        let mut reservation = tx
            .lock_reservation(reservation_id)
            .await?
            .filter(|r| r.user_id == user_id)
            .ok_or_else(|| {
                AppError::domain(DomainError::ReservationNotFound {
                    reservation_id: reservation_id.to_string(),
                })
            })?;

        if reservation.is_refund_pending() {
            tx.rollback().await?;
            let refund_pct = reservation
                .refund_pct
                .and_then(|pct| u32::try_from(pct).ok())
                .unwrap_or(0);
            info!(reservation_id = %reservation_id, refund_pct, "resuming pending refund");
            return self.settle(reservation, refund_pct, now).await;
        }

        if reservation.booking_status != BookingStatus::Confirmed
            || reservation.payment_status != PaymentStatus::Paid
        {
            return Err(AppError::domain(DomainError::InvalidReservationState {
                reservation_id,
                booking_status: reservation.booking_status.to_string(),
                payment_status: reservation.payment_status.to_string(),
            }));
        }

        let policy = match tx.lock_unit(reservation.unit_id).await? {
            Some(unit) => CancellationPolicy::named(&unit.cancellation_policy),
            None => CancellationPolicy::non_refundable(),
        };
        let days = days_before_start(&reservation, now);
        let refund_pct = policy.refund_pct(days);
        let amount = refund_amount(&reservation, refund_pct);

        self.ctx
            .inventory
            .release_hold(&mut *tx, &reservation)
            .await?;
        reservation.booking_status = BookingStatus::Cancelled;
        reservation.refund_pct = Some(refund_pct as i32);
        let refund_due = reservation.transaction_ref.is_some() && amount > Decimal::ZERO;
        reservation.payment_status = if refund_due {
            reservation.refund_amount = Some(amount);
            PaymentStatus::RefundPending
        } else if refund_pct > 0 {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::NoRefund
        };
        reservation.updated_at = now;
        tx.update_reservation(&reservation).await?;
        tx.commit().await?;

        info!(
            reservation_id = %reservation_id,
            policy = %policy.name,
            days_before_start = days,
            refund_pct,
            refund_amount = %amount,
            "reservation cancelled"
        );

        self.settle(reservation, refund_pct, now).await
    }

    /// Coins first, then the gateway refund if one is still owed
    async fn settle(
        &self,
        reservation: Reservation,
        refund_pct: u32,
        now: DateTime<Utc>,
    ) -> AppResult<CancellationOutcome> {
        let coins_restored = match self
            .ctx
            .unwind_wallet(reservation.user_id, reservation.id, refund_pct, now)
            .await
        {
            Ok(restored) => restored,
            Err(e) => {
                error!(
                    reservation_id = %reservation.id,
                    error = %e,
                    "PartialCommitInconsistency: reservation cancelled but coins not restored"
                );
                0
            }
        };

        let reservation = if reservation.is_refund_pending() {
            self.ctx.complete_refund(&reservation).await?.0
        } else {
            reservation
        };

        Ok(CancellationOutcome {
            reservation_id: reservation.id,
            refund_pct,
            refund_amount: reservation.refund_amount.unwrap_or(Decimal::ZERO),
            coins_restored,
            refund_ref: reservation.refund_ref,
        })
    }
}

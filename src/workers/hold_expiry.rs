//! Stale-hold expiry sweep
//!
//! Pending holds older than the TTL are cancelled together with their
//! still-unpaid reservations. The coins those reservations spent are given
//! back in the users scope once the services scope has committed.
//!
//! Reservations are locked before their unit and hold, the same order the
//! payment outcome and cancellation paths use.

use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::WorkerResult;
use crate::database::models::{BookingStatus, HoldStatus, JobEntity, PaymentStatus};
use crate::services::EngineContext;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HoldExpiryReport {
    /// Job flag was off, nothing looked at
    pub skipped: bool,
    pub holds_expired: usize,
    pub reservations_cancelled: usize,
    pub coins_restored: i64,
    /// Users-scope compensations that failed and will be retried by the next
    /// outcome touching the reservation
    pub compensation_failures: usize,
}

pub struct HoldExpirySweep {
    ctx: Arc<EngineContext>,
    batch_size: i64,
}

impl HoldExpirySweep {
    pub fn new(ctx: Arc<EngineContext>, batch_size: i64) -> Self {
        Self {
            ctx,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run_once(&self) -> WorkerResult<HoldExpiryReport> {
        let now = self.ctx.clock.now();
        let mut tx = self.ctx.services.begin().await?;

        if !tx.job_state(JobEntity::HoldExpiry).await?.active {
            tx.rollback().await?;
            debug!("hold expiry sweep idle");
            return Ok(HoldExpiryReport {
                skipped: true,
                ..HoldExpiryReport::default()
            });
        }

        let cutoff = now - self.ctx.inventory.hold_ttl();
        let stale = tx
            .lock_stale_reservations(cutoff, self.batch_size)
            .await?;

        let mut report = HoldExpiryReport::default();
        let mut to_unwind: Vec<(Uuid, Uuid)> = Vec::new();

        for mut reservation in stale {
            let Some(hold) = self.ctx.inventory.lock_hold(&mut *tx, &reservation).await? else {
                continue;
            };
            // captured or released between the scan and the lock
            if hold.status != HoldStatus::Pending || hold.created_at >= cutoff {
                continue;
            }
            tx.set_hold_status(hold.id, HoldStatus::Cancelled).await?;
            report.holds_expired += 1;

            if reservation.is_payment_pending() {
                reservation.booking_status = BookingStatus::Cancelled;
                reservation.payment_status = PaymentStatus::Failed;
                reservation.updated_at = now;
                tx.update_reservation(&reservation).await?;
                report.reservations_cancelled += 1;
                to_unwind.push((reservation.user_id, reservation.id));
            }
        }

        tx.lock_job(JobEntity::HoldExpiry).await?;
        let still_pending = tx.count_pending_holds().await?;
        tx.finish_job_run(JobEntity::HoldExpiry, now, still_pending > 0)
            .await?;
        tx.commit().await?;

        for (user_id, reservation_id) in to_unwind {
            match self
                .ctx
                .unwind_wallet(user_id, reservation_id, 100, now)
                .await
            {
                Ok(restored) => report.coins_restored += restored,
                Err(e) => {
                    report.compensation_failures += 1;
                    error!(
                        reservation_id = %reservation_id,
                        error = %e,
                        "PartialCommitInconsistency: expired reservation coins not reversed"
                    );
                }
            }
        }

        if report.holds_expired > 0 {
            info!(
                holds_expired = report.holds_expired,
                reservations_cancelled = report.reservations_cancelled,
                coins_restored = report.coins_restored,
                still_pending,
                "stale holds expired"
            );
        }

        Ok(report)
    }
}

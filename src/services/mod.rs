//! Settlement engine services

pub mod cancellation;
pub mod coin_ledger;
pub mod inventory;
pub mod payment_outcome;
pub mod pricing;
pub mod settlement;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use std::sync::Arc;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{AppConfig, LedgerConfig, PricingConfig};
use crate::database::models::{IssuanceStatus, JobEntity, PaymentStatus, Reservation};
use crate::database::store::{ServicesStore, UsersStore};
use crate::error::{AppError, AppResult, DomainError};
use crate::payments::gateway::{PaymentGateway, RefundHandle};

use coin_ledger::CoinLedger;
use inventory::InventoryManager;
use pricing::PricingCalculator;

pub use cancellation::{CancellationEngine, CancellationOutcome, CancellationPolicy};
pub use payment_outcome::{PaymentOutcome, PaymentOutcomeHandler};
pub use settlement::{BookingConfirmation, BookingRequest, SettlementCoordinator};

/// Midnight UTC at the start of `date`
pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Gateway idempotency key of the single refund a reservation can have
pub fn refund_key(reservation_id: Uuid) -> String {
    format!("refund_{}", reservation_id.simple())
}

/// Where a pending refund settles once the gateway has it
fn refund_settles_to(reservation: &Reservation) -> PaymentStatus {
    if reservation.refund_pct.is_some() {
        PaymentStatus::Refunded
    } else {
        PaymentStatus::Failed
    }
}

/// Tunables for the engine components
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub ledger: LedgerConfig,
    pub pricing: PricingConfig,
    pub hold_ttl: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            pricing: PricingConfig::default(),
            hold_ttl: Duration::minutes(15),
        }
    }
}

impl From<&AppConfig> for EngineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            ledger: config.ledger.clone(),
            pricing: config.pricing.clone(),
            hold_ttl: Duration::seconds(config.scheduler.hold_ttl_secs),
        }
    }
}

/// Stores, gateway, clock and leaf components shared by the coordinators
#[derive(Clone)]
pub struct EngineContext {
    pub services: Arc<dyn ServicesStore>,
    pub users: Arc<dyn UsersStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub clock: Arc<dyn Clock>,
    pub inventory: InventoryManager,
    pub pricing: PricingCalculator,
    pub ledger: CoinLedger,
}

impl EngineContext {
    pub fn new(
        services: Arc<dyn ServicesStore>,
        users: Arc<dyn UsersStore>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            services,
            users,
            gateway,
            clock,
            inventory: InventoryManager::new(settings.hold_ttl),
            pricing: PricingCalculator::new(&settings.pricing),
            ledger: CoinLedger::new(settings.ledger),
        }
    }

    /// Users-scope compensation for a reservation that will not be honoured
    /// (or is partially refunded): reverse `refund_pct` of its coins and cancel
    /// the rewards it would have triggered. Safe to repeat.
    pub async fn unwind_wallet(
        &self,
        user_id: Uuid,
        reservation_id: Uuid,
        refund_pct: u32,
        now: DateTime<Utc>,
    ) -> AppResult<i64> {
        let mut tx = self.users.begin().await?;
        let restored = self
            .ledger
            .reverse(&mut *tx, user_id, reservation_id, refund_pct, now)
            .await?;

        for issuance in tx.issuances_for_source(reservation_id).await? {
            match issuance.status {
                IssuanceStatus::Pending => {
                    tx.set_issuance_state(issuance.id, false, IssuanceStatus::Cancelled)
                        .await?;
                    info!(
                        issuance_id = %issuance.id,
                        reservation_id = %reservation_id,
                        "pending issuance cancelled"
                    );
                }
                IssuanceStatus::Issued => warn!(
                    issuance_id = %issuance.id,
                    reservation_id = %reservation_id,
                    "reward already issued for unwound reservation"
                ),
                IssuanceStatus::Cancelled => {}
            }
        }

        tx.commit().await?;
        Ok(restored)
    }

    /// Second half of a refund whose cancellation already committed: file it
    /// with the gateway under the reservation's key, then record it if the row
    /// is still `refund_pending`. Repeats return the refund filed first.
    pub async fn complete_refund(
        &self,
        reservation: &Reservation,
    ) -> AppResult<(Reservation, Option<RefundHandle>)> {
        let refund = match (reservation.transaction_ref.as_deref(), reservation.refund_amount) {
            (Some(transaction_ref), Some(amount)) if amount > Decimal::ZERO => {
                let refund = self
                    .gateway
                    .refund_payment(transaction_ref, amount, &refund_key(reservation.id))
                    .await
                    .map_err(|e| {
                        warn!(
                            reservation_id = %reservation.id,
                            error = %e,
                            "refund not filed, reservation stays refund_pending"
                        );
                        AppError::from(e)
                    })?;
                Some(refund)
            }
            _ => None,
        };

        let mut tx = self.services.begin().await?;
        let mut current = tx.lock_reservation(reservation.id).await?.ok_or_else(|| {
            AppError::domain(DomainError::ReservationNotFound {
                reservation_id: reservation.id.to_string(),
            })
        })?;
        if !current.is_refund_pending() {
            tx.rollback().await?;
            return Ok((current, refund));
        }

        current.payment_status = refund_settles_to(&current);
        if let Some(refund) = &refund {
            current.refund_amount = Some(refund.amount);
            current.refund_ref = Some(refund.refund_id.clone());
        }
        current.updated_at = self.clock.now();
        tx.update_reservation(&current).await?;
        tx.commit().await?;

        info!(
            reservation_id = %current.id,
            payment_status = %current.payment_status,
            refund_ref = current.refund_ref.as_deref().unwrap_or("none"),
            "refund recorded"
        );
        Ok((current, refund))
    }

    /// Users-scope follow-up of a captured payment: finalize coin drafts and
    /// arm the rewards so the promotion sweep picks them up
    pub async fn settle_wallet(&self, user_id: Uuid, reservation_id: Uuid) -> AppResult<()> {
        let mut tx = self.users.begin().await?;
        self.ledger
            .finalize(&mut *tx, user_id, reservation_id)
            .await?;

        let mut armed = 0;
        for issuance in tx.issuances_for_source(reservation_id).await? {
            if issuance.status == IssuanceStatus::Pending && !issuance.issue {
                tx.set_issuance_state(issuance.id, true, IssuanceStatus::Pending)
                    .await?;
                armed += 1;
            }
        }
        if armed > 0 {
            tx.mark_job_active(JobEntity::IssuancePromotion).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

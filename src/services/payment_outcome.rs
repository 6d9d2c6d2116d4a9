//! Asynchronous payment outcomes delivered by gateway webhooks
//!
//! Every handler re-derives what to do from the reservation and hold rows it
//! locks, so redelivered webhooks land on `AlreadyProcessed` and only repeat
//! the idempotent users-scope follow-up.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::EngineContext;
use crate::database::models::{BookingStatus, HoldStatus, PaymentStatus, Reservation};
use crate::database::store::ServicesTx;
use crate::error::{AppError, AppErrorKind, AppResult, DomainError, ExternalError, ValidationError};
use crate::payments::gateway::{RefundHandle, WebhookEvent, WebhookEventKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PaymentOutcome {
    /// Event the engine does not act on
    Ignored { event: String },
    AlreadyProcessed { reservation_id: Uuid },
    Confirmed { reservation_id: Uuid },
    /// Captured but the inventory was gone; payment refunded in full
    Overbooked {
        reservation_id: Uuid,
        refund: Option<RefundHandle>,
        coins_restored: i64,
    },
    Cancelled {
        reservation_id: Uuid,
        coins_restored: i64,
    },
}

pub struct PaymentOutcomeHandler {
    ctx: Arc<EngineContext>,
}

impl PaymentOutcomeHandler {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub async fn handle_webhook(
        &self,
        signature: &str,
        raw_payload: &[u8],
    ) -> AppResult<PaymentOutcome> {
        let gateway = &self.ctx.gateway;
        if !gateway.validate_signature(signature, gateway.webhook_secret(), raw_payload) {
            warn!(gateway = gateway.name(), "webhook signature rejected");
            return Err(AppError::new(AppErrorKind::External(
                ExternalError::InvalidSignature,
            )));
        }

        let event = WebhookEvent::parse(raw_payload).map_err(AppError::from)?;

        match (&event.kind, event.order_id.as_deref(), event.payment_id.as_deref()) {
            (WebhookEventKind::PaymentCaptured, Some(order_id), Some(payment_id)) => {
                self.on_payment_captured(order_id, payment_id).await
            }
            (WebhookEventKind::PaymentFailed, Some(order_id), _) => {
                self.on_payment_failed(order_id, event.failure_reason.as_deref())
                    .await
            }
            (WebhookEventKind::PaymentAuthorized, ..) => Ok(PaymentOutcome::Ignored {
                event: "payment.authorized".to_string(),
            }),
            (WebhookEventKind::Other(name), ..) => {
                info!(event = %name, "ignoring webhook event");
                Ok(PaymentOutcome::Ignored {
                    event: name.clone(),
                })
            }
            _ => Err(AppError::validation(ValidationError::MissingField {
                field: "payload.payment.entity.order_id".to_string(),
            })),
        }
    }

    pub async fn on_payment_captured(
        &self,
        order_id: &str,
        payment_id: &str,
    ) -> AppResult<PaymentOutcome> {
        let mut tx = self.ctx.services.begin().await?;
        let mut reservation = lock_by_order(&mut *tx, order_id).await?;

        if reservation.is_refund_pending() {
            tx.rollback().await?;
            return self.resume_refund(reservation).await;
        }

        if already_settled(&reservation) {
            tx.rollback().await?;
            info!(
                reservation_id = %reservation.id,
                order_id,
                "capture already processed"
            );
            self.reconcile_wallet(&reservation).await;
            return Ok(PaymentOutcome::AlreadyProcessed {
                reservation_id: reservation.id,
            });
        }

        let now = self.ctx.clock.now();
        let hold = self.ctx.inventory.lock_hold(&mut *tx, &reservation).await?;
        let confirmable = match &hold {
            Some(hold) if hold.status == HoldStatus::Pending => {
                let remaining = self
                    .ctx
                    .inventory
                    .recheck_for_confirmation(&mut *tx, hold)
                    .await?;
                remaining >= hold.quantity
            }
            Some(hold) => hold.status == HoldStatus::Confirmed,
            None => false,
        };

        if !confirmable || reservation.booking_status == BookingStatus::Cancelled {
            return self
                .refund_overbooked(tx, reservation, payment_id, now)
                .await;
        }

        self.ctx
            .inventory
            .confirm_hold(&mut *tx, reservation.id)
            .await?;
        reservation.payment_status = PaymentStatus::Paid;
        reservation.booking_status = BookingStatus::Confirmed;
        reservation.transaction_ref = Some(payment_id.to_string());
        reservation.updated_at = now;
        tx.update_reservation(&reservation).await?;
        tx.commit().await?;

        info!(
            reservation_id = %reservation.id,
            order_id,
            payment_id,
            "reservation confirmed"
        );

        if let Err(e) = self
            .ctx
            .settle_wallet(reservation.user_id, reservation.id)
            .await
        {
            error!(
                reservation_id = %reservation.id,
                error = %e,
                "PartialCommitInconsistency: reservation confirmed but wallet not settled"
            );
        }

        Ok(PaymentOutcome::Confirmed {
            reservation_id: reservation.id,
        })
    }

    pub async fn on_payment_failed(
        &self,
        order_id: &str,
        reason: Option<&str>,
    ) -> AppResult<PaymentOutcome> {
        let mut tx = self.ctx.services.begin().await?;
        let mut reservation = lock_by_order(&mut *tx, order_id).await?;

        if !reservation.is_payment_pending() {
            tx.rollback().await?;
            self.reconcile_wallet(&reservation).await;
            return Ok(PaymentOutcome::AlreadyProcessed {
                reservation_id: reservation.id,
            });
        }

        let now = self.ctx.clock.now();
        self.ctx
            .inventory
            .release_hold(&mut *tx, &reservation)
            .await?;
        reservation.payment_status = PaymentStatus::Failed;
        reservation.booking_status = BookingStatus::Cancelled;
        reservation.updated_at = now;
        tx.update_reservation(&reservation).await?;
        tx.commit().await?;

        info!(
            reservation_id = %reservation.id,
            order_id,
            reason = reason.unwrap_or("unknown"),
            "payment failed, reservation cancelled"
        );

        let coins_restored = self.unwind(&reservation).await;
        Ok(PaymentOutcome::Cancelled {
            reservation_id: reservation.id,
            coins_restored,
        })
    }

    /// Cancel and commit first, then refund the capture under the
    /// reservation's idempotency key
    async fn refund_overbooked(
        &self,
        mut tx: Box<dyn ServicesTx>,
        mut reservation: Reservation,
        payment_id: &str,
        now: chrono::DateTime<Utc>,
    ) -> AppResult<PaymentOutcome> {
        error!(
            reservation_id = %reservation.id,
            unit_id = %reservation.unit_id,
            quantity = reservation.quantity,
            payment_id,
            "OverbookedAtConfirmation: capacity gone at capture, refunding"
        );

        self.ctx
            .inventory
            .release_hold(&mut *tx, &reservation)
            .await?;
        let amount = reservation.amount.total_payable;
        reservation.booking_status = BookingStatus::Cancelled;
        reservation.transaction_ref = Some(payment_id.to_string());
        reservation.refund_pct = None;
        if amount > Decimal::ZERO {
            reservation.payment_status = PaymentStatus::RefundPending;
            reservation.refund_amount = Some(amount);
        } else {
            reservation.payment_status = PaymentStatus::Failed;
        }
        reservation.updated_at = now;
        tx.update_reservation(&reservation).await?;
        tx.commit().await?;

        self.resume_refund(reservation).await
    }

    /// Coins back in full, then the refund still owed for an unhonoured capture
    async fn resume_refund(&self, reservation: Reservation) -> AppResult<PaymentOutcome> {
        if reservation.refund_pct.is_some() {
            // a user cancellation waiting on its refund
            let (reservation, _) = self.ctx.complete_refund(&reservation).await?;
            return Ok(PaymentOutcome::AlreadyProcessed {
                reservation_id: reservation.id,
            });
        }

        let coins_restored = self.unwind(&reservation).await;
        let refund = if reservation.is_refund_pending() {
            self.ctx.complete_refund(&reservation).await?.1
        } else {
            None
        };

        Ok(PaymentOutcome::Overbooked {
            reservation_id: reservation.id,
            refund,
            coins_restored,
        })
    }

    /// Full coin reversal after the services scope committed
    async fn unwind(&self, reservation: &Reservation) -> i64 {
        let now = self.ctx.clock.now();
        match self
            .ctx
            .unwind_wallet(reservation.user_id, reservation.id, 100, now)
            .await
        {
            Ok(restored) => restored,
            Err(e) => {
                error!(
                    reservation_id = %reservation.id,
                    error = %e,
                    "PartialCommitInconsistency: reservation cancelled but coins not reversed"
                );
                0
            }
        }
    }

    /// Repeat the users-scope follow-up of an earlier outcome; each step is a
    /// no-op when it already happened
    async fn reconcile_wallet(&self, reservation: &Reservation) {
        let result = match (reservation.booking_status, reservation.payment_status) {
            (BookingStatus::Confirmed, PaymentStatus::Paid) => self
                .ctx
                .settle_wallet(reservation.user_id, reservation.id)
                .await
                .map(|_| 0),
            (BookingStatus::Cancelled, PaymentStatus::Failed) => {
                let now = self.ctx.clock.now();
                self.ctx
                    .unwind_wallet(reservation.user_id, reservation.id, 100, now)
                    .await
            }
            _ => Ok(0),
        };
        if let Err(e) = result {
            warn!(
                reservation_id = %reservation.id,
                error = %e,
                "wallet reconciliation failed"
            );
        }
    }
}

async fn lock_by_order(tx: &mut dyn ServicesTx, order_id: &str) -> AppResult<Reservation> {
    tx.lock_reservation_by_order(order_id).await?.ok_or_else(|| {
        AppError::domain(DomainError::ReservationNotFound {
            reservation_id: order_id.to_string(),
        })
    })
}

/// Paid, refunded or already compensated at capture
fn already_settled(reservation: &Reservation) -> bool {
    matches!(
        reservation.payment_status,
        PaymentStatus::Paid | PaymentStatus::Refunded | PaymentStatus::NoRefund
    ) || reservation.refund_ref.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{AmountBreakdown, ProductType};
    use chrono::NaiveDate;

    fn reservation(payment: PaymentStatus, booking: BookingStatus) -> Reservation {
        let now = Utc::now();
        Reservation {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            product_type: ProductType::Lodging,
            product_id: Uuid::new_v4(),
            unit_id: Uuid::new_v4(),
            start_date: NaiveDate::from_ymd_opt(2025, 9, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2025, 9, 2).unwrap(),
            quantity: 1,
            adults: 2,
            children: 0,
            amount: AmountBreakdown::default(),
            offer_code: None,
            payment_status: payment,
            booking_status: booking,
            gateway_order_id: Some("order_00000001".to_string()),
            transaction_ref: None,
            refund_amount: None,
            refund_ref: None,
            refund_pct: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn settled_states() {
        assert!(already_settled(&reservation(
            PaymentStatus::Paid,
            BookingStatus::Confirmed
        )));
        assert!(already_settled(&reservation(
            PaymentStatus::Refunded,
            BookingStatus::Cancelled
        )));
        assert!(!already_settled(&reservation(
            PaymentStatus::Pending,
            BookingStatus::Pending
        )));

        // expired by the sweep before the capture arrived
        assert!(!already_settled(&reservation(
            PaymentStatus::Failed,
            BookingStatus::Cancelled
        )));

        let mut refunded = reservation(PaymentStatus::Failed, BookingStatus::Cancelled);
        refunded.refund_ref = Some("rfnd_1".to_string());
        assert!(already_settled(&refunded));
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let outcome = PaymentOutcome::Confirmed {
            reservation_id: Uuid::nil(),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["outcome"], "confirmed");
    }
}

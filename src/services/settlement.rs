//! Booking saga across the services and users scopes
//!
//! Both transactions stay open until the gateway order exists; the services
//! scope commits first, then the users scope. A failure between the two
//! commits is not surfaced: every downstream reader re-derives state from the
//! rows it finds, and wallet compensation is a no-op when no spend was stored.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::coin_ledger::CoinQuote;
use super::pricing::{PriceBreakdown, PricingInput};
use super::{start_of_day, EngineContext};
use crate::database::models::{
    BookingStatus, DateWindow, IssuanceStatus, LotSource, PaymentStatus, PendingIssuance,
    Reservation,
};
use crate::database::store::ServicesTx;
use crate::error::{AppError, AppResult, DomainError, ValidationError};
use crate::payments::gateway::OrderHandle;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingRequest {
    pub user_id: Uuid,
    pub product_id: Uuid,
    pub unit_id: Uuid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Rooms, passes or seats
    pub quantity: i32,
    pub adults: i32,
    #[serde(default)]
    pub children: i32,
    #[serde(default)]
    pub coins_requested: i64,
    #[serde(default)]
    pub offer_code: Option<String>,
}

impl BookingRequest {
    pub fn window(&self) -> DateWindow {
        DateWindow::new(self.start_date, self.end_date)
    }

    /// Reject malformed input before any transaction opens
    pub fn validate(&self, today: NaiveDate) -> AppResult<()> {
        let window = self.window();
        if window.is_empty() {
            return Err(AppError::validation(ValidationError::InvalidDateRange {
                start: self.start_date.to_string(),
                end: self.end_date.to_string(),
                reason: "end date must be after start date".to_string(),
            }));
        }
        if self.start_date < today {
            return Err(AppError::validation(ValidationError::InvalidDateRange {
                start: self.start_date.to_string(),
                end: self.end_date.to_string(),
                reason: "start date is in the past".to_string(),
            }));
        }

        let counts = [
            ("quantity", i64::from(self.quantity), 1),
            ("adults", i64::from(self.adults), 1),
            ("children", i64::from(self.children), 0),
            ("coins_requested", self.coins_requested, 0),
        ];
        for (field, value, min) in counts {
            if value < min {
                return Err(AppError::validation(ValidationError::InvalidCount {
                    field: field.to_string(),
                    value,
                    reason: format!("must be at least {}", min),
                }));
            }
        }

        if let Some(code) = &self.offer_code {
            if code.trim().is_empty() {
                return Err(AppError::validation(ValidationError::MissingField {
                    field: "offer_code".to_string(),
                }));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BookingConfirmation {
    pub reservation: Reservation,
    pub order: OrderHandle,
    pub breakdown: PriceBreakdown,
    pub coins: CoinQuote,
}

pub struct SettlementCoordinator {
    ctx: Arc<EngineContext>,
}

impl SettlementCoordinator {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub async fn book(&self, request: BookingRequest) -> AppResult<BookingConfirmation> {
        let now = self.ctx.clock.now();
        request.validate(now.date_naive())?;

        let window = request.window();
        let offer_code = request.offer_code.as_deref().map(str::trim);
        let reservation_id = Uuid::new_v4();

        // Services scope: lock the unit and price the stay
        let mut services_tx = self.ctx.services.begin().await?;
        let availability = self
            .ctx
            .inventory
            .check_availability(&mut *services_tx, request.product_id, request.unit_id, window)
            .await?;
        if availability.remaining < request.quantity {
            info!(
                unit_id = %request.unit_id,
                requested = request.quantity,
                remaining = availability.remaining,
                "booking rejected: insufficient inventory"
            );
            return Err(AppError::domain(DomainError::InsufficientInventory {
                requested: request.quantity,
                remaining: availability.remaining,
            }));
        }
        let unit = availability.unit;

        let overrides = services_tx
            .rate_overrides(unit.id, window.start, window.end)
            .await?;
        let offer = match offer_code {
            Some(code) => services_tx.find_offer(code).await?,
            None => None,
        };
        let mut pricing_input = PricingInput {
            unit: &unit,
            window,
            quantity: request.quantity,
            adults: request.adults,
            children: request.children,
            rate_overrides: &overrides,
            offer_code,
            offer: offer.as_ref(),
            today: now.date_naive(),
            coins_applied: 0,
            coin_value: self.ctx.ledger.config().coin_value,
        };
        let before_coins = self.ctx.pricing.price(&pricing_input)?;

        // Users scope: decide coin usage against the wallet
        let mut users_tx = self.ctx.users.begin().await?;
        let quote = self
            .ctx
            .ledger
            .quote(
                &mut *users_tx,
                request.user_id,
                request.coins_requested,
                before_coins.price_before_coins(),
                unit.product_type,
                now,
            )
            .await?;
        pricing_input.coins_applied = quote.usable_coins;
        let breakdown = self.ctx.pricing.price(&pricing_input)?;

        let mut reservation = Reservation {
            id: reservation_id,
            user_id: request.user_id,
            product_type: unit.product_type,
            product_id: unit.product_id,
            unit_id: unit.id,
            start_date: window.start,
            end_date: window.end,
            quantity: request.quantity,
            adults: request.adults,
            children: request.children,
            amount: breakdown.clone(),
            offer_code: offer.as_ref().map(|o| o.code.clone()),
            payment_status: PaymentStatus::Pending,
            booking_status: BookingStatus::Pending,
            gateway_order_id: None,
            transaction_ref: None,
            refund_amount: None,
            refund_ref: None,
            refund_pct: None,
            created_at: now,
            updated_at: now,
        };
        services_tx.insert_reservation(&reservation).await?;
        self.ctx
            .inventory
            .create_hold(
                &mut *services_tx,
                unit.product_id,
                unit.id,
                window,
                request.quantity,
                reservation_id,
                now,
            )
            .await?;

        let metadata = json!({
            "reservation_id": reservation_id,
            "user_id": request.user_id,
            "product_type": unit.product_type.as_str(),
            "coins_applied": quote.usable_coins,
        });
        let order = match self
            .ctx
            .gateway
            .create_order(
                &reservation_id.to_string(),
                breakdown.total_payable,
                &metadata,
            )
            .await
        {
            Ok(order) => order,
            Err(e) => {
                warn!(
                    reservation_id = %reservation_id,
                    gateway = self.ctx.gateway.name(),
                    error = %e,
                    "gateway order failed, aborting booking"
                );
                abort(services_tx, users_tx).await;
                return Err(
                    AppError::from(e).with_context(format!("reservation {}", reservation_id))
                );
            }
        };

        reservation.gateway_order_id = Some(order.order_id.clone());
        services_tx.update_reservation(&reservation).await?;
        self.ctx
            .ledger
            .apply(
                &mut *users_tx,
                request.user_id,
                &quote,
                reservation_id,
                unit.product_type,
                now,
            )
            .await?;

        services_tx.commit().await?;
        if let Err(e) = users_tx.commit().await {
            error!(
                reservation_id = %reservation_id,
                user_id = %request.user_id,
                coins = quote.usable_coins,
                error = %e,
                "PartialCommitInconsistency: reservation stored but coin spend lost"
            );
        }

        info!(
            reservation_id = %reservation_id,
            order_id = %order.order_id,
            total_payable = %breakdown.total_payable,
            coins_applied = quote.usable_coins,
            "booking created"
        );

        self.enqueue_referral(&reservation, now).await;

        Ok(BookingConfirmation {
            reservation,
            order,
            breakdown,
            coins: quote,
        })
    }

    /// Best effort: a failure here never affects the booking
    async fn enqueue_referral(&self, reservation: &Reservation, now: DateTime<Utc>) {
        match self.try_enqueue_referral(reservation, now).await {
            Ok(Some(issuance)) => info!(
                issuance_id = %issuance.id,
                referrer = %issuance.user_id,
                reservation_id = %reservation.id,
                "referral reward queued"
            ),
            Ok(None) => {}
            Err(e) => warn!(
                reservation_id = %reservation.id,
                user_id = %reservation.user_id,
                error = %e,
                "referral reward could not be queued"
            ),
        }
    }

    async fn try_enqueue_referral(
        &self,
        reservation: &Reservation,
        now: DateTime<Utc>,
    ) -> AppResult<Option<PendingIssuance>> {
        let config = self.ctx.ledger.config();
        if config.referral_reward_coins <= 0 {
            return Ok(None);
        }

        let mut tx = self.ctx.users.begin().await?;
        let referrer = match tx.find_profile(reservation.user_id).await? {
            Some(profile) => profile.referred_by,
            None => None,
        };
        let Some(referrer) = referrer.filter(|r| *r != reservation.user_id) else {
            return Ok(None);
        };
        if tx.referral_issuance_exists(reservation.user_id).await? {
            return Ok(None);
        }

        let issuance = PendingIssuance {
            id: Uuid::new_v4(),
            user_id: referrer,
            source_type: LotSource::Referral,
            source_id: reservation.id,
            source_user_id: reservation.user_id,
            coins_to_issue: config.referral_reward_coins,
            issue_at: start_of_day(reservation.start_date)
                + Duration::days(config.referral_hold_days),
            issue: false,
            status: IssuanceStatus::Pending,
            created_at: now,
        };
        tx.insert_pending_issuance(&issuance).await?;
        tx.commit().await?;

        Ok(Some(issuance))
    }
}

async fn abort(
    services_tx: Box<dyn ServicesTx>,
    users_tx: Box<dyn crate::database::store::UsersTx>,
) {
    if let Err(e) = services_tx.rollback().await {
        warn!(error = %e, "services rollback failed");
    }
    if let Err(e) = users_tx.rollback().await {
        warn!(error = %e, "users rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> BookingRequest {
        BookingRequest {
            user_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            unit_id: Uuid::new_v4(),
            start_date: NaiveDate::from_ymd_opt(2025, 8, 10).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2025, 8, 12).unwrap(),
            quantity: 1,
            adults: 2,
            children: 0,
            coins_requested: 0,
            offer_code: None,
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, 1).unwrap()
    }

    #[test]
    fn valid_request_passes() {
        assert!(request().validate(today()).is_ok());
    }

    #[test]
    fn rejects_bad_dates_and_counts() {
        let mut r = request();
        r.end_date = r.start_date;
        assert_eq!(r.validate(today()).unwrap_err().status_code(), 400);

        let mut r = request();
        r.start_date = NaiveDate::from_ymd_opt(2025, 7, 30).unwrap();
        assert!(r.validate(today()).is_err());

        let mut r = request();
        r.quantity = 0;
        assert!(r.validate(today()).is_err());

        let mut r = request();
        r.children = -1;
        assert!(r.validate(today()).is_err());

        let mut r = request();
        r.coins_requested = -5;
        assert!(r.validate(today()).is_err());

        let mut r = request();
        r.offer_code = Some("   ".to_string());
        assert!(r.validate(today()).is_err());
    }
}

#![allow(dead_code)]

use booking_settlement::clock::FixedClock;
use booking_settlement::database::memory::{MemoryServicesStore, MemoryUsersStore};
use booking_settlement::database::models::{
    CoinLot, InventoryUnit, LotSource, ProductType, UserProfile,
};
use booking_settlement::payments::mock::MockPaymentGateway;
use booking_settlement::services::{
    BookingRequest, CancellationEngine, EngineContext, EngineSettings, PaymentOutcomeHandler,
    SettlementCoordinator,
};
use booking_settlement::workers::{HoldExpirySweep, IssuancePromotionSweep};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_test";

/// In-memory engine wired the way `main` wires the PostgreSQL one
pub struct Harness {
    pub services: MemoryServicesStore,
    pub users: MemoryUsersStore,
    pub gateway: Arc<MockPaymentGateway>,
    pub clock: FixedClock,
    pub ctx: Arc<EngineContext>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(EngineSettings::default())
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        let services = MemoryServicesStore::new();
        let users = MemoryUsersStore::new();
        let gateway = MockPaymentGateway::shared(WEBHOOK_SECRET);
        let clock = FixedClock::new(now());
        let ctx = Arc::new(EngineContext::new(
            Arc::new(services.clone()),
            Arc::new(users.clone()),
            gateway.clone(),
            Arc::new(clock.clone()),
            settings,
        ));

        Self {
            services,
            users,
            gateway,
            clock,
            ctx,
        }
    }

    pub fn coordinator(&self) -> SettlementCoordinator {
        SettlementCoordinator::new(self.ctx.clone())
    }

    pub fn outcomes(&self) -> PaymentOutcomeHandler {
        PaymentOutcomeHandler::new(self.ctx.clone())
    }

    pub fn cancellations(&self) -> CancellationEngine {
        CancellationEngine::new(self.ctx.clone())
    }

    pub fn hold_sweep(&self) -> HoldExpirySweep {
        HoldExpirySweep::new(self.ctx.clone(), 100)
    }

    pub fn issuance_sweep(&self) -> IssuancePromotionSweep {
        IssuancePromotionSweep::new(self.ctx.clone(), 100)
    }

    pub async fn lodging(&self, capacity: i32, policy: &str) -> InventoryUnit {
        let unit = InventoryUnit {
            id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            product_type: ProductType::Lodging,
            capacity,
            base_rate: Decimal::from(1000),
            extra_adult_rate: Decimal::from(300),
            child_rate: Decimal::from(150),
            included_occupants: 2,
            cancellation_policy: policy.to_string(),
        };
        self.services.seed_unit(unit.clone()).await;
        unit
    }

    pub async fn festival_pass(&self, capacity: i32, policy: &str) -> InventoryUnit {
        let unit = InventoryUnit {
            id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            product_type: ProductType::FestivalPass,
            capacity,
            base_rate: Decimal::from(500),
            extra_adult_rate: Decimal::ZERO,
            child_rate: Decimal::ZERO,
            included_occupants: 1,
            cancellation_policy: policy.to_string(),
        };
        self.services.seed_unit(unit.clone()).await;
        unit
    }

    pub async fn lot(&self, user_id: Uuid, amount: i64, expires_in_days: i64) -> CoinLot {
        let lot = CoinLot {
            id: Uuid::new_v4(),
            user_id,
            amount,
            remaining: amount,
            source_type: LotSource::SignupBonus,
            expires_at: now() + Duration::days(expires_in_days),
            created_at: now() - Duration::days(30),
        };
        self.users.seed_lot(lot.clone()).await;
        lot
    }

    pub async fn referred_user(&self, referrer: Uuid) -> Uuid {
        let user_id = Uuid::new_v4();
        self.users
            .seed_profile(UserProfile {
                id: user_id,
                referred_by: Some(referrer),
            })
            .await;
        user_id
    }

    /// Signed `payment.captured` / `payment.failed` delivery
    pub fn webhook(&self, event: &str, order_id: &str, payment_id: &str) -> (String, Vec<u8>) {
        let raw = json!({
            "event": event,
            "payload": {
                "payment": {
                    "entity": {
                        "id": payment_id,
                        "order_id": order_id,
                        "amount": 100,
                        "error_description": "card declined"
                    }
                }
            }
        })
        .to_string()
        .into_bytes();
        (self.gateway.sign(&raw), raw)
    }
}

/// 2025-06-15 12:00 UTC
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap()
}

pub fn date(month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, month, day).unwrap()
}

pub fn request(unit: &InventoryUnit, user_id: Uuid, start: NaiveDate, nights: i64) -> BookingRequest {
    BookingRequest {
        user_id,
        product_id: unit.product_id,
        unit_id: unit.id,
        start_date: start,
        end_date: start + Duration::days(nights),
        quantity: 1,
        adults: 2,
        children: 0,
        coins_requested: 0,
        offer_code: None,
    }
}

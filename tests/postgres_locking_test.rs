//! Row-lock behaviour of the PostgreSQL stores. Needs `SERVICES_DATABASE_URL`
//! and `USERS_DATABASE_URL` pointing at disposable databases.

mod common;

use booking_settlement::clock::FixedClock;
use booking_settlement::config::DatabaseConfig;
use booking_settlement::database::models::{InventoryUnit, JobEntity, ProductType};
use booking_settlement::database::services_repository::PgServicesStore;
use booking_settlement::database::store::{ServicesStore, ServicesTx};
use booking_settlement::database::users_repository::PgUsersStore;
use booking_settlement::database::ScopePools;
use booking_settlement::payments::mock::MockPaymentGateway;
use booking_settlement::services::{EngineContext, EngineSettings, SettlementCoordinator};
use booking_settlement::workers::HoldExpirySweep;
use common::{date, now, request};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

async fn connect() -> (ScopePools, Arc<EngineContext>, FixedClock) {
    let services = DatabaseConfig::from_env("SERVICES").unwrap();
    let users = DatabaseConfig::from_env("USERS").unwrap();
    let pools = ScopePools::connect(&services, &users).await.unwrap();
    pools.migrate().await.unwrap();

    let clock = FixedClock::new(now());
    let ctx = Arc::new(EngineContext::new(
        Arc::new(PgServicesStore::new(pools.services.clone())),
        Arc::new(PgUsersStore::new(pools.users.clone())),
        MockPaymentGateway::shared(common::WEBHOOK_SECRET),
        Arc::new(clock.clone()),
        EngineSettings::default(),
    ));
    (pools, ctx, clock)
}

async fn seed_unit(pools: &ScopePools, capacity: i32) -> InventoryUnit {
    let unit = InventoryUnit {
        id: Uuid::new_v4(),
        product_id: Uuid::new_v4(),
        product_type: ProductType::Lodging,
        capacity,
        base_rate: Decimal::from(1000),
        extra_adult_rate: Decimal::from(300),
        child_rate: Decimal::from(150),
        included_occupants: 2,
        cancellation_policy: "Flexible".to_string(),
    };
    sqlx::query(
        "INSERT INTO inventory_units
         (id, product_id, product_type, capacity, base_rate, extra_adult_rate, child_rate,
          included_occupants, cancellation_policy)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(unit.id)
    .bind(unit.product_id)
    .bind(unit.product_type.as_str())
    .bind(unit.capacity)
    .bind(unit.base_rate)
    .bind(unit.extra_adult_rate)
    .bind(unit.child_rate)
    .bind(unit.included_occupants)
    .bind(&unit.cancellation_policy)
    .execute(&pools.services)
    .await
    .unwrap();
    unit
}

#[tokio::test]
#[ignore] // Requires database running
async fn unit_lock_keeps_parallel_bookings_within_capacity() {
    let (pools, ctx, _) = connect().await;
    let unit = seed_unit(&pools, 2).await;
    let coordinator = Arc::new(SettlementCoordinator::new(ctx));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let coordinator = coordinator.clone();
            let req = request(&unit, Uuid::new_v4(), date(8, 10), 3);
            tokio::spawn(async move { coordinator.book(req).await })
        })
        .collect();
    let results: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
    let live: i64 = sqlx::query_scalar(
        "SELECT COUNT(*)::BIGINT FROM inventory_holds
         WHERE unit_id = $1 AND status IN ('pending', 'confirmed')",
    )
    .bind(unit.id)
    .fetch_one(&pools.services)
    .await
    .unwrap();
    assert_eq!(live, 2);

    pools.close().await;
}

#[tokio::test]
#[ignore] // Requires database running
async fn raised_flag_does_not_block_other_bookings() {
    let (pools, ctx, _) = connect().await;
    let store = PgServicesStore::new(pools.services.clone());

    let mut first = store.begin().await.unwrap();
    first.mark_job_active(JobEntity::HoldExpiry).await.unwrap();
    first.commit().await.unwrap();

    // an open booking transaction with the flag already up
    let mut open = store.begin().await.unwrap();
    open.mark_job_active(JobEntity::HoldExpiry).await.unwrap();

    let unit = seed_unit(&pools, 1).await;
    let booked = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        SettlementCoordinator::new(ctx).book(request(&unit, Uuid::new_v4(), date(8, 10), 1)),
    )
    .await;
    assert!(matches!(booked, Ok(Ok(_))));

    open.rollback().await.unwrap();
    pools.close().await;
}

#[tokio::test]
#[ignore] // Requires database running
async fn expiry_sweep_passes_over_a_reservation_being_captured() {
    let (pools, ctx, clock) = connect().await;
    let unit = seed_unit(&pools, 1).await;
    let booking = SettlementCoordinator::new(ctx.clone())
        .book(request(&unit, Uuid::new_v4(), date(8, 10), 1))
        .await
        .unwrap();
    clock.advance(chrono::Duration::minutes(20));

    // a capture holding the reservation row
    let store = PgServicesStore::new(pools.services.clone());
    let mut capture = store.begin().await.unwrap();
    capture
        .lock_reservation(booking.reservation.id)
        .await
        .unwrap()
        .unwrap();

    let swept = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        HoldExpirySweep::new(ctx, 100).run_once(),
    )
    .await;
    assert!(matches!(swept, Ok(Ok(_))));
    capture.rollback().await.unwrap();

    let status: String =
        sqlx::query_scalar("SELECT status FROM inventory_holds WHERE reservation_id = $1")
            .bind(booking.reservation.id)
            .fetch_one(&pools.services)
            .await
            .unwrap();
    assert_eq!(status, "pending");

    pools.close().await;
}

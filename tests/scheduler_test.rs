mod common;

use booking_settlement::config::SchedulerConfig;
use booking_settlement::database::models::{
    BookingStatus, HoldStatus, IssuanceStatus, JobEntity, LedgerDirection, LotSource,
    PaymentStatus,
};
use booking_settlement::services::{start_of_day, PaymentOutcome};
use booking_settlement::workers::Scheduler;
use chrono::Duration;
use common::{date, request, Harness};
use tokio::sync::watch;
use uuid::Uuid;

#[tokio::test]
async fn idle_sweeps_do_nothing() {
    let h = Harness::new();
    assert!(h.hold_sweep().run_once().await.unwrap().skipped);
    assert!(h.issuance_sweep().run_once().await.unwrap().skipped);
}

#[tokio::test]
async fn stale_holds_expire_and_cascade_to_unpaid_reservations() {
    let h = Harness::new();
    let unit = h.lodging(3, "Flexible").await;
    let user = Uuid::new_v4();
    h.lot(user, 100, 60).await;

    let mut req = request(&unit, user, date(7, 1), 1);
    req.coins_requested = 40;
    let unpaid = h.coordinator().book(req).await.unwrap();

    let paid = h
        .coordinator()
        .book(request(&unit, Uuid::new_v4(), date(7, 1), 1))
        .await
        .unwrap();
    let (signature, raw) = h.webhook("payment.captured", &paid.order.order_id, "pay_ok");
    assert!(matches!(
        h.outcomes().handle_webhook(&signature, &raw).await.unwrap(),
        PaymentOutcome::Confirmed { .. }
    ));

    // still inside the TTL
    h.clock.advance(Duration::minutes(10));
    let report = h.hold_sweep().run_once().await.unwrap();
    assert_eq!(report.holds_expired, 0);
    assert!(h.services.job(JobEntity::HoldExpiry).await.active);

    h.clock.advance(Duration::minutes(10));
    let report = h.hold_sweep().run_once().await.unwrap();
    assert_eq!(report.holds_expired, 1);
    assert_eq!(report.reservations_cancelled, 1);
    assert_eq!(report.coins_restored, 40);
    assert_eq!(report.compensation_failures, 0);

    let expired = h.services.reservation(unpaid.reservation.id).await.unwrap();
    assert_eq!(expired.booking_status, BookingStatus::Cancelled);
    assert_eq!(expired.payment_status, PaymentStatus::Failed);
    assert_eq!(
        h.services.hold_for(unpaid.reservation.id).await.unwrap().status,
        HoldStatus::Cancelled
    );
    assert_eq!(
        h.services.hold_for(paid.reservation.id).await.unwrap().status,
        HoldStatus::Confirmed
    );
    assert_eq!(h.users.lots_of(user).await[0].remaining, 100);

    // nothing pending left, so the flag goes down
    let job = h.services.job(JobEntity::HoldExpiry).await;
    assert!(!job.active);
    assert!(job.last_run.is_some());
    assert!(h.hold_sweep().run_once().await.unwrap().skipped);
}

#[tokio::test]
async fn flag_stays_up_while_fresh_holds_wait() {
    let h = Harness::new();
    let unit = h.lodging(2, "Flexible").await;

    h.coordinator()
        .book(request(&unit, Uuid::new_v4(), date(7, 1), 1))
        .await
        .unwrap();
    h.clock.advance(Duration::minutes(20));
    let fresh = h
        .coordinator()
        .book(request(&unit, Uuid::new_v4(), date(7, 1), 1))
        .await
        .unwrap();

    let report = h.hold_sweep().run_once().await.unwrap();
    assert_eq!(report.holds_expired, 1);
    assert!(h
        .services
        .reservation(fresh.reservation.id)
        .await
        .unwrap()
        .is_payment_pending());
    assert!(h.services.job(JobEntity::HoldExpiry).await.active);
}

#[tokio::test]
async fn armed_referral_is_promoted_once_when_due() {
    let h = Harness::new();
    let unit = h.lodging(1, "Flexible").await;
    let referrer = Uuid::new_v4();
    let user = h.referred_user(referrer).await;

    let booking = h
        .coordinator()
        .book(request(&unit, user, date(7, 1), 2))
        .await
        .unwrap();

    // not armed before capture
    assert!(h.issuance_sweep().run_once().await.unwrap().skipped);

    let (signature, raw) = h.webhook("payment.captured", &booking.order.order_id, "pay_r");
    h.outcomes().handle_webhook(&signature, &raw).await.unwrap();

    // armed but not yet due
    let report = h.issuance_sweep().run_once().await.unwrap();
    assert!(!report.skipped);
    assert_eq!(report.issued, 0);
    assert!(h.users.job(JobEntity::IssuancePromotion).await.active);

    let due = start_of_day(date(7, 1)) + Duration::days(7);
    h.clock.set(due + Duration::minutes(5));
    let report = h.issuance_sweep().run_once().await.unwrap();
    assert_eq!(report.issued, 1);
    assert_eq!(report.coins_issued, 100);

    let lots = h.users.lots_of(referrer).await;
    assert_eq!(lots.len(), 1);
    assert_eq!(lots[0].source_type, LotSource::Referral);
    assert_eq!(lots[0].remaining, 100);
    assert_eq!(
        lots[0].expires_at,
        due + Duration::minutes(5) + Duration::days(365)
    );

    let earned = h.users.ledger_of(referrer).await;
    assert_eq!(earned.len(), 1);
    assert_eq!(earned[0].direction, LedgerDirection::Earned);

    let issuances = h.users.issuances().await;
    assert_eq!(issuances[0].status, IssuanceStatus::Issued);
    assert!(!h.users.job(JobEntity::IssuancePromotion).await.active);

    // repeated runs find nothing
    h.issuance_sweep().run_once().await.unwrap();
    h.clock.advance(Duration::days(1));
    h.issuance_sweep().run_once().await.unwrap();
    assert_eq!(h.users.lots_of(referrer).await.len(), 1);
}

#[tokio::test]
async fn scheduler_stops_on_shutdown() {
    let h = Harness::new();
    let config = SchedulerConfig {
        hold_expiry_interval_secs: 1,
        issuance_interval_secs: 1,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(h.ctx.clone(), config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

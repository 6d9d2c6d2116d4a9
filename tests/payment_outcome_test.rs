mod common;

use booking_settlement::database::models::{
    BookingStatus, HoldStatus, IssuanceStatus, JobEntity, LedgerStatus, PaymentStatus,
};
use booking_settlement::services::{BookingConfirmation, PaymentOutcome};
use chrono::Duration;
use common::{date, request, Harness};
use rust_decimal::Decimal;
use uuid::Uuid;

async fn book_with_coins(h: &Harness, capacity: i32, user: Uuid) -> BookingConfirmation {
    let unit = h.lodging(capacity, "Flexible").await;
    h.lot(user, 100, 30).await;
    let mut req = request(&unit, user, date(7, 1), 1);
    req.coins_requested = 50;
    h.coordinator().book(req).await.unwrap()
}

#[tokio::test]
async fn capture_confirms_and_settles_the_wallet() {
    let h = Harness::new();
    let referrer = Uuid::new_v4();
    let user = h.referred_user(referrer).await;
    let booking = book_with_coins(&h, 1, user).await;
    assert_eq!(booking.breakdown.total_payable, Decimal::from(999));

    let (signature, raw) = h.webhook("payment.captured", &booking.order.order_id, "pay_1");
    let outcome = h.outcomes().handle_webhook(&signature, &raw).await.unwrap();
    assert_eq!(
        outcome,
        PaymentOutcome::Confirmed {
            reservation_id: booking.reservation.id
        }
    );

    let reservation = h.services.reservation(booking.reservation.id).await.unwrap();
    assert_eq!(reservation.payment_status, PaymentStatus::Paid);
    assert_eq!(reservation.booking_status, BookingStatus::Confirmed);
    assert_eq!(reservation.transaction_ref.as_deref(), Some("pay_1"));
    assert_eq!(
        h.services.hold_for(reservation.id).await.unwrap().status,
        HoldStatus::Confirmed
    );

    let ledger = h.users.ledger_of(user).await;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].status, LedgerStatus::Issued);

    let issuances = h.users.issuances().await;
    assert_eq!(issuances.len(), 1);
    assert!(issuances[0].issue);
    assert_eq!(issuances[0].status, IssuanceStatus::Pending);
    assert!(h.users.job(JobEntity::IssuancePromotion).await.active);

    // redelivery changes nothing
    let again = h.outcomes().handle_webhook(&signature, &raw).await.unwrap();
    assert_eq!(
        again,
        PaymentOutcome::AlreadyProcessed {
            reservation_id: booking.reservation.id
        }
    );
    assert_eq!(h.users.ledger_of(user).await.len(), 1);
}

#[tokio::test]
async fn bad_signature_is_rejected_before_any_state_change() {
    let h = Harness::new();
    let booking = book_with_coins(&h, 1, Uuid::new_v4()).await;

    let (_, raw) = h.webhook("payment.captured", &booking.order.order_id, "pay_1");
    let err = h
        .outcomes()
        .handle_webhook("deadbeef", &raw)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 401);

    let reservation = h.services.reservation(booking.reservation.id).await.unwrap();
    assert!(reservation.is_payment_pending());
}

#[tokio::test]
async fn authorized_and_unknown_events_are_ignored() {
    let h = Harness::new();
    let booking = book_with_coins(&h, 1, Uuid::new_v4()).await;

    let (signature, raw) = h.webhook("payment.authorized", &booking.order.order_id, "pay_1");
    assert!(matches!(
        h.outcomes().handle_webhook(&signature, &raw).await.unwrap(),
        PaymentOutcome::Ignored { .. }
    ));

    let (signature, raw) = h.webhook("order.paid", &booking.order.order_id, "pay_1");
    assert_eq!(
        h.outcomes().handle_webhook(&signature, &raw).await.unwrap(),
        PaymentOutcome::Ignored {
            event: "order.paid".to_string()
        }
    );
}

#[tokio::test]
async fn capture_for_unknown_order_is_not_found() {
    let h = Harness::new();
    let (signature, raw) = h.webhook("payment.captured", "order_missing", "pay_1");
    let err = h
        .outcomes()
        .handle_webhook(&signature, &raw)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn capture_without_capacity_refunds_in_full_and_reverses_coins() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let booking = book_with_coins(&h, 1, user).await;
    assert_eq!(h.users.lots_of(user).await[0].remaining, 50);

    // capacity withdrawn while the payment was in flight
    let mut unit = h
        .services
        .snapshot()
        .await
        .units
        .get(&booking.reservation.unit_id)
        .cloned()
        .unwrap();
    unit.capacity = 0;
    h.services.seed_unit(unit).await;

    let (signature, raw) = h.webhook("payment.captured", &booking.order.order_id, "pay_7");
    let outcome = h.outcomes().handle_webhook(&signature, &raw).await.unwrap();

    let PaymentOutcome::Overbooked {
        refund,
        coins_restored,
        ..
    } = outcome
    else {
        panic!("expected overbooked outcome, got {:?}", outcome);
    };
    let refund = refund.unwrap();
    assert_eq!(refund.amount, Decimal::from(999));
    assert_eq!(refund.transaction_ref, "pay_7");
    assert_eq!(coins_restored, 50);

    let reservation = h.services.reservation(booking.reservation.id).await.unwrap();
    assert_eq!(reservation.booking_status, BookingStatus::Cancelled);
    assert_eq!(reservation.payment_status, PaymentStatus::Failed);
    assert_eq!(reservation.refund_amount, Some(Decimal::from(999)));
    assert_eq!(reservation.refund_ref, Some(refund.refund_id.clone()));
    assert_eq!(
        h.services.hold_for(reservation.id).await.unwrap().status,
        HoldStatus::Cancelled
    );

    assert_eq!(h.users.lots_of(user).await[0].remaining, 100);
    assert_eq!(h.users.ledger_of(user).await[0].status, LedgerStatus::NotValid);

    // a second delivery does not refund twice
    let again = h.outcomes().handle_webhook(&signature, &raw).await.unwrap();
    assert!(matches!(again, PaymentOutcome::AlreadyProcessed { .. }));
    assert_eq!(h.gateway.refunds().len(), 1);
}

#[tokio::test]
async fn capture_after_hold_expiry_is_refunded() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let booking = book_with_coins(&h, 1, user).await;

    h.clock.advance(Duration::minutes(20));
    let report = h.hold_sweep().run_once().await.unwrap();
    assert_eq!(report.reservations_cancelled, 1);
    assert_eq!(h.users.lots_of(user).await[0].remaining, 100);

    // the freed unit is sold again
    let unit_id = booking.reservation.unit_id;
    let unit = h.services.snapshot().await.units.get(&unit_id).cloned().unwrap();
    h.coordinator()
        .book(request(&unit, Uuid::new_v4(), date(7, 1), 1))
        .await
        .unwrap();

    let (signature, raw) = h.webhook("payment.captured", &booking.order.order_id, "pay_late");
    let outcome = h.outcomes().handle_webhook(&signature, &raw).await.unwrap();
    let PaymentOutcome::Overbooked { coins_restored, .. } = outcome else {
        panic!("expected overbooked outcome, got {:?}", outcome);
    };
    // already given back by the sweep
    assert_eq!(coins_restored, 0);
    assert_eq!(h.users.lots_of(user).await[0].remaining, 100);
    assert_eq!(h.gateway.refunds()[0].amount, Decimal::from(999));
}

#[tokio::test]
async fn failed_refund_is_filed_on_redelivery() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let booking = book_with_coins(&h, 1, user).await;

    let mut unit = h
        .services
        .snapshot()
        .await
        .units
        .get(&booking.reservation.unit_id)
        .cloned()
        .unwrap();
    unit.capacity = 0;
    h.services.seed_unit(unit).await;
    h.gateway.set_fail_refunds(true);

    let (signature, raw) = h.webhook("payment.captured", &booking.order.order_id, "pay_9");
    let err = h
        .outcomes()
        .handle_webhook(&signature, &raw)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    let reservation = h.services.reservation(booking.reservation.id).await.unwrap();
    assert_eq!(reservation.booking_status, BookingStatus::Cancelled);
    assert_eq!(reservation.payment_status, PaymentStatus::RefundPending);
    assert_eq!(reservation.transaction_ref.as_deref(), Some("pay_9"));
    assert_eq!(
        h.services.hold_for(reservation.id).await.unwrap().status,
        HoldStatus::Cancelled
    );
    assert_eq!(h.users.lots_of(user).await[0].remaining, 100);

    h.gateway.set_fail_refunds(false);
    let outcome = h.outcomes().handle_webhook(&signature, &raw).await.unwrap();
    let PaymentOutcome::Overbooked { refund, .. } = outcome else {
        panic!("expected overbooked outcome, got {:?}", outcome);
    };
    assert_eq!(refund.unwrap().amount, Decimal::from(999));
    let reservation = h.services.reservation(booking.reservation.id).await.unwrap();
    assert_eq!(reservation.payment_status, PaymentStatus::Failed);
    assert!(reservation.refund_ref.is_some());
}

#[tokio::test]
async fn refund_recorded_late_is_filed_once() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let booking = book_with_coins(&h, 1, user).await;

    let mut unit = h
        .services
        .snapshot()
        .await
        .units
        .get(&booking.reservation.unit_id)
        .cloned()
        .unwrap();
    unit.capacity = 0;
    h.services.seed_unit(unit).await;

    // cancellation commits, refund goes out, recording it fails
    h.services.fail_commit_in(2);
    let (signature, raw) = h.webhook("payment.captured", &booking.order.order_id, "pay_11");
    assert!(h.outcomes().handle_webhook(&signature, &raw).await.is_err());
    assert_eq!(h.gateway.refunds().len(), 1);

    let outcome = h.outcomes().handle_webhook(&signature, &raw).await.unwrap();
    let PaymentOutcome::Overbooked { refund, .. } = outcome else {
        panic!("expected overbooked outcome, got {:?}", outcome);
    };
    let refunds = h.gateway.refunds();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refund, Some(refunds[0].clone()));

    let reservation = h.services.reservation(booking.reservation.id).await.unwrap();
    assert_eq!(reservation.payment_status, PaymentStatus::Failed);
    assert_eq!(reservation.refund_ref, Some(refunds[0].refund_id.clone()));

    let again = h.outcomes().handle_webhook(&signature, &raw).await.unwrap();
    assert!(matches!(again, PaymentOutcome::AlreadyProcessed { .. }));
    assert_eq!(h.gateway.refunds().len(), 1);
}

#[tokio::test]
async fn failed_payment_cancels_and_gives_coins_back() {
    let h = Harness::new();
    let referrer = Uuid::new_v4();
    let user = h.referred_user(referrer).await;
    let booking = book_with_coins(&h, 1, user).await;

    let (signature, raw) = h.webhook("payment.failed", &booking.order.order_id, "pay_x");
    let outcome = h.outcomes().handle_webhook(&signature, &raw).await.unwrap();
    assert_eq!(
        outcome,
        PaymentOutcome::Cancelled {
            reservation_id: booking.reservation.id,
            coins_restored: 50,
        }
    );

    let reservation = h.services.reservation(booking.reservation.id).await.unwrap();
    assert_eq!(reservation.booking_status, BookingStatus::Cancelled);
    assert_eq!(reservation.payment_status, PaymentStatus::Failed);
    assert_eq!(
        h.services.hold_for(reservation.id).await.unwrap().status,
        HoldStatus::Cancelled
    );
    assert_eq!(h.users.lots_of(user).await[0].remaining, 100);
    assert_eq!(h.users.issuances().await[0].status, IssuanceStatus::Cancelled);

    let again = h.outcomes().handle_webhook(&signature, &raw).await.unwrap();
    assert!(matches!(again, PaymentOutcome::AlreadyProcessed { .. }));
    assert_eq!(h.users.lots_of(user).await[0].remaining, 100);
}

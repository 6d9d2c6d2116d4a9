//! Row types for both transactional scopes
//!
//! Services scope: [`Reservation`], [`InventoryUnit`], [`RateOverride`],
//! [`Offer`], [`InventoryHold`]. Users scope: [`CoinLot`], [`CoinLedgerEntry`],
//! [`PendingIssuance`], [`UserProfile`]. [`JobState`] rows exist in both.
//! Status columns are stored as text and decoded through `TryFrom<String>`.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Stored status text did not match any known variant
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim().to_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(UnknownVariant {
                        kind: $kind,
                        value: value.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = UnknownVariant;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    };
}

text_enum! {
    /// Product category; also the key for per-category coin caps
    ProductType, "product type" {
        Lodging => "lodging",
        FestivalPass => "festival_pass",
        Trip => "trip",
    }
}

text_enum! {
    /// `refund_pending`: cancelled and committed, gateway refund not yet recorded
    PaymentStatus, "payment status" {
        Pending => "pending",
        Paid => "paid",
        Failed => "failed",
        Refunded => "refunded",
        NoRefund => "norefund",
        RefundPending => "refund_pending",
    }
}

text_enum! {
    BookingStatus, "booking status" {
        Pending => "pending",
        Confirmed => "confirmed",
        Cancelled => "cancelled",
        Completed => "completed",
        NoShow => "no_show",
    }
}

text_enum! {
    HoldStatus, "hold status" {
        Pending => "pending",
        Confirmed => "confirmed",
        Cancelled => "cancelled",
    }
}

text_enum! {
    OfferStatus, "offer status" {
        Active => "active",
        Inactive => "inactive",
    }
}

text_enum! {
    /// Where a coin lot came from
    LotSource, "lot source" {
        SignupBonus => "signup_bonus",
        Referral => "referral",
        Refund => "refund",
        GracePeriod => "grace_period",
        Promotion => "promotion",
    }
}

text_enum! {
    LedgerDirection, "ledger direction" {
        Earned => "earned",
        Used => "used",
        Refund => "refund",
    }
}

text_enum! {
    LedgerStatus, "ledger status" {
        Pending => "pending",
        Issued => "issued",
        NotValid => "not_valid",
    }
}

text_enum! {
    IssuanceStatus, "issuance status" {
        Pending => "pending",
        Issued => "issued",
        Cancelled => "cancelled",
    }
}

text_enum! {
    /// Background job whose run flag is tracked in `job_state`
    JobEntity, "job entity" {
        HoldExpiry => "hold_expiry",
        IssuancePromotion => "issuance_promotion",
    }
}

/// Half-open date window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn overlaps(&self, other_start: NaiveDate, other_end: NaiveDate) -> bool {
        other_start < self.end && other_end > self.start
    }

    /// Each date in the window, end exclusive
    pub fn nights(&self) -> impl Iterator<Item = NaiveDate> {
        let start = self.start;
        let count = (self.end - self.start).num_days().max(0);
        (0..count).map(move |offset| start + Duration::days(offset))
    }

    /// Inclusive last date covered by the window
    pub fn last_date(&self) -> NaiveDate {
        self.end - Duration::days(1)
    }
}

/// Price components stored on the reservation
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, FromRow)]
pub struct AmountBreakdown {
    pub base: Decimal,
    pub extras: Decimal,
    pub discount: Decimal,
    pub coins_applied: i64,
    pub coins_discount_value: Decimal,
    pub service_fee: Decimal,
    pub gst_amount: Decimal,
    pub total_payable: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Reservation {
    pub id: Uuid,
    pub user_id: Uuid,
    #[sqlx(try_from = "String")]
    pub product_type: ProductType,
    pub product_id: Uuid,
    pub unit_id: Uuid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub quantity: i32,
    pub adults: i32,
    pub children: i32,
    #[sqlx(flatten)]
    pub amount: AmountBreakdown,
    pub offer_code: Option<String>,
    #[sqlx(try_from = "String")]
    pub payment_status: PaymentStatus,
    #[sqlx(try_from = "String")]
    pub booking_status: BookingStatus,
    pub gateway_order_id: Option<String>,
    pub transaction_ref: Option<String>,
    pub refund_amount: Option<Decimal>,
    pub refund_ref: Option<String>,
    /// Policy percentage of a user cancellation; unset for refunds of
    /// captures that could not be honoured
    pub refund_pct: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn window(&self) -> DateWindow {
        DateWindow::new(self.start_date, self.end_date)
    }

    pub fn is_payment_pending(&self) -> bool {
        self.payment_status == PaymentStatus::Pending
            && self.booking_status == BookingStatus::Pending
    }

    pub fn is_refund_pending(&self) -> bool {
        self.payment_status == PaymentStatus::RefundPending
    }
}

/// The contended row: every capacity-touching transaction locks it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct InventoryUnit {
    pub id: Uuid,
    pub product_id: Uuid,
    #[sqlx(try_from = "String")]
    pub product_type: ProductType,
    pub capacity: i32,
    pub base_rate: Decimal,
    pub extra_adult_rate: Decimal,
    pub child_rate: Decimal,
    pub included_occupants: i32,
    pub cancellation_policy: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RateOverride {
    pub unit_id: Uuid,
    pub date: NaiveDate,
    pub rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Offer {
    pub id: Uuid,
    pub code: String,
    #[sqlx(try_from = "String")]
    pub status: OfferStatus,
    pub discount_pct: Decimal,
    pub booking_window_start: NaiveDate,
    pub booking_window_end: NaiveDate,
    pub stay_start: NaiveDate,
    pub stay_end: NaiveDate,
    pub entity_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct InventoryHold {
    pub id: Uuid,
    pub product_id: Uuid,
    pub unit_id: Uuid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub quantity: i32,
    #[sqlx(try_from = "String")]
    pub status: HoldStatus,
    pub reservation_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl InventoryHold {
    pub fn window(&self) -> DateWindow {
        DateWindow::new(self.start_date, self.end_date)
    }

    /// Pending and confirmed holds count against capacity
    pub fn is_live(&self) -> bool {
        matches!(self.status, HoldStatus::Pending | HoldStatus::Confirmed)
    }
}

/// A batch of coins with its own expiry; `0 <= remaining <= amount`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CoinLot {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub remaining: i64,
    #[sqlx(try_from = "String")]
    pub source_type: LotSource,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl CoinLot {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.remaining > 0 && self.is_valid(now)
    }
}

/// Coins taken from one lot by a spend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotAllocation {
    pub lot_id: Uuid,
    pub coins: i64,
}

/// Metadata stored on `used` ledger entries
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UsedEntryMetadata {
    pub category: String,
    #[serde(default)]
    pub allocations: Vec<LotAllocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CoinLedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    #[sqlx(try_from = "String")]
    pub direction: LedgerDirection,
    #[sqlx(try_from = "String")]
    pub status: LedgerStatus,
    pub reference_id: Uuid,
    pub coins: i64,
    pub reason: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl CoinLedgerEntry {
    /// Lot allocation recorded on a `used` entry; empty when absent or malformed
    pub fn used_metadata(&self) -> UsedEntryMetadata {
        serde_json::from_value(self.metadata.clone()).unwrap_or_default()
    }
}

/// A reward that is not yet safe to credit
///
/// Lifecycle: created with `issue = false`, armed (`issue = true`) on payment
/// capture, then `issued` by the promotion sweep or `cancelled` on unwind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PendingIssuance {
    pub id: Uuid,
    pub user_id: Uuid,
    #[sqlx(try_from = "String")]
    pub source_type: LotSource,
    /// Reservation that triggered the reward
    pub source_id: Uuid,
    /// User whose action earned the reward (the referred user for referrals)
    pub source_user_id: Uuid,
    pub coins_to_issue: i64,
    pub issue_at: DateTime<Utc>,
    pub issue: bool,
    #[sqlx(try_from = "String")]
    pub status: IssuanceStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct JobState {
    #[sqlx(try_from = "String")]
    pub entity: JobEntity,
    pub active: bool,
    pub last_run: Option<DateTime<Utc>>,
}

impl JobState {
    pub fn inactive(entity: JobEntity) -> Self {
        Self {
            entity,
            active: false,
            last_run: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UserProfile {
    pub id: Uuid,
    pub referred_by: Option<Uuid>,
}

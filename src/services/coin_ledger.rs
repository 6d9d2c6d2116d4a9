//! Coin wallet made of expiring lots
//!
//! Spending walks usable lots ordered by expiry (ties by creation time, then
//! id) and records the exact per-lot allocation on a single `used` ledger
//! entry. Reversal replays that allocation backwards, so a refund restores
//! coins to the lots they came from while those lots are still valid; whatever
//! cannot go back is issued as a short-lived grace lot.
//!
//! All operations run inside a caller-owned users-scope transaction and take
//! the per-user wallet lock first.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::database::error::DatabaseError;
use crate::database::models::{
    CoinLedgerEntry, CoinLot, LedgerDirection, LedgerStatus, LotAllocation, LotSource,
    ProductType, UsedEntryMetadata,
};
use crate::database::store::UsersTx;
use crate::error::AppError;

#[derive(Debug, Clone, Error)]
pub enum CoinLedgerError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// A lot changed between quote and apply
    #[error("coin lot {lot_id} cannot cover {coins} coins")]
    AllocationMismatch { lot_id: Uuid, coins: i64 },

    #[error("invalid coin amount: {0}")]
    InvalidAmount(i64),
}

impl From<CoinLedgerError> for AppError {
    fn from(err: CoinLedgerError) -> Self {
        match err {
            CoinLedgerError::Database(db) => db.into(),
            other => DatabaseError::new(crate::database::error::DatabaseErrorKind::Unknown {
                message: other.to_string(),
            })
            .into(),
        }
    }
}

pub type LedgerResult<T> = Result<T, CoinLedgerError>;

/// How many coins a booking may use and where they come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinQuote {
    pub usable_coins: i64,
    pub discount_value: Decimal,
    pub allocations: Vec<LotAllocation>,
}

impl CoinQuote {
    pub fn none() -> Self {
        Self {
            usable_coins: 0,
            discount_value: Decimal::ZERO,
            allocations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletBalance {
    pub available: i64,
    pub next_expiry: Option<DateTime<Utc>>,
}

/// First instant of the UTC calendar month containing `now`
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(now)
}

#[derive(Debug, Clone)]
pub struct CoinLedger {
    config: LedgerConfig,
}

impl CoinLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Decide how many of `requested` coins can be used.
    ///
    /// Limits (per-transaction, category monthly, global monthly, price) cap
    /// the amount silently.
    pub async fn quote(
        &self,
        tx: &mut dyn UsersTx,
        user_id: Uuid,
        requested: i64,
        price_before_coins: Decimal,
        category: ProductType,
        now: DateTime<Utc>,
    ) -> LedgerResult<CoinQuote> {
        if requested < 0 {
            return Err(CoinLedgerError::InvalidAmount(requested));
        }
        if requested == 0 {
            return Ok(CoinQuote::none());
        }

        tx.lock_wallet(user_id).await?;
        let lots: Vec<CoinLot> = tx
            .lots_for_user(user_id)
            .await?
            .into_iter()
            .filter(|lot| lot.is_usable(now))
            .collect();
        let available: i64 = lots.iter().map(|lot| lot.remaining).sum();

        let since = month_start(now);
        let used_in_category = tx
            .coins_used_since(user_id, since, Some(category.as_str()))
            .await?;
        let used_this_month = tx.coins_used_since(user_id, since, None).await?;

        let category_headroom =
            (self.config.category_cap(category.as_str()) - used_in_category).max(0);
        let monthly_headroom = (self.config.monthly_cap - used_this_month).max(0);
        let price_cap = (price_before_coins.max(Decimal::ZERO) / self.config.coin_value)
            .floor()
            .to_i64()
            .unwrap_or(0);

        let usable = [
            requested,
            available,
            self.config.per_transaction_cap,
            category_headroom,
            monthly_headroom,
            price_cap,
        ]
        .into_iter()
        .min()
        .unwrap_or(0)
        .max(0);

        if usable < requested {
            debug!(
                user_id = %user_id,
                requested,
                usable,
                available,
                category_headroom,
                monthly_headroom,
                "coin usage capped"
            );
        }

        let mut allocations = Vec::new();
        let mut still_needed = usable;
        for lot in &lots {
            if still_needed == 0 {
                break;
            }
            let take = lot.remaining.min(still_needed);
            allocations.push(LotAllocation {
                lot_id: lot.id,
                coins: take,
            });
            still_needed -= take;
        }

        Ok(CoinQuote {
            usable_coins: usable,
            discount_value: Decimal::from(usable) * self.config.coin_value,
            allocations,
        })
    }

    /// Deduct a quote from its lots and record one pending `used` entry
    pub async fn apply(
        &self,
        tx: &mut dyn UsersTx,
        user_id: Uuid,
        quote: &CoinQuote,
        reference_id: Uuid,
        category: ProductType,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<CoinLedgerEntry>> {
        if quote.usable_coins == 0 {
            return Ok(None);
        }

        tx.lock_wallet(user_id).await?;
        let lots = tx.lots_for_user(user_id).await?;

        for allocation in &quote.allocations {
            let lot = lots
                .iter()
                .find(|lot| lot.id == allocation.lot_id)
                .filter(|lot| lot.is_usable(now) && lot.remaining >= allocation.coins)
                .ok_or(CoinLedgerError::AllocationMismatch {
                    lot_id: allocation.lot_id,
                    coins: allocation.coins,
                })?;
            tx.update_lot_remaining(lot.id, lot.remaining - allocation.coins)
                .await?;
        }

        let metadata = UsedEntryMetadata {
            category: category.as_str().to_string(),
            allocations: quote.allocations.clone(),
        };
        let entry = CoinLedgerEntry {
            id: Uuid::new_v4(),
            user_id,
            direction: LedgerDirection::Used,
            status: LedgerStatus::Pending,
            reference_id,
            coins: quote.usable_coins,
            reason: format!("{} booking", category),
            metadata: serde_json::to_value(&metadata).unwrap_or_else(|_| json!({})),
            created_at: now,
        };
        tx.insert_ledger_entry(&entry).await?;

        Ok(Some(entry))
    }

    /// Flip pending `used` entries for `reference_id` to issued
    pub async fn finalize(
        &self,
        tx: &mut dyn UsersTx,
        user_id: Uuid,
        reference_id: Uuid,
    ) -> LedgerResult<usize> {
        let entries = tx.ledger_entries_for_reference(user_id, reference_id).await?;
        let mut finalized = 0;
        for entry in entries
            .iter()
            .filter(|e| e.direction == LedgerDirection::Used && e.status == LedgerStatus::Pending)
        {
            tx.set_ledger_status(entry.id, LedgerStatus::Issued).await?;
            finalized += 1;
        }
        Ok(finalized)
    }

    /// Give back `floor(used × refund_pct / 100)` coins spent on `reference_id`.
    ///
    /// A no-op when nothing was spent, when the spend is already void, or when
    /// a refund entry exists for the reference.
    pub async fn reverse(
        &self,
        tx: &mut dyn UsersTx,
        user_id: Uuid,
        reference_id: Uuid,
        refund_pct: u32,
        now: DateTime<Utc>,
    ) -> LedgerResult<i64> {
        let refund_pct = refund_pct.min(100);
        if refund_pct == 0 {
            return Ok(0);
        }

        tx.lock_wallet(user_id).await?;
        let entries = tx.ledger_entries_for_reference(user_id, reference_id).await?;
        if entries
            .iter()
            .any(|e| e.direction == LedgerDirection::Refund)
        {
            debug!(reference_id = %reference_id, "coins already refunded");
            return Ok(0);
        }

        let spends: Vec<&CoinLedgerEntry> = entries
            .iter()
            .filter(|e| e.direction == LedgerDirection::Used && e.status != LedgerStatus::NotValid)
            .collect();
        if spends.is_empty() {
            return Ok(0);
        }

        let mut lots = tx.lots_for_user(user_id).await?;
        let mut restored_total = 0;

        for spend in spends {
            let to_restore = spend.coins * i64::from(refund_pct) / 100;
            let mut owed = to_restore;
            let mut restored_to = Vec::new();

            // Consumed lots still valid, oldest expiry first
            let allocations = spend.used_metadata().allocations;
            for lot in lots.iter_mut().filter(|lot| lot.is_valid(now)) {
                if owed == 0 {
                    break;
                }
                let consumed: i64 = allocations
                    .iter()
                    .filter(|a| a.lot_id == lot.id)
                    .map(|a| a.coins)
                    .sum();
                let give_back = consumed.min(owed).min(lot.amount - lot.remaining);
                if give_back <= 0 {
                    continue;
                }
                lot.remaining += give_back;
                tx.update_lot_remaining(lot.id, lot.remaining).await?;
                restored_to.push(LotAllocation {
                    lot_id: lot.id,
                    coins: give_back,
                });
                owed -= give_back;
            }

            let grace_lot = if owed > 0 {
                let lot = CoinLot {
                    id: Uuid::new_v4(),
                    user_id,
                    amount: owed,
                    remaining: owed,
                    source_type: LotSource::GracePeriod,
                    expires_at: now + Duration::days(self.config.grace_period_days),
                    created_at: now,
                };
                tx.insert_lot(&lot).await?;
                info!(
                    user_id = %user_id,
                    reference_id = %reference_id,
                    coins = owed,
                    "issued grace lot for coins whose lots expired"
                );
                Some(lot.id)
            } else {
                None
            };

            if spend.status == LedgerStatus::Pending && refund_pct == 100 {
                tx.set_ledger_status(spend.id, LedgerStatus::NotValid)
                    .await?;
            } else {
                let refund = CoinLedgerEntry {
                    id: Uuid::new_v4(),
                    user_id,
                    direction: LedgerDirection::Refund,
                    status: LedgerStatus::Issued,
                    reference_id,
                    coins: to_restore,
                    reason: format!("{}% refund of booking coins", refund_pct),
                    metadata: json!({
                        "refund_pct": refund_pct,
                        "restored_to": restored_to,
                        "grace_lot": grace_lot,
                    }),
                    created_at: now,
                };
                tx.insert_ledger_entry(&refund).await?;
            }

            restored_total += to_restore;
        }

        if restored_total > 0 {
            info!(
                user_id = %user_id,
                reference_id = %reference_id,
                refund_pct,
                restored = restored_total,
                "booking coins reversed"
            );
        }

        Ok(restored_total)
    }

    /// Credit a new lot with a matching issued `earned` entry
    #[allow(clippy::too_many_arguments)]
    pub async fn issue(
        &self,
        tx: &mut dyn UsersTx,
        user_id: Uuid,
        amount: i64,
        source_type: LotSource,
        expires_at: DateTime<Utc>,
        reference_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<CoinLot> {
        if amount <= 0 {
            return Err(CoinLedgerError::InvalidAmount(amount));
        }
        if expires_at <= now {
            warn!(
                user_id = %user_id,
                expires_at = %expires_at,
                "issuing a lot that is already expired"
            );
        }

        tx.lock_wallet(user_id).await?;
        let lot = CoinLot {
            id: Uuid::new_v4(),
            user_id,
            amount,
            remaining: amount,
            source_type,
            expires_at,
            created_at: now,
        };
        tx.insert_lot(&lot).await?;

        let entry = CoinLedgerEntry {
            id: Uuid::new_v4(),
            user_id,
            direction: LedgerDirection::Earned,
            status: LedgerStatus::Issued,
            reference_id,
            coins: amount,
            reason: reason.to_string(),
            metadata: json!({ "lot_id": lot.id, "source_type": source_type.as_str() }),
            created_at: now,
        };
        tx.insert_ledger_entry(&entry).await?;

        Ok(lot)
    }

    pub async fn balance(
        &self,
        tx: &mut dyn UsersTx,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> LedgerResult<WalletBalance> {
        let usable: Vec<CoinLot> = tx
            .lots_for_user(user_id)
            .await?
            .into_iter()
            .filter(|lot| lot.is_usable(now))
            .collect();

        Ok(WalletBalance {
            available: usable.iter().map(|lot| lot.remaining).sum(),
            next_expiry: usable.iter().map(|lot| lot.expires_at).min(),
        })
    }
}

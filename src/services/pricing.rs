//! Price, fee and discount calculation
//!
//! Pure: everything the calculator needs (unit rates, per-date overrides, the
//! offer row, coins already decided) is passed in.
//!
//! Order of operations:
//! 1. base = sum of nightly rates × rooms (lodging) or start-date rate × quantity
//! 2. extras for occupants beyond what the rooms include (lodging only)
//! 3. offer discount on the base
//! 4. coin discount
//! 5. service fee and GST banded on the taxable amount

use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use thiserror::Error;

use crate::config::{FeeSlab, GstSlab, PricingConfig};
use crate::database::models::{
    AmountBreakdown, DateWindow, InventoryUnit, Offer, OfferStatus, ProductType, RateOverride,
};
use crate::error::{AppError, DomainError, ValidationError};

/// Stored on the reservation as its amount columns
pub type PriceBreakdown = AmountBreakdown;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PricingError {
    #[error("offer {code} not applicable: {reason}")]
    OfferNotApplicable { code: String, reason: String },

    #[error("invalid pricing input: {0}")]
    InvalidInput(String),
}

impl From<PricingError> for AppError {
    fn from(err: PricingError) -> Self {
        match err {
            PricingError::OfferNotApplicable { code, reason } => {
                AppError::domain(DomainError::OfferNotApplicable { code, reason })
            }
            PricingError::InvalidInput(reason) => {
                AppError::validation(ValidationError::InvalidPayload { reason })
            }
        }
    }
}

pub struct PricingInput<'a> {
    pub unit: &'a InventoryUnit,
    pub window: DateWindow,
    pub quantity: i32,
    pub adults: i32,
    pub children: i32,
    pub rate_overrides: &'a [RateOverride],
    /// Code as the customer typed it; `offer` is the row it resolved to, if any
    pub offer_code: Option<&'a str>,
    pub offer: Option<&'a Offer>,
    /// Booking date used for the offer's booking window
    pub today: NaiveDate,
    pub coins_applied: i64,
    pub coin_value: Decimal,
}

/// Round to whole currency units, half away from zero
pub fn round_currency(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

impl AmountBreakdown {
    /// `base + extras - discount`, the amount coins may be applied against
    pub fn price_before_coins(&self) -> Decimal {
        (self.base + self.extras - self.discount).max(Decimal::ZERO)
    }

    pub fn taxable_amount(&self) -> Decimal {
        (self.price_before_coins() - self.coins_discount_value).max(Decimal::ZERO)
    }
}

#[derive(Debug, Clone)]
pub struct PricingCalculator {
    fee_slabs: Vec<FeeSlab>,
    gst_slabs: Vec<GstSlab>,
}

impl Default for PricingCalculator {
    fn default() -> Self {
        Self::new(&PricingConfig::default())
    }
}

impl PricingCalculator {
    pub fn new(config: &PricingConfig) -> Self {
        Self {
            fee_slabs: config.fee_slabs.clone(),
            gst_slabs: config.gst_slabs.clone(),
        }
    }

    pub fn price(&self, input: &PricingInput<'_>) -> Result<PriceBreakdown, PricingError> {
        if input.window.is_empty() {
            return Err(PricingError::InvalidInput(
                "date window is empty".to_string(),
            ));
        }
        if input.quantity < 1 {
            return Err(PricingError::InvalidInput(
                "quantity must be at least 1".to_string(),
            ));
        }
        if input.coins_applied < 0 {
            return Err(PricingError::InvalidInput(
                "coins cannot be negative".to_string(),
            ));
        }

        let overrides: HashMap<NaiveDate, Decimal> = input
            .rate_overrides
            .iter()
            .filter(|r| r.unit_id == input.unit.id)
            .map(|r| (r.date, r.rate))
            .collect();
        let rate_on = |date: NaiveDate| {
            overrides
                .get(&date)
                .copied()
                .unwrap_or(input.unit.base_rate)
        };
        let quantity = Decimal::from(input.quantity);

        let (base, extras) = match input.unit.product_type {
            ProductType::Lodging => {
                let nightly_total: Decimal = input.window.nights().map(rate_on).sum();
                let nights = Decimal::from(input.window.nights().count() as i64);
                let base = nightly_total * quantity;
                let extras = nights * self.nightly_extras(input);
                (base, extras)
            }
            ProductType::FestivalPass | ProductType::Trip => {
                (rate_on(input.window.start) * quantity, Decimal::ZERO)
            }
        };

        let discount = match (input.offer_code, input.offer) {
            (None, _) => Decimal::ZERO,
            (Some(code), None) => {
                return Err(PricingError::OfferNotApplicable {
                    code: code.to_string(),
                    reason: "unknown offer code".to_string(),
                })
            }
            (Some(code), Some(offer)) => {
                check_offer(code, offer, input)?;
                round_currency(base * offer.discount_pct / Decimal::ONE_HUNDRED)
            }
        };

        let mut breakdown = AmountBreakdown {
            base,
            extras,
            discount,
            coins_applied: input.coins_applied,
            coins_discount_value: Decimal::from(input.coins_applied) * input.coin_value,
            ..AmountBreakdown::default()
        };

        let taxable = breakdown.taxable_amount();
        breakdown.service_fee = self.service_fee(taxable);
        breakdown.gst_amount = round_currency(taxable * self.gst_pct(taxable) / Decimal::ONE_HUNDRED);
        breakdown.total_payable = taxable + breakdown.service_fee + breakdown.gst_amount;

        Ok(breakdown)
    }

    /// Charge per night for occupants beyond the rooms' included count
    fn nightly_extras(&self, input: &PricingInput<'_>) -> Decimal {
        let included = input.unit.included_occupants.max(0) * input.quantity;
        let extra_adults = (input.adults - included).max(0);
        let free_child_places = (included - input.adults).max(0);
        let extra_children = (input.children - free_child_places).max(0);

        Decimal::from(extra_adults) * input.unit.extra_adult_rate
            + Decimal::from(extra_children) * input.unit.child_rate
    }

    pub fn service_fee(&self, taxable: Decimal) -> Decimal {
        self.fee_slabs
            .iter()
            .find(|slab| slab.upto.map_or(true, |upto| taxable <= upto))
            .map(|slab| slab.fee)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn gst_pct(&self, taxable: Decimal) -> Decimal {
        self.gst_slabs
            .iter()
            .find(|slab| slab.upto.map_or(true, |upto| taxable <= upto))
            .map(|slab| slab.pct)
            .unwrap_or(Decimal::ZERO)
    }
}

fn check_offer(code: &str, offer: &Offer, input: &PricingInput<'_>) -> Result<(), PricingError> {
    let reject = |reason: &str| PricingError::OfferNotApplicable {
        code: code.to_string(),
        reason: reason.to_string(),
    };

    if !offer.code.eq_ignore_ascii_case(code.trim()) {
        return Err(reject("unknown offer code"));
    }
    if offer.status != OfferStatus::Active {
        return Err(reject("offer is not active"));
    }
    if input.today < offer.booking_window_start || input.today > offer.booking_window_end {
        return Err(reject("outside the offer's booking window"));
    }
    if input.window.start < offer.stay_start || input.window.last_date() > offer.stay_end {
        return Err(reject("stay dates outside the offer's validity"));
    }
    if !offer.entity_ids.contains(&input.unit.product_id) {
        return Err(reject("offer does not cover this product"));
    }

    Ok(())
}

//! Sales aggregation.
//!
//! Reduces the sold-item list of a livestream into a gross total and an
//! estimated net total after payment-processing and platform fees. All
//! money math is done in `Decimal`, so totals are exact at full precision
//! and only rounded when rendered.

use crate::config::FeeConfig;
use crate::shop::SaleRecord;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// Per-item fee model.
///
/// `processing_fee = price * processing_rate - processing_fixed`
/// `platform_fee   = price * platform_rate`
///
/// The processing fee goes negative on cheap items. That is kept as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSchedule {
    pub processing_rate: Decimal,
    pub processing_fixed: Decimal,
    pub platform_rate: Decimal,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self::from(&FeeConfig::default())
    }
}

impl From<&FeeConfig> for FeeSchedule {
    fn from(cfg: &FeeConfig) -> Self {
        Self {
            processing_rate: cfg.processing_rate,
            processing_fixed: cfg.processing_fixed,
            platform_rate: cfg.platform_rate,
        }
    }
}

impl FeeSchedule {
    pub fn processing_fee(&self, price: Decimal) -> Decimal {
        price * self.processing_rate - self.processing_fixed
    }

    pub fn platform_fee(&self, price: Decimal) -> Decimal {
        price * self.platform_rate
    }

    pub fn net(&self, price: Decimal) -> Decimal {
        price - self.processing_fee(price) - self.platform_fee(price)
    }
}

/// Result of one sales check, recomputed from scratch every time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateResult {
    pub total_sales: Decimal,
    pub total_after_fees: Decimal,
    pub sales_count: usize,
    pub last_updated: DateTime<Utc>,
}

/// Gross revenue in major currency units.
pub fn calculate_total(records: &[SaleRecord]) -> Decimal {
    records.iter().map(SaleRecord::price).sum()
}

/// Net revenue after per-item fees under the default schedule.
pub fn calculate_total_after_fees(records: &[SaleRecord]) -> Decimal {
    calculate_total_after_fees_with(records, &FeeSchedule::default())
}

pub fn calculate_total_after_fees_with(records: &[SaleRecord], fees: &FeeSchedule) -> Decimal {
    records.iter().map(|r| fees.net(r.price())).sum()
}

pub fn aggregate(records: &[SaleRecord], fees: &FeeSchedule, now: DateTime<Utc>) -> AggregateResult {
    AggregateResult {
        total_sales: calculate_total(records),
        total_after_fees: calculate_total_after_fees_with(records, fees),
        sales_count: records.len(),
        last_updated: now,
    }
}

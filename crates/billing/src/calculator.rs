//! Storage cost and charge calculation
//!
//! Pure functions over a pinned-byte count. All money is computed in USD and
//! converted once to the billing currency at a fixed rate.

use serde::{Deserialize, Serialize};

use crate::config::{
    positive_or_default, BillingConfig, DEFAULT_COST_PER_GB_USD, DEFAULT_FREE_TIER_GB,
    DEFAULT_MIN_CHARGE, DEFAULT_USD_TO_INR_RATE,
};

const BYTES_PER_GB: f64 = (1u64 << 30) as f64;

/// Binary gigabytes (bytes / 2^30)
pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

/// Monthly USD cost of `pinned_bytes` above the free tier
pub fn monthly_cost(pinned_bytes: u64, free_tier_gb: f64, cost_per_gb: f64) -> f64 {
    let free_tier_gb = positive_or_default("free_tier_gb", free_tier_gb, DEFAULT_FREE_TIER_GB);
    let cost_per_gb = positive_or_default("cost_per_gb_usd", cost_per_gb, DEFAULT_COST_PER_GB_USD);

    let billable_gb = (bytes_to_gb(pinned_bytes) - free_tier_gb).max(0.0);
    billable_gb * cost_per_gb
}

/// Strictly above the free tier; exactly at the boundary is not exceeding
pub fn exceeds_free_tier(pinned_bytes: u64, free_tier_gb: f64) -> bool {
    let free_tier_gb = positive_or_default("free_tier_gb", free_tier_gb, DEFAULT_FREE_TIER_GB);
    bytes_to_gb(pinned_bytes) > free_tier_gb
}

/// Payable amount in the billing currency, or 0 when nothing is owed
pub fn charge_amount(monthly_cost_usd: f64, fx_rate: f64, min_charge: f64) -> f64 {
    if !monthly_cost_usd.is_finite() || monthly_cost_usd <= 0.0 {
        return 0.0;
    }
    let fx_rate = positive_or_default("usd_to_inr_rate", fx_rate, DEFAULT_USD_TO_INR_RATE);
    let min_charge = positive_or_default("min_charge", min_charge, DEFAULT_MIN_CHARGE);

    round2(monthly_cost_usd * fx_rate).max(min_charge)
}

/// Round to 2 decimal places, half away from zero
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Major units to minor units (e.g. rupees to paise)
pub fn to_minor(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

/// Breakdown of the charge for one account and one billing period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Charge {
    pub pinned_bytes: u64,
    pub exceeds_free_tier: bool,
    pub monthly_cost_usd: f64,
    /// Payable amount in major units of `currency`
    pub amount: f64,
    pub amount_minor: i64,
    pub currency: String,
}

impl Charge {
    pub fn is_due(&self) -> bool {
        self.amount_minor > 0
    }
}

/// Calculator bound to a billing configuration
#[derive(Debug, Clone)]
pub struct BillingCalculator {
    config: BillingConfig,
}

impl BillingCalculator {
    pub fn new(config: BillingConfig) -> Self {
        Self {
            config: config.sanitized(),
        }
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    pub fn monthly_cost(&self, pinned_bytes: u64) -> f64 {
        monthly_cost(pinned_bytes, self.config.free_tier_gb, self.config.cost_per_gb_usd)
    }

    pub fn exceeds_free_tier(&self, pinned_bytes: u64) -> bool {
        exceeds_free_tier(pinned_bytes, self.config.free_tier_gb)
    }

    pub fn charge_for(&self, pinned_bytes: u64) -> Charge {
        let monthly_cost_usd = self.monthly_cost(pinned_bytes);
        let amount = charge_amount(
            monthly_cost_usd,
            self.config.usd_to_inr_rate,
            self.config.min_charge,
        );

        Charge {
            pinned_bytes,
            exceeds_free_tier: self.exceeds_free_tier(pinned_bytes),
            monthly_cost_usd,
            amount,
            amount_minor: to_minor(amount),
            currency: self.config.currency.clone(),
        }
    }
}

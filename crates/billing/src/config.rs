//! Billing configuration
//!
//! Every numeric knob is validated on load. Values that are missing,
//! unparsable, non-finite or not strictly positive fall back to the
//! documented default and a warning is logged; a bad environment never fails
//! a request or produces a NaN/negative charge.

use std::env;
use std::time::Duration;

use crate::error::BillingError;

pub const DEFAULT_FREE_TIER_GB: f64 = 5.0;
pub const DEFAULT_COST_PER_GB_USD: f64 = 0.40;
pub const DEFAULT_MIN_CHARGE: f64 = 1.0;
pub const DEFAULT_USD_TO_INR_RATE: f64 = 83.0;
pub const DEFAULT_CURRENCY: &str = "INR";
pub const DEFAULT_BILLING_CYCLE_DAYS: u32 = 30;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_POLL_MAX_ATTEMPTS: u32 = 60;
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;
pub const DEFAULT_CUSTOMER_PHONE: &str = "9999999999";
pub const DEFAULT_RETURN_URL: &str = "http://localhost:3000/billing/return?order_id={order_id}";
pub const DEFAULT_NOTIFY_URL: &str = "http://localhost:3000/webhooks/cashfree";

/// Rates, thresholds and schedules for the billing engine
#[derive(Debug, Clone, PartialEq)]
pub struct BillingConfig {
    /// Free tier in binary gigabytes
    pub free_tier_gb: f64,
    /// Monthly USD rate per gigabyte over the free tier
    pub cost_per_gb_usd: f64,
    /// Smallest payable charge, in the billing currency
    pub min_charge: f64,
    /// Fixed USD to billing-currency conversion
    pub usd_to_inr_rate: f64,
    pub currency: String,
    /// Provider-side order lifetime
    pub billing_cycle_days: u32,
    pub poll_interval: Duration,
    pub poll_max_attempts: u32,
    pub webhook_tolerance: Duration,
    /// Used when an account has no phone number on file
    pub default_customer_phone: String,
    /// Checkout redirect; `{order_id}` is replaced with the provider order id
    pub return_url: String,
    /// Webhook target registered with each order
    pub notify_url: String,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            free_tier_gb: DEFAULT_FREE_TIER_GB,
            cost_per_gb_usd: DEFAULT_COST_PER_GB_USD,
            min_charge: DEFAULT_MIN_CHARGE,
            usd_to_inr_rate: DEFAULT_USD_TO_INR_RATE,
            currency: DEFAULT_CURRENCY.to_string(),
            billing_cycle_days: DEFAULT_BILLING_CYCLE_DAYS,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            poll_max_attempts: DEFAULT_POLL_MAX_ATTEMPTS,
            webhook_tolerance: Duration::from_secs(DEFAULT_WEBHOOK_TOLERANCE_SECS),
            default_customer_phone: DEFAULT_CUSTOMER_PHONE.to_string(),
            return_url: DEFAULT_RETURN_URL.to_string(),
            notify_url: DEFAULT_NOTIFY_URL.to_string(),
        }
    }
}

impl BillingConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            free_tier_gb: positive_f64_from_env("FREE_TIER_GB", DEFAULT_FREE_TIER_GB),
            cost_per_gb_usd: positive_f64_from_env("COST_PER_GB_USD", DEFAULT_COST_PER_GB_USD),
            min_charge: positive_f64_from_env("MIN_CHARGE", DEFAULT_MIN_CHARGE),
            usd_to_inr_rate: positive_f64_from_env("USD_TO_INR_RATE", DEFAULT_USD_TO_INR_RATE),
            currency: env::var("BILLING_CURRENCY")
                .ok()
                .map(|c| c.trim().to_uppercase())
                .filter(|c| c.len() == 3 && c.chars().all(|ch| ch.is_ascii_alphabetic()))
                .unwrap_or(defaults.currency),
            billing_cycle_days: positive_int_from_env("BILLING_CYCLE_DAYS", DEFAULT_BILLING_CYCLE_DAYS),
            poll_interval: Duration::from_secs(positive_int_from_env(
                "ORDER_POLL_INTERVAL_SECS",
                DEFAULT_POLL_INTERVAL_SECS,
            )),
            poll_max_attempts: positive_int_from_env("ORDER_POLL_MAX_ATTEMPTS", DEFAULT_POLL_MAX_ATTEMPTS),
            webhook_tolerance: Duration::from_secs(positive_int_from_env(
                "WEBHOOK_TOLERANCE_SECS",
                DEFAULT_WEBHOOK_TOLERANCE_SECS,
            )),
            default_customer_phone: env::var("DEFAULT_CUSTOMER_PHONE")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or(defaults.default_customer_phone),
            return_url: env::var("PAYMENT_RETURN_URL").unwrap_or(defaults.return_url),
            notify_url: env::var("PAYMENT_NOTIFY_URL").unwrap_or(defaults.notify_url),
        }
    }

    /// Replace any invalid rate or threshold with its default.
    ///
    /// Applied to configs built in code; `from_env` already sanitizes.
    pub fn sanitized(mut self) -> Self {
        self.free_tier_gb = positive_or_default("free_tier_gb", self.free_tier_gb, DEFAULT_FREE_TIER_GB);
        self.cost_per_gb_usd =
            positive_or_default("cost_per_gb_usd", self.cost_per_gb_usd, DEFAULT_COST_PER_GB_USD);
        self.min_charge = positive_or_default("min_charge", self.min_charge, DEFAULT_MIN_CHARGE);
        self.usd_to_inr_rate =
            positive_or_default("usd_to_inr_rate", self.usd_to_inr_rate, DEFAULT_USD_TO_INR_RATE);
        if self.billing_cycle_days == 0 {
            self.billing_cycle_days = DEFAULT_BILLING_CYCLE_DAYS;
        }
        if self.poll_max_attempts == 0 {
            self.poll_max_attempts = DEFAULT_POLL_MAX_ATTEMPTS;
        }
        self
    }
}

/// Returns `value` if it is finite and strictly positive, else `default`
pub fn positive_or_default(name: &str, value: f64, default: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        let err = BillingError::ConfigurationInvalid(format!("{} = {}", name, value));
        tracing::warn!(error = %err, fallback = default, "Using default billing value");
        default
    }
}

fn positive_f64_from_env(key: &str, default: f64) -> f64 {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<f64>() {
            Ok(value) => positive_or_default(key, value, default),
            Err(_) => {
                let err = BillingError::ConfigurationInvalid(format!("{} = {:?}", key, raw));
                tracing::warn!(error = %err, fallback = default, "Using default billing value");
                default
            }
        },
        Err(_) => default,
    }
}

fn positive_int_from_env<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + PartialOrd + Default + Copy + std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) if value > T::default() => value,
            _ => {
                let err = BillingError::ConfigurationInvalid(format!("{} = {:?}", key, raw));
                tracing::warn!(error = %err, fallback = %default, "Using default billing value");
                default
            }
        },
        Err(_) => default,
    }
}

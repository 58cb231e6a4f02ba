//! Billing cycle arithmetic
//!
//! An account bills on a fixed day of the month taken from its creation date.
//! In months without that day (31 in April, 29-31 in February) the billing
//! date is the last day of the month. The stored billing day itself never
//! changes, so a day-31 account bills on Feb 28 and again on Mar 31.
//!
//! Periods are half-open: `[start, end)`.

use pinvault_shared::BillingPeriod;
use time::{Date, Month, OffsetDateTime, UtcOffset};

use crate::error::{BillingError, BillingResult};

/// Day of month (UTC) on which an account created at `created_at` is billed
pub fn billing_day(created_at: OffsetDateTime) -> u8 {
    created_at.to_offset(UtcOffset::UTC).day()
}

/// The date an account with `billing_day` bills in the given month
pub fn billing_date_in(year: i32, month: Month, billing_day: u8) -> BillingResult<Date> {
    validate_day(billing_day)?;

    // Walk back from the requested day to the last day that exists in the month
    let mut day = billing_day;
    loop {
        match Date::from_calendar_date(year, month, day) {
            Ok(date) => return Ok(date),
            Err(_) if day > 28 => day -= 1,
            Err(e) => {
                return Err(BillingError::InvalidInput(format!(
                    "no billing date in {} {}: {}",
                    month, year, e
                )))
            }
        }
    }
}

/// First billing date strictly after `today`
pub fn next_billing_date(billing_day: u8, today: Date) -> BillingResult<Date> {
    let this_month = billing_date_in(today.year(), today.month(), billing_day)?;
    if today < this_month {
        Ok(this_month)
    } else {
        let (year, month) = next_month(today.year(), today.month());
        billing_date_in(year, month, billing_day)
    }
}

/// The billing period containing `today`
pub fn billing_period(billing_day: u8, today: Date) -> BillingResult<BillingPeriod> {
    let this_month = billing_date_in(today.year(), today.month(), billing_day)?;

    if today >= this_month {
        let (year, month) = next_month(today.year(), today.month());
        Ok(BillingPeriod {
            start: this_month,
            end: billing_date_in(year, month, billing_day)?,
        })
    } else {
        let (year, month) = previous_month(today.year(), today.month());
        Ok(BillingPeriod {
            start: billing_date_in(year, month, billing_day)?,
            end: this_month,
        })
    }
}

pub fn is_billing_day(billing_day: u8, today: Date) -> BillingResult<bool> {
    Ok(billing_date_in(today.year(), today.month(), billing_day)? == today)
}

fn validate_day(billing_day: u8) -> BillingResult<()> {
    if (1..=31).contains(&billing_day) {
        Ok(())
    } else {
        Err(BillingError::InvalidInput(format!(
            "billing day must be 1-31, got {}",
            billing_day
        )))
    }
}

fn next_month(year: i32, month: Month) -> (i32, Month) {
    match month {
        Month::December => (year + 1, Month::January),
        other => (year, other.next()),
    }
}

fn previous_month(year: i32, month: Month) -> (i32, Month) {
    match month {
        Month::January => (year - 1, Month::December),
        other => (year, other.previous()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    #[test]
    fn test_billing_day_from_creation() {
        assert_eq!(billing_day(datetime!(2025-01-31 23:00 UTC)), 31);
        // 23:30 on the 14th in UTC-5 is already the 15th in UTC
        assert_eq!(billing_day(datetime!(2025-03-14 23:30 -5)), 15);
    }

    #[test]
    fn test_billing_date_clamps_to_month_end() {
        assert_eq!(billing_date_in(2025, Month::February, 31).unwrap(), date!(2025-02-28));
        assert_eq!(billing_date_in(2024, Month::February, 31).unwrap(), date!(2024-02-29));
        assert_eq!(billing_date_in(2025, Month::April, 31).unwrap(), date!(2025-04-30));
        assert_eq!(billing_date_in(2025, Month::March, 31).unwrap(), date!(2025-03-31));
        assert_eq!(billing_date_in(2025, Month::February, 15).unwrap(), date!(2025-02-15));
    }

    #[test]
    fn test_invalid_billing_day_rejected() {
        assert!(billing_date_in(2025, Month::January, 0).is_err());
        assert!(billing_date_in(2025, Month::January, 32).is_err());
        assert!(billing_period(0, date!(2025-01-10)).is_err());
    }

    #[test]
    fn test_next_billing_date() {
        assert_eq!(next_billing_date(15, date!(2025-01-10)).unwrap(), date!(2025-01-15));
        assert_eq!(next_billing_date(15, date!(2025-01-15)).unwrap(), date!(2025-02-15));
        assert_eq!(next_billing_date(15, date!(2025-12-20)).unwrap(), date!(2026-01-15));
    }

    #[test]
    fn test_billing_period_on_and_after_billing_day() {
        let period = billing_period(10, date!(2025-03-10)).unwrap();
        assert_eq!(period.start, date!(2025-03-10));
        assert_eq!(period.end, date!(2025-04-10));

        let period = billing_period(10, date!(2025-03-25)).unwrap();
        assert_eq!(period.start, date!(2025-03-10));
        assert_eq!(period.end, date!(2025-04-10));
    }

    #[test]
    fn test_billing_period_before_billing_day_wraps_year() {
        let period = billing_period(20, date!(2025-01-05)).unwrap();
        assert_eq!(period.start, date!(2024-12-20));
        assert_eq!(period.end, date!(2025-01-20));
    }

    #[test]
    fn test_day_31_account_in_february_non_leap() {
        // Created on Jan 31, today is Feb 15 2025
        let day = billing_day(datetime!(2025-01-31 12:00 UTC));
        let today = date!(2025-02-15);

        let period = billing_period(day, today).unwrap();
        assert_eq!(period.start, date!(2025-01-31));
        assert_eq!(period.end, date!(2025-02-28));
        assert!(period.contains(today));

        assert_eq!(next_billing_date(day, today).unwrap(), date!(2025-02-28));
        assert!(!is_billing_day(day, today).unwrap());
        assert!(is_billing_day(day, date!(2025-02-28)).unwrap());

        // March returns to the 31st
        let march = billing_period(day, date!(2025-03-01)).unwrap();
        assert_eq!(march.start, date!(2025-02-28));
        assert_eq!(march.end, date!(2025-03-31));
        assert!(is_billing_day(day, date!(2025-03-31)).unwrap());
        assert!(!is_billing_day(day, date!(2025-03-30)).unwrap());
    }

    #[test]
    fn test_period_always_contains_today_and_spans_one_month() {
        let mut today = date!(2024-01-01);
        let last = date!(2025-12-31);
        while today <= last {
            for day in 1..=31u8 {
                let period = billing_period(day, today).unwrap();
                assert!(period.contains(today), "day {} today {}", day, today);

                let (year, month) = next_month(period.start.year(), period.start.month());
                assert_eq!((period.end.year(), period.end.month()), (year, month));
                assert_eq!(period.end, billing_date_in(year, month, day).unwrap());

                let next = next_billing_date(day, today).unwrap();
                assert_eq!(next, period.end);
            }
            today = match today.next_day() {
                Some(d) => d,
                None => break,
            };
        }
    }
}

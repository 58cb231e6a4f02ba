//! Scheduled billing jobs
//!
//! Each job is a plain async function over the record store and the billing
//! service so it can be driven directly in tests. Per-account and per-order
//! failures are logged and counted; one bad record never stops a run.

use pinvault_billing::{cycle, ActorType, BillingCheckOutcome, BillingResult, BillingService, CustomerDetails};
use pinvault_shared::{Account, OrderTransition, RecordStore};
use time::Date;
use tracing::{error, info};

/// Totals from one billing sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub accounts: usize,
    /// Not billed today (other billing day, or created today)
    pub skipped: usize,
    pub no_charge: usize,
    pub orders_created: usize,
    pub orders_pending: usize,
    pub already_paid: usize,
    pub errors: usize,
}

/// Totals from one pending-order reconciliation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub settled: usize,
    pub still_pending: usize,
    pub errors: usize,
}

/// Run the billing check for every account whose billing day is `today`
pub async fn run_billing_sweep(
    store: &dyn RecordStore,
    billing: &BillingService,
    today: Date,
) -> BillingResult<SweepReport> {
    let accounts = store.list_accounts().await?;
    let mut report = SweepReport {
        accounts: accounts.len(),
        ..SweepReport::default()
    };

    for account in accounts {
        match bills_today(store, &account, today).await {
            Ok(true) => {}
            Ok(false) => {
                report.skipped += 1;
                continue;
            }
            Err(e) => {
                error!(account_id = %account.id, error = %e, "Failed to resolve billing day");
                report.errors += 1;
                continue;
            }
        }

        let customer = CustomerDetails::from_account(&account, &billing.config.default_customer_phone);
        match billing.run_billing_check(&account, &customer, today).await {
            Ok(BillingCheckOutcome::NoCharge { .. }) => report.no_charge += 1,
            Ok(BillingCheckOutcome::AlreadyPaid(_)) => report.already_paid += 1,
            Ok(BillingCheckOutcome::Pending { created: true, .. }) => report.orders_created += 1,
            Ok(BillingCheckOutcome::Pending { created: false, .. }) => report.orders_pending += 1,
            Err(e) => {
                error!(account_id = %account.id, error = %e, "Billing check failed");
                report.errors += 1;
            }
        }
    }

    info!(
        accounts = report.accounts,
        skipped = report.skipped,
        no_charge = report.no_charge,
        orders_created = report.orders_created,
        orders_pending = report.orders_pending,
        already_paid = report.already_paid,
        errors = report.errors,
        "Billing sweep complete"
    );
    Ok(report)
}

async fn bills_today(store: &dyn RecordStore, account: &Account, today: Date) -> BillingResult<bool> {
    // The first bill is one full cycle after sign-up
    if account.created_at.date() >= today {
        return Ok(false);
    }
    let billing_day = match store.get_subscription(account.id).await? {
        Some(subscription) => subscription.billing_day,
        None => cycle::billing_day(account.created_at),
    };
    cycle::is_billing_day(billing_day, today)
}

/// Ask the provider for the status of every PENDING order
pub async fn reconcile_pending(billing: &BillingService) -> BillingResult<ReconcileReport> {
    let pending = billing.orders.pending_orders().await?;
    let mut report = ReconcileReport {
        checked: pending.len(),
        ..ReconcileReport::default()
    };

    for order in pending {
        match billing.orders.refresh_from_provider(&order, ActorType::System).await {
            Ok(OrderTransition::Applied(order)) => {
                info!(order_id = %order.id, status = %order.status, "Pending order settled by reconciliation");
                report.settled += 1;
            }
            Ok(OrderTransition::Unchanged(_)) => report.still_pending += 1,
            Err(e) => {
                error!(order_id = %order.id, error = %e, "Failed to reconcile order");
                report.errors += 1;
            }
        }
    }

    if report.checked > 0 {
        info!(
            checked = report.checked,
            settled = report.settled,
            still_pending = report.still_pending,
            errors = report.errors,
            "Pending order reconciliation complete"
        );
    }
    Ok(report)
}
